//! JSONPath subset: `$`, `.key`, `['key']`, `[n]`, `[*]`, `.*`, `..key`
//!
//! Kubernetes-style paths (`{.status.phase}`) are accepted as well.

use serde_json::Value;

use crate::expr::ExprError;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(i64),
    Wildcard,
    Descendant(String),
}

fn parse_path(path: &str) -> Result<Vec<Segment>, ExprError> {
    let mut path = path.trim();
    if path.starts_with('{') && path.ends_with('}') {
        path = path[1..path.len() - 1].trim();
    }
    let path = path.strip_prefix('$').unwrap_or(path);
    let chars: Vec<char> = path.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;

    let read_name = |start: usize| -> (String, usize) {
        let mut end = start;
        while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
            end += 1;
        }
        (chars[start..end].iter().collect(), end)
    };

    while i < chars.len() {
        match chars[i] {
            '.' if i + 1 < chars.len() && chars[i + 1] == '.' => {
                let (name, next) = read_name(i + 2);
                if name.is_empty() {
                    return Err(ExprError::Eval(format!("invalid JSONPath {:?}", path)));
                }
                segments.push(Segment::Descendant(name));
                i = next;
            }
            '.' => {
                let (name, next) = read_name(i + 1);
                match name.as_str() {
                    "" => {}
                    "*" => segments.push(Segment::Wildcard),
                    _ => segments.push(Segment::Key(name)),
                }
                i = next;
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|p| p + i)
                    .ok_or_else(|| ExprError::Eval(format!("unclosed '[' in JSONPath {:?}", path)))?;
                let inner: String = chars[i + 1..close].iter().collect();
                let inner = inner.trim();
                if inner == "*" {
                    segments.push(Segment::Wildcard);
                } else if (inner.starts_with('\'') && inner.ends_with('\''))
                    || (inner.starts_with('"') && inner.ends_with('"'))
                {
                    segments.push(Segment::Key(inner[1..inner.len() - 1].to_string()));
                } else {
                    let index = inner
                        .parse::<i64>()
                        .map_err(|_| ExprError::Eval(format!("unsupported JSONPath selector [{}]", inner)))?;
                    segments.push(Segment::Index(index));
                }
                i = close + 1;
            }
            _ => {
                let (name, next) = read_name(i);
                segments.push(Segment::Key(name));
                i = next;
            }
        }
    }
    Ok(segments)
}

/// Every value selected by `path`
pub fn query(value: &Value, path: &str) -> Result<Vec<Value>, ExprError> {
    let segments = parse_path(path)?;
    let mut current = vec![value.clone()];
    for segment in &segments {
        let mut next = Vec::new();
        for item in &current {
            match segment {
                Segment::Key(key) => {
                    if let Some(v) = item.get(key) {
                        next.push(v.clone());
                    }
                }
                Segment::Index(index) => {
                    if let Value::Array(items) = item {
                        let len = items.len() as i64;
                        let idx = if *index < 0 { len + index } else { *index };
                        if idx >= 0 && idx < len {
                            next.push(items[idx as usize].clone());
                        }
                    }
                }
                Segment::Wildcard => match item {
                    Value::Array(items) => next.extend(items.iter().cloned()),
                    Value::Object(map) => next.extend(map.values().cloned()),
                    _ => {}
                },
                Segment::Descendant(key) => collect_descendants(item, key, &mut next),
            }
        }
        current = next;
    }
    Ok(current)
}

fn collect_descendants(value: &Value, key: &str, out: &mut Vec<Value>) {
    match value {
        Value::Object(map) => {
            if let Some(v) = map.get(key) {
                out.push(v.clone());
            }
            for child in map.values() {
                collect_descendants(child, key, out);
            }
        }
        Value::Array(items) => items.iter().for_each(|i| collect_descendants(i, key, out)),
        _ => {}
    }
}

/// The single value selected by `path`; several matches become an array
pub fn query_one(value: &Value, path: &str) -> Result<Value, ExprError> {
    let mut matches = query(value, path)?;
    match matches.len() {
        0 => Err(ExprError::Eval(format!("JSONPath {:?} matched nothing", path))),
        1 => Ok(matches.remove(0)),
        _ => Ok(Value::Array(matches)),
    }
}

/// Render a selection the way output parameters expect: strings raw, others as JSON
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
