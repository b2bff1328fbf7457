//! Built-in functions and value helpers

use std::cmp::Ordering;

use base64::Engine;
use serde_json::{Map, Value};

use crate::expr::{jsonpath, sprig, ExprError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

pub fn as_number(value: &Value) -> Option<Num> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(Num::Int(i)),
            None => n.as_f64().map(Num::Float),
        },
        _ => None,
    }
}

/// Float result; non-finite values become nil
pub fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

/// Equality with numeric promotion
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => match (as_number(a)?, as_number(b)?) {
            (Num::Int(x), Num::Int(y)) => Some(x.cmp(&y)),
            (x, y) => x.as_f64().partial_cmp(&y.as_f64()),
        },
    }
}

/// Render a value for insertion into text; whole floats print without a fraction
pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => json_fix(other).to_string(),
    }
}

/// Normalise whole floats to integers throughout a value
pub fn json_fix(value: &Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => Value::from(f as i64),
            _ => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(json_fix).collect()),
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), json_fix(v))).collect()),
        other => other.clone(),
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), ExprError> {
    if args.len() < min || args.len() > max {
        return Err(ExprError::Eval(format!(
            "invalid number of arguments for {} (expected {}, got {})",
            name,
            if min == max { min.to_string() } else { format!("{}-{}", min, max) },
            args.len()
        )));
    }
    Ok(())
}

pub(crate) fn string_arg(name: &str, value: &Value) -> Result<String, ExprError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(ExprError::Eval(format!(
            "{}() expects a string, got {}",
            name,
            type_name(other)
        ))),
    }
}

pub(crate) fn int_arg(name: &str, value: &Value) -> Result<i64, ExprError> {
    match as_number(value) {
        Some(Num::Int(i)) => Ok(i),
        Some(Num::Float(f)) => Ok(f as i64),
        None => match value {
            Value::String(s) => s
                .trim()
                .parse()
                .map_err(|_| ExprError::Eval(format!("{}() cannot convert {:?} to int", name, s))),
            other => Err(ExprError::Eval(format!(
                "{}() expects an int, got {}",
                name,
                type_name(other)
            ))),
        },
    }
}

fn to_int(name: &str, value: &Value) -> Result<Value, ExprError> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Ok(Value::from(i));
            }
            s.parse::<f64>()
                .map(|f| Value::from(f as i64))
                .map_err(|_| ExprError::Eval(format!("{}() cannot convert {:?} to int", name, s)))
        }
        Value::Bool(b) => Ok(Value::from(*b as i64)),
        other => match as_number(other) {
            Some(Num::Int(i)) => Ok(Value::from(i)),
            Some(Num::Float(f)) => Ok(Value::from(f as i64)),
            None => Err(ExprError::Eval(format!(
                "{}() cannot convert {} to int",
                name,
                type_name(other)
            ))),
        },
    }
}

fn to_float(name: &str, value: &Value) -> Result<Value, ExprError> {
    match value {
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(float_value)
            .map_err(|_| ExprError::Eval(format!("{}() cannot convert {:?} to float", name, s))),
        other => as_number(other)
            .map(|n| float_value(n.as_f64()))
            .ok_or_else(|| {
                ExprError::Eval(format!("{}() cannot convert {} to float", name, type_name(other)))
            }),
    }
}

/// Call a named function with evaluated arguments
pub fn call(name: &str, args: Vec<Value>) -> Result<Value, ExprError> {
    if let Some(sprig_name) = name.strip_prefix("sprig.") {
        return sprig::call(sprig_name, args);
    }

    match name {
        // Workflow helpers
        "asInt" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|e| ExprError::Eval(format!("asInt({:?}): {}", s, e))),
                other => to_int(name, other),
            }
        }
        "asFloat" => {
            arity(name, &args, 1, 1)?;
            to_float(name, &args[0])
        }
        "jsonpath" => {
            arity(name, &args, 2, 2)?;
            let document = string_arg(name, &args[0])?;
            let path = string_arg(name, &args[1])?;
            let value: Value = serde_json::from_str(&document)
                .map_err(|e| ExprError::Eval(format!("jsonpath(): invalid JSON: {}", e)))?;
            jsonpath::query_one(&value, &path)
        }
        "toJson" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::String(json_fix(&args[0]).to_string()))
        }

        // Conversion
        "int" => {
            arity(name, &args, 1, 1)?;
            to_int(name, &args[0])
        }
        "float" => {
            arity(name, &args, 1, 1)?;
            to_float(name, &args[0])
        }
        "string" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::String(to_text(&args[0])))
        }
        "type" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::String(type_name(&args[0]).to_string()))
        }
        "toJSON" => {
            arity(name, &args, 1, 1)?;
            serde_json::to_string_pretty(&json_fix(&args[0]))
                .map(Value::String)
                .map_err(|e| ExprError::Eval(e.to_string()))
        }
        "fromJSON" => {
            arity(name, &args, 1, 1)?;
            let text = string_arg(name, &args[0])?;
            serde_json::from_str(&text).map_err(|e| ExprError::Eval(format!("fromJSON(): {}", e)))
        }
        "toBase64" => {
            arity(name, &args, 1, 1)?;
            let text = string_arg(name, &args[0])?;
            Ok(Value::String(
                base64::engine::general_purpose::STANDARD.encode(text.as_bytes()),
            ))
        }
        "fromBase64" => {
            arity(name, &args, 1, 1)?;
            let text = string_arg(name, &args[0])?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(text.trim())
                .map_err(|e| ExprError::Eval(format!("fromBase64(): {}", e)))?;
            String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|e| ExprError::Eval(format!("fromBase64(): {}", e)))
        }

        // Strings
        "upper" | "lower" => {
            arity(name, &args, 1, 1)?;
            let text = string_arg(name, &args[0])?;
            Ok(Value::String(if name == "upper" {
                text.to_uppercase()
            } else {
                text.to_lowercase()
            }))
        }
        "trim" | "trimPrefix" | "trimSuffix" => {
            arity(name, &args, 1, 2)?;
            let text = string_arg(name, &args[0])?;
            let cut = match args.get(1) {
                Some(v) => Some(string_arg(name, v)?),
                None => None,
            };
            Ok(Value::String(match (name, cut) {
                ("trim", None) => text.trim().to_string(),
                ("trim", Some(chars)) => text.trim_matches(|c| chars.contains(c)).to_string(),
                ("trimPrefix", Some(prefix)) => text.strip_prefix(prefix.as_str()).unwrap_or(&text).to_string(),
                ("trimPrefix", None) => text.trim_start().to_string(),
                (_, Some(suffix)) => text.strip_suffix(suffix.as_str()).unwrap_or(&text).to_string(),
                (_, None) => text.trim_end().to_string(),
            }))
        }
        "split" => {
            arity(name, &args, 2, 3)?;
            let text = string_arg(name, &args[0])?;
            let sep = string_arg(name, &args[1])?;
            let parts: Vec<Value> = match args.get(2) {
                Some(n) => text
                    .splitn(int_arg(name, n)?.max(0) as usize, sep.as_str())
                    .map(|s| Value::String(s.to_string()))
                    .collect(),
                None => text.split(sep.as_str()).map(|s| Value::String(s.to_string())).collect(),
            };
            Ok(Value::Array(parts))
        }
        "join" => {
            arity(name, &args, 1, 2)?;
            let sep = match args.get(1) {
                Some(v) => string_arg(name, v)?,
                None => String::new(),
            };
            match &args[0] {
                Value::Array(items) => Ok(Value::String(
                    items.iter().map(to_text).collect::<Vec<_>>().join(&sep),
                )),
                other => Err(ExprError::Eval(format!("join() expects an array, got {}", type_name(other)))),
            }
        }
        "replace" => {
            arity(name, &args, 3, 3)?;
            let text = string_arg(name, &args[0])?;
            let old = string_arg(name, &args[1])?;
            let new = string_arg(name, &args[2])?;
            Ok(Value::String(text.replace(old.as_str(), &new)))
        }
        "repeat" => {
            arity(name, &args, 2, 2)?;
            let text = string_arg(name, &args[0])?;
            let n = int_arg(name, &args[1])?;
            if n < 0 {
                return Err(ExprError::Eval("repeat() count must be non-negative".to_string()));
            }
            Ok(Value::String(text.repeat(n as usize)))
        }
        "indexOf" | "lastIndexOf" => {
            arity(name, &args, 2, 2)?;
            let text = string_arg(name, &args[0])?;
            let needle = string_arg(name, &args[1])?;
            let found = if name == "indexOf" {
                text.find(needle.as_str())
            } else {
                text.rfind(needle.as_str())
            };
            Ok(Value::from(
                found
                    .map(|byte| text[..byte].chars().count() as i64)
                    .unwrap_or(-1),
            ))
        }
        "hasPrefix" | "hasSuffix" => {
            arity(name, &args, 2, 2)?;
            let text = string_arg(name, &args[0])?;
            let part = string_arg(name, &args[1])?;
            Ok(Value::Bool(if name == "hasPrefix" {
                text.starts_with(part.as_str())
            } else {
                text.ends_with(part.as_str())
            }))
        }

        // Numbers
        "abs" => {
            arity(name, &args, 1, 1)?;
            match as_number(&args[0]) {
                Some(Num::Int(i)) => Ok(Value::from(i.abs())),
                Some(Num::Float(f)) => Ok(float_value(f.abs())),
                None => Err(ExprError::Eval(format!("abs() expects a number, got {}", type_name(&args[0])))),
            }
        }
        "ceil" | "floor" | "round" => {
            arity(name, &args, 1, 1)?;
            let f = as_number(&args[0])
                .ok_or_else(|| ExprError::Eval(format!("{}() expects a number", name)))?
                .as_f64();
            Ok(float_value(match name {
                "ceil" => f.ceil(),
                "floor" => f.floor(),
                _ => f.round(),
            }))
        }
        "max" | "min" => {
            let items = match args.as_slice() {
                [Value::Array(items)] => items.clone(),
                _ => args,
            };
            if items.is_empty() {
                return Err(ExprError::Eval(format!("{}() needs at least one argument", name)));
            }
            let mut best = items[0].clone();
            for item in &items[1..] {
                let ordering = compare(item, &best)
                    .ok_or_else(|| ExprError::Eval(format!("{}() arguments are not comparable", name)))?;
                if (name == "max" && ordering.is_gt()) || (name == "min" && ordering.is_lt()) {
                    best = item.clone();
                }
            }
            Ok(best)
        }
        "sum" | "mean" => {
            arity(name, &args, 1, 1)?;
            let items = match &args[0] {
                Value::Array(items) => items,
                other => return Err(ExprError::Eval(format!("{}() expects an array, got {}", name, type_name(other)))),
            };
            let mut int_total: i64 = 0;
            let mut float_total = 0.0;
            let mut is_float = name == "mean";
            for item in items {
                match as_number(item) {
                    Some(Num::Int(i)) => {
                        int_total += i;
                        float_total += i as f64;
                    }
                    Some(Num::Float(f)) => {
                        is_float = true;
                        float_total += f;
                    }
                    None => return Err(ExprError::Eval(format!("{}() expects numbers", name))),
                }
            }
            if name == "mean" {
                if items.is_empty() {
                    return Ok(Value::from(0));
                }
                return Ok(float_value(float_total / items.len() as f64));
            }
            Ok(if is_float { float_value(float_total) } else { Value::from(int_total) })
        }

        // Collections
        "len" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::from(match &args[0] {
                Value::String(s) => s.chars().count() as i64,
                Value::Array(items) => items.len() as i64,
                Value::Object(map) => map.len() as i64,
                other => return Err(ExprError::Eval(format!("invalid argument for len (type {})", type_name(other)))),
            }))
        }
        "first" | "last" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Array(items) => Ok(if name == "first" { items.first() } else { items.last() }
                    .cloned()
                    .unwrap_or(Value::Null)),
                other => Err(ExprError::Eval(format!("{}() expects an array, got {}", name, type_name(other)))),
            }
        }
        "reverse" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Array(items) => Ok(Value::Array(items.iter().rev().cloned().collect())),
                other => Err(ExprError::Eval(format!("reverse() expects an array, got {}", type_name(other)))),
            }
        }
        "keys" | "values" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Object(map) => Ok(Value::Array(if name == "keys" {
                    map.keys().map(|k| Value::String(k.clone())).collect()
                } else {
                    map.values().cloned().collect()
                })),
                other => Err(ExprError::Eval(format!("{}() expects a map, got {}", name, type_name(other)))),
            }
        }
        "get" => {
            arity(name, &args, 2, 2)?;
            Ok(match (&args[0], &args[1]) {
                (Value::Object(map), Value::String(k)) => map.get(k).cloned().unwrap_or(Value::Null),
                (Value::Array(items), key) => match as_number(key) {
                    Some(Num::Int(i)) if i >= 0 => items.get(i as usize).cloned().unwrap_or(Value::Null),
                    Some(Num::Int(i)) => {
                        let idx = items.len() as i64 + i;
                        if idx >= 0 { items[idx as usize].clone() } else { Value::Null }
                    }
                    _ => Value::Null,
                },
                _ => Value::Null,
            })
        }
        "concat" => {
            let mut out = Vec::new();
            for arg in args {
                match arg {
                    Value::Array(items) => out.extend(items),
                    other => return Err(ExprError::Eval(format!("concat() expects arrays, got {}", type_name(&other)))),
                }
            }
            Ok(Value::Array(out))
        }
        "uniq" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Array(items) => {
                    let mut out: Vec<Value> = Vec::new();
                    for item in items {
                        if !out.iter().any(|o| values_equal(o, item)) {
                            out.push(item.clone());
                        }
                    }
                    Ok(Value::Array(out))
                }
                other => Err(ExprError::Eval(format!("uniq() expects an array, got {}", type_name(other)))),
            }
        }
        "sort" => {
            arity(name, &args, 1, 2)?;
            let descending = matches!(args.get(1), Some(Value::String(s)) if s == "desc");
            match &args[0] {
                Value::Array(items) => {
                    let mut items = items.clone();
                    items.sort_by(|a, b| compare(a, b).unwrap_or(Ordering::Equal));
                    if descending {
                        items.reverse();
                    }
                    Ok(Value::Array(items))
                }
                other => Err(ExprError::Eval(format!("sort() expects an array, got {}", type_name(other)))),
            }
        }
        "now" => {
            arity(name, &args, 0, 0)?;
            Ok(Value::String(chrono::Utc::now().to_rfc3339()))
        }
        _ => Err(ExprError::UnknownName(name.to_string())),
    }
}

/// Object from key/value pairs, used by sprig.dict and merges
pub(crate) fn object(pairs: Vec<(String, Value)>) -> Value {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert(k, v);
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_as_int_and_float() {
        assert_eq!(call("asInt", vec![json!("42")]).unwrap(), json!(42));
        assert!(call("asInt", vec![json!("4.2")]).is_err());
        assert_eq!(call("asFloat", vec![json!("3.14")]).unwrap(), json!(3.14));
    }

    #[test]
    fn test_to_json_fixes_whole_floats() {
        assert_eq!(
            call("toJson", vec![json!({"a": 1.0, "b": [2.5]})]).unwrap(),
            json!(r#"{"a":1,"b":[2.5]}"#)
        );
        assert_eq!(to_text(&json!(4.0)), "4");
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(call("trim", vec![json!("__hello__"), json!("_")]).unwrap(), json!("hello"));
        assert_eq!(
            call("split", vec![json!("foo bar baz"), json!(" ")]).unwrap(),
            json!(["foo", "bar", "baz"])
        );
        assert_eq!(call("indexOf", vec![json!("hello world"), json!("xyz")]).unwrap(), json!(-1));
        assert_eq!(call("toBase64", vec![json!("Hello World")]).unwrap(), json!("SGVsbG8gV29ybGQ="));
    }

    #[test]
    fn test_unknown_function() {
        assert!(matches!(call("nope", vec![]), Err(ExprError::UnknownName(_))));
    }
}
