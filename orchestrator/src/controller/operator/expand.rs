//! Fan-out of steps and DAG tasks over `withItems`, `withParam` and `withSequence`

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use workflow_api::template::ContinueOn;
use workflow_api::{Arguments, DagTask, Sequence, Template, WorkflowStep};

use crate::errors::WfError;
use crate::template;

/// A step or task that may fan out into several copies
pub trait Expandable: Serialize + DeserializeOwned + Clone {
    fn name(&self) -> &str;

    fn set_name(&mut self, name: String);

    fn with_items(&self) -> &[Value];

    fn with_param(&self) -> &str;

    fn with_sequence(&self) -> Option<&Sequence>;

    fn clear_expansion(&mut self);

    fn arguments(&self) -> &Arguments;

    fn arguments_mut(&mut self) -> &mut Arguments;

    fn when(&self) -> &str;

    fn continue_on(&self) -> Option<&ContinueOn>;

    /// Referenced template name and inline template, if any
    fn template_ref(&self) -> (&str, Option<&Template>);

    fn is_expanded(&self) -> bool {
        !self.with_items().is_empty() || !self.with_param().is_empty() || self.with_sequence().is_some()
    }
}

impl Expandable for WorkflowStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn with_items(&self) -> &[Value] {
        &self.with_items
    }

    fn with_param(&self) -> &str {
        &self.with_param
    }

    fn with_sequence(&self) -> Option<&Sequence> {
        self.with_sequence.as_ref()
    }

    fn clear_expansion(&mut self) {
        self.with_items.clear();
        self.with_param.clear();
        self.with_sequence = None;
    }

    fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    fn arguments_mut(&mut self) -> &mut Arguments {
        &mut self.arguments
    }

    fn when(&self) -> &str {
        &self.when
    }

    fn continue_on(&self) -> Option<&ContinueOn> {
        self.continue_on.as_ref()
    }

    fn template_ref(&self) -> (&str, Option<&Template>) {
        (&self.template, self.inline.as_deref())
    }
}

impl Expandable for DagTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn with_items(&self) -> &[Value] {
        &self.with_items
    }

    fn with_param(&self) -> &str {
        &self.with_param
    }

    fn with_sequence(&self) -> Option<&Sequence> {
        self.with_sequence.as_ref()
    }

    fn clear_expansion(&mut self) {
        self.with_items.clear();
        self.with_param.clear();
        self.with_sequence = None;
    }

    fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    fn arguments_mut(&mut self) -> &mut Arguments {
        &mut self.arguments
    }

    fn when(&self) -> &str {
        &self.when
    }

    fn continue_on(&self) -> Option<&ContinueOn> {
        self.continue_on.as_ref()
    }

    fn template_ref(&self) -> (&str, Option<&Template>) {
        (&self.template, self.inline.as_deref())
    }
}

/// Expand `item` into one copy per element, named `name(i:label)`
///
/// An unexpanded item comes back unchanged as the only element.
pub fn expand<T: Expandable>(item: &T) -> Result<Vec<T>, WfError> {
    if !item.is_expanded() {
        return Ok(vec![item.clone()]);
    }
    let values = if !item.with_items().is_empty() {
        item.with_items().to_vec()
    } else if !item.with_param().is_empty() {
        serde_json::from_str::<Vec<Value>>(item.with_param()).map_err(|e| {
            WfError::BadRequest(format!(
                "withParam value could not be parsed as a JSON list: {}: {}",
                item.with_param().trim(),
                e
            ))
        })?
    } else if let Some(sequence) = item.with_sequence() {
        expand_sequence(sequence)?
    } else {
        Vec::new()
    };

    let mut template = item.clone();
    template.clear_expansion();
    values
        .iter()
        .enumerate()
        .map(|(index, value)| expand_one(&template, index, value))
        .collect()
}

fn expand_one<T: Expandable>(template: &T, index: usize, value: &Value) -> Result<T, WfError> {
    let mut vars = BTreeMap::new();
    let label = match value {
        Value::Object(map) => {
            let mut parts = Vec::new();
            for (key, v) in map {
                vars.insert(format!("item.{}", key), value_string(v));
                parts.push(format!("{}:{}", key, value_string(v)));
            }
            parts.sort();
            vars.insert("item".to_string(), value.to_string());
            parts.join(",")
        }
        other => {
            vars.insert("item".to_string(), value_string(other));
            value_string(other)
        }
    };
    let mut expanded = template::replace_struct(template, &vars, true)?;
    expanded.set_name(format!("{}({}:{})", template.name(), index, label));
    Ok(expanded)
}

/// Strings print raw; everything else prints as JSON
pub fn value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_bound(field: &str, value: &str) -> Result<i64, WfError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| WfError::BadRequest(format!("unable to parse withSequence {} '{}'", field, value)))
}

/// Items of a `withSequence`; `count` wins over `end`, descending when `end < start`
pub fn expand_sequence(sequence: &Sequence) -> Result<Vec<Value>, WfError> {
    let start = match &sequence.start {
        Some(start) => parse_bound("start", start)?,
        None => 0,
    };
    let end = match (&sequence.count, &sequence.end) {
        (Some(count), _) => {
            let count = parse_bound("count", count)?;
            if count <= 0 {
                return Ok(Vec::new());
            }
            start + count - 1
        }
        (None, Some(end)) => parse_bound("end", end)?,
        (None, None) => {
            return Err(WfError::BadRequest(
                "neither count nor end specified in withSequence".to_string(),
            ))
        }
    };
    let format = if sequence.format.is_empty() {
        "%d"
    } else {
        sequence.format.as_str()
    };
    let numbers: Vec<i64> = if start <= end {
        (start..=end).collect()
    } else {
        (end..=start).rev().collect()
    };
    numbers
        .into_iter()
        .map(|n| printf_int(format, n).map(Value::String))
        .collect()
}

/// Render one integer through a printf-style format (`%d`, `%03d`, `%x`, `%o`, `%s`)
fn printf_int(format: &str, n: i64) -> Result<String, WfError> {
    let mut out = String::new();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let zero_pad = chars.peek() == Some(&'0');
        if zero_pad {
            chars.next();
        }
        let mut width = String::new();
        while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            width.push(*d);
            chars.next();
        }
        let width: usize = width.parse().unwrap_or(0);
        let body = match chars.next() {
            Some('d') | Some('s') | Some('v') => n.to_string(),
            Some('x') => format!("{:x}", n),
            Some('X') => format!("{:X}", n),
            Some('o') => format!("{:o}", n),
            other => {
                return Err(WfError::BadRequest(format!(
                    "unsupported verb '%{}' in withSequence format '{}'",
                    other.map(String::from).unwrap_or_default(),
                    format
                )))
            }
        };
        let pad = width.saturating_sub(body.len());
        if zero_pad {
            let (sign, digits) = match body.strip_prefix('-') {
                Some(rest) => ("-", rest),
                None => ("", body.as_str()),
            };
            out.push_str(sign);
            out.push_str(&"0".repeat(pad));
            out.push_str(digits);
        } else {
            out.push_str(&" ".repeat(pad));
            out.push_str(&body);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(value: Value) -> WorkflowStep {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_with_items_names_and_vars() {
        let s = step(json!({
            "name": "print",
            "template": "echo",
            "arguments": {"parameters": [{"name": "msg", "value": "{{item}}"}]},
            "withItems": ["hello", 3, {"os": "debian", "ver": 9}]
        }));
        let expanded = expand(&s).unwrap();
        let names: Vec<&str> = expanded.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["print(0:hello)", "print(1:3)", "print(2:os:debian,ver:9)"]);
        assert_eq!(expanded[0].arguments.parameters[0].value.as_deref(), Some("hello"));
        assert_eq!(expanded[1].arguments.parameters[0].value.as_deref(), Some("3"));
        assert!(expanded.iter().all(|s| !s.is_expanded()));
    }

    #[test]
    fn test_item_fields() {
        let s = step(json!({
            "name": "p",
            "template": "t",
            "when": "{{item.ver}} > 8",
            "withItems": [{"os": "debian", "ver": 9}]
        }));
        let expanded = expand(&s).unwrap();
        assert_eq!(expanded[0].when, "9 > 8");
    }

    #[test]
    fn test_with_param() {
        let s = step(json!({"name": "p", "template": "t", "withParam": "[\"a\",\"b\"]"}));
        assert_eq!(expand(&s).unwrap().len(), 2);

        let bad = step(json!({"name": "p", "template": "t", "withParam": "not json"}));
        let err = expand(&bad).unwrap_err();
        assert!(err.message().starts_with("withParam value could not be parsed as a JSON list"));

        let empty = step(json!({"name": "p", "template": "t", "withParam": "[]"}));
        assert!(expand(&empty).unwrap().is_empty());
    }

    #[test]
    fn test_sequence() {
        let count = Sequence {
            count: Some("3".to_string()),
            start: Some("1".to_string()),
            ..Default::default()
        };
        assert_eq!(expand_sequence(&count).unwrap(), vec![json!("1"), json!("2"), json!("3")]);

        let down = Sequence {
            start: Some("3".to_string()),
            end: Some("1".to_string()),
            format: "host-%02d".to_string(),
            ..Default::default()
        };
        assert_eq!(
            expand_sequence(&down).unwrap(),
            vec![json!("host-03"), json!("host-02"), json!("host-01")]
        );

        assert!(expand_sequence(&Sequence::default()).is_err());
        let zero = Sequence {
            count: Some("0".to_string()),
            ..Default::default()
        };
        assert!(expand_sequence(&zero).unwrap().is_empty());
    }

    #[test]
    fn test_printf() {
        assert_eq!(printf_int("%x", 255).unwrap(), "ff");
        assert_eq!(printf_int("%4d|", 7).unwrap(), "   7|");
        assert_eq!(printf_int("%03d", -7).unwrap(), "-07");
        assert!(printf_int("%q", 1).is_err());
    }
}
