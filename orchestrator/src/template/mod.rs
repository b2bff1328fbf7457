//! `{{tag}}` and `{{=expression}}` substitution
//!
//! Simple tags are looked up in a flat map of dotted names. Expression tags
//! are evaluated with the same map exposed as nested variables. Whole
//! documents are substituted in their JSON form, so every inserted value is
//! escaped for a JSON string literal.

mod replace;
pub mod validate;
pub mod when;

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::app::env::env_bool;
use crate::errors::WfError;
use crate::template::replace::{Mode, Substituter};

pub use validate::validate;
pub use when::should_execute;

/// Whether `{{=...}}` tags are evaluated; `EXPRESSION_TEMPLATES=false` turns them off
pub fn expressions_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| env_bool(workflow_api::common::ENV_VAR_EXPRESSION_TEMPLATES, true))
}

/// Substitute tags in a JSON document; the input and the output must both be valid JSON
pub fn replace(
    json: &str,
    replace_map: &BTreeMap<String, String>,
    allow_unresolved: bool,
) -> Result<String, WfError> {
    serde_json::from_str::<Value>(json)
        .map_err(|e| WfError::BadRequest(format!("cannot substitute into invalid JSON: {}", e)))?;
    let mode = Mode {
        allow_unresolved,
        json_escape: true,
        expressions: expressions_enabled(),
    };
    let replaced = Substituter::new(replace_map, mode).run(json)?;
    serde_json::from_str::<Value>(&replaced)
        .map_err(|e| WfError::BadRequest(format!("substitution produced invalid JSON: {}", e)))?;
    Ok(replaced)
}

/// Substitute tags in plain text; values are inserted unescaped
pub fn replace_str(
    text: &str,
    replace_map: &BTreeMap<String, String>,
    allow_unresolved: bool,
) -> Result<String, WfError> {
    let mode = Mode {
        allow_unresolved,
        json_escape: false,
        expressions: expressions_enabled(),
    };
    Substituter::new(replace_map, mode).run(text)
}

/// Substitute tags in every string of a JSON value, recursively
pub fn replace_value(
    value: &Value,
    replace_map: &BTreeMap<String, String>,
    allow_unresolved: bool,
) -> Result<Value, WfError> {
    Ok(match value {
        Value::String(s) => Value::String(replace_str(s, replace_map, allow_unresolved)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| replace_value(item, replace_map, allow_unresolved))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut replaced = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                replaced.insert(k.clone(), replace_value(v, replace_map, allow_unresolved)?);
            }
            Value::Object(replaced)
        }
        other => other.clone(),
    })
}

/// Substitute tags throughout a serializable structure
pub fn replace_struct<T>(
    value: &T,
    replace_map: &BTreeMap<String, String>,
    allow_unresolved: bool,
) -> Result<T, WfError>
where
    T: Serialize + DeserializeOwned,
{
    let json = serde_json::to_string(value)?;
    let replaced = replace(&json, replace_map, allow_unresolved)?;
    Ok(serde_json::from_str(&replaced)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json(s: &str) -> String {
        serde_json::to_string(s).unwrap()
    }

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_invalid_template() {
        assert!(replace(&json("{{"), &BTreeMap::new(), false).is_err());
    }

    #[test]
    fn test_simple_tags() {
        let r = replace(&json("{{foo}}"), &vars(&[("foo", "bar")]), false).unwrap();
        assert_eq!(r, json("bar"));

        assert_eq!(replace(&json("{{foo}}"), &BTreeMap::new(), true).unwrap(), json("{{foo}}"));

        let err = replace(&json("{{foo}}"), &BTreeMap::new(), false).unwrap_err();
        assert!(err.to_string().contains("failed to resolve {{foo}}"));
    }

    #[test]
    fn test_whitespace_in_tag() {
        let map = vars(&[("inputs.parameters.message", "hello world")]);
        let r = replace(&json("{{ inputs.parameters.message }}"), &map, true).unwrap();
        assert_eq!(r, json("hello world"));
    }

    #[test]
    fn test_value_is_json_escaped() {
        let map = vars(&[("msg", "say \"hi\"\n")]);
        let r = replace(&json("{{msg}}"), &map, false).unwrap();
        assert_eq!(r, json("say \"hi\"\n"));
        assert_eq!(replace_str("{{msg}}", &map, false).unwrap(), "say \"hi\"\n");
    }

    #[test]
    fn test_expressions() {
        let r = replace(&json("{{=foo}}"), &vars(&[("foo", "bar")]), false).unwrap();
        assert_eq!(r, json("bar"));

        let map = vars(&[("workflow.status", "Succeeded")]);
        let r = replace(&json("{{=sprig.dig('status', nil, workflow)}}"), &map, false).unwrap();
        assert_eq!(r, json("Succeeded"));

        let tag = r#"{{=workflow.status == "Succeeded" ? "SUCCESSFUL" : "FAILED"}}"#;
        assert_eq!(replace(&json(tag), &map, false).unwrap(), json("SUCCESSFUL"));
        let failed = vars(&[("workflow.status", "Failed")]);
        assert_eq!(replace(&json(tag), &failed, false).unwrap(), json("FAILED"));
    }

    #[test]
    fn test_expression_with_escaped_quotes() {
        let tag = r#"{{=workflow.failures == "{\"foo\":\"bar\"}" ? "SUCCESSFUL" : "FAILED"}}"#;
        let map = vars(&[("workflow.failures", r#"{"foo":"bar"}"#)]);
        assert_eq!(replace(&json(tag), &map, false).unwrap(), json("SUCCESSFUL"));
        let map = vars(&[("workflow.failures", r#"{"foo":"barr"}"#)]);
        assert_eq!(replace(&json(tag), &map, false).unwrap(), json("FAILED"));
    }

    #[test]
    fn test_unresolved_expressions() {
        assert!(replace(&json("{{=foo}}"), &BTreeMap::new(), true).is_ok());

        let tag = "{{=sprig.int(retries)}}";
        assert_eq!(replace(&json(tag), &BTreeMap::new(), true).unwrap(), json(tag));

        let tag = r#"{{=workflow.status == "Succeeded" ? "SUCCESSFUL" : "FAILED"}}"#;
        assert_eq!(replace(&json(tag), &BTreeMap::new(), true).unwrap(), json(tag));

        let err = replace(&json("{{=foo}}"), &BTreeMap::new(), false).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("failed to evaluate expression"));
        assert!(message.contains("unknown name foo"));

        let err = replace(&json(tag), &BTreeMap::new(), false).unwrap_err();
        assert!(err.to_string().contains("failed to evaluate expression"));

        assert!(replace(&json("{{=!}}"), &BTreeMap::new(), false).is_err());
    }

    #[test]
    fn test_placeholder_forces_unresolved() {
        let map = vars(&[("foo", "__argo__internal__placeholder-1")]);
        let r = replace(&json("{{=asInt(foo)}}"), &map, false).unwrap();
        assert_eq!(r, json("{{=asInt(foo)}}"));
    }

    #[test]
    fn test_nested_tags() {
        let map = vars(&[("inputs.parameters.message", "hello world")]);
        let cases = [
            (
                "{{- with secret \"{{inputs.parameters.message}}\" -}}\n    {{ .Data.data.gitcreds }}\n  {{- end }}",
                "{{- with secret \"hello world\" -}}\n    {{ .Data.data.gitcreds }}\n  {{- end }}",
            ),
            (
                "{{- with {{ secret \"{{inputs.parameters.message}}\" -}}\n  {{- end }}",
                "{{- with {{ secret \"hello world\" -}}\n  {{- end }}",
            ),
            (
                "{{- with {{ {{ }} secret \"{{inputs.parameters.message}}\" -}} }}\n  {{- end }}",
                "{{- with {{ {{ }} secret \"hello world\" -}} }}\n  {{- end }}",
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(replace(&json(input), &map, true).unwrap(), json(expected));
        }

        let missing = "{{- with {{ {{ }} secret \"{{does-not-exist}}\" -}} }}\n  {{- end }}";
        assert_eq!(replace(&json(missing), &map, true).unwrap(), json(missing));
    }

    #[test]
    fn test_sprig_in_expressions() {
        let map = vars(&[("inputs.parameters.message", "hello world")]);
        let r = replace(&json("test {{= sprig.trunc(5, inputs.parameters.message) }}"), &map, true).unwrap();
        assert_eq!(r, json("test hello"));
        let r = replace(&json("test {{= sprig.trunc(-5, inputs.parameters.message) }}"), &map, true).unwrap();
        assert_eq!(r, json("test world"));
    }

    #[test]
    fn test_non_string_results_render_as_json() {
        let map = vars(&[("a", "15"), ("b", "25")]);
        assert_eq!(replace_str("{{=asInt(a) + asInt(b)}}", &map, false).unwrap(), "40");
        assert_eq!(replace_str("{{=[1, 2]}}", &map, false).unwrap(), "[1,2]");
        assert_eq!(replace_str("{{=asFloat(a) / 3}}", &map, false).unwrap(), "5");
    }

    #[test]
    fn test_identity_with_empty_map() {
        let doc = serde_json::json!({
            "args": ["{{inputs.parameters.x}}", "{{=asInt(inputs.parameters.y) * 2}}"],
            "name": "{{ workflow.name }}"
        })
        .to_string();
        assert_eq!(replace(&doc, &BTreeMap::new(), true).unwrap(), doc);
    }

    #[test]
    fn test_replace_value_and_struct() {
        let map = vars(&[("x", "1")]);
        let value = serde_json::json!({"a": ["{{x}}", 2], "b": {"c": "v{{x}}"}});
        assert_eq!(
            replace_value(&value, &map, false).unwrap(),
            serde_json::json!({"a": ["1", 2], "b": {"c": "v1"}})
        );

        let param = workflow_api::Parameter::with_value("p", "{{x}}");
        let replaced = replace_struct(&param, &map, false).unwrap();
        assert_eq!(replaced.value.as_deref(), Some("1"));
    }
}
