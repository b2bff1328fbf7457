//! Allow-listed text helpers exposed under `sprig.`
//!
//! Helpers that reach the environment or the network are never exposed,
//! and neither are those duplicating core builtins.

use base64::Engine;
use rand::distributions::{Alphanumeric, Uniform};
use rand::Rng;
use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::expr::builtins::{self, as_number, int_arg, string_arg, to_text, type_name, Num};
use crate::expr::ExprError;

/// Helpers removed from the namespace
pub const DENIED: &[&str] = &[
    // environment and network access
    "env",
    "expandenv",
    "getHostByName",
    // duplicates of core builtins
    "add",
    "lower",
    "repeat",
    "split",
    "toString",
];

/// Every helper available under `sprig.`
pub const ALLOWED: &[&str] = &[
    "atoi", "b64dec", "b64enc", "cat", "coalesce", "contains", "default", "dict", "dig", "empty",
    "first", "float64", "fromJson", "has", "hasKey", "hasPrefix", "hasSuffix", "indent", "int",
    "int64", "join", "keys", "last", "list", "max", "merge", "min", "nindent", "nospace",
    "quote", "randAlpha", "randAlphaNum", "randAscii", "randNumeric", "regexFind",
    "regexFindAll", "regexMatch", "regexReplaceAll", "regexReplaceAllLiteral", "regexSplit",
    "replace", "semverCompare", "sha256sum", "sortAlpha", "splitList", "squote", "substr",
    "ternary", "title", "toJson", "trim", "trimAll", "trimPrefix", "trimSuffix", "trunc",
    "uniq", "upper", "uuidv4",
];

pub fn is_allowed(name: &str) -> bool {
    !DENIED.contains(&name) && ALLOWED.contains(&name)
}

fn arity(name: &str, args: &[Value], min: usize) -> Result<(), ExprError> {
    if args.len() < min {
        return Err(ExprError::Eval(format!(
            "sprig.{} expects at least {} arguments, got {}",
            name,
            min,
            args.len()
        )));
    }
    Ok(())
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
    }
}

fn regex(name: &str, pattern: &Value) -> Result<Regex, ExprError> {
    let pattern = string_arg(name, pattern)?;
    Regex::new(&pattern).map_err(|e| ExprError::Eval(format!("sprig.{}: {}", name, e)))
}

fn random_string(n: i64, charset: &[u8]) -> String {
    let mut rng = rand::thread_rng();
    let range = Uniform::from(0..charset.len());
    (0..n.max(0))
        .map(|_| charset[rng.sample(range)] as char)
        .collect()
}

fn semver_compare(constraint: &str, version: &str) -> Result<bool, ExprError> {
    let version = semver::Version::parse(version.trim().trim_start_matches('v'))
        .map_err(|e| ExprError::Eval(format!("sprig.semverCompare: invalid version {:?}: {}", version, e)))?;
    // Space separated comparators mean AND, `||` means OR
    for alternative in constraint.split("||") {
        let mut comparators: Vec<String> = Vec::new();
        let mut pending_op = String::new();
        for token in alternative.split(|c: char| c.is_whitespace() || c == ',') {
            if token.is_empty() {
                continue;
            }
            if token.chars().all(|c| "<>=~^!".contains(c)) {
                pending_op.push_str(token);
            } else {
                comparators.push(format!("{}{}", pending_op, token));
                pending_op.clear();
            }
        }
        let normalized = comparators.join(",");
        let req = semver::VersionReq::parse(&normalized).map_err(|e| {
            ExprError::Eval(format!("sprig.semverCompare: invalid constraint {:?}: {}", constraint, e))
        })?;
        if req.matches(&version) {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn call(name: &str, args: Vec<Value>) -> Result<Value, ExprError> {
    if !is_allowed(name) {
        return Err(ExprError::UnknownName(format!("sprig.{}", name)));
    }

    match name {
        "trunc" => {
            arity(name, &args, 2)?;
            let n = int_arg(name, &args[0])?;
            let chars: Vec<char> = string_arg(name, &args[1])?.chars().collect();
            let len = chars.len() as i64;
            let out: String = if n >= 0 {
                chars.iter().take(n as usize).collect()
            } else {
                chars.iter().skip((len + n).max(0) as usize).collect()
            };
            Ok(Value::String(out))
        }
        "substr" => {
            arity(name, &args, 3)?;
            let start = int_arg(name, &args[0])?.max(0) as usize;
            let end = int_arg(name, &args[1])?;
            let chars: Vec<char> = string_arg(name, &args[2])?.chars().collect();
            let end = if end < 0 { chars.len() } else { (end as usize).min(chars.len()) };
            Ok(Value::String(if start < end { chars[start..end].iter().collect() } else { String::new() }))
        }
        "trim" | "upper" | "title" | "nospace" | "quote" | "squote" | "b64enc" | "b64dec"
        | "sha256sum" => {
            arity(name, &args, 1)?;
            let text = match name {
                "quote" | "squote" => to_text(&args[0]),
                _ => string_arg(name, &args[0])?,
            };
            Ok(Value::String(match name {
                "trim" => text.trim().to_string(),
                "upper" => text.to_uppercase(),
                "title" => text
                    .split(' ')
                    .map(|word| {
                        let mut chars = word.chars();
                        match chars.next() {
                            Some(first) => first.to_uppercase().chain(chars).collect(),
                            None => String::new(),
                        }
                    })
                    .collect::<Vec<String>>()
                    .join(" "),
                "nospace" => text.chars().filter(|c| !c.is_whitespace()).collect(),
                "quote" => format!("{:?}", text),
                "squote" => format!("'{}'", text),
                "b64enc" => base64::engine::general_purpose::STANDARD.encode(text.as_bytes()),
                "b64dec" => {
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(text.trim())
                        .map_err(|e| ExprError::Eval(format!("sprig.b64dec: {}", e)))?;
                    String::from_utf8_lossy(&bytes).into_owned()
                }
                _ => hex::encode(Sha256::digest(text.as_bytes())),
            }))
        }
        "trimAll" | "trimPrefix" | "trimSuffix" => {
            arity(name, &args, 2)?;
            let cut = string_arg(name, &args[0])?;
            let text = string_arg(name, &args[1])?;
            Ok(Value::String(match name {
                "trimAll" => text.trim_matches(|c| cut.contains(c)).to_string(),
                "trimPrefix" => text.strip_prefix(cut.as_str()).unwrap_or(&text).to_string(),
                _ => text.strip_suffix(cut.as_str()).unwrap_or(&text).to_string(),
            }))
        }
        "contains" | "hasPrefix" | "hasSuffix" => {
            arity(name, &args, 2)?;
            let part = string_arg(name, &args[0])?;
            let text = string_arg(name, &args[1])?;
            Ok(Value::Bool(match name {
                "contains" => text.contains(part.as_str()),
                "hasPrefix" => text.starts_with(part.as_str()),
                _ => text.ends_with(part.as_str()),
            }))
        }
        "replace" => {
            arity(name, &args, 3)?;
            let old = string_arg(name, &args[0])?;
            let new = string_arg(name, &args[1])?;
            let text = string_arg(name, &args[2])?;
            Ok(Value::String(text.replace(old.as_str(), &new)))
        }
        "cat" => Ok(Value::String(
            args.iter()
                .filter(|v| !v.is_null())
                .map(to_text)
                .collect::<Vec<_>>()
                .join(" "),
        )),
        "indent" | "nindent" => {
            arity(name, &args, 2)?;
            let n = int_arg(name, &args[0])?.max(0) as usize;
            let text = string_arg(name, &args[1])?;
            let pad = " ".repeat(n);
            let indented = text
                .split('\n')
                .map(|line| format!("{}{}", pad, line))
                .collect::<Vec<_>>()
                .join("\n");
            Ok(Value::String(if name == "nindent" { format!("\n{}", indented) } else { indented }))
        }
        "splitList" | "regexSplit" => {
            arity(name, &args, 2)?;
            let text = string_arg(name, &args[1])?;
            let parts: Vec<Value> = if name == "splitList" {
                let sep = string_arg(name, &args[0])?;
                text.split(sep.as_str()).map(|s| Value::String(s.to_string())).collect()
            } else {
                regex(name, &args[0])?
                    .split(&text)
                    .map(|s| Value::String(s.to_string()))
                    .collect()
            };
            Ok(Value::Array(parts))
        }
        "join" => {
            arity(name, &args, 2)?;
            let sep = string_arg(name, &args[0])?;
            match &args[1] {
                Value::Array(items) => Ok(Value::String(
                    items.iter().map(to_text).collect::<Vec<_>>().join(&sep),
                )),
                other => Ok(Value::String(to_text(other))),
            }
        }
        "regexMatch" => {
            arity(name, &args, 2)?;
            let text = string_arg(name, &args[1])?;
            Ok(Value::Bool(regex(name, &args[0])?.is_match(&text)))
        }
        "regexFind" => {
            arity(name, &args, 2)?;
            let text = string_arg(name, &args[1])?;
            Ok(Value::String(
                regex(name, &args[0])?
                    .find(&text)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
            ))
        }
        "regexFindAll" => {
            arity(name, &args, 3)?;
            let text = string_arg(name, &args[1])?;
            let n = int_arg(name, &args[2])?;
            let re = regex(name, &args[0])?;
            let found = re.find_iter(&text).map(|m| Value::String(m.as_str().to_string()));
            Ok(Value::Array(if n < 0 { found.collect() } else { found.take(n as usize).collect() }))
        }
        "regexReplaceAll" | "regexReplaceAllLiteral" => {
            arity(name, &args, 3)?;
            let text = string_arg(name, &args[1])?;
            let replacement = string_arg(name, &args[2])?;
            let re = regex(name, &args[0])?;
            Ok(Value::String(if name == "regexReplaceAll" {
                re.replace_all(&text, replacement.as_str()).into_owned()
            } else {
                re.replace_all(&text, regex::NoExpand(&replacement)).into_owned()
            }))
        }
        "randAlphaNum" | "randAlpha" | "randNumeric" | "randAscii" => {
            arity(name, &args, 1)?;
            let n = int_arg(name, &args[0])?;
            Ok(Value::String(match name {
                "randAlphaNum" => rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(n.max(0) as usize)
                    .map(char::from)
                    .collect(),
                "randAlpha" => random_string(n, b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ"),
                "randNumeric" => random_string(n, b"0123456789"),
                _ => {
                    let printable: Vec<u8> = (b' '..=b'~').collect();
                    random_string(n, &printable)
                }
            }))
        }
        "uuidv4" => Ok(Value::String(uuid::Uuid::new_v4().to_string())),
        "semverCompare" => {
            arity(name, &args, 2)?;
            let constraint = string_arg(name, &args[0])?;
            let version = string_arg(name, &args[1])?;
            semver_compare(&constraint, &version).map(Value::Bool)
        }
        "default" => {
            arity(name, &args, 1)?;
            Ok(match args.get(1) {
                Some(given) if !is_empty(given) => given.clone(),
                _ => args[0].clone(),
            })
        }
        "empty" => {
            arity(name, &args, 1)?;
            Ok(Value::Bool(is_empty(&args[0])))
        }
        "coalesce" => Ok(args.into_iter().find(|v| !is_empty(v)).unwrap_or(Value::Null)),
        "ternary" => {
            arity(name, &args, 3)?;
            match &args[2] {
                Value::Bool(true) => Ok(args[0].clone()),
                Value::Bool(false) => Ok(args[1].clone()),
                other => Err(ExprError::Eval(format!(
                    "sprig.ternary expects a bool condition, got {}",
                    type_name(other)
                ))),
            }
        }
        "list" => Ok(Value::Array(args)),
        "dict" => {
            let mut pairs = Vec::new();
            let mut iter = args.into_iter();
            while let Some(key) = iter.next() {
                pairs.push((to_text(&key), iter.next().unwrap_or(Value::String(String::new()))));
            }
            Ok(builtins::object(pairs))
        }
        "merge" => {
            // Keys already present in the destination win
            let mut out = Map::new();
            for arg in args {
                match arg {
                    Value::Object(map) => {
                        for (k, v) in map {
                            out.entry(k).or_insert(v);
                        }
                    }
                    other => {
                        return Err(ExprError::Eval(format!(
                            "sprig.merge expects maps, got {}",
                            type_name(&other)
                        )))
                    }
                }
            }
            Ok(Value::Object(out))
        }
        "dig" => {
            // dig(k1, k2, ..., default, map)
            arity(name, &args, 3)?;
            let map = &args[args.len() - 1];
            let default = &args[args.len() - 2];
            let mut current = map;
            for key in &args[..args.len() - 2] {
                let key = string_arg(name, key)?;
                match current.get(&key) {
                    Some(next) => current = next,
                    None => return Ok(default.clone()),
                }
            }
            Ok(current.clone())
        }
        "has" => {
            arity(name, &args, 2)?;
            match &args[1] {
                Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| builtins::values_equal(i, &args[0])))),
                _ => Ok(Value::Bool(false)),
            }
        }
        "hasKey" => {
            arity(name, &args, 2)?;
            let key = string_arg(name, &args[1])?;
            Ok(Value::Bool(args[0].get(&key).is_some()))
        }
        "keys" => {
            let mut keys = Vec::new();
            for arg in &args {
                if let Value::Object(map) = arg {
                    keys.extend(map.keys().map(|k| Value::String(k.clone())));
                }
            }
            Ok(Value::Array(keys))
        }
        "first" | "last" | "uniq" => builtins::call(name, args),
        "sortAlpha" => {
            arity(name, &args, 1)?;
            match &args[0] {
                Value::Array(items) => {
                    let mut texts: Vec<String> = items.iter().map(to_text).collect();
                    texts.sort();
                    Ok(Value::Array(texts.into_iter().map(Value::String).collect()))
                }
                other => Ok(Value::Array(vec![Value::String(to_text(other))])),
            }
        }
        "int" | "int64" | "atoi" => {
            arity(name, &args, 1)?;
            Ok(match &args[0] {
                Value::String(s) => Value::from(s.trim().parse::<i64>().unwrap_or(0)),
                other => match as_number(other) {
                    Some(Num::Int(i)) => Value::from(i),
                    Some(Num::Float(f)) => Value::from(f as i64),
                    None => Value::from(0),
                },
            })
        }
        "float64" => {
            arity(name, &args, 1)?;
            Ok(match &args[0] {
                Value::String(s) => builtins::float_value(s.trim().parse::<f64>().unwrap_or(0.0)),
                other => builtins::float_value(as_number(other).map(|n| n.as_f64()).unwrap_or(0.0)),
            })
        }
        "max" | "min" => builtins::call(name, args),
        "toJson" => builtins::call("toJson", args),
        "fromJson" => {
            arity(name, &args, 1)?;
            let text = string_arg(name, &args[0])?;
            Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
        }
        _ => Err(ExprError::UnknownName(format!("sprig.{}", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_allow_list() {
        for name in ["randAlphaNum", "uuidv4", "regexReplaceAll", "merge", "semverCompare"] {
            assert!(is_allowed(name), "{} should be allowed", name);
        }
        for name in ["env", "expandenv", "getHostByName", "add", "lower", "repeat", "split", "toString"] {
            assert!(!is_allowed(name), "{} should be denied", name);
            assert!(call(name, vec![json!("x")]).is_err());
        }
    }

    #[test]
    fn test_trunc() {
        assert_eq!(call("trunc", vec![json!(5), json!("hello world")]).unwrap(), json!("hello"));
        assert_eq!(call("trunc", vec![json!(-5), json!("hello world")]).unwrap(), json!("world"));
    }

    #[test]
    fn test_dig_and_merge() {
        let wf = json!({"status": "Succeeded"});
        assert_eq!(call("dig", vec![json!("status"), Value::Null, wf]).unwrap(), json!("Succeeded"));
        assert_eq!(
            call("merge", vec![json!({"a": 1}), json!({"a": 2, "b": 3})]).unwrap(),
            json!({"a": 1, "b": 3})
        );
    }

    #[test]
    fn test_semver_compare() {
        assert_eq!(call("semverCompare", vec![json!(">=1.2.0"), json!("v1.4.0")]).unwrap(), json!(true));
        assert_eq!(call("semverCompare", vec![json!("^2.0.0"), json!("1.9.9")]).unwrap(), json!(false));
        assert_eq!(
            call("semverCompare", vec![json!(">= 1.0.0 < 2.0.0"), json!("1.5.0")]).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_random_lengths() {
        match call("randAlphaNum", vec![json!(12)]).unwrap() {
            Value::String(s) => assert_eq!(s.len(), 12),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_regex_replace() {
        assert_eq!(
            call("regexReplaceAll", vec![json!("a(x*)b"), json!("-ab-axxb-"), json!("${1}W")]).unwrap(),
            json!("-W-xxW-")
        );
    }
}
