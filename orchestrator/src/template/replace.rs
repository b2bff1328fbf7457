//! Tag scanner and per-tag substitution

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::errors::WfError;
use crate::expr::{self, builtins, Env, ExprError, Program};

/// Text between tags, or the raw content of one `{{...}}` tag
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Segment<'a> {
    Text(&'a str),
    Tag(&'a str),
}

/// Split `text` into literal text and tags; an unclosed `{{` is an error
pub(crate) fn scan(text: &str) -> Result<Vec<Segment<'_>>, WfError> {
    let mut segments = Vec::new();
    let mut pos = 0;
    while let Some(offset) = text[pos..].find("{{") {
        let start = pos + offset;
        if start > pos {
            segments.push(Segment::Text(&text[pos..start]));
        }
        let end = text[start + 2..].find("}}").map(|e| start + 2 + e).ok_or_else(|| {
            WfError::BadRequest(format!(
                "malformed template: cannot find end tag \"}}}}\" in {:?}",
                &text[start..]
            ))
        })?;
        segments.push(Segment::Tag(&text[start + 2..end]));
        pos = end + 2;
    }
    if pos < text.len() {
        segments.push(Segment::Text(&text[pos..]));
    }
    Ok(segments)
}

/// How one substitution pass behaves
#[derive(Debug, Clone, Copy)]
pub(crate) struct Mode {
    pub allow_unresolved: bool,
    /// Values are inserted into a JSON string literal and must be escaped
    pub json_escape: bool,
    pub expressions: bool,
}

pub(crate) struct Substituter<'a> {
    replace_map: &'a BTreeMap<String, String>,
    env: Env,
    mode: Mode,
}

impl<'a> Substituter<'a> {
    pub fn new(replace_map: &'a BTreeMap<String, String>, mode: Mode) -> Self {
        Self {
            replace_map,
            env: Env::from_map(replace_map),
            mode,
        }
    }

    pub fn run(&self, text: &str) -> Result<String, WfError> {
        let mut out = String::with_capacity(text.len());
        for segment in scan(text)? {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Tag(raw) => self.tag(&mut out, raw)?,
            }
        }
        Ok(out)
    }

    fn tag(&self, out: &mut String, raw: &str) -> Result<(), WfError> {
        let trimmed = raw.trim();
        if self.mode.expressions {
            if let Some(expression) = trimmed.strip_prefix('=') {
                return self.expression(out, raw, expression.trim());
            }
        }
        self.simple(out, raw, trimmed)
    }

    fn simple(&self, out: &mut String, raw: &str, name: &str) -> Result<(), WfError> {
        if let Some(value) = self.replace_map.get(name) {
            self.push_value(out, value);
            return Ok(());
        }

        // `{{ with "{{inputs.x}}"` keeps the outer text and resolves the innermost tag
        if let Some(index) = raw.rfind("{{") {
            let inner = raw[index + 2..].trim();
            if let Some(value) = self.replace_map.get(inner) {
                out.push_str("{{");
                out.push_str(&raw[..index]);
                self.push_value(out, value);
                return Ok(());
            }
        }

        if self.mode.allow_unresolved {
            push_verbatim(out, raw);
            return Ok(());
        }
        Err(WfError::BadRequest(format!("failed to resolve {{{{{}}}}}", name)))
    }

    fn expression(&self, out: &mut String, raw: &str, expression: &str) -> Result<(), WfError> {
        let source = if self.mode.json_escape {
            match serde_json::from_str::<String>(&format!("\"{}\"", expression)) {
                Ok(source) => source,
                Err(e) if self.mode.allow_unresolved => {
                    debug!("leaving expression unresolved, cannot unescape: {}", e);
                    push_verbatim(out, raw);
                    return Ok(());
                }
                Err(e) => {
                    return Err(WfError::BadRequest(format!(
                        "failed to unmarshal JSON expression: {}",
                        e
                    )))
                }
            }
        } else {
            expression.to_string()
        };

        let env_has_placeholder = self.env.has_placeholder();
        let program = match Program::compile(&source) {
            Ok(program) => program,
            Err(_) if env_has_placeholder => {
                push_verbatim(out, raw);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let identifiers = program.identifiers();
        let missing: Vec<&String> = identifiers.iter().filter(|id| !self.env.has(id)).collect();
        if let Some(first) = missing.first() {
            if self.mode.allow_unresolved {
                debug!("leaving expression unresolved, {} is not set", first);
                push_verbatim(out, raw);
                return Ok(());
            }
            return Err(ExprError::UnknownName(first.to_string()).into());
        }

        // Mock values from validation must never leak into an evaluated result
        let references_placeholder = identifiers
            .iter()
            .filter_map(|id| self.env.lookup(id))
            .any(expr::is_placeholder);
        if references_placeholder {
            push_verbatim(out, raw);
            return Ok(());
        }

        match program.run(&self.env) {
            Ok(Value::Null) if env_has_placeholder => push_verbatim(out, raw),
            Ok(Value::Null) => {
                return Err(WfError::BadRequest(format!(
                    "failed to evaluate expression {:?}",
                    expression
                )))
            }
            Ok(Value::String(s)) => self.push_value(out, &s),
            Ok(other) => self.push_value(out, &builtins::to_text(&other)),
            Err(e) if env_has_placeholder => {
                debug!("leaving expression unresolved after placeholder failure: {}", e);
                push_verbatim(out, raw);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn push_value(&self, out: &mut String, value: &str) {
        if self.mode.json_escape {
            out.push_str(&json_escape(value));
        } else {
            out.push_str(value);
        }
    }
}

fn push_verbatim(out: &mut String, raw: &str) {
    out.push_str("{{");
    out.push_str(raw);
    out.push_str("}}");
}

/// JSON string escape without the surrounding quotes
pub(crate) fn json_escape(value: &str) -> String {
    let quoted = Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan() {
        let segments = scan("a {{b}} c {{= d }}").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Text("a "),
                Segment::Tag("b"),
                Segment::Text(" c "),
                Segment::Tag("= d "),
            ]
        );
        assert!(scan("{{").is_err());
        assert!(scan("x {{ y").is_err());
        assert_eq!(scan("plain").unwrap(), vec![Segment::Text("plain")]);
    }

    #[test]
    fn test_json_escape() {
        assert_eq!(json_escape("a\"b\n"), "a\\\"b\\n");
        assert_eq!(json_escape("plain"), "plain");
    }
}
