//! Expression language used by `{{=...}}` tags, `when` conditions,
//! data transformations and HTTP success conditions

pub mod builtins;
pub mod eval;
pub mod jsonpath;
pub mod lexer;
pub mod parser;
pub mod sprig;

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::errors::WfError;
use crate::expr::eval::Evaluator;
use crate::expr::parser::Node;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("unknown name {0}")]
    UnknownName(String),

    #[error("{0}")]
    Eval(String),
}

impl From<ExprError> for WfError {
    fn from(err: ExprError) -> Self {
        WfError::BadRequest(format!("failed to evaluate expression: {}", err))
    }
}

/// Variables visible to an expression
///
/// Dotted keys such as `inputs.parameters.message` are reachable both as a
/// single flat name and through member access on nested maps.
#[derive(Debug, Clone, Default)]
pub struct Env {
    root: Map<String, Value>,
    flat: HashMap<String, Value>,
    bare_identifiers: bool,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// Env over a flat string map, the shape every substitution scope has
    pub fn from_strings<'a>(vars: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        let mut env = Self::new();
        for (k, v) in vars {
            env.insert(k, Value::String(v.clone()));
        }
        env
    }

    pub fn from_map(vars: &BTreeMap<String, String>) -> Self {
        Self::from_strings(vars.iter())
    }

    /// Unknown identifiers evaluate to their own name, as in `when` conditions
    pub fn with_bare_identifiers(mut self) -> Self {
        self.bare_identifiers = true;
        self
    }

    pub fn bare_identifiers(&self) -> bool {
        self.bare_identifiers
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.flat.insert(key.to_string(), value.clone());

        let parts: Vec<&str> = key.split('.').collect();
        let mut current = &mut self.root;
        for (i, part) in parts.iter().enumerate() {
            if i == parts.len() - 1 {
                // Nested maps win over a scalar at the same path
                match current.get(*part) {
                    Some(Value::Object(_)) => {}
                    _ => {
                        current.insert(part.to_string(), value);
                    }
                }
                return;
            }
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                _ => return,
            };
        }
    }

    pub fn root_value(&self, name: &str) -> Option<&Value> {
        self.root.get(name).or_else(|| self.flat.get(name))
    }

    pub fn flat_value(&self, path: &str) -> Option<&Value> {
        self.flat.get(path)
    }

    /// Whether `path` resolves, through a flat key or nested maps
    pub fn has(&self, path: &str) -> bool {
        if self.flat.contains_key(path) {
            return true;
        }
        let mut parts = path.split('.');
        let mut current = match parts.next().and_then(|p| self.root.get(p)) {
            Some(v) => v,
            None => return false,
        };
        for part in parts {
            current = match current.get(part) {
                Some(v) => v,
                None => return false,
            };
        }
        true
    }

    /// Value at `path`, if any
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        if let Some(v) = self.flat.get(path) {
            return Some(v);
        }
        let mut parts = path.split('.');
        let mut current = self.root.get(parts.next()?)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// Whether any string in the env starts with the placeholder prefix
    pub fn has_placeholder(&self) -> bool {
        self.flat.values().any(is_placeholder)
    }
}

pub fn is_placeholder(value: &Value) -> bool {
    matches!(value, Value::String(s) if s.starts_with(workflow_api::common::PLACEHOLDER_PREFIX))
}

/// A parsed expression ready to run against any env
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    root: Node,
}

impl Program {
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        Ok(Self {
            source: source.to_string(),
            root: parser::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn identifiers(&self) -> Vec<String> {
        parser::identifiers(&self.root)
    }

    pub fn run(&self, env: &Env) -> Result<Value, ExprError> {
        Evaluator::new(env).eval(&self.root)
    }

    /// Evaluate with `data` bound as a variable
    pub fn run_with_data(&self, env: &Env, data: Value) -> Result<Value, ExprError> {
        let mut scoped = env.clone();
        scoped.insert("data", data);
        self.run(&scoped)
    }
}

pub fn eval(source: &str, env: &Env) -> Result<Value, ExprError> {
    Program::compile(source)?.run(env)
}

pub fn eval_bool(source: &str, env: &Env) -> Result<bool, ExprError> {
    match eval(source, env)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::Eval(format!(
            "expected boolean evaluation for '{}', got {}",
            source,
            builtins::to_text(&other)
        ))),
    }
}
