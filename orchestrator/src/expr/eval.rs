//! Tree-walking evaluator

use regex::Regex;
use serde_json::{Map, Value};

use crate::expr::builtins::{self, as_number, values_equal, Num};
use crate::expr::parser::Node;
use crate::expr::{Env, ExprError};

pub struct Evaluator<'a> {
    env: &'a Env,
    pointers: Vec<Value>,
}

impl<'a> Evaluator<'a> {
    pub fn new(env: &'a Env) -> Self {
        Self {
            env,
            pointers: Vec::new(),
        }
    }

    pub fn eval(&mut self, node: &Node) -> Result<Value, ExprError> {
        match node {
            Node::Literal(v) => Ok(v.clone()),
            Node::Ident(name) => self.ident(name),
            Node::Pointer => self
                .pointers
                .last()
                .cloned()
                .ok_or_else(|| ExprError::Eval("'#' used outside of a closure".to_string())),
            Node::Member {
                object,
                property,
                optional,
            } => {
                if let Some(path) = node.member_path() {
                    if let Some(v) = self.env.flat_value(&path) {
                        return Ok(v.clone());
                    }
                    if self.env.bare_identifiers() && root_missing(self.env, node) {
                        return Ok(Value::String(path));
                    }
                }
                let target = self.eval(object)?;
                let key = self.eval(property)?;
                member(&target, &key, *optional)
            }
            Node::Slice { object, from, to } => {
                let target = self.eval(object)?;
                let from = match from {
                    Some(n) => Some(self.eval(n)?),
                    None => None,
                };
                let to = match to {
                    Some(n) => Some(self.eval(n)?),
                    None => None,
                };
                slice(&target, from.as_ref(), to.as_ref())
            }
            Node::Call { callee, args } => self.call(callee, args),
            Node::Closure(body) => self.eval(body),
            Node::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match *op {
                    "!" => match value {
                        Value::Bool(b) => Ok(Value::Bool(!b)),
                        other => Err(ExprError::Eval(format!(
                            "invalid operation: ! ({})",
                            builtins::type_name(&other)
                        ))),
                    },
                    "-" => match as_number(&value) {
                        Some(Num::Int(i)) => Ok(Value::from(-i)),
                        Some(Num::Float(f)) => Ok(builtins::float_value(-f)),
                        None => Err(ExprError::Eval(format!(
                            "invalid operation: - ({})",
                            builtins::type_name(&value)
                        ))),
                    },
                    _ => match as_number(&value) {
                        Some(_) => Ok(value),
                        None => Err(ExprError::Eval(format!(
                            "invalid operation: + ({})",
                            builtins::type_name(&value)
                        ))),
                    },
                }
            }
            Node::Binary { op, left, right } => self.binary(op, left, right),
            Node::Ternary {
                cond,
                then,
                otherwise,
            } => match self.eval(cond)? {
                Value::Bool(true) => self.eval(then),
                Value::Bool(false) => self.eval(otherwise),
                other => Err(ExprError::Eval(format!(
                    "non-bool ternary condition ({})",
                    builtins::type_name(&other)
                ))),
            },
            Node::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(Value::Array(out))
            }
            Node::Map(entries) => {
                let mut out = Map::new();
                for (k, v) in entries {
                    let key = match self.eval(k)? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    out.insert(key, self.eval(v)?);
                }
                Ok(Value::Object(out))
            }
        }
    }

    fn ident(&self, name: &str) -> Result<Value, ExprError> {
        if let Some(v) = self.env.root_value(name) {
            return Ok(v.clone());
        }
        if self.env.bare_identifiers() {
            return Ok(Value::String(name.to_string()));
        }
        Err(ExprError::UnknownName(name.to_string()))
    }

    fn binary(&mut self, op: &str, left: &Node, right: &Node) -> Result<Value, ExprError> {
        match op {
            "&&" | "||" => {
                let lhs = expect_bool(op, self.eval(left)?)?;
                if (op == "&&" && !lhs) || (op == "||" && lhs) {
                    return Ok(Value::Bool(lhs));
                }
                Ok(Value::Bool(expect_bool(op, self.eval(right)?)?))
            }
            "??" => match self.eval(left) {
                Ok(Value::Null) | Err(ExprError::UnknownName(_)) => self.eval(right),
                other => other,
            },
            _ => {
                let lhs = self.eval(left)?;
                let rhs = self.eval(right)?;
                binary_values(op, &lhs, &rhs)
            }
        }
    }

    fn call(&mut self, callee: &str, args: &[Node]) -> Result<Value, ExprError> {
        if let Some(Node::Closure(body)) = args.get(1) {
            let subject = self.eval(&args[0])?;
            let items = match subject {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => {
                    return Err(ExprError::Eval(format!(
                        "{}() expects an array, got {}",
                        callee,
                        builtins::type_name(&other)
                    )))
                }
            };
            return self.call_predicate(callee, items, body);
        }

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }
        builtins::call(callee, values)
    }

    fn apply(&mut self, body: &Node, item: &Value) -> Result<Value, ExprError> {
        self.pointers.push(item.clone());
        let result = self.eval(body);
        self.pointers.pop();
        result
    }

    fn test(&mut self, callee: &str, body: &Node, item: &Value) -> Result<bool, ExprError> {
        match self.apply(body, item)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::Eval(format!(
                "{}() predicate must return bool, got {}",
                callee,
                builtins::type_name(&other)
            ))),
        }
    }

    fn call_predicate(&mut self, callee: &str, items: Vec<Value>, body: &Node) -> Result<Value, ExprError> {
        match callee {
            "filter" => {
                let mut out = Vec::new();
                for item in items {
                    if self.test(callee, body, &item)? {
                        out.push(item);
                    }
                }
                Ok(Value::Array(out))
            }
            "map" => {
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    out.push(self.apply(body, item)?);
                }
                Ok(Value::Array(out))
            }
            "all" => {
                for item in &items {
                    if !self.test(callee, body, item)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            "any" => {
                for item in &items {
                    if self.test(callee, body, item)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            "none" => {
                for item in &items {
                    if self.test(callee, body, item)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            "one" | "count" => {
                let mut n = 0i64;
                for item in &items {
                    if self.test(callee, body, item)? {
                        n += 1;
                    }
                }
                if callee == "one" {
                    Ok(Value::Bool(n == 1))
                } else {
                    Ok(Value::from(n))
                }
            }
            "find" | "findIndex" => {
                for (i, item) in items.iter().enumerate() {
                    if self.test(callee, body, item)? {
                        return Ok(if callee == "find" { item.clone() } else { Value::from(i as i64) });
                    }
                }
                Ok(if callee == "find" { Value::Null } else { Value::from(-1) })
            }
            "findLast" | "findLastIndex" => {
                for (i, item) in items.iter().enumerate().rev() {
                    if self.test(callee, body, item)? {
                        return Ok(if callee == "findLast" { item.clone() } else { Value::from(i as i64) });
                    }
                }
                Ok(if callee == "findLast" { Value::Null } else { Value::from(-1) })
            }
            "sum" => {
                let mut mapped = Vec::with_capacity(items.len());
                for item in &items {
                    mapped.push(self.apply(body, item)?);
                }
                builtins::call("sum", vec![Value::Array(mapped)])
            }
            "sortBy" => {
                let mut keyed = Vec::with_capacity(items.len());
                for item in items {
                    let key = self.apply(body, &item)?;
                    keyed.push((key, item));
                }
                keyed.sort_by(|a, b| builtins::compare(&a.0, &b.0).unwrap_or(std::cmp::Ordering::Equal));
                Ok(Value::Array(keyed.into_iter().map(|(_, v)| v).collect()))
            }
            "groupBy" => {
                let mut groups = Map::new();
                for item in items {
                    let key = match self.apply(body, &item)? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    match groups.entry(key).or_insert_with(|| Value::Array(Vec::new())) {
                        Value::Array(list) => list.push(item),
                        _ => {}
                    }
                }
                Ok(Value::Object(groups))
            }
            other => Err(ExprError::Eval(format!("{}() does not take a predicate", other))),
        }
    }
}

fn root_missing(env: &Env, node: &Node) -> bool {
    let mut current = node;
    loop {
        match current {
            Node::Ident(name) => return env.root_value(name).is_none(),
            Node::Member { object, .. } => current = object,
            _ => return false,
        }
    }
}

fn expect_bool(op: &str, value: Value) -> Result<bool, ExprError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::Eval(format!(
            "invalid operation: {} (mismatched type {})",
            op,
            builtins::type_name(&other)
        ))),
    }
}

pub fn member(target: &Value, key: &Value, optional: bool) -> Result<Value, ExprError> {
    match (target, key) {
        (Value::Null, _) if optional => Ok(Value::Null),
        (Value::Object(map), Value::String(k)) => Ok(map.get(k).cloned().unwrap_or(Value::Null)),
        (Value::Array(items), _) => {
            let index = match as_number(key) {
                Some(Num::Int(i)) => i,
                _ => {
                    return Err(ExprError::Eval(format!(
                        "array index must be an integer, got {}",
                        builtins::type_name(key)
                    )))
                }
            };
            let len = items.len() as i64;
            let idx = if index < 0 { len + index } else { index };
            if idx < 0 || idx >= len {
                return Err(ExprError::Eval(format!(
                    "index out of range: {} (array length is {})",
                    index, len
                )));
            }
            Ok(items[idx as usize].clone())
        }
        (Value::String(s), _) => {
            let chars: Vec<char> = s.chars().collect();
            match as_number(key) {
                Some(Num::Int(i)) => {
                    let len = chars.len() as i64;
                    let idx = if i < 0 { len + i } else { i };
                    chars
                        .get(idx as usize)
                        .filter(|_| idx >= 0)
                        .map(|c| Value::String(c.to_string()))
                        .ok_or_else(|| ExprError::Eval(format!("index out of range: {}", i)))
                }
                _ => Err(ExprError::Eval(format!("cannot fetch {} from string", key))),
            }
        }
        (Value::Null, _) => Err(ExprError::Eval(format!("cannot fetch {} from nil", render_key(key)))),
        (other, _) => Err(ExprError::Eval(format!(
            "cannot fetch {} from {}",
            render_key(key),
            builtins::type_name(other)
        ))),
    }
}

fn render_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn slice(target: &Value, from: Option<&Value>, to: Option<&Value>) -> Result<Value, ExprError> {
    let bound = |v: Option<&Value>, default: i64, len: i64| -> Result<usize, ExprError> {
        let raw = match v {
            None => default,
            Some(v) => match as_number(v) {
                Some(Num::Int(i)) => i,
                _ => return Err(ExprError::Eval("slice bounds must be integers".to_string())),
            },
        };
        let idx = if raw < 0 { len + raw } else { raw };
        Ok(idx.clamp(0, len) as usize)
    };
    match target {
        Value::Array(items) => {
            let len = items.len() as i64;
            let (a, b) = (bound(from, 0, len)?, bound(to, len, len)?);
            Ok(Value::Array(if a < b { items[a..b].to_vec() } else { Vec::new() }))
        }
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len() as i64;
            let (a, b) = (bound(from, 0, len)?, bound(to, len, len)?);
            Ok(Value::String(if a < b { chars[a..b].iter().collect() } else { String::new() }))
        }
        other => Err(ExprError::Eval(format!("cannot slice {}", builtins::type_name(other)))),
    }
}

pub fn binary_values(op: &str, lhs: &Value, rhs: &Value) -> Result<Value, ExprError> {
    let mismatch = || {
        ExprError::Eval(format!(
            "invalid operation: {} {} {} (mismatched types)",
            builtins::type_name(lhs),
            op,
            builtins::type_name(rhs)
        ))
    };
    match op {
        "==" => Ok(Value::Bool(values_equal(lhs, rhs))),
        "!=" => Ok(Value::Bool(!values_equal(lhs, rhs))),
        "<" | ">" | "<=" | ">=" => {
            let ordering = builtins::compare(lhs, rhs).ok_or_else(mismatch)?;
            Ok(Value::Bool(match op {
                "<" => ordering.is_lt(),
                ">" => ordering.is_gt(),
                "<=" => ordering.is_le(),
                _ => ordering.is_ge(),
            }))
        }
        "+" => match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
            }
            _ => arithmetic(op, lhs, rhs).ok_or_else(mismatch),
        },
        "-" | "*" | "%" => arithmetic(op, lhs, rhs).ok_or_else(mismatch),
        "/" => {
            let a = as_number(lhs).ok_or_else(mismatch)?.as_f64();
            let b = as_number(rhs).ok_or_else(mismatch)?.as_f64();
            Ok(builtins::float_value(a / b))
        }
        "**" => {
            let a = as_number(lhs).ok_or_else(mismatch)?.as_f64();
            let b = as_number(rhs).ok_or_else(mismatch)?.as_f64();
            Ok(builtins::float_value(a.powf(b)))
        }
        "in" | "not in" => {
            let found = match rhs {
                Value::Array(items) => items.iter().any(|i| values_equal(i, lhs)),
                Value::Object(map) => match lhs {
                    Value::String(k) => map.contains_key(k),
                    _ => false,
                },
                Value::Null => false,
                _ => return Err(mismatch()),
            };
            Ok(Value::Bool(if op == "in" { found } else { !found }))
        }
        "matches" | "=~" | "!~" => match (lhs, rhs) {
            (Value::String(s), Value::String(pattern)) => {
                let re = Regex::new(pattern)
                    .map_err(|e| ExprError::Eval(format!("invalid regular expression: {}", e)))?;
                let hit = re.is_match(s);
                Ok(Value::Bool(if op == "!~" { !hit } else { hit }))
            }
            _ => Err(mismatch()),
        },
        "contains" | "startsWith" | "endsWith" => match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => Ok(Value::Bool(match op {
                "contains" => a.contains(b.as_str()),
                "startsWith" => a.starts_with(b.as_str()),
                _ => a.ends_with(b.as_str()),
            })),
            _ => Err(mismatch()),
        },
        ".." => match (as_number(lhs), as_number(rhs)) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => {
                Ok(Value::Array((a..=b).map(Value::from).collect()))
            }
            _ => Err(mismatch()),
        },
        _ => Err(ExprError::Eval(format!("unknown operator {}", op))),
    }
}

fn arithmetic(op: &str, lhs: &Value, rhs: &Value) -> Option<Value> {
    match (as_number(lhs)?, as_number(rhs)?) {
        (Num::Int(a), Num::Int(b)) => match op {
            "+" => a.checked_add(b).map(Value::from),
            "-" => a.checked_sub(b).map(Value::from),
            "*" => a.checked_mul(b).map(Value::from),
            "%" if b != 0 => Some(Value::from(a % b)),
            _ => None,
        },
        (a, b) => {
            let (a, b) = (a.as_f64(), b.as_f64());
            match op {
                "+" => Some(builtins::float_value(a + b)),
                "-" => Some(builtins::float_value(a - b)),
                "*" => Some(builtins::float_value(a * b)),
                _ => None,
            }
        }
    }
}
