//! Pratt parser producing the expression tree

use serde_json::Value;

use crate::expr::lexer::{tokenize, Spanned, Token};
use crate::expr::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Literal(Value),
    Ident(String),
    /// `#`, the current element inside a closure
    Pointer,
    Member {
        object: Box<Node>,
        property: Box<Node>,
        optional: bool,
    },
    Slice {
        object: Box<Node>,
        from: Option<Box<Node>>,
        to: Option<Box<Node>>,
    },
    /// Call of a named function, `sprig.trunc` is one name
    Call {
        callee: String,
        args: Vec<Node>,
    },
    Closure(Box<Node>),
    Unary {
        op: &'static str,
        operand: Box<Node>,
    },
    Binary {
        op: String,
        left: Box<Node>,
        right: Box<Node>,
    },
    Ternary {
        cond: Box<Node>,
        then: Box<Node>,
        otherwise: Box<Node>,
    },
    Array(Vec<Node>),
    Map(Vec<(Node, Node)>),
}

impl Node {
    /// Dotted path for `a.b.c` chains of identifiers and literal keys
    pub fn member_path(&self) -> Option<String> {
        match self {
            Node::Ident(name) => Some(name.clone()),
            Node::Member {
                object, property, ..
            } => match property.as_ref() {
                Node::Literal(Value::String(key)) => {
                    object.member_path().map(|base| format!("{}.{}", base, key))
                }
                _ => None,
            },
            _ => None,
        }
    }
}

/// Builtins whose second argument is a closure over `#`
const PREDICATE_FUNCS: &[&str] = &[
    "all", "any", "none", "one", "filter", "map", "count", "find", "findIndex", "findLast",
    "findLastIndex", "sortBy", "groupBy", "sum",
];

pub fn parse(source: &str) -> Result<Node, ExprError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let node = parser.expression(0)?;
    match parser.peek() {
        Token::Eof => Ok(node),
        other => Err(ExprError::Syntax(format!(
            "unexpected token {:?} at position {}",
            other,
            parser.position()
        ))),
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].token
    }

    fn position(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].pos
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Token::Op(o) if *o == op)
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ExprError> {
        if self.is_op(op) {
            self.advance();
            Ok(())
        } else {
            Err(ExprError::Syntax(format!(
                "expected '{}' but found {:?} at position {}",
                op,
                self.peek(),
                self.position()
            )))
        }
    }

    /// Binding powers of the infix operator at the cursor
    fn infix(&self) -> Option<(String, u8, u8, usize)> {
        let (op, width) = match self.peek() {
            Token::Op(op) => (op.to_string(), 1),
            Token::Ident(word) => match word.as_str() {
                "and" => ("&&".to_string(), 1),
                "or" => ("||".to_string(), 1),
                "in" | "matches" | "contains" | "startsWith" | "endsWith" => (word.clone(), 1),
                "not" => match self.peek_at(1) {
                    Token::Ident(next) if next == "in" => ("not in".to_string(), 2),
                    _ => return None,
                },
                _ => return None,
            },
            _ => return None,
        };
        let (lbp, rbp) = match op.as_str() {
            "?" => (1, 1),
            "??" => (2, 3),
            "||" => (3, 4),
            "&&" => (4, 5),
            "==" | "!=" | "<" | ">" | "<=" | ">=" | "=~" | "!~" | "in" | "not in" | "matches"
            | "contains" | "startsWith" | "endsWith" => (5, 6),
            ".." => (6, 7),
            "+" | "-" => (7, 8),
            "*" | "/" | "%" => (8, 9),
            "**" => (11, 10),
            _ => return None,
        };
        Some((op, lbp, rbp, width))
    }

    fn expression(&mut self, min_bp: u8) -> Result<Node, ExprError> {
        let mut left = self.unary()?;

        while let Some((op, lbp, rbp, width)) = self.infix() {
            if lbp < min_bp {
                break;
            }
            for _ in 0..width {
                self.advance();
            }
            if op == "?" {
                let then = self.expression(0)?;
                self.expect_op(":")?;
                let otherwise = self.expression(rbp)?;
                left = Node::Ternary {
                    cond: Box::new(left),
                    then: Box::new(then),
                    otherwise: Box::new(otherwise),
                };
                continue;
            }
            let right = self.expression(rbp)?;
            left = Node::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn unary(&mut self) -> Result<Node, ExprError> {
        let op = match self.peek() {
            Token::Op("!") => Some("!"),
            Token::Op("-") => Some("-"),
            Token::Op("+") => Some("+"),
            Token::Ident(word) if word == "not" => Some("!"),
            _ => None,
        };
        match op {
            Some(op) => {
                self.advance();
                let operand = self.expression(9)?;
                Ok(Node::Unary {
                    op,
                    operand: Box::new(operand),
                })
            }
            None => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Node, ExprError> {
        let mut node = self.primary()?;
        loop {
            if self.is_op(".") || self.is_op("?.") {
                let optional = self.is_op("?.");
                self.advance();
                match self.advance() {
                    Token::Ident(name) => {
                        node = Node::Member {
                            object: Box::new(node),
                            property: Box::new(Node::Literal(Value::String(name))),
                            optional,
                        };
                    }
                    Token::Int(index) if !optional => {
                        node = Node::Member {
                            object: Box::new(node),
                            property: Box::new(Node::Literal(Value::from(index))),
                            optional,
                        };
                    }
                    other => {
                        return Err(ExprError::Syntax(format!(
                            "expected property name after '.', found {:?}",
                            other
                        )))
                    }
                }
            } else if self.is_op("[") {
                self.advance();
                if self.is_op(":") {
                    self.advance();
                    let to = if self.is_op("]") { None } else { Some(Box::new(self.expression(0)?)) };
                    self.expect_op("]")?;
                    node = Node::Slice {
                        object: Box::new(node),
                        from: None,
                        to,
                    };
                    continue;
                }
                let index = self.expression(0)?;
                if self.is_op(":") {
                    self.advance();
                    let to = if self.is_op("]") { None } else { Some(Box::new(self.expression(0)?)) };
                    self.expect_op("]")?;
                    node = Node::Slice {
                        object: Box::new(node),
                        from: Some(Box::new(index)),
                        to,
                    };
                    continue;
                }
                self.expect_op("]")?;
                node = Node::Member {
                    object: Box::new(node),
                    property: Box::new(index),
                    optional: false,
                };
            } else if self.is_op("(") {
                let callee = node.member_path().ok_or_else(|| {
                    ExprError::Syntax(format!("expression at position {} is not callable", self.position()))
                })?;
                self.advance();
                let args = self.arguments(&callee)?;
                node = Node::Call { callee, args };
            } else {
                return Ok(node);
            }
        }
    }

    fn arguments(&mut self, callee: &str) -> Result<Vec<Node>, ExprError> {
        let mut args = Vec::new();
        let takes_closure = PREDICATE_FUNCS.contains(&callee);
        while !self.is_op(")") {
            if !args.is_empty() {
                self.expect_op(",")?;
            }
            if takes_closure && args.len() == 1 {
                args.push(self.closure()?);
            } else {
                args.push(self.expression(0)?);
            }
        }
        self.expect_op(")")?;
        Ok(args)
    }

    fn closure(&mut self) -> Result<Node, ExprError> {
        if self.is_op("{") {
            self.advance();
            let body = self.expression(0)?;
            self.expect_op("}")?;
            Ok(Node::Closure(Box::new(body)))
        } else {
            Ok(Node::Closure(Box::new(self.expression(0)?)))
        }
    }

    fn primary(&mut self) -> Result<Node, ExprError> {
        let position = self.position();
        match self.advance() {
            Token::Int(v) => Ok(Node::Literal(Value::from(v))),
            Token::Float(v) => Ok(Node::Literal(
                serde_json::Number::from_f64(v)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Token::Str(s) => Ok(Node::Literal(Value::String(s))),
            Token::Pointer => {
                // `#.field` is sugar for member access on the pointer
                Ok(Node::Pointer)
            }
            Token::Ident(word) => match word.as_str() {
                "true" => Ok(Node::Literal(Value::Bool(true))),
                "false" => Ok(Node::Literal(Value::Bool(false))),
                "nil" | "null" => Ok(Node::Literal(Value::Null)),
                _ => Ok(Node::Ident(word)),
            },
            Token::Op("(") => {
                let inner = self.expression(0)?;
                self.expect_op(")")?;
                Ok(inner)
            }
            Token::Op("[") => {
                let mut items = Vec::new();
                while !self.is_op("]") {
                    if !items.is_empty() {
                        self.expect_op(",")?;
                        if self.is_op("]") {
                            break;
                        }
                    }
                    items.push(self.expression(0)?);
                }
                self.expect_op("]")?;
                Ok(Node::Array(items))
            }
            Token::Op("{") => {
                let mut entries = Vec::new();
                while !self.is_op("}") {
                    if !entries.is_empty() {
                        self.expect_op(",")?;
                        if self.is_op("}") {
                            break;
                        }
                    }
                    let key = match self.advance() {
                        Token::Ident(name) => Node::Literal(Value::String(name)),
                        Token::Str(s) => Node::Literal(Value::String(s)),
                        Token::Int(i) => Node::Literal(Value::String(i.to_string())),
                        Token::Op("(") => {
                            let key = self.expression(0)?;
                            self.expect_op(")")?;
                            key
                        }
                        other => {
                            return Err(ExprError::Syntax(format!("invalid map key {:?}", other)))
                        }
                    };
                    self.expect_op(":")?;
                    let value = self.expression(0)?;
                    entries.push((key, value));
                }
                self.expect_op("}")?;
                Ok(Node::Map(entries))
            }
            Token::Op(".") => {
                // bare `.field` inside a closure
                match self.advance() {
                    Token::Ident(name) => Ok(Node::Member {
                        object: Box::new(Node::Pointer),
                        property: Box::new(Node::Literal(Value::String(name))),
                        optional: false,
                    }),
                    other => Err(ExprError::Syntax(format!("unexpected {:?} after '.'", other))),
                }
            }
            Token::Eof => Err(ExprError::Syntax("unexpected end of expression".to_string())),
            other => Err(ExprError::Syntax(format!(
                "unexpected token {:?} at position {}",
                other, position
            ))),
        }
    }
}

/// Every variable path the expression reads, excluding callees and closure pointers
pub fn identifiers(node: &Node) -> Vec<String> {
    let mut out = Vec::new();
    collect_identifiers(node, &mut out);
    out
}

fn collect_identifiers(node: &Node, out: &mut Vec<String>) {
    let mut push = |path: String| {
        if !out.contains(&path) {
            out.push(path);
        }
    };
    match node {
        Node::Ident(name) => push(name.clone()),
        Node::Member {
            object, property, ..
        } => match node.member_path() {
            Some(path) => push(path),
            None => {
                collect_identifiers(object, out);
                collect_identifiers(property, out);
            }
        },
        Node::Slice { object, from, to } => {
            collect_identifiers(object, out);
            if let Some(from) = from {
                collect_identifiers(from, out);
            }
            if let Some(to) = to {
                collect_identifiers(to, out);
            }
        }
        Node::Call { args, .. } => args.iter().for_each(|a| collect_identifiers(a, out)),
        Node::Closure(body) => collect_identifiers(body, out),
        Node::Unary { operand, .. } => collect_identifiers(operand, out),
        Node::Binary { left, right, .. } => {
            collect_identifiers(left, out);
            collect_identifiers(right, out);
        }
        Node::Ternary {
            cond,
            then,
            otherwise,
        } => {
            collect_identifiers(cond, out);
            collect_identifiers(then, out);
            collect_identifiers(otherwise, out);
        }
        Node::Array(items) => items.iter().for_each(|i| collect_identifiers(i, out)),
        Node::Map(entries) => entries.iter().for_each(|(_, v)| collect_identifiers(v, out)),
        Node::Literal(_) | Node::Pointer => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let node = parse("1 + 2 * 3 == 7 && !false").unwrap();
        match node {
            Node::Binary { op, .. } => assert_eq!(op, "&&"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_member_path_and_call() {
        let node = parse("sprig.trunc(5, inputs.parameters.message)").unwrap();
        match node {
            Node::Call { callee, args } => {
                assert_eq!(callee, "sprig.trunc");
                assert_eq!(args[1].member_path().as_deref(), Some("inputs.parameters.message"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_identifiers_skip_callees() {
        let node = parse(r#"workflow.status == "Succeeded" ? asInt(retries) : item['x']"#).unwrap();
        assert_eq!(identifiers(&node), vec!["workflow.status", "retries", "item.x"]);
    }

    #[test]
    fn test_closure_argument() {
        let node = parse("filter(data, {# endsWith '.csv'})").unwrap();
        match node {
            Node::Call { args, .. } => assert!(matches!(args[1], Node::Closure(_))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse("!").is_err());
        assert!(parse("a +").is_err());
        assert!(parse("(1").is_err());
    }
}
