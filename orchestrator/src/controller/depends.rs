//! DAG `depends` expressions
//!
//! Grammar: `expr := term ('||' term)*`, `term := factor ('&&' factor)*`,
//! `factor := '!' factor | '(' expr ')' | task ['.' Result]`.
//! A bare task name means `Succeeded || Skipped || Daemoned`.

use std::fmt;

use crate::errors::WfError;

/// Outcome of a task that an operand tests for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Succeeded,
    Failed,
    Errored,
    Skipped,
    Omitted,
    Completed,
    Any,
    Daemoned,
    AnySucceeded,
    AllFailed,
}

impl TaskResult {
    fn parse(text: &str) -> Result<Self, WfError> {
        Ok(match text {
            "Succeeded" => TaskResult::Succeeded,
            "Failed" => TaskResult::Failed,
            "Errored" => TaskResult::Errored,
            "Skipped" => TaskResult::Skipped,
            "Omitted" => TaskResult::Omitted,
            "Completed" => TaskResult::Completed,
            "Any" => TaskResult::Any,
            "Daemoned" => TaskResult::Daemoned,
            "AnySucceeded" => TaskResult::AnySucceeded,
            "AllFailed" => TaskResult::AllFailed,
            other => {
                return Err(WfError::BadRequest(format!(
                    "unknown task result '{}' in depends expression",
                    other
                )))
            }
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskResult::Succeeded => "Succeeded",
            TaskResult::Failed => "Failed",
            TaskResult::Errored => "Errored",
            TaskResult::Skipped => "Skipped",
            TaskResult::Omitted => "Omitted",
            TaskResult::Completed => "Completed",
            TaskResult::Any => "Any",
            TaskResult::Daemoned => "Daemoned",
            TaskResult::AnySucceeded => "AnySucceeded",
            TaskResult::AllFailed => "AllFailed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Depends {
    /// `task.Result`; `None` is the bare form
    Operand { task: String, result: Option<TaskResult> },
    Not(Box<Depends>),
    And(Box<Depends>, Box<Depends>),
    Or(Box<Depends>, Box<Depends>),
}

impl Depends {
    /// Every task the expression refers to, in first-seen order
    pub fn tasks(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_tasks(&mut out);
        out
    }

    fn collect_tasks(&self, out: &mut Vec<String>) {
        match self {
            Depends::Operand { task, .. } => {
                if !out.contains(task) {
                    out.push(task.clone());
                }
            }
            Depends::Not(inner) => inner.collect_tasks(out),
            Depends::And(a, b) | Depends::Or(a, b) => {
                a.collect_tasks(out);
                b.collect_tasks(out);
            }
        }
    }

    /// Evaluate with `check(task, result)` answering each operand
    pub fn evaluate<F>(&self, check: &F) -> bool
    where
        F: Fn(&str, Option<TaskResult>) -> bool,
    {
        match self {
            Depends::Operand { task, result } => check(task, *result),
            Depends::Not(inner) => !inner.evaluate(check),
            Depends::And(a, b) => a.evaluate(check) && b.evaluate(check),
            Depends::Or(a, b) => a.evaluate(check) || b.evaluate(check),
        }
    }
}

impl fmt::Display for Depends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Depends::Operand { task, result: None } => write!(f, "{}", task),
            Depends::Operand { task, result: Some(r) } => write!(f, "{}.{}", task, r.as_str()),
            Depends::Not(inner) => write!(f, "!{}", inner),
            Depends::And(a, b) => write!(f, "({} && {})", a, b),
            Depends::Or(a, b) => write!(f, "({} || {})", a, b),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Dot,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(text: &str) -> Result<Vec<Token>, WfError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            c if c.is_alphanumeric() || c == '-' || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '-' || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(WfError::BadRequest(format!(
                    "unexpected '{}' in depends expression '{}'",
                    other, text
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    text: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, what: &str) -> WfError {
        WfError::BadRequest(format!("invalid depends expression '{}': {}", self.text, what))
    }

    fn expr(&mut self) -> Result<Depends, WfError> {
        let mut left = self.term()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.term()?;
            left = Depends::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Depends, WfError> {
        let mut left = self.factor()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.factor()?;
            left = Depends::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Depends, WfError> {
        match self.next() {
            Some(Token::Not) => Ok(Depends::Not(Box::new(self.factor()?))),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("missing ')'")),
                }
            }
            Some(Token::Ident(task)) => {
                let result = if self.peek() == Some(&Token::Dot) {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(result)) => Some(TaskResult::parse(&result)?),
                        _ => return Err(self.error("expected a task result after '.'")),
                    }
                } else {
                    None
                };
                Ok(Depends::Operand { task, result })
            }
            Some(token) => Err(self.error(&format!("unexpected {:?}", token))),
            None => Err(self.error("unexpected end")),
        }
    }
}

/// Parse a `depends` expression
pub fn parse(text: &str) -> Result<Depends, WfError> {
    let mut parser = Parser {
        tokens: tokenize(text)?,
        pos: 0,
        text,
    };
    let expr = parser.expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(parser.error("trailing input"));
    }
    Ok(expr)
}

/// Translate legacy `dependencies` into a `depends` expression
///
/// `continue_on(task)` returns the `(failed, error)` flags of the named task.
pub fn from_dependencies<F>(dependencies: &[String], continue_on: F) -> String
where
    F: Fn(&str) -> (bool, bool),
{
    dependencies
        .iter()
        .map(|dep| {
            let mut results = vec![
                format!("{}.Succeeded", dep),
                format!("{}.Skipped", dep),
                format!("{}.Daemoned", dep),
            ];
            let (failed, error) = continue_on(dep);
            if failed {
                results.push(format!("{}.Failed", dep));
            }
            if error {
                results.push(format!("{}.Errored", dep));
            }
            format!("({})", results.join(" || "))
        })
        .collect::<Vec<_>>()
        .join(" && ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_precedence() {
        let expr = parse("A.Succeeded && (B.Succeeded || C.Succeeded)").unwrap();
        assert_eq!(expr.tasks(), vec!["A", "B", "C"]);
        assert_eq!(expr.to_string(), "(A.Succeeded && (B.Succeeded || C.Succeeded))");

        let expr = parse("a || b && !c").unwrap();
        assert_eq!(expr.to_string(), "(a || (b && !c))");
    }

    #[test]
    fn test_evaluate() {
        let expr = parse("A.Succeeded && (B.Succeeded || C.Succeeded)").unwrap();
        let succeeded = |ok: &'static [&'static str]| {
            move |task: &str, result: Option<TaskResult>| {
                result == Some(TaskResult::Succeeded) && ok.contains(&task)
            }
        };
        assert!(expr.evaluate(&succeeded(&["A", "B"])));
        assert!(!expr.evaluate(&succeeded(&["A"])));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("A.Bogus").is_err());
        assert!(parse("(A").is_err());
        assert!(parse("A &&").is_err());
        assert!(parse("A B").is_err());
        assert!(parse("A & B").is_err());
    }

    #[test]
    fn test_from_dependencies() {
        let depends = from_dependencies(&["a".to_string(), "b".to_string()], |t| (t == "b", false));
        assert_eq!(
            depends,
            "(a.Succeeded || a.Skipped || a.Daemoned) && (b.Succeeded || b.Skipped || b.Daemoned || b.Failed)"
        );
        assert!(parse(&depends).is_ok());
        assert_eq!(from_dependencies(&[], |_| (false, false)), "");
    }
}
