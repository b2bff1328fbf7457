//! `when` conditions of steps and DAG tasks
//!
//! Conditions are evaluated after tag substitution, so operands are mostly
//! literal text. Bare words such as `heads` compare as strings.

use serde_json::Value;

use crate::errors::WfError;
use crate::expr::{self, builtins, Env};

/// Whether a step or task with this `when` condition runs
pub fn should_execute(when: &str) -> Result<bool, WfError> {
    let when = when.trim();
    if when.is_empty() {
        return Ok(true);
    }
    if when.contains("{{") {
        return Err(WfError::BadRequest(format!(
            "Invalid 'when' expression '{}': unresolved variable",
            when
        )));
    }
    let env = Env::new().with_bare_identifiers();
    match expr::eval(when, &env) {
        Ok(Value::Bool(b)) => Ok(b),
        Ok(other) => Err(WfError::BadRequest(format!(
            "Expected boolean evaluation for '{}'. Got {}",
            when,
            builtins::to_text(&other)
        ))),
        Err(e) => Err(WfError::BadRequest(format!(
            "Invalid 'when' expression '{}': {}",
            when, e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_condition_runs() {
        assert!(should_execute("").unwrap());
        assert!(should_execute("  ").unwrap());
    }

    #[test]
    fn test_bare_words() {
        assert!(should_execute("heads == heads").unwrap());
        assert!(!should_execute("tails == heads").unwrap());
        assert!(should_execute("tails != heads").unwrap());
    }

    #[test]
    fn test_numbers_and_logic() {
        assert!(should_execute("5 > 3").unwrap());
        assert!(should_execute("7 >= 7 && 2 < 3").unwrap());
        assert!(!should_execute("1 > 2 || false").unwrap());
        assert!(should_execute("'hello world' =~ '^hello'").unwrap());
    }

    #[test]
    fn test_errors() {
        let err = should_execute("{{steps.flip.outputs.result}} == heads").unwrap_err();
        assert!(err.to_string().contains("Invalid 'when' expression"));

        let err = should_execute("1 + 1").unwrap_err();
        assert!(err.to_string().contains("Expected boolean evaluation for '1 + 1'. Got 2"));

        let err = should_execute("(1 > ").unwrap_err();
        assert!(err.to_string().contains("Invalid 'when' expression"));
    }
}
