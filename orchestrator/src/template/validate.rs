//! Tag validation without substitution

use crate::errors::WfError;
use crate::template::expressions_enabled;
use crate::template::replace::{scan, Segment};

/// Call `validator` with the trimmed name of every simple tag in `text`
///
/// Expression tags are opaque here and are never passed to the validator.
pub fn validate<F>(text: &str, mut validator: F) -> Result<(), WfError>
where
    F: FnMut(&str) -> Result<(), WfError>,
{
    let expressions = expressions_enabled();
    for segment in scan(text)? {
        if let Segment::Tag(raw) = segment {
            let tag = raw.trim();
            if expressions && tag.starts_with('=') {
                continue;
            }
            validator(tag)?;
        }
    }
    Ok(())
}

/// Names of every simple tag in `text`, in order of appearance
pub fn simple_tags(text: &str) -> Result<Vec<String>, WfError> {
    let mut tags = Vec::new();
    validate(text, |tag| {
        tags.push(tag.to_string());
        Ok(())
    })?;
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_visits_simple_tags_only() {
        let tags = simple_tags("{{inputs.parameters.a}} and {{=asInt(b)}} and {{ steps.x.outputs.result }}")
            .unwrap();
        assert_eq!(tags, vec!["inputs.parameters.a", "steps.x.outputs.result"]);
    }

    #[test]
    fn test_validator_error_propagates() {
        let err = validate("{{unknown}}", |tag| {
            Err(WfError::BadRequest(format!("failed to resolve {{{{{}}}}}", tag)))
        })
        .unwrap_err();
        assert!(err.to_string().contains("{{unknown}}"));
    }

    #[test]
    fn test_malformed_template() {
        assert!(validate("{{ never closed", |_| Ok(())).is_err());
    }
}
