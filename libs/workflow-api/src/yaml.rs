//! Loading resources from YAML or JSON, including multi-document YAML

use serde::de::DeserializeOwned;

/// Errors raised while parsing manifests
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to parse document {index}: {source}")]
    Yaml {
        index: usize,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Split a multi-document YAML stream on `\n---` separators, dropping empty documents
pub fn split_documents(text: &str) -> Vec<&str> {
    let mut documents = Vec::new();
    let mut rest = text;
    loop {
        match rest.find("\n---") {
            Some(index) => {
                documents.push(&rest[..index]);
                let after = &rest[index + 4..];
                // drop the remainder of the separator line
                rest = match after.find('\n') {
                    Some(eol) => &after[eol + 1..],
                    None => "",
                };
            }
            None => {
                documents.push(rest);
                break;
            }
        }
    }
    documents
        .into_iter()
        .map(|d| d.strip_prefix("---\n").unwrap_or(d))
        .filter(|d| d.lines().any(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#')))
        .collect()
}

/// Parse every document of a YAML stream, or a single JSON document
pub fn parse_all<T: DeserializeOwned>(text: &str) -> Result<Vec<T>, ManifestError> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(vec![serde_json::from_str(trimmed)?]);
    }
    split_documents(text)
        .into_iter()
        .enumerate()
        .map(|(index, doc)| serde_yaml::from_str(doc).map_err(|source| ManifestError::Yaml { index, source }))
        .collect()
}

/// Parse exactly one document
pub fn parse_one<T: DeserializeOwned>(text: &str) -> Result<T, ManifestError> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    serde_yaml::from_str(text).map_err(|source| ManifestError::Yaml { index: 0, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Workflow;

    #[test]
    fn test_split_documents() {
        let text = "a: 1\n---\nb: 2\n--- # trailing comment\n\n---\nc: 3\n";
        let docs = split_documents(text);
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0], "a: 1");
        assert!(docs[2].starts_with("c: 3"));
    }

    #[test]
    fn test_parse_all_workflows() {
        let text = r#"apiVersion: argoproj.io/v1alpha1
kind: Workflow
metadata:
  name: one
spec:
  entrypoint: main
---
apiVersion: argoproj.io/v1alpha1
kind: Workflow
metadata:
  name: two
spec:
  entrypoint: main
"#;
        let workflows: Vec<Workflow> = parse_all(text).unwrap();
        assert_eq!(workflows.len(), 2);
        assert_eq!(workflows[1].metadata.name, "two");
    }

    #[test]
    fn test_parse_json() {
        let workflows: Vec<Workflow> = parse_all(r#"{"metadata":{"name":"j"}}"#).unwrap();
        assert_eq!(workflows[0].metadata.name, "j");
    }
}
