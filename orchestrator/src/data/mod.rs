//! Data templates: a source followed by expression transformations
//!
//! The only source is a listing of artifact keys. Each transformation step
//! is one expression evaluated with `data` bound to the previous value.

use serde_json::Value;
use tracing::{debug, info};
use workflow_api::template::{DataSource, DataTemplate, TransformationStep};

use crate::artifacts::DriverFactory;
use crate::errors::WfError;
use crate::expr::{Env, Program};

/// Produce the initial value of the pipeline
pub async fn source_data(source: &DataSource, factory: &dyn DriverFactory) -> Result<Value, WfError> {
    match &source.artifact_paths {
        Some(paths) => {
            let driver = factory.new_driver(&paths.artifact).await?;
            let keys = driver.list_objects(&paths.artifact).await?;
            info!("Listed {} objects for artifact {}", keys.len(), paths.artifact.name);
            Ok(Value::Array(keys.into_iter().map(Value::String).collect()))
        }
        None => Err(WfError::BadRequest("data template has no source".to_string())),
    }
}

/// Run the transformation steps in order
pub fn transform(steps: &[TransformationStep], mut data: Value) -> Result<Value, WfError> {
    let env = Env::new();
    for (i, step) in steps.iter().enumerate() {
        if step.expression.trim().is_empty() {
            return Err(WfError::BadRequest(format!("transformation step {} has no expression", i)));
        }
        let program = Program::compile(&step.expression)?;
        data = program.run_with_data(&env, data)?;
        debug!("transformation step {} applied", i);
    }
    Ok(data)
}

/// Evaluate a data template; the result is the JSON encoding of the final value
pub async fn process(template: &DataTemplate, factory: &dyn DriverFactory) -> Result<String, WfError> {
    let data = source_data(&template.source, factory).await?;
    let data = transform(&template.transformation, data)?;
    Ok(serde_json::to_string(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::testing::StaticResources;
    use crate::artifacts::DefaultDriverFactory;
    use serde_json::json;
    use std::sync::Arc;
    use workflow_api::artifact::{ArtifactLocation, VolumeArtifact};
    use workflow_api::template::ArtifactPaths;
    use workflow_api::Artifact;

    fn step(expression: &str) -> TransformationStep {
        TransformationStep {
            expression: expression.to_string(),
        }
    }

    #[test]
    fn test_steps_apply_in_order() {
        let data = json!(["a.csv", "b.txt", "c.csv"]);
        let out = transform(
            &[step("filter(data, {# endsWith '.csv'})"), step("map(data, {# + '!'})")],
            data,
        )
        .unwrap();
        assert_eq!(out, json!(["a.csv!", "c.csv!"]));
    }

    #[test]
    fn test_empty_expression_is_rejected() {
        let err = transform(&[step(" ")], json!([])).unwrap_err();
        assert!(matches!(err, WfError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_artifact_paths_source() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("data/inputs");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("one.csv"), "1").unwrap();
        std::fs::write(dir.join("two.txt"), "2").unwrap();

        let factory = DefaultDriverFactory::new(Arc::new(StaticResources::default()))
            .with_volume_root(root.path());
        let template = DataTemplate {
            source: DataSource {
                artifact_paths: Some(ArtifactPaths {
                    artifact: Artifact {
                        name: "inputs".to_string(),
                        location: ArtifactLocation {
                            volume: Some(VolumeArtifact {
                                name: "data".to_string(),
                                path: "inputs".to_string(),
                            }),
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                }),
            },
            transformation: vec![step("filter(data, {# endsWith '.csv'})")],
        };
        let result = process(&template, &factory).await.unwrap();
        assert_eq!(result, r#"["inputs/one.csv"]"#);
    }
}
