//! Attribute and metric declarations

use crate::errors::WfError;

pub const ATTRIB_ARTIFACT_ARCHIVE: &str = "artifact_archive";
pub const ATTRIB_ARTIFACT_PATH: &str = "artifact_path";
pub const ATTRIB_NODE_ID: &str = "node_id";
pub const ATTRIB_POD_NAME: &str = "pod_name";
pub const ATTRIB_WORKFLOW_NAME: &str = "workflow_name";
pub const ATTRIB_WORKFLOW_NAMESPACE: &str = "workflow_namespace";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeDef {
    pub name: &'static str,
    pub description: &'static str,
}

pub const ATTRIBUTES: &[AttributeDef] = &[
    AttributeDef {
        name: ATTRIB_ARTIFACT_ARCHIVE,
        description: "Archive strategy of the artifact being packed or unpacked",
    },
    AttributeDef {
        name: ATTRIB_ARTIFACT_PATH,
        description: "Local path of the artifact",
    },
    AttributeDef {
        name: ATTRIB_NODE_ID,
        description: "ID of the workflow node",
    },
    AttributeDef {
        name: ATTRIB_POD_NAME,
        description: "Name of the pod",
    },
    AttributeDef {
        name: ATTRIB_WORKFLOW_NAME,
        description: "Name of the workflow",
    },
    AttributeDef {
        name: ATTRIB_WORKFLOW_NAMESPACE,
        description: "Namespace of the workflow",
    },
];

pub fn find(name: &str) -> Option<&'static AttributeDef> {
    ATTRIBUTES.iter().find(|a| a.name == name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instrument {
    Counter,
    Gauge,
    Histogram,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricDef {
    pub name: &'static str,
    pub description: &'static str,
    pub unit: &'static str,
    pub instrument: Instrument,
    pub default_buckets: &'static [f64],
    pub attributes: &'static [&'static str],
}

pub const METRICS: &[MetricDef] = &[
    MetricDef {
        name: "operation_duration_seconds",
        description: "Duration of one workflow reconciliation",
        unit: "s",
        instrument: Instrument::Histogram,
        default_buckets: &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
        attributes: &[],
    },
    MetricDef {
        name: "pod_cleanup_actions_total",
        description: "Pod cleanup actions carried out",
        unit: "{action}",
        instrument: Instrument::Counter,
        default_buckets: &[],
        attributes: &[ATTRIB_POD_NAME],
    },
    MetricDef {
        name: "queue_depth",
        description: "Keys waiting in a work queue",
        unit: "{item}",
        instrument: Instrument::Gauge,
        default_buckets: &[],
        attributes: &[],
    },
    MetricDef {
        name: "workflows_completed_total",
        description: "Workflows that reached a terminal phase",
        unit: "{workflow}",
        instrument: Instrument::Counter,
        default_buckets: &[],
        attributes: &[ATTRIB_WORKFLOW_NAMESPACE],
    },
];

fn check_description(kind: &str, name: &str, description: &str) -> Result<(), WfError> {
    if description.trim().is_empty() || description.contains('\n') {
        return Err(WfError::Internal(format!(
            "{} {} must have a single-line description",
            kind, name
        )));
    }
    Ok(())
}

pub fn validate_attributes(attributes: &[AttributeDef]) -> Result<(), WfError> {
    for pair in attributes.windows(2) {
        if pair[0].name >= pair[1].name {
            return Err(WfError::Internal(format!(
                "attribute {} must sort after {}",
                pair[1].name, pair[0].name
            )));
        }
    }
    for attribute in attributes {
        check_description("attribute", attribute.name, attribute.description)?;
    }
    Ok(())
}

pub fn validate_metrics(metrics: &[MetricDef], attributes: &[AttributeDef]) -> Result<(), WfError> {
    for metric in metrics {
        check_description("metric", metric.name, metric.description)?;
        match metric.instrument {
            Instrument::Histogram => {
                if metric.default_buckets.is_empty() {
                    return Err(WfError::Internal(format!("histogram {} has no default buckets", metric.name)));
                }
                if metric.default_buckets.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(WfError::Internal(format!(
                        "histogram {} buckets must be increasing",
                        metric.name
                    )));
                }
            }
            _ if !metric.default_buckets.is_empty() => {
                return Err(WfError::Internal(format!(
                    "metric {} declares buckets but is not a histogram",
                    metric.name
                )));
            }
            _ => {}
        }
        for name in metric.attributes {
            if !attributes.iter().any(|a| a.name == *name) {
                return Err(WfError::Internal(format!(
                    "metric {} uses undeclared attribute {}",
                    metric.name, name
                )));
            }
        }
    }
    Ok(())
}
