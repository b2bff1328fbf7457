//! Declared span hierarchy of the executor
//!
//! Every span is a root, may appear under any parent, or names the spans it
//! may be started under. [`validate_catalog`] runs at startup; [`Tracer`]
//! checks parentage when a span starts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{error, info_span, Span};

use super::attributes::{self, ATTRIB_ARTIFACT_ARCHIVE, ATTRIB_ARTIFACT_PATH, ATTRIB_WORKFLOW_NAME, ATTRIB_WORKFLOW_NAMESPACE};
use crate::errors::WfError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanDef {
    pub name: &'static str,
    pub root: bool,
    pub any_parent: bool,
    pub parents: &'static [&'static str],
    pub attributes: &'static [&'static str],
}

pub const RUN_INIT_CONTAINER: SpanDef = SpanDef {
    name: "runInitContainer",
    root: true,
    any_parent: false,
    parents: &[],
    attributes: &[ATTRIB_WORKFLOW_NAME, ATTRIB_WORKFLOW_NAMESPACE],
};

pub const LOAD_ARTIFACTS: SpanDef = SpanDef {
    name: "loadArtifacts",
    root: false,
    any_parent: false,
    parents: &["runInitContainer"],
    attributes: &[],
};

pub const LOAD_ARTIFACT: SpanDef = SpanDef {
    name: "loadArtifact",
    root: false,
    any_parent: false,
    parents: &["loadArtifacts"],
    attributes: &[ATTRIB_ARTIFACT_PATH],
};

pub const UNARCHIVE_ARTIFACT: SpanDef = SpanDef {
    name: "unarchiveArtifact",
    root: false,
    any_parent: false,
    parents: &["loadArtifact"],
    attributes: &[ATTRIB_ARTIFACT_ARCHIVE],
};

pub const RUN_WAIT_CONTAINER: SpanDef = SpanDef {
    name: "runWaitContainer",
    root: true,
    any_parent: false,
    parents: &[],
    attributes: &[ATTRIB_WORKFLOW_NAME, ATTRIB_WORKFLOW_NAMESPACE],
};

pub const SAVE_ARTIFACTS: SpanDef = SpanDef {
    name: "saveArtifacts",
    root: false,
    any_parent: false,
    parents: &["runWaitContainer"],
    attributes: &[],
};

pub const SAVE_ARTIFACT: SpanDef = SpanDef {
    name: "saveArtifact",
    root: false,
    any_parent: false,
    parents: &["saveArtifacts"],
    attributes: &[ATTRIB_ARTIFACT_PATH],
};

pub const ARCHIVE_ARTIFACT: SpanDef = SpanDef {
    name: "archiveArtifact",
    root: false,
    any_parent: false,
    parents: &["saveArtifact"],
    attributes: &[ATTRIB_ARTIFACT_ARCHIVE],
};

pub const CREATE_TASK_RESULT: SpanDef = SpanDef {
    name: "createTaskResult",
    root: false,
    any_parent: false,
    parents: &["runWaitContainer"],
    attributes: &[],
};

pub const PATCH_TASK_RESULT: SpanDef = SpanDef {
    name: "patchTaskResult",
    root: false,
    any_parent: false,
    parents: &["runWaitContainer"],
    attributes: &[],
};

pub const PATCH_TASK_RESULT_LABELS: SpanDef = SpanDef {
    name: "patchTaskResultLabels",
    root: false,
    any_parent: false,
    parents: &["runWaitContainer"],
    attributes: &[],
};

pub const WAIT_WORKLOAD: SpanDef = SpanDef {
    name: "waitWorkload",
    root: false,
    any_parent: false,
    parents: &["runWaitContainer"],
    attributes: &[],
};

pub const CATALOG: &[SpanDef] = &[
    RUN_INIT_CONTAINER,
    LOAD_ARTIFACTS,
    LOAD_ARTIFACT,
    UNARCHIVE_ARTIFACT,
    RUN_WAIT_CONTAINER,
    SAVE_ARTIFACTS,
    SAVE_ARTIFACT,
    ARCHIVE_ARTIFACT,
    CREATE_TASK_RESULT,
    PATCH_TASK_RESULT,
    PATCH_TASK_RESULT_LABELS,
    WAIT_WORKLOAD,
];

/// Check parentage rules of a span catalog
pub fn validate_catalog(catalog: &[SpanDef]) -> Result<(), WfError> {
    let mut names = BTreeSet::new();
    for def in catalog {
        if !names.insert(def.name) {
            return Err(WfError::Internal(format!("span {} declared twice", def.name)));
        }
    }

    let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for def in catalog {
        let flags = usize::from(def.root) + usize::from(def.any_parent) + usize::from(!def.parents.is_empty());
        if flags != 1 {
            return Err(WfError::Internal(format!(
                "span {} must be exactly one of root, any-parent, or have parents",
                def.name
            )));
        }
        for parent in def.parents {
            if !names.contains(parent) {
                return Err(WfError::Internal(format!(
                    "span {} has undeclared parent {}",
                    def.name, parent
                )));
            }
            edges.entry(def.name).or_default().push(parent);
        }
        for attribute in def.attributes {
            if attributes::find(attribute).is_none() {
                return Err(WfError::Internal(format!(
                    "span {} uses undeclared attribute {}",
                    def.name, attribute
                )));
            }
        }
    }

    // depth-first search over child -> parent edges
    fn visit<'a>(
        name: &'a str,
        edges: &BTreeMap<&'a str, Vec<&'a str>>,
        visiting: &mut BTreeSet<&'a str>,
        done: &mut BTreeSet<&'a str>,
    ) -> Result<(), WfError> {
        if done.contains(name) {
            return Ok(());
        }
        if !visiting.insert(name) {
            return Err(WfError::Internal(format!("span parentage cycle through {}", name)));
        }
        for parent in edges.get(name).map(Vec::as_slice).unwrap_or_default() {
            visit(parent, edges, visiting, done)?;
        }
        visiting.remove(name);
        done.insert(name);
        Ok(())
    }

    let mut visiting = BTreeSet::new();
    let mut done = BTreeSet::new();
    for def in catalog {
        visit(def.name, &edges, &mut visiting, &mut done)?;
    }
    Ok(())
}

/// A started span together with its declaration
pub struct TraceSpan {
    def: SpanDef,
    span: Span,
}

impl TraceSpan {
    pub fn name(&self) -> &'static str {
        self.def.name
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// Starts declared spans and reports undeclared parentage
#[derive(Default)]
pub struct Tracer {
    violations: AtomicUsize,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `def` under `parent`, with `attributes` as `(name, value)` pairs
    pub fn start(&self, def: SpanDef, parent: Option<&TraceSpan>, attributes: &[(&str, &str)]) -> TraceSpan {
        let parent_name = parent.map(TraceSpan::name);
        let allowed = match parent_name {
            None => def.root || def.any_parent,
            Some(name) => def.any_parent || def.parents.contains(&name),
        };
        if !allowed {
            self.violations.fetch_add(1, Ordering::SeqCst);
            error!(
                start_method = def.name,
                expected_parents = %def.parents.join(", "),
                actual_parent = parent_name.unwrap_or(""),
                "incorrect trace parentage"
            );
        }

        let attributes = attributes
            .iter()
            .filter(|(name, _)| def.attributes.contains(name))
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(" ");
        let span = match parent {
            Some(p) => info_span!(parent: &p.span, "span", otel.name = def.name, attributes = %attributes),
            None => info_span!("span", otel.name = def.name, attributes = %attributes),
        };
        TraceSpan { def, span }
    }

    /// Number of spans started under an undeclared parent
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_is_valid() {
        validate_catalog(CATALOG).unwrap();
    }

    #[test]
    fn test_cycle_rejected() {
        let a = SpanDef {
            name: "a",
            root: false,
            any_parent: false,
            parents: &["b"],
            attributes: &[],
        };
        let b = SpanDef {
            name: "b",
            root: false,
            any_parent: false,
            parents: &["a"],
            attributes: &[],
        };
        let err = validate_catalog(&[a, b]).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_span_needs_exactly_one_rule() {
        let orphan = SpanDef {
            name: "orphan",
            root: false,
            any_parent: false,
            parents: &[],
            attributes: &[],
        };
        assert!(validate_catalog(&[orphan]).is_err());

        let unknown_parent = SpanDef {
            parents: &["missing"],
            ..orphan
        };
        assert!(validate_catalog(&[unknown_parent]).is_err());
    }

    #[test]
    fn test_tracer_parentage() {
        let tracer = Tracer::new();
        let init = tracer.start(RUN_INIT_CONTAINER, None, &[(ATTRIB_WORKFLOW_NAME, "wf")]);
        let load = tracer.start(LOAD_ARTIFACTS, Some(&init), &[]);
        let one = tracer.start(LOAD_ARTIFACT, Some(&load), &[(ATTRIB_ARTIFACT_PATH, "/tmp/a")]);
        tracer.start(UNARCHIVE_ARTIFACT, Some(&one), &[(ATTRIB_ARTIFACT_ARCHIVE, "tar.gz")]);
        assert_eq!(tracer.violations(), 0);

        tracer.start(SAVE_ARTIFACT, Some(&init), &[]);
        tracer.start(WAIT_WORKLOAD, None, &[]);
        assert_eq!(tracer.violations(), 2);
    }
}
