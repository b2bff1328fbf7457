//! Span, attribute and metric declarations checked at startup

pub mod attributes;
pub mod spans;

pub use spans::{TraceSpan, Tracer};

use crate::errors::WfError;

/// Validate every built-in catalog
pub fn validate() -> Result<(), WfError> {
    attributes::validate_attributes(attributes::ATTRIBUTES)?;
    attributes::validate_metrics(attributes::METRICS, attributes::ATTRIBUTES)?;
    spans::validate_catalog(spans::CATALOG)
}
