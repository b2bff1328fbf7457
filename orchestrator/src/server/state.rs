//! Server state

use std::sync::Arc;

use crate::webhook::{EventDispatcher, Verifier};

/// Server state shared across handlers
pub struct ServerState {
    pub verifier: Arc<Verifier>,
    pub dispatcher: Arc<dyn EventDispatcher>,
}

impl ServerState {
    pub fn new(verifier: Arc<Verifier>, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        Self {
            verifier,
            dispatcher,
        }
    }
}
