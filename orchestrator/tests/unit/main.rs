//! Cross-module tests

mod kubelet;
mod test_scenarios;
mod test_workers;
