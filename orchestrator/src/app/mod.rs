//! Process wiring: options, environment and the controller run loop

pub mod env;
pub mod options;
pub mod run;
