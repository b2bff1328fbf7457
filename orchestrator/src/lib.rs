//! argoflow library
//!
//! Workflow controller, in-pod executor and the pieces they share.

pub mod app;
pub mod artifacts;
pub mod cache;
pub mod clock;
pub mod cluster;
pub mod controller;
pub mod data;
pub mod errors;
pub mod executor;
pub mod expr;
pub mod filesys;
pub mod logs;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod template;
pub mod utils;
pub mod webhook;
pub mod workers;
