//! File system helpers

pub mod archive;
pub mod dir;
pub mod file;
