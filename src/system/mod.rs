//! System utilities
//!
//! Detection of GPU acceleration support for the external inference binaries.

pub mod gpu;
