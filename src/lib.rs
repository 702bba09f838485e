//! localchat library
//!
//! Local LLM inference orchestration: engine variants over llama.cpp
//! (CLI, server, in-process library, helper socket, mock), process
//! supervision, streaming output filtering and the single-flight generation
//! coordinator that feeds a persisted chat transcript.

pub mod chat;
pub mod inference;
pub mod logging;
pub mod storage;
pub mod system;
pub mod types;
