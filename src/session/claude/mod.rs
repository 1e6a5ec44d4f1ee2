//! Claude Code CLI backend

pub mod client;
pub mod parser;

pub use client::{ClaudeBackend, ClaudeBackendFactory};
pub use parser::StreamJsonParser;
