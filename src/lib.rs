//! Conductor - orchestration engine for concurrent, streaming agent conversation sessions

pub mod cli;
pub mod config;
pub mod core;
pub mod db;
pub mod mcp;
pub mod orchestration;
pub mod session;
