//! Slape Engine Library
//!
//! This library provides the core functionality of the Slape engine.
//! It is used by both the main binary and integration tests.

/// HTTP surface
pub mod api;

/// CLI interface module
pub mod cli;

/// Configuration management module
pub mod config;

/// Worker container lifecycle and the container runtime driver
pub mod container;

/// Daemon lifecycle and orphan recovery
pub mod daemon;

/// Worker registry persistence
pub mod db;

/// Inference client for OpenAI-compatible worker servers
pub mod llm;

/// Model file discovery
pub mod models;

/// Pipeline strategies and session state
pub mod pipeline;

/// Worker readiness gate
pub mod readiness;

/// Request deadlines and cancellation
pub mod scope;

/// Telemetry and Observability
pub mod telemetry;

/// In-memory fakes for the container runtime, inference and health probe
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
