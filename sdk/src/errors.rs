//! Error types and handling
//!
//! This module provides the error types used throughout the Slape engine.
//! All errors implement the `SlapeErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! # Security
//!
//! Hints are static strings. Driver output (container runtime messages,
//! worker response bodies) stays in the `Display` text, which is logged but
//! never sent to remote callers.

use thiserror::Error;

/// Trait for Slape error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait SlapeErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to HTTP callers and does not contain
    /// container ids, host paths or raw runtime output.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried after the caller fixes the request
    /// or the environment. Non-recoverable errors point at a configuration
    /// problem or a bug and need manual intervention.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Setup**: image pull, worker creation, worker start
/// - **Serving**: readiness timeout, generation failure
/// - **Teardown**: shutdown failures (logged, never propagated by sessions)
/// - **Session**: invalid transitions, busy sessions, double template fill
/// - **Scope**: request deadline and cancellation
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, SlapeErrorExt};
///
/// let error = EngineError::SessionBusy;
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
///
/// let fatal_error = EngineError::TemplateAlreadyFilled;
/// assert!(!fatal_error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Setup errors
    #[error("Failed to pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("Failed to create worker {index}: {reason} (warnings: {warnings:?})")]
    WorkerCreation {
        index: usize,
        reason: String,
        warnings: Vec<String>,
    },

    #[error("Failed to start worker {index}: {reason}")]
    WorkerStart { index: usize, reason: String },

    // Serving errors
    #[error("Worker at {endpoint} not ready after {waited_ms}ms")]
    ReadinessTimeout { endpoint: String, waited_ms: u64 },

    #[error("Generation failed: {0}")]
    Generation(String),

    // Teardown errors
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // Container runtime errors outside the setup steps
    #[error("Container runtime error: {0}")]
    Runtime(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // Request validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("A slape service is answering on {0}")]
    DaemonRunning(String),

    // Session errors
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("System prompt already filled for this round")]
    TemplateAlreadyFilled,

    #[error("Session is busy")]
    SessionBusy,

    #[error("Session is not set up")]
    NotSetUp,

    #[error("Session is already set up")]
    AlreadySetUp,

    // Scope errors
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Operation cancelled")]
    Cancelled,

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SlapeErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            // Setup errors
            Self::ImagePull { .. } => {
                "Could not pull the worker image. Check the container runtime and network"
            }
            Self::WorkerCreation { .. } => {
                "Could not create a worker. Check that the model file exists"
            }
            Self::WorkerStart { .. } => "Could not start a worker. Check that the port is free",

            // Serving errors
            Self::ReadinessTimeout { .. } => "Worker did not become ready in time. Try again",
            Self::Generation(_) => "Error getting generation from model",

            // Teardown errors
            Self::Shutdown(_) => "Worker teardown incomplete. Run 'slape reconcile'",

            Self::Config(_) => "Check your config.toml file for errors",
            Self::Database(_) => "Worker registry unavailable. Try restarting the service",
            Self::Runtime(_) => "Container runtime unavailable. Is Docker running?",
            Self::Network(_) => "Network operation failed. Check your connection",
            Self::InvalidRequest(_) => "Error unexpected request format",
            Self::DaemonRunning(_) => {
                "Stop the running service first, or use --dry-run to only list orphans"
            }

            // Session errors
            Self::InvalidTransition { .. } => "Pipeline is in the wrong state for this request",
            Self::TemplateAlreadyFilled => "Internal prompt error. Please report this",
            Self::SessionBusy => "Pipeline is handling another request. Try again shortly",
            Self::NotSetUp => "Pipeline is not set up. Call the setup endpoint first",
            Self::AlreadySetUp => "Pipeline is already set up. Shut it down first",

            // Scope errors
            Self::DeadlineExceeded => "Request took too long. Try a smaller mode or fewer models",
            Self::Cancelled => "Request was cancelled",

            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Config(_) | Self::TemplateAlreadyFilled | Self::InvalidTransition { .. } => {
                false
            }

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}
