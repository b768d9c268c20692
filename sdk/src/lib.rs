//! Slape SDK
//!
//! Shared library providing the error taxonomy and HTTP wire types for Slape.
//! The engine uses it internally, and HTTP clients can depend on it for the
//! request and response shapes.

/// Error types and handling
pub mod errors;

/// HTTP wire types
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, SlapeErrorExt};
pub use types::{AnswerResponse, ErrorBody, GeneratePayload, ModelsResponse, SetupRequest};
