//! Shared error types for the shapeshift workspace.
pub mod errors;
