//! Error types for the stream-to-mesh backend

use thiserror::Error;

/// Result type for compilation operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Compilation errors
///
/// Every kind is fatal: this is an offline, single-pass backend with no
/// partial-success mode, so a failed stage aborts the compile.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Lexer error at position {position}: {message}")]
    LexerError { position: usize, message: String },

    #[error("Parser error: {message}")]
    ParseError { message: String },

    #[error("Graph invariant violated: {message}")]
    GraphInvariant { message: String },

    #[error("Unsupported topology: {message}")]
    UnsupportedTopology { message: String },

    #[error("Capacity exceeded: {message}")]
    CapacityExceeded { message: String },

    #[error("Resource unassigned: {message}")]
    ResourceUnassigned { message: String },
}

impl CompileError {
    pub fn parse_error(msg: impl Into<String>) -> Self {
        CompileError::ParseError { message: msg.into() }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        CompileError::GraphInvariant { message: msg.into() }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        CompileError::UnsupportedTopology { message: msg.into() }
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        CompileError::CapacityExceeded { message: msg.into() }
    }

    pub fn unassigned(msg: impl Into<String>) -> Self {
        CompileError::ResourceUnassigned { message: msg.into() }
    }
}
