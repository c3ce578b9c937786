//! Error types for language server sessions
//!
//! Each layer has its own `thiserror` enum; [`LspError`] joins them at the
//! public API boundary.

use std::path::PathBuf;
use std::time::Duration;

use crate::io::process::ProcessError;
use crate::lsp::capabilities::Feature;
use crate::lsp::rpc::RpcError;

// ============================================================================
// Session Errors
// ============================================================================

/// Errors returned by [`crate::LanguageServer`] operations
#[derive(Debug, thiserror::Error)]
pub enum LspError {
    /// The server process could not be started
    #[error("Failed to launch language server: {0}")]
    Launch(#[from] ProcessError),

    /// JSON-RPC level failure (remote error, timeout, crash, protocol)
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Operation requires a ready session
    #[error("Language server session is not ready (state: {state})")]
    NotReady { state: String },

    /// The server did not advertise the capability backing a query
    #[error("Language server does not support {0}")]
    UnsupportedCapability(Feature),

    /// Edit or change against a document that is not open
    #[error("Document is not open: {path}")]
    DocumentNotOpen { path: PathBuf },

    /// Position outside the document, or inside a UTF-16 surrogate pair
    #[error("Invalid position {line}:{character} in {path}")]
    InvalidPosition {
        path: PathBuf,
        line: u32,
        character: u32,
    },

    /// Document content could not be read from disk
    #[error("Failed to read {path}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Path cannot be expressed as a `file:` URI or escapes the workspace
    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Invalid session state transition
    #[error("Invalid session state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl LspError {
    /// Whether the session is unusable after this error
    pub fn is_fatal(&self) -> bool {
        match self {
            LspError::Launch(_) => true,
            LspError::Rpc(error) => error.is_fatal(),
            _ => false,
        }
    }

    /// Create a not-ready error
    pub fn not_ready(state: impl Into<String>) -> Self {
        Self::NotReady {
            state: state.into(),
        }
    }

    /// Create an invalid path error
    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid transition error
    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            to: to.into(),
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration validation and building errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Missing required configuration field
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// Workspace root validation error
    #[error("Workspace root validation failed: {root}")]
    RootValidation {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid server command
    #[error("Invalid server command '{command}': {reason}")]
    InvalidCommand { command: String, reason: String },

    /// Invalid timeout value
    #[error("Invalid timeout: {timeout:?} - {reason}")]
    InvalidTimeout { timeout: Duration, reason: String },
}

impl ConfigError {
    /// Create a missing field error
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Create an invalid command error
    pub fn invalid_command(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCommand {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid timeout error
    pub fn invalid_timeout(timeout: Duration, reason: impl Into<String>) -> Self {
        Self::InvalidTimeout {
            timeout,
            reason: reason.into(),
        }
    }
}
