//! Unified error type for the Woodwork workspace.
//!
//! Parsing, resolution, component construction and orchestration all report
//! through [`WoodworkError`] so callers can match on the failure kind.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Why a declaration name was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForbiddenReason {
    /// The name is a boolean literal in some casing.
    Reserved,
    /// The name was already used by an earlier declaration.
    Duplicate,
}

impl fmt::Display for ForbiddenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reserved => write!(f, "boolean literals cannot be used as names"),
            Self::Duplicate => write!(f, "name is already declared"),
        }
    }
}

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum WoodworkError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration text is malformed.
    #[error("parse error on line {line}: {message}")]
    Parse {
        /// Description of the grammar violation.
        message: String,
        /// 1-based source line of the offending token.
        line: usize,
    },

    /// A declaration uses a reserved or already-declared name.
    #[error("forbidden variable name \"{name}\": {reason}")]
    ForbiddenVariableName {
        /// The rejected name as written.
        name: String,
        /// Which naming rule was violated.
        reason: ForbiddenReason,
    },

    /// A component reference names nothing declared before it.
    #[error("unresolved reference to \"{name}\" in declaration \"{referenced_by}\"")]
    UnresolvedReference {
        /// The referenced name.
        name: String,
        /// The declaration holding the reference.
        referenced_by: String,
    },

    /// A required configuration key is absent at construction time.
    #[error("component \"{component}\" is missing required config key \"{key}\"")]
    MissingConfigKey {
        /// Component being constructed.
        component: String,
        /// The missing key.
        key: String,
    },

    /// A configuration key holds a value of the wrong shape.
    #[error("component \"{component}\": config key \"{key}\" must be {expected}")]
    InvalidConfigValue {
        /// Component being constructed.
        component: String,
        /// The offending key.
        key: String,
        /// Human-readable description of the expected value.
        expected: &'static str,
    },

    /// A runtime configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A component failed while executing.
    #[error("component \"{component}\" failed: {message}")]
    Component {
        /// Name of the failing component.
        component: String,
        /// Description of the failure.
        message: String,
    },

    /// A generic execution failure outside any single component.
    #[error("runtime error: {message}")]
    Runtime {
        /// Description of the failure.
        message: String,
    },

    /// A stream ended before producing its final chunk.
    #[error("stream {stream} ended without a final chunk")]
    StreamTruncated {
        /// Identifier of the truncated stream.
        stream: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl WoodworkError {
    /// Builds a [`WoodworkError::Component`] from any displayable failure.
    pub fn component(component: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Component {
            component: component.into(),
            message: message.to_string(),
        }
    }

    /// Builds a [`WoodworkError::Runtime`] from any displayable failure.
    pub fn runtime(message: impl fmt::Display) -> Self {
        Self::Runtime {
            message: message.to_string(),
        }
    }

    /// Returns `true` for errors raised while reading configuration text.
    pub const fn is_parse_failure(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. } | Self::ForbiddenVariableName { .. } | Self::UnresolvedReference { .. }
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, WoodworkError>;
