//! Domain primitive types used across the Woodwork workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier correlating every event produced during one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a session ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random session ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an output stream on the message bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Creates a stream ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random stream ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a component instance.
///
/// ```text
/// Created -> Initializing -> Initialized -> Starting -> Started
///    \___________\________________\______________\
///                                                 -> Failed(reason)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Constructed but not yet initialized.
    Created,
    /// Init work is in progress.
    Initializing,
    /// Init finished.
    Initialized,
    /// Start work is in progress.
    Starting,
    /// Fully started and ready for orchestration.
    Started,
    /// A phase failed; the component takes no further part in the run.
    Failed(String),
}

impl LifecycleState {
    /// Returns `true` once no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Started | Self::Failed(_))
    }

    /// Returns `true` if moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Started | Self::Failed(_), _) => false,
            (_, Self::Failed(_))
            | (Self::Created, Self::Initializing)
            | (Self::Initializing, Self::Initialized)
            | (Self::Initialized, Self::Starting)
            | (Self::Starting, Self::Started) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Initializing => write!(f, "initializing"),
            Self::Initialized => write!(f, "initialized"),
            Self::Starting => write!(f, "starting"),
            Self::Started => write!(f, "started"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Lifecycle phase a progress update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// The init phase.
    Init,
    /// The start phase.
    Start,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Start => write!(f, "start"),
        }
    }
}

/// A single progress report emitted during the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Component the update refers to.
    pub component: String,
    /// Phase being reported.
    pub phase: Phase,
    /// Completion of the phase, 0 to 100.
    pub percent: u8,
    /// Lifecycle state at the time of the report.
    pub state: LifecycleState,
}
