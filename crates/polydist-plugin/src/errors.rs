use crate::Phase;
use thiserror::Error;

/// Errors raised while loading, validating, resolving or invoking plugins.
///
/// Cloneable so a single in-flight load can hand the same outcome to every
/// waiter.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PluginError {
    #[error("plugin '{id}' not found")]
    NotFound { id: String },
    #[error("plugin '{id}' is invalid: {reason}")]
    Invalid { id: String, reason: String },
    #[error("plugin '{id}' failed to load: {message}")]
    Load { id: String, message: String },
    #[error("plugin '{plugin}' conflicts with '{conflicts_with}' in distribution '{distribution}'")]
    Conflict {
        plugin: String,
        conflicts_with: String,
        distribution: String,
    },
    #[error("plugin '{id}' does not implement the {phase} phase")]
    UnsupportedPhase { id: String, phase: Phase },
    #[error("{phase} handler received a context of the wrong kind")]
    ContextMismatch { phase: Phase },
    #[error("script '{path}' failed: {message}")]
    Script { path: String, message: String },
    #[error("plugin registry error: {0}")]
    Registry(String),
    #[error("{0}")]
    Handler(String),
}

impl PluginError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// The plugin id this error is about, when it names one.
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Self::NotFound { id }
            | Self::Invalid { id, .. }
            | Self::Load { id, .. }
            | Self::UnsupportedPhase { id, .. } => Some(id),
            Self::Conflict { plugin, .. } => Some(plugin),
            _ => None,
        }
    }
}
