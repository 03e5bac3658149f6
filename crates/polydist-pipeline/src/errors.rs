use polydist_plugin::PluginError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("duplicate operation '{0}'")]
    DuplicateOperation(String),
    #[error("wave computation stalled with {remaining} operation(s) left: {detail}")]
    WaveInvariant { remaining: usize, detail: String },
    #[error("unknown distribution '{0}'")]
    UnknownDistribution(String),
    #[error("failed to prepare '{path}': {message}")]
    Io { path: String, message: String },
    #[error(transparent)]
    Plugin(#[from] PluginError),
}

impl PipelineError {
    /// Cycle, duplicate and wave errors: the graph itself is unusable.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Cycle { .. } | Self::DuplicateOperation(_) | Self::WaveInvariant { .. }
        )
    }
}
