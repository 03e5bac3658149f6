use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Preprocess,
    Transform,
    Postprocess,
    Setup,
    Release,
}

impl Phase {
    pub const BUILD: [Phase; 3] = [Phase::Preprocess, Phase::Transform, Phase::Postprocess];
    pub const ALL: [Phase; 5] = [
        Phase::Preprocess,
        Phase::Transform,
        Phase::Postprocess,
        Phase::Setup,
        Phase::Release,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preprocess => "preprocess",
            Self::Transform => "transform",
            Self::Postprocess => "postprocess",
            Self::Setup => "setup",
            Self::Release => "release",
        }
    }

    pub fn is_build(self) -> bool {
        matches!(self, Self::Preprocess | Self::Transform | Self::Postprocess)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == value.trim())
            .ok_or_else(|| format!("unknown phase '{value}'"))
    }
}

/// Outcome of one phase handler, or of a whole phase once aggregated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl PhaseResult {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_affected_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.affected_files.push(path.into());
        self
    }

    pub fn with_affected_files<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.affected_files.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}
