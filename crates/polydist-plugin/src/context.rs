use crate::{Phase, PluginOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Template variables resolved for one operation.
pub type TemplateVariables = BTreeMap<String, String>;

/// Context handed to preprocess, transform and postprocess handlers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildContext {
    pub distribution: String,
    pub runtime: String,
    pub phase: Phase,
    pub root_dir: PathBuf,
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub options: PluginOptions,
    pub variables: TemplateVariables,
    pub dry_run: bool,
}

/// Context handed to setup handlers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupContext {
    pub distribution: String,
    pub runtime: String,
    pub root_dir: PathBuf,
    pub options: PluginOptions,
    pub variables: TemplateVariables,
    pub dry_run: bool,
}

/// Context handed to release handlers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseContext {
    pub distribution: String,
    pub runtime: String,
    pub root_dir: PathBuf,
    pub output_dir: PathBuf,
    pub versions: BTreeMap<String, String>,
    pub options: PluginOptions,
    pub variables: TemplateVariables,
    pub dry_run: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PhaseContext {
    Build(BuildContext),
    Setup(SetupContext),
    Release(ReleaseContext),
}

impl PhaseContext {
    pub fn distribution(&self) -> &str {
        match self {
            Self::Build(context) => &context.distribution,
            Self::Setup(context) => &context.distribution,
            Self::Release(context) => &context.distribution,
        }
    }

    /// Whether this context kind is the one `phase` handlers expect.
    pub fn matches_phase(&self, phase: Phase) -> bool {
        match self {
            Self::Build(context) => phase.is_build() && context.phase == phase,
            Self::Setup(_) => phase == Phase::Setup,
            Self::Release(_) => phase == Phase::Release,
        }
    }
}
