use crate::{Phase, PluginReference};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_SOURCE_DIR: &str = "src";
pub const DEFAULT_OUTPUT_ROOT: &str = "dist";

/// Project-wide configuration: where sources live, where distributions are
/// written, and the per-distribution settings keyed by distribution name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub root_dir: PathBuf,
    pub source_dir: PathBuf,
    pub output_root: PathBuf,
    pub dry_run: bool,
    pub variables: BTreeMap<String, String>,
    pub distributions: BTreeMap<String, DistributionConfig>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            source_dir: PathBuf::from(DEFAULT_SOURCE_DIR),
            output_root: PathBuf::from(DEFAULT_OUTPUT_ROOT),
            dry_run: false,
            variables: BTreeMap::new(),
            distributions: BTreeMap::new(),
        }
    }
}

impl ProjectConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_distribution(
        mut self,
        name: impl Into<String>,
        distribution: DistributionConfig,
    ) -> Self {
        self.distributions.insert(name.into(), distribution);
        self
    }

    pub fn distribution(&self, name: &str) -> Option<&DistributionConfig> {
        self.distributions.get(name)
    }

    pub fn distribution_names(&self) -> Vec<String> {
        self.distributions.keys().cloned().collect()
    }

    pub fn source_path(&self) -> PathBuf {
        resolve_path(&self.root_dir, &self.source_dir)
    }

    /// Output location for a distribution: its explicit `output_dir`, or
    /// `<output_root>/<name>`, both relative to the project root.
    pub fn output_path(&self, name: &str) -> PathBuf {
        match self
            .distributions
            .get(name)
            .and_then(|distribution| distribution.output_dir.as_ref())
        {
            Some(output_dir) => resolve_path(&self.root_dir, output_dir),
            None => resolve_path(&self.root_dir, &self.output_root).join(name),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    pub runtime: String,
    pub plugins: Vec<PluginReference>,
    pub scripts: ScriptPaths,
    pub versions: BTreeMap<String, String>,
    pub variables: BTreeMap<String, String>,
    pub output_dir: Option<PathBuf>,
}

impl DistributionConfig {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            ..Self::default()
        }
    }

    pub fn with_plugin(mut self, reference: impl Into<PluginReference>) -> Self {
        self.plugins.push(reference.into());
        self
    }

    pub fn with_scripts(mut self, scripts: ScriptPaths) -> Self {
        self.scripts = scripts;
        self
    }
}

/// Custom per-phase scripts run by the `@this` plugin.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptPaths {
    pub preprocess: Option<PathBuf>,
    pub transform: Option<PathBuf>,
    pub postprocess: Option<PathBuf>,
}

impl ScriptPaths {
    pub fn get(&self, phase: Phase) -> Option<&Path> {
        match phase {
            Phase::Preprocess => self.preprocess.as_deref(),
            Phase::Transform => self.transform.as_deref(),
            Phase::Postprocess => self.postprocess.as_deref(),
            Phase::Setup | Phase::Release => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.configured_phases().is_empty()
    }

    pub fn configured_phases(&self) -> Vec<Phase> {
        Phase::BUILD
            .into_iter()
            .filter(|phase| self.get(*phase).is_some())
            .collect()
    }
}

fn resolve_path(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn project_config_deserialize_partial_document_expected_defaults_filled() {
        let config: ProjectConfig = serde_json::from_value(json!({
            "root_dir": "/work",
            "distributions": {
                "node": {
                    "runtime": "node",
                    "plugins": ["esm", { "id": "types", "options": { "strict": true } }],
                    "scripts": { "transform": "scripts/transform.sh" }
                },
                "deno": { "runtime": "deno", "output_dir": "out/deno" }
            }
        }))
        .expect("config should deserialize");

        assert_eq!(config.source_dir, PathBuf::from("src"));
        assert_eq!(config.source_path(), PathBuf::from("/work/src"));
        assert_eq!(config.output_path("node"), PathBuf::from("/work/dist/node"));
        assert_eq!(config.output_path("deno"), PathBuf::from("/work/out/deno"));

        let node = config.distribution("node").expect("node distribution");
        assert_eq!(node.plugins.len(), 2);
        assert_eq!(node.scripts.configured_phases(), vec![Phase::Transform]);
        assert!(config.distribution("deno").expect("deno").scripts.is_empty());
    }

    #[test]
    fn script_paths_lifecycle_phases_expected_never_scripted() {
        let scripts = ScriptPaths {
            preprocess: Some(PathBuf::from("a.sh")),
            transform: Some(PathBuf::from("b.sh")),
            postprocess: Some(PathBuf::from("c.sh")),
        };
        assert_eq!(scripts.get(Phase::Setup), None);
        assert_eq!(scripts.get(Phase::Release), None);
        assert_eq!(scripts.configured_phases(), Phase::BUILD.to_vec());
    }
}
