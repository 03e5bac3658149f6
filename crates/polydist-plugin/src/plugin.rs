use crate::{
    BuildContext, Phase, PhaseContext, PhaseResult, PluginError, ReleaseContext, SetupContext,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identity and scheduling metadata every plugin declares.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default = "default_can_parallelize")]
    pub can_parallelize: bool,
}

fn default_can_parallelize() -> bool {
    true
}

impl PluginMetadata {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            phases: Vec::new(),
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            can_parallelize: true,
        }
    }

    pub fn phases(mut self, phases: impl IntoIterator<Item = Phase>) -> Self {
        self.phases = phases.into_iter().collect();
        self
    }

    pub fn depends_on(mut self, plugin_id: impl Into<String>) -> Self {
        self.dependencies.push(plugin_id.into());
        self
    }

    pub fn conflicts_with(mut self, plugin_id: impl Into<String>) -> Self {
        self.conflicts.push(plugin_id.into());
        self
    }

    pub fn parallelizable(mut self, can_parallelize: bool) -> Self {
        self.can_parallelize = can_parallelize;
        self
    }
}

/// Capability contract for build and lifecycle plugins.
///
/// A plugin declares the phases it implements in its metadata and overrides
/// the matching handlers. Handlers for undeclared phases are never called;
/// the defaults only exist so implementors override what they declare.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn metadata(&self) -> &PluginMetadata;

    async fn preprocess(&self, _context: &BuildContext) -> Result<PhaseResult, PluginError> {
        Err(unsupported(self.metadata(), Phase::Preprocess))
    }

    async fn transform(&self, _context: &BuildContext) -> Result<PhaseResult, PluginError> {
        Err(unsupported(self.metadata(), Phase::Transform))
    }

    async fn postprocess(&self, _context: &BuildContext) -> Result<PhaseResult, PluginError> {
        Err(unsupported(self.metadata(), Phase::Postprocess))
    }

    async fn setup(&self, _context: &SetupContext) -> Result<PhaseResult, PluginError> {
        Err(unsupported(self.metadata(), Phase::Setup))
    }

    async fn release(&self, _context: &ReleaseContext) -> Result<PhaseResult, PluginError> {
        Err(unsupported(self.metadata(), Phase::Release))
    }
}

fn unsupported(metadata: &PluginMetadata, phase: Phase) -> PluginError {
    PluginError::UnsupportedPhase {
        id: metadata.id.clone(),
        phase,
    }
}

pub type SharedPlugin = Arc<dyn Plugin>;

/// A plugin whose metadata passed validation, with its phase set cached.
#[derive(Clone)]
pub struct RegisteredPlugin {
    plugin: SharedPlugin,
    phases: Arc<[Phase]>,
}

impl RegisteredPlugin {
    pub fn new(plugin: SharedPlugin) -> Result<Self, PluginError> {
        validate_metadata(plugin.metadata())?;
        let declared = &plugin.metadata().phases;
        let phases: Arc<[Phase]> = Phase::ALL
            .into_iter()
            .filter(|phase| declared.contains(phase))
            .collect();
        Ok(Self { plugin, phases })
    }

    pub fn metadata(&self) -> &PluginMetadata {
        self.plugin.metadata()
    }

    pub fn id(&self) -> &str {
        &self.metadata().id
    }

    pub fn name(&self) -> &str {
        &self.metadata().name
    }

    pub fn version(&self) -> &str {
        &self.metadata().version
    }

    pub fn dependencies(&self) -> &[String] {
        &self.metadata().dependencies
    }

    pub fn can_parallelize(&self) -> bool {
        self.metadata().can_parallelize
    }

    /// Implemented phases in canonical phase order.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn implements(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }

    /// Whether either plugin declares a conflict with the other.
    pub fn conflicts_with(&self, other: &RegisteredPlugin) -> bool {
        self.metadata().conflicts.iter().any(|id| id == other.id())
            || other.metadata().conflicts.iter().any(|id| id == self.id())
    }

    pub fn same_instance(&self, other: &RegisteredPlugin) -> bool {
        Arc::ptr_eq(&self.plugin, &other.plugin)
    }

    pub async fn run_phase(
        &self,
        phase: Phase,
        context: &PhaseContext,
    ) -> Result<PhaseResult, PluginError> {
        if !self.implements(phase) {
            return Err(unsupported(self.metadata(), phase));
        }
        if !context.matches_phase(phase) {
            return Err(PluginError::ContextMismatch { phase });
        }
        match (phase, context) {
            (Phase::Preprocess, PhaseContext::Build(context)) => {
                self.plugin.preprocess(context).await
            }
            (Phase::Transform, PhaseContext::Build(context)) => {
                self.plugin.transform(context).await
            }
            (Phase::Postprocess, PhaseContext::Build(context)) => {
                self.plugin.postprocess(context).await
            }
            (Phase::Setup, PhaseContext::Setup(context)) => self.plugin.setup(context).await,
            (Phase::Release, PhaseContext::Release(context)) => {
                self.plugin.release(context).await
            }
            _ => Err(PluginError::ContextMismatch { phase }),
        }
    }
}

impl fmt::Debug for RegisteredPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredPlugin")
            .field("id", &self.id())
            .field("version", &self.version())
            .field("phases", &self.phases)
            .finish()
    }
}

fn validate_metadata(metadata: &PluginMetadata) -> Result<(), PluginError> {
    let id = metadata.id.trim();
    let invalid = |reason: &str| PluginError::Invalid {
        id: if id.is_empty() {
            "<unnamed>".to_string()
        } else {
            id.to_string()
        },
        reason: reason.to_string(),
    };

    if id.is_empty() {
        return Err(invalid("missing id"));
    }
    if metadata.name.trim().is_empty() {
        return Err(invalid("missing name"));
    }
    if metadata.version.trim().is_empty() {
        return Err(invalid("missing version"));
    }
    for (index, phase) in metadata.phases.iter().enumerate() {
        if metadata.phases[..index].contains(phase) {
            return Err(invalid(&format!("phase '{phase}' declared twice")));
        }
    }
    if metadata.dependencies.iter().any(|dependency| dependency == id) {
        return Err(invalid("plugin depends on itself"));
    }
    if metadata.conflicts.iter().any(|conflict| conflict == id) {
        return Err(invalid("plugin conflicts with itself"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticPlugin {
        metadata: PluginMetadata,
    }

    #[async_trait]
    impl Plugin for StaticPlugin {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }

        async fn transform(&self, context: &BuildContext) -> Result<PhaseResult, PluginError> {
            Ok(PhaseResult::success().with_warning(format!("ran for {}", context.distribution)))
        }
    }

    fn register(metadata: PluginMetadata) -> Result<RegisteredPlugin, PluginError> {
        RegisteredPlugin::new(Arc::new(StaticPlugin { metadata }))
    }

    #[test]
    fn register_missing_identity_fields_expected_invalid_error() {
        let error = register(PluginMetadata::new("", "Name", "1.0.0")).expect_err("no id");
        assert!(matches!(error, PluginError::Invalid { ref id, .. } if id == "<unnamed>"));

        let error = register(PluginMetadata::new("esm", " ", "1.0.0")).expect_err("no name");
        assert_eq!(error.plugin_id(), Some("esm"));

        let error = register(PluginMetadata::new("esm", "ESM", "")).expect_err("no version");
        assert!(error.to_string().contains("missing version"));
    }

    #[test]
    fn register_inconsistent_capabilities_expected_invalid_error() {
        let duplicate = PluginMetadata::new("esm", "ESM", "1.0.0")
            .phases([Phase::Transform, Phase::Transform]);
        assert!(matches!(
            register(duplicate),
            Err(PluginError::Invalid { .. })
        ));

        let self_dependency = PluginMetadata::new("esm", "ESM", "1.0.0")
            .phases([Phase::Transform])
            .depends_on("esm");
        assert!(matches!(
            register(self_dependency),
            Err(PluginError::Invalid { .. })
        ));
    }

    #[test]
    fn phases_declared_out_of_order_expected_canonical_order() {
        let plugin = register(
            PluginMetadata::new("esm", "ESM", "1.0.0")
                .phases([Phase::Release, Phase::Preprocess, Phase::Transform]),
        )
        .expect("valid plugin");
        assert_eq!(
            plugin.phases(),
            &[Phase::Preprocess, Phase::Transform, Phase::Release]
        );
        assert!(!plugin.implements(Phase::Setup));
    }

    #[test]
    fn conflicts_with_declared_on_either_side_expected_symmetric() {
        let left = register(PluginMetadata::new("a", "A", "1").conflicts_with("b")).expect("a");
        let right = register(PluginMetadata::new("b", "B", "1")).expect("b");
        let other = register(PluginMetadata::new("c", "C", "1")).expect("c");
        assert!(left.conflicts_with(&right));
        assert!(right.conflicts_with(&left));
        assert!(!left.conflicts_with(&other));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_phase_dispatches_declared_handler_and_rejects_mismatches() {
        let plugin = register(
            PluginMetadata::new("esm", "ESM", "1.0.0").phases([Phase::Transform, Phase::Setup]),
        )
        .expect("valid plugin");
        let context = PhaseContext::Build(BuildContext {
            distribution: "node".to_string(),
            phase: Phase::Transform,
            ..BuildContext::default()
        });

        let result = plugin
            .run_phase(Phase::Transform, &context)
            .await
            .expect("transform should run");
        assert_eq!(result.warnings, vec!["ran for node".to_string()]);

        let error = plugin
            .run_phase(Phase::Preprocess, &context)
            .await
            .expect_err("preprocess is not declared");
        assert!(matches!(error, PluginError::UnsupportedPhase { .. }));

        let error = plugin
            .run_phase(Phase::Setup, &context)
            .await
            .expect_err("setup needs a setup context");
        assert_eq!(error, PluginError::ContextMismatch { phase: Phase::Setup });

        let error = plugin
            .run_phase(Phase::Setup, &PhaseContext::Setup(SetupContext::default()))
            .await
            .expect_err("setup is declared but not overridden");
        assert!(matches!(error, PluginError::UnsupportedPhase { .. }));
    }
}
