use crate::{
    DistributionConfig, PluginError, PluginOptions, PluginReference, PluginRegistry,
    ProcessScriptRunner, RegisteredPlugin, ScriptPlugin, ScriptRunner, THIS_PLUGIN_ID,
};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// A loaded plugin bound to one distribution and its per-instance options.
#[derive(Clone, Debug)]
pub struct ResolvedPlugin {
    pub plugin: RegisteredPlugin,
    pub options: PluginOptions,
    pub distribution: String,
    pub is_placeholder: bool,
}

impl ResolvedPlugin {
    pub fn new(
        plugin: RegisteredPlugin,
        options: PluginOptions,
        distribution: impl Into<String>,
    ) -> Self {
        Self {
            plugin,
            options,
            distribution: distribution.into(),
            is_placeholder: false,
        }
    }

    pub fn id(&self) -> &str {
        self.plugin.id()
    }
}

/// Turns a distribution's plugin references into loaded plugins, in
/// declared order, through a shared [`PluginRegistry`].
#[derive(Clone)]
pub struct PluginResolver {
    registry: PluginRegistry,
    script_runner: Arc<dyn ScriptRunner>,
}

impl PluginResolver {
    pub fn new(registry: PluginRegistry) -> Self {
        Self {
            registry,
            script_runner: Arc::new(ProcessScriptRunner),
        }
    }

    pub fn with_script_runner(mut self, runner: Arc<dyn ScriptRunner>) -> Self {
        self.script_runner = runner;
        self
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub async fn resolve(
        &self,
        distribution: &str,
        config: &DistributionConfig,
    ) -> Result<Vec<ResolvedPlugin>, PluginError> {
        let implicit_this = [PluginReference::from(THIS_PLUGIN_ID)];
        let references: &[PluginReference] =
            if config.plugins.is_empty() && !config.scripts.is_empty() {
                &implicit_this
            } else {
                &config.plugins
            };

        let loads = references
            .iter()
            .filter(|reference| !reference.is_placeholder())
            .map(|reference| self.registry.get_or_load(reference.id()));
        let mut loaded = join_all(loads).await.into_iter();

        let mut resolved = Vec::with_capacity(references.len());
        for reference in references {
            let (id, options) = reference.normalize();
            if reference.is_placeholder() {
                if config.scripts.is_empty() {
                    debug!(distribution, "no custom scripts configured, skipping @this");
                    continue;
                }
                let plugin = RegisteredPlugin::new(Arc::new(ScriptPlugin::with_runner(
                    config.scripts.clone(),
                    Arc::clone(&self.script_runner),
                )))?;
                resolved.push(ResolvedPlugin {
                    plugin,
                    options,
                    distribution: distribution.to_string(),
                    is_placeholder: true,
                });
                continue;
            }

            let plugin = loaded.next().ok_or_else(|| PluginError::Load {
                id: id.clone(),
                message: "load result missing".to_string(),
            })??;
            resolved.push(ResolvedPlugin::new(plugin, options, distribution));
        }

        check_conflicts(distribution, &resolved)?;
        debug!(
            distribution,
            plugins = resolved.len(),
            "resolved distribution plugins"
        );
        Ok(resolved)
    }

    /// Resolves several distributions concurrently; each plugin id is loaded
    /// once no matter how many distributions reference it.
    pub async fn resolve_all<'a, I>(
        &self,
        distributions: I,
    ) -> Result<BTreeMap<String, Vec<ResolvedPlugin>>, PluginError>
    where
        I: IntoIterator<Item = (&'a str, &'a DistributionConfig)>,
    {
        let pending = distributions.into_iter().map(|(name, config)| async move {
            self.resolve(name, config)
                .await
                .map(|resolved| (name.to_string(), resolved))
        });
        join_all(pending).await.into_iter().collect()
    }
}

fn check_conflicts(distribution: &str, resolved: &[ResolvedPlugin]) -> Result<(), PluginError> {
    for (index, left) in resolved.iter().enumerate() {
        for right in &resolved[index + 1..] {
            if left.plugin.conflicts_with(&right.plugin) {
                return Err(PluginError::Conflict {
                    plugin: left.id().to_string(),
                    conflicts_with: right.id().to_string(),
                    distribution: distribution.to_string(),
                });
            }
        }
    }
    Ok(())
}
