use async_trait::async_trait;
use polydist_plugin::{
    BuiltinPlugins, DistributionConfig, MockPlugin, Phase, PluginError, PluginLoader,
    PluginOptions, PluginReference, PluginRegistry, PluginResolver, ProjectConfig, ScriptPaths,
    SharedPlugin, THIS_PLUGIN_ID,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockLoader {
    loads: Mutex<Vec<String>>,
}

impl MockLoader {
    fn loads(&self) -> Vec<String> {
        self.loads.lock().expect("loads mutex").clone()
    }
}

#[async_trait]
impl PluginLoader for MockLoader {
    async fn load(&self, id: &str) -> Result<SharedPlugin, PluginError> {
        self.loads.lock().expect("loads mutex").push(id.to_string());
        tokio::time::sleep(Duration::from_millis(5)).await;
        match id {
            "broken" => Ok(Arc::new(MockPlugin::new("broken").version(""))),
            "legacy-cjs" => Ok(Arc::new(
                MockPlugin::new("legacy-cjs")
                    .phases([Phase::Transform])
                    .conflicts_with("pluginA"),
            )),
            "unknown" => Err(PluginError::NotFound { id: id.to_string() }),
            _ => Ok(Arc::new(MockPlugin::new(id).phases([Phase::Transform]))),
        }
    }
}

fn resolver(loader: Arc<MockLoader>) -> PluginResolver {
    PluginResolver::new(PluginRegistry::new().with_loader(loader))
}

fn options(value: serde_json::Value) -> PluginOptions {
    value.as_object().cloned().expect("options object")
}

#[tokio::test(flavor = "current_thread")]
async fn resolve_bare_and_optioned_references_expected_declared_order() {
    let resolver = resolver(Arc::new(MockLoader::default()));
    let config = DistributionConfig::new("node")
        .with_plugin("pluginA")
        .with_plugin(PluginReference::with_options(
            "pluginB",
            options(json!({ "x": 1 })),
        ));

    let resolved = resolver
        .resolve("node", &config)
        .await
        .expect("resolution should succeed");

    assert_eq!(resolved.len(), 2);
    assert_eq!(resolved[0].id(), "pluginA");
    assert!(resolved[0].options.is_empty());
    assert_eq!(resolved[1].id(), "pluginB");
    assert_eq!(resolved[1].options, options(json!({ "x": 1 })));
    assert!(resolved.iter().all(|entry| entry.distribution == "node"));
    assert!(resolved.iter().all(|entry| !entry.is_placeholder));
}

#[tokio::test(flavor = "current_thread")]
async fn resolve_this_marker_with_scripts_expected_placeholder_in_position() {
    let resolver = resolver(Arc::new(MockLoader::default()));
    let config = DistributionConfig::new("deno")
        .with_plugin("pluginA")
        .with_plugin(THIS_PLUGIN_ID)
        .with_scripts(ScriptPaths {
            preprocess: Some(PathBuf::from("scripts/pre.sh")),
            postprocess: Some(PathBuf::from("scripts/post.sh")),
            ..ScriptPaths::default()
        });

    let resolved = resolver.resolve("deno", &config).await.expect("resolve");

    assert_eq!(resolved.len(), 2);
    assert!(resolved[1].is_placeholder);
    assert_eq!(resolved[1].id(), THIS_PLUGIN_ID);
    assert_eq!(
        resolved[1].plugin.phases(),
        &[Phase::Preprocess, Phase::Postprocess]
    );
    assert!(!resolved[1].plugin.can_parallelize());
}

#[tokio::test(flavor = "current_thread")]
async fn resolve_this_marker_without_scripts_expected_noop_or_dropped() {
    let loader = Arc::new(MockLoader::default());
    let resolver = resolver(loader.clone());

    let only_marker = DistributionConfig::new("bun").with_plugin(THIS_PLUGIN_ID);
    let resolved = resolver.resolve("bun", &only_marker).await.expect("resolve");
    assert!(resolved.is_empty());

    let with_other = DistributionConfig::new("bun")
        .with_plugin(THIS_PLUGIN_ID)
        .with_plugin("pluginA");
    let resolved = resolver.resolve("bun", &with_other).await.expect("resolve");
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].id(), "pluginA");

    let empty = DistributionConfig::new("bun");
    assert!(resolver.resolve("bun", &empty).await.expect("resolve").is_empty());
    assert_eq!(loader.loads(), vec!["pluginA".to_string()]);
}

#[tokio::test(flavor = "current_thread")]
async fn resolve_no_references_but_scripts_expected_implicit_this() {
    let resolver = resolver(Arc::new(MockLoader::default()));
    let config = DistributionConfig::new("node").with_scripts(ScriptPaths {
        transform: Some(PathBuf::from("build.mjs")),
        ..ScriptPaths::default()
    });

    let resolved = resolver.resolve("node", &config).await.expect("resolve");
    assert_eq!(resolved.len(), 1);
    assert!(resolved[0].is_placeholder);
    assert_eq!(resolved[0].plugin.phases(), &[Phase::Transform]);
}

#[tokio::test(flavor = "current_thread")]
async fn resolve_invalid_or_unknown_plugin_expected_named_error() {
    let resolver = resolver(Arc::new(MockLoader::default()));

    let config = DistributionConfig::new("node")
        .with_plugin("pluginA")
        .with_plugin("broken");
    let error = resolver.resolve("node", &config).await.expect_err("invalid");
    assert!(matches!(error, PluginError::Invalid { ref id, .. } if id == "broken"));

    let config = DistributionConfig::new("node").with_plugin("unknown");
    let error = resolver.resolve("node", &config).await.expect_err("unknown");
    assert_eq!(error.plugin_id(), Some("unknown"));
}

#[tokio::test(flavor = "current_thread")]
async fn resolve_conflicting_plugins_expected_conflict_error() {
    let resolver = resolver(Arc::new(MockLoader::default()));
    let config = DistributionConfig::new("node")
        .with_plugin("pluginA")
        .with_plugin("legacy-cjs");

    let error = resolver.resolve("node", &config).await.expect_err("conflict");
    assert_eq!(
        error,
        PluginError::Conflict {
            plugin: "pluginA".to_string(),
            conflicts_with: "legacy-cjs".to_string(),
            distribution: "node".to_string(),
        }
    );
}

#[tokio::test(flavor = "current_thread")]
async fn resolve_all_shared_plugin_across_distributions_expected_loaded_once() {
    let loader = Arc::new(MockLoader::default());
    let resolver = resolver(loader.clone());
    let project = ProjectConfig::default()
        .with_distribution(
            "node",
            DistributionConfig::new("node")
                .with_plugin("pluginA")
                .with_plugin("pluginB"),
        )
        .with_distribution("deno", DistributionConfig::new("deno").with_plugin("pluginA"))
        .with_distribution("bun", DistributionConfig::new("bun").with_plugin("pluginA"));

    let resolved = resolver
        .resolve_all(
            project
                .distributions
                .iter()
                .map(|(name, config)| (name.as_str(), config)),
        )
        .await
        .expect("resolve all");

    assert_eq!(resolved.len(), 3);
    let mut loads = loader.loads();
    loads.sort();
    assert_eq!(loads, vec!["pluginA".to_string(), "pluginB".to_string()]);
    assert!(resolved["deno"][0]
        .plugin
        .same_instance(&resolved["bun"][0].plugin));
}

#[tokio::test(flavor = "current_thread")]
async fn resolve_builtin_plugin_expected_not_sent_to_loader() {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&created);
    let builtins = BuiltinPlugins::new().with("esm", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Arc::new(MockPlugin::new("esm").phases([Phase::Transform])) as SharedPlugin
    });
    let loader = Arc::new(MockLoader::default());
    let resolver = PluginResolver::new(
        PluginRegistry::new()
            .with_builtins(builtins)
            .with_loader(loader.clone()),
    );

    let config = DistributionConfig::new("node").with_plugin("esm");
    resolver.resolve("node", &config).await.expect("first");
    resolver.resolve("deno", &config).await.expect("second");

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert!(loader.loads().is_empty());
}
