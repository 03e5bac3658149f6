use crate::{
    BuildContext, PhaseResult, Plugin, PluginError, PluginMetadata, ScriptPaths, THIS_PLUGIN_ID,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptInvocation {
    pub script: PathBuf,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, invocation: &ScriptInvocation) -> Result<ScriptOutput, PluginError>;
}

/// Runs scripts as child processes, picking an interpreter from the file
/// extension and executing anything else directly.
#[derive(Clone, Debug, Default)]
pub struct ProcessScriptRunner;

#[async_trait]
impl ScriptRunner for ProcessScriptRunner {
    async fn run(&self, invocation: &ScriptInvocation) -> Result<ScriptOutput, PluginError> {
        // The child starts in `working_dir`, so a relative script path would
        // be resolved against it a second time.
        let script = std::path::absolute(&invocation.script).map_err(|error| {
            PluginError::Script {
                path: invocation.script.display().to_string(),
                message: error.to_string(),
            }
        })?;
        let script = script.as_path();
        let mut command = match interpreter_for(script) {
            Some((program, args)) => {
                let mut command = tokio::process::Command::new(program);
                command.args(args).arg(script);
                command
            }
            None => tokio::process::Command::new(script),
        };
        command
            .current_dir(&invocation.working_dir)
            .envs(&invocation.env)
            .kill_on_drop(true);

        debug!(script = %script.display(), "running custom script");
        let started = Instant::now();
        let output = command.output().await.map_err(|error| PluginError::Script {
            path: script.display().to_string(),
            message: error.to_string(),
        })?;

        Ok(ScriptOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn interpreter_for(script: &Path) -> Option<(&'static str, &'static [&'static str])> {
    let extension = script.extension()?.to_str()?;
    match extension {
        "sh" => Some(("sh", &[])),
        "js" | "mjs" | "cjs" => Some(("node", &[])),
        "ts" => Some(("deno", &["run", "-A"])),
        "py" => Some(("python3", &[])),
        _ => None,
    }
}

/// The `@this` plugin: delegates build phases to the distribution's own
/// scripts. It only declares the phases that have a script configured.
pub struct ScriptPlugin {
    metadata: PluginMetadata,
    scripts: ScriptPaths,
    runner: Arc<dyn ScriptRunner>,
}

impl ScriptPlugin {
    pub fn new(scripts: ScriptPaths) -> Self {
        Self::with_runner(scripts, Arc::new(ProcessScriptRunner))
    }

    pub fn with_runner(scripts: ScriptPaths, runner: Arc<dyn ScriptRunner>) -> Self {
        let metadata = PluginMetadata::new(
            THIS_PLUGIN_ID,
            "Custom scripts",
            env!("CARGO_PKG_VERSION"),
        )
        .phases(scripts.configured_phases())
        .parallelizable(false);
        Self {
            metadata,
            scripts,
            runner,
        }
    }

    async fn run_script(&self, context: &BuildContext) -> Result<PhaseResult, PluginError> {
        let Some(script) = self.scripts.get(context.phase) else {
            return Err(PluginError::UnsupportedPhase {
                id: THIS_PLUGIN_ID.to_string(),
                phase: context.phase,
            });
        };
        let script = if script.is_absolute() {
            script.to_path_buf()
        } else {
            context.root_dir.join(script)
        };

        if context.dry_run {
            return Ok(PhaseResult::success()
                .with_warning(format!("dry run: skipped script '{}'", script.display())));
        }

        let invocation = ScriptInvocation {
            env: script_env(context),
            working_dir: context.root_dir.clone(),
            script,
        };
        let output = self.runner.run(&invocation).await?;
        if output.exit_code == 0 {
            return Ok(PhaseResult::success().with_duration_ms(output.duration_ms));
        }

        let stderr = output.stderr.trim();
        let mut message = format!(
            "script '{}' exited with status {}",
            invocation.script.display(),
            output.exit_code
        );
        if !stderr.is_empty() {
            message.push_str(": ");
            message.push_str(stderr);
        }
        Ok(PhaseResult::failure(message).with_duration_ms(output.duration_ms))
    }
}

fn script_env(context: &BuildContext) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "POLYDIST_DISTRIBUTION".to_string(),
            context.distribution.clone(),
        ),
        ("POLYDIST_RUNTIME".to_string(), context.runtime.clone()),
        ("POLYDIST_PHASE".to_string(), context.phase.to_string()),
        (
            "POLYDIST_SOURCE_DIR".to_string(),
            context.source_dir.display().to_string(),
        ),
        (
            "POLYDIST_OUTPUT_DIR".to_string(),
            context.output_dir.display().to_string(),
        ),
    ])
}

#[async_trait]
impl Plugin for ScriptPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    async fn preprocess(&self, context: &BuildContext) -> Result<PhaseResult, PluginError> {
        self.run_script(context).await
    }

    async fn transform(&self, context: &BuildContext) -> Result<PhaseResult, PluginError> {
        self.run_script(context).await
    }

    async fn postprocess(&self, context: &BuildContext) -> Result<PhaseResult, PluginError> {
        self.run_script(context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Phase, PhaseContext, RegisteredPlugin};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        invocations: Mutex<Vec<ScriptInvocation>>,
        exit_code: i32,
    }

    #[async_trait]
    impl ScriptRunner for RecordingRunner {
        async fn run(&self, invocation: &ScriptInvocation) -> Result<ScriptOutput, PluginError> {
            self.invocations
                .lock()
                .expect("invocations mutex")
                .push(invocation.clone());
            Ok(ScriptOutput {
                exit_code: self.exit_code,
                stderr: "  compile error\n".to_string(),
                ..ScriptOutput::default()
            })
        }
    }

    fn build_context(phase: Phase, dry_run: bool) -> PhaseContext {
        PhaseContext::Build(BuildContext {
            distribution: "deno".to_string(),
            runtime: "deno".to_string(),
            phase,
            root_dir: PathBuf::from("/project"),
            source_dir: PathBuf::from("/project/src"),
            output_dir: PathBuf::from("/project/dist/deno"),
            dry_run,
            ..BuildContext::default()
        })
    }

    fn transform_only() -> ScriptPaths {
        ScriptPaths {
            transform: Some(PathBuf::from("scripts/transform.sh")),
            ..ScriptPaths::default()
        }
    }

    #[test]
    fn metadata_declares_only_configured_phases_and_is_sequential() {
        let plugin = ScriptPlugin::new(transform_only());
        assert_eq!(plugin.metadata().id, THIS_PLUGIN_ID);
        assert_eq!(plugin.metadata().phases, vec![Phase::Transform]);
        assert!(!plugin.metadata().can_parallelize);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transform_runs_script_from_project_root_with_distribution_env() {
        let runner = Arc::new(RecordingRunner::default());
        let plugin = RegisteredPlugin::new(Arc::new(ScriptPlugin::with_runner(
            transform_only(),
            runner.clone(),
        )))
        .expect("script plugin should validate");

        let result = plugin
            .run_phase(Phase::Transform, &build_context(Phase::Transform, false))
            .await
            .expect("script should run");
        assert!(result.success);

        let invocations = runner.invocations.lock().expect("mutex").clone();
        assert_eq!(invocations.len(), 1);
        assert_eq!(
            invocations[0].script,
            PathBuf::from("/project/scripts/transform.sh")
        );
        assert_eq!(invocations[0].working_dir, PathBuf::from("/project"));
        assert_eq!(invocations[0].env["POLYDIST_DISTRIBUTION"], "deno");
        assert_eq!(invocations[0].env["POLYDIST_PHASE"], "transform");
        assert_eq!(invocations[0].env["POLYDIST_OUTPUT_DIR"], "/project/dist/deno");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transform_non_zero_exit_expected_failure_with_stderr() {
        let runner = Arc::new(RecordingRunner {
            exit_code: 2,
            ..RecordingRunner::default()
        });
        let plugin = ScriptPlugin::with_runner(transform_only(), runner);
        let PhaseContext::Build(context) = build_context(Phase::Transform, false) else {
            unreachable!("build context");
        };

        let result = plugin.transform(&context).await.expect("runner succeeded");
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("script '/project/scripts/transform.sh' exited with status 2: compile error")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transform_dry_run_expected_skipped_with_warning() {
        let runner = Arc::new(RecordingRunner::default());
        let plugin = ScriptPlugin::with_runner(transform_only(), runner.clone());
        let PhaseContext::Build(context) = build_context(Phase::Transform, true) else {
            unreachable!("build context");
        };

        let result = plugin.transform(&context).await.expect("dry run");
        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
        assert!(runner.invocations.lock().expect("mutex").is_empty());
    }

    #[test]
    fn interpreter_for_known_extensions() {
        assert_eq!(interpreter_for(Path::new("a.sh")).map(|(p, _)| p), Some("sh"));
        assert_eq!(interpreter_for(Path::new("a.mjs")).map(|(p, _)| p), Some("node"));
        assert_eq!(
            interpreter_for(Path::new("a.ts")),
            Some(("deno", &["run", "-A"][..]))
        );
        assert_eq!(interpreter_for(Path::new("build")), None);
    }
}
