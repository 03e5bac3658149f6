use crate::events::RunEmitter;
use crate::scheduler::run_operation;
use crate::{
    ContextFactory, ExecutionGraph, ExecutionResult, GraphBuilder, GraphRequest, Operation,
    OrchestratorConfig, PipelineError, PipelineEventKind, ProgressObserver,
    ProjectContextFactory, Scheduler, SequentialEvent,
};
use polydist_plugin::{
    DistributionConfig, Phase, PhaseResult, PluginRegistry, PluginResolver, ProjectConfig,
    ResolvedPlugin,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one distribution, with one aggregated result per phase.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PipelineResult {
    pub distribution: String,
    pub success: bool,
    pub phases: BTreeMap<Phase, PhaseResult>,
    pub duration_ms: u64,
    pub output_dir: PathBuf,
}

impl PipelineResult {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phases.get(&phase)
    }
}

/// Drives distributions through their plugins, either one phase and plugin
/// at a time or through the execution graph.
pub struct Orchestrator {
    project: ProjectConfig,
    resolver: PluginResolver,
    contexts: Arc<dyn ContextFactory>,
    builder: GraphBuilder,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(project: ProjectConfig, registry: PluginRegistry) -> Self {
        Self {
            contexts: Arc::new(ProjectContextFactory::new(project.clone())),
            project,
            resolver: PluginResolver::new(registry),
            builder: GraphBuilder::new(),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_resolver(mut self, resolver: PluginResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_context_factory(mut self, contexts: Arc<dyn ContextFactory>) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn project(&self) -> &ProjectConfig {
        &self.project
    }

    pub fn resolver(&self) -> &PluginResolver {
        &self.resolver
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Runs the build phases of one distribution strictly in order, one
    /// plugin at a time. The first failing plugin aborts the rest of the
    /// run; the result holds the phases that started.
    pub async fn run_sequential(&self, distribution: &str) -> Result<PipelineResult, PipelineError> {
        let config = self.distribution_config(distribution)?;
        let output_dir = self.project.output_path(distribution);
        self.prepare_output(&output_dir).await?;
        let plugins = self.resolver.resolve(distribution, config).await?;

        let started = Instant::now();
        let mut emitter = RunEmitter::new(self.config.events.clone());
        let run_id = emitter.run_id();
        let mut phases = BTreeMap::new();
        for phase in Phase::BUILD {
            let participants: Vec<&ResolvedPlugin> = plugins
                .iter()
                .filter(|resolved| resolved.plugin.implements(phase))
                .collect();
            if participants.is_empty() {
                continue;
            }

            emitter.emit(PipelineEventKind::Sequential(SequentialEvent::PhaseStarted {
                run_id: run_id.clone(),
                distribution: distribution.to_string(),
                phase,
            }));
            let phase_started = Instant::now();
            let mut aggregate = PhaseResult::success();
            for resolved in participants {
                let outcome = self.run_single(resolved, phase, config).await;
                aggregate.warnings.extend(outcome.warnings);
                aggregate.affected_files.extend(outcome.affected_files);
                if !outcome.success {
                    warn!(
                        distribution,
                        plugin = resolved.id(),
                        %phase,
                        "plugin failed, aborting sequential run"
                    );
                    emitter.emit(PipelineEventKind::Sequential(SequentialEvent::Aborted {
                        run_id: run_id.clone(),
                        distribution: distribution.to_string(),
                        phase,
                        plugin_id: resolved.id().to_string(),
                        error: outcome.error.clone(),
                    }));
                    aggregate.success = false;
                    aggregate.error = outcome.error;
                    break;
                }
            }
            aggregate.duration_ms = Some(phase_started.elapsed().as_millis() as u64);

            let succeeded = aggregate.success;
            emitter.emit(PipelineEventKind::Sequential(SequentialEvent::PhaseCompleted {
                run_id: run_id.clone(),
                distribution: distribution.to_string(),
                phase,
                success: succeeded,
            }));
            phases.insert(phase, aggregate);
            if !succeeded {
                break;
            }
        }

        let result = PipelineResult {
            distribution: distribution.to_string(),
            success: phases.values().all(|phase| phase.success),
            phases,
            duration_ms: started.elapsed().as_millis() as u64,
            output_dir,
        };
        info!(
            distribution,
            success = result.success,
            duration_ms = result.duration_ms,
            "sequential pipeline finished"
        );
        Ok(result)
    }

    /// Resolves every requested distribution, builds one combined graph and
    /// runs it, returning one result per distribution.
    pub async fn run_graph(
        &self,
        request: &GraphRequest,
    ) -> Result<BTreeMap<String, PipelineResult>, PipelineError> {
        self.run_graph_with_progress(request, None).await
    }

    pub async fn run_graph_with_progress(
        &self,
        request: &GraphRequest,
        progress: Option<&dyn ProgressObserver>,
    ) -> Result<BTreeMap<String, PipelineResult>, PipelineError> {
        let names = self.select_distributions(request.distributions.as_deref())?;
        let mut selected = Vec::with_capacity(names.len());
        for name in &names {
            selected.push((name.as_str(), self.distribution_config(name)?));
        }
        let mut resolved = self.resolver.resolve_all(selected).await?;
        let plugins: Vec<ResolvedPlugin> = names
            .iter()
            .flat_map(|name| resolved.remove(name).unwrap_or_default())
            .collect();

        let graph = self.builder.build(&plugins, request)?;
        debug!(trace = %graph.trace(), "execution graph ready");
        let execution = Scheduler::from_config(&self.config)
            .execute(
                &graph,
                &self.project.distributions,
                self.contexts.as_ref(),
                progress,
            )
            .await;

        Ok(aggregate_results(&graph, &execution, &names, &self.project))
    }

    pub async fn build(&self, distribution: &str) -> Result<PipelineResult, PipelineError> {
        self.run_one(GraphRequest::build(), distribution).await
    }

    pub async fn build_all(&self) -> Result<BTreeMap<String, PipelineResult>, PipelineError> {
        self.run_graph(&GraphRequest::build()).await
    }

    pub async fn setup(&self, distribution: &str) -> Result<PipelineResult, PipelineError> {
        self.run_one(GraphRequest::setup(), distribution).await
    }

    pub async fn setup_all(&self) -> Result<BTreeMap<String, PipelineResult>, PipelineError> {
        self.run_graph(&GraphRequest::setup()).await
    }

    /// Release depends on the build phases, so they run again first.
    pub async fn release(&self, distribution: &str) -> Result<PipelineResult, PipelineError> {
        self.run_one(GraphRequest::release(), distribution).await
    }

    pub async fn release_all(&self) -> Result<BTreeMap<String, PipelineResult>, PipelineError> {
        self.run_graph(&GraphRequest::release()).await
    }

    async fn run_one(
        &self,
        request: GraphRequest,
        distribution: &str,
    ) -> Result<PipelineResult, PipelineError> {
        let request = request.for_distributions([distribution]);
        self.run_graph(&request)
            .await?
            .remove(distribution)
            .ok_or_else(|| PipelineError::UnknownDistribution(distribution.to_string()))
    }

    async fn run_single(
        &self,
        resolved: &ResolvedPlugin,
        phase: Phase,
        config: &DistributionConfig,
    ) -> PhaseResult {
        let operation = Operation::new(resolved, phase);
        match self.contexts.context_for(&operation, config) {
            Ok(context) => run_operation(&resolved.plugin, phase, &context).await,
            Err(error) => PhaseResult::failure(error.to_string()),
        }
    }

    fn distribution_config(&self, name: &str) -> Result<&DistributionConfig, PipelineError> {
        self.project
            .distribution(name)
            .ok_or_else(|| PipelineError::UnknownDistribution(name.to_string()))
    }

    fn select_distributions(&self, requested: Option<&[String]>) -> Result<Vec<String>, PipelineError> {
        match requested {
            None => Ok(self.project.distribution_names()),
            Some(names) => {
                let mut selected: Vec<String> = Vec::with_capacity(names.len());
                for name in names {
                    self.distribution_config(name)?;
                    if !selected.contains(name) {
                        selected.push(name.clone());
                    }
                }
                Ok(selected)
            }
        }
    }

    async fn prepare_output(&self, output_dir: &Path) -> Result<(), PipelineError> {
        if self.project.dry_run {
            debug!(path = %output_dir.display(), "dry run, leaving output directory untouched");
            return Ok(());
        }
        if self.config.clean_output {
            match tokio::fs::remove_dir_all(output_dir).await {
                Ok(()) => debug!(path = %output_dir.display(), "cleaned output directory"),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(io_error(output_dir, error)),
            }
        }
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|error| io_error(output_dir, error))
    }
}

fn io_error(path: &Path, error: io::Error) -> PipelineError {
    PipelineError::Io {
        path: path.display().to_string(),
        message: error.to_string(),
    }
}

/// Folds per-operation results into one [`PipelineResult`] per distribution.
///
/// Per phase: success is the AND of its operations, durations are summed,
/// warnings and affected files are concatenated in graph order and the first
/// failing operation's error becomes the phase error. A distribution without
/// operations succeeds with no phases.
pub fn aggregate_results(
    graph: &ExecutionGraph,
    execution: &ExecutionResult,
    distributions: &[String],
    project: &ProjectConfig,
) -> BTreeMap<String, PipelineResult> {
    distributions
        .iter()
        .map(|name| {
            let mut phases: BTreeMap<Phase, PhaseResult> = BTreeMap::new();
            for operation in graph.operations_by_distribution(name) {
                let Some(result) = execution.results.get(&operation.id) else {
                    continue;
                };
                let entry = phases
                    .entry(operation.phase)
                    .or_insert_with(|| PhaseResult::success().with_duration_ms(0));
                entry.success &= result.success;
                if !result.success && entry.error.is_none() {
                    entry.error = result.error.clone();
                }
                entry.duration_ms = Some(
                    entry.duration_ms.unwrap_or_default() + result.duration_ms.unwrap_or_default(),
                );
                entry.warnings.extend(result.warnings.iter().cloned());
                entry
                    .affected_files
                    .extend(result.affected_files.iter().cloned());
            }

            let result = PipelineResult {
                distribution: name.clone(),
                success: phases.values().all(|phase| phase.success),
                phases,
                duration_ms: execution.duration_ms,
                output_dir: project.output_path(name),
            };
            (name.clone(), result)
        })
        .collect()
}
