use crate::{
    BuildContext, Phase, PhaseResult, Plugin, PluginError, PluginMetadata, RegisteredPlugin,
    ReleaseContext, SetupContext,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;

/// Scripted response of a [`MockPlugin`] for one phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockOutcome {
    Success,
    Fail(String),
    Error(String),
    Panic(String),
}

/// Shared, ordered record of handler starts and finishes.
///
/// Entries read `start <distribution>:<plugin>:<phase>` and
/// `end <distribution>:<plugin>:<phase>`.
#[derive(Clone, Debug, Default)]
pub struct MockCallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl MockCallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().expect("mock call log mutex").clone()
    }

    /// Operation ids in the order their handlers finished.
    pub fn finished(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|entry| entry.strip_prefix("end ").map(str::to_string))
            .collect()
    }

    fn push(&self, entry: String) {
        self.entries.lock().expect("mock call log mutex").push(entry);
    }
}

/// Configurable in-memory plugin for tests.
pub struct MockPlugin {
    metadata: PluginMetadata,
    outcomes: BTreeMap<Phase, MockOutcome>,
    affected_files: BTreeMap<Phase, Vec<PathBuf>>,
    delay: Option<Duration>,
    barrier: Option<Arc<Barrier>>,
    log: MockCallLog,
}

impl MockPlugin {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            metadata: PluginMetadata::new(id.clone(), format!("Mock {id}"), "0.1.0"),
            outcomes: BTreeMap::new(),
            affected_files: BTreeMap::new(),
            delay: None,
            barrier: None,
            log: MockCallLog::new(),
        }
    }

    pub fn phases(mut self, phases: impl IntoIterator<Item = Phase>) -> Self {
        self.metadata = self.metadata.phases(phases);
        self
    }

    pub fn depends_on(mut self, plugin_id: impl Into<String>) -> Self {
        self.metadata = self.metadata.depends_on(plugin_id);
        self
    }

    pub fn conflicts_with(mut self, plugin_id: impl Into<String>) -> Self {
        self.metadata = self.metadata.conflicts_with(plugin_id);
        self
    }

    pub fn parallelizable(mut self, can_parallelize: bool) -> Self {
        self.metadata = self.metadata.parallelizable(can_parallelize);
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.metadata.version = version.into();
        self
    }

    pub fn outcome(mut self, phase: Phase, outcome: MockOutcome) -> Self {
        self.outcomes.insert(phase, outcome);
        self
    }

    pub fn fail_on(self, phase: Phase, message: impl Into<String>) -> Self {
        self.outcome(phase, MockOutcome::Fail(message.into()))
    }

    pub fn error_on(self, phase: Phase, message: impl Into<String>) -> Self {
        self.outcome(phase, MockOutcome::Error(message.into()))
    }

    pub fn affecting(mut self, phase: Phase, paths: &[&str]) -> Self {
        self.affected_files
            .insert(phase, paths.iter().map(PathBuf::from).collect());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every handler waits on `barrier` before returning.
    pub fn barrier(mut self, barrier: Arc<Barrier>) -> Self {
        self.barrier = Some(barrier);
        self
    }

    pub fn log(mut self, log: MockCallLog) -> Self {
        self.log = log;
        self
    }

    pub fn call_log(&self) -> MockCallLog {
        self.log.clone()
    }

    pub fn registered(self) -> RegisteredPlugin {
        RegisteredPlugin::new(Arc::new(self)).expect("mock plugin metadata should be valid")
    }

    async fn respond(&self, phase: Phase, distribution: &str) -> Result<PhaseResult, PluginError> {
        let operation = format!("{distribution}:{}:{phase}", self.metadata.id);
        self.log.push(format!("start {operation}"));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(barrier) = self.barrier.as_ref() {
            barrier.wait().await;
        }
        self.log.push(format!("end {operation}"));

        let affected = self.affected_files.get(&phase).cloned().unwrap_or_default();
        match self.outcomes.get(&phase).cloned().unwrap_or(MockOutcome::Success) {
            MockOutcome::Success => Ok(PhaseResult::success().with_affected_files(affected)),
            MockOutcome::Fail(message) => {
                Ok(PhaseResult::failure(message).with_affected_files(affected))
            }
            MockOutcome::Error(message) => Err(PluginError::handler(message)),
            MockOutcome::Panic(message) => panic!("{message}"),
        }
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    async fn preprocess(&self, context: &BuildContext) -> Result<PhaseResult, PluginError> {
        self.respond(Phase::Preprocess, &context.distribution).await
    }

    async fn transform(&self, context: &BuildContext) -> Result<PhaseResult, PluginError> {
        self.respond(Phase::Transform, &context.distribution).await
    }

    async fn postprocess(&self, context: &BuildContext) -> Result<PhaseResult, PluginError> {
        self.respond(Phase::Postprocess, &context.distribution).await
    }

    async fn setup(&self, context: &SetupContext) -> Result<PhaseResult, PluginError> {
        self.respond(Phase::Setup, &context.distribution).await
    }

    async fn release(&self, context: &ReleaseContext) -> Result<PhaseResult, PluginError> {
        self.respond(Phase::Release, &context.distribution).await
    }
}
