use crate::PipelineEventSink;
use serde::{Deserialize, Serialize};

/// What the scheduler does with operations downstream of a failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Run every operation; failures are only reported.
    #[default]
    Continue,
    /// Skip operations with a failed or skipped transitive dependency.
    SkipDependents,
    /// Stop dispatching after the first wave that produced a failure.
    FailFast,
}

#[derive(Clone)]
pub struct OrchestratorConfig {
    pub failure_policy: FailurePolicy,
    /// Remove and recreate a distribution's output directory before a
    /// sequential run. Dry runs never touch it.
    pub clean_output: bool,
    pub events: PipelineEventSink,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Continue,
            clean_output: true,
            events: PipelineEventSink::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn with_events(mut self, events: PipelineEventSink) -> Self {
        self.events = events;
        self
    }
}
