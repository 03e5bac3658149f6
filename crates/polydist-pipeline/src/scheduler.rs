use crate::events::RunEmitter;
use crate::{
    ContextFactory, ExecutionGraph, FailurePolicy, Operation, OperationEvent, OperationId,
    OrchestratorConfig, PipelineError, PipelineEventKind, PipelineEventSink, RunEvent, WaveEvent,
};
use futures::FutureExt;
use polydist_plugin::{DistributionConfig, Phase, PhaseContext, PhaseResult, RegisteredPlugin};
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Called after every operation settles with `(completed, total, operation)`.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, completed: usize, total: usize, operation: &Operation);
}

impl<F> ProgressObserver for F
where
    F: Fn(usize, usize, &Operation) + Send + Sync,
{
    fn on_progress(&self, completed: usize, total: usize, operation: &Operation) {
        self(completed, total, operation);
    }
}

/// Two operations of one wave and distribution that reported the same files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutputOverlap {
    pub distribution: String,
    pub wave: usize,
    pub first: OperationId,
    pub second: OperationId,
    pub paths: Vec<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub results: BTreeMap<OperationId, PhaseResult>,
    /// Operations that ran (or could not start) and failed, in graph order.
    pub failed: Vec<OperationId>,
    /// Operations never dispatched because of the failure policy.
    pub skipped: Vec<OperationId>,
    pub success: bool,
    pub duration_ms: u64,
    pub overlaps: Vec<OutputOverlap>,
}

impl ExecutionResult {
    pub fn result(&self, id: &str) -> Option<&PhaseResult> {
        self.results.get(id)
    }
}

/// Runs an [`ExecutionGraph`] wave by wave.
#[derive(Clone, Default)]
pub struct Scheduler {
    failure_policy: FailurePolicy,
    events: PipelineEventSink,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            failure_policy: config.failure_policy,
            events: config.events.clone(),
        }
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn with_events(mut self, events: PipelineEventSink) -> Self {
        self.events = events;
        self
    }

    /// Every operation of a wave runs on its own task; the next wave starts
    /// once all of them have settled. Operation failures never abort the
    /// run, they are folded into the result.
    pub async fn execute(
        &self,
        graph: &ExecutionGraph,
        distributions: &BTreeMap<String, DistributionConfig>,
        contexts: &dyn ContextFactory,
        progress: Option<&dyn ProgressObserver>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let mut run = RunState::new(graph, RunEmitter::new(self.events.clone()), progress);
        let run_id = run.run_id.clone();
        run.emitter.emit(PipelineEventKind::Run(RunEvent::Started {
            run_id: run_id.clone(),
            operations: graph.total_operations(),
            waves: graph.waves().len(),
        }));

        let mut halted_at: Option<usize> = None;
        for wave in graph.waves() {
            debug!(wave = wave.index, operations = wave.len(), "dispatching wave");
            run.emitter.emit(PipelineEventKind::Wave(WaveEvent::Started {
                run_id: run_id.clone(),
                wave: wave.index,
                operations: wave.len(),
            }));

            let mut tasks = JoinSet::new();
            for &index in &wave.operations {
                if let Some(reason) = self.skip_reason(graph, index, &run, halted_at) {
                    run.skip(index, reason);
                    continue;
                }
                let operation = &graph.operations()[index];
                run.emitter
                    .emit(PipelineEventKind::Operation(OperationEvent::Started {
                        run_id: run_id.clone(),
                        operation_id: operation.id.to_string(),
                        wave: wave.index,
                    }));
                match prepare_context(operation, distributions, contexts) {
                    Ok(context) => {
                        let plugin = operation.plugin.clone();
                        let phase = operation.phase;
                        tasks.spawn(async move {
                            (index, run_operation(&plugin, phase, &context).await)
                        });
                    }
                    Err(error) => run.record(index, PhaseResult::failure(error.to_string())),
                }
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, result)) => run.record(index, result),
                    Err(error) => warn!(%error, "operation task did not complete"),
                }
            }
            for &index in &wave.operations {
                if run.outcomes[index].is_none() {
                    run.record(index, PhaseResult::failure("operation task did not complete"));
                }
            }

            let failures = wave
                .operations
                .iter()
                .filter(|index| run.failed[**index])
                .count();
            run.emitter.emit(PipelineEventKind::Wave(WaveEvent::Completed {
                run_id: run_id.clone(),
                wave: wave.index,
                failures,
            }));
            if failures > 0
                && self.failure_policy == FailurePolicy::FailFast
                && halted_at.is_none()
            {
                warn!(wave = wave.index, failures, "stopping after failed wave");
                halted_at = Some(wave.index);
            }
        }

        let overlaps = detect_overlaps(graph, &run.outcomes);
        let result = run.finish(started.elapsed().as_millis() as u64, overlaps);
        info!(
            operations = graph.total_operations(),
            failed = result.failed.len(),
            skipped = result.skipped.len(),
            duration_ms = result.duration_ms,
            "execution graph finished"
        );
        result
    }

    fn skip_reason(
        &self,
        graph: &ExecutionGraph,
        index: usize,
        run: &RunState<'_>,
        halted_at: Option<usize>,
    ) -> Option<String> {
        match self.failure_policy {
            FailurePolicy::Continue => None,
            FailurePolicy::FailFast => halted_at
                .map(|wave| format!("skipped: execution stopped after a failure in wave {wave}")),
            FailurePolicy::SkipDependents => graph
                .dependencies_of(index)
                .iter()
                .find(|dependency| run.failed[**dependency] || run.skipped[**dependency])
                .map(|dependency| {
                    format!(
                        "skipped: dependency {} did not succeed",
                        graph.operations()[*dependency].id
                    )
                }),
        }
    }
}

/// Invokes one phase handler. Handler errors and panics become failure
/// results; a missing duration is filled with the measured one.
pub(crate) async fn run_operation(
    plugin: &RegisteredPlugin,
    phase: Phase,
    context: &PhaseContext,
) -> PhaseResult {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(plugin.run_phase(phase, context))
        .catch_unwind()
        .await;
    let mut result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(error)) => PhaseResult::failure(error.to_string()),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(
                distribution = context.distribution(),
                plugin = plugin.id(),
                %phase,
                panic = message,
                "plugin handler panicked"
            );
            PhaseResult::failure(format!("plugin '{}' panicked: {message}", plugin.id()))
        }
    };
    if result.duration_ms.is_none() {
        result.duration_ms = Some(started.elapsed().as_millis() as u64);
    }
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

fn prepare_context(
    operation: &Operation,
    distributions: &BTreeMap<String, DistributionConfig>,
    contexts: &dyn ContextFactory,
) -> Result<PhaseContext, PipelineError> {
    let distribution = distributions
        .get(&operation.distribution)
        .ok_or_else(|| PipelineError::UnknownDistribution(operation.distribution.clone()))?;
    contexts.context_for(operation, distribution)
}

struct RunState<'a> {
    graph: &'a ExecutionGraph,
    run_id: String,
    emitter: RunEmitter,
    progress: Option<&'a dyn ProgressObserver>,
    outcomes: Vec<Option<PhaseResult>>,
    failed: Vec<bool>,
    skipped: Vec<bool>,
    completed: usize,
}

impl<'a> RunState<'a> {
    fn new(
        graph: &'a ExecutionGraph,
        emitter: RunEmitter,
        progress: Option<&'a dyn ProgressObserver>,
    ) -> Self {
        let total = graph.total_operations();
        Self {
            graph,
            run_id: emitter.run_id(),
            emitter,
            progress,
            outcomes: vec![None; total],
            failed: vec![false; total],
            skipped: vec![false; total],
            completed: 0,
        }
    }

    fn record(&mut self, index: usize, result: PhaseResult) {
        let graph = self.graph;
        let operation = &graph.operations()[index];
        let event = if result.success {
            OperationEvent::Completed {
                run_id: self.run_id.clone(),
                operation_id: operation.id.to_string(),
                duration_ms: result.duration_ms,
            }
        } else {
            warn!(
                operation = %operation.id,
                error = result.error.as_deref().unwrap_or("unknown error"),
                "operation failed"
            );
            self.failed[index] = true;
            OperationEvent::Failed {
                run_id: self.run_id.clone(),
                operation_id: operation.id.to_string(),
                error: result.error.clone(),
            }
        };
        self.emitter.emit(PipelineEventKind::Operation(event));
        self.settle(index, result);
    }

    fn skip(&mut self, index: usize, reason: String) {
        let graph = self.graph;
        let operation = &graph.operations()[index];
        debug!(operation = %operation.id, %reason, "skipping operation");
        self.skipped[index] = true;
        self.emitter
            .emit(PipelineEventKind::Operation(OperationEvent::Skipped {
                run_id: self.run_id.clone(),
                operation_id: operation.id.to_string(),
                reason: reason.clone(),
            }));
        self.settle(index, PhaseResult::failure(reason));
    }

    fn settle(&mut self, index: usize, result: PhaseResult) {
        self.outcomes[index] = Some(result);
        self.completed += 1;
        if let Some(progress) = self.progress {
            progress.on_progress(
                self.completed,
                self.graph.total_operations(),
                &self.graph.operations()[index],
            );
        }
    }

    fn finish(mut self, duration_ms: u64, overlaps: Vec<OutputOverlap>) -> ExecutionResult {
        let graph = self.graph;
        let operations = graph.operations();
        let ids_where = |flags: &[bool]| -> Vec<OperationId> {
            flags
                .iter()
                .enumerate()
                .filter(|(_, flag)| **flag)
                .map(|(index, _)| operations[index].id.clone())
                .collect()
        };
        let failed = ids_where(&self.failed);
        let skipped = ids_where(&self.skipped);
        let results = operations
            .iter()
            .zip(std::mem::take(&mut self.outcomes))
            .map(|(operation, outcome)| {
                (
                    operation.id.clone(),
                    outcome.unwrap_or_else(|| PhaseResult::failure("operation was not scheduled")),
                )
            })
            .collect();
        let success = failed.is_empty() && skipped.is_empty();

        self.emitter.emit(PipelineEventKind::Run(RunEvent::Completed {
            run_id: self.run_id.clone(),
            success,
            failed: failed.len(),
            skipped: skipped.len(),
            duration_ms,
        }));

        ExecutionResult {
            results,
            failed,
            skipped,
            success,
            duration_ms,
            overlaps,
        }
    }
}

fn detect_overlaps(graph: &ExecutionGraph, outcomes: &[Option<PhaseResult>]) -> Vec<OutputOverlap> {
    let mut overlaps = Vec::new();
    for wave in graph.waves() {
        for (position, &first) in wave.operations.iter().enumerate() {
            for &second in &wave.operations[position + 1..] {
                let (left, right) = (&graph.operations()[first], &graph.operations()[second]);
                if left.distribution != right.distribution {
                    continue;
                }
                let (Some(left_result), Some(right_result)) = (&outcomes[first], &outcomes[second])
                else {
                    continue;
                };
                let left_files: BTreeSet<&PathBuf> = left_result.affected_files.iter().collect();
                let shared: BTreeSet<&PathBuf> = right_result
                    .affected_files
                    .iter()
                    .filter(|path| left_files.contains(path))
                    .collect();
                if shared.is_empty() {
                    continue;
                }
                let paths: Vec<PathBuf> = shared.into_iter().cloned().collect();
                warn!(
                    distribution = %left.distribution,
                    wave = wave.index,
                    first = %left.id,
                    second = %right.id,
                    paths = ?paths,
                    "concurrent operations reported overlapping output files"
                );
                overlaps.push(OutputOverlap {
                    distribution: left.distribution.clone(),
                    wave: wave.index,
                    first: left.id.clone(),
                    second: right.id.clone(),
                    paths,
                });
            }
        }
    }
    overlaps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
