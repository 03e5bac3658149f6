use polydist_plugin::Phase;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub sequence_no: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub kind: PipelineEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum PipelineEventKind {
    Run(RunEvent),
    Wave(WaveEvent),
    Operation(OperationEvent),
    Sequential(SequentialEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        run_id: String,
        operations: usize,
        waves: usize,
    },
    Completed {
        run_id: String,
        success: bool,
        failed: usize,
        skipped: usize,
        duration_ms: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaveEvent {
    Started {
        run_id: String,
        wave: usize,
        operations: usize,
    },
    Completed {
        run_id: String,
        wave: usize,
        failures: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationEvent {
    Started {
        run_id: String,
        operation_id: String,
        wave: usize,
    },
    Completed {
        run_id: String,
        operation_id: String,
        duration_ms: Option<u64>,
    },
    Failed {
        run_id: String,
        operation_id: String,
        error: Option<String>,
    },
    Skipped {
        run_id: String,
        operation_id: String,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SequentialEvent {
    PhaseStarted {
        run_id: String,
        distribution: String,
        phase: Phase,
    },
    PhaseCompleted {
        run_id: String,
        distribution: String,
        phase: Phase,
        success: bool,
    },
    Aborted {
        run_id: String,
        distribution: String,
        phase: Phase,
        plugin_id: String,
        error: Option<String>,
    },
}

pub trait PipelineEventObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

impl<F> PipelineEventObserver for F
where
    F: Fn(&PipelineEvent) + Send + Sync,
{
    fn on_event(&self, event: &PipelineEvent) {
        self(event);
    }
}

pub type SharedPipelineEventObserver = Arc<dyn PipelineEventObserver>;
pub type PipelineEventSender = mpsc::UnboundedSender<PipelineEvent>;
pub type PipelineEventReceiver = mpsc::UnboundedReceiver<PipelineEvent>;

#[derive(Clone, Default)]
pub struct PipelineEventSink {
    observer: Option<SharedPipelineEventObserver>,
    sender: Option<PipelineEventSender>,
}

impl PipelineEventSink {
    pub fn with_observer(observer: SharedPipelineEventObserver) -> Self {
        Self {
            observer: Some(observer),
            sender: None,
        }
    }

    pub fn with_sender(sender: PipelineEventSender) -> Self {
        Self {
            observer: None,
            sender: Some(sender),
        }
    }

    pub fn observer(mut self, observer: SharedPipelineEventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn sender(mut self, sender: PipelineEventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.observer.is_some() || self.sender.is_some()
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(observer) = self.observer.as_ref() {
            observer.on_event(&event);
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event);
        }
    }
}

pub fn pipeline_event_channel() -> (PipelineEventSender, PipelineEventReceiver) {
    mpsc::unbounded_channel()
}

/// Stamps events of one run with its id, a sequence number and the time.
pub(crate) struct RunEmitter {
    run_id: String,
    sequence_no: u64,
    sink: PipelineEventSink,
}

impl RunEmitter {
    pub(crate) fn new(sink: PipelineEventSink) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            sequence_no: 0,
            sink,
        }
    }

    pub(crate) fn run_id(&self) -> String {
        self.run_id.clone()
    }

    pub(crate) fn emit(&mut self, kind: PipelineEventKind) {
        if !self.sink.is_enabled() {
            return;
        }
        self.sequence_no += 1;
        self.sink.emit(PipelineEvent {
            sequence_no: self.sequence_no,
            timestamp_ms: unix_millis(),
            kind,
        });
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn sequential_abort_events_expected_at_observer_and_channel_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer_seen = Arc::clone(&seen);
        let observer: SharedPipelineEventObserver = Arc::new(move |event: &PipelineEvent| {
            if let PipelineEventKind::Sequential(kind) = &event.kind {
                observer_seen
                    .lock()
                    .expect("observer mutex should lock")
                    .push(kind.clone());
            }
        });
        let (tx, mut rx) = pipeline_event_channel();
        let mut emitter = RunEmitter::new(PipelineEventSink::with_observer(observer).sender(tx));
        let run_id = emitter.run_id();

        emitter.emit(PipelineEventKind::Sequential(SequentialEvent::PhaseStarted {
            run_id: run_id.clone(),
            distribution: "deno".to_string(),
            phase: Phase::Transform,
        }));
        emitter.emit(PipelineEventKind::Sequential(SequentialEvent::Aborted {
            run_id: run_id.clone(),
            distribution: "deno".to_string(),
            phase: Phase::Transform,
            plugin_id: "esm".to_string(),
            error: Some("unresolved import './mod.ts'".to_string()),
        }));

        let started = rx.try_recv().expect("phase started streamed");
        let aborted = rx.try_recv().expect("abort streamed");
        assert_eq!((started.sequence_no, aborted.sequence_no), (1, 2));
        assert!(aborted.timestamp_ms >= started.timestamp_ms);
        assert!(started.timestamp_ms > 0);

        let seen = seen.lock().expect("observer mutex should lock");
        assert_eq!(seen.len(), 2);
        assert!(matches!(
            &seen[1],
            SequentialEvent::Aborted { run_id: id, plugin_id, .. }
                if *id == run_id && plugin_id == "esm"
        ));
    }

    #[test]
    fn disabled_sink_expected_no_sequence_numbers_consumed() {
        let mut emitter = RunEmitter::new(PipelineEventSink::default());
        emitter.emit(PipelineEventKind::Run(RunEvent::Started {
            run_id: emitter.run_id(),
            operations: 3,
            waves: 2,
        }));
        assert_eq!(emitter.sequence_no, 0);
    }

    #[test]
    fn run_emitter_numbers_events_from_one() {
        let (tx, mut rx) = pipeline_event_channel();
        let mut emitter = RunEmitter::new(PipelineEventSink::with_sender(tx));
        let run_id = emitter.run_id();
        for wave in 0..2 {
            emitter.emit(PipelineEventKind::Wave(WaveEvent::Completed {
                run_id: run_id.clone(),
                wave,
                failures: 0,
            }));
        }

        assert_eq!(rx.try_recv().expect("first").sequence_no, 1);
        assert_eq!(rx.try_recv().expect("second").sequence_no, 2);
    }

    #[test]
    fn operation_event_serializes_with_category_and_kind_tags() {
        let event = PipelineEventKind::Operation(OperationEvent::Skipped {
            run_id: "r".to_string(),
            operation_id: "node:a:transform".to_string(),
            reason: "fail fast".to_string(),
        });
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["category"], "operation");
        assert_eq!(value["kind"], "skipped");
    }
}
