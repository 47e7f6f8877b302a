//! `ProgressEvent` — the sole observation channel for long-running
//! operations (spec.md §3, §5, §9).
//!
//! Treated as an external sink the core cannot trust: emitters never block
//! on it and never hold a lock across the send. The channel is bounded so a
//! slow consumer applies backpressure at the edge rather than letting
//! memory grow without bound; the external SSE adapter is the layer that
//! drops on overflow (spec.md §5), not this one.

use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub step: u32,
    pub total: u32,
    pub label: String,
    pub status: StepStatus,
    pub message: Option<String>,
    pub error: Option<String>,
    pub data: Option<serde_json::Value>,
}

impl ProgressEvent {
    pub fn running(step: u32, total: u32, label: impl Into<String>) -> Self {
        Self {
            step,
            total,
            label: label.into(),
            status: StepStatus::Running,
            message: None,
            error: None,
            data: None,
        }
    }

    pub fn completed(step: u32, total: u32, label: impl Into<String>) -> Self {
        Self {
            step,
            total,
            label: label.into(),
            status: StepStatus::Completed,
            message: None,
            error: None,
            data: None,
        }
    }

    pub fn failed(step: u32, total: u32, label: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            step,
            total,
            label: label.into(),
            status: StepStatus::Failed,
            message: None,
            error: Some(error.into()),
            data: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A non-blocking sink for `ProgressEvent`s. Cloning is cheap; every
/// long-running operation gets its own sender clone.
#[derive(Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards every event, for callers that don't care.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Best-effort emit: never awaits, never blocks, never panics on a
    /// disconnected or full receiver.
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_are_received_in_order() {
        let (sink, mut rx) = ProgressSink::channel(8);
        sink.emit(ProgressEvent::running(1, 3, "keys"));
        sink.emit(ProgressEvent::completed(1, 3, "keys"));
        sink.emit(ProgressEvent::running(2, 3, "ssh"));

        assert_eq!(rx.recv().await.unwrap().status, StepStatus::Running);
        assert_eq!(rx.recv().await.unwrap().status, StepStatus::Completed);
        let third = rx.recv().await.unwrap();
        assert_eq!(third.step, 2);
    }

    #[test]
    fn discard_never_blocks_or_panics() {
        let sink = ProgressSink::discard();
        sink.emit(ProgressEvent::running(1, 1, "noop"));
    }
}
