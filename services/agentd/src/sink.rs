//! Error sink: one stream of subsystem errors, logged by the agent main.
//!
//! Subsystems do not share a sink object; each constructor receives its own
//! tagged handle and the receivers compose into a single logging task.

use tokio::sync::mpsc;
use tracing::error;

/// One reported error.
pub struct SinkEvent {
    pub subsystem: &'static str,
    pub error: anyhow::Error,
}

/// A subsystem's handle into the shared error stream.
#[derive(Clone)]
pub struct ErrorSink {
    subsystem: &'static str,
    tx: mpsc::Sender<SinkEvent>,
}

impl ErrorSink {
    pub fn new(subsystem: &'static str, tx: mpsc::Sender<SinkEvent>) -> Self {
        Self { subsystem, tx }
    }

    /// Report an error. If the sink is gone (shutdown), log directly so
    /// nothing is silently lost.
    pub async fn report(&self, error: anyhow::Error) {
        let event = SinkEvent {
            subsystem: self.subsystem,
            error,
        };
        if let Err(mpsc::error::SendError(event)) = self.tx.send(event).await {
            error!("[DaprDockr] {}: {:#}", event.subsystem, event.error);
        }
    }
}

/// Drain the stream, logging each entry, until every sender is gone.
pub async fn run_sink(mut rx: mpsc::Receiver<SinkEvent>) {
    while let Some(event) = rx.recv().await {
        error!("[DaprDockr] {}: {:#}", event.subsystem, event.error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_report_delivers_tagged_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = ErrorSink::new("dns", tx);

        sink.report(anyhow::anyhow!("bind failed")).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.subsystem, "dns");
        assert!(event.error.to_string().contains("bind failed"));
    }

    #[tokio::test]
    async fn test_report_survives_closed_sink() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = ErrorSink::new("proxy", tx);
        // Must not panic or hang.
        sink.report(anyhow::anyhow!("late error")).await;
    }
}
