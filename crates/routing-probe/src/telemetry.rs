//! Fire-and-forget measurement telemetry.
//!
//! [`TelemetrySink::emit`] never waits: events go into a bounded queue and a
//! background task hands them to a [`TelemetryExporter`] in batches. A batch
//! is flushed when `batch_size` events are buffered or `batch_time` has
//! passed since the last flush, whichever comes first. When the queue is full
//! the event is dropped.

use crate::content::ContentId;
use crate::routing::{PeerId, RoutingStrategy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Provide,
    Retrieval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub kind: EventKind,
    pub peer_id: PeerId,
    pub cid: ContentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingStrategy>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub routing_table_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub batch_size: usize,
    pub batch_time: Duration,
    /// Capacity of the queue between `emit` and the batching task.
    pub queue_capacity: usize,
}

/// Shortest period between time-based flushes.
pub const MIN_BATCH_TIME: Duration = Duration::from_millis(1);

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            batch_time: Duration::from_secs(30),
            queue_capacity: 10_000,
        }
    }
}

/// Destination of telemetry batches.
#[async_trait]
pub trait TelemetryExporter: Send + Sync + 'static {
    async fn export(&self, batch: &[TelemetryEvent]) -> anyhow::Result<()>;
}

/// Writes batches to the log.
#[derive(Debug, Default)]
pub struct LogExporter;

#[async_trait]
impl TelemetryExporter for LogExporter {
    async fn export(&self, batch: &[TelemetryEvent]) -> anyhow::Result<()> {
        info!(events = batch.len(), "Telemetry batch");
        for event in batch {
            debug!(
                kind = ?event.kind,
                cid = %event.cid,
                dur = event.duration.as_secs_f64(),
                rt_size = event.routing_table_size,
                error = event.error.as_deref().unwrap_or(""),
                "Telemetry event"
            );
        }
        Ok(())
    }
}

/// Appends batches as JSON lines to a file.
#[derive(Debug)]
pub struct JsonlExporter {
    path: PathBuf,
}

impl JsonlExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TelemetryExporter for JsonlExporter {
    async fn export(&self, batch: &[TelemetryEvent]) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        for event in batch {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Handle used by the measurement path to emit events.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    tx: mpsc::Sender<TelemetryEvent>,
}

impl TelemetrySink {
    /// Start the batching task. It runs until every sink clone is dropped,
    /// then flushes what is left and exits.
    pub fn spawn(
        config: TelemetryConfig,
        exporter: Arc<dyn TelemetryExporter>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = tokio::spawn(run_batcher(rx, config, exporter));
        (Self { tx }, handle)
    }

    /// A sink that discards everything.
    pub fn noop() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self { tx }
    }

    pub fn emit(&self, event: TelemetryEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!("Dropping telemetry event: {}", e);
        }
    }
}

async fn run_batcher(
    mut rx: mpsc::Receiver<TelemetryEvent>,
    config: TelemetryConfig,
    exporter: Arc<dyn TelemetryExporter>,
) {
    let batch_size = config.batch_size.max(1);
    let mut buffer = Vec::with_capacity(batch_size);

    let batch_time = config.batch_time.max(MIN_BATCH_TIME);
    let mut ticker = tokio::time::interval(batch_time);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    buffer.push(event);
                    if buffer.len() >= batch_size {
                        flush(&mut buffer, exporter.as_ref()).await;
                        ticker.reset();
                    }
                }
                None => {
                    flush(&mut buffer, exporter.as_ref()).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                flush(&mut buffer, exporter.as_ref()).await;
            }
        }
    }

    debug!("Telemetry batcher stopped");
}

async fn flush(buffer: &mut Vec<TelemetryEvent>, exporter: &dyn TelemetryExporter) {
    if buffer.is_empty() {
        return;
    }

    let batch = std::mem::take(buffer);
    if let Err(e) = exporter.export(&batch).await {
        warn!(events = batch.len(), "Failed to export telemetry batch: {:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collecting {
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl TelemetryExporter for Collecting {
        async fn export(&self, batch: &[TelemetryEvent]) -> anyhow::Result<()> {
            self.batches.lock().unwrap().push(batch.len());
            Ok(())
        }
    }

    fn event() -> TelemetryEvent {
        TelemetryEvent {
            kind: EventKind::Retrieval,
            peer_id: PeerId::new("peer"),
            cid: ContentId::from_payload(b"t"),
            routing: Some(RoutingStrategy::Dht),
            duration: Duration::from_millis(3),
            routing_table_size: 10,
            error: None,
            scheduler_id: None,
            timestamp: Utc::now(),
        }
    }

    async fn wait_for_batches(exporter: &Collecting, n: usize) -> Vec<usize> {
        for _ in 0..200 {
            let batches = exporter.batches.lock().unwrap().clone();
            if batches.len() >= n {
                return batches;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        exporter.batches.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_flushes_when_batch_is_full() {
        let exporter = Arc::new(Collecting::default());
        let config = TelemetryConfig {
            batch_size: 3,
            batch_time: Duration::from_secs(3600),
            queue_capacity: 16,
        };
        let (sink, _handle) = TelemetrySink::spawn(config, exporter.clone());

        for _ in 0..7 {
            sink.emit(event());
        }

        assert_eq!(wait_for_batches(&exporter, 2).await, vec![3, 3]);
    }

    #[tokio::test]
    async fn test_flushes_after_batch_time() {
        let exporter = Arc::new(Collecting::default());
        let config = TelemetryConfig {
            batch_size: 100,
            batch_time: Duration::from_millis(50),
            queue_capacity: 16,
        };
        let (sink, _handle) = TelemetrySink::spawn(config, exporter.clone());

        sink.emit(event());
        sink.emit(event());

        assert_eq!(wait_for_batches(&exporter, 1).await, vec![2]);
    }

    #[tokio::test]
    async fn test_flushes_remainder_on_drop() {
        let exporter = Arc::new(Collecting::default());
        let config = TelemetryConfig {
            batch_size: 100,
            batch_time: Duration::from_secs(3600),
            queue_capacity: 16,
        };
        let (sink, handle) = TelemetrySink::spawn(config, exporter.clone());

        sink.emit(event());
        drop(sink);
        handle.await.unwrap();

        assert_eq!(*exporter.batches.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_zero_batch_time_still_flushes() {
        let exporter = Arc::new(Collecting::default());
        let config = TelemetryConfig {
            batch_size: 100,
            batch_time: Duration::ZERO,
            queue_capacity: 16,
        };
        let (sink, handle) = TelemetrySink::spawn(config, exporter.clone());

        sink.emit(event());
        assert_eq!(wait_for_batches(&exporter, 1).await, vec![1]);

        drop(sink);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_noop_sink_never_blocks() {
        let sink = TelemetrySink::noop();
        for _ in 0..10 {
            sink.emit(event());
        }
    }

    #[tokio::test]
    async fn test_jsonl_exporter_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.jsonl");
        let exporter = JsonlExporter::new(&path);

        exporter.export(&[event(), event()]).await.unwrap();
        exporter.export(&[event()]).await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(text.lines().count(), 3);
        let first: TelemetryEvent = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first.kind, EventKind::Retrieval);
    }
}
