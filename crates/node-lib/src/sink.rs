//! Allocation log sinks
//!
//! The control loop hands each tick's records to a single background worker
//! so that a slow or failing sink never delays the next tick.

use crate::health::{components, HealthRegistry};
use crate::models::{AllocationRecord, LOG_HEADER};
use crate::observability::NodeMetrics;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Destination for allocation log records
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn emit(&self, record: &AllocationRecord) -> io::Result<()>;
}

/// Emits each record as a structured `tracing` event
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

#[async_trait]
impl RecordSink for TracingSink {
    async fn emit(&self, record: &AllocationRecord) -> io::Result<()> {
        info!(
            event = "allocation",
            node = %record.node_id,
            service = %record.service_id,
            target_rt_ms = record.target_rt_ms,
            observed_rt_ms = record.observed_rt_ms,
            requests = record.requests,
            allocation = record.allocation,
            line = %record.csv_line(),
            "Allocation applied"
        );
        Ok(())
    }
}

/// Appends records to a CSV file that starts with `LOG_HEADER`
pub struct CsvFileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl CsvFileSink {
    /// Create (or truncate) the file and write the header
    pub async fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::create(&path).await?;
        file.write_all(LOG_HEADER.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        debug!(path = %path.display(), "Allocation log created");

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for CsvFileSink {
    async fn emit(&self, record: &AllocationRecord) -> io::Result<()> {
        let mut line = record.csv_line();
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

/// How long `LogDispatcher::shutdown` waits for queued records
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared, growable list of sinks
pub type SinkList = Arc<RwLock<Vec<Arc<dyn RecordSink>>>>;

/// Single-worker queue feeding records to the sinks in tick order
pub struct LogDispatcher {
    tx: mpsc::UnboundedSender<Vec<AllocationRecord>>,
    handle: JoinHandle<()>,
}

impl LogDispatcher {
    pub fn spawn(sinks: SinkList, metrics: NodeMetrics, health: HealthRegistry) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<AllocationRecord>>();

        let handle = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let sinks: Vec<Arc<dyn RecordSink>> = sinks.read().await.clone();
                let mut failed = false;
                for record in &batch {
                    for sink in &sinks {
                        if let Err(e) = emit_isolated(sink.clone(), record.clone()).await {
                            failed = true;
                            metrics.inc_sink_errors();
                            warn!(
                                service = %record.service_id,
                                error = %e,
                                "Failed to emit allocation record"
                            );
                        }
                    }
                }
                if failed {
                    health
                        .set_degraded(components::LOG_SINK, "allocation record emission failed")
                        .await;
                } else if !sinks.is_empty() {
                    health.set_healthy(components::LOG_SINK).await;
                }
            }
            debug!("Log dispatcher stopped");
        });

        Self { tx, handle }
    }

    /// Queue one tick's records; never waits for the sinks
    pub fn dispatch(&self, batch: Vec<AllocationRecord>) {
        if batch.is_empty() {
            return;
        }
        if self.tx.send(batch).is_err() {
            warn!("Log dispatcher is gone, dropping allocation records");
        }
    }

    /// Stop the worker after it has flushed what was already queued
    ///
    /// Gives up after `SHUTDOWN_GRACE` and aborts whatever a stuck sink is
    /// still doing.
    pub async fn shutdown(mut self) {
        drop(self.tx);
        if timeout(SHUTDOWN_GRACE, &mut self.handle).await.is_err() {
            warn!(
                grace_ms = SHUTDOWN_GRACE.as_millis() as u64,
                "Log dispatcher did not drain in time, aborting"
            );
            self.handle.abort();
        }
    }
}

/// Emission task that dies with the dispatcher worker awaiting it
struct EmitTask(JoinHandle<io::Result<()>>);

impl Drop for EmitTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run one emission in its own task so a panicking sink only loses the record
async fn emit_isolated(sink: Arc<dyn RecordSink>, record: AllocationRecord) -> io::Result<()> {
    let mut task = EmitTask(tokio::spawn(async move { sink.emit(&record).await }));
    match (&mut task.0).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(io::Error::new(io::ErrorKind::Other, "sink panicked")),
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
    }
}
