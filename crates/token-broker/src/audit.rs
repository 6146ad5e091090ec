//! Access audit sink
//!
//! Every issuance attempt produces exactly one [`AuditRecord`]. Handlers hand
//! records to an [`AuditSink`], which never blocks: records go into a bounded
//! channel drained by a single [`AuditWorker`] task that owns the writers.
//! When the channel is full the record is counted as dropped and logged; the
//! request itself is unaffected.

use std::fmt::Debug;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::types::PrincipalId;

/// Principal label used when identity could not be established
pub const UNVERIFIED: &str = "unverified";

/// Log target of access records written through `tracing`
pub const ACCESS_LOG_TARGET: &str = "token_broker::access";

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Terminal outcome of one issuance attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Unauthenticated,
    UnknownPrincipal,
    StoreUnavailable,
    ScopeDenied,
    InvalidRequest,
    Cancelled,
}

impl Outcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Unauthenticated => "unauthenticated",
            Self::UnknownPrincipal => "unknown_principal",
            Self::StoreUnavailable => "store_unavailable",
            Self::ScopeDenied => "scope_denied",
            Self::InvalidRequest => "invalid_request",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One issuance attempt, successful or not
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub principal: Option<PrincipalId>,
    pub permission: Option<String>,
    pub outcome: Outcome,
    pub latency: Duration,
    pub peer: Option<SocketAddr>,
    pub cached: bool,
}

impl AuditRecord {
    /// The principal, or `unverified`.
    #[must_use]
    pub fn principal_label(&self) -> &str {
        self.principal.as_ref().map_or(UNVERIFIED, PrincipalId::as_str)
    }
}

/// Serialized form of a record
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuditLine<'a> {
    timestamp: &'a DateTime<Utc>,
    principal: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    permission: Option<&'a str>,
    outcome: Outcome,
    latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    peer: Option<&'a SocketAddr>,
    cached: bool,
}

impl<'a> From<&'a AuditRecord> for AuditLine<'a> {
    fn from(record: &'a AuditRecord) -> Self {
        Self {
            timestamp: &record.timestamp,
            principal: record.principal_label(),
            permission: record.permission.as_deref(),
            outcome: record.outcome,
            latency_ms: record.latency.as_secs_f64() * 1000.0,
            peer: record.peer.as_ref(),
            cached: record.cached,
        }
    }
}

/// Destination for audit records. Writers run on the audit worker task only.
#[async_trait]
pub trait AuditWriter: Send + Debug {
    async fn write(&mut self, record: &AuditRecord) -> Result<(), AuditError>;

    async fn flush(&mut self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Writes each record as an `info` event under [`ACCESS_LOG_TARGET`]
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditWriter;

#[async_trait]
impl AuditWriter for TracingAuditWriter {
    async fn write(&mut self, record: &AuditRecord) -> Result<(), AuditError> {
        tracing::info!(
            target: ACCESS_LOG_TARGET,
            principal = record.principal_label(),
            permission = record.permission.as_deref().unwrap_or("-"),
            outcome = record.outcome.as_str(),
            latency_ms = record.latency.as_secs_f64() * 1000.0,
            peer = record.peer.map(|p| p.to_string()).as_deref().unwrap_or("-"),
            cached = record.cached,
            "token request"
        );
        Ok(())
    }
}

/// Appends one JSON object per line to a file
#[derive(Debug)]
pub struct JsonLinesAuditWriter {
    path: PathBuf,
    out: BufWriter<tokio::fs::File>,
}

impl JsonLinesAuditWriter {
    pub async fn open(path: &Path) -> Result<Self, AuditError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditWriter for JsonLinesAuditWriter {
    async fn write(&mut self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(&AuditLine::from(record))?;
        line.push(b'\n');
        self.out.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), AuditError> {
        self.out.flush().await?;
        Ok(())
    }
}

/// Cloneable, non-blocking handle for emitting audit records
#[derive(Debug, Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditRecord>,
    dropped: Arc<AtomicU64>,
}

impl AuditSink {
    /// Emit one record and its metrics sample. Never waits.
    pub fn record(&self, record: AuditRecord) {
        #[cfg(feature = "metrics")]
        crate::observability::record_issuance(record.outcome.as_str(), record.latency);

        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "metrics")]
                crate::observability::record_audit_dropped();
                tracing::warn!(
                    principal = record.principal_label(),
                    outcome = record.outcome.as_str(),
                    "Audit buffer full, record dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    principal = record.principal_label(),
                    outcome = record.outcome.as_str(),
                    "Audit sink closed, record dropped"
                );
            }
        }
    }

    /// Records lost to a full or closed buffer
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Background task draining the sink into its writers
#[derive(Debug)]
pub struct AuditWorker {
    handle: JoinHandle<u64>,
    stop: CancellationToken,
}

impl AuditWorker {
    /// Stop accepting work, write everything still buffered, flush the writers.
    /// Returns the number of records written over the worker's lifetime.
    pub async fn close(self) -> u64 {
        self.stop.cancel();
        match self.handle.await {
            Ok(written) => written,
            Err(e) => {
                tracing::error!(error = %e, "Audit worker terminated abnormally");
                0
            }
        }
    }
}

/// Open the audit sink: spawn the worker that owns `writers`.
pub fn open(capacity: usize, writers: Vec<Box<dyn AuditWriter>>) -> (AuditSink, AuditWorker) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stop = CancellationToken::new();

    let handle = tokio::spawn(run_worker(rx, writers, stop.clone()));

    let sink = AuditSink {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sink, AuditWorker { handle, stop })
}

async fn run_worker(
    mut rx: mpsc::Receiver<AuditRecord>,
    mut writers: Vec<Box<dyn AuditWriter>>,
    stop: CancellationToken,
) -> u64 {
    let mut written = 0;

    loop {
        tokio::select! {
            biased;
            record = rx.recv() => match record {
                Some(record) => {
                    write_all(&mut writers, &record).await;
                    written += 1;
                }
                None => break,
            },
            () = stop.cancelled() => break,
        }
    }

    rx.close();
    while let Ok(record) = rx.try_recv() {
        write_all(&mut writers, &record).await;
        written += 1;
    }

    for writer in &mut writers {
        if let Err(e) = writer.flush().await {
            tracing::warn!(writer = ?writer, error = %e, "Audit flush failed");
        }
    }

    tracing::debug!(written, "Audit worker stopped");
    written
}

async fn write_all(writers: &mut [Box<dyn AuditWriter>], record: &AuditRecord) {
    for writer in writers.iter_mut() {
        if let Err(e) = writer.write(record).await {
            tracing::warn!(writer = ?writer, error = %e, "Audit write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone, Default)]
    struct MemoryWriter {
        records: Arc<Mutex<Vec<AuditRecord>>>,
        flushed: Arc<AtomicU64>,
    }

    #[async_trait]
    impl AuditWriter for MemoryWriter {
        async fn write(&mut self, record: &AuditRecord) -> Result<(), AuditError> {
            self.records.lock().push(record.clone());
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), AuditError> {
            self.flushed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FailingWriter;

    #[async_trait]
    impl AuditWriter for FailingWriter {
        async fn write(&mut self, _record: &AuditRecord) -> Result<(), AuditError> {
            Err(std::io::Error::other("disk full").into())
        }
    }

    fn record(outcome: Outcome, principal: Option<&str>) -> AuditRecord {
        AuditRecord {
            timestamp: Utc::now(),
            principal: principal.map(|p| PrincipalId::new(p).unwrap()),
            permission: None,
            outcome,
            latency: Duration::from_millis(3),
            peer: None,
            cached: false,
        }
    }

    #[test]
    fn test_principal_label() {
        assert_eq!(record(Outcome::Unauthenticated, None).principal_label(), "unverified");
        assert_eq!(record(Outcome::Success, Some("svc-a")).principal_label(), "svc-a");
    }

    #[test]
    fn test_audit_line_serialization() {
        let mut rec = record(Outcome::ScopeDenied, Some("svc-a"));
        rec.permission = Some("gateway".into());
        let json = serde_json::to_value(AuditLine::from(&rec)).unwrap();

        assert_eq!(json["principal"], "svc-a");
        assert_eq!(json["permission"], "gateway");
        assert_eq!(json["outcome"], "scope_denied");
        assert!(json.get("peer").is_none());
        assert!(json["latencyMs"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_worker_writes_and_flushes_on_close() {
        let writer = MemoryWriter::default();
        let (sink, worker) = open(16, vec![Box::new(writer.clone())]);

        sink.record(record(Outcome::Success, Some("svc-a")));
        sink.record(record(Outcome::Unauthenticated, None));

        assert_eq!(worker.close().await, 2);
        assert_eq!(writer.records.lock().len(), 2);
        assert_eq!(writer.flushed.load(Ordering::Relaxed), 1);
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_buffer_drops_without_blocking() {
        let writer = MemoryWriter::default();
        let (sink, worker) = open(1, vec![Box::new(writer.clone())]);

        // The worker cannot run until we yield, so the second and third records overflow.
        sink.record(record(Outcome::Success, Some("svc-a")));
        sink.record(record(Outcome::Success, Some("svc-b")));
        sink.record(record(Outcome::Success, Some("svc-c")));

        assert_eq!(sink.dropped(), 2);
        assert_eq!(worker.close().await, 1);
        assert_eq!(writer.records.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_record_after_close_is_dropped() {
        let (sink, worker) = open(4, vec![Box::new(TracingAuditWriter)]);
        worker.close().await;

        sink.record(record(Outcome::Success, Some("svc-a")));
        assert_eq!(sink.dropped(), 1);
    }

    #[tokio::test]
    async fn test_failing_writer_does_not_stop_others() {
        let writer = MemoryWriter::default();
        let (sink, worker) = open(4, vec![Box::new(FailingWriter), Box::new(writer.clone())]);

        sink.record(record(Outcome::Success, Some("svc-a")));
        worker.close().await;

        assert_eq!(writer.records.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_json_lines_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let writer = JsonLinesAuditWriter::open(&path).await.unwrap();
        assert_eq!(writer.path(), path);
        let (sink, worker) = open(4, vec![Box::new(writer)]);

        sink.record(record(Outcome::Success, Some("svc-a")));
        sink.record(record(Outcome::UnknownPrincipal, Some("svc-c")));
        worker.close().await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["outcome"], "success");
        assert_eq!(lines[1]["principal"], "svc-c");
    }
}
