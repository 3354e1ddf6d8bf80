//! Connection worker - streams one transfer into its partial file
//!
//! The worker owns every status transition of its transfer while it runs.
//! Control operations only flip the [`WorkerSignals`] flags, which are
//! checked between chunk reads; the worker then flushes what it has,
//! records the outcome and reports it through the event bus.

use crate::engine::{EventBus, StoreWriter, TransferRegistry};
use crate::error::EngineError;
use futures::StreamExt;
use rdm_types::{Progress, Transfer, TransferEvent, TransferStatus};
use reqwest::header::{HeaderMap, CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RUNNING: u8 = 0;
const CANCELLED: u8 = 1;
const COMMITTED: u8 = 2;

/// Cooperative control flags shared between the scheduler and a worker
///
/// Cancellation and the worker's final commit race on one atomic, so a
/// transfer is either discarded or settled, never both.
#[derive(Debug, Default)]
pub struct WorkerSignals {
    paused: AtomicBool,
    fate: AtomicU8,
}

impl WorkerSignals {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Request cancellation; false once the worker has committed its outcome
    pub fn cancel(&self) -> bool {
        match self
            .fate
            .compare_exchange(RUNNING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == CANCELLED,
        }
    }

    /// Claim the right to settle as Completed or Failed; false if cancelled
    pub fn commit(&self) -> bool {
        self.fate
            .compare_exchange(RUNNING, COMMITTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.fate.load(Ordering::Acquire) == CANCELLED
    }

    pub fn is_committed(&self) -> bool {
        self.fate.load(Ordering::Acquire) == COMMITTED
    }
}

/// How a worker finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Completed,
    Paused,
    Cancelled,
    Failed,
}

/// Everything a worker needs besides its transfer
#[derive(Clone)]
pub struct WorkerContext {
    pub client: Client,
    pub registry: TransferRegistry,
    pub store: Option<StoreWriter>,
    pub events: EventBus,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    pub progress_interval: Duration,
    pub buffer_size: usize,
    /// Runtime the engine was built on; control calls may come from any thread
    pub runtime: tokio::runtime::Handle,
}

impl WorkerContext {
    pub(crate) fn persist_progress(&self, id: Uuid, bytes_downloaded: u64, total_bytes: Option<u64>) {
        if let Some(store) = &self.store {
            store.progress(id, bytes_downloaded, total_bytes);
        }
    }

    pub(crate) fn persist_status(&self, id: Uuid, status: TransferStatus, error: Option<String>) {
        if let Some(store) = &self.store {
            store.status(id, status, error);
        }
    }
}

/// Emits at most one progress event per interval
struct ProgressThrottle {
    interval: Duration,
    last: Instant,
}

impl ProgressThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    fn ready(&mut self) -> bool {
        if self.last.elapsed() >= self.interval {
            self.last = Instant::now();
            true
        } else {
            false
        }
    }
}

/// Downloads a single transfer over one connection
pub struct ConnectionWorker {
    transfer: Transfer,
    ctx: WorkerContext,
    signals: Arc<WorkerSignals>,
}

impl ConnectionWorker {
    pub fn new(
        transfer: Transfer,
        ctx: WorkerContext,
        signals: Arc<WorkerSignals>,
    ) -> Self {
        Self {
            transfer,
            ctx,
            signals,
        }
    }

    fn id(&self) -> Uuid {
        self.transfer.id
    }

    /// Run the transfer to an exit state; never returns an error
    pub async fn run(mut self) -> WorkerExit {
        info!(
            "Starting transfer {}: {} -> {} (offset {})",
            self.id(),
            self.transfer.url,
            self.transfer.destination().display(),
            self.transfer.resume_offset()
        );

        let result = self.download().await;
        self.settle(result).await
    }

    fn check_signals(&self) -> Result<(), EngineError> {
        if self.signals.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if self.signals.is_paused() {
            return Err(EngineError::Paused);
        }
        Ok(())
    }

    async fn download(&mut self) -> Result<(), EngineError> {
        self.check_signals()?;

        tokio::fs::create_dir_all(&self.transfer.directory).await?;
        let partial = self.transfer.partial_path();
        let mut offset = self.validate_partial(&partial).await?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&partial)
            .await?;
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        // Everything was received before the last pause
        if offset > 0 && self.transfer.total_bytes == Some(offset) {
            info!("Transfer {} already holds all {} bytes", self.id(), offset);
            self.mark_in_progress(offset, Some(offset))?;
            return Ok(());
        }

        let response = self.send_request(offset).await?;
        self.check_signals()?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            let message = if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("Unknown").to_string()
            } else {
                body.trim().to_string()
            };
            return Err(EngineError::ServerError {
                status: code,
                message,
            });
        }

        let content_range = parse_content_range(response.headers());
        if offset > 0 {
            if status == StatusCode::PARTIAL_CONTENT {
                let start = content_range.map(|(start, _)| start);
                if start != Some(offset) {
                    return Err(EngineError::ServerError {
                        status: status.as_u16(),
                        message: format!(
                            "Content-Range starts at {:?}, expected byte {}",
                            start, offset
                        ),
                    });
                }
            } else {
                self.restart_from_zero("server does not support range requests");
                offset = 0;
                file.set_len(0).await?;
                file.seek(SeekFrom::Start(0)).await?;
            }
        }

        let total = content_range
            .and_then(|(_, total)| total)
            .or_else(|| response.content_length().map(|len| len + offset));

        self.mark_in_progress(offset, total)?;

        let mut writer = BufWriter::with_capacity(self.ctx.buffer_size, file);
        let streamed = self.stream_body(response, &mut writer, offset, total).await;

        // Keep the bytes on disk in step with the recorded progress
        let flushed = writer.flush().await;
        let downloaded = streamed?;
        flushed?;
        writer.get_mut().sync_all().await?;

        if let Some(expected) = total {
            if downloaded != expected {
                return Err(EngineError::LengthMismatch {
                    expected,
                    received: downloaded,
                });
            }
        }

        self.record_progress(downloaded, Some(downloaded));
        Ok(())
    }

    /// Append the response body to `writer`; returns the byte count reached
    async fn stream_body(
        &mut self,
        response: Response,
        writer: &mut BufWriter<File>,
        offset: u64,
        total: Option<u64>,
    ) -> Result<u64, EngineError> {
        let id = self.id();
        let mut downloaded = offset;
        let mut throttle = ProgressThrottle::new(self.ctx.progress_interval);
        let mut stream = std::pin::pin!(response.bytes_stream());

        loop {
            self.check_signals()?;

            let next = tokio::time::timeout(self.ctx.read_timeout, stream.next())
                .await
                .map_err(|_| EngineError::Timeout)?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;

            writer.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if let Some(expected) = total {
                if downloaded > expected {
                    return Err(EngineError::LengthMismatch {
                        expected,
                        received: downloaded,
                    });
                }
            }

            self.record_progress(downloaded, total);
            if throttle.ready() {
                self.emit_progress();
                self.ctx.persist_progress(id, downloaded, total);
            }
        }

        debug!("Transfer {}: stream finished at {} bytes", id, downloaded);
        Ok(downloaded)
    }

    async fn send_request(&self, offset: u64) -> Result<Response, EngineError> {
        let mut request = self.ctx.client.get(&self.transfer.url);
        for (name, value) in &self.transfer.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if offset > 0 {
            debug!("Transfer {} requesting range bytes={}-", self.id(), offset);
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let deadline = self.ctx.connect_timeout + self.ctx.read_timeout;
        let response = tokio::time::timeout(deadline, request.send())
            .await
            .map_err(|_| EngineError::Timeout)??;
        Ok(response)
    }

    /// Resume offset confirmed against the partial file on disk
    async fn validate_partial(&mut self, partial: &Path) -> Result<u64, EngineError> {
        let expected = self.transfer.resume_offset();
        let found = match tokio::fs::metadata(partial).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        if found == expected {
            return Ok(expected);
        }
        if found > expected && expected > 0 {
            // Bytes past the last persisted offset are truncated on open
            debug!(
                "Transfer {}: partial file holds {} bytes, resuming from {}",
                self.id(),
                found,
                expected
            );
            return Ok(expected);
        }
        if expected == 0 {
            debug!("Transfer {}: discarding stale partial file", self.id());
            return Ok(0);
        }

        let mismatch = EngineError::ResumeMismatch { expected, found };
        self.restart_from_zero(&mismatch.to_string());
        Ok(0)
    }

    fn restart_from_zero(&mut self, reason: &str) {
        let message = format!("{}; restarting from zero", reason);
        warn!("Transfer {}: {}", self.id(), message);

        self.record_progress(0, self.transfer.total_bytes);
        self.ctx
            .persist_progress(self.id(), 0, self.transfer.total_bytes);
        self.ctx
            .events
            .emit(self.id(), TransferEvent::Warning { message });
    }

    fn record_progress(&mut self, bytes_downloaded: u64, total_bytes: Option<u64>) {
        self.transfer.bytes_downloaded = bytes_downloaded;
        self.transfer.total_bytes = total_bytes;
        self.ctx
            .registry
            .record_progress(self.id(), bytes_downloaded, total_bytes);
    }

    fn emit_progress(&self) {
        self.ctx
            .events
            .emit(self.id(), TransferEvent::Progress(self.transfer.progress()));
    }

    fn mark_in_progress(&mut self, offset: u64, total: Option<u64>) -> Result<(), EngineError> {
        let id = self.id();
        self.record_progress(offset, total);
        self.ctx
            .registry
            .transition(id, TransferStatus::InProgress, "download")?;

        self.ctx.persist_progress(id, offset, total);
        self.ctx.persist_status(id, TransferStatus::InProgress, None);
        self.emit_progress();
        Ok(())
    }

    async fn settle(self, result: Result<(), EngineError>) -> WorkerExit {
        if self.signals.is_cancelled() {
            return self.discard().await;
        }

        match result {
            Err(EngineError::Paused) => return self.pause(),
            // A pause was requested; the trailing error does not matter
            Err(_) if self.signals.is_paused() => return self.pause(),
            _ => {}
        }

        if !self.signals.commit() {
            return self.discard().await;
        }
        match result {
            Ok(()) => self.complete().await,
            Err(e) => self.fail(e),
        }
    }

    async fn complete(self) -> WorkerExit {
        let id = self.id();
        let destination = self.transfer.destination();

        if let Err(e) = tokio::fs::rename(self.transfer.partial_path(), &destination).await {
            return self.fail(e.into());
        }

        if let Err(e) = self
            .ctx
            .registry
            .transition(id, TransferStatus::Completed, "complete")
        {
            warn!("Transfer {} completed but could not be marked: {}", id, e);
        }

        let progress = self.transfer.progress();
        self.ctx
            .persist_progress(id, progress.current_bytes, progress.total_bytes);
        self.ctx.persist_status(id, TransferStatus::Completed, None);
        self.emit_progress();
        self.ctx.events.emit(id, TransferEvent::Complete);

        info!(
            "Transfer {} completed: {} ({} bytes)",
            id,
            destination.display(),
            progress.current_bytes
        );
        WorkerExit::Completed
    }

    fn pause(self) -> WorkerExit {
        let id = self.id();
        let Progress {
            current_bytes,
            total_bytes,
        } = self.transfer.progress();

        if let Err(e) = self
            .ctx
            .registry
            .transition(id, TransferStatus::Paused, "pause")
        {
            warn!("Transfer {} could not be marked paused: {}", id, e);
        }
        self.ctx.persist_progress(id, current_bytes, total_bytes);
        self.ctx.persist_status(id, TransferStatus::Paused, None);
        self.ctx.events.emit(id, TransferEvent::Pause);

        info!("Transfer {} paused at {} bytes", id, current_bytes);
        WorkerExit::Paused
    }

    fn fail(self, e: EngineError) -> WorkerExit {
        let id = self.id();
        error!("Transfer {} failed: {}", id, e);

        let reason = e.to_string();
        if let Err(err) = self.ctx.registry.fail(id, reason.clone()) {
            warn!("Transfer {} could not be marked failed: {}", id, err);
        }
        self.ctx.persist_progress(
            id,
            self.transfer.bytes_downloaded,
            self.transfer.total_bytes,
        );
        self.ctx
            .persist_status(id, TransferStatus::Failed, Some(reason));
        self.ctx
            .events
            .emit(id, TransferEvent::Error(e.to_error_info()));
        WorkerExit::Failed
    }

    async fn discard(self) -> WorkerExit {
        let id = self.id();
        remove_if_exists(&self.transfer.partial_path()).await;

        self.ctx.registry.remove(id);
        if let Some(store) = &self.ctx.store {
            store.delete(id);
        }
        self.ctx.events.emit(id, TransferEvent::Cancel);

        info!("Transfer {} cancelled", id);
        WorkerExit::Cancelled
    }
}

/// Delete a file, treating a missing file as success
pub async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Start offset and total size from a `Content-Range: bytes a-b/total` header
fn parse_content_range(headers: &HeaderMap) -> Option<(u64, Option<u64>)> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes")?.trim();
    let (span, total) = range.split_once('/')?;
    let (start, _end) = span.split_once('-')?;

    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, total))
}
