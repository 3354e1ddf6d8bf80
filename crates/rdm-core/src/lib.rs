//! RDM Core - Download Engine
//!
//! This crate provides the resumable download engine behind RDM.
//! It handles concurrent single-connection downloads, pause/resume/cancel,
//! progress listeners and optional SQLite persistence.

pub mod engine;
mod error;
mod listener;
mod scheduler;
mod storage;

pub use error::*;
pub use listener::*;
pub use scheduler::*;
pub use storage::*;

use chrono::Utc;
use engine::{EventBus, StoreWriter, TransferRegistry, TransferStore, WorkerContext};
use rdm_types::{
    EngineConfig, EngineEvent, Transfer, TransferRequest, TransferRequestBuilder, TransferStatus,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// The main RDM engine instance
///
/// Every control operation returns immediately; network and disk work
/// happens on worker tasks and is reported through [`Listeners`] and
/// [`DownloadEngine::subscribe`].
pub struct DownloadEngine {
    config: EngineConfig,
    registry: TransferRegistry,
    scheduler: Arc<Scheduler>,
    events: EventBus,
    store: Option<StoreWriter>,
    /// Transfers found unfinished in the store at construction
    restored: HashSet<Uuid>,
}

impl DownloadEngine {
    /// Create a new engine
    ///
    /// With `database_enabled`, the store at `config.database_path()` is
    /// opened and scanned. Unfinished transfers come back Paused and are
    /// listed by [`DownloadEngine::resumable`]; nothing resumes on its own.
    pub async fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let registry = TransferRegistry::new();
        let mut restored = HashSet::new();

        let store = if config.database_enabled {
            let store = TransferStore::open(config.database_path()).await?;

            for mut transfer in store.load_all().await? {
                if !transfer.is_terminal() {
                    if transfer.status != TransferStatus::Paused {
                        debug!(
                            "Transfer {} was {} when last seen, marking paused",
                            transfer.id, transfer.status
                        );
                        transfer.status = TransferStatus::Paused;
                        store
                            .update_status(transfer.id, TransferStatus::Paused, None)
                            .await?;
                    }
                    restored.insert(transfer.id);
                }
                registry.insert(transfer);
            }

            info!(
                "Loaded {} transfers from {} ({} resumable)",
                registry.all().len(),
                config.database_path().display(),
                restored.len()
            );
            Some(StoreWriter::spawn(store))
        } else {
            None
        };

        let events = EventBus::spawn(registry.clone(), config.database_enabled);

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .build()?;

        let ctx = WorkerContext {
            client,
            registry: registry.clone(),
            store: store.clone(),
            events: events.clone(),
            read_timeout: config.read_timeout(),
            connect_timeout: config.connect_timeout(),
            progress_interval: config.progress_interval(),
            buffer_size: config.buffer_size.max(1),
            runtime: tokio::runtime::Handle::current(),
        };
        let scheduler = Scheduler::new(ctx, config.max_concurrent_downloads);

        info!(
            "Download engine ready (max {} concurrent, persistence {})",
            scheduler.limit(),
            if config.database_enabled { "on" } else { "off" }
        );

        Ok(Self {
            config,
            registry,
            scheduler,
            events,
            store,
            restored,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Describe a download; nothing happens until [`DownloadEngine::start`]
    pub fn download(
        &self,
        url: impl Into<String>,
        directory: impl Into<PathBuf>,
        file_name: impl Into<String>,
    ) -> TransferRequestBuilder {
        TransferRequest::builder(url, directory, file_name)
    }

    /// Submit a download and return its id without waiting for the network
    pub fn start(&self, request: TransferRequest, listeners: Listeners) -> Result<Uuid, EngineError> {
        validate_request(&request)?;

        let transfer = Transfer::from_request(request);
        let id = transfer.id;

        self.registry
            .insert_unique(transfer.clone())
            .map_err(EngineError::AlreadyExists)?;
        self.events.register(id, listeners);
        if let Some(store) = &self.store {
            store.upsert(&transfer);
        }

        let status = self.scheduler.admit(id)?;
        info!(
            "Transfer {} submitted: {} -> {} ({})",
            id,
            transfer.url,
            transfer.destination().display(),
            status
        );
        Ok(id)
    }

    /// Attach listeners to a known transfer, replacing any previous ones
    pub fn listen(&self, id: Uuid, listeners: Listeners) -> Result<(), EngineError> {
        if self.registry.get(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        self.events.register(id, listeners);
        Ok(())
    }

    // ========================================================================
    // Control
    // ========================================================================

    pub fn pause(&self, id: Uuid) -> Result<(), EngineError> {
        self.scheduler.pause(id)
    }

    /// Resume a paused transfer from where it stopped
    pub fn resume(&self, id: Uuid) -> Result<(), EngineError> {
        let status = self.scheduler.resume(id)?;
        info!("Transfer {} resumed ({})", id, status);
        Ok(())
    }

    /// Cancel a transfer and delete its partial file
    pub fn cancel(&self, id: Uuid) -> Result<(), EngineError> {
        self.scheduler.cancel(id)
    }

    /// Pause every running or queued transfer; returns how many were paused
    pub fn pause_all(&self) -> usize {
        self.scheduler
            .pending()
            .into_iter()
            .filter(|id| self.pause(*id).is_ok())
            .count()
    }

    /// Cancel every transfer that can still be cancelled
    pub fn cancel_all(&self) -> usize {
        self.registry
            .all()
            .into_iter()
            .filter(|t| t.status.can_cancel())
            .filter(|t| self.cancel(t.id).is_ok())
            .count()
    }

    /// Cancel every cancellable transfer carrying `tag`
    pub fn cancel_tag(&self, tag: &str) -> usize {
        let cancelled = self
            .registry
            .tagged(tag)
            .into_iter()
            .filter(|id| self.cancel(*id).is_ok())
            .count();
        debug!("Cancelled {} transfers tagged {:?}", cancelled, tag);
        cancelled
    }

    /// Forget a finished or paused transfer
    ///
    /// Removes the record and any leftover partial file. A completed
    /// file stays on disk.
    pub async fn clear(&self, id: Uuid) -> Result<(), EngineError> {
        let transfer = self.scheduler.forget(id)?;

        if let Some(store) = &self.store {
            store.delete(id);
        }
        if transfer.status != TransferStatus::Completed {
            engine::remove_if_exists(&transfer.partial_path()).await;
        }

        info!("Transfer {} cleared", id);
        Ok(())
    }

    /// Clear every idle transfer not updated within `older_than`
    pub async fn clean_up(&self, older_than: chrono::Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut cleared = 0;

        for transfer in self.registry.all() {
            if transfer.updated_at >= cutoff {
                continue;
            }
            if transfer.is_terminal() || transfer.status == TransferStatus::Paused {
                match self.clear(transfer.id).await {
                    Ok(()) => cleared += 1,
                    Err(e) => warn!("Failed to clean up transfer {}: {}", transfer.id, e),
                }
            }
        }

        info!("Cleaned up {} transfers older than {}", cleared, cutoff);
        cleared
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current status, `Unknown` for ids the engine does not track
    pub fn status(&self, id: Uuid) -> TransferStatus {
        self.registry.status(id)
    }

    pub fn transfer(&self, id: Uuid) -> Option<Transfer> {
        self.registry.get(id)
    }

    /// All known transfers, oldest first
    pub fn transfers(&self) -> Vec<Transfer> {
        self.registry.all()
    }

    /// Transfers restored from the store that are still paused
    pub fn resumable(&self) -> Vec<Transfer> {
        self.registry
            .all()
            .into_iter()
            .filter(|t| self.restored.contains(&t.id) && t.status == TransferStatus::Paused)
            .collect()
    }

    /// Most recent transfer matching these request parameters
    pub fn find(&self, url: &str, directory: impl AsRef<Path>, file_name: &str) -> Option<Transfer> {
        self.registry.find(url, directory.as_ref(), file_name)
    }

    /// Receive every event emitted by the engine
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Wait until every pending persistence write is applied
    pub async fn flush(&self) {
        if let Some(store) = &self.store {
            store.flush().await;
        }
    }

    /// Pause everything, wait for the workers to stop and flush the store
    pub async fn shutdown(&self) {
        let paused = self.pause_all();
        info!("Shutting down, pausing {} transfers", paused);

        self.scheduler.wait_idle().await;
        self.flush().await;
        info!("Download engine stopped");
    }
}

/// Reject requests that could never be downloaded
fn validate_request(request: &TransferRequest) -> Result<(), EngineError> {
    let url = Url::parse(&request.url)
        .map_err(|e| EngineError::InvalidUrl(format!("{}: {}", request.url, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(EngineError::InvalidUrl(format!(
            "{}: unsupported scheme {}",
            request.url,
            url.scheme()
        )));
    }

    let name = request.file_name.as_str();
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(EngineError::InvalidFileName(request.file_name.clone()));
    }
    Ok(())
}
