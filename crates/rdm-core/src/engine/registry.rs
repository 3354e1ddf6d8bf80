//! Transfer registry - the in-memory source of truth for transfer state

use crate::error::EngineError;
use chrono::Utc;
use parking_lot::RwLock;
use rdm_types::{Progress, Transfer, TransferStatus};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Maps transfer ids to their current state
#[derive(Clone, Debug, Default)]
pub struct TransferRegistry {
    transfers: Arc<RwLock<HashMap<Uuid, Transfer>>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, transfer: Transfer) {
        self.transfers.write().insert(transfer.id, transfer);
    }

    pub fn get(&self, id: Uuid) -> Option<Transfer> {
        self.transfers.read().get(&id).cloned()
    }

    /// Status of a transfer, `Unknown` if the id is not tracked
    pub fn status(&self, id: Uuid) -> TransferStatus {
        self.transfers
            .read()
            .get(&id)
            .map(|t| t.status)
            .unwrap_or(TransferStatus::Unknown)
    }

    /// Snapshot of every transfer, oldest first
    pub fn all(&self) -> Vec<Transfer> {
        let mut transfers: Vec<Transfer> = self.transfers.read().values().cloned().collect();
        transfers.sort_by_key(|t| t.created_at);
        transfers
    }

    pub fn remove(&self, id: Uuid) -> Option<Transfer> {
        self.transfers.write().remove(&id)
    }

    /// Move a transfer to `next`, enforcing the status machine
    ///
    /// Returns the updated snapshot. `operation` names the caller's
    /// intent for the error report.
    pub fn transition(
        &self,
        id: Uuid,
        next: TransferStatus,
        operation: &'static str,
    ) -> Result<Transfer, EngineError> {
        let mut transfers = self.transfers.write();
        let transfer = transfers.get_mut(&id).ok_or(EngineError::NotFound(id))?;

        if !transfer.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                id,
                status: transfer.status,
                operation,
            });
        }

        transfer.status = next;
        if next != TransferStatus::Failed {
            transfer.error = None;
        }
        transfer.updated_at = Utc::now();
        Ok(transfer.clone())
    }

    /// Mark a transfer Failed and record the reason
    pub fn fail(&self, id: Uuid, reason: String) -> Result<Transfer, EngineError> {
        self.transition(id, TransferStatus::Failed, "fail")?;
        let mut transfers = self.transfers.write();
        let transfer = transfers.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        transfer.error = Some(reason);
        Ok(transfer.clone())
    }

    /// Record the progress counters of a transfer
    ///
    /// Returns `None` when the transfer is no longer tracked.
    pub fn record_progress(
        &self,
        id: Uuid,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    ) -> Option<Progress> {
        let mut transfers = self.transfers.write();
        let transfer = transfers.get_mut(&id)?;
        transfer.bytes_downloaded = bytes_downloaded;
        transfer.total_bytes = total_bytes;
        transfer.updated_at = Utc::now();
        Some(transfer.progress())
    }

    /// Insert a transfer unless a non-terminal one already writes to its
    /// destination; the conflicting id is returned as the error
    pub fn insert_unique(&self, transfer: Transfer) -> Result<(), Uuid> {
        let mut transfers = self.transfers.write();
        let destination = transfer.destination();
        if let Some(existing) = transfers
            .values()
            .find(|t| !t.is_terminal() && t.destination() == destination)
        {
            return Err(existing.id);
        }
        transfers.insert(transfer.id, transfer);
        Ok(())
    }

    /// Most recent transfer for the given request parameters
    pub fn find(&self, url: &str, directory: &Path, file_name: &str) -> Option<Transfer> {
        self.transfers
            .read()
            .values()
            .filter(|t| t.url == url && t.directory == directory && t.file_name == file_name)
            .max_by_key(|t| t.created_at)
            .cloned()
    }

    /// Ids of transfers carrying `tag`
    pub fn tagged(&self, tag: &str) -> Vec<Uuid> {
        self.transfers
            .read()
            .values()
            .filter(|t| t.tag.as_deref() == Some(tag))
            .map(|t| t.id)
            .collect()
    }
}
