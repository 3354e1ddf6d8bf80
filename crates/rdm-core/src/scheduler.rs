//! Scheduler - admits transfers into a bounded pool of workers
//!
//! Transfers beyond the concurrency limit wait in a FIFO queue. Whenever a
//! worker exits, the next queued transfer is started in its slot.
//!
//! The scheduler state and the registry are locked in that order, and
//! neither lock is ever held across an `.await`.

use crate::engine::{remove_if_exists, ConnectionWorker, WorkerContext, WorkerExit, WorkerSignals};
use crate::error::EngineError;
use parking_lot::Mutex;
use rdm_types::{Transfer, TransferEvent, TransferStatus};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct ActiveWorker {
    signals: Arc<WorkerSignals>,
    /// Resume arrived while the paused worker was still unwinding
    resume_requested: bool,
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<Uuid>,
    active: HashMap<Uuid, ActiveWorker>,
}

/// Bounded worker pool with FIFO admission
pub struct Scheduler {
    limit: usize,
    ctx: WorkerContext,
    state: Mutex<SchedulerState>,
    idle: Notify,
}

impl Scheduler {
    pub fn new(ctx: WorkerContext, limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: limit.max(1),
            ctx,
            state: Mutex::new(SchedulerState::default()),
            idle: Notify::new(),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Admit a freshly registered Queued transfer
    ///
    /// Returns the status it ends up in: Started when a slot was free,
    /// Queued otherwise.
    pub fn admit(self: &Arc<Self>, id: Uuid) -> Result<TransferStatus, EngineError> {
        let mut state = self.state.lock();

        if state.active.len() < self.limit {
            self.dispatch(&mut state, id)?;
            return Ok(TransferStatus::Started);
        }

        state.queue.push_back(id);
        debug!("Transfer {} queued at position {}", id, state.queue.len());
        Ok(TransferStatus::Queued)
    }

    /// Re-admit a Paused transfer
    pub fn resume(self: &Arc<Self>, id: Uuid) -> Result<TransferStatus, EngineError> {
        let mut state = self.state.lock();
        let status = self.ctx.registry.status(id);
        if status == TransferStatus::Unknown {
            return Err(EngineError::NotFound(id));
        }
        if status != TransferStatus::Paused {
            return Err(EngineError::InvalidTransition {
                id,
                status,
                operation: "resume",
            });
        }

        if let Some(worker) = state.active.get_mut(&id) {
            // The worker that paused has not released its slot yet
            self.ctx
                .registry
                .transition(id, TransferStatus::Queued, "resume")?;
            worker.resume_requested = true;
            self.ctx.persist_status(id, TransferStatus::Queued, None);
            debug!("Transfer {} will resume once its worker exits", id);
            return Ok(TransferStatus::Queued);
        }

        if state.active.len() < self.limit {
            self.dispatch(&mut state, id)?;
            return Ok(TransferStatus::Started);
        }

        self.ctx
            .registry
            .transition(id, TransferStatus::Queued, "resume")?;
        self.ctx.persist_status(id, TransferStatus::Queued, None);
        state.queue.push_back(id);
        debug!("Transfer {} queued for resume", id);
        Ok(TransferStatus::Queued)
    }

    /// Pause a transfer
    ///
    /// A running worker is only signalled; it reports the pause once it
    /// has flushed. A queued transfer is paused on the spot.
    pub fn pause(&self, id: Uuid) -> Result<(), EngineError> {
        let mut state = self.state.lock();

        if let Some(worker) = state.active.get_mut(&id) {
            if worker.resume_requested {
                worker.resume_requested = false;
                self.pause_now(id)?;
                return Ok(());
            }

            let status = self.ctx.registry.status(id);
            if !status.can_pause() || worker.signals.is_committed() {
                return Err(EngineError::InvalidTransition {
                    id,
                    status,
                    operation: "pause",
                });
            }
            worker.signals.pause();
            debug!("Transfer {} signalled to pause", id);
            return Ok(());
        }

        self.pause_now(id)?;
        state.queue.retain(|queued| *queued != id);
        Ok(())
    }

    fn pause_now(&self, id: Uuid) -> Result<(), EngineError> {
        let transfer = self
            .ctx
            .registry
            .transition(id, TransferStatus::Paused, "pause")?;
        self.ctx.persist_status(id, TransferStatus::Paused, None);
        self.ctx.events.emit(id, TransferEvent::Pause);
        info!("Transfer {} paused at {} bytes", id, transfer.bytes_downloaded);
        Ok(())
    }

    /// Cancel a transfer, discarding its partial data
    pub fn cancel(&self, id: Uuid) -> Result<(), EngineError> {
        let mut state = self.state.lock();

        let status = self.ctx.registry.status(id);
        if status == TransferStatus::Unknown {
            return Err(EngineError::NotFound(id));
        }
        if !status.can_cancel() {
            return Err(EngineError::InvalidTransition {
                id,
                status,
                operation: "cancel",
            });
        }

        if let Some(worker) = state.active.get_mut(&id) {
            if !worker.signals.cancel() {
                // The worker is already completing or failing
                return Err(EngineError::InvalidTransition {
                    id,
                    status,
                    operation: "cancel",
                });
            }
            worker.resume_requested = false;
            debug!("Transfer {} signalled to cancel", id);
            return Ok(());
        }

        state.queue.retain(|queued| *queued != id);
        self.discard(id);
        Ok(())
    }

    /// Forget a transfer that is neither running nor waiting for a slot
    pub fn forget(&self, id: Uuid) -> Result<Transfer, EngineError> {
        let state = self.state.lock();
        let transfer = self.ctx.registry.get(id).ok_or(EngineError::NotFound(id))?;

        let idle = transfer.is_terminal() || transfer.status == TransferStatus::Paused;
        if state.active.contains_key(&id) || !idle {
            return Err(EngineError::InvalidTransition {
                id,
                status: transfer.status,
                operation: "clear",
            });
        }

        self.ctx.registry.remove(id);
        Ok(transfer)
    }

    /// Ids of every running or queued transfer
    pub fn pending(&self) -> Vec<Uuid> {
        let state = self.state.lock();
        state
            .active
            .keys()
            .chain(state.queue.iter())
            .copied()
            .collect()
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        self.state.lock().active.contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn queued(&self) -> Vec<Uuid> {
        self.state.lock().queue.iter().copied().collect()
    }

    /// Wait until no worker is running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.state.lock().active.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Start a worker for `id`; the caller holds the state lock
    fn dispatch(
        self: &Arc<Self>,
        state: &mut SchedulerState,
        id: Uuid,
    ) -> Result<(), EngineError> {
        let transfer = self
            .ctx
            .registry
            .transition(id, TransferStatus::Started, "start")?;
        self.ctx.persist_status(id, TransferStatus::Started, None);
        self.ctx.events.emit(id, TransferEvent::StartOrResume);

        let signals = Arc::new(WorkerSignals::default());
        state.active.insert(
            id,
            ActiveWorker {
                signals: signals.clone(),
                resume_requested: false,
            },
        );

        let worker = ConnectionWorker::new(transfer, self.ctx.clone(), signals);
        let scheduler = Arc::clone(self);
        self.ctx.runtime.spawn(async move {
            let exit = worker.run().await;
            scheduler.finish(id, exit);
        });

        debug!("Transfer {} dispatched ({}/{} slots)", id, state.active.len(), self.limit);
        Ok(())
    }

    /// Release the slot held by `id` and admit waiting transfers
    fn finish(self: &Arc<Self>, id: Uuid, exit: WorkerExit) {
        let mut state = self.state.lock();
        debug!("Worker for transfer {} exited: {:?}", id, exit);

        if let Some(worker) = state.active.remove(&id) {
            if exit == WorkerExit::Paused && worker.signals.is_cancelled() {
                // Cancelled after the worker had already paused
                self.discard(id);
            } else if worker.resume_requested {
                if let Err(e) = self.dispatch(&mut state, id) {
                    warn!("Failed to resume transfer {}: {}", id, e);
                }
            }
        }

        while state.active.len() < self.limit {
            let Some(next) = state.queue.pop_front() else {
                break;
            };
            if let Err(e) = self.dispatch(&mut state, next) {
                warn!("Failed to start queued transfer {}: {}", next, e);
            }
        }

        if state.active.is_empty() {
            self.idle.notify_waiters();
        }
    }

    /// Drop a transfer that has no running worker
    fn discard(&self, id: Uuid) {
        if let Some(transfer) = self.ctx.registry.remove(id) {
            let partial = transfer.partial_path();
            self.ctx
                .runtime
                .spawn(async move { remove_if_exists(&partial).await });
        }
        if let Some(store) = &self.ctx.store {
            store.delete(id);
        }
        self.ctx.events.emit(id, TransferEvent::Cancel);
        info!("Transfer {} cancelled", id);
    }
}
