//! Transfer engine - registry, persistence, workers and event dispatch
//!
//! - [`TransferRegistry`]: in-memory state of every known transfer
//! - [`TransferStore`] / [`StoreWriter`]: SQLite write-through persistence
//! - [`ConnectionWorker`]: single-connection resumable HTTP download
//! - [`EventBus`]: ordered delivery of events to listeners and subscribers

mod dispatch;
mod persistence;
mod registry;
mod worker;

pub use dispatch::*;
pub use persistence::*;
pub use registry::*;
pub use worker::*;
