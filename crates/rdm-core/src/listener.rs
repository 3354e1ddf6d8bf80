//! Caller-supplied callbacks for a single transfer

use rdm_types::{ErrorInfo, Progress, TransferEvent};
use std::fmt;
use uuid::Uuid;

type Callback = Box<dyn Fn(Uuid) + Send + Sync>;
type ProgressCallback = Box<dyn Fn(Uuid, Progress) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(Uuid, &ErrorInfo) + Send + Sync>;
type WarningCallback = Box<dyn Fn(Uuid, &str) + Send + Sync>;

/// Set of callbacks notified as a transfer moves through its lifecycle
///
/// Callbacks run on the engine's dispatch task, one event at a time and
/// in emission order. A slow callback delays later notifications but
/// never the network read of the transfer.
#[derive(Default)]
pub struct Listeners {
    on_start_or_resume: Option<Callback>,
    on_pause: Option<Callback>,
    on_cancel: Option<Callback>,
    on_progress: Option<ProgressCallback>,
    on_complete: Option<Callback>,
    on_error: Option<ErrorCallback>,
    on_warning: Option<WarningCallback>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start_or_resume(mut self, f: impl Fn(Uuid) + Send + Sync + 'static) -> Self {
        self.on_start_or_resume = Some(Box::new(f));
        self
    }

    pub fn on_pause(mut self, f: impl Fn(Uuid) + Send + Sync + 'static) -> Self {
        self.on_pause = Some(Box::new(f));
        self
    }

    pub fn on_cancel(mut self, f: impl Fn(Uuid) + Send + Sync + 'static) -> Self {
        self.on_cancel = Some(Box::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl Fn(Uuid, Progress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn(Uuid) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(Uuid, &ErrorInfo) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Called for recoverable problems, such as a resume that had to restart
    pub fn on_warning(mut self, f: impl Fn(Uuid, &str) + Send + Sync + 'static) -> Self {
        self.on_warning = Some(Box::new(f));
        self
    }

    pub(crate) fn notify(&self, id: Uuid, event: &TransferEvent) {
        match event {
            TransferEvent::StartOrResume => {
                if let Some(f) = &self.on_start_or_resume {
                    f(id)
                }
            }
            TransferEvent::Progress(progress) => {
                if let Some(f) = &self.on_progress {
                    f(id, *progress)
                }
            }
            TransferEvent::Pause => {
                if let Some(f) = &self.on_pause {
                    f(id)
                }
            }
            TransferEvent::Cancel => {
                if let Some(f) = &self.on_cancel {
                    f(id)
                }
            }
            TransferEvent::Complete => {
                if let Some(f) = &self.on_complete {
                    f(id)
                }
            }
            TransferEvent::Error(info) => {
                if let Some(f) = &self.on_error {
                    f(id, info)
                }
            }
            TransferEvent::Warning { message } => {
                if let Some(f) = &self.on_warning {
                    f(id, message)
                }
            }
        }
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("on_start_or_resume", &self.on_start_or_resume.is_some())
            .field("on_pause", &self.on_pause.is_some())
            .field("on_cancel", &self.on_cancel.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_warning", &self.on_warning.is_some())
            .finish()
    }
}
