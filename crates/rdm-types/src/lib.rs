//! Shared types for RDM
//!
//! This crate contains the data model shared by the download engine
//! and the CLI: transfers, their status machine, requests, engine
//! configuration and the events emitted while a transfer runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Suffix appended to the file name while a transfer is incomplete.
pub const PARTIAL_SUFFIX: &str = ".part";

// ============================================================================
// Transfer Types
// ============================================================================

/// One requested file download and its runtime state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: Uuid,
    pub url: String,
    pub directory: PathBuf,
    pub file_name: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub tag: Option<String>,
    pub status: TransferStatus,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    /// Create a queued transfer for a request, assigning a fresh id
    pub fn from_request(request: TransferRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            url: request.url,
            directory: request.directory,
            file_name: request.file_name,
            headers: request.headers,
            tag: request.tag,
            status: TransferStatus::Queued,
            bytes_downloaded: 0,
            total_bytes: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Final path of the downloaded file
    pub fn destination(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }

    /// Path the bytes are written to until the transfer completes
    pub fn partial_path(&self) -> PathBuf {
        self.directory
            .join(format!("{}{}", self.file_name, PARTIAL_SUFFIX))
    }

    /// Byte offset to request when the transfer is resumed
    pub fn resume_offset(&self) -> u64 {
        self.bytes_downloaded
    }

    pub fn progress(&self) -> Progress {
        Progress {
            current_bytes: self.bytes_downloaded,
            total_bytes: self.total_bytes,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Status of a transfer
///
/// `Unknown` is only ever returned by status queries for ids the engine
/// does not track; it is never stored on a [`Transfer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Queued,
    Started,
    InProgress,
    Paused,
    Cancelled,
    Completed,
    Failed,
    Unknown,
}

impl TransferStatus {
    /// No further transition is possible from a terminal status
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Cancelled | TransferStatus::Completed | TransferStatus::Failed
        )
    }

    /// A worker may be running (or about to run) for the transfer
    pub fn is_active(self) -> bool {
        matches!(self, TransferStatus::Started | TransferStatus::InProgress)
    }

    pub fn can_pause(self) -> bool {
        matches!(
            self,
            TransferStatus::Queued | TransferStatus::Started | TransferStatus::InProgress
        )
    }

    pub fn can_cancel(self) -> bool {
        self.can_pause() || self == TransferStatus::Paused
    }

    /// Whether `next` is a legal successor of this status
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Queued, Started | Paused | Cancelled)
                | (Started, InProgress | Paused | Cancelled | Failed)
                | (InProgress, Paused | Cancelled | Completed | Failed)
                | (Paused, Started | Queued | Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Queued => "queued",
            TransferStatus::Started => "started",
            TransferStatus::InProgress => "in_progress",
            TransferStatus::Paused => "paused",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TransferStatus::Queued),
            "started" => Ok(TransferStatus::Started),
            "in_progress" => Ok(TransferStatus::InProgress),
            "paused" => Ok(TransferStatus::Paused),
            "cancelled" => Ok(TransferStatus::Cancelled),
            "completed" => Ok(TransferStatus::Completed),
            "failed" => Ok(TransferStatus::Failed),
            "unknown" => Ok(TransferStatus::Unknown),
            other => Err(format!("invalid transfer status: {}", other)),
        }
    }
}

// ============================================================================
// Request Types
// ============================================================================

/// Immutable description of a download, fixed before it is started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub url: String,
    pub directory: PathBuf,
    pub file_name: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub tag: Option<String>,
}

impl TransferRequest {
    pub fn builder(
        url: impl Into<String>,
        directory: impl Into<PathBuf>,
        file_name: impl Into<String>,
    ) -> TransferRequestBuilder {
        TransferRequestBuilder {
            request: TransferRequest {
                url: url.into(),
                directory: directory.into(),
                file_name: file_name.into(),
                headers: BTreeMap::new(),
                tag: None,
            },
        }
    }

    pub fn destination(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }
}

/// Builder for [`TransferRequest`]
#[derive(Debug, Clone)]
pub struct TransferRequestBuilder {
    request: TransferRequest,
}

impl TransferRequestBuilder {
    /// Add a header sent with every request for this transfer
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.headers.insert(name.into(), value.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.request.tag = Some(tag.into());
        self
    }

    pub fn build(self) -> TransferRequest {
        self.request
    }
}

// ============================================================================
// Progress & Error Types
// ============================================================================

/// Bytes received so far against the expected total
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current_bytes: u64,
    pub total_bytes: Option<u64>,
}

impl Progress {
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => Some(self.current_bytes as f64 * 100.0 / total as f64),
            _ => None,
        }
    }
}

/// Broad classes of engine failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection, timeout and HTTP-level failures
    Network,
    /// Disk and database failures
    Storage,
    /// Control operation on an unknown or terminal transfer
    InvalidOperation,
    /// The partial file no longer matches the recorded progress
    ResumeMismatch,
}

/// Failure details handed to `on_error` listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub server_error_message: Option<String>,
    pub is_server_error: bool,
    pub is_connection_error: bool,
    pub error_code: Option<u16>,
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted for a single transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TransferEvent {
    StartOrResume,
    Progress(Progress),
    Pause,
    Cancel,
    Complete,
    Error(ErrorInfo),
    Warning { message: String },
}

impl TransferEvent {
    /// The last event a transfer emits
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Cancel | TransferEvent::Complete | TransferEvent::Error(_)
        )
    }
}

/// A transfer event tagged with its transfer id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub id: Uuid,
    pub event: TransferEvent,
}

// ============================================================================
// Configuration
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Persist transfer state to SQLite so it survives restarts
    pub database_enabled: bool,
    pub read_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_concurrent_downloads: usize,
    pub user_agent: String,
    /// Minimum time between two progress events of one transfer
    pub progress_interval_ms: u64,
    /// Write buffer size of the connection worker
    pub buffer_size: usize,
    /// Directory holding the transfer database
    pub data_dir: PathBuf,
}

impl EngineConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("downloads.db")
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_enabled: false,
            read_timeout_ms: 20_000,
            connect_timeout_ms: 20_000,
            max_concurrent_downloads: 3,
            user_agent: format!("RDM/{}", env!("CARGO_PKG_VERSION")),
            progress_interval_ms: 500,
            buffer_size: 64 * 1024,
            data_dir: default_data_dir(),
        }
    }
}

/// `<platform data dir>/rdm`, or `.rdm` when the platform has none
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("rdm"))
        .unwrap_or_else(|| PathBuf::from(".rdm"))
}
