//! Output formatting utilities

use crate::OutputFormat;
use rdm_types::{Transfer, TransferStatus};
use serde::Serialize;

/// Print a serializable value as JSON, or its human form otherwise
pub fn print_output<T: Serialize>(
    value: &T,
    format: OutputFormat,
    human: impl FnOnce(),
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Human | OutputFormat::Table => human(),
    }
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// "12 MiB / 40 MiB (30.0%)", or just the byte count when the size is unknown
pub fn format_progress(transfer: &Transfer) -> String {
    let progress = transfer.progress();
    match (progress.total_bytes, progress.percent()) {
        (Some(total), Some(percent)) => format!(
            "{} / {} ({:.1}%)",
            format_bytes(progress.current_bytes),
            format_bytes(total),
            percent
        ),
        _ => format_bytes(progress.current_bytes),
    }
}

pub fn status_icon(status: TransferStatus) -> console::StyledObject<&'static str> {
    use console::style;

    match status {
        TransferStatus::Completed => style("✓").green(),
        TransferStatus::Started | TransferStatus::InProgress => style("↓").cyan(),
        TransferStatus::Paused => style("⏸").yellow(),
        TransferStatus::Failed => style("✗").red(),
        TransferStatus::Cancelled => style("○").dim(),
        TransferStatus::Queued | TransferStatus::Unknown => style("·").dim(),
    }
}
