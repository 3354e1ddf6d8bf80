//! Progress bar utilities for CLI downloads

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rdm_core::Listeners;

/// One progress bar per transfer, driven by engine listeners
pub struct DownloadProgress {
    multi: MultiProgress,
    style: ProgressStyle,
}

impl DownloadProgress {
    pub fn new() -> Self {
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░  ");

        Self {
            multi: MultiProgress::new(),
            style,
        }
    }

    /// Create a bar for a transfer and the listeners that keep it current
    pub fn listeners(&self, name: &str, position: u64, length: Option<u64>) -> Listeners {
        let pb = self.multi.add(ProgressBar::new(length.unwrap_or(0)));
        pb.set_style(self.style.clone());
        pb.set_message(name.to_string());
        pb.set_position(position);

        let name = name.to_string();
        let (on_progress, on_start, on_pause, on_cancel, on_complete, on_error, on_warning) = (
            pb.clone(),
            pb.clone(),
            pb.clone(),
            pb.clone(),
            pb.clone(),
            pb.clone(),
            pb,
        );

        Listeners::new()
            .on_progress(move |_, progress| {
                if let Some(total) = progress.total_bytes {
                    on_progress.set_length(total);
                }
                on_progress.set_position(progress.current_bytes);
            })
            .on_start_or_resume(move |_| on_start.reset_eta())
            .on_pause(move |id| {
                on_pause.abandon_with_message(format!(
                    "{} Paused, resume with `rdm resume {}`",
                    style("⏸").yellow(),
                    id
                ))
            })
            .on_cancel(move |_| {
                on_cancel.abandon_with_message(format!("{} Cancelled", style("○").dim()))
            })
            .on_complete(move |_| {
                on_complete.finish_with_message(format!("{} {}", style("✓").green().bold(), name))
            })
            .on_error(move |_, error| {
                on_error.abandon_with_message(format!(
                    "{} Failed: {}",
                    style("✗").red().bold(),
                    error.message
                ))
            })
            .on_warning(move |_, message| {
                on_warning.println(format!("{} {}", style("!").yellow().bold(), message))
            })
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}
