//! CLI command implementations

use crate::output::{format_bytes, format_progress, print_output, status_icon};
use crate::progress::DownloadProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Context, Result};
use console::style;
use rdm_core::{ConfigStore, DownloadEngine};
use rdm_types::{EngineConfig, EngineEvent, Transfer, TransferEvent, TransferStatus};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;
use uuid::Uuid;

/// Flags of `rdm get`
pub struct GetOptions {
    pub dir: Option<PathBuf>,
    pub name: Option<String>,
    pub headers: Vec<String>,
    pub tag: Option<String>,
    pub concurrency: Option<usize>,
}

// ============================================================================
// Engine setup
// ============================================================================

async fn load_config(data_dir: &Path) -> Result<EngineConfig> {
    let store = ConfigStore::new(data_dir);
    let mut config = store
        .load()
        .await
        .with_context(|| format!("Failed to load {}", store.path().display()))?;

    // Separate invocations only share state through the store
    config.database_enabled = true;
    Ok(config)
}

async fn open_engine(data_dir: &Path, concurrency: Option<usize>) -> Result<DownloadEngine> {
    let mut config = load_config(data_dir).await?;
    if let Some(limit) = concurrency {
        config.max_concurrent_downloads = limit.max(1);
    }
    Ok(DownloadEngine::new(config).await?)
}

/// Accept a full id or an unambiguous prefix of one
fn resolve_id(engine: &DownloadEngine, id: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return Ok(uuid);
    }

    let matches: Vec<Uuid> = engine
        .transfers()
        .iter()
        .map(|t| t.id)
        .filter(|t| t.to_string().starts_with(id))
        .collect();

    match matches.as_slice() {
        [one] => Ok(*one),
        [] => bail!("No download matches {}", id),
        _ => bail!("{} matches {} downloads, use a longer prefix", id, matches.len()),
    }
}

fn find_transfer(engine: &DownloadEngine, id: &str) -> Result<Transfer> {
    let uuid = resolve_id(engine, id)?;
    engine
        .transfer(uuid)
        .ok_or_else(|| anyhow!("Download not found: {}", uuid))
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid header {:?}, expected \"Name: value\"", raw))?;

    let name = name.trim();
    if name.is_empty() {
        bail!("Invalid header {:?}, missing name", raw);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Last non-empty path segment of the URL, percent-decoded
fn file_name_from_url(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url).with_context(|| format!("Invalid URL: {}", url))?;
    let name = parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| segment.to_string())
        })
        .filter(|name| !name.contains(['/', '\\']))
        .unwrap_or_else(|| "index.html".to_string());
    Ok(name)
}

// ============================================================================
// Download Commands
// ============================================================================

pub async fn get(
    data_dir: &Path,
    urls: Vec<String>,
    options: GetOptions,
    format: OutputFormat,
) -> Result<()> {
    if options.name.is_some() && urls.len() > 1 {
        bail!("--name can only be used with a single URL");
    }

    let headers = options
        .headers
        .iter()
        .map(|h| parse_header(h))
        .collect::<Result<Vec<_>>>()?;
    let directory = match options.dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    let engine = open_engine(data_dir, options.concurrency).await?;
    let bars = DownloadProgress::new();
    let mut events = engine.subscribe();
    let mut ids = Vec::new();

    for url in &urls {
        let file_name = match &options.name {
            Some(name) => name.clone(),
            None => file_name_from_url(url)?,
        };

        if directory.join(&file_name).exists() {
            eprintln!(
                "{} {} already exists, skipping",
                style("·").dim(),
                style(directory.join(&file_name).display()).cyan()
            );
            continue;
        }

        let mut builder = engine.download(url.as_str(), directory.clone(), file_name.clone());
        for (name, value) in &headers {
            builder = builder.header(name.clone(), value.clone());
        }
        if let Some(tag) = &options.tag {
            builder = builder.tag(tag.clone());
        }

        match engine.start(builder.build(), bars.listeners(&file_name, 0, None)) {
            Ok(id) => ids.push(id),
            Err(e) => eprintln!("{} {}: {}", style("✗").red().bold(), url, e),
        }
    }

    if ids.is_empty() {
        return Ok(());
    }

    wait_for(&engine, &mut events, ids.iter().copied().collect()).await;
    engine.flush().await;
    report(&engine, &ids, format)
}

pub async fn resume(data_dir: &Path, id: &str, format: OutputFormat) -> Result<()> {
    let engine = open_engine(data_dir, None).await?;
    let transfer = find_transfer(&engine, id)?;
    if transfer.status != TransferStatus::Paused {
        bail!("Download {} is {}, only paused downloads can be resumed", transfer.id, transfer.status);
    }

    let bars = DownloadProgress::new();
    let mut events = engine.subscribe();
    engine.listen(
        transfer.id,
        bars.listeners(
            &transfer.file_name,
            transfer.bytes_downloaded,
            transfer.total_bytes,
        ),
    )?;
    engine.resume(transfer.id)?;

    wait_for(&engine, &mut events, HashSet::from([transfer.id])).await;
    engine.flush().await;
    report(&engine, &[transfer.id], format)
}

pub async fn cancel(data_dir: &Path, id: &str, format: OutputFormat) -> Result<()> {
    let engine = open_engine(data_dir, None).await?;
    let transfer = find_transfer(&engine, id)?;

    engine.cancel(transfer.id)?;
    engine.flush().await;

    // The engine removes it in the background; this process is about to exit
    match tokio::fs::remove_file(transfer.partial_path()).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            debug!("Could not remove {}: {}", transfer.partial_path().display(), e)
        }
        _ => {}
    }

    print_output(&transfer.id, format, || {
        println!("{} Download cancelled", style("✓").green().bold())
    })
}

pub async fn status(data_dir: &Path, id: &str, format: OutputFormat) -> Result<()> {
    let engine = open_engine(data_dir, None).await?;
    let transfer = find_transfer(&engine, id)?;

    print_output(&transfer, format, || print_transfer(&transfer, true))
}

pub async fn list(data_dir: &Path, status: Option<String>, format: OutputFormat) -> Result<()> {
    let engine = open_engine(data_dir, None).await?;

    let filter = status
        .map(|s| s.parse::<TransferStatus>().map_err(|e| anyhow!(e)))
        .transpose()?;
    let transfers: Vec<Transfer> = engine
        .transfers()
        .into_iter()
        .filter(|t| filter.map_or(true, |status| t.status == status))
        .collect();

    print_transfers(&transfers, format)
}

pub async fn clear(data_dir: &Path, id: &str, format: OutputFormat) -> Result<()> {
    let engine = open_engine(data_dir, None).await?;
    let transfer = find_transfer(&engine, id)?;

    engine.clear(transfer.id).await?;
    engine.flush().await;

    print_output(&transfer.id, format, || {
        println!("{} Download cleared", style("✓").green().bold())
    })
}

pub async fn cleanup(data_dir: &Path, days: u32, format: OutputFormat) -> Result<()> {
    let engine = open_engine(data_dir, None).await?;

    let cleared = engine.clean_up(chrono::Duration::days(days as i64)).await;
    engine.flush().await;

    print_output(&cleared, format, || {
        println!(
            "{} Cleared {} download(s) older than {} day(s)",
            style("✓").green().bold(),
            cleared,
            days
        )
    })
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(data_dir: &Path, action: ConfigAction, format: OutputFormat) -> Result<()> {
    let store = ConfigStore::new(data_dir);

    match action {
        ConfigAction::Show => {
            let config = store.load().await?;
            print_output(&config, format, || {
                println!("{}", style(store.path().display()).dim());
                println!("  database_enabled:         {}", config.database_enabled);
                println!("  max_concurrent_downloads: {}", config.max_concurrent_downloads);
                println!("  connect_timeout_ms:       {}", config.connect_timeout_ms);
                println!("  read_timeout_ms:          {}", config.read_timeout_ms);
                println!("  progress_interval_ms:     {}", config.progress_interval_ms);
                println!("  buffer_size:              {}", format_bytes(config.buffer_size as u64));
                println!("  user_agent:               {}", config.user_agent);
                println!("  data_dir:                 {}", config.data_dir.display());
            })
        }

        ConfigAction::Init { force } => {
            if store.exists() && !force {
                bail!(
                    "{} already exists, use --force to overwrite",
                    store.path().display()
                );
            }

            let config = EngineConfig {
                data_dir: data_dir.to_path_buf(),
                ..EngineConfig::default()
            };
            store.save(&config).await?;

            print_output(&store.path(), format, || {
                println!(
                    "{} Wrote {}",
                    style("✓").green().bold(),
                    style(store.path().display()).cyan()
                )
            })
        }
    }
}

// ============================================================================
// Waiting & reporting
// ============================================================================

/// Block until every id completes, fails, pauses or is cancelled
///
/// Ctrl-C pauses everything so a later `rdm resume` can continue.
async fn wait_for(
    engine: &DownloadEngine,
    events: &mut broadcast::Receiver<EngineEvent>,
    mut pending: HashSet<Uuid>,
) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !pending.is_empty() {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if event.event.is_terminal() || event.event == TransferEvent::Pause {
                        pending.remove(&event.id);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Missed {} events, re-reading status", skipped);
                    pending.retain(|id| {
                        let status = engine.status(*id);
                        status == TransferStatus::Queued || status.can_pause()
                    });
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                eprintln!("{} Pausing downloads...", style("⏸").yellow());
                engine.shutdown().await;
                break;
            }
        }
    }
}

fn report(engine: &DownloadEngine, ids: &[Uuid], format: OutputFormat) -> Result<()> {
    let transfers: Vec<Transfer> = ids.iter().filter_map(|id| engine.transfer(*id)).collect();

    match format {
        OutputFormat::Human => {
            let failed = transfers
                .iter()
                .filter(|t| t.status == TransferStatus::Failed)
                .count();
            if failed > 0 {
                eprintln!("{} {} download(s) failed", style("✗").red().bold(), failed);
            }
            Ok(())
        }
        _ => print_transfers(&transfers, format),
    }
}

fn print_transfers(transfers: &[Transfer], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(transfers)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct TransferRow {
                id: String,
                file: String,
                progress: String,
                status: String,
                tag: String,
            }

            let rows: Vec<TransferRow> = transfers
                .iter()
                .map(|t| TransferRow {
                    id: t.id.to_string()[..8].to_string(),
                    file: if t.file_name.chars().count() > 30 {
                        format!("{}...", t.file_name.chars().take(27).collect::<String>())
                    } else {
                        t.file_name.clone()
                    },
                    progress: format_progress(t),
                    status: t.status.to_string(),
                    tag: t.tag.clone().unwrap_or_default(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if transfers.is_empty() {
                println!("{}", style("No downloads found").dim());
                return Ok(());
            }

            for transfer in transfers {
                print_transfer(transfer, false);
            }
            println!();
            println!("{} download(s) total", style(transfers.len()).bold());
        }
    }

    Ok(())
}

fn print_transfer(transfer: &Transfer, detailed: bool) {
    println!(
        "{} {} {} [{}]",
        status_icon(transfer.status),
        style(&transfer.file_name).bold(),
        style(format_progress(transfer)).dim(),
        style(transfer.status).dim()
    );

    if detailed {
        println!("    ID: {}", transfer.id);
        println!("    URL: {}", transfer.url);
        println!("    Path: {}", transfer.destination().display());
        if let Some(tag) = &transfer.tag {
            println!("    Tag: {}", tag);
        }
        if let Some(error) = &transfer.error {
            println!("    Error: {}", style(error).red());
        }
        println!(
            "    Updated: {}",
            transfer.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
}
