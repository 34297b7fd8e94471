use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::{EnvFilter, fmt};

use rollcall::client::BridgeFactory;
use rollcall::config::Config;
use rollcall::records::{HttpRecordService, RecordService};
use rollcall::scan::ScanOrchestrator;
use rollcall::session::{BlobStore, SessionController, SessionState};

#[derive(Parser)]
#[command(
    name = "rollcall",
    about = "Group roster scanner for a browser-driven messaging web session",
    version
)]
struct Cli {
    /// Path to config.toml (defaults to ~/.rollcall/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the membership of the named groups
    Scan {
        /// Group names to scan
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Invalidate the remote session and delete the persisted artifact
    Logout,
    /// Show configuration and persisted session state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_or_init_at(path)?,
        None => Config::load_or_init()?,
    };

    let records: Arc<dyn RecordService> = Arc::new(HttpRecordService::new(&config.records)?);
    let blobs = Arc::new(BlobStore::new(
        Arc::clone(&records),
        config.records.max_chunk_size,
    ));
    let factory = Arc::new(BridgeFactory::new(config.client.clone()));
    let controller = SessionController::new(config.session.clone(), factory, Arc::clone(&blobs));

    match cli.command {
        Commands::Scan { names } => {
            let orchestrator =
                ScanOrchestrator::new(Arc::clone(&controller), Arc::clone(&records), config.scan);

            let batch = async {
                controller.initialize().await?;
                wait_for_authentication(&controller, config.session.auth_timeout()).await?;
                let results = orchestrator.scan_groups(&names).await?;
                anyhow::Ok(results)
            };

            tokio::select! {
                results = batch => {
                    let results = results?;
                    let mut sorted: Vec<&String> = results.keys().collect();
                    sorted.sort();
                    for name in sorted {
                        let result = &results[name];
                        if result.success {
                            println!("{name}: {} member(s)", result.members.len());
                        } else {
                            println!(
                                "{name}: FAILED ({})",
                                result.error.as_deref().unwrap_or("unknown error")
                            );
                        }
                    }
                    let progress = orchestrator.progress();
                    println!(
                        "{}/{} groups scanned, {} failed",
                        progress.successful, progress.total, progress.failed
                    );
                }
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("Interrupted; closing session (artifact preserved).");
                }
            }

            controller.close(true).await;
        }
        Commands::Logout => {
            controller.initialize().await?;
            controller.logout().await;
            println!("Session invalidated and persisted artifact removed.");
        }
        Commands::Status => {
            println!("config:   {}", config.config_path.display());
            println!("session:  {}", config.session.id);
            println!("records:  {}", config.records.base_url);
            println!("sidecar:  {}", config.client.endpoint);
            let fragments = count_fragments(records.as_ref(), &config.session.id).await?;
            if fragments == 0 {
                println!("artifact: none (next start will require a QR scan)");
            } else {
                println!("artifact: {fragments} fragment(s) persisted");
            }
        }
    }

    Ok(())
}

/// Poll the controller until it authenticates, rendering the pairing QR to
/// the terminal whenever a new payload shows up.
async fn wait_for_authentication(
    controller: &Arc<SessionController>,
    window: Duration,
) -> Result<()> {
    let deadline = Instant::now() + window;
    let mut shown: Option<String> = None;

    loop {
        match controller.state() {
            SessionState::Authenticated => return Ok(()),
            SessionState::AuthError => {
                let reason = controller
                    .auth_error()
                    .unwrap_or_else(|| "unknown error".into());
                bail!("authentication failed: {reason}");
            }
            _ => {}
        }

        if let Some(payload) = controller.qr_code() {
            if shown.as_deref() != Some(payload.as_str()) {
                eprintln!();
                eprintln!("Scan this QR code with the messaging app (Linked Devices):");
                eprintln!("{}", render_qr(&payload)?);
                shown = Some(payload);
            }
        }

        if Instant::now() >= deadline {
            bail!(
                "authentication did not complete within {}s",
                window.as_secs()
            );
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

/// Render a pairing QR payload into terminal-friendly text.
fn render_qr(payload: &str) -> Result<String> {
    let payload = payload.trim();
    if payload.is_empty() {
        bail!("QR payload is empty");
    }
    let qr = qrcode::QrCode::new(payload.as_bytes()).context("Failed to encode QR payload")?;
    Ok(qr
        .render::<qrcode::render::unicode::Dense1x2>()
        .quiet_zone(true)
        .build())
}

async fn count_fragments(records: &dyn RecordService, session_id: &str) -> Result<usize> {
    let mut count = 0;
    let mut offset: Option<String> = None;
    loop {
        let page = records
            .list_fragments(session_id, true, offset.as_deref())
            .await?;
        count += page.fragments.len();
        match page.next_offset {
            Some(next) => offset = Some(next),
            None => break,
        }
    }
    Ok(count)
}
