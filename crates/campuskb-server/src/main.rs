//! CampusKB — retrieval-augmented campus assistant backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use campuskb_core::AppConfig;
use campuskb_ingest::DocumentInput;
use campuskb_server::{build_router, AppState};

fn resolve_data_dir() -> PathBuf {
    std::env::var("CAMPUSKB_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let exe_dir = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()));
            if let Some(dir) = exe_dir {
                let parent_data = dir.join("../data");
                if parent_data.exists() {
                    return parent_data;
                }
            }
            PathBuf::from("data")
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let data_dir = resolve_data_dir();

    if args.len() > 1 {
        match args[1].as_str() {
            "ingest" => {
                if args.len() < 3 {
                    eprintln!("Usage: campuskb ingest <documents.json>...");
                    std::process::exit(1);
                }
                return ingest_files(&data_dir, &args[2..]);
            }
            "--help" | "-h" | "help" => {
                println!("CampusKB — retrieval-augmented campus assistant");
                println!();
                println!("Usage: campuskb [command]");
                println!();
                println!("Commands:");
                println!("  (none)                   Start the server");
                println!("  ingest <file.json>...    Ingest document batches into the corpus");
                println!("  help                     Show this help message");
                println!();
                println!("Environment: CAMPUSKB_DATA_DIR, PORT, CAMPUSKB_*, RUST_LOG");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'campuskb help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    info!("Data directory: {}", data_dir.display());
    let config = AppConfig::from_env(&data_dir)?;
    let port = config.port;

    let state = Arc::new(AppState::open(config).context("failed to initialize state")?);
    let app = build_router(state.clone());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("CampusKB server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    if let Err(e) = state.save_conversations().await {
        error!("Failed to save conversations: {}", e);
    }
    Ok(())
}

/// Ingest JSON batch files (an array of documents each) without serving.
fn ingest_files(data_dir: &Path, files: &[String]) -> anyhow::Result<()> {
    let config = AppConfig::from_env(data_dir)?;
    let state = AppState::open(config)?;
    for file in files {
        let data = std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
        let inputs: Vec<DocumentInput> =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", file))?;
        let summary = state.knowledge.ingest(&inputs);
        println!(
            "{}: {} ingested ({} replaced), {} unchanged, {} failed",
            file,
            summary.ingested,
            summary.replaced,
            summary.skipped,
            summary.failed.len()
        );
        for failure in &summary.failed {
            println!("  {}: {}", failure.document, failure.reason);
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
