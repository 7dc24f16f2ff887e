use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use vectorfs_backend::config::AppConfig;
use vectorfs_backend::dispatch::BusReader;
use vectorfs_backend::ipc::{InProcessBus, MessageBus};
use vectorfs_backend::state::AppState;

/// Semantic virtual filesystem backend.
///
/// Serves the control plane as JSON envelopes over stdio; the FUSE adapter
/// mounts the filesystem surface at the given mount point.
#[derive(Parser, Debug)]
#[command(name = "vectorfs-backend", version, about)]
struct Cli {
    /// Mount point handed to the external FUSE adapter.
    #[arg(long)]
    mount: Option<String>,

    /// Override the data directory (defaults to VECTORFS_DATA_DIR).
    #[arg(long)]
    data_dir: Option<String>,

    /// Store PQ codes in the vector index instead of raw vectors.
    #[arg(long)]
    quantization: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_dir = std::env::var("VECTORFS_LOG_DIR").unwrap_or_else(|_| {
        dirs::data_local_dir()
            .map(|d| d.join("vectorfs-backend").join("logs").to_string_lossy().to_string())
            .unwrap_or_else(|| ".vectorfs-data/logs".to_string())
    });
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "vectorfs-backend.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vectorfs_backend=info".into());

    // Control-plane envelopes own stdout, so console logs go to stderr.
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "vectorfs_backend::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    let mut config = AppConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if cli.quantization {
        config.use_quantization = true;
    }
    std::fs::create_dir_all(&config.data_dir)?;

    info!(
        data_dir = %config.data_dir,
        embedding_dim = config.embedding_dim,
        quantization = config.use_quantization,
        mount = cli.mount.as_deref().unwrap_or("<none>"),
        "vectorfs backend starting"
    );

    let state = Arc::new(AppState::new(config)?);

    // Control-plane buses: requests arrive on stdin, envelopes leave on
    // stdout. The reader thread runs one dispatch in flight.
    let inbound = InProcessBus::new(1024);
    let outbound = InProcessBus::new(1024);
    inbound.subscribe();
    outbound.subscribe();

    let mut reader = BusReader::spawn(state.dispatcher.clone(), inbound.clone(), outbound.clone());

    // stdin pump: one JSON envelope per line. Exits on EOF; a blocked read
    // cannot be joined, so the thread is detached and dies with the process.
    let stdin_bus = inbound.clone();
    std::thread::Builder::new()
        .name("stdin-pump".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = stdin_bus.send(line.into_bytes()) {
                    error!(error = %e, "failed to enqueue request");
                }
            }
            info!("stdin closed");
        })?;

    // stdout pump: drains response envelopes.
    let stop_pump = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let pump_flag = stop_pump.clone();
    let stdout_pump = std::thread::Builder::new()
        .name("stdout-pump".to_string())
        .spawn(move || {
            let mut stdout = std::io::stdout();
            while !pump_flag.load(std::sync::atomic::Ordering::Relaxed) {
                match outbound.try_recv() {
                    Some(bytes) => {
                        let _ = stdout.write_all(&bytes);
                        let _ = stdout.write_all(b"\n");
                        let _ = stdout.flush();
                    }
                    None => std::thread::sleep(std::time::Duration::from_millis(1)),
                }
            }
        })?;

    shutdown_signal().await;
    info!("shutdown signal received, joining workers");

    reader.stop();
    stop_pump.store(true, std::sync::atomic::Ordering::Relaxed);
    let _ = stdout_pump.join();

    info!("vectorfs backend shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("received terminate signal, initiating shutdown"); },
    }
}
