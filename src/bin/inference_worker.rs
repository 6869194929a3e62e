//! Worker process for the inference gateway.
//!
//! Owns the model backend and serves dispatch calls on a loopback port.
//! Prints `LISTENING <addr>` on stdout once bound, then serves until stdin
//! closes (with `--parent-stdin`) or Ctrl-C, drains in-flight calls for the
//! configured grace period, and sweeps stray temporary audio files.
//!
//! ## Usage
//!
//! ```text
//! inference-worker [--config <path>] [--port <port>] [--parent-stdin]
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio_inference_gateway::config::loader::load_or_default;
use tokio_inference_gateway::dispatch::RpcServer;
use tokio_inference_gateway::resilience::BufferPools;
use tokio_inference_gateway::worker::{InferenceService, ScratchDir, WorkerError, READY_PREFIX};
use tokio_inference_gateway::{available_cores, init_tracing, GatewayError, SimulatedBackend};
use tracing::{error, info, warn};

struct Args {
    config: Option<PathBuf>,
    port: Option<u16>,
    parent_stdin: bool,
}

fn usage() -> String {
    "usage: inference-worker [--config <path>] [--port <port>] [--parent-stdin]".to_string()
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;
    let mut port = None;
    let mut parent_stdin = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a value".to_string());
                }
                config = Some(PathBuf::from(&args[i]));
            }
            "--port" | "-p" => {
                i += 1;
                if i >= args.len() {
                    return Err("--port requires a value".to_string());
                }
                port = Some(
                    args[i]
                        .parse()
                        .map_err(|_| format!("invalid port: {}", args[i]))?,
                );
            }
            "--parent-stdin" => parent_stdin = true,
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument: {other}\n{}", usage())),
        }
        i += 1;
    }

    Ok(Args {
        config,
        port,
        parent_stdin,
    })
}

/// Resolves when the parent closes our stdin.
async fn parent_gone() {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 64];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

async fn run(args: Args) -> Result<(), GatewayError> {
    let mut config = load_or_default(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.worker.port = port;
    }

    let model_threads = config.worker.model_threads.unwrap_or_else(available_cores);
    let backend = SimulatedBackend::new()
        .with_latency(Duration::from_millis(config.worker.simulated_latency_ms));
    let scratch = ScratchDir::new(config.worker.scratch_dir.clone()).map_err(WorkerError::Io)?;
    let service = Arc::new(InferenceService::new(
        backend,
        BufferPools::from_section(&config.buffer_pool),
        scratch.clone(),
        model_threads,
    ));

    let server = RpcServer::bind(
        &config.worker.address(),
        service,
        config.channel.max_message_bytes,
    )
    .await?;
    let addr = server.local_addr()?;
    let in_flight = server.in_flight();
    info!(%addr, model_threads, "worker listening");

    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{READY_PREFIX}{addr}")
            .and_then(|()| stdout.flush())
            .map_err(|e| GatewayError::Other(format!("readiness line not written: {e}")))?;
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let serving = tokio::spawn(server.serve(stop_rx));

    let parent_stdin = args.parent_stdin;
    tokio::select! {
        _ = parent_gone(), if parent_stdin => info!("parent closed stdin, shutting down"),
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
    }

    let _ = stop_tx.send(true);
    match serving.await {
        Ok(Err(e)) => warn!(error = %e, "server stopped with error"),
        Err(e) => warn!(error = %e, "server task failed"),
        Ok(Ok(())) => {}
    }

    let grace = config.worker.shutdown_grace();
    if in_flight.wait_idle(grace).await {
        info!("in-flight calls drained");
    } else {
        warn!(remaining = in_flight.count(), "grace period elapsed with calls still running");
    }

    scratch.cleanup_stray();
    info!("worker stopped");
    Ok(())
}

fn main() {
    let _ = init_tracing();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(run(args));
    // A pending stdin read would otherwise hold the runtime open.
    runtime.shutdown_timeout(Duration::from_millis(200));

    if let Err(e) = result {
        error!(error = %e, "worker failed");
        eprintln!("inference-worker: {e}");
        std::process::exit(1);
    }
}
