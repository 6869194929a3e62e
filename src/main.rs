//! Demo binary for tokio-inference-gateway
//!
//! Starts the worker process, pushes a mixed workload through the request
//! pipeline, prints the aggregated gateway status as JSON and stops the
//! worker gracefully.
//!
//! ## Usage
//!
//! ```text
//! inference-gateway [--config <path>] [--clients <n>] [--metrics]
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter

use futures::future::join_all;
use std::path::PathBuf;
use std::time::Duration;
use tokio_inference_gateway::config::loader::load_or_default;
use tokio_inference_gateway::dispatch::ChannelSettings;
use tokio_inference_gateway::pipeline::RequestMeta;
use tokio_inference_gateway::worker::{watch_liveness, WorkerLaunch};
use tokio_inference_gateway::{
    init_tracing, metrics, DispatchClient, GatewayConfig, GatewayError, PipelineError,
    RequestPipeline, WorkerProcess,
};
use tracing::{error, info, warn};

struct Args {
    config: Option<PathBuf>,
    clients: usize,
    print_metrics: bool,
}

fn usage() -> String {
    "usage: inference-gateway [--config <path>] [--clients <n>] [--metrics]".to_string()
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;
    let mut clients = 4;
    let mut print_metrics = false;

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
            "--clients" | "-n" => {
                i += 1;
                if i >= args.len() {
                    return Err("--clients requires a value".to_string());
                }
                clients = args[i]
                    .parse()
                    .map_err(|_| format!("invalid client count: {}", args[i]))?;
            }
            "--metrics" => print_metrics = true,
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument: {other}\n{}", usage())),
        }
        i += 1;
    }

    Ok(Args {
        config,
        clients,
        print_metrics,
    })
}

/// Deterministic fake payload for demo client `n`.
fn payload(kind: &str, n: usize, len: usize) -> Vec<u8> {
    let seed = format!("{kind}-{n} STOP EXIT ");
    seed.bytes().cycle().take(len).collect()
}

/// One simulated client: a detection, an OCR read, a transcription and a question.
async fn run_client(pipeline: &RequestPipeline, n: usize) -> usize {
    let meta = RequestMeta::new(format!("demo-client-{n}"));
    let mut failures = 0;

    let mut note = |service: &str, result: Result<bool, PipelineError>| match result {
        Ok(fallback) => info!(client = n, service, fallback, "request served"),
        Err(e) => {
            failures += 1;
            warn!(client = n, service, error = %e, retryable = e.is_temporarily_unavailable(), "request failed");
        }
    };

    let detection = pipeline
        .detect_objects(&meta, &format!("frame-{n}.jpg"), payload("img", n, 4096), "en")
        .await;
    note("detection", detection.map(|r| r.is_fallback));

    let ocr = pipeline
        .extract_text(&meta, &format!("sign-{n}.png"), payload("sign", n, 2048), "en")
        .await;
    note("ocr", ocr.map(|r| r.is_fallback));

    let transcript = pipeline
        .transcribe_audio(&meta, &format!("memo-{n}.wav"), payload("audio", n, 64_000))
        .await;
    note("transcription", transcript.map(|r| r.is_fallback));

    let answer = pipeline
        .answer_visual_question(
            &meta,
            &format!("room-{n}.jpg"),
            payload("img", n, 4096),
            "How many objects are in front of me?",
        )
        .await;
    note("vqa", answer.map(|r| r.is_fallback));

    failures
}

async fn run(args: Args, config: GatewayConfig) -> Result<(), GatewayError> {
    info!(service = %config.service.name, version = %config.service.version, "starting gateway demo");

    let launch = WorkerLaunch::from_section(&config.worker, args.config.as_deref())?;
    let worker = WorkerProcess::spawn(&launch).await?;
    info!(addr = %worker.addr(), pid = ?worker.pid(), "worker ready");

    let client = DispatchClient::new(worker.addr(), ChannelSettings::from_section(&config.channel));
    client.connect().await?;
    let liveness = watch_liveness(client.clone(), config.worker.liveness_interval());
    let pipeline = RequestPipeline::from_config(&config, client.clone());

    let clients = (0..args.clients).map(|n| run_client(&pipeline, n));
    let failures: usize = join_all(clients).await.into_iter().sum();

    // Repeat one client so the cache has something to serve.
    let repeat_failures = run_client(&pipeline, 0).await;
    info!(failures = failures + repeat_failures, "workload finished");

    let batch = pipeline
        .detect_many(
            &RequestMeta::new("demo-batch"),
            (0..3)
                .map(|i| (format!("batch-{i}.jpg"), payload("batch", i, 1024)))
                .collect(),
            "en",
        )
        .await;
    match batch {
        Ok(summary) => info!(
            total = summary.total_files,
            successful = summary.successful,
            failed = summary.failed,
            "batch detection done"
        ),
        Err(e) => warn!(error = %e, "batch detection failed"),
    }

    let status = pipeline.status(Duration::from_secs(2)).await;
    let json = serde_json::to_string_pretty(&status)
        .map_err(|e| GatewayError::Other(format!("status not serializable: {e}")))?;
    println!("{json}");
    if args.print_metrics {
        println!("{}", metrics::gather_text());
    }

    liveness.abort();
    client.close();
    let exit = worker.shutdown().await?;
    info!(%exit, "worker stopped");
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

    if let Err(e) = metrics::init_metrics() {
        eprintln!("metrics init failed: {e}");
        std::process::exit(1);
    }

    let config = match load_or_default(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("inference-gateway: {e}");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(config.runtime.blocking_threads())
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(args, config)) {
        error!(error = %e, "gateway failed");
        eprintln!("inference-gateway: {e}");
        std::process::exit(1);
    }
}
