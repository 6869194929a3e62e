//! # Pipeline Degradation and Breaking
//!
//! A scripted worker sits behind a real loopback socket so failures can be
//! switched on and off. Covers the degrade → fallback → probe → recover
//! cycle, breaker opening and half-open recovery, peer loss mid-call, and a
//! failed detection batch reaching every member.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_inference_gateway::config::CircuitBreakerSection;
use tokio_inference_gateway::dispatch::{
    CallContext, CallHandler, ChannelSettings, DetectionResponse, DispatchClient, OcrLine,
    OcrResponse, RpcRequest, RpcResponse, RpcServer,
};
use tokio_inference_gateway::edge::{CacheLayer, CacheTtls, RateLimiter};
use tokio_inference_gateway::pipeline::{
    detection_batcher, PayloadLimits, PipelineComponents, PipelineError, ReplyStatus, RequestMeta,
    ServiceBreakers,
};
use tokio_inference_gateway::resilience::{CircuitStatus, DegradationController, ServiceStatus};
use tokio_inference_gateway::RequestPipeline;

/// Worker whose OCR fails while `failing` is set and whose batch detection
/// always errors.
#[derive(Default)]
struct ScriptedWorker {
    failing: AtomicBool,
    ocr_calls: AtomicUsize,
}

#[async_trait]
impl CallHandler for ScriptedWorker {
    async fn handle(&self, request: RpcRequest, _ctx: CallContext) -> RpcResponse {
        match request {
            RpcRequest::ExtractText { .. } => {
                self.ocr_calls.fetch_add(1, Ordering::SeqCst);
                if self.failing.load(Ordering::SeqCst) {
                    RpcResponse::Ocr(OcrResponse {
                        success: false,
                        message: "model crashed".to_string(),
                        full_text: String::new(),
                        lines: vec![],
                    })
                } else {
                    RpcResponse::Ocr(OcrResponse {
                        success: true,
                        message: "OCR successful".to_string(),
                        full_text: "STOP".to_string(),
                        lines: vec![OcrLine {
                            text: "STOP".to_string(),
                            confidence: 0.99,
                            bbox: [0.0; 8],
                        }],
                    })
                }
            }
            RpcRequest::DetectObjects { .. } => RpcResponse::Detection(DetectionResponse {
                success: true,
                message: String::new(),
                objects: vec![],
            }),
            _ => RpcResponse::Error {
                message: "device lost".to_string(),
                shutting_down: false,
            },
        }
    }
}

fn settings() -> ChannelSettings {
    ChannelSettings {
        call_timeout: Duration::from_secs(5),
        reconnect_initial: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
        ..ChannelSettings::default()
    }
}

struct Options {
    breaker_threshold: usize,
    breaker_recovery: Duration,
    degrade_after: u32,
    degrade_recovery: Duration,
    batching: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            breaker_threshold: 100,
            breaker_recovery: Duration::from_secs(60),
            degrade_after: 100,
            degrade_recovery: Duration::from_secs(60),
            batching: false,
        }
    }
}

fn pipeline(addr: String, opts: Options) -> RequestPipeline {
    let client = DispatchClient::new(addr, settings());
    let breaker = CircuitBreakerSection {
        failure_threshold: opts.breaker_threshold,
        recovery_timeout_ms: opts.breaker_recovery.as_millis() as u64,
        half_open_max_calls: 1,
    };
    let components = PipelineComponents {
        breakers: ServiceBreakers::from_section(&breaker),
        degradation: DegradationController::new(opts.degrade_after, opts.degrade_recovery),
        detection_batcher: opts
            .batching
            .then(|| detection_batcher(client.clone(), 8, Duration::from_millis(50))),
        // Every call must reach the worker.
        cache: CacheLayer::disabled(),
        cache_ttls: CacheTtls {
            detection: Duration::ZERO,
            ocr: Duration::ZERO,
            transcription: Duration::ZERO,
            vqa: Duration::ZERO,
        },
        limiter: RateLimiter::unlimited(),
        limits: PayloadLimits {
            max_image_bytes: 1 << 20,
            max_audio_bytes: 1 << 20,
        },
    };
    RequestPipeline::new(client, components)
}

async fn scripted_worker() -> (Arc<ScriptedWorker>, String, watch::Sender<bool>) {
    let worker = Arc::new(ScriptedWorker::default());
    let server = RpcServer::bind("127.0.0.1:0", Arc::clone(&worker), 1 << 20)
        .await
        .expect("test: bind");
    let addr = server.local_addr().expect("test: addr").to_string();
    let (stop, stop_rx) = watch::channel(false);
    tokio::spawn(server.serve(stop_rx));
    (worker, addr, stop)
}

#[tokio::test]
async fn test_degrade_fallback_probe_recover() {
    let (worker, addr, _stop) = scripted_worker().await;
    let pipeline = pipeline(
        addr,
        Options {
            degrade_after: 4,
            degrade_recovery: Duration::from_millis(200),
            ..Options::default()
        },
    );
    let meta = RequestMeta::new("c1");
    worker.failing.store(true, Ordering::SeqCst);

    // Threshold 4: degraded from 2 failures, unavailable at 4.
    for expected in [
        ServiceStatus::Healthy,
        ServiceStatus::Healthy,
        ServiceStatus::Degraded,
        ServiceStatus::Degraded,
    ] {
        assert_eq!(pipeline.degradation().status("ocr"), expected);
        let err = pipeline
            .extract_text(&meta, "sign.png", b"STOP".to_vec(), "en")
            .await
            .expect_err("test: ocr failing");
        assert!(matches!(err, PipelineError::Backend { .. }), "got {err:?}");
    }
    assert_eq!(pipeline.degradation().status("ocr"), ServiceStatus::Unavailable);

    // While unavailable the worker is not contacted.
    let calls_before = worker.ocr_calls.load(Ordering::SeqCst);
    let fallback = pipeline
        .extract_text(&meta, "sign.png", b"STOP".to_vec(), "en")
        .await
        .expect("test: fallback");
    assert_eq!(fallback.status, ReplyStatus::Degraded);
    assert!(fallback.is_fallback);
    assert_eq!(worker.ocr_calls.load(Ordering::SeqCst), calls_before);

    // After the recovery window one probe reaches the recovered worker.
    worker.failing.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(250)).await;
    let recovered = pipeline
        .extract_text(&meta, "sign.png", b"STOP".to_vec(), "en")
        .await
        .expect("test: probe succeeds");
    assert_eq!(recovered.status, ReplyStatus::Success);
    assert_eq!(recovered.data.full_text, "STOP");

    let health = pipeline.degradation().health("ocr").expect("test: health");
    assert_eq!(health.status, ServiceStatus::Healthy);
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(health.total_failures, 4);
}

#[tokio::test]
async fn test_breaker_opens_then_recovers_through_half_open() {
    let (worker, addr, _stop) = scripted_worker().await;
    let pipeline = pipeline(
        addr,
        Options {
            breaker_threshold: 2,
            breaker_recovery: Duration::from_millis(200),
            ..Options::default()
        },
    );
    let meta = RequestMeta::new("c1");
    worker.failing.store(true, Ordering::SeqCst);

    for _ in 0..2 {
        let _ = pipeline
            .extract_text(&meta, "a.png", b"STOP".to_vec(), "en")
            .await;
    }
    assert_eq!(pipeline.breakers().ocr.status(), CircuitStatus::Open);
    assert!(!pipeline.breakers().ocr.can_execute());

    let calls_before = worker.ocr_calls.load(Ordering::SeqCst);
    let rejected = pipeline
        .extract_text(&meta, "a.png", b"STOP".to_vec(), "en")
        .await
        .expect_err("test: breaker open");
    assert!(matches!(rejected, PipelineError::BreakerOpen { .. }));
    assert_eq!(worker.ocr_calls.load(Ordering::SeqCst), calls_before);
    // Rejections are not new failures.
    let health = pipeline.degradation().health("ocr").expect("test: health");
    assert_eq!(health.total_failures, 2);

    // Other capabilities keep their own breaker.
    let detection = pipeline
        .detect_objects(&meta, "a.jpg", b"img".to_vec(), "en")
        .await
        .expect("test: detection unaffected");
    assert_eq!(detection.status, ReplyStatus::Success);

    worker.failing.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(pipeline.breakers().ocr.status(), CircuitStatus::HalfOpen);
    pipeline
        .extract_text(&meta, "a.png", b"STOP".to_vec(), "en")
        .await
        .expect("test: probe succeeds");
    assert_eq!(pipeline.breakers().ocr.status(), CircuitStatus::Closed);
}

#[tokio::test]
async fn test_peer_lost_mid_call_is_one_bounded_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test: bind");
    let addr = listener.local_addr().expect("test: addr").to_string();
    tokio::spawn(async move {
        if let Ok((mut sock, _)) = listener.accept().await {
            // Take the call, then vanish without answering.
            let mut buf = [0u8; 256];
            let _ = sock.read(&mut buf).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    let pipeline = pipeline(addr, Options::default());
    let started = Instant::now();
    let err = pipeline
        .transcribe_audio(&RequestMeta::new("c1"), "a.wav", vec![1u8; 128])
        .await
        .expect_err("test: peer gone");
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(matches!(err, PipelineError::Unavailable { .. }), "got {err:?}");
    assert!(err.is_temporarily_unavailable());

    let health = pipeline
        .degradation()
        .health("transcription")
        .expect("test: health");
    assert_eq!((health.total_requests, health.total_failures), (1, 1));
}

#[tokio::test]
async fn test_failed_batch_fails_every_member() {
    let (_worker, addr, _stop) = scripted_worker().await;
    let pipeline = pipeline(
        addr,
        Options {
            batching: true,
            ..Options::default()
        },
    );

    let requests = (0..3).map(|i| {
        let pipeline = pipeline.clone();
        async move {
            pipeline
                .detect_objects(
                    &RequestMeta::new(format!("c{i}")),
                    &format!("f{i}.jpg"),
                    vec![i as u8 + 1; 16],
                    "en",
                )
                .await
        }
    });
    let results = join_all(requests).await;

    for result in results {
        match result {
            Err(PipelineError::Backend { service, message }) => {
                assert_eq!(service, "detection");
                assert!(message.contains("device lost"), "message {message}");
            }
            other => panic!("expected Backend, got {other:?}"),
        }
    }
    let health = pipeline
        .degradation()
        .health("detection")
        .expect("test: health");
    assert_eq!(health.total_failures, 3);
}
