//! # Dispatch Round Trip
//!
//! Drives the worker-side call handler through a real loopback socket: typed
//! calls, many calls multiplexed on one connection, and detection batches
//! coalesced by the dynamic batcher.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_inference_gateway::dispatch::{ChannelSettings, DispatchClient, ImageInput, RpcServer};
use tokio_inference_gateway::pipeline::detection_batcher;
use tokio_inference_gateway::resilience::{BufferPool, BufferPools};
use tokio_inference_gateway::worker::{InferenceService, ScratchDir, SimulatedBackend};
use tokio_inference_gateway::TraceId;

struct Harness {
    client: DispatchClient,
    _stop: watch::Sender<bool>,
    _scratch: tempfile::TempDir,
}

async fn harness() -> Harness {
    let scratch = tempfile::tempdir().expect("test: tempdir");
    let service = InferenceService::new(
        SimulatedBackend::new(),
        BufferPools {
            image: BufferPool::new("image", 64 * 1024, 4),
            audio: BufferPool::new("audio", 256 * 1024, 2),
        },
        ScratchDir::new(Some(scratch.path().to_path_buf())).expect("test: scratch"),
        4,
    );
    let server = RpcServer::bind("127.0.0.1:0", Arc::new(service), 4 * 1024 * 1024)
        .await
        .expect("test: bind");
    let addr = server.local_addr().expect("test: addr").to_string();
    let (stop, stop_rx) = watch::channel(false);
    tokio::spawn(server.serve(stop_rx));

    Harness {
        client: DispatchClient::new(addr, ChannelSettings::default()),
        _stop: stop,
        _scratch: scratch,
    }
}

#[tokio::test]
async fn test_typed_calls_round_trip() {
    let h = harness().await;
    let trace = TraceId::new("roundtrip-1");

    let ocr = h
        .client
        .extract_text("sign.png", b"\x00\x01STOP\x02EXIT".to_vec(), "en", &trace)
        .await
        .expect("test: ocr");
    assert!(ocr.success, "{}", ocr.message);
    assert!(ocr.full_text.contains("STOP"));
    assert!(ocr.full_text.contains("EXIT"));

    let transcript = h
        .client
        .transcribe_audio("memo.wav", vec![0u8; 64_000], &trace)
        .await
        .expect("test: transcription");
    assert!(transcript.success);
    assert!((transcript.duration - 2.0).abs() < 1e-9);

    let answer = h
        .client
        .answer_visual_question("room.jpg", b"room".to_vec(), "What is this?", &trace)
        .await
        .expect("test: vqa");
    assert!(answer.success);
    assert!(!answer.answer.is_empty());

    let empty = h
        .client
        .detect_objects("blank.jpg", Vec::new(), &trace)
        .await
        .expect("test: detection reply");
    assert!(!empty.success, "empty payload must be a model failure, not a transport one");
}

#[tokio::test]
async fn test_concurrent_calls_share_one_connection() {
    let h = harness().await;
    h.client.connect().await.expect("test: connect");

    let calls = (0..24).map(|i| {
        let client = h.client.clone();
        async move {
            let word = format!("WORD{i:02}");
            let reply = client
                .extract_text("page.png", word.clone().into_bytes(), "en", &TraceId::new(format!("c{i}")))
                .await
                .expect("test: ocr");
            (word, reply.full_text)
        }
    });
    for (sent, got) in join_all(calls).await {
        assert_eq!(got.trim(), sent);
    }
    assert!(h.client.is_connected());
}

#[tokio::test]
async fn test_full_detection_batch_is_one_call() {
    let h = harness().await;
    h.client.connect().await.expect("test: connect");
    let batcher = detection_batcher(h.client.clone(), 8, Duration::from_secs(5));

    let started = Instant::now();
    let adds = (0..8).map(|i| {
        let input = ImageInput {
            filename: format!("f{i}.jpg"),
            image: format!("image number {i}").into_bytes(),
        };
        batcher.add(input, TraceId::new(format!("b{i}")))
    });
    let results = join_all(adds).await;

    // A full batch never waits for the timer.
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(results.iter().all(|r| matches!(r, Ok(d) if d.success)));
    let snapshot = batcher.snapshot();
    assert_eq!(snapshot.batches_flushed, 1);
    assert_eq!(snapshot.items_processed, 8);
}

#[tokio::test]
async fn test_partial_detection_batch_waits_for_timer() {
    let h = harness().await;
    h.client.connect().await.expect("test: connect");
    let max_wait = Duration::from_millis(300);
    let batcher = detection_batcher(h.client.clone(), 8, max_wait);

    let started = Instant::now();
    let adds = (0..3).map(|i| {
        let input = ImageInput {
            filename: format!("p{i}.jpg"),
            image: vec![i as u8 + 1; 32],
        };
        batcher.add(input, TraceId::new(format!("p{i}")))
    });
    let results = join_all(adds).await;

    assert!(started.elapsed() >= max_wait);
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(batcher.snapshot().batches_flushed, 1);
}
