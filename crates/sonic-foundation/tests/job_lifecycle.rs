//! End-to-end lifecycle tests for the job orchestrator.
//!
//! Every test drives raw JSON requests through a fully wired
//! [`JobOrchestrator`](sonic_foundation::orchestrator::JobOrchestrator):
//! real staging, the real execution gate and pipeline, and the reference
//! model backend loaded from placeholder checkpoints. Only the video encoder
//! and the webhook transport are replaced (see [`common::harness`]).
//!
//! # Running
//!
//! ```bash
//! cargo test -p sonic-foundation --test job_lifecycle
//! ```

mod common;

use base64::Engine;
use common::harness::Harness;
use serde_json::json;
use sonic_foundation::registry::RegistryState;
use sonic_kernel::error::{ErrorKind, Stage};
use sonic_kernel::job::JobResult;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn expect_success(result: &JobResult) -> &sonic_kernel::job::OutputArtifact {
    match result {
        JobResult::Success(artifact) => artifact,
        JobResult::Failure { error_kind, error, .. } => {
            panic!("expected success, got {error_kind}: {error}")
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// § 1  Happy path
// ─────────────────────────────────────────────────────────────────────────────

/// A one-second clip at 25 fps produces 25 frames, a published output file
/// and a timing entry for every stage.
#[tokio::test]
async fn one_second_clip_is_generated_and_published() {
    let h = Harness::new();
    let result = h.orchestrator.handle(h.request("clip_1", json!({}))).await;
    let artifact = expect_success(&result);

    assert_eq!(artifact.job_id, "clip_1");
    assert_eq!(artifact.frame_count, 25);
    assert_eq!(artifact.fps, 25);
    assert_eq!((artifact.width, artifact.height), (64, 64));
    assert_eq!(artifact.seed, 42);
    assert!(artifact.face_detected);
    assert!((artifact.duration_secs - 1.0).abs() < 1e-3);
    assert_eq!(artifact.video_path, h.output_path("clip_1"));
    assert!(artifact.video_path.is_file());
    assert_eq!(
        artifact.file_size_bytes,
        std::fs::metadata(&artifact.video_path).unwrap().len()
    );
    assert!(artifact.video_base64.is_none());

    let stages: Vec<Stage> = artifact.stage_latencies.iter().map(|t| t.stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::FaceDetection,
            Stage::AudioFeatures,
            Stage::Conditioning,
            Stage::Sampling,
            Stage::Decode,
            Stage::Encode,
        ]
    );

    let calls = h.encoder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].frame_count, 25);
    assert!(calls[0].output_path.to_string_lossy().ends_with(".partial"));

    // two guidance branches per step
    assert_eq!(h.probe.sampler_calls(), 3 * 2);
    assert_eq!(h.orchestrator.gate_stats().admissions, 1);
    assert_eq!(h.orchestrator.gate_stats().active, 0);
    assert_eq!(h.partial_outputs(), 0);
}

/// `input.job_id` names the job and its output file.
#[tokio::test]
async fn input_job_id_names_the_output() {
    let h = Harness::new();
    let result = h
        .orchestrator
        .handle(h.request("event_id", json!({ "job_id": "render_7" })))
        .await;
    let artifact = expect_success(&result);
    assert_eq!(artifact.job_id, "render_7");
    assert_eq!(artifact.video_path, h.output_path("render_7"));
}

/// Without `duration_seconds` the clip follows the audio length.
#[tokio::test]
async fn duration_defaults_to_audio_length() {
    let h = Harness::new();
    let result = h
        .orchestrator
        .handle(h.request(
            "follow_audio",
            json!({ "audio_path": h.input("voice_4s.wav"), "sampling_steps": 1 }),
        ))
        .await;
    let artifact = expect_success(&result);
    assert!((artifact.duration_secs - 4.0).abs() < 0.01, "{}", artifact.duration_secs);
    assert_eq!(artifact.frame_count, 100);
}

/// An explicit duration shorter than the audio wins.
#[tokio::test]
async fn explicit_duration_trims_the_clip() {
    let h = Harness::new();
    let result = h
        .orchestrator
        .handle(h.request(
            "trimmed",
            json!({ "audio_path": h.input("voice_4s.wav"), "duration_seconds": 0.5 }),
        ))
        .await;
    let artifact = expect_success(&result);
    assert_eq!(artifact.frame_count, 13);
    assert!((h.encoder.calls()[0].duration_secs - 0.5).abs() < 1e-6);
}

/// A request without a seed gets one, and reports it back.
#[tokio::test]
async fn missing_seed_is_generated_and_reported() {
    let h = Harness::new();
    let result = h
        .orchestrator
        .handle(h.request("no_seed", json!({ "seed": null })))
        .await;
    let artifact = expect_success(&result);
    assert!(artifact.seed <= u32::MAX as u64);
}

/// Base64 inputs are staged like paths.
#[tokio::test]
async fn base64_inputs_are_accepted() {
    let h = Harness::new();
    let b64 = base64::engine::general_purpose::STANDARD;
    let image = b64.encode(std::fs::read(h.input("face.png")).unwrap());
    let audio = b64.encode(std::fs::read(h.input("voice_1s.wav")).unwrap());
    let result = h
        .orchestrator
        .handle(h.request(
            "inline_inputs",
            json!({
                "image_path": null,
                "audio_path": null,
                "image_base64": format!("data:image/png;base64,{image}"),
                "audio_base64": audio,
            }),
        ))
        .await;
    expect_success(&result);
    assert_eq!(h.staged_leftovers(), 0);
}

/// With face cropping on, the clip keeps the configured resolution.
#[tokio::test]
async fn face_crop_keeps_output_resolution() {
    let h = Harness::new();
    let result = h
        .orchestrator
        .handle(h.request("cropped", json!({ "crop": true })))
        .await;
    let artifact = expect_success(&result);
    assert_eq!((artifact.width, artifact.height), (64, 64));
}

// ─────────────────────────────────────────────────────────────────────────────
// § 2  Determinism
// ─────────────────────────────────────────────────────────────────────────────

/// Same image, audio, parameters and seed give bit-identical frames; a
/// different seed does not.
#[tokio::test]
async fn same_seed_gives_identical_frames() {
    let h = Harness::new();
    let a = h.orchestrator.handle(h.request("det_a", json!({}))).await;
    let b = h.orchestrator.handle(h.request("det_b", json!({}))).await;
    let c = h
        .orchestrator
        .handle(h.request("det_c", json!({ "seed": 43 })))
        .await;

    let (a, b, c) = (expect_success(&a), expect_success(&b), expect_success(&c));
    assert_eq!(a.frames_digest, b.frames_digest);
    assert_ne!(a.frames_digest, c.frames_digest);
    assert_eq!(
        std::fs::read(&a.video_path).unwrap(),
        std::fs::read(&b.video_path).unwrap()
    );
}

/// Guidance strength changes the result.
#[tokio::test]
async fn guidance_strength_changes_frames() {
    let h = Harness::new();
    let low = h
        .orchestrator
        .handle(h.request("g_low", json!({ "guidance_strength": 1.0 })))
        .await;
    let high = h
        .orchestrator
        .handle(h.request("g_high", json!({ "guidance_strength": 6.0 })))
        .await;
    assert_ne!(
        expect_success(&low).frames_digest,
        expect_success(&high).frames_digest
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// § 3  Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Invalid durations and step counts fail validation without touching the
/// registry, the staging area or the gate.
#[tokio::test]
async fn invalid_parameters_have_no_side_effects() {
    let h = Harness::new();
    let cases = [
        json!({ "duration_seconds": 0 }),
        json!({ "duration_seconds": -2.5 }),
        json!({ "duration_seconds": 10_000 }),
        json!({ "sampling_steps": 0 }),
        json!({ "sampling_steps": -4 }),
        json!({ "sampling_steps": 1_000 }),
        json!({ "guidance_strength": 50.0 }),
        json!({ "seed": -1 }),
        json!({ "image_url": "https://example.com/a.png" }),
        json!({ "audio_path": null }),
        json!({ "image_path": null, "image_url": "http://exa mple .com/a.png" }),
        json!({ "audio_path": null, "audio_url": "https://" }),
        json!({ "webhook_url": "http://hooks example.com/done" }),
    ];
    for (i, overrides) in cases.into_iter().enumerate() {
        let result = h
            .orchestrator
            .handle(h.request(&format!("invalid_{i}"), overrides.clone()))
            .await;
        assert_eq!(
            result.error_kind(),
            Some(ErrorKind::ValidationError),
            "case {overrides}"
        );
        if let JobResult::Failure { job_id, .. } = &result {
            assert_eq!(job_id.as_deref(), Some(format!("invalid_{i}").as_str()));
        }
    }

    assert_eq!(h.orchestrator.registry().load_attempts(), 0);
    assert_eq!(h.orchestrator.gate_stats().admissions, 0);
    assert_eq!(h.staged_leftovers(), 0);
    assert!(h.notifier.sent().is_empty());
}

/// Requests that are not even objects, or lack `input`, are rejected.
#[tokio::test]
async fn malformed_requests_are_rejected() {
    let h = Harness::new();
    for raw in [json!([]), json!("job"), json!({ "id": "x" }), json!({ "input": 7 })] {
        let result = h.orchestrator.handle(raw).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::ValidationError));
    }
    let unsafe_id = json!({ "id": "../../etc", "input": {} });
    assert_eq!(
        h.orchestrator.handle(unsafe_id).await.error_kind(),
        Some(ErrorKind::ValidationError)
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// § 4  Mutual exclusion
// ─────────────────────────────────────────────────────────────────────────────

/// N concurrent jobs give N admissions and never overlap on the accelerator.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_jobs_never_overlap() {
    let h = Harness::new();
    let requests = (0..4)
        .map(|i| h.request(&format!("burst_{i}"), json!({ "seed": i })))
        .collect();
    let results = h.orchestrator.handle_all(requests).await;

    assert_eq!(results.len(), 4);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(expect_success(result).job_id, format!("burst_{i}"));
    }
    let stats = h.orchestrator.gate_stats();
    assert_eq!(stats.admissions, 4);
    assert_eq!(stats.releases, 4);
    assert_eq!(stats.active, 0);
    assert_eq!(h.probe.max_concurrent(), 1);
    assert_eq!(h.orchestrator.registry().load_attempts(), 1);
    assert_eq!(h.staged_leftovers(), 0);
}

/// A job that waits longer than the admission timeout fails with `Timeout`
/// and never acquires the gate.
#[tokio::test]
async fn queue_timeout_never_acquires_the_gate() {
    let h = Harness::builder().admission_timeout_ms(50).build();
    let holder = h
        .orchestrator
        .gate()
        .admit("holder", Duration::from_secs(1))
        .await
        .unwrap();

    let result = h.orchestrator.handle(h.request("late", json!({}))).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));

    let stats = h.orchestrator.gate_stats();
    assert_eq!(stats.admissions, 1, "only the holder was admitted");
    assert_eq!(stats.timeouts, 1);
    assert_eq!(h.probe.sampler_calls(), 0);
    assert!(h.encoder.calls().is_empty());
    assert_eq!(h.staged_leftovers(), 0);
    drop(holder);
}

/// A full waiting queue rejects immediately with `Busy`.
#[tokio::test]
async fn full_queue_is_busy() {
    let h = Harness::builder().max_queue_depth(0).build();
    let _holder = h
        .orchestrator
        .gate()
        .admit("holder", Duration::from_secs(1))
        .await
        .unwrap();

    let result = h.orchestrator.handle(h.request("overflow", json!({}))).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::Busy));
    assert_eq!(h.orchestrator.gate_stats().busy_rejections, 1);
    assert_eq!(h.staged_leftovers(), 0);
}

/// A queued job can be withdrawn; it is never admitted.
#[tokio::test]
async fn queued_job_can_be_cancelled() {
    let h = Harness::new();
    let holder = h
        .orchestrator
        .gate()
        .admit("holder", Duration::from_secs(1))
        .await
        .unwrap();
    let token = CancellationToken::new();

    let (result, ()) = tokio::join!(
        h.orchestrator
            .handle_with_cancel(h.request("withdrawn", json!({})), &token),
        async {
            while h.orchestrator.gate_stats().queued == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            token.cancel();
        }
    );

    assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
    assert_eq!(h.orchestrator.gate_stats().admissions, 1);
    assert_eq!(h.staged_leftovers(), 0);
    drop(holder);

    let after = h.orchestrator.handle(h.request("next", json!({}))).await;
    expect_success(&after);
}

// ─────────────────────────────────────────────────────────────────────────────
// § 5  Failures inside execution
// ─────────────────────────────────────────────────────────────────────────────

/// Exceeding the device budget fails with `ResourceExhausted`, releases the
/// ticket, reclaims device memory, and the next job succeeds.
#[tokio::test]
async fn out_of_memory_releases_and_recovers() {
    let h = Harness::builder().memory_limit_mb(1).build();

    let big = h
        .orchestrator
        .handle(h.request(
            "too_big",
            json!({ "audio_path": h.input("voice_4s.wav"), "duration_seconds": 4.0 }),
        ))
        .await;
    assert_eq!(big.error_kind(), Some(ErrorKind::ResourceExhausted));
    assert_eq!(h.probe.reclaims(), 1);
    assert_eq!(h.orchestrator.gate_stats().active, 0);
    assert_eq!(h.orchestrator.gate_stats().releases, 1);
    assert_eq!(h.staged_leftovers(), 0);
    assert!(!h.output_path("too_big").exists());

    let small = h.orchestrator.handle(h.request("fits", json!({}))).await;
    expect_success(&small);
    assert_eq!(h.probe.reclaims(), 1);
}

/// An image without a face fails the face detection stage.
#[tokio::test]
async fn image_without_face_fails() {
    let h = Harness::new();
    let result = h
        .orchestrator
        .handle(h.request("faceless", json!({ "image_path": h.input("flat.png") })))
        .await;
    match &result {
        JobResult::Failure { error_kind, error, .. } => {
            assert_eq!(*error_kind, ErrorKind::InferenceError);
            assert!(error.contains("no face"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(h.probe.sampler_calls(), 0);
    assert_eq!(h.staged_leftovers(), 0);
    assert_eq!(h.orchestrator.gate_stats().active, 0);
}

/// A failing encoder leaves neither a partial nor a published file.
#[tokio::test]
async fn encode_failure_removes_partial_output() {
    let h = Harness::new();
    h.encoder.fail_next(true);
    let result = h.orchestrator.handle(h.request("broken_mux", json!({}))).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::InferenceError));
    assert_eq!(h.encoder.calls().len(), 1);
    assert_eq!(h.partial_outputs(), 0);
    assert!(!h.output_path("broken_mux").exists());
    assert_eq!(h.staged_leftovers(), 0);

    h.encoder.fail_next(false);
    expect_success(&h.orchestrator.handle(h.request("fixed_mux", json!({}))).await);
}

/// Unreadable inputs fail staging with an I/O or validation kind and leave
/// nothing behind. Models are never loaded for them.
#[tokio::test]
async fn staging_failures_leave_nothing_behind() {
    let h = Harness::new();
    let missing = h
        .orchestrator
        .handle(h.request(
            "missing_audio",
            json!({ "audio_path": h.root().join("nope.wav").display().to_string() }),
        ))
        .await;
    assert_eq!(missing.error_kind(), Some(ErrorKind::IoError));

    let not_image = h.write_input("notes.txt", b"just some text");
    let corrupt = h
        .orchestrator
        .handle(h.request(
            "corrupt_image",
            json!({ "image_path": not_image.display().to_string() }),
        ))
        .await;
    assert_eq!(corrupt.error_kind(), Some(ErrorKind::ValidationError));

    let truncated = h.write_input("truncated.png", b"\x89PNG\r\n\x1a\ntruncated");
    let undecodable = h
        .orchestrator
        .handle(h.request(
            "truncated_image",
            json!({ "image_path": truncated.display().to_string() }),
        ))
        .await;
    assert_eq!(undecodable.error_kind(), Some(ErrorKind::IoError));

    let mut wav = std::fs::read(h.input("voice_1s.wav")).unwrap();
    wav.truncate(30);
    let broken = h.write_input("broken.wav", &wav);
    let undecodable = h
        .orchestrator
        .handle(h.request(
            "broken_audio",
            json!({ "audio_path": broken.display().to_string() }),
        ))
        .await;
    assert_eq!(undecodable.error_kind(), Some(ErrorKind::IoError));

    assert_eq!(h.orchestrator.registry().load_attempts(), 0);
    assert_eq!(h.orchestrator.gate_stats().admissions, 0);
    assert_eq!(h.staged_leftovers(), 0);
}

/// Input errors are reported as such even when the models cannot load.
#[tokio::test]
async fn input_errors_win_over_model_load_failure() {
    let h = Harness::builder().without_checkpoints().build();
    let result = h
        .orchestrator
        .handle(h.request(
            "missing_audio",
            json!({ "audio_path": h.root().join("nope.wav").display().to_string() }),
        ))
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::IoError));
    assert_eq!(h.orchestrator.registry().load_attempts(), 0);
    assert_eq!(h.orchestrator.registry().state(), RegistryState::Unloaded);
    assert_eq!(h.staged_leftovers(), 0);
}

/// Audio staged at another rate is resampled to what the audio encoder takes.
#[tokio::test]
async fn audio_follows_the_encoder_sample_rate() {
    let h = Harness::builder().staging_sample_rate(22_050).build();
    let result = h.orchestrator.handle(h.request("resampled", json!({}))).await;
    let artifact = expect_success(&result);
    assert_eq!(artifact.frame_count, 25);
    assert_eq!(h.staged_leftovers(), 0);
}

/// A failed model load is permanent: every job reports it, the loader runs
/// once.
#[tokio::test]
async fn failed_model_load_is_reported_for_every_job() {
    let h = Harness::builder().without_checkpoints().build();
    for id in ["first", "second"] {
        let result = h.orchestrator.handle(h.request(id, json!({}))).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::ModelLoadError));
    }
    assert_eq!(h.orchestrator.registry().load_attempts(), 1);
    assert_eq!(h.orchestrator.registry().state(), RegistryState::Unavailable);
    assert_eq!(h.orchestrator.gate_stats().admissions, 0);
    assert_eq!(h.staged_leftovers(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// § 6  Notifications and output options
// ─────────────────────────────────────────────────────────────────────────────

/// One notification per job, sent after the result is final, for success
/// and for failure alike.
#[tokio::test]
async fn webhook_is_notified_once_per_job() {
    let h = Harness::new();
    let hook = json!({
        "webhook_url": "https://hooks.example.com/video-complete",
        "webhook_data": { "job_id": "external_9", "api_key": "k" },
    });

    let ok = h.orchestrator.handle(h.request("hooked", hook.clone())).await;
    expect_success(&ok);

    let mut failing = hook.clone();
    failing["image_path"] = json!(h.input("flat.png"));
    let failed = h.orchestrator.handle(h.request("hooked_fail", failing)).await;
    assert!(!failed.is_success());

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0.job_id.as_deref(), Some("external_9"));
    assert_eq!(sent[0].1, ok);
    assert_eq!(sent[1].1, failed);
}

/// Inline video embedding is opt-in.
#[tokio::test]
async fn video_is_inlined_when_enabled() {
    let h = Harness::builder().inline_video().build();
    let result = h.orchestrator.handle(h.request("inline", json!({}))).await;
    let artifact = expect_success(&result);
    let video = artifact.video_base64.as_deref().expect("inline video");
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(video)
        .unwrap();
    assert_eq!(decoded, std::fs::read(&artifact.video_path).unwrap());
}

/// Results serialize with a `status` tag and stable error kind names.
#[tokio::test]
async fn results_serialize_for_the_caller() {
    let h = Harness::new();
    let ok = h.orchestrator.handle(h.request("wire_ok", json!({}))).await;
    let value = serde_json::to_value(&ok).unwrap();
    assert_eq!(value["status"], "completed");
    assert_eq!(value["frame_count"], 25);

    let bad = h
        .orchestrator
        .handle(h.request("wire_bad", json!({ "sampling_steps": 0 })))
        .await;
    let value = serde_json::to_value(&bad).unwrap();
    assert_eq!(value["status"], "failed");
    assert_eq!(value["error_kind"], "ValidationError");
    assert_eq!(value["job_id"], "wire_bad");
}
