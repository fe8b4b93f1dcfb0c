//! End-to-end smoke coverage through the public [`lmstrix::Toolkit`] surface.

use lmstrix::backend::fake::{FakeBackend, ScriptedOutcome};
use lmstrix::backend::DownloadedModel;
use lmstrix::registry::TestStatus;
use lmstrix::tester::TestOptions;
use lmstrix::Toolkit;
use tokio_util::sync::CancellationToken;

fn registry_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir()
        .join(format!("lmstrix-it-smoke-{name}-{}", std::process::id()))
        .join("registry.json")
}

fn downloaded(id: &str, path: &str, ctx_in: u64) -> DownloadedModel {
    DownloadedModel {
        id: id.to_string(),
        path: path.to_string(),
        size_bytes: None,
        ctx_in,
        ctx_out: None,
        has_tools: false,
        has_vision: false,
    }
}

#[tokio::test]
async fn model_record_round_trips_through_registry_json() {
    let path = registry_path("round-trip");
    let backend = FakeBackend::always(ScriptedOutcome::Good).with_models(vec![downloaded(
        "round-trip-model",
        "models/round-trip.gguf",
        4096,
    )]);
    let mut toolkit = Toolkit::open(backend, &path).await.unwrap();
    toolkit.scan().await.unwrap();

    let cancel = CancellationToken::new();
    let options = TestOptions {
        threshold: 102_400,
        ..Default::default()
    };
    toolkit
        .test_one("models/round-trip.gguf", &options, &cancel)
        .await
        .unwrap();

    let bytes = tokio::fs::read(&path).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let entry = &parsed["models/round-trip.gguf"];
    assert_eq!(entry["tested_max_context"], 4096);
    assert_eq!(entry["context_test_status"], "completed");

    let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
}

#[tokio::test]
async fn fleet_with_mixed_declared_sizes_runs_every_model_to_completion() {
    let path = registry_path("mixed-fleet");
    let backend = FakeBackend::always(ScriptedOutcome::Good).with_models(vec![
        downloaded("small", "models/small.gguf", 4096),
        downloaded("mid", "models/mid.gguf", 32_768),
        downloaded("big", "models/big.gguf", 131_072),
    ]);
    let mut toolkit = Toolkit::open(backend, &path).await.unwrap();
    toolkit.scan().await.unwrap();

    let cancel = CancellationToken::new();
    let options = TestOptions {
        threshold: 102_400,
        ..Default::default()
    };
    let records = toolkit.test_fleet(&options, &cancel).await.unwrap();

    assert_eq!(records.len(), 3);
    for record in &records {
        assert_eq!(record.context_test_status, TestStatus::Completed);
    }
    let by_path = |p: &str| records.iter().find(|r| r.path == p).unwrap();
    assert_eq!(by_path("models/small.gguf").tested_max_context, Some(4096));
    assert_eq!(by_path("models/mid.gguf").tested_max_context, Some(32_768));
    assert_eq!(by_path("models/big.gguf").tested_max_context, Some(102_400));

    let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
}
