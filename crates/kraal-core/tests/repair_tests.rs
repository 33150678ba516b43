//! Repair coordinator behavior: deduplication, waiter timeouts, and the
//! repairing gate on the request path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use kraal_core::backend::stub::StubBackend;
use kraal_core::config::DownloadConfig;
use kraal_core::{
    needs_repair, BlobDownloader, ChatMessage, Error, InferenceParams, InferencePipeline,
    LlamaManager, ModelStorage, ModelSync, RepairCoordinator, RepairStatus, RequestCoordinator,
};

fn config() -> DownloadConfig {
    DownloadConfig {
        max_retries: 0,
        backoff_ms: 10,
        ..DownloadConfig::default()
    }
}

fn valid_gguf_body() -> Vec<u8> {
    let mut body = b"GGUF".to_vec();
    body.resize(4096, 0);
    body
}

/// Counts hits and serves a valid GGUF body after an artificial delay.
struct CountingBlob {
    hits: Arc<AtomicUsize>,
    delay: Duration,
}

impl Respond for CountingBlob {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.hits.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(200)
            .set_body_bytes(valid_gguf_body())
            .set_delay(self.delay)
    }
}

async fn registry_with_model(server: &MockServer, model_dir: &str, delay: Duration) -> Arc<AtomicUsize> {
    Mock::given(method("GET"))
        .and(path("/concurrent-model/manifest.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "files": [{"name": "model.gguf", "url": format!("/{}/model.gguf", model_dir)}]
        })))
        .mount(server)
        .await;

    let hits = Arc::new(AtomicUsize::new(0));
    Mock::given(method("GET"))
        .and(path(format!("/{}/model.gguf", model_dir)))
        .respond_with(CountingBlob {
            hits: hits.clone(),
            delay,
        })
        .mount(server)
        .await;
    hits
}

#[tokio::test]
async fn concurrent_repairs_deduplicate_to_one_download() {
    let server = MockServer::start().await;
    let hits = registry_with_model(&server, "blobs", Duration::from_millis(200)).await;

    let tmp = tempfile::tempdir().unwrap();
    let sync = Arc::new(ModelSync::new(server.uri(), tmp.path(), config()));
    let downloader = Arc::new(BlobDownloader::new(server.uri(), tmp.path(), config()).unwrap());
    let repair = Arc::new(RepairCoordinator::new(sync, downloader));

    let timeout = Duration::from_secs(10);
    let (a, b, c) = tokio::join!(
        repair.repair("concurrent-model", timeout, None),
        repair.repair("concurrent-model", timeout, None),
        repair.repair("concurrent-model", timeout, None),
    );

    assert_eq!(a.status, RepairStatus::Success);
    assert_eq!(b.status, RepairStatus::Success);
    assert_eq!(c.status, RepairStatus::Success);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let model_path = tmp.path().join("concurrent-model_latest/model.gguf");
    assert!(model_path.exists());
    assert!(!needs_repair(&model_path));
}

#[tokio::test]
async fn waiter_timeout_leaves_repair_running() {
    let server = MockServer::start().await;
    let hits = registry_with_model(&server, "blobs", Duration::from_millis(400)).await;

    let tmp = tempfile::tempdir().unwrap();
    let sync = Arc::new(ModelSync::new(server.uri(), tmp.path(), config()));
    let downloader = Arc::new(BlobDownloader::new(server.uri(), tmp.path(), config()).unwrap());
    let repair = Arc::new(RepairCoordinator::new(sync, downloader));

    let owner = {
        let repair = repair.clone();
        tokio::spawn(async move {
            repair
                .repair("concurrent-model", Duration::from_secs(10), None)
                .await
        })
    };

    // Give the owner a moment to register its task.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(repair.is_repairing("concurrent-model"));

    let waiter = repair
        .repair("concurrent-model", Duration::from_millis(50), None)
        .await;
    assert_eq!(waiter.status, RepairStatus::Failed);
    assert_eq!(
        waiter.error.as_deref(),
        Some("Repair timeout while waiting for existing repair")
    );

    // The underlying repair keeps going and completes.
    assert!(repair.is_repairing("concurrent-model"));
    assert!(
        repair
            .wait_for_repair("concurrent-model", Duration::from_secs(5))
            .await
    );
    let owner_result = owner.await.unwrap();
    assert_eq!(owner_result.status, RepairStatus::Success);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn corrupt_model_answers_repairing_and_heals_in_background() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken:1b/manifest.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "files": [{"name": "model.gguf", "url": "/blobs/model.gguf"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/blobs/model.gguf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(valid_gguf_body()))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    // A file with the wrong magic fails the corruption check.
    let model_dir = tmp.path().join("broken_1b");
    std::fs::create_dir_all(&model_dir).unwrap();
    let mut bad = b"JUNK".to_vec();
    bad.resize(4096, 0);
    std::fs::write(model_dir.join("model.gguf"), &bad).unwrap();

    let storage = Arc::new(ModelStorage::new(tmp.path()));
    let manager = Arc::new(LlamaManager::new(
        tmp.path(),
        Arc::new(StubBackend::new().with_script(["healed"])),
    ));
    let pipeline = Arc::new(InferencePipeline::new(storage.clone(), manager));
    let sync = Arc::new(ModelSync::new(server.uri(), tmp.path(), config()));
    let downloader = Arc::new(BlobDownloader::new(server.uri(), tmp.path(), config()).unwrap());
    let repair = Arc::new(RepairCoordinator::new(sync, downloader));

    let coordinator = RequestCoordinator::new(storage, pipeline)
        .with_repair(repair.clone(), Duration::from_secs(10));

    let err = coordinator
        .chat(
            vec![ChatMessage::new("user", "hi")],
            "broken:1b",
            InferenceParams::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Repairing { ref model } if model == "broken:1b"));

    // Once the background repair lands, the same request succeeds.
    let model_path = model_dir.join("model.gguf");
    for _ in 0..250 {
        if !needs_repair(&model_path) && !repair.is_repairing("broken:1b") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!needs_repair(&model_path));
    let out = coordinator
        .chat(
            vec![ChatMessage::new("user", "hi")],
            "broken:1b",
            InferenceParams::default(),
        )
        .await
        .unwrap();
    assert_eq!(out, "healed");
}
