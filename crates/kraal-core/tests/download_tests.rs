//! Downloader behavior against a mock registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use kraal_core::config::DownloadConfig;
use kraal_core::{BlobDownloader, DownloadOptions};

const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

fn config(max_retries: u32) -> DownloadConfig {
    DownloadConfig {
        max_retries,
        backoff_ms: 10,
        ..DownloadConfig::default()
    }
}

fn downloader(server: &MockServer, dir: &std::path::Path, max_retries: u32) -> BlobDownloader {
    BlobDownloader::new(server.uri(), dir, config(max_retries)).unwrap()
}

#[tokio::test]
async fn downloads_and_verifies_a_blob() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/blobs/model.gguf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let dl = downloader(&server, tmp.path(), 0);

    let observed = Arc::new(AtomicU64::new(0));
    let observed_in_cb = observed.clone();
    let opts = DownloadOptions {
        expected_sha256: Some(ABC_SHA256.to_string()),
        progress: Some(Arc::new(move |done, _total| {
            observed_in_cb.store(done, Ordering::SeqCst);
        })),
        ..Default::default()
    };

    let out = dl
        .download_blob("/blobs/model.gguf", "m_latest/model.gguf", &opts)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&out).unwrap(), b"abc");
    assert_eq!(observed.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn resumes_from_existing_partial_file() {
    let server = MockServer::start().await;
    // Only the tail is served; the Range header must ask for it.
    Mock::given(method("GET"))
        .and(path("/m/model.gguf"))
        .and(header("Range", "bytes=1-"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"bc".to_vec()))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("m_latest")).unwrap();
    std::fs::write(tmp.path().join("m_latest/model.gguf"), b"a").unwrap();

    let dl = downloader(&server, tmp.path(), 0);
    let opts = DownloadOptions {
        expected_sha256: Some(ABC_SHA256.to_string()),
        ..Default::default()
    };
    let out = dl
        .download_blob("/m/model.gguf", "m_latest/model.gguf", &opts)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&out).unwrap(), b"abc");
}

#[tokio::test]
async fn retries_after_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/m/blob"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/m/blob"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let dl = downloader(&server, tmp.path(), 2);
    let out = dl
        .download_blob("/m/blob", "m_latest/model.gguf", &DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), b"abc");
}

#[tokio::test]
async fn checksum_mismatch_removes_the_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/m/blob"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not abc".to_vec()))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let dl = downloader(&server, tmp.path(), 0);
    let opts = DownloadOptions {
        expected_sha256: Some(ABC_SHA256.to_string()),
        ..Default::default()
    };
    let err = dl
        .download_blob("/m/blob", "m_latest/model.gguf", &opts)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("checksum mismatch"));
    assert!(!tmp.path().join("m_latest/model.gguf").exists());
    // One normal pass plus one full retry after the mismatch.
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn conditional_304_keeps_the_cached_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/m/blob"))
        .and(header("If-None-Match", "\"etag-1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("m_latest")).unwrap();
    std::fs::write(tmp.path().join("m_latest/model.gguf"), b"cached").unwrap();

    let dl = downloader(&server, tmp.path(), 0);
    let opts = DownloadOptions {
        if_none_match: Some("\"etag-1\"".to_string()),
        ..Default::default()
    };
    let out = dl
        .download_blob("/m/blob", "m_latest/model.gguf", &opts)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&out).unwrap(), b"cached");
}

#[tokio::test]
async fn conditional_2xx_overwrites_the_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/m/blob"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("m_latest")).unwrap();
    std::fs::write(tmp.path().join("m_latest/model.gguf"), b"stale").unwrap();

    let dl = downloader(&server, tmp.path(), 0);
    let opts = DownloadOptions {
        if_none_match: Some("\"etag-0\"".to_string()),
        expected_sha256: Some(ABC_SHA256.to_string()),
        ..Default::default()
    };
    let out = dl
        .download_blob("/m/blob", "m_latest/model.gguf", &opts)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), b"abc");
}

#[tokio::test]
async fn failure_deletes_only_files_we_created() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/m/blob"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let dl = downloader(&server, tmp.path(), 0);

    // No pre-existing file: the partial file is cleaned up.
    assert!(dl
        .download_blob("/m/blob", "m_latest/model.gguf", &DownloadOptions::default())
        .await
        .is_err());
    assert!(!tmp.path().join("m_latest/model.gguf").exists());

    // Pre-existing file: left in place.
    std::fs::create_dir_all(tmp.path().join("m_latest")).unwrap();
    std::fs::write(tmp.path().join("m_latest/model.gguf"), b"keep me").unwrap();
    assert!(dl
        .download_blob("/m/blob", "m_latest/model.gguf", &DownloadOptions::default())
        .await
        .is_err());
    assert_eq!(
        std::fs::read(tmp.path().join("m_latest/model.gguf")).unwrap(),
        b"keep me"
    );
}

#[tokio::test]
async fn rate_limit_stretches_the_transfer() {
    let body = vec![7u8; 8192];
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/m/big"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let dl = downloader(&server, tmp.path(), 0);
    let opts = DownloadOptions {
        max_bytes_per_sec: Some(16384),
        chunk_size: Some(1024),
        ..Default::default()
    };

    let started = Instant::now();
    dl.download_blob("/m/big", "m_latest/big.bin", &opts)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // 8192 bytes at 16384 B/s is at least half a second, within margin.
    assert!(elapsed >= Duration::from_millis(350), "took {:?}", elapsed);
}

#[tokio::test]
async fn fetch_manifest_parses_and_persists() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gpt-oss:7b/manifest.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "files": [
                {"name": "model.gguf", "digest": ABC_SHA256, "priority": 1},
                {"name": "extra.bin", "priority": -2, "max_bps": 1024u64}
            ]
        })))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let dl = downloader(&server, tmp.path(), 0);
    let manifest = dl.fetch_manifest("gpt-oss:7b").await.unwrap();

    assert_eq!(manifest.files.len(), 2);
    assert_eq!(manifest.files[0].name, "model.gguf");
    assert_eq!(manifest.files[0].digest.as_deref(), Some(ABC_SHA256));
    assert_eq!(manifest.files[1].priority, -2);
    assert!(tmp.path().join("gpt-oss_7b/manifest.json").exists());
}
