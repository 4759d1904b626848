//! Artifact download tests against a local HTTP server.

use sha2::{Digest, Sha256};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use updraft::config::DownloadConfig;
use updraft::progress::{ProgressCallback, ProgressEvent};
use updraft::update::fetcher::{ArtifactFetcher, DownloadRequest};
use updraft::UpdraftError;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn serve(artifact_path: &str, template: ResponseTemplate) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(artifact_path))
        .respond_with(template)
        .mount(&server)
        .await;
    server
}

fn fetcher() -> ArtifactFetcher {
    let config = DownloadConfig {
        connect_timeout_secs: 5,
        min_timeout_secs: 10,
        max_timeout_secs: 30,
        disk_headroom_bytes: 0,
        ..DownloadConfig::default()
    };
    ArtifactFetcher::new(&config, "updraft-tests")
}

struct Fetch {
    url: String,
    dest: PathBuf,
    expected_size: Option<u64>,
    sha256: Option<String>,
}

async fn run(fetch: Fetch, progress: Option<ProgressCallback>) -> Result<PathBuf, UpdraftError> {
    tokio::task::spawn_blocking(move || {
        let request = DownloadRequest {
            url: &fetch.url,
            dest: &fetch.dest,
            expected_size: fetch.expected_size,
            sha256: fetch.sha256.as_deref(),
        };
        fetcher().fetch(&request, progress.as_ref(), None)
    })
    .await
    .expect("download task in test")
}

#[tokio::test]
async fn downloads_artifact_and_reports_progress() {
    let body = payload(1_300_000);
    let server = serve(
        "/dl/updraft_0.2.7_linux-x86_64.zip",
        ResponseTemplate::new(200).set_body_bytes(body.clone()),
    )
    .await;
    let dir = tempfile::tempdir().expect("tempdir in test");
    let dest = dir.path().join("artifacts/updraft.zip");

    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::default();
    let sink = Arc::clone(&events);
    let progress: ProgressCallback = Box::new(move |event| {
        if let Ok(mut guard) = sink.lock() {
            guard.push(event);
        }
    });

    let digest = format!("{:x}", Sha256::digest(&body));
    let fetched = run(
        Fetch {
            url: format!("{}/dl/updraft_0.2.7_linux-x86_64.zip", server.uri()),
            dest: dest.clone(),
            expected_size: Some(body.len() as u64),
            sha256: Some(digest),
        },
        Some(progress),
    )
    .await
    .expect("download in test");

    assert_eq!(fetched, dest);
    assert_eq!(std::fs::read(&dest).expect("read in test"), body);

    let events = events.lock().expect("lock in test");
    assert!(matches!(
        events.first(),
        Some(ProgressEvent::DownloadStarted {
            total_bytes: Some(1_300_000),
            ..
        })
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::DownloadProgress { .. })));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::DownloadComplete { bytes: 1_300_000, .. })
    ));
}

#[tokio::test]
async fn digest_mismatch_leaves_nothing() {
    let server = serve(
        "/dl/Updraft.dmg",
        ResponseTemplate::new(200).set_body_bytes(payload(4096)),
    )
    .await;
    let dir = tempfile::tempdir().expect("tempdir in test");
    let dest = dir.path().join("Updraft.dmg");

    let err = run(
        Fetch {
            url: format!("{}/dl/Updraft.dmg", server.uri()),
            dest: dest.clone(),
            expected_size: None,
            sha256: Some("0".repeat(64)),
        },
        None,
    )
    .await
    .expect_err("digest mismatch in test");

    assert!(matches!(err, UpdraftError::Integrity(_)), "got {err:?}");
    assert!(!dest.exists());
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .expect("read_dir in test")
        .collect();
    assert!(leftovers.is_empty(), "temp file left behind: {leftovers:?}");
}

#[tokio::test]
async fn http_error_is_network_failure() {
    let server = serve("/dl/missing.zip", ResponseTemplate::new(404)).await;
    let dir = tempfile::tempdir().expect("tempdir in test");
    let dest = dir.path().join("missing.zip");

    let err = run(
        Fetch {
            url: format!("{}/dl/missing.zip", server.uri()),
            dest: dest.clone(),
            expected_size: None,
            sha256: None,
        },
        None,
    )
    .await
    .expect_err("404 in test");

    assert!(matches!(err, UpdraftError::Network(_)));
    assert!(err.is_retryable());
    assert!(!dest.exists());
}

/// Answers one request with a `Content-Length` larger than the body it sends.
fn serve_short_body(advertised: usize, body: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind in test");
    let addr = listener.local_addr().expect("local addr in test");
    std::thread::spawn(move || {
        let Ok((stream, _)) = listener.accept() else {
            return;
        };
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        while reader.read_line(&mut line).map(|n| n > 0).unwrap_or(false) {
            if line == "\r\n" {
                break;
            }
            line.clear();
        }
        let mut stream = reader.into_inner();
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {advertised}\r\nConnection: close\r\n\r\n"
        );
        let _ = stream.write_all(head.as_bytes());
        let _ = stream.write_all(body);
        let _ = stream.flush();
    });
    format!("http://{addr}/dl/updraft_0.2.7_linux-x86_64.zip")
}

#[tokio::test]
async fn body_shorter_than_content_length_is_integrity_failure() {
    let url = serve_short_body(100, b"0123456789");
    let dir = tempfile::tempdir().expect("tempdir in test");
    let dest = dir.path().join("updraft.zip");

    let err = run(
        Fetch {
            url,
            dest: dest.clone(),
            expected_size: None,
            sha256: None,
        },
        None,
    )
    .await
    .expect_err("short body in test");

    assert!(
        matches!(&err, UpdraftError::Integrity(m) if m == "received 10 bytes, expected 100"),
        "got {err:?}"
    );
    assert!(!dest.exists());
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .expect("read_dir in test")
        .collect();
    assert!(leftovers.is_empty(), "temp file left behind: {leftovers:?}");
}

#[cfg(unix)]
#[tokio::test]
async fn oversized_artifact_fails_free_space_check() {
    let server = serve("/dl/huge.zip", ResponseTemplate::new(200)).await;
    let dir = tempfile::tempdir().expect("tempdir in test");
    let dest = dir.path().join("huge.zip");

    let err = run(
        Fetch {
            url: format!("{}/dl/huge.zip", server.uri()),
            dest: dest.clone(),
            expected_size: Some(u64::MAX / 2),
            sha256: None,
        },
        None,
    )
    .await
    .expect_err("free space check in test");

    assert!(
        matches!(&err, UpdraftError::Io(e) if e.kind() == std::io::ErrorKind::StorageFull),
        "got {err:?}"
    );
    assert!(!dest.exists());
    let requests = server.received_requests().await.unwrap_or_default();
    assert!(requests.is_empty());
}
