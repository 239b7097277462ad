//! Bundle deployment lifecycle against a mock file server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use async_trait::async_trait;
use scanner_agent::bundle::{BundleDescriptor, BundleId, BundleManager};
use scanner_agent::bundle::manager::read_active;
use scanner_agent::config::BundleConfig;
use scanner_agent::{AgentError, Dispatcher, HttpNmsClient, NmsApi, Result, ServiceManager};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Units stop and start fine but never come back on restart.
struct RestartFails;

#[async_trait]
impl ServiceManager for RestartFails {
    async fn start(&self, unit: &str) -> Result<String> {
        Ok(format!("started {unit}"))
    }

    async fn stop(&self, unit: &str) -> Result<String> {
        Ok(format!("stopped {unit}"))
    }

    async fn restart(&self, unit: &str) -> Result<String> {
        Err(AgentError::Service(format!("{unit} failed to restart")))
    }

    async fn is_active(&self, _unit: &str) -> Result<bool> {
        Ok(false)
    }
}

const UNREACHABLE: &str = "http://127.0.0.1:9/robotBundle1.1.zip";

async fn serve(server: &MockServer, route: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

fn manager(bundles_dir: &Path, services: Arc<dyn ServiceManager>) -> BundleManager {
    let config = BundleConfig {
        fetch_timeout_sec: 2,
        hook_shell: "/bin/sh".into(),
        hook_timeout_sec: 5,
        ..BundleConfig::default()
    };
    BundleManager::new(bundles_dir, config, services).unwrap()
}

fn desc(id: &str, url: &str, checksum: Option<&str>) -> BundleDescriptor {
    BundleDescriptor::parse(id, url, checksum).unwrap()
}

/// Deploy robotBundle1.0 so later tests start from a known active bundle.
async fn seed(server: &MockServer, mgr: &BundleManager) {
    serve(server, "/b/robotBundle1.0.zip", common::zip_bytes(&[("app/version.txt", b"1.0")])).await;
    let url = format!("{}/b/robotBundle1.0.zip", server.uri());
    mgr.apply(&desc("robotBundle1.0", &url, None)).await.unwrap();
    assert_eq!(mgr.active().unwrap().as_str(), "robotBundle1.0");
}

// ────────────────────────────────────────────────────────────────────────────
// Failure keeps the active bundle
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unreachable_source_keeps_active_bundle() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let services = Arc::new(common::RecordingServices::default());
    let mgr = manager(dir.path(), services.clone());
    seed(&server, &mgr).await;
    services.calls.lock().unwrap().clear();

    let err = mgr.apply(&desc("robotBundle1.1", UNREACHABLE, None)).await.unwrap_err();
    assert!(!err.activated());
    assert_eq!(err.step().to_string(), "fetch");
    assert_eq!(read_active(dir.path()).unwrap().as_str(), "robotBundle1.0");
    assert!(!dir.path().join("robotBundle1.1").exists());

    // Services stopped for the attempt are started again.
    let calls = services.calls();
    assert!(calls.contains(&"stop scanner-uploader.service".to_owned()));
    assert!(calls.contains(&"start scanner-uploader.service".to_owned()));
}

#[tokio::test]
async fn test_checksum_mismatch_fails_at_verify() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), Arc::new(common::RecordingServices::default()));
    seed(&server, &mgr).await;

    serve(&server, "/b/robotBundle1.1.zip", common::zip_bytes(&[("a.txt", b"x")])).await;
    let url = format!("{}/b/robotBundle1.1.zip", server.uri());
    let wrong = "0".repeat(64);
    let err = mgr.apply(&desc("robotBundle1.1", &url, Some(&wrong))).await.unwrap_err();
    assert_eq!(err.step().to_string(), "verify");
    assert_eq!(mgr.active().unwrap().as_str(), "robotBundle1.0");
}

#[tokio::test]
async fn test_unsafe_archive_is_rejected() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), Arc::new(common::RecordingServices::default()));
    seed(&server, &mgr).await;

    serve(&server, "/b/evil.zip", common::zip_bytes(&[("../escape.txt", b"x")])).await;
    let url = format!("{}/b/evil.zip", server.uri());
    let err = mgr.apply(&desc("robotBundle1.1", &url, None)).await.unwrap_err();
    assert_eq!(err.step().to_string(), "extract");
    assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    assert_eq!(mgr.active().unwrap().as_str(), "robotBundle1.0");
}

#[tokio::test]
async fn test_reapplying_active_bundle_is_rejected() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), Arc::new(common::RecordingServices::default()));
    seed(&server, &mgr).await;

    let url = format!("{}/b/robotBundle1.0.zip", server.uri());
    let err = mgr.apply(&desc("robotBundle1.0", &url, None)).await.unwrap_err();
    assert_eq!(err.step().to_string(), "extract");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("robotBundle1.0/app/version.txt")).unwrap(),
        "1.0"
    );
}

// ────────────────────────────────────────────────────────────────────────────
// Successful swap
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_successful_apply_swaps_once_and_keeps_old_files() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let services = Arc::new(common::RecordingServices::default());
    let mgr = manager(dir.path(), services.clone());
    seed(&server, &mgr).await;
    services.calls.lock().unwrap().clear();

    let payload = common::zip_bytes(&[
        ("app/version.txt", b"1.1"),
        ("bundle.toml", b"[services]\nrequired = [\"scanner-poller.service\"]\n"),
        ("install.sh", b"echo \"$BUNDLE_ID\" > hook_ran.txt\n"),
    ]);
    let checksum = format!("sha256:{:X}", Sha256::digest(&payload));
    serve(&server, "/b/robotBundle1.1.zip", payload).await;
    let url = format!("{}/b/robotBundle1.1.zip", server.uri());

    let report = mgr.apply(&desc("robotBundle1.1", &url, Some(&checksum))).await.unwrap();
    assert_eq!(report.previous, Some(BundleId::parse("robotBundle1.0").unwrap()));
    assert!(report.hook_ran);
    assert_eq!(report.restarted, ["scanner-poller.service"]);
    assert_eq!(
        report.detail(),
        "bundle applied: robotBundle1.1 (previous=robotBundle1.0, hook=ok, restarted=[scanner-poller.service])"
    );

    assert_eq!(read_active(dir.path()).unwrap().as_str(), "robotBundle1.1");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("active/app/version.txt")).unwrap(),
        "1.1"
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("active_bundle.txt")).unwrap().trim(),
        "robotBundle1.1"
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("robotBundle1.1/hook_ran.txt")).unwrap().trim(),
        "robotBundle1.1"
    );
    // The previous payload stays on disk for rollback.
    assert_eq!(
        std::fs::read_to_string(dir.path().join("robotBundle1.0/app/version.txt")).unwrap(),
        "1.0"
    );
    assert!(services.calls().contains(&"restart scanner-poller.service".to_owned()));
}

#[tokio::test]
async fn test_failed_hook_reports_partial_activation() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), Arc::new(common::RecordingServices::default()));
    seed(&server, &mgr).await;

    serve(&server, "/b/bad-hook.zip", common::zip_bytes(&[("install.sh", b"echo nope >&2; exit 3\n")])).await;
    let url = format!("{}/b/bad-hook.zip", server.uri());
    let err = mgr.apply(&desc("robotBundle1.1", &url, None)).await.unwrap_err();
    assert!(err.activated());
    assert_eq!(err.step().to_string(), "hook");
    assert!(err.to_string().contains("services not restarted"));
    assert_eq!(mgr.active().unwrap().as_str(), "robotBundle1.1");
}

#[tokio::test]
async fn test_failed_restart_reports_partial_activation() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), Arc::new(RestartFails));
    serve(&server, "/b/robotBundle1.1.zip", common::zip_bytes(&[("app/version.txt", b"1.1")])).await;
    let url = format!("{}/b/robotBundle1.1.zip", server.uri());

    let err = mgr.apply(&desc("robotBundle1.1", &url, None)).await.unwrap_err();
    assert!(err.activated());
    assert_eq!(err.step().to_string(), "restart");
    assert!(err.to_string().contains("scanner-uploader.service"));
    assert_eq!(read_active(dir.path()).unwrap().as_str(), "robotBundle1.1");
}

// ────────────────────────────────────────────────────────────────────────────
// Through the dispatcher
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_bundle_apply_command_acks_and_reports() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cmd/poll/scanner01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "commands": [{
                "cmd_id": "b-1",
                "action": "bundle.apply",
                "category": "bundle",
                "args": {"bundle_id": "robotBundle1.1", "url": UNREACHABLE}
            }]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (ctx, _services) = common::context(common::config(dir.path(), &server.uri()));
    let nms: Arc<dyn NmsApi> = Arc::new(HttpNmsClient::new(&server.uri(), Duration::from_secs(2)).unwrap());
    let mut dispatcher = Dispatcher::new(ctx, nms, "scanner01");
    dispatcher.tick().await;

    let requests = server.received_requests().await.unwrap();
    let body_of = |route: &str| -> Value {
        let req = requests.iter().find(|r| r.url.path() == route).unwrap();
        serde_json::from_slice(&req.body).unwrap()
    };
    let report = body_of("/bootstrap/report/scanner01");
    assert_eq!(report["status"], "error");
    assert_eq!(report["installed_version"], "");

    let ack = body_of("/cmd/ack/scanner01");
    assert_eq!(ack["cmd_id"], "b-1");
    assert_eq!(ack["status"], "error");
    assert!(ack["detail"].as_str().unwrap().contains("active bundle unchanged"));
}

/// Accepts connections and never answers.
async fn silent_listener() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{addr}/robotBundle1.1.zip")
}

#[tokio::test]
async fn test_bundle_deadline_still_restores_services_and_reports() {
    let server = MockServer::start().await;
    let url = silent_listener().await;
    Mock::given(method("GET"))
        .and(path("/cmd/poll/scanner01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "commands": [{
                "cmd_id": "b-2",
                "action": "bundle.apply",
                "args": {"bundle_id": "robotBundle1.1", "url": url}
            }]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config(dir.path(), &server.uri());
    config.dispatch.bundle_timeout_sec = 1;
    config.bundle.fetch_timeout_sec = 2;
    let (ctx, services) = common::context(config);
    let nms: Arc<dyn NmsApi> = Arc::new(HttpNmsClient::new(&server.uri(), Duration::from_secs(2)).unwrap());
    let mut dispatcher = Dispatcher::new(ctx, nms, "scanner01");
    dispatcher.tick().await;

    let requests = server.received_requests().await.unwrap();
    let ack = requests.iter().find(|r| r.url.path() == "/cmd/ack/scanner01").unwrap();
    let ack: Value = serde_json::from_slice(&ack.body).unwrap();
    assert_eq!(ack["status"], "error");
    assert!(ack["detail"].as_str().unwrap().contains("timeout"));

    // The deployment finishes on its own: the fetch times out, stopped units
    // come back and the report goes out.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let reported = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .any(|r| r.url.path() == "/bootstrap/report/scanner01");
        if reported && services.calls().contains(&"start scanner-uploader.service".to_owned()) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "services not restored: {:?}", services.calls());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(services.calls().contains(&"start scanner-poller.service".to_owned()));
    assert!(read_active(&dir.path().join("bundles")).is_none());
}
