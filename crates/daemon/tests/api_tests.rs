//! Integration tests for the daemon API endpoints

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use cni_lib::{
    cni::CniResult,
    health::CloudCheck,
    models::{CniCommand, IfaceInfo, PortDefaults},
    openstack::{mock::MockCloudClient, CloudClient, PortManager},
    server::{create_router, AppState, CniCommandHandler, CommandHandler, HandlerError, PortCounter},
    state::FileStateStore,
    ErrorResult, HealthChecker, HealthResponse, Metrics,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

struct Harness {
    cloud: Arc<MockCloudClient>,
    router: Router,
    _state_dir: TempDir,
}

fn harness_with(
    cloud: Arc<MockCloudClient>,
    handler: Arc<dyn CommandHandler>,
    timeout: Duration,
    state_dir: TempDir,
) -> Harness {
    let client: Arc<dyn CloudClient> = cloud.clone();

    let state = Arc::new(AppState {
        handler,
        health: HealthChecker::new().with_check(CloudCheck::new(client.clone())),
        metrics: Metrics::new(),
        port_counter: Some(Arc::new(PortCounter::new(client, "node-1"))),
        state_store: FileStateStore::new(state_dir.path()),
        request_timeout: timeout,
    });

    Harness {
        cloud,
        router: create_router(state),
        _state_dir: state_dir,
    }
}

fn harness() -> Harness {
    let cloud = Arc::new(MockCloudClient::with_defaults());
    let state_dir = TempDir::new().unwrap();
    let handler = CniCommandHandler::new(
        PortManager::new(cloud.clone()),
        "node-1",
        PortDefaults::default(),
    )
    .with_state_store(FileStateStore::new(state_dir.path()));
    harness_with(cloud, Arc::new(handler), Duration::from_secs(5), state_dir)
}

fn command(verb: &str) -> CniCommand {
    CniCommand {
        command: verb.to_string(),
        container_id: "0123456789abcdef".to_string(),
        netns: "/proc/4242/ns/net".to_string(),
        ifname: "eth1".to_string(),
        args: "K8S_POD_NAME=web-0;K8S_POD_NAMESPACE=default".to_string(),
        path: "/opt/cni/bin".to_string(),
        stdindata: br#"{"cniVersion":"0.4.0","name":"os","type":"openstack-cni","network":"netA"}"#.to_vec(),
    }
}

async fn send(router: &Router, method: &str, uri: &str, body: Vec<u8>) -> (StatusCode, Vec<u8>) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn post_cni(router: &Router, cmd: &CniCommand) -> (StatusCode, Vec<u8>) {
    send(router, "POST", "/cni", serde_json::to_vec(cmd).unwrap()).await
}

#[tokio::test]
async fn test_add_returns_cni_result() {
    let h = harness();

    let (status, body) = post_cni(&h.router, &command("ADD")).await;

    assert_eq!(status, StatusCode::OK);
    let result: CniResult = serde_json::from_slice(&body).unwrap();
    assert_eq!(result.cni_version, "0.4.0");
    assert_eq!(result.interfaces.len(), 1);
    assert_eq!(result.interfaces[0].name, "eth1");
    assert_eq!(result.interfaces[0].sandbox, "/proc/4242/ns/net");
    assert_eq!(result.ips[0].address.prefix(), 24);
    assert_eq!(result.ips[0].gateway, Some("10.0.0.1".parse().unwrap()));
    assert_eq!(result.dns.nameservers, vec!["10.0.0.2".to_string()]);

    let ports = h.cloud.ports();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].device_id, "srv-1");
    assert!(ports[0].has_tag("openstack-cni=true"));
}

#[tokio::test]
async fn test_del_removes_port_and_returns_no_content() {
    let h = harness();
    let (status, _) = post_cni(&h.router, &command("ADD")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post_cni(&h.router, &command("DEL")).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());
    assert!(h.cloud.ports().is_empty());
}

#[tokio::test]
async fn test_del_without_netns_after_state_record() {
    let h = harness();
    let (status, body) = post_cni(&h.router, &command("ADD")).await;
    assert_eq!(status, StatusCode::OK);
    let result: CniResult = serde_json::from_slice(&body).unwrap();

    let info = IfaceInfo {
        container_id: "0123456789abcdef".to_string(),
        ifname: "eth1".to_string(),
        netns: "/proc/4242/ns/net".to_string(),
        ip_address: result.ips[0].address.to_string(),
        pod_name: "web-0".to_string(),
        namespace: "default".to_string(),
    };
    let (status, _) = send(&h.router, "POST", "/state", serde_json::to_vec(&info).unwrap()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let mut del = command("DEL");
    del.netns.clear();
    let (status, _) = post_cni(&h.router, &del).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(h.cloud.ports().is_empty());
}

#[tokio::test]
async fn test_del_without_port_is_idempotent() {
    let h = harness();

    let (status, _) = post_cni(&h.router, &command("DEL")).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_check_returns_no_content() {
    let h = harness();

    let (status, _) = post_cni(&h.router, &command("CHECK")).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let h = harness();
    let before = Metrics::new().request_count();

    let (status, _) = send(&h.router, "POST", "/cni", b"{not json".to_vec()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut missing_netns = command("ADD");
    missing_netns.netns.clear();
    let (status, body) = post_cni(&h.router, &missing_netns).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("netns"));

    let (status, _) = post_cni(&h.router, &command("FROB")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_cni(&h.router, &command("VERSION")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(h.cloud.calls("create_port") == 0);
    assert!(Metrics::new().request_count() >= before + 4);
}

#[tokio::test]
async fn test_add_failure_returns_error_result() {
    let h = harness();
    h.cloud.fail_on("create_port", "quota exceeded");

    let (status, body) = post_cni(&h.router, &command("ADD")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let err: ErrorResult = serde_json::from_slice(&body).unwrap();
    assert_eq!(err.code, 999);
    assert_eq!(err.msg, "error during ADD");
    assert!(err.details.contains("quota exceeded"));
    assert!(err.details.contains("container_id=0123456789abcdef"));
}

struct SlowHandler;

#[async_trait]
impl CommandHandler for SlowHandler {
    async fn add(&self, _cmd: CniCommand) -> Result<CniResult, HandlerError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Err(HandlerError::IncompletePortResult)
    }

    async fn del(&self, _cmd: CniCommand) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn check(&self, _cmd: CniCommand) -> Result<(), HandlerError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_request_deadline() {
    let h = harness_with(
        Arc::new(MockCloudClient::with_defaults()),
        Arc::new(SlowHandler),
        Duration::from_millis(20),
        TempDir::new().unwrap(),
    );

    let (status, body) = post_cni(&h.router, &command("ADD")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let err: ErrorResult = serde_json::from_slice(&body).unwrap();
    assert!(err.details.contains("timed out"));
}

#[tokio::test]
async fn test_health_ok() {
    let h = harness();

    let (status, body) = send(&h.router, "GET", "/health", Vec::new()).await;

    assert_eq!(status, StatusCode::OK);
    let health: HealthResponse = serde_json::from_slice(&body).unwrap();
    assert!(health.is_healthy);
    assert_eq!(health.checks.len(), 1);
}

#[tokio::test]
async fn test_health_reports_cloud_failure() {
    let h = harness();
    h.cloud.fail_on("get_server_by_name", "keystone unavailable");

    let (status, body) = send(&h.router, "GET", "/health", Vec::new()).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let health: HealthResponse = serde_json::from_slice(&body).unwrap();
    assert!(!health.is_healthy);
    assert!(health.checks[0].error.contains("keystone unavailable"));
}

#[tokio::test]
async fn test_ping() {
    let h = harness();

    let (status, body) = send(&h.router, "GET", "/ping", Vec::new()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"PONG");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let h = harness();
    post_cni(&h.router, &command("ADD")).await;

    let (status, body) = send(&h.router, "GET", "/metrics", Vec::new()).await;

    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("cni_request_count"));
    assert!(text.contains("cni_add_success_count"));
    assert!(text.contains("cni_port_total"));
    assert!(h.cloud.calls("get_ports_by_device_id") >= 1);
}

#[tokio::test]
async fn test_state_lifecycle() {
    let h = harness();
    let info = IfaceInfo {
        container_id: "0123456789abcdef".to_string(),
        ifname: "eth1".to_string(),
        netns: "/proc/4242/ns/net".to_string(),
        ip_address: "10.0.0.11/24".to_string(),
        pod_name: "web-0".to_string(),
        namespace: "default".to_string(),
    };
    let uri = "/state/0123456789abcdef/eth1";

    let (status, _) = send(&h.router, "POST", "/state", serde_json::to_vec(&info).unwrap()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&h.router, "GET", uri, Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    let stored: IfaceInfo = serde_json::from_slice(&body).unwrap();
    assert_eq!(stored, info);

    let (status, _) = send(&h.router, "DELETE", uri, Vec::new()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&h.router, "GET", uri, Vec::new()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_state_rejects_bad_body() {
    let h = harness();

    let (status, _) = send(&h.router, "POST", "/state", b"[]".to_vec()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}
