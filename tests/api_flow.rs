//! End-to-end API tests against a simulated host
//!
//! Each test starts a real listener on a free localhost port and drives it
//! with reqwest, the way a dashboard would.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use serde_json::{json, Value};

use netshaper::config::Settings;
use netshaper::metrics::{spawn_sampler, SamplerHandle};
use netshaper::rules::RuleStore;
use netshaper::runtime::SimulatedHost;
use netshaper::server::{create_router, AppState};
use netshaper::store::Store;

/// Find an available port for testing
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to address")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

struct TestServer {
    base: String,
    host: Arc<SimulatedHost>,
    client: reqwest::Client,
    _sampler: SamplerHandle,
}

impl TestServer {
    async fn start() -> Self {
        let settings = Settings {
            command_timeout_secs: 2,
            sample_interval_ms: 50,
            sample_timeout_ms: 40,
            ..Default::default()
        };
        let host = Arc::new(SimulatedHost::new(&settings));
        let store = Arc::new(Store::in_memory(settings.naming.clone()));
        let interval = settings.sample_interval();
        let state = AppState::new(settings, store, Arc::new(RuleStore::in_memory()), host.clone());
        let sampler = spawn_sampler(state.sampler(), interval);
        let app = create_router(state.with_metrics(sampler.snapshots.clone()));

        let port = find_available_port();
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
            .await
            .expect("Failed to bind test server");
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            base: format!("http://127.0.0.1:{}", port),
            host,
            client: reqwest::Client::new(),
            _sampler: sampler,
        }
    }

    async fn send(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = self.client.request(method, format!("{}{}", self.base, path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.expect("request failed");
        let status = response.status();
        let value = response.json::<Value>().await.unwrap_or(Value::Null);
        (status, value)
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        self.send(reqwest::Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.send(reqwest::Method::POST, path, body).await
    }

    async fn delete(&self, path: &str) -> (StatusCode, Value) {
        self.send(reqwest::Method::DELETE, path, None).await
    }
}

#[tokio::test]
async fn test_cluster_sync_shape_and_slot_reuse() {
    let server = TestServer::start().await;

    // Cluster "edge" with device "cam1", synced
    let (status, cluster) = server.post("/api/clusters", Some(json!({"name": "edge"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    let cluster_id = cluster["id"].as_u64().unwrap();

    let (status, cam1) = server
        .post(
            &format!("/api/clusters/{}/devices", cluster_id),
            Some(json!({"name": "cam1", "device_type": "camera"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(cam1["slot"], 1);
    assert_eq!(cam1["container_name"], "qc_edge_cam1");

    let (_, result) = server
        .post(&format!("/api/sync/execute?cluster_id={}", cluster_id), None)
        .await;
    assert_eq!(result["created"], json!(["cam1"]));
    assert_eq!(result["error_count"], 0);

    let (_, device) = server.get(&format!("/api/devices/{}", cam1["id"])).await;
    assert_eq!(device["status"], "running");
    let iface = device["interface_name"].as_str().unwrap().to_string();

    // 20/50 down, 5/10 up: one op per direction
    let (status, report) = server
        .post(
            "/api/rules/apply",
            Some(json!({
                "client": "cam1",
                "downstream_rate": "20mbit",
                "downstream_ceil": "50mbit",
                "upstream_rate": "5mbit",
                "upstream_ceil": "10mbit"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let ops = report["ops"].as_array().unwrap();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0]["direction"], "downstream");
    assert_eq!(ops[1]["direction"], "upstream");
    assert_eq!(
        server.host.class_rates(&iface, "1:30"),
        Some(("20mbit".to_string(), "50mbit".to_string()))
    );
    assert_eq!(
        server.host.class_rates("ifb1", "2:30"),
        Some(("5mbit".to_string(), "10mbit".to_string()))
    );

    // A second sync changes nothing
    let (_, preview) = server
        .get(&format!("/api/sync/preview?cluster_id={}", cluster_id))
        .await;
    assert_eq!(preview["total_changes"], 0);
    assert_eq!(preview["to_keep"], json!(["cam1"]));

    // Deleting cam1 frees slot 1 for the next device
    let (status, deleted) = server.delete(&format!("/api/devices/{}", cam1["id"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["removed"], json!(["cam1"]));
    assert!(!server.host.has_container("qc_edge_cam1"));

    let (_, cam2) = server
        .post(
            &format!("/api/clusters/{}/devices", cluster_id),
            Some(json!({"name": "cam2"})),
        )
        .await;
    assert_eq!(cam2["slot"], 1);
}

#[tokio::test]
async fn test_one_failing_device_does_not_stop_the_batch() {
    let server = TestServer::start().await;
    let (_, cluster) = server.post("/api/clusters", Some(json!({"name": "edge"}))).await;
    let cluster_id = cluster["id"].as_u64().unwrap();
    for i in 1..=5 {
        server
            .post(
                &format!("/api/clusters/{}/devices", cluster_id),
                Some(json!({"name": format!("d{}", i)})),
            )
            .await;
    }
    server.host.fail_matching("run -d --name qc_edge_d3");

    let (status, result) = server
        .post(&format!("/api/sync/execute?cluster_id={}", cluster_id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["success_count"], 4);
    assert_eq!(result["error_count"], 1);
    assert_eq!(result["errors"][0]["name"], "d3");

    let (_, devices) = server.get(&format!("/api/clusters/{}/devices", cluster_id)).await;
    let d3 = devices
        .as_array()
        .unwrap()
        .iter()
        .find(|d| d["name"] == "d3")
        .unwrap();
    assert_eq!(d3["status"], "error");
    assert!(d3["error_message"].as_str().is_some());
}

#[tokio::test]
async fn test_error_bodies() {
    let server = TestServer::start().await;

    let (status, body) = server.get("/api/clusters/99").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    let (status, _) = server.post("/api/sync/execute?cluster_id=99", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = server.post("/api/clusters", Some(json!({"name": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some());
}

#[tokio::test]
async fn test_metrics_stream_reports_shaped_interfaces() {
    let server = TestServer::start().await;
    let (_, cluster) = server.post("/api/clusters", Some(json!({"name": "edge"}))).await;
    let cluster_id = cluster["id"].as_u64().unwrap();
    server
        .post(
            &format!("/api/clusters/{}/devices", cluster_id),
            Some(json!({"name": "cam1"})),
        )
        .await;
    server
        .post(&format!("/api/sync/execute?cluster_id={}", cluster_id), None)
        .await;

    let response = server
        .client
        .get(format!("{}/api/metrics/stream", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = stream.next().await {
            buffer.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            if buffer.contains("event: metrics") && buffer.contains("qc_edge_cam1") {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(found, "no metrics event with the device in: {}", buffer);

    let (_, current) = server.get("/api/metrics/current").await;
    let interfaces = current["interfaces"].as_object().unwrap();
    assert_eq!(interfaces.len(), 1);
    let stats = interfaces.values().next().unwrap();
    assert_eq!(stats["client"], "cam1");
    assert_eq!(current["rules"][0]["active"], false);
}
