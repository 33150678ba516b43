//! HTTP client for the router's node-management API.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::gpu::GpuDevice;

/// Registration payload (`POST /api/nodes`).
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub machine_name: String,
    pub ip_address: String,
    pub runtime_version: String,
    pub runtime_port: u16,
    pub gpu_available: bool,
    pub gpu_devices: Vec<GpuDevice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_model: Option<String>,
}

/// Credentials handed back by a successful registration.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub agent_token: String,
}

/// Heartbeat payload (`POST /api/health`). `memory_usage` is a percent.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    pub node_id: String,
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub active_requests: u32,
    pub loaded_models: Vec<String>,
    pub initializing: bool,
    pub gpu_usage: Option<f32>,
}

/// Client for registration, heartbeats and task progress.
pub struct RouterClient {
    base_url: String,
    client: reqwest::Client,
}

impl RouterClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Register this node. One attempt; the caller owns the retry policy.
    pub async fn register(&self, info: &NodeInfo) -> anyhow::Result<NodeIdentity> {
        let resp = self
            .client
            .post(self.url("/api/nodes"))
            .json(info)
            .send()
            .await?;

        if !resp.status().is_success() {
            anyhow::bail!("registration returned HTTP {}", resp.status());
        }

        let identity: NodeIdentity = resp.json().await?;
        if identity.node_id.is_empty() {
            anyhow::bail!("registration response missing node_id");
        }
        if identity.agent_token.is_empty() {
            anyhow::bail!("registration response missing agent_token");
        }
        Ok(identity)
    }

    /// Send one heartbeat, retrying with a short escalating sleep.
    pub async fn heartbeat(
        &self,
        token: &str,
        payload: &HeartbeatPayload,
        max_retries: u32,
    ) -> bool {
        for attempt in 0..=max_retries {
            match self
                .client
                .post(self.url("/api/health"))
                .header("X-Agent-Token", token)
                .json(payload)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return true,
                Ok(resp) => debug!("Heartbeat returned HTTP {}", resp.status()),
                Err(err) => debug!("Heartbeat failed: {}", err),
            }
            if attempt < max_retries {
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt + 1))).await;
            }
        }
        warn!("Heartbeat failed after {} attempts", max_retries + 1);
        false
    }

    /// Report download progress for a router-issued task.
    pub async fn report_progress(&self, task_id: &str, progress: f64, speed: Option<f64>) -> bool {
        let mut payload = serde_json::json!({
            "task_id": task_id,
            "progress": progress.clamp(0.0, 1.0),
        });
        if let Some(speed) = speed {
            payload["speed"] = serde_json::json!(speed);
        }

        match self
            .client
            .post(self.url(&format!("/api/tasks/{}/progress", task_id)))
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                debug!("Progress report failed: {}", err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn node_info() -> NodeInfo {
        NodeInfo {
            machine_name: "worker-1".into(),
            ip_address: "192.168.1.50".into(),
            runtime_version: "1.0.0".into(),
            runtime_port: 8080,
            gpu_available: true,
            gpu_devices: vec![GpuDevice {
                model: "NVIDIA RTX 4090".into(),
                count: 1,
                memory: Some(25_769_803_776),
            }],
            gpu_count: Some(1),
            gpu_model: Some("NVIDIA RTX 4090".into()),
        }
    }

    #[tokio::test]
    async fn register_parses_identity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/nodes"))
            .and(body_partial_json(serde_json::json!({
                "machine_name": "worker-1",
                "gpu_available": true
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "node_id": "node-123",
                "agent_token": "tok-abc"
            })))
            .mount(&server)
            .await;

        let client = RouterClient::new(server.uri());
        let identity = client.register(&node_info()).await.unwrap();
        assert_eq!(identity.node_id, "node-123");
        assert_eq!(identity.agent_token, "tok-abc");
    }

    #[tokio::test]
    async fn register_rejects_missing_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/nodes"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"node_id": "node-123", "agent_token": ""})),
            )
            .mount(&server)
            .await;

        let client = RouterClient::new(server.uri());
        assert!(client.register(&node_info()).await.is_err());
    }

    #[tokio::test]
    async fn heartbeat_carries_agent_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/health"))
            .and(header("X-Agent-Token", "tok-abc"))
            .and(body_partial_json(serde_json::json!({
                "node_id": "node-123",
                "initializing": false
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = RouterClient::new(server.uri());
        let ok = client
            .heartbeat(
                "tok-abc",
                &HeartbeatPayload {
                    node_id: "node-123".into(),
                    cpu_usage: 12.5,
                    memory_usage: 48.0,
                    active_requests: 0,
                    loaded_models: vec![],
                    initializing: false,
                    gpu_usage: None,
                },
                0,
            )
            .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn heartbeat_retries_on_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = RouterClient::new(server.uri());
        let ok = client
            .heartbeat(
                "tok",
                &HeartbeatPayload {
                    node_id: "n".into(),
                    cpu_usage: 0.0,
                    memory_usage: 0.0,
                    active_requests: 0,
                    loaded_models: vec![],
                    initializing: true,
                    gpu_usage: Some(30.0),
                },
                2,
            )
            .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn progress_posts_to_task_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/tasks/task-9/progress"))
            .and(body_partial_json(serde_json::json!({
                "task_id": "task-9",
                "progress": 0.5
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = RouterClient::new(server.uri());
        assert!(client.report_progress("task-9", 0.5, Some(1024.0)).await);
    }
}
