//! Common test utilities shared across integration and E2E tests

use coderun_common::{AppConfig, RunRequest};
use coderun_sandbox::testing::ScriptedEngine;
use coderun_sandbox::{SandboxEngine, SessionService};
use coderun_server::{create_router, AppState};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("coderun_sandbox=debug,coderun_server=debug")
        .with_test_writer()
        .try_init();
}

/// A server bound to an ephemeral local port, backed by a scripted engine
pub struct TestApp {
    pub base_url: String,
    pub service: SessionService,
    pub engine: Arc<ScriptedEngine>,
    client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn(engine: ScriptedEngine) -> Self {
        Self::spawn_with(engine, |_| {}).await
    }

    pub async fn spawn_with(engine: ScriptedEngine, tweak: impl FnOnce(&mut AppConfig)) -> Self {
        setup_test_logging();

        let mut config = AppConfig::default();
        tweak(&mut config);

        let engine = Arc::new(engine);
        let service = SessionService::new(Arc::clone(&engine) as Arc<dyn SandboxEngine>, &config);
        let router = create_router(
            AppState::new(service.clone()),
            &config.server.allowed_origins,
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("No local address");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!("Test server stopped: {}", e);
            }
        });

        Self {
            base_url: format!("http://{}", addr),
            service,
            engine,
            client: reqwest::Client::builder()
                .no_proxy()
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// POST /run and return the status code with the JSON body
    pub async fn run(&self, request: &RunRequest) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}/run", self.base_url))
            .json(request)
            .send()
            .await
            .expect("POST /run failed");
        let status = response.status().as_u16();
        let body = response.json().await.expect("Response was not JSON");
        (status, body)
    }

    pub async fn health(&self) -> Value {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .expect("GET /health failed")
            .json()
            .await
            .expect("Response was not JSON")
    }

    /// Wait until no session is registered
    pub async fn wait_until_idle(&self) {
        for _ in 0..200 {
            if self.service.registry().is_empty().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sessions still registered");
    }
}

/// Container id from a /run body
pub fn container_id(body: &Value) -> Option<&str> {
    body.get("containerId").and_then(Value::as_str)
}
