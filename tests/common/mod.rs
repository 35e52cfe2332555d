// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared fixture: a fully wired application over the stub engine, the
//! in-process queue, and the in-memory store.
#![allow(dead_code)]

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use http_body_util::BodyExt;
use scriba_catalog::Catalog;
use scriba_config::{EngineVariantChoice, ScribaConfig};
use scriba_engine::{EngineCache, StubFactory};
use scriba_live::{LiveConfig, LiveSessionManager};
use scriba_server::auth::AuthKeys;
use scriba_server::{ApiMetrics, AppState, build_app};
use scriba_store::MemoryStore;
use scriba_worker::{TranscribeRunner, WorkerContext};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub queue: Arc<scriba_queue::MemoryQueue>,
    _live_root: tempfile::TempDir,
}

pub async fn test_app(mutate: impl FnOnce(&mut ScribaConfig)) -> TestApp {
    let live_root = tempfile::tempdir().expect("live sessions tempdir");
    let mut config = ScribaConfig::default();
    config.engine_variant = EngineVariantChoice::Stub;
    config.jwt_secret = "integration-test-secret".into();
    config.live_sessions_root = live_root.path().display().to_string();
    mutate(&mut config);

    let config = Arc::new(config);
    let catalog = Catalog::connect("sqlite::memory:").await.expect("catalog");
    let store: Arc<dyn scriba_store::ArtifactStore> = Arc::new(MemoryStore::new());
    let engines = Arc::new(EngineCache::new(Arc::new(StubFactory)));

    let worker_ctx = WorkerContext {
        catalog: catalog.clone(),
        store: store.clone(),
        engines: engines.clone(),
        config: config.clone(),
    };
    let queue = Arc::new(scriba_queue::MemoryQueue::new(Arc::new(
        TranscribeRunner::new(worker_ctx),
    )));

    let live = Arc::new(LiveSessionManager::new(
        LiveConfig::from_config(&config),
        config.clone(),
        catalog.clone(),
        store.clone(),
        engines.clone(),
    ));

    let state = Arc::new(AppState {
        auth: AuthKeys::new(&config.jwt_secret, config.jwt_expiration_minutes),
        config: config.clone(),
        catalog,
        store,
        queue: queue.clone(),
        engines,
        live,
        metrics: Arc::new(ApiMetrics::new()),
    });

    TestApp {
        router: build_app(state.clone()),
        state,
        queue,
        _live_root: live_root,
    }
}

impl TestApp {
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.expect("router")
    }

    pub async fn json(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = self.request(request).await;
        let status = response.status();
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    /// Register an account and return (owner id, bearer token).
    pub async fn signed_up_user(&self) -> (Uuid, String) {
        let email = format!("user-{}@example.com", Uuid::new_v4().simple());
        let (status, body) = self
            .json(
                Request::post("/auth/signup")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({"email": email, "password": "secret123"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        let owner: Uuid = body["user_id"].as_str().unwrap().parse().unwrap();

        let (status, body) = self
            .json(
                Request::post("/auth/token")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({"email": email, "password": "secret123"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let token = body["access_token"].as_str().unwrap().to_string();
        (owner, token)
    }

    pub async fn drain_queue(&self) {
        self.queue.drain(Duration::from_secs(10)).await;
    }
}

pub const BOUNDARY: &str = "scriba-test-boundary";

/// Assemble a multipart body with one file part plus text fields.
pub fn multipart_body(
    filename: &str,
    content_type: &str,
    bytes: &[u8],
    fields: &[(&str, &str)],
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(b"\r\n");
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

/// Silent 16 kHz mono WAV of the given length.
pub fn wav_bytes(seconds: f64) -> Vec<u8> {
    let file = scriba_engine::stub::write_silence_wav(seconds).expect("silence wav");
    std::fs::read(file.path()).expect("read wav")
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}
