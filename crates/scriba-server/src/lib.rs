// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! scriba-server
#![deny(unsafe_code)]

/// Signup, token issuance, and the bearer-auth extractor.
pub mod auth;
/// Live-session endpoints.
pub mod live_routes;
/// Process counters exposed at `/metrics`.
pub mod metrics;
/// Transcript library, downloads, exports, health.
pub mod routes;
/// The SSE progress stream.
pub mod stream;
/// Multipart submission.
pub mod submit;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router, middleware};
use scriba_catalog::{Catalog, CatalogError};
use scriba_config::ScribaConfig;
use scriba_engine::EngineCache;
use scriba_error::{ErrorBody, ErrorKind, ServiceError};
use scriba_live::{LiveError, LiveSessionManager};
use scriba_queue::{JobQueue, QueueError};
use scriba_store::{ArtifactStore, StoreError};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub use metrics::ApiMetrics;

/// Shared application state: every process-wide singleton lives here, each
/// behind its own synchronization, none shared across worker processes.
pub struct AppState {
    /// Runtime configuration.
    pub config: Arc<ScribaConfig>,
    /// Job catalog.
    pub catalog: Catalog,
    /// Artifact store.
    pub store: Arc<dyn ArtifactStore>,
    /// Queue backend selected at startup.
    pub queue: Arc<dyn JobQueue>,
    /// Engine adapter cache.
    pub engines: Arc<EngineCache>,
    /// Live-session table.
    pub live: Arc<LiveSessionManager>,
    /// Process counters.
    pub metrics: Arc<ApiMetrics>,
    /// JWT signing/verification keys.
    pub auth: auth::AuthKeys,
}

/// HTTP-facing error: a [`ServiceError`] rendered as a JSON body.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl ApiError {
    /// Shorthand used by handlers.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self(ServiceError::new(kind, message))
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        let kind = match &err {
            CatalogError::JobNotFound => ErrorKind::NotFound,
            CatalogError::DuplicateEmail => ErrorKind::Conflict,
            _ => ErrorKind::Internal,
        };
        Self(ServiceError::new(kind, err.to_string()).with_source(err))
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let kind = match &err {
            StoreError::InvalidKey { .. } => ErrorKind::Validation,
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        };
        Self(ServiceError::new(kind, err.to_string()).with_source(err))
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let kind = match &err {
            QueueError::BrokerUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            // A broker that was reachable at startup but dropped off the
            // network reads the same as one that never was.
            QueueError::Broker(redis)
                if redis.is_io_error()
                    || redis.is_connection_refusal()
                    || redis.is_connection_dropped()
                    || redis.is_timeout() =>
            {
                ErrorKind::UpstreamUnavailable
            }
            _ => ErrorKind::Internal,
        };
        Self(ServiceError::new(kind, err.to_string()).with_source(err))
    }
}

impl From<LiveError> for ApiError {
    fn from(err: LiveError) -> Self {
        let kind = match &err {
            LiveError::UnknownSession => ErrorKind::NotFound,
            LiveError::EmptyChunk | LiveError::CorruptAudio(_) | LiveError::NoAudio => {
                ErrorKind::Validation
            }
            LiveError::Store(StoreError::InvalidKey { .. }) => ErrorKind::Validation,
            _ => ErrorKind::Internal,
        };
        Self(ServiceError::new(kind, err.to_string()).with_source(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
            // A generic body: internals stay in the logs.
            let body = ErrorBody {
                error: self.0.kind,
                detail: "internal error".into(),
                context: Default::default(),
            };
            return (status, Json(body)).into_response();
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

/// Build the full router.
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.allowed_frontend_origin);
    let upload_limit = (state.config.max_upload_mb as usize + 1) * 1024 * 1024;

    Router::new()
        .route("/auth/signup", post(auth::signup))
        .route("/auth/token", post(auth::token))
        .route("/transcribe", post(submit::create_transcription_job))
        .route("/transcribe/{job_id}", get(stream::stream_transcription))
        .route("/jobs/{job_id}", get(routes::job_snapshot))
        .route("/transcripts", get(routes::list_transcripts))
        .route("/transcripts/{id}", get(routes::transcript_detail))
        .route("/transcripts/{id}/download", get(routes::download_transcript))
        .route("/transcripts/{id}/export", post(routes::export_transcript))
        .route("/healthz", get(routes::healthz))
        .route("/metrics", get(routes::metrics_snapshot))
        .route(
            "/transcriptions/live/sessions",
            post(live_routes::create_session),
        )
        .route(
            "/transcriptions/live/sessions/{id}/chunk",
            post(live_routes::push_chunk),
        )
        .route(
            "/transcriptions/live/sessions/{id}/finalize",
            post(live_routes::finalize_session),
        )
        .route(
            "/transcriptions/live/sessions/{id}",
            delete(live_routes::discard_session),
        )
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            metrics::count_server_errors,
        ))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    if origin.trim() == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origin
            .split(',')
            .filter_map(|o| o.trim().parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
