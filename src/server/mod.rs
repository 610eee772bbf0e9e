use crate::config::{ConfigError, RateLimitSettings, ServiceConfig};
use crate::error::SandboxError;
use crate::orchestrator::Orchestrator;
use crate::project::{FileLimits, ProjectFileSet};
use crate::provider::VercelProvider;
use crate::readiness::{HttpProbe, ReadinessVerifier};
use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::info;

pub mod rate_limit;
pub mod response;

use rate_limit::CreationLimiter;
use response::{panic_response, ApiError, CreateSandboxResponse};

/// Header carrying the token issued by a successful create
pub const RELEASE_TOKEN_HEADER: &str = "x-release-token";

pub struct AppState {
    pub orchestrator: Orchestrator,
    pub limits: FileLimits,
    pub redact_errors: bool,
}

/// Settings for the HTTP layer around the pipeline
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub payload_limit: usize,
    pub allowed_origins: Vec<String>,
    pub rate_limit: RateLimitSettings,
}

impl HttpSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            payload_limit: config.payload_limit(),
            allowed_origins: config.origins().map(str::to_string).collect(),
            rate_limit: config.rate_limit(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSandboxRequest {
    pub files: BTreeMap<String, String>,
}

pub async fn start_server(config: ServiceConfig) -> Result<()> {
    let provider = Arc::new(VercelProvider::new(
        config.vercel_api_url.as_str(),
        config.credentials(),
    )?);
    let probe = Arc::new(HttpProbe::new(config.probe_timeout())?);
    let verifier = ReadinessVerifier::new(config.readiness(), probe);
    let orchestrator = Orchestrator::new(provider, config.orchestrator(), verifier);

    let state = Arc::new(AppState {
        orchestrator,
        limits: config.file_limits(),
        redact_errors: config.redact_errors(),
    });
    let app = router(state, &HttpSettings::from_config(&config))?;

    let addr = config.listen_addr();
    info!(%addr, mode = ?config.mode, ports = ?config.ports, "Sandbox service listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}

pub fn router(state: Arc<AppState>, settings: &HttpSettings) -> Result<Router, ConfigError> {
    let limiter = CreationLimiter::new(&settings.rate_limit);
    let redact = state.redact_errors;

    let sandbox_routes = Router::new()
        .route("/api/sandbox/create", post(create_sandbox))
        .route("/api/sandbox/:id", delete(release_sandbox))
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit::enforce));

    let app = Router::new()
        .route("/api/health", get(health))
        .merge(sandbox_routes)
        .layer(CatchPanicLayer::custom(
            move |panic: Box<dyn std::any::Any + Send + 'static>| panic_response(panic, redact),
        ))
        .layer(DefaultBodyLimit::max(settings.payload_limit))
        .layer(cors_layer(&settings.allowed_origins)?)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    Ok(app)
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer, ConfigError> {
    let allow_origin = if origins.is_empty() || origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let values = origins
            .iter()
            .map(|o| {
                o.parse::<HeaderValue>()
                    .map_err(|_| ConfigError::InvalidOrigin(o.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        AllowOrigin::list(values)
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(RELEASE_TOKEN_HEADER),
        ]))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "OK",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn create_sandbox(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateSandboxRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateSandboxResponse>), ApiError> {
    let reject = |err: SandboxError| ApiError::new(err, state.redact_errors);

    let Json(request) =
        payload.map_err(|rejection| reject(SandboxError::InvalidInput(rejection.body_text())))?;
    info!(files = request.files.len(), "Received sandbox creation request");

    let files = ProjectFileSet::validate(request.files, &state.limits).map_err(reject)?;
    let outcome = state.orchestrator.launch(files).await.map_err(reject)?;

    Ok((StatusCode::CREATED, Json(CreateSandboxResponse::from(outcome))))
}

async fn release_sandbox(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(ApiError::new(
            SandboxError::InvalidInput(format!("malformed sandbox id: {}", id)),
            state.redact_errors,
        ));
    }

    let token = headers
        .get(RELEASE_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    state
        .orchestrator
        .release(&id, token)
        .await
        .map_err(|e| ApiError::new(e, state.redact_errors))?;
    Ok(StatusCode::NO_CONTENT)
}
