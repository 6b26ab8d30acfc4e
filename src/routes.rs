use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{Html, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::{
    config::{AppConfig, non_empty},
    error::ApiError,
    extract::{MediaExtractor, MediaInfo, validate_format_id},
    guard::{DomainPolicy, NetworkGuard, Resolver, Target},
    rate_limit::RateLimiter,
    stream::media_response,
    workspace::{ActiveWorkspaces, Workspace, locate_output, sweep_stale_workspaces},
};

const LANDING_PAGE: &str = include_str!("../static/index.html");

#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    policy: Arc<DomainPolicy>,
    network_guard: NetworkGuard,
    extractor: Arc<dyn MediaExtractor>,
    rate_limiter: Arc<RateLimiter>,
    download_semaphore: Arc<Semaphore>,
    workspaces: ActiveWorkspaces,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        extractor: Arc<dyn MediaExtractor>,
        resolver: Arc<dyn Resolver>,
        rate_limiter: RateLimiter,
    ) -> Self {
        let policy = DomainPolicy::new(
            config.allowed_domains.clone(),
            config.blocked_domains.clone(),
        );
        let network_guard = NetworkGuard::new(resolver, config.allow_unresolved_allowlisted);

        Self {
            download_semaphore: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            config: Arc::new(config),
            policy: Arc::new(policy),
            network_guard,
            extractor,
            rate_limiter: Arc::new(rate_limiter),
            workspaces: ActiveWorkspaces::default(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

#[derive(Debug, Default, Deserialize)]
struct PreviewRequest {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    #[serde(alias = "format_id")]
    format: Option<String>,
}

impl DownloadRequest {
    /// Body fields win over query fields.
    fn merge(self, other: DownloadRequest) -> Self {
        Self {
            url: self.url.or(other.url),
            format: self.format.or(other.format),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(landing_page))
        .route("/health", get(health))
        .route("/preview", post(preview))
        .route("/download", get(download_query).post(download_body))
        .with_state(state)
}

async fn landing_page() -> Html<&'static str> {
    Html(LANDING_PAGE)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn preview(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<PreviewRequest>, JsonRejection>,
) -> Result<Json<MediaInfo>, ApiError> {
    let Json(payload) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let url = required_url(payload.url.as_deref())?;

    let client_ip = client_ip_for_request(&state, &headers, addr);
    let target = admit(&state, &client_ip, url).await?;

    let info = state
        .extractor
        .probe(target.url.as_str())
        .await
        .map_err(|error| {
            warn!("Preview failed for {}: {error}", target.url);
            ApiError::from_extract(error, StatusCode::NOT_FOUND)
        })?;

    info!("Previewed {} for {client_ip}", target.url);
    Ok(Json(info))
}

async fn download_query(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<DownloadRequest>,
) -> Result<Response, ApiError> {
    let client_ip = client_ip_for_request(&state, &headers, addr);
    download(state, client_ip, query).await
}

async fn download_body(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<DownloadRequest>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let from_body = if body.iter().all(u8::is_ascii_whitespace) {
        DownloadRequest::default()
    } else {
        serde_json::from_slice::<DownloadRequest>(&body)
            .map_err(|error| ApiError::bad_request(format!("Invalid JSON body: {error}")))?
    };

    let client_ip = client_ip_for_request(&state, &headers, addr);
    download(state, client_ip, from_body.merge(query)).await
}

async fn download(
    state: AppState,
    client_ip: String,
    request: DownloadRequest,
) -> Result<Response, ApiError> {
    let url = required_url(request.url.as_deref())?;
    let format = match request.format.as_deref().and_then(non_empty) {
        Some(format) => Some(
            validate_format_id(format)
                .ok_or_else(|| ApiError::bad_request("Invalid format identifier."))?
                .to_string(),
        ),
        None => None,
    };

    let target = admit(&state, &client_ip, url).await?;

    let _download_permit = state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("Could not reserve download capacity."))?;
    sweep_stale_workspaces(
        &state.config.transfer_dir,
        state.config.stale_workspace_age,
        &state.workspaces,
    )
    .await;

    let workspace = Workspace::create(&state.config.transfer_dir, &state.workspaces)
        .await
        .map_err(|error| ApiError::internal(format!("Could not prepare a workspace: {error}")))?;

    let fetched = state
        .extractor
        .fetch(target.url.as_str(), format.as_deref(), &workspace)
        .await
        .map_err(|error| {
            warn!("Download failed for {}: {error}", target.url);
            ApiError::from_extract(error, StatusCode::INTERNAL_SERVER_ERROR)
        })?;

    let located = locate_output(
        &workspace,
        fetched.filepath.as_deref(),
        &state.config.merge_format,
    )
    .await
    .map_err(|error| ApiError::internal(format!("Could not inspect the workspace: {error}")))?;

    let path = match located {
        Some(path) => path,
        None if fetched.reported_nothing() => {
            return Err(ApiError::no_media(StatusCode::INTERNAL_SERVER_ERROR));
        }
        None => return Err(ApiError::file_not_found()),
    };

    let title = fetched.title.as_deref().unwrap_or("video");
    info!("Streaming {:?} for {} to {client_ip}", path, target.url);
    media_response(&path, title, workspace, state.config.max_download_bytes).await
}

fn required_url(url: Option<&str>) -> Result<&str, ApiError> {
    url.and_then(non_empty)
        .ok_or_else(|| ApiError::bad_request("No URL provided."))
}

/// Rate limit, then domain lists, then the private-network guard.
async fn admit(state: &AppState, client_ip: &str, url: &str) -> Result<Target, ApiError> {
    state.rate_limiter.check(client_ip, Utc::now()).await?;

    let target = state.policy.classify(url).inspect_err(|error| {
        info!("Rejected {url:?} from {client_ip}: {error}");
    })?;
    state
        .network_guard
        .check(&target, &state.policy)
        .await
        .inspect_err(|error| {
            info!("Rejected {url:?} from {client_ip}: {error}");
        })?;

    Ok(target)
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .and_then(non_empty)
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .and_then(non_empty)
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

fn client_ip_for_request(state: &AppState, headers: &HeaderMap, addr: SocketAddr) -> String {
    if state.config.trust_proxy_headers {
        extract_client_ip(headers).unwrap_or_else(|| addr.ip().to_string())
    } else {
        addr.ip().to_string()
    }
}
