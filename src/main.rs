use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use axum::http::{HeaderValue, Method, header::CONTENT_DISPOSITION};
use media_downloader::{
    ApiError, AppConfig, AppState,
    extract::{YtDlp, log_tool_versions},
    guard::SystemResolver,
    rate_limit::RateLimiter,
    router,
    workspace::{ActiveWorkspaces, sweep_stale_workspaces},
};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "media_downloader=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = AppConfig::from_env();

    tokio::fs::create_dir_all(&config.transfer_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create transfer directory {:?}: {error}",
                config.transfer_dir
            ))
        })?;
    sweep_stale_workspaces(
        &config.transfer_dir,
        config.stale_workspace_age,
        &ActiveWorkspaces::default(),
    )
    .await;
    log_tool_versions(&config.yt_dlp_path, config.ffmpeg_path.as_deref()).await;

    if config.allowed_domains.is_empty() {
        warn!("ALLOWED_DOMAINS is empty: every public host will be accepted.");
    } else {
        info!("Allow-list: {:?}", config.allowed_domains);
    }
    if config.allow_unresolved_allowlisted {
        warn!("ALLOW_UNRESOLVED_ALLOWLISTED=true: unresolvable allow-listed hosts bypass the network guard.");
    }
    if !config.trust_proxy_headers {
        debug!("TRUST_PROXY_HEADERS=false: rate limiting uses the socket address.");
    }

    let mut rate_limiter =
        RateLimiter::per_minute_and_day(config.rate_limit_per_minute, config.rate_limit_per_day);
    if let Some(path) = config.rate_limit_state_path.clone() {
        rate_limiter = rate_limiter.with_state_file(path).await;
    }

    let extractor = YtDlp::new(
        config.yt_dlp_path.clone(),
        config.ffmpeg_path.clone(),
        config.merge_format.clone(),
        config.extraction_timeout,
    );
    let cors = build_cors_layer(&config.allowed_origins)?;
    let addr = config.bind_addr.clone();

    let state = AppState::new(
        config,
        Arc::new(extractor),
        Arc::new(SystemResolver),
        rate_limiter,
    );

    let mut app = router(state).layer(TraceLayer::new_for_http());
    if let Some(cors) = cors {
        app = app.layer(cors);
    }

    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {addr}: {error}"))
    })?;

    info!("Listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for shutdown signal: {error}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// `None` when no origins are configured: the landing page is same-origin.
fn build_cors_layer(origins: &[String]) -> Result<Option<CorsLayer>, ApiError> {
    if origins.is_empty() {
        return Ok(None);
    }

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list has {} origin(s): {:?}",
        normalized_origins.len(),
        normalized_origins
    );

    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        origin
            .to_str()
            .ok()
            .and_then(normalize_origin)
            .is_some_and(|value| allowed_origins.contains(&value))
    });

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any)
            .expose_headers([CONTENT_DISPOSITION]),
    ))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_are_normalized() {
        assert_eq!(
            normalize_origin("HTTPS://Example.com:443").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            normalize_origin("http://localhost:5173").as_deref(),
            Some("http://localhost:5173")
        );
        assert_eq!(normalize_origin("https://example.com/app"), None);
        assert_eq!(normalize_origin("ftp://example.com"), None);
    }

    #[test]
    fn cors_layer_is_optional_and_validated() {
        assert!(build_cors_layer(&[]).unwrap().is_none());
        assert!(build_cors_layer(&["https://example.com".to_string()]).unwrap().is_some());
        assert!(build_cors_layer(&["not an origin".to_string()]).is_err());
    }
}
