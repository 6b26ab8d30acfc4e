use std::{path::PathBuf, time::Duration};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_STALE_WORKSPACE_SECONDS: u64 = 2 * 60 * 60;
const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 1024 * 1024 * 1024;
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_RATE_LIMIT_PER_MINUTE: usize = 5;
const DEFAULT_RATE_LIMIT_PER_DAY: usize = 50;

const DEFAULT_ALLOWED_DOMAINS: [&str; 13] = [
    "youtube.com",
    "youtu.be",
    "vimeo.com",
    "x.com",
    "twitter.com",
    "tiktok.com",
    "instagram.com",
    "facebook.com",
    "fb.watch",
    "dailymotion.com",
    "twitch.tv",
    "soundcloud.com",
    "reddit.com",
];

const DEFAULT_BLOCKED_DOMAINS: [&str; 5] = [
    "localhost",
    "localdomain",
    "internal",
    "metadata.google.internal",
    "169.254.169.254",
];

/// Runtime configuration, read once at startup and handed to the router.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub allowed_domains: Vec<String>,
    pub blocked_domains: Vec<String>,
    /// Lets an allow-listed domain through when DNS resolution fails
    /// (short-link redirectors). Weakens the private-network guard.
    pub allow_unresolved_allowlisted: bool,
    pub yt_dlp_path: String,
    pub ffmpeg_path: Option<String>,
    pub merge_format: String,
    pub extraction_timeout: Duration,
    pub transfer_dir: PathBuf,
    pub stale_workspace_age: Duration,
    /// `None` disables the size check.
    pub max_download_bytes: Option<u64>,
    pub max_concurrent_downloads: usize,
    pub rate_limit_per_minute: usize,
    pub rate_limit_per_day: usize,
    pub rate_limit_state_path: Option<PathBuf>,
    pub trust_proxy_headers: bool,
    pub allowed_origins: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_vars(|_| None)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| lookup(name).and_then(|value| non_empty(&value).map(String::from));
        let read_u64 = |name: &str| read(name).and_then(|value| value.parse::<u64>().ok());
        let read_usize = |name: &str| read(name).and_then(|value| value.parse::<usize>().ok());
        // Lists distinguish unset (defaults) from set-but-empty (no entries).
        let read_list = |name: &str, defaults: &[&str]| {
            lookup(name)
                .map(|value| parse_domain_list(&value))
                .unwrap_or_else(|| defaults.iter().map(|entry| entry.to_string()).collect())
        };

        let bind_addr = read("APP_ADDR")
            .or_else(|| {
                read("PORT")
                    .and_then(|value| value.parse::<u16>().ok())
                    .map(|port| format!("0.0.0.0:{port}"))
            })
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        let transfer_dir = read("TRANSFER_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("media-downloader"));

        let max_download_bytes = match read_u64("MAX_DOWNLOAD_BYTES") {
            Some(0) => None,
            Some(value) => Some(value),
            None => Some(DEFAULT_MAX_DOWNLOAD_BYTES),
        };

        Self {
            bind_addr,
            allowed_domains: read_list("ALLOWED_DOMAINS", &DEFAULT_ALLOWED_DOMAINS),
            blocked_domains: read_list("BLOCKED_DOMAINS", &DEFAULT_BLOCKED_DOMAINS),
            allow_unresolved_allowlisted: read("ALLOW_UNRESOLVED_ALLOWLISTED")
                .and_then(|value| parse_bool(&value))
                .unwrap_or(false),
            yt_dlp_path: read("YT_DLP_PATH").unwrap_or_else(|| "yt-dlp".to_string()),
            ffmpeg_path: read("FFMPEG_PATH"),
            merge_format: read("MERGE_FORMAT")
                .map(|value| value.to_ascii_lowercase())
                .unwrap_or_else(|| "mp4".to_string()),
            extraction_timeout: Duration::from_secs(
                read_u64("YT_DLP_TIMEOUT_SECONDS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_YT_DLP_TIMEOUT_SECONDS),
            ),
            transfer_dir,
            stale_workspace_age: Duration::from_secs(
                read_u64("STALE_WORKSPACE_SECONDS").unwrap_or(DEFAULT_STALE_WORKSPACE_SECONDS),
            ),
            max_download_bytes,
            max_concurrent_downloads: read_usize("MAX_CONCURRENT_DOWNLOADS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
            rate_limit_per_minute: read_usize("RATE_LIMIT_PER_MINUTE")
                .unwrap_or(DEFAULT_RATE_LIMIT_PER_MINUTE),
            rate_limit_per_day: read_usize("RATE_LIMIT_PER_DAY")
                .unwrap_or(DEFAULT_RATE_LIMIT_PER_DAY),
            rate_limit_state_path: read("RATE_LIMIT_STATE_PATH").map(PathBuf::from),
            trust_proxy_headers: read("TRUST_PROXY_HEADERS")
                .and_then(|value| parse_bool(&value))
                .unwrap_or(false),
            allowed_origins: read("ALLOWED_ORIGINS")
                .map(|value| {
                    value
                        .split(',')
                        .filter_map(non_empty)
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_domain_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|entry| !entry.is_empty())
        .collect()
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
