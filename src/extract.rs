//! yt-dlp invocation: metadata probing and fetch-and-merge into a workspace.

use std::{
    io::ErrorKind,
    path::PathBuf,
    process::{Output, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::{debug, info, warn};

use crate::workspace::Workspace;

const DEFAULT_FORMAT_SELECTOR: &str = "bestvideo+bestaudio/best";
const MAX_FORMAT_ID_LEN: usize = 64;
const TOOL_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("the extractor returned no entries")]
    NoEntries,
    #[error("unsupported URL: {0}")]
    Unsupported(String),
    #[error("extraction failed: {0}")]
    Failed(String),
    #[error("extraction timed out after {0}s")]
    Timeout(u64),
    #[error("{0} is not installed")]
    NotInstalled(String),
    #[error("unreadable extractor output: {0}")]
    InvalidOutput(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Metadata reported by the extractor. Values are passed through as-is.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MediaInfo {
    pub title: String,
    pub thumbnail: Option<String>,
    pub uploader: Option<String>,
    pub duration: Option<f64>,
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub formats: Vec<FormatSummary>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FormatSummary {
    pub format_id: String,
    pub ext: Option<String>,
    pub resolution: Option<String>,
    pub filesize_approx: Option<u64>,
}

/// What a full fetch reported about its output.
#[derive(Debug, Clone, Default)]
pub struct FetchedMedia {
    pub title: Option<String>,
    pub filepath: Option<PathBuf>,
}

impl FetchedMedia {
    pub fn reported_nothing(&self) -> bool {
        self.title.is_none() && self.filepath.is_none()
    }
}

#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// Metadata only, no file I/O.
    async fn probe(&self, url: &str) -> Result<MediaInfo, ExtractError>;

    /// Downloads and merges `url` into `workspace`.
    async fn fetch(
        &self,
        url: &str,
        format: Option<&str>,
        workspace: &Workspace,
    ) -> Result<FetchedMedia, ExtractError>;
}

/// Metadata strategies, tried in order until one returns something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    Full,
    Flat,
}

impl ExtractionStrategy {
    pub const ORDERED: [ExtractionStrategy; 2] = [Self::Full, Self::Flat];

    fn args(self) -> &'static [&'static str] {
        match self {
            Self::Full => &["-J", "--no-playlist", "--no-progress"],
            Self::Flat => &["-J", "--flat-playlist", "--no-progress"],
        }
    }
}

/// Runs the yt-dlp executable.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: String,
    ffmpeg_location: Option<String>,
    merge_format: String,
    deadline: Duration,
}

impl YtDlp {
    pub fn new(
        program: impl Into<String>,
        ffmpeg_location: Option<String>,
        merge_format: impl Into<String>,
        deadline: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            ffmpeg_location,
            merge_format: merge_format.into(),
            deadline,
        }
    }

    fn fetch_args(&self, url: &str, selector: &str, workspace: &Workspace) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--playlist-items".to_string(),
            "1".to_string(),
            "--no-progress".to_string(),
            "--newline".to_string(),
            "-f".to_string(),
            selector.to_string(),
            "--merge-output-format".to_string(),
            self.merge_format.clone(),
            "-o".to_string(),
            workspace.output_template(),
            "--paths".to_string(),
            format!("temp:{}", workspace.path().to_string_lossy()),
            "--print".to_string(),
            "after_move:%(.{title,filepath})j".to_string(),
        ];

        if let Some(location) = &self.ffmpeg_location {
            args.push("--ffmpeg-location".to_string());
            args.push(location.clone());
        }

        args.push("--".to_string());
        args.push(url.to_string());
        args
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, ExtractError> {
        debug!("Running {} {:?}", self.program, args);

        let mut command = Command::new(&self.program);
        command.args(&args).stdin(Stdio::null()).kill_on_drop(true);

        let output = timeout(self.deadline, command.output())
            .await
            .map_err(|_| ExtractError::Timeout(self.deadline.as_secs()))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    ExtractError::NotInstalled(self.program.clone())
                } else {
                    ExtractError::Io(error)
                }
            })?;

        log_stderr(&output.stderr);

        if !output.status.success() {
            return Err(classify_failure(&output.stderr));
        }

        Ok(output)
    }
}

#[async_trait]
impl MediaExtractor for YtDlp {
    async fn probe(&self, url: &str) -> Result<MediaInfo, ExtractError> {
        let mut last_error = ExtractError::NoEntries;

        for strategy in ExtractionStrategy::ORDERED {
            let mut args: Vec<String> = strategy.args().iter().map(|arg| arg.to_string()).collect();
            args.push("--".to_string());
            args.push(url.to_string());

            let result = self
                .run(args)
                .await
                .and_then(|output| parse_info(&output.stdout));

            match result {
                Ok(info) => return Ok(info),
                Err(error @ (ExtractError::Timeout(_) | ExtractError::NotInstalled(_))) => {
                    return Err(error);
                }
                Err(error) => {
                    debug!("Strategy {:?} failed for {url}: {error}", strategy);
                    last_error = error;
                }
            }
        }

        Err(last_error)
    }

    async fn fetch(
        &self,
        url: &str,
        format: Option<&str>,
        workspace: &Workspace,
    ) -> Result<FetchedMedia, ExtractError> {
        let selector = format.unwrap_or(DEFAULT_FORMAT_SELECTOR);
        let output = self.run(self.fetch_args(url, selector, workspace)).await?;
        Ok(parse_printed_download(&output.stdout))
    }
}

/// Checks a client-supplied format id before it reaches the command line.
pub fn validate_format_id(value: &str) -> Option<&str> {
    let value = value.trim();
    let valid = !value.is_empty()
        && value.len() <= MAX_FORMAT_ID_LEN
        && !value.starts_with('-')
        && value.chars().all(|character| {
            character.is_ascii_alphanumeric()
                || matches!(
                    character,
                    '_' | '+' | '-' | '/' | '.' | '[' | ']' | '=' | '<' | '>' | ':' | '*' | ',' | '!'
                )
        });
    valid.then_some(value)
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    extractor_key: Option<String>,
    extractor: Option<String>,
    formats: Option<Vec<YtDlpFormat>>,
    entries: Option<Vec<Option<YtDlpInfo>>>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: Option<String>,
    ext: Option<String>,
    resolution: Option<String>,
    width: Option<u64>,
    height: Option<u64>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PrintedDownload {
    title: Option<String>,
    filepath: Option<String>,
}

fn parse_info(stdout: &[u8]) -> Result<MediaInfo, ExtractError> {
    let info: Option<YtDlpInfo> = serde_json::from_slice(stdout)
        .map_err(|error| ExtractError::InvalidOutput(error.to_string()))?;
    let mut info = info.ok_or(ExtractError::NoEntries)?;

    let media = match info.entries.take() {
        Some(entries) => {
            let mut entry = entries
                .into_iter()
                .flatten()
                .next()
                .ok_or(ExtractError::NoEntries)?;
            if entry.title.is_none() {
                entry.title = info.title.take();
            }
            entry
        }
        None if info.title.is_some() || info.formats.is_some() => info,
        None => return Err(ExtractError::NoEntries),
    };

    let formats = media
        .formats
        .unwrap_or_default()
        .into_iter()
        .filter_map(summarize_format)
        .collect();

    Ok(MediaInfo {
        title: media
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Untitled".to_string()),
        thumbnail: media.thumbnail,
        uploader: media.uploader,
        duration: media.duration,
        source: media.extractor_key.or(media.extractor),
        formats,
    })
}

fn summarize_format(format: YtDlpFormat) -> Option<FormatSummary> {
    let format_id = format.format_id?;
    let resolution = format.resolution.or_else(|| match (format.width, format.height) {
        (Some(width), Some(height)) => Some(format!("{width}x{height}")),
        (None, Some(height)) => Some(format!("{height}p")),
        _ => None,
    });

    Some(FormatSummary {
        format_id,
        ext: format.ext,
        resolution,
        filesize_approx: format
            .filesize
            .or(format.filesize_approx)
            .filter(|size| *size > 0.0)
            .map(|size| size.round() as u64),
    })
}

fn last_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

fn parse_printed_download(stdout: &[u8]) -> FetchedMedia {
    let Some(line) = last_line(stdout) else {
        return FetchedMedia::default();
    };

    match serde_json::from_str::<PrintedDownload>(&line) {
        Ok(printed) => FetchedMedia {
            title: printed.title,
            filepath: printed.filepath.map(PathBuf::from),
        },
        Err(_) => FetchedMedia {
            title: None,
            filepath: Some(PathBuf::from(line)),
        },
    }
}

fn classify_failure(stderr: &[u8]) -> ExtractError {
    let message = last_line(stderr).unwrap_or_else(|| "yt-dlp exited with an error".to_string());
    let lower = message.to_ascii_lowercase();

    if lower.contains("unsupported url") {
        ExtractError::Unsupported(message)
    } else {
        ExtractError::Failed(message)
    }
}

fn log_stderr(stderr: &[u8]) {
    for line in String::from_utf8_lossy(stderr).lines().map(str::trim) {
        if line.starts_with("WARNING:") || line.starts_with("ERROR:") {
            warn!("[yt-dlp] {line}");
        }
    }
}

/// Logs the versions of the external tools. Missing tools only warn.
pub async fn log_tool_versions(yt_dlp: &str, ffmpeg: Option<&str>) {
    let tools = [(yt_dlp, "--version"), (ffmpeg.unwrap_or("ffmpeg"), "-version")];

    for (program, flag) in tools {
        let mut command = Command::new(program);
        command.arg(flag).stdin(Stdio::null()).kill_on_drop(true);

        match timeout(TOOL_PROBE_TIMEOUT, command.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                info!("Found {program}: {version}");
            }
            Ok(Ok(output)) => warn!("{program} {flag} exited with {}", output.status),
            Ok(Err(error)) => warn!("{program} is not available: {error}"),
            Err(_) => warn!("{program} {flag} did not answer in time"),
        }
    }
}
