//! Streams a downloaded file to the client and drops its workspace when the
//! body is finished or abandoned.

use std::{
    path::Path,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::{Body, Bytes},
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use futures_util::Stream;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::{error::ApiError, workspace::Workspace};

pub const CHUNK_SIZE: usize = 8 * 1024;
const MAX_FILENAME_CHARS: usize = 200;
const FALLBACK_FILENAME: &str = "video";

/// File chunks that keep the request workspace alive until the stream is
/// dropped.
pub struct WorkspaceStream {
    inner: ReaderStream<File>,
    workspace: Workspace,
    bytes_sent: u64,
    expected: u64,
}

impl WorkspaceStream {
    pub fn new(file: File, workspace: Workspace, expected: u64) -> Self {
        Self {
            inner: ReaderStream::with_capacity(file, CHUNK_SIZE),
            workspace,
            bytes_sent: 0,
            expected,
        }
    }
}

impl Stream for WorkspaceStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &polled {
            self.bytes_sent += chunk.len() as u64;
        }
        polled
    }
}

impl Drop for WorkspaceStream {
    fn drop(&mut self) {
        if self.bytes_sent < self.expected {
            info!(
                "Stream from {:?} stopped after {} of {} bytes",
                self.workspace.path(),
                self.bytes_sent,
                self.expected
            );
        } else {
            debug!(
                "Stream from {:?} finished ({} bytes)",
                self.workspace.path(),
                self.bytes_sent
            );
        }
    }
}

/// Builds the attachment response. The workspace moves into the body.
pub async fn media_response(
    path: &Path,
    title: &str,
    workspace: Workspace,
    max_bytes: Option<u64>,
) -> Result<Response, ApiError> {
    let metadata = tokio::fs::metadata(path).await.map_err(|error| {
        ApiError::internal(format!("Could not read the downloaded file: {error}"))
    })?;
    if let Some(max_bytes) = max_bytes
        && metadata.len() > max_bytes
    {
        return Err(ApiError::file_too_large(max_bytes));
    }

    let file = File::open(path).await.map_err(|error| {
        ApiError::internal(format!("Could not open the downloaded file: {error}"))
    })?;

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| "mp4".to_string());
    let filename = format!("{}.{extension}", sanitize_filename(title));

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_extension(&extension)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    let body = Body::from_stream(WorkspaceStream::new(file, workspace, metadata.len()));
    Ok((headers, body).into_response())
}

pub fn content_type_for_extension(extension: &str) -> &'static str {
    match extension {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "flv" => "video/x-flv",
        "avi" => "video/x-msvideo",
        "3gp" => "video/3gpp",
        "ts" => "video/mp2t",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "opus" | "ogg" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii_filename(filename),
        urlencoding::encode(filename)
    )
}

/// Keeps alphanumerics, spaces, `.`, `_` and `-`. Idempotent.
pub fn sanitize_filename(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|character| character.is_alphanumeric() || matches!(character, ' ' | '.' | '_' | '-'))
        .take(MAX_FILENAME_CHARS)
        .collect();

    let trimmed = kept.trim();
    if trimmed.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// ASCII-only form for the plain `filename=` parameter.
fn ascii_filename(filename: &str) -> String {
    let ascii: String = filename.chars().filter(char::is_ascii).collect();
    let trimmed = ascii.trim();
    if trimmed.is_empty() || trimmed.starts_with('.') {
        format!("{FALLBACK_FILENAME}{trimmed}")
    } else {
        trimmed.to_string()
    }
}
