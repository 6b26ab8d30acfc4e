use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::{extract::ExtractError, guard::GuardError, rate_limit::RateLimitExceeded};

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

/// Error returned by every handler. Rendered as a JSON body with the
/// matching status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    pub detail: Option<String>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>, code: Option<&'static str>) -> Self {
        Self {
            status,
            message: message.into(),
            code,
            detail: None,
            retry_after_seconds: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, Some("INVALID_REQUEST"))
    }

    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message, Some(code))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message, None)
    }

    pub fn no_media(status: StatusCode) -> Self {
        Self::new(
            status,
            "The extractor returned no media for this URL.",
            Some("NO_MEDIA"),
        )
    }

    pub fn file_not_found() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Download finished but the output file was not found.",
            Some("FILE_NOT_FOUND"),
        )
    }

    pub fn file_too_large(max_bytes: u64) -> Self {
        let max_mb = max_bytes / 1_048_576;
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("The file exceeds the {max_mb} MB limit."),
            Some("FILE_TOO_LARGE"),
        )
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            detail: self.detail,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}

impl From<GuardError> for ApiError {
    fn from(error: GuardError) -> Self {
        let message = error.to_string();
        match error {
            GuardError::InvalidUrl(_) | GuardError::UnsupportedScheme(_) | GuardError::MissingHost => {
                Self::bad_request(message)
            }
            GuardError::NotAllowed(_) => Self::forbidden("DOMAIN_NOT_ALLOWED", message),
            GuardError::Blocked(_) => Self::forbidden("DOMAIN_BLOCKED", message),
            GuardError::PrivateAddress { .. } => Self::forbidden("PRIVATE_ADDRESS", message),
            GuardError::Unresolvable { .. } => Self::forbidden("UNRESOLVABLE_HOST", message),
        }
    }
}

impl From<RateLimitExceeded> for ApiError {
    fn from(error: RateLimitExceeded) -> Self {
        let mut api_error = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            error.to_string(),
            Some("RATE_LIMITED"),
        );
        api_error.retry_after_seconds = Some(error.retry_after_seconds);
        api_error
    }
}

impl ApiError {
    /// Maps an extractor failure. `no_media_status` differs between the
    /// preview (404) and download (500) endpoints.
    pub fn from_extract(error: ExtractError, no_media_status: StatusCode) -> Self {
        match error {
            ExtractError::NoEntries => Self::no_media(no_media_status),
            ExtractError::Unsupported(detail) => Self::new(
                StatusCode::BAD_REQUEST,
                "The URL is not supported by the extractor.",
                Some("UNSUPPORTED_URL"),
            )
            .with_detail(detail),
            ExtractError::Failed(detail) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "The extractor could not process this URL.",
                Some("EXTRACTION_FAILED"),
            )
            .with_detail(detail),
            ExtractError::Timeout(seconds) => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                format!("The extractor did not finish within {seconds} seconds."),
                Some("EXTRACTION_TIMEOUT"),
            ),
            ExtractError::NotInstalled(program) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{program} is not installed on the server."),
                Some("EXTRACTOR_UNAVAILABLE"),
            ),
            ExtractError::InvalidOutput(detail) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "The extractor returned unreadable output.",
                Some("EXTRACTION_FAILED"),
            )
            .with_detail(detail),
            ExtractError::Io(error) => {
                Self::internal(format!("Could not run the extractor: {error}"))
            }
        }
    }
}
