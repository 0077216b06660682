//! Error handling and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No route matches the host and path
    NoRoute,
    /// A required query parameter is absent
    MissingParameter,
    /// Request timed out waiting for the upstream
    RequestTimeout,
    /// Failed to connect to the upstream
    ConnectionFailed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NoRoute => StatusCode::NOT_FOUND,
            ProxyErrorCode::MissingParameter => StatusCode::BAD_REQUEST,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::NoRoute => "NO_ROUTE",
            ProxyErrorCode::MissingParameter => "MISSING_PARAMETER",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let mut response = Response::new(
        Full::new(Bytes::from(error.to_json()))
            .map_err(|e| match e {})
            .boxed(),
    );
    *response.status_mut() = code.status_code();

    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        "X-Proxy-Error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}
