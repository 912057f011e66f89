//! Gateway error taxonomy and error page rendering.
//!
//! Every error the gateway answers by itself is classified into an
//! [`ErrorKind`]. The kind decides the HTTP status, the value of the
//! `X-Zentinel-Error` header and the message shown on the error page.

use anyhow::{Context, Result};
use http::StatusCode;
use std::fmt;
use std::io::{self, Write};
use std::path::Path;

/// Header carrying the gateway error code on generated responses.
pub const ERROR_HEADER: &str = "X-Zentinel-Error";

/// Classified gateway error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A validator or route is not usable with the current configuration.
    ConfigurationError,
    /// No credential was presented.
    AuthorizationRequired,
    /// A credential was presented but rejected.
    AuthorizationFailed,
    RouteNotFound,
    RequestTooLarge,
    BackendUnavailable,
    BackendTimeout,
    /// The response carried no usable status code.
    Server,
}

impl ErrorKind {
    /// HTTP status used when rendering this kind.
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::ConfigurationError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::AuthorizationRequired => StatusCode::UNAUTHORIZED,
            ErrorKind::AuthorizationFailed => StatusCode::FORBIDDEN,
            ErrorKind::RouteNotFound => StatusCode::NOT_FOUND,
            ErrorKind::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::BackendUnavailable => StatusCode::BAD_GATEWAY,
            ErrorKind::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Server => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code, used as the error header value.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::AuthorizationRequired => "authorization_required",
            ErrorKind::AuthorizationFailed => "authorization_failed",
            ErrorKind::RouteNotFound => "route_not_found",
            ErrorKind::RequestTooLarge => "request_too_large",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::BackendTimeout => "backend_timeout",
            ErrorKind::Server => "server_error",
        }
    }

    /// Human-readable message for the error page.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorKind::ConfigurationError => "Configuration error",
            ErrorKind::AuthorizationRequired => "Authorization required",
            ErrorKind::AuthorizationFailed => "Access denied",
            ErrorKind::RouteNotFound => "Not found",
            ErrorKind::RequestTooLarge => "Request body too large",
            ErrorKind::BackendUnavailable => "Backend unavailable",
            ErrorKind::BackendTimeout => "Backend timeout",
            ErrorKind::Server => "Internal server error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Errors raised while serving a request after access control passed.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("response writer does not support connection hijacking")]
    NotHijackable,

    #[error("backend request failed: {0}")]
    Backend(String),

    #[error("backend request timed out")]
    BackendTimeout,

    #[error("failed to write response: {0}")]
    Write(#[from] io::Error),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::NotHijackable => ErrorKind::ConfigurationError,
            GatewayError::Write(_) => ErrorKind::Server,
            GatewayError::Backend(_) => ErrorKind::BackendUnavailable,
            GatewayError::BackendTimeout => ErrorKind::BackendTimeout,
        }
    }
}

const DEFAULT_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>{{status}} {{message}}</title></head>
<body>
<h1>{{status}} {{message}}</h1>
<p>Request ID: <code>{{request_id}}</code></p>
<hr><p>zentinel</p>
</body>
</html>
"#;

/// Renders gateway errors as complete HTTP/1.1 messages.
///
/// The output goes through the same response writer as backend responses, so
/// error pages receive the configured header policy as well.
#[derive(Debug, Clone)]
pub struct ErrorTemplate {
    page: String,
}

impl Default for ErrorTemplate {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE.to_string(),
        }
    }
}

impl ErrorTemplate {
    /// Load a custom error page. Supports `{{status}}`, `{{message}}` and
    /// `{{request_id}}` placeholders.
    pub fn from_file(path: &Path) -> Result<Self> {
        let page = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read error file: {:?}", path))?;
        Ok(Self { page })
    }

    /// Write the error response for `kind` to `out`.
    pub fn render(
        &self,
        kind: ErrorKind,
        request_id: &str,
        challenge: Option<&str>,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let status = kind.status();
        let body = self.body(kind, request_id);

        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        head.push_str("Content-Type: text/html; charset=utf-8\r\n");
        head.push_str("Cache-Control: no-store\r\n");
        head.push_str(&format!("{}: {}\r\n", ERROR_HEADER, kind.code()));
        if let Some(challenge) = challenge {
            head.push_str(&format!("WWW-Authenticate: {}\r\n", challenge));
        }
        head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

        out.write_all(head.as_bytes())?;
        out.write_all(body.as_bytes())?;
        out.flush()
    }

    fn body(&self, kind: ErrorKind, request_id: &str) -> String {
        self.page
            .replace("{{status}}", kind.status().as_str())
            .replace("{{message}}", kind.message())
            .replace("{{request_id}}", request_id)
    }
}
