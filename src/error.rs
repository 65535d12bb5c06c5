use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Path traversal rejected: {0}")]
    PathTraversal(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream timed out after {0} seconds")]
    UpstreamTimeout(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("URI error: {0}")]
    Uri(String),
}

impl GatewayError {
    /// Status code written to the client when this error ends a request.
    ///
    /// Traversal attempts are reported exactly like missing files so the
    /// response never reveals anything about the filesystem layout.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) | GatewayError::PathTraversal(_) => StatusCode::NOT_FOUND,
            GatewayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Io(_)
            | GatewayError::Http(_)
            | GatewayError::Config(_)
            | GatewayError::Url(_)
            | GatewayError::Uri(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the connection should be closed after the error response.
    pub fn closes_connection(&self) -> bool {
        matches!(self, GatewayError::MalformedRequest(_))
    }
}
