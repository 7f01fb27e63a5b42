//! Proxy error types and response handling

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};

/// Errors that terminate a proxied request before a response can be relayed
#[derive(Debug)]
pub(crate) enum ProxyError {
    /// Unreadable request body; never recorded
    BodyRead(String),
    UpstreamConnect(String),
    UpstreamTimeout(String),
    ResponseBuild(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let (status, message) = match self {
            ProxyError::BodyRead(msg) => (StatusCode::BAD_REQUEST, msg),
            ProxyError::UpstreamConnect(msg) => (StatusCode::BAD_GATEWAY, msg),
            ProxyError::UpstreamTimeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            ProxyError::ResponseBuild(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        tracing::error!("Proxy error: {} - {}", status, message);

        Response::builder()
            .status(status)
            .body(Body::from(message))
            .unwrap_or_else(|_| Response::new(Body::from("Internal error building error response")))
    }
}
