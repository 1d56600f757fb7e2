//! Middleware applied to the JSON-RPC endpoints of the HTTP ingress.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{debug, warn};

use crate::{schema::LATEST_PROTOCOL_VERSION, transport::MCP_PROTOCOL_VERSION_HEADER};

/// Authenticates HTTP requests before they reach a JSON-RPC endpoint.
#[async_trait]
pub trait HttpAuthorizer: Send + Sync + 'static {
    /// `Ok(admission)` lets the request through, `Err(response)` ends it
    /// with that response.
    async fn authorize(
        &self,
        uri: &Uri,
        headers: &HeaderMap,
    ) -> std::result::Result<Admission, Response>;
}

/// The outcome of a successful HTTP authorization.
#[derive(Debug, Default)]
pub struct Admission {
    /// Bearer token to attach to the request.
    pub token: Option<String>,
    /// Headers appended to the eventual response, e.g. a session cookie.
    pub headers: HeaderMap,
}

impl Admission {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            headers: HeaderMap::new(),
        }
    }
}

/// The bearer token an [`HttpAuthorizer`] admitted, stored in request
/// extensions.
#[derive(Debug, Clone)]
pub struct AuthToken(pub String);

/// Cross-origin settings for the JSON-RPC endpoints.
#[derive(Debug, Clone, Default)]
pub struct CorsOptions {
    /// Allowed origins. `*` allows any origin.
    pub allow_origins: Vec<String>,
    /// Extra request headers browsers may send. Empty mirrors the request.
    pub allow_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age: Option<std::time::Duration>,
}

impl CorsOptions {
    pub fn allow_any() -> Self {
        Self {
            allow_origins: vec!["*".into()],
            ..Default::default()
        }
    }

    fn any_origin(&self) -> bool {
        self.allow_origins.iter().any(|o| o == "*")
    }

    /// True when a request carrying `origin` may proceed.
    pub fn allows(&self, origin: &str) -> bool {
        self.any_origin() || self.allow_origins.iter().any(|o| o == origin)
    }

    pub(crate) fn layer(&self) -> CorsLayer {
        let origins = if self.any_origin() {
            // Credentials forbid a literal `*`, so echo the caller instead.
            if self.allow_credentials {
                AllowOrigin::mirror_request()
            } else {
                AllowOrigin::any()
            }
        } else {
            AllowOrigin::list(
                self.allow_origins
                    .iter()
                    .filter_map(|o| HeaderValue::from_str(o).ok()),
            )
        };
        let headers = if self.allow_headers.is_empty() {
            AllowHeaders::mirror_request()
        } else {
            AllowHeaders::list(
                self.allow_headers
                    .iter()
                    .filter_map(|h| h.parse::<header::HeaderName>().ok()),
            )
        };
        let mut layer = CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(AllowMethods::mirror_request())
            .allow_headers(headers)
            .allow_credentials(self.allow_credentials);
        if let Some(max_age) = self.max_age {
            layer = layer.max_age(max_age);
        }
        layer
    }
}

pub(crate) async fn authorize(
    State(authorizer): State<Arc<dyn HttpAuthorizer>>,
    mut request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    match authorizer.authorize(request.uri(), request.headers()).await {
        Ok(admission) => {
            if let Some(token) = admission.token {
                request.extensions_mut().insert(AuthToken(token));
            }
            let mut response = next.run(request).await;
            for (name, value) in admission.headers.iter() {
                response.headers_mut().append(name.clone(), value.clone());
            }
            response
        }
        Err(response) => {
            debug!("HTTP authorizer rejected {} {}", request.method(), request.uri());
            response
        }
    }
}

pub(crate) async fn protocol_version(request: Request, next: Next) -> Response {
    let rejected = request
        .headers()
        .get(MCP_PROTOCOL_VERSION_HEADER)
        .is_some_and(|v| v.as_bytes() != LATEST_PROTOCOL_VERSION.as_bytes());
    let mut response = if rejected {
        (StatusCode::BAD_REQUEST, "Unsupported protocol version").into_response()
    } else {
        next.run(request).await
    };
    response.headers_mut().insert(
        MCP_PROTOCOL_VERSION_HEADER,
        HeaderValue::from_static(LATEST_PROTOCOL_VERSION),
    );
    response
}

pub(crate) async fn validate_origin(
    State(cors): State<Arc<CorsOptions>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(origin) = request.headers().get(header::ORIGIN) {
        let allowed = origin.to_str().map(|o| cors.allows(o)).unwrap_or(false);
        if !allowed {
            warn!("Rejecting request from origin {:?}", origin);
            return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
        }
    }
    next.run(request).await
}
