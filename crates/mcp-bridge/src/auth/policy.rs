//! Declarative authorization policy for servers.
//!
//! A [`Policy`] names the [`Authorization`] each operation demands. The
//! JSON-RPC [`PolicyAuthorizer`] answers unauthenticated calls with a -32001
//! error whose data is that `Authorization`; the HTTP [`BearerAuthorizer`]
//! enforces the global rule with a `401` challenge.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use axum::{
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    challenge::bearer_challenge,
    types::{Authorization, PROTECTED_RESOURCE_PATH},
};
use crate::{
    error::{Error, Result},
    schema::{JSONRPCRequest, RESOURCES_READ, TOOLS_CALL},
    server::{Admission, Authorizer, HttpAuthorizer},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Applies to every operation without a more specific rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<Authorization>,
    /// Rules for `tools/call`, keyed by tool name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tools: HashMap<String, Authorization>,
    /// Rules for `resources/read`, keyed by resource name or URI.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub resources: HashMap<String, Authorization>,
    /// Paths under this prefix skip the HTTP check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_path_prefix: Option<String>,
}

impl Policy {
    pub fn with_global(mut self, authorization: Authorization) -> Self {
        self.global = Some(authorization);
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>, authorization: Authorization) -> Self {
        self.tools.insert(name.into(), authorization);
        self
    }

    pub fn with_resource(mut self, key: impl Into<String>, authorization: Authorization) -> Self {
        self.resources.insert(key.into(), authorization);
        self
    }

    /// The rule guarding `request`, if any. Tool calls and resource reads
    /// are governed by their own maps alone; an unlisted name is open.
    pub fn rule_for(&self, request: &JSONRPCRequest) -> Option<&Authorization> {
        match request.method.as_str() {
            TOOLS_CALL => request.param_str("name").and_then(|n| self.tools.get(n)),
            RESOURCES_READ => request
                .param_str("name")
                .and_then(|n| self.resources.get(n))
                .or_else(|| request.param_str("uri").and_then(|u| self.resources.get(u))),
            _ => self.global.as_ref(),
        }
    }

    fn excludes(&self, path: &str) -> bool {
        self.exclude_path_prefix
            .as_deref()
            .is_some_and(|prefix| !prefix.is_empty() && path.starts_with(prefix))
    }
}

/// JSON-RPC authorizer enforcing a [`Policy`].
#[derive(Clone)]
pub struct PolicyAuthorizer {
    policy: Arc<Policy>,
}

impl PolicyAuthorizer {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }
}

#[async_trait]
impl Authorizer for PolicyAuthorizer {
    async fn authorize(&self, request: &JSONRPCRequest) -> Result<Option<String>> {
        if let Some(token) = request
            .meta()
            .and_then(|m| m.authorization)
            .and_then(|a| a.token)
        {
            return Ok(Some(token));
        }
        match self.policy.rule_for(request) {
            None => Ok(None),
            Some(authorization) => {
                debug!("Denying unauthenticated {}", request.method);
                Err(Error::unauthorized(
                    "authorization required",
                    Some(serde_json::to_value(authorization)?),
                ))
            }
        }
    }
}

/// The bearer token in an `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

/// Absolute URL of this server's resource metadata, as seen by the caller
/// through any proxy.
pub fn resource_metadata_url(headers: &HeaderMap) -> String {
    let forwarded = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let proto = forwarded("x-forwarded-proto").unwrap_or_else(|| "http".into());
    let host = forwarded("x-forwarded-host")
        .or_else(|| forwarded(header::HOST.as_str()))
        .unwrap_or_else(|| "localhost".into());
    format!("{proto}://{host}{PROTECTED_RESOURCE_PATH}")
}

/// HTTP authorizer that requires a bearer token whenever the policy has a
/// global rule.
#[derive(Clone)]
pub struct BearerAuthorizer {
    policy: Arc<Policy>,
}

impl BearerAuthorizer {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }
}

#[async_trait]
impl HttpAuthorizer for BearerAuthorizer {
    async fn authorize(
        &self,
        uri: &Uri,
        headers: &HeaderMap,
    ) -> std::result::Result<Admission, Response> {
        let token = bearer_token(headers);
        if self.policy.global.is_none() || self.policy.excludes(uri.path()) {
            return Ok(Admission {
                token,
                headers: HeaderMap::new(),
            });
        }
        match token {
            Some(token) => Ok(Admission::with_token(token)),
            None => {
                let mut response = StatusCode::UNAUTHORIZED.into_response();
                let challenge = bearer_challenge(&resource_metadata_url(headers), None);
                if let Ok(value) = HeaderValue::from_str(&challenge) {
                    response
                        .headers_mut()
                        .insert(header::WWW_AUTHENTICATE, value);
                }
                Err(response)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{auth::ProtectedResourceMetadata, schema::RequestId};

    fn rule(scope: &str) -> Authorization {
        Authorization::new(
            ProtectedResourceMetadata::new("https://api.example/mcp", "https://issuer.example"),
            vec![scope.into()],
        )
    }

    fn request(method: &str, params: serde_json::Value) -> JSONRPCRequest {
        JSONRPCRequest::new(RequestId::Number(1), method, Some(params))
    }

    #[test]
    fn test_rule_selection() {
        let policy = Policy::default()
            .with_global(rule("global"))
            .with_tool("secret", rule("tool"))
            .with_resource("file:///a", rule("resource"));
        let scope = |r: &JSONRPCRequest| policy.rule_for(r).unwrap().required_scopes[0].clone();

        assert_eq!(scope(&request(TOOLS_CALL, json!({"name": "secret"}))), "tool");
        assert!(policy.rule_for(&request(TOOLS_CALL, json!({"name": "open"}))).is_none());
        assert_eq!(
            scope(&request(RESOURCES_READ, json!({"uri": "file:///a"}))),
            "resource"
        );
        assert!(
            policy
                .rule_for(&request(RESOURCES_READ, json!({"uri": "file:///b"})))
                .is_none()
        );
        assert_eq!(scope(&request("prompts/list", json!({}))), "global");
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc".into()));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer  "));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn test_unlisted_tool_passes_with_global_rule() {
        let authorizer = PolicyAuthorizer::new(
            Policy::default()
                .with_global(rule("global"))
                .with_tool("secret", rule("tool")),
        );

        let open = request(TOOLS_CALL, json!({"name": "x"}));
        assert_eq!(authorizer.authorize(&open).await.unwrap(), None);

        let listing = request("tools/list", json!({}));
        let err = authorizer.authorize(&listing).await.unwrap_err();
        assert_eq!(err.code(), crate::schema::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unauthenticated_call_carries_authorization() {
        let authorizer = PolicyAuthorizer::new(Policy::default().with_tool("secret", rule("tool")));

        let open = request(TOOLS_CALL, json!({"name": "open"}));
        assert_eq!(authorizer.authorize(&open).await.unwrap(), None);

        let secret = request(TOOLS_CALL, json!({"name": "secret"}));
        let err = authorizer.authorize(&secret).await.unwrap_err();
        assert_eq!(err.code(), crate::schema::UNAUTHORIZED);
        let Error::Unauthorized { data: Some(data), .. } = err else {
            panic!("expected unauthorized with data");
        };
        assert_eq!(data["requiredScopes"][0], "tool");

        let mut with_token = secret.clone();
        with_token.set_meta_token("tok");
        assert_eq!(
            authorizer.authorize(&with_token).await.unwrap(),
            Some("tok".into())
        );
    }

    #[tokio::test]
    async fn test_http_challenge_honours_forwarding() {
        let authorizer = BearerAuthorizer::new(
            Policy {
                exclude_path_prefix: Some("/public".into()),
                ..Default::default()
            }
            .with_global(rule("global")),
        );
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("internal:8080"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("api.example"));

        let denied = authorizer
            .authorize(&"/mcp".parse().unwrap(), &headers)
            .await
            .unwrap_err();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            denied.headers()[header::WWW_AUTHENTICATE],
            "Bearer resource_metadata=\"https://api.example/.well-known/oauth-protected-resource\""
        );

        assert!(
            authorizer
                .authorize(&"/public/info".parse().unwrap(), &headers)
                .await
                .is_ok()
        );

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        let admitted = authorizer
            .authorize(&"/mcp".parse().unwrap(), &headers)
            .await
            .unwrap();
        assert_eq!(admitted.token.as_deref(), Some("t"));
    }
}
