//! Backend-for-frontend authorization.
//!
//! The client runs only the browser half of the code flow and hands the code
//! to the server in an exchange header. The server redeems it with its own
//! client credentials and remembers the session through a cookie.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::{
    challenge::bearer_challenge,
    discovery::discover_authorization_server,
    flow::{AuthorizationGrant, BrowserFlow, exchange_code, token_http_client},
    policy::{bearer_token, resource_metadata_url},
    store::TokenStore,
    types::{AuthorizationExchange, ClientConfigs, ProtectedResourceMetadata, Token},
};
use crate::{
    error::{Error, Result},
    server::{Admission, HttpAuthorizer},
};

pub const DEFAULT_EXCHANGE_HEADER: &str = "Authorization-Exchange";
pub const SESSION_COOKIE: &str = "mcp_bff_session";

/// Client half: produces the exchange header value answering a challenge.
#[async_trait]
pub trait BffFlow: Send + Sync {
    async fn exchange(
        &self,
        authorization_uri: Option<&str>,
        resource: Option<&ProtectedResourceMetadata>,
        scopes: &[String],
    ) -> Result<String>;
}

/// Runs the browser flow and packages the code without redeeming it.
pub struct BrowserBffFlow {
    browser: BrowserFlow,
    store: Arc<dyn TokenStore>,
    discovery: reqwest::Client,
}

impl BrowserBffFlow {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self {
            browser: BrowserFlow::new(),
            store,
            discovery: reqwest::Client::new(),
        }
    }

    pub fn with_browser(mut self, browser: BrowserFlow) -> Self {
        self.browser = browser;
        self
    }
}

#[async_trait]
impl BffFlow for BrowserBffFlow {
    async fn exchange(
        &self,
        authorization_uri: Option<&str>,
        resource: Option<&ProtectedResourceMetadata>,
        scopes: &[String],
    ) -> Result<String> {
        let issuer = resource
            .and_then(|r| r.authorization_servers.first())
            .cloned()
            .ok_or_else(|| {
                Error::AuthorizationFailed("challenge names no authorization server".into())
            })?;
        let mut metadata = match self.store.authorization_server_metadata(&issuer).await {
            Some(metadata) => metadata,
            None => {
                let metadata = discover_authorization_server(&self.discovery, &issuer).await?;
                self.store
                    .add_authorization_server_metadata(&issuer, metadata.clone())
                    .await?;
                metadata
            }
        };
        if let Some(uri) = authorization_uri {
            metadata.authorization_endpoint = uri.to_string();
        }
        let client = self.store.client_config(&issuer).await.ok_or_else(|| {
            Error::InvalidConfiguration(format!("no OAuth client configured for issuer {issuer}"))
        })?;

        let AuthorizationGrant {
            code,
            verifier,
            redirect_uri,
        } = self.browser.authorize(&client, &metadata, scopes).await?;
        AuthorizationExchange {
            issuer,
            client_id: client.client_id,
            code,
            code_verifier: verifier,
            redirect_uri,
            scopes: scopes.to_vec(),
        }
        .encode()
    }
}

/// Server half: redeems an exchange for a token.
#[async_trait]
pub trait TokenExchanger: Send + Sync + 'static {
    async fn exchange(&self, exchange: &AuthorizationExchange) -> Result<Token>;
}

/// Redeems codes at the issuer's token endpoint with confidential client
/// credentials held by the server.
pub struct OAuthExchanger {
    clients: ClientConfigs,
    discovery: reqwest::Client,
}

impl OAuthExchanger {
    pub fn new(clients: ClientConfigs) -> Self {
        Self {
            clients,
            discovery: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TokenExchanger for OAuthExchanger {
    async fn exchange(&self, exchange: &AuthorizationExchange) -> Result<Token> {
        let client = self.clients.get(&exchange.issuer).ok_or_else(|| {
            Error::AuthorizationFailed(format!("issuer {} is not trusted", exchange.issuer))
        })?;
        if client.client_id != exchange.client_id {
            return Err(Error::AuthorizationFailed("client id mismatch".into()));
        }
        let metadata = discover_authorization_server(&self.discovery, &exchange.issuer).await?;
        let grant = AuthorizationGrant {
            code: exchange.code.clone(),
            verifier: exchange.code_verifier.clone(),
            redirect_uri: exchange.redirect_uri.clone(),
        };
        exchange_code(&token_http_client()?, client, &metadata, grant).await
    }
}

/// Admits bearer tokens, known session cookies, and exchange headers it
/// can redeem. Anything else is challenged with the exchange endpoint.
pub struct BffAuthorizer {
    exchanger: Arc<dyn TokenExchanger>,
    header: HeaderName,
    authorization_uri: String,
    sessions: DashMap<String, String>,
}

impl BffAuthorizer {
    pub fn new(exchanger: impl TokenExchanger, authorization_uri: impl Into<String>) -> Self {
        Self {
            exchanger: Arc::new(exchanger),
            header: HeaderName::from_static("authorization-exchange"),
            authorization_uri: authorization_uri.into(),
            sessions: DashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str) -> Result<Self> {
        self.header = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
            .map_err(|e| Error::InvalidConfiguration(format!("invalid exchange header: {e}")))?;
        Ok(self)
    }

    fn session_token(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == SESSION_COOKIE)
            .and_then(|(_, id)| self.sessions.get(id).map(|t| t.value().clone()))
    }

    fn challenge(&self, headers: &HeaderMap) -> Response {
        let value = bearer_challenge(
            &resource_metadata_url(headers),
            Some(&self.authorization_uri),
        );
        let mut response = StatusCode::UNAUTHORIZED.into_response();
        if let Ok(value) = HeaderValue::from_str(&value) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }
}

#[async_trait]
impl HttpAuthorizer for BffAuthorizer {
    async fn authorize(
        &self,
        _uri: &Uri,
        headers: &HeaderMap,
    ) -> std::result::Result<Admission, Response> {
        if let Some(token) = bearer_token(headers) {
            return Ok(Admission::with_token(token));
        }
        if let Some(token) = self.session_token(headers) {
            return Ok(Admission::with_token(token));
        }
        let Some(value) = headers.get(&self.header).and_then(|v| v.to_str().ok()) else {
            return Err(self.challenge(headers));
        };
        let exchange = match AuthorizationExchange::decode(value) {
            Ok(exchange) => exchange,
            Err(e) => {
                debug!("Malformed exchange header: {}", e);
                return Err(self.challenge(headers));
            }
        };
        let token = match self.exchanger.exchange(&exchange).await {
            Ok(token) => token,
            Err(e) => {
                warn!("Code exchange for {} failed: {}", exchange.issuer, e);
                return Err(self.challenge(headers));
            }
        };

        let session = uuid::Uuid::new_v4().to_string();
        info!("Started session for client {}", exchange.client_id);
        self.sessions
            .insert(session.clone(), token.access_token.clone());
        let mut admission = Admission::with_token(token.access_token);
        let cookie = format!("{SESSION_COOKIE}={session}; HttpOnly; Path=/; SameSite=Lax");
        if let Ok(cookie) = HeaderValue::from_str(&cookie) {
            admission.headers.insert(header::SET_COOKIE, cookie);
        }
        Ok(admission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl TokenExchanger for Fixed {
        async fn exchange(&self, exchange: &AuthorizationExchange) -> Result<Token> {
            if exchange.code == "good" {
                Ok(Token::bearer("minted"))
            } else {
                Err(Error::AuthorizationFailed("bad code".into()))
            }
        }
    }

    fn exchange_header(code: &str) -> HeaderValue {
        let exchange = AuthorizationExchange {
            issuer: "https://issuer.example".into(),
            client_id: "cid".into(),
            code: code.into(),
            code_verifier: "v".into(),
            redirect_uri: "http://127.0.0.1:1/callback".into(),
            scopes: vec![],
        };
        HeaderValue::from_str(&exchange.encode().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_exchange_then_cookie() {
        let authorizer = BffAuthorizer::new(Fixed, "https://issuer.example/authorize");
        let uri: Uri = "/mcp".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("api.example"));
        let denied = authorizer.authorize(&uri, &headers).await.unwrap_err();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        let challenge = denied.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
        assert!(challenge.contains("authorization_uri=\"https://issuer.example/authorize\""));

        headers.insert("authorization-exchange", exchange_header("good"));
        let admitted = authorizer.authorize(&uri, &headers).await.unwrap();
        assert_eq!(admitted.token.as_deref(), Some("minted"));
        let cookie = admitted.headers[header::SET_COOKIE].to_str().unwrap();
        let pair = cookie.split(';').next().unwrap().to_string();

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(&pair).unwrap());
        let again = authorizer.authorize(&uri, &headers).await.unwrap();
        assert_eq!(again.token.as_deref(), Some("minted"));
    }

    #[tokio::test]
    async fn test_failed_exchange_is_challenged() {
        let authorizer = BffAuthorizer::new(Fixed, "https://issuer.example/authorize");
        let mut headers = HeaderMap::new();
        headers.insert("authorization-exchange", exchange_header("bad"));
        let denied = authorizer
            .authorize(&"/mcp".parse().unwrap(), &headers)
            .await
            .unwrap_err();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    }
}
