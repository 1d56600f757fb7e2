//! Interactive token acquisition.
//!
//! [`AuthFlow`] is the seam between the round-tripper and the user: the
//! browser flow runs authorization code + PKCE against a loopback redirect,
//! the out-of-band flow asks the embedder for the code. Tests substitute a
//! flow that hands out canned tokens.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    Router,
    extract::{Query, State},
    response::Html,
    routing::get,
};
use chrono::Utc;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    ExtraTokenFields, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken, Scope,
    StandardRevocableToken, StandardTokenResponse, TokenResponse, TokenUrl,
    basic::{
        BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
        BasicTokenType,
    },
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use super::types::{AuthorizationServerMetadata, ClientConfig, Token};
use crate::error::{Error, Result};

const DEFAULT_CALLBACK_PATH: &str = "/callback";
const DEFAULT_FLOW_TIMEOUT: Duration = Duration::from_secs(300);
const OOB_REDIRECT: &str = "urn:ietf:wg:oauth:2.0:oob";

/// Obtains a token for `client` from the authorization server.
#[async_trait]
pub trait AuthFlow: Send + Sync {
    async fn token(
        &self,
        client: &ClientConfig,
        metadata: &AuthorizationServerMetadata,
        scopes: &[String],
    ) -> Result<Token>;
}

/// Token response fields beyond the standard ones, e.g. `id_token`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtraFields {
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl ExtraTokenFields for ExtraFields {}

type TokenResponseWithExtras = StandardTokenResponse<ExtraFields, BasicTokenType>;

type OAuthClient = oauth2::Client<
    BasicErrorResponse,
    TokenResponseWithExtras,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;

fn invalid(what: &str) -> impl FnOnce(url::ParseError) -> Error + '_ {
    move |e| Error::InvalidConfiguration(format!("invalid {what}: {e}"))
}

fn oauth_client(
    config: &ClientConfig,
    metadata: &AuthorizationServerMetadata,
    redirect_uri: Option<&str>,
) -> Result<OAuthClient> {
    let mut client = oauth2::Client::new(ClientId::new(config.client_id.clone()))
        .set_auth_uri(
            AuthUrl::new(metadata.authorization_endpoint.clone())
                .map_err(invalid("authorization endpoint"))?,
        )
        .set_token_uri(
            TokenUrl::new(metadata.token_endpoint.clone()).map_err(invalid("token endpoint"))?,
        );
    if let Some(secret) = &config.client_secret {
        client = client.set_client_secret(ClientSecret::new(secret.clone()));
    }
    if let Some(redirect) = redirect_uri {
        client = client.set_redirect_uri(
            RedirectUrl::new(redirect.to_string()).map_err(invalid("redirect URI"))?,
        );
    }
    Ok(client)
}

/// HTTP client for token endpoint calls. Redirects are never followed.
pub(crate) fn token_http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(30))
        .build()?)
}

fn token_from_response(response: &TokenResponseWithExtras) -> Token {
    let mut token = Token::bearer(response.access_token().secret().clone());
    token.refresh_token = response.refresh_token().map(|t| t.secret().clone());
    token.expiry = response
        .expires_in()
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| Utc::now() + d);
    token.extras = response.extra_fields().fields.clone();
    token
}

/// An authorization code together with the PKCE verifier and redirect it was
/// issued against.
#[derive(Debug, Clone)]
pub struct AuthorizationGrant {
    pub code: String,
    pub verifier: String,
    pub redirect_uri: String,
}

/// Redeem an authorization code at the token endpoint.
pub async fn exchange_code(
    http: &reqwest::Client,
    config: &ClientConfig,
    metadata: &AuthorizationServerMetadata,
    grant: AuthorizationGrant,
) -> Result<Token> {
    let client = oauth_client(config, metadata, Some(&grant.redirect_uri))?;
    let response = client
        .exchange_code(AuthorizationCode::new(grant.code))
        .set_pkce_verifier(PkceCodeVerifier::new(grant.verifier))
        .request_async(http)
        .await
        .map_err(|e| Error::AuthorizationFailed(format!("code exchange failed: {e}")))?;
    Ok(token_from_response(&response))
}

/// Trade a refresh token for a new token. The old refresh token is kept when
/// the server does not rotate it.
pub async fn refresh_token(
    http: &reqwest::Client,
    config: &ClientConfig,
    metadata: &AuthorizationServerMetadata,
    refresh: &str,
    scopes: &[String],
) -> Result<Token> {
    let client = oauth_client(config, metadata, None)?;
    let response = client
        .exchange_refresh_token(&RefreshToken::new(refresh.to_string()))
        .add_scopes(scopes.iter().cloned().map(Scope::new))
        .request_async(http)
        .await
        .map_err(|e| Error::AuthorizationFailed(format!("token refresh failed: {e}")))?;
    let mut token = token_from_response(&response);
    if token.refresh_token.is_none() {
        token.refresh_token = Some(refresh.to_string());
    }
    Ok(token)
}

/// Opens the authorization URL for the user.
pub type Opener = Arc<dyn Fn(&Url) -> Result<()> + Send + Sync>;

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

type CallbackSlot = Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>;

async fn callback(
    State(slot): State<CallbackSlot>,
    Query(params): Query<CallbackParams>,
) -> Html<&'static str> {
    if let Some(tx) = slot.lock().await.take() {
        let _ = tx.send(params);
    }
    Html("<html><body><p>Authorization complete. You can close this window.</p></body></html>")
}

/// Authorization code flow with PKCE, completed in the system browser.
#[derive(Clone)]
pub struct BrowserFlow {
    opener: Opener,
    timeout: Duration,
}

impl Default for BrowserFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl BrowserFlow {
    pub fn new() -> Self {
        Self {
            opener: Arc::new(|url: &Url| {
                info!("Opening browser for authorization: {}", url);
                webbrowser::open(url.as_str())
                    .map_err(|e| Error::AuthorizationFailed(format!("cannot open browser: {e}")))
            }),
            timeout: DEFAULT_FLOW_TIMEOUT,
        }
    }

    /// Replace the browser launch, e.g. to drive the flow from a test.
    pub fn with_opener(
        mut self,
        opener: impl Fn(&Url) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.opener = Arc::new(opener);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the user-facing half of the flow and return the authorization
    /// code without redeeming it.
    pub async fn authorize(
        &self,
        config: &ClientConfig,
        metadata: &AuthorizationServerMetadata,
        scopes: &[String],
    ) -> Result<AuthorizationGrant> {
        let (listener, redirect_uri, path) = bind_loopback(config.redirect_uri.as_deref()).await?;
        let client = oauth_client(config, metadata, Some(&redirect_uri))?;
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let (auth_url, csrf) = client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(scopes.iter().cloned().map(Scope::new))
            .set_pkce_challenge(challenge)
            .url();

        let (tx, rx) = oneshot::channel();
        let slot: CallbackSlot = Arc::new(Mutex::new(Some(tx)));
        let app = Router::new()
            .route(&path, get(callback))
            .with_state(slot);
        let shutdown = CancellationToken::new();
        let _teardown = shutdown.clone().drop_guard();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        });
        debug!("Waiting for authorization callback on {}", redirect_uri);

        (self.opener)(&auth_url)?;
        let params = tokio::time::timeout(self.timeout, rx)
            .await
            .map_err(|_| Error::AuthorizationFailed("timed out waiting for authorization".into()))?
            .map_err(|_| Error::AuthorizationFailed("authorization callback dropped".into()))?;

        if let Some(error) = params.error {
            let detail = params.error_description.unwrap_or_default();
            return Err(Error::AuthorizationFailed(format!("{error} {detail}").trim().to_string()));
        }
        if params.state.as_deref() != Some(csrf.secret().as_str()) {
            return Err(Error::AuthorizationFailed("state mismatch in callback".into()));
        }
        let code = params
            .code
            .ok_or_else(|| Error::AuthorizationFailed("callback carried no code".into()))?;
        Ok(AuthorizationGrant {
            code,
            verifier: verifier.secret().clone(),
            redirect_uri,
        })
    }
}

async fn bind_loopback(
    configured: Option<&str>,
) -> Result<(tokio::net::TcpListener, String, String)> {
    if let Some(uri) = configured {
        let url = Url::parse(uri)?;
        let port = url.port_or_known_default().unwrap_or(80);
        let host = url.host_str().unwrap_or("127.0.0.1");
        let listener = tokio::net::TcpListener::bind((host, port)).await?;
        let path = match url.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };
        return Ok((listener, uri.to_string(), path));
    }
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    Ok((
        listener,
        format!("http://127.0.0.1:{port}{DEFAULT_CALLBACK_PATH}"),
        DEFAULT_CALLBACK_PATH.to_string(),
    ))
}

#[async_trait]
impl AuthFlow for BrowserFlow {
    async fn token(
        &self,
        config: &ClientConfig,
        metadata: &AuthorizationServerMetadata,
        scopes: &[String],
    ) -> Result<Token> {
        let grant = self.authorize(config, metadata, scopes).await?;
        exchange_code(&token_http_client()?, config, metadata, grant).await
    }
}

/// Supplies the authorization code when no redirect can reach this process.
#[async_trait]
pub trait CodePrompt: Send + Sync {
    /// Show `authorization_url` to the user and return the code they paste.
    async fn code(&self, authorization_url: &Url) -> Result<String>;
}

/// Authorization code + PKCE with an out-of-band redirect.
pub struct OutOfBandFlow {
    prompt: Arc<dyn CodePrompt>,
    redirect_uri: String,
}

impl OutOfBandFlow {
    pub fn new(prompt: impl CodePrompt + 'static) -> Self {
        Self {
            prompt: Arc::new(prompt),
            redirect_uri: OOB_REDIRECT.into(),
        }
    }

    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = redirect_uri.into();
        self
    }
}

#[async_trait]
impl AuthFlow for OutOfBandFlow {
    async fn token(
        &self,
        config: &ClientConfig,
        metadata: &AuthorizationServerMetadata,
        scopes: &[String],
    ) -> Result<Token> {
        let client = oauth_client(config, metadata, Some(&self.redirect_uri))?;
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let (auth_url, _csrf) = client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(scopes.iter().cloned().map(Scope::new))
            .set_pkce_challenge(challenge)
            .url();
        let code = self.prompt.code(&auth_url).await?;
        let grant = AuthorizationGrant {
            code: code.trim().to_string(),
            verifier: verifier.secret().clone(),
            redirect_uri: self.redirect_uri.clone(),
        };
        exchange_code(&token_http_client()?, config, metadata, grant).await
    }
}
