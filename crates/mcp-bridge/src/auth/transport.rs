//! The authorizing HTTP round-tripper.
//!
//! [`AuthTransport`] wraps another [`HttpSender`]. A `401` answer triggers
//! protected resource discovery, token acquisition (cache, refresh, then an
//! interactive [`AuthFlow`]) and exactly one retry carrying the token.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use http::{HeaderName, HeaderValue, StatusCode, header};
use rand::seq::SliceRandom;
use reqwest::cookie::CookieStore;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    bff::{BffFlow, DEFAULT_EXCHANGE_HEADER},
    challenge::Challenge,
    discovery::{discover_authorization_server, discover_protected_resource, fetch_jwks},
    flow::{AuthFlow, BrowserFlow, refresh_token, token_http_client},
    idtoken::verify_id_token,
    policy::bearer_token,
    store::{MemoryStore, TokenStore},
    types::{
        Authorization, AuthorizationServerMetadata, ClientConfig, ProtectedResourceMetadata,
        Token, TokenCacheKey,
    },
};
use crate::{
    client::TokenProvider,
    error::{Error, Result},
    transport::HttpSender,
};

pub const DEFAULT_REJECTED_TOKEN_TTL: Duration = Duration::from_secs(60);

/// What gets attached to the retried request.
enum Credential {
    Bearer(String),
    Exchange(String),
}

/// A token acquired for one issuer, with what is needed to check it.
struct Acquired {
    issuer: String,
    key: TokenCacheKey,
    token: Token,
    metadata: AuthorizationServerMetadata,
    client: ClientConfig,
}

/// Which cached token serves an origin once one has been acquired.
#[derive(Clone)]
struct Binding {
    key: TokenCacheKey,
    use_id_token: bool,
}

pub struct AuthTransportBuilder {
    inner: Option<Arc<dyn HttpSender>>,
    store: Arc<dyn TokenStore>,
    flow: Arc<dyn AuthFlow>,
    bff: Option<Arc<dyn BffFlow>>,
    bff_header: String,
    cookies: Option<Arc<dyn CookieStore>>,
    scopes: Vec<String>,
    use_id_token: bool,
    rejected_ttl: Duration,
}

impl AuthTransportBuilder {
    /// The sender requests go through. Defaults to a plain `reqwest` client.
    pub fn with_inner(mut self, inner: Arc<dyn HttpSender>) -> Self {
        self.inner = Some(inner);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_flow(mut self, flow: Arc<dyn AuthFlow>) -> Self {
        self.flow = flow;
        self
    }

    /// Answer challenges through a backend-for-frontend exchange instead of
    /// redeeming codes locally.
    pub fn with_bff(mut self, flow: Arc<dyn BffFlow>) -> Self {
        self.bff = Some(flow);
        self
    }

    pub fn with_bff_header(mut self, name: impl Into<String>) -> Self {
        self.bff_header = name.into();
        self
    }

    pub fn with_cookies(mut self, jar: Arc<dyn CookieStore>) -> Self {
        self.cookies = Some(jar);
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Present verified ID tokens instead of access tokens.
    pub fn with_id_token(mut self, use_id_token: bool) -> Self {
        self.use_id_token = use_id_token;
        self
    }

    pub fn with_rejected_token_ttl(mut self, ttl: Duration) -> Self {
        self.rejected_ttl = ttl;
        self
    }

    pub fn build(self) -> Result<AuthTransport> {
        let inner = match self.inner {
            Some(inner) => inner,
            None => Arc::new(reqwest::Client::new()),
        };
        let bff_header = HeaderName::from_bytes(self.bff_header.to_ascii_lowercase().as_bytes())
            .map_err(|e| Error::InvalidConfiguration(format!("invalid exchange header: {e}")))?;
        Ok(AuthTransport {
            inner,
            discovery: reqwest::Client::new(),
            token_http: token_http_client()?,
            store: self.store,
            flow: self.flow,
            bff: self.bff,
            bff_header,
            cookies: self.cookies,
            scopes: self.scopes,
            use_id_token: self.use_id_token,
            rejected: DashMap::new(),
            rejected_ttl: self.rejected_ttl,
            bindings: DashMap::new(),
            acquire: Mutex::new(()),
        })
    }
}

/// Authorizing [`HttpSender`]; also answers -32001 challenges as a
/// [`TokenProvider`].
pub struct AuthTransport {
    inner: Arc<dyn HttpSender>,
    discovery: reqwest::Client,
    token_http: reqwest::Client,
    store: Arc<dyn TokenStore>,
    flow: Arc<dyn AuthFlow>,
    bff: Option<Arc<dyn BffFlow>>,
    bff_header: HeaderName,
    cookies: Option<Arc<dyn CookieStore>>,
    scopes: Vec<String>,
    use_id_token: bool,
    rejected: DashMap<String, Instant>,
    rejected_ttl: Duration,
    bindings: DashMap<String, Binding>,
    acquire: Mutex<()>,
}

fn set_bearer(request: &mut reqwest::Request, token: &str) -> Result<()> {
    let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| Error::AuthorizationFailed("token is not a valid header value".into()))?;
    request.headers_mut().insert(header::AUTHORIZATION, value);
    Ok(())
}

fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

impl AuthTransport {
    pub fn builder() -> AuthTransportBuilder {
        AuthTransportBuilder {
            inner: None,
            store: Arc::new(MemoryStore::new()),
            flow: Arc::new(BrowserFlow::new()),
            bff: None,
            bff_header: DEFAULT_EXCHANGE_HEADER.into(),
            cookies: None,
            scopes: Vec::new(),
            use_id_token: false,
            rejected_ttl: DEFAULT_REJECTED_TOKEN_TTL,
        }
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    fn is_rejected(&self, token: &str) -> bool {
        let Some(at) = self.rejected.get(token).map(|e| *e.value()) else {
            return false;
        };
        if at.elapsed() < self.rejected_ttl {
            true
        } else {
            self.rejected.remove(token);
            false
        }
    }

    fn reject(&self, token: String) {
        self.rejected.insert(token, Instant::now());
    }

    async fn send(&self, mut request: reqwest::Request) -> Result<reqwest::Response> {
        if let Some(jar) = &self.cookies {
            if let Some(cookies) = jar.cookies(request.url()) {
                request.headers_mut().insert(header::COOKIE, cookies);
            }
        }
        let url = request.url().clone();
        let response = self.inner.execute(request).await?;
        if let Some(jar) = &self.cookies {
            let mut set_cookies = response.headers().get_all(header::SET_COOKIE).iter();
            jar.set_cookies(&mut set_cookies, &url);
        }
        Ok(response)
    }

    fn credential_of(token: &Token, use_id_token: bool) -> Option<String> {
        if use_id_token {
            token.id_token().map(String::from)
        } else {
            Some(token.access_token.clone())
        }
    }

    /// The credential previously acquired for `url`'s origin, when still
    /// usable.
    async fn bound_credential(&self, url: &Url) -> Option<String> {
        let binding = self.bindings.get(&origin_of(url))?.value().clone();
        let token = self.store.token(&binding.key).await?;
        if !token.is_valid() {
            return None;
        }
        Self::credential_of(&token, binding.use_id_token).filter(|c| !self.is_rejected(c))
    }

    async fn metadata(&self, issuer: &str) -> Result<AuthorizationServerMetadata> {
        if let Some(metadata) = self.store.authorization_server_metadata(issuer).await {
            return Ok(metadata);
        }
        let metadata = discover_authorization_server(&self.discovery, issuer).await?;
        self.store
            .add_authorization_server_metadata(issuer, metadata.clone())
            .await?;
        Ok(metadata)
    }

    /// Cached token, else refreshed token, else a fresh interactive one.
    async fn acquire_token(
        &self,
        resource: &ProtectedResourceMetadata,
        scopes: &[String],
        use_id_token: bool,
    ) -> Result<Acquired> {
        let issuer = resource
            .authorization_servers
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| Error::AuthorizationFailed("no authorization server".into()))?;
        let metadata = self.metadata(&issuer).await?;
        let client = self.store.client_config(&issuer).await.ok_or_else(|| {
            Error::InvalidConfiguration(format!("no OAuth client configured for issuer {issuer}"))
        })?;
        let key = TokenCacheKey::new(issuer.clone(), scopes);

        if let Some(cached) = self.store.token(&key).await {
            let usable = Self::credential_of(&cached, use_id_token)
                .is_some_and(|credential| !self.is_rejected(&credential));
            if cached.is_valid() && usable {
                debug!("Using cached token for {}", key);
                return Ok(Acquired {
                    issuer,
                    key,
                    token: cached,
                    metadata,
                    client,
                });
            }
            let refreshed = match &cached.refresh_token {
                Some(refresh) => {
                    refresh_token(&self.token_http, &client, &metadata, refresh, scopes).await
                }
                None => Err(Error::AuthorizationFailed("no refresh token".into())),
            };
            match refreshed {
                Ok(token) => {
                    info!("Refreshed token for {}", key);
                    self.store.add_token(&key, token.clone()).await?;
                    return Ok(Acquired {
                        issuer,
                        key,
                        token,
                        metadata,
                        client,
                    });
                }
                Err(e) => {
                    debug!("Discarding token for {}: {}", key, e);
                    self.store.remove_token(&key).await?;
                }
            }
        }

        info!("Starting interactive authorization with {}", issuer);
        let token = self.flow.token(&client, &metadata, scopes).await?;
        self.store.add_token(&key, token.clone()).await?;
        Ok(Acquired {
            issuer,
            key,
            token,
            metadata,
            client,
        })
    }

    async fn issuer_keys(
        &self,
        acquired: &Acquired,
        resource: &ProtectedResourceMetadata,
    ) -> Result<jsonwebtoken::jwk::JwkSet> {
        if let Some(keys) = self.store.issuer_public_keys(&acquired.issuer).await {
            return Ok(keys);
        }
        let uri = acquired
            .metadata
            .jwks_uri
            .as_deref()
            .or(resource.jwks_uri.as_deref())
            .ok_or_else(|| {
                Error::AuthorizationFailed(format!("issuer {} publishes no keys", acquired.issuer))
            })?;
        let keys = fetch_jwks(&self.discovery, uri).await?;
        self.store
            .add_issuer_public_keys(&acquired.issuer, keys.clone())
            .await?;
        Ok(keys)
    }

    /// The string to present: the access token, or the verified ID token.
    async fn credential(
        &self,
        acquired: &Acquired,
        resource: &ProtectedResourceMetadata,
        use_id_token: bool,
    ) -> Result<String> {
        if !use_id_token {
            return Ok(acquired.token.access_token.clone());
        }
        let id_token = acquired.token.id_token().ok_or_else(|| {
            Error::AuthorizationFailed("token response carried no id_token".into())
        })?;
        let keys = self.issuer_keys(acquired, resource).await?;
        verify_id_token(
            id_token,
            &keys,
            &acquired.metadata.issuer,
            Some(&acquired.client.client_id),
        )?;
        Ok(id_token.to_string())
    }

    /// A valid cached token from any of the resource's authorization servers.
    async fn stored_for(&self, resource: &ProtectedResourceMetadata) -> Option<String> {
        self.store
            .tokens()
            .await
            .into_iter()
            .filter(|(key, _)| resource.authorization_servers.contains(&key.issuer))
            .filter(|(_, token)| token.is_valid())
            .filter_map(|(_, token)| Self::credential_of(&token, self.use_id_token))
            .find(|credential| !self.is_rejected(credential))
    }

    async fn authorize(&self, url: &Url, challenge: &Challenge) -> Result<Credential> {
        let _guard = self.acquire.lock().await;
        // Another request may have completed a flow while this one waited.
        if let Some(credential) = self.bound_credential(url).await {
            return Ok(Credential::Bearer(credential));
        }

        let resource =
            discover_protected_resource(&self.discovery, url, challenge.resource_metadata()).await;

        if let Some(bff) = &self.bff {
            let resource = resource.ok();
            if let Some(resource) = &resource {
                if let Some(credential) = self.stored_for(resource).await {
                    return Ok(Credential::Bearer(credential));
                }
            }
            let value = bff
                .exchange(challenge.authorization_uri(), resource.as_ref(), &self.scopes)
                .await?;
            return Ok(Credential::Exchange(value));
        }

        let resource = resource?;
        let scopes = if self.scopes.is_empty() {
            challenge.scopes()
        } else {
            self.scopes.clone()
        };
        let acquired = self
            .acquire_token(&resource, &scopes, self.use_id_token)
            .await?;
        let credential = self.credential(&acquired, &resource, self.use_id_token).await?;
        self.bindings.insert(
            origin_of(url),
            Binding {
                key: acquired.key.clone(),
                use_id_token: self.use_id_token,
            },
        );
        Ok(Credential::Bearer(credential))
    }
}

#[async_trait]
impl HttpSender for AuthTransport {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        let url = request.url().clone();
        let mut retry = request
            .try_clone()
            .ok_or_else(|| Error::Transport("request body cannot be replayed".into()))?;
        let mut first = request;

        if let Some(explicit) = bearer_token(first.headers()) {
            if self.is_rejected(&explicit) {
                debug!("Dropping recently rejected token for {}", url);
                first.headers_mut().remove(header::AUTHORIZATION);
            }
        }
        if !first.headers().contains_key(header::AUTHORIZATION) {
            if let Some(credential) = self.bound_credential(&url).await {
                set_bearer(&mut first, &credential)?;
            }
        }
        let sent = bearer_token(first.headers());

        let response = self.send(first).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        if let Some(token) = sent {
            self.reject(token);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(Challenge::parse)
            .unwrap_or_default();
        debug!("{} answered 401, challenge {:?}", url, challenge);

        match self.authorize(&url, &challenge).await {
            Ok(Credential::Bearer(token)) => set_bearer(&mut retry, &token)?,
            Ok(Credential::Exchange(value)) => {
                retry.headers_mut().remove(header::AUTHORIZATION);
                let value = HeaderValue::from_str(&value).map_err(|_| {
                    Error::AuthorizationFailed("exchange value is not a valid header".into())
                })?;
                retry.headers_mut().insert(self.bff_header.clone(), value);
            }
            Err(e) => {
                warn!("Authorization for {} failed: {}", url, e);
                return Err(e);
            }
        }
        self.send(retry).await
    }
}

#[async_trait]
impl TokenProvider for AuthTransport {
    async fn token_for(&self, authorization: &Authorization) -> Result<String> {
        let _guard = self.acquire.lock().await;
        let resource = &authorization.protected_resource_metadata;
        let use_id_token = authorization.use_id_token || self.use_id_token;
        let acquired = self
            .acquire_token(resource, &authorization.required_scopes, use_id_token)
            .await?;
        self.credential(&acquired, resource, use_id_token).await
    }
}
