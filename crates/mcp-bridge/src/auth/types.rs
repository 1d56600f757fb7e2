use std::{collections::HashMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Where a protected resource publishes its metadata (RFC 9728).
pub const PROTECTED_RESOURCE_PATH: &str = "/.well-known/oauth-protected-resource";

/// Tokens expiring within this window are treated as expired.
const EXPIRY_SKEW_SECS: i64 = 10;

/// OAuth 2.0 Protected Resource Metadata (RFC 9728).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProtectedResourceMetadata {
    pub resource: String,
    pub authorization_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_methods_supported: Option<Vec<String>>,
}

impl ProtectedResourceMetadata {
    pub fn new(resource: impl Into<String>, authorization_server: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            authorization_servers: vec![authorization_server.into()],
            ..Default::default()
        }
    }
}

/// OAuth 2.0 Authorization Server Metadata (RFC 8414).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub grant_types_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// An OAuth client registered with one issuer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Fixed loopback redirect; an ephemeral port is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
}

impl ClientConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }
}

/// A bearer token as cached by the token store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    /// Additional token response fields, such as `id_token`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extras: Map<String, Value>,
}

impl Token {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: "Bearer".into(),
            refresh_token: None,
            expiry: None,
            extras: Map::new(),
        }
    }

    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// A token without an expiry never expires.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) => now + chrono::Duration::seconds(EXPIRY_SKEW_SECS) < expiry,
            None => true,
        }
    }

    pub fn id_token(&self) -> Option<&str> {
        self.extras.get("id_token").and_then(Value::as_str)
    }
}

/// What a protected operation demands: the resource metadata pointing at
/// the authorization servers, and the scopes a token must carry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub protected_resource_metadata: ProtectedResourceMetadata,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    /// Present the verified ID token instead of the access token.
    #[serde(default)]
    pub use_id_token: bool,
}

impl Authorization {
    pub fn new(metadata: ProtectedResourceMetadata, scopes: Vec<String>) -> Self {
        Self {
            protected_resource_metadata: metadata,
            required_scopes: scopes,
            use_id_token: false,
        }
    }

    pub fn with_id_token(mut self) -> Self {
        self.use_id_token = true;
        self
    }
}

/// Identifies a cached token: the issuer plus the space separated scopes it
/// was granted for, sorted and deduplicated. Serialized as `issuer|scopes`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenCacheKey {
    pub issuer: String,
    pub scopes: String,
}

impl TokenCacheKey {
    pub fn new(issuer: impl Into<String>, scopes: &[String]) -> Self {
        let mut scopes: Vec<&str> = scopes.iter().map(String::as_str).collect();
        scopes.sort_unstable();
        scopes.dedup();
        Self {
            issuer: issuer.into(),
            scopes: scopes.join(" "),
        }
    }
}

impl fmt::Display for TokenCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.issuer, self.scopes)
    }
}

impl FromStr for TokenCacheKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (issuer, scopes) = s
            .rsplit_once('|')
            .ok_or_else(|| Error::InvalidConfiguration(format!("malformed token key: {s}")))?;
        Ok(Self {
            issuer: issuer.to_string(),
            scopes: scopes.to_string(),
        })
    }
}

/// The `Authorization-Exchange` payload a backend-for-frontend redeems for
/// a token on the caller's behalf.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationExchange {
    pub issuer: String,
    pub client_id: String,
    pub code: String,
    pub code_verifier: String,
    pub redirect_uri: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

impl AuthorizationExchange {
    /// Header encoding: base64url of the JSON document.
    pub fn encode(&self) -> Result<String> {
        use base64::Engine;
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(value: &str) -> Result<Self> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(value.trim())
            .map_err(|e| Error::AuthorizationFailed(format!("bad exchange header: {e}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Registered OAuth clients keyed by issuer.
pub type ClientConfigs = HashMap<String, ClientConfig>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_wire_shape() {
        let mut token = Token::bearer("at").with_refresh_token("rt");
        token.extras.insert("id_token".into(), Value::from("idt"));
        let v = serde_json::to_value(&token).unwrap();
        assert_eq!(v["accessToken"], "at");
        assert_eq!(v["tokenType"], "Bearer");
        assert_eq!(v["refreshToken"], "rt");
        assert_eq!(v["extras"]["id_token"], "idt");
        assert_eq!(token.id_token(), Some("idt"));
    }

    #[test]
    fn test_token_validity() {
        let now = Utc::now();
        assert!(Token::bearer("a").is_valid_at(now));
        let token = Token::bearer("a").with_expiry(now + chrono::Duration::minutes(5));
        assert!(token.is_valid_at(now));
        assert!(!token.is_valid_at(now + chrono::Duration::minutes(5)));
    }

    #[test]
    fn test_cache_key() {
        let key = TokenCacheKey::new("https://issuer.example", &["a".into(), "b".into()]);
        assert_eq!(key.to_string(), "https://issuer.example|a b");
        let parsed: TokenCacheKey = "https://issuer.example|".parse().unwrap();
        assert_eq!(parsed.issuer, "https://issuer.example");
        assert_eq!(parsed.scopes, "");
    }

    #[test]
    fn test_cache_key_ignores_scope_order() {
        let forward = TokenCacheKey::new("https://issuer.example", &["a".into(), "b".into()]);
        let reversed = TokenCacheKey::new(
            "https://issuer.example",
            &["b".into(), "a".into(), "b".into()],
        );
        assert_eq!(forward, reversed);
        assert_eq!(reversed.to_string(), "https://issuer.example|a b");
    }

    #[test]
    fn test_authorization_shape() {
        let auth = Authorization::new(
            ProtectedResourceMetadata::new("https://api.example", "https://issuer.example"),
            vec!["tools".into()],
        );
        let v = serde_json::to_value(&auth).unwrap();
        assert_eq!(
            v["protectedResourceMetadata"]["authorization_servers"][0],
            "https://issuer.example"
        );
        assert_eq!(v["requiredScopes"][0], "tools");
        assert_eq!(v["useIdToken"], false);
    }

    #[test]
    fn test_exchange_header() {
        let exchange = AuthorizationExchange {
            issuer: "https://issuer.example".into(),
            client_id: "cid".into(),
            code: "c0de".into(),
            code_verifier: "v".into(),
            redirect_uri: "http://127.0.0.1:1/callback".into(),
            scopes: vec![],
        };
        let header = exchange.encode().unwrap();
        assert_eq!(AuthorizationExchange::decode(&header).unwrap(), exchange);
    }
}
