//! OAuth 2.1 for MCP clients and servers.
//!
//! Clients wrap their HTTP sender in an [`AuthTransport`], which reacts to
//! `401` challenges by discovering the protected resource, obtaining a token
//! from a [`TokenStore`] or an [`AuthFlow`], and retrying once. Servers
//! describe what their operations demand with a [`Policy`].

mod bff;
mod challenge;
mod cookies;
pub mod discovery;
mod flow;
mod idtoken;
mod policy;
mod store;
mod transport;
mod types;

pub use bff::{
    BffAuthorizer, BffFlow, BrowserBffFlow, DEFAULT_EXCHANGE_HEADER, OAuthExchanger,
    SESSION_COOKIE, TokenExchanger,
};
pub use challenge::{Challenge, bearer_challenge};
pub use cookies::{FileCookieJar, StoredCookie};
pub use flow::{
    AuthFlow, AuthorizationGrant, BrowserFlow, CodePrompt, Opener, OutOfBandFlow, exchange_code,
    refresh_token,
};
pub use idtoken::verify_id_token;
pub use policy::{BearerAuthorizer, Policy, PolicyAuthorizer, bearer_token, resource_metadata_url};
pub use store::{FileStore, MemoryStore, TokenStore};
pub use transport::{AuthTransport, AuthTransportBuilder, DEFAULT_REJECTED_TOKEN_TTL};
pub use types::{
    Authorization, AuthorizationExchange, AuthorizationServerMetadata, ClientConfig,
    ClientConfigs, PROTECTED_RESOURCE_PATH, ProtectedResourceMetadata, Token, TokenCacheKey,
};
