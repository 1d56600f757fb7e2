//! Metadata discovery: protected resources (RFC 9728), authorization
//! servers (RFC 8414 and OpenID Connect) and their signing keys.

use jsonwebtoken::jwk::JwkSet;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::types::{AuthorizationServerMetadata, PROTECTED_RESOURCE_PATH, ProtectedResourceMetadata};
use crate::error::{Error, Result};

async fn fetch_json<T: DeserializeOwned>(client: &reqwest::Client, url: &Url) -> Result<T> {
    let response = client
        .get(url.clone())
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(Error::AuthorizationFailed(format!(
            "GET {url} returned {}",
            response.status()
        )));
    }
    Ok(response.json().await?)
}

/// Well-known locations of the metadata for `resource`: the path-suffixed
/// form first, then the origin root.
pub fn protected_resource_metadata_urls(resource: &Url) -> Vec<Url> {
    let mut urls = Vec::new();
    let path = resource.path().trim_end_matches('/');
    if !path.is_empty() {
        let mut url = resource.clone();
        url.set_path(&format!("{PROTECTED_RESOURCE_PATH}{path}"));
        url.set_query(None);
        urls.push(url);
    }
    let mut root = resource.clone();
    root.set_path(PROTECTED_RESOURCE_PATH);
    root.set_query(None);
    urls.push(root);
    urls
}

pub async fn fetch_protected_resource_metadata(
    client: &reqwest::Client,
    url: &Url,
) -> Result<ProtectedResourceMetadata> {
    let metadata: ProtectedResourceMetadata = fetch_json(client, url).await?;
    if metadata.authorization_servers.is_empty() {
        return Err(Error::AuthorizationFailed(format!(
            "protected resource metadata at {url} names no authorization servers"
        )));
    }
    Ok(metadata)
}

/// Resolve the metadata for a resource, preferring the URL a challenge
/// pointed at and falling back to the well-known locations.
pub async fn discover_protected_resource(
    client: &reqwest::Client,
    resource: &Url,
    hint: Option<&str>,
) -> Result<ProtectedResourceMetadata> {
    let mut candidates = Vec::new();
    if let Some(hint) = hint {
        candidates.push(resource.join(hint)?);
    }
    candidates.extend(protected_resource_metadata_urls(resource));

    let mut last = None;
    for url in candidates {
        match fetch_protected_resource_metadata(client, &url).await {
            Ok(metadata) => return Ok(metadata),
            Err(e) => {
                debug!("No protected resource metadata at {}: {}", url, e);
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| {
        Error::AuthorizationFailed(format!("no protected resource metadata for {resource}"))
    }))
}

/// Candidate metadata URLs for `issuer`, in lookup order.
pub fn authorization_server_metadata_urls(issuer: &Url) -> Vec<Url> {
    let path = issuer.path().trim_end_matches('/');
    let mut urls = Vec::new();
    for well_known in [
        "/.well-known/oauth-authorization-server",
        "/.well-known/openid-configuration",
    ] {
        let mut url = issuer.clone();
        url.set_path(&format!("{well_known}{path}"));
        url.set_query(None);
        urls.push(url);
    }
    if !path.is_empty() {
        let mut url = issuer.clone();
        url.set_path(&format!("{path}/.well-known/openid-configuration"));
        url.set_query(None);
        urls.push(url);
    }
    urls
}

pub async fn discover_authorization_server(
    client: &reqwest::Client,
    issuer: &str,
) -> Result<AuthorizationServerMetadata> {
    let issuer_url = Url::parse(issuer)?;
    let mut last = None;
    for url in authorization_server_metadata_urls(&issuer_url) {
        match fetch_json::<AuthorizationServerMetadata>(client, &url).await {
            Ok(metadata) => {
                debug!("Discovered authorization server {} at {}", issuer, url);
                return Ok(metadata);
            }
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| {
        Error::AuthorizationFailed(format!("no metadata for issuer {issuer}"))
    }))
}

pub async fn fetch_jwks(client: &reqwest::Client, uri: &str) -> Result<JwkSet> {
    fetch_json(client, &Url::parse(uri)?).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prm_candidates() {
        let resource = Url::parse("https://api.example/mcp?x=1").unwrap();
        let urls = protected_resource_metadata_urls(&resource);
        assert_eq!(
            urls.iter().map(Url::as_str).collect::<Vec<_>>(),
            vec![
                "https://api.example/.well-known/oauth-protected-resource/mcp",
                "https://api.example/.well-known/oauth-protected-resource",
            ]
        );
    }

    #[test]
    fn test_issuer_candidates() {
        let root = authorization_server_metadata_urls(&Url::parse("https://as.example").unwrap());
        assert_eq!(root.len(), 2);
        assert_eq!(
            root[0].as_str(),
            "https://as.example/.well-known/oauth-authorization-server"
        );

        let tenant =
            authorization_server_metadata_urls(&Url::parse("https://as.example/tenant").unwrap());
        assert_eq!(
            tenant.iter().map(Url::as_str).collect::<Vec<_>>(),
            vec![
                "https://as.example/.well-known/oauth-authorization-server/tenant",
                "https://as.example/.well-known/openid-configuration/tenant",
                "https://as.example/tenant/.well-known/openid-configuration",
            ]
        );
    }
}
