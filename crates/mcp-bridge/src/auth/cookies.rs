//! A cookie jar that survives restarts.
//!
//! `reqwest`'s jar cannot be enumerated, so every save merges the cookies
//! seen in the latest `Set-Cookie` batch into the previously persisted
//! snapshot, dropping expired entries.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use http::HeaderValue;
use reqwest::cookie::{CookieStore, Jar};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::store::write_atomic;
use crate::error::Result;

/// One persisted cookie.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    /// For host-only cookies, the host of the request that set it.
    pub domain: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub host_only: bool,
}

impl StoredCookie {
    /// Parse a `Set-Cookie` value received from `url`.
    pub fn parse(header: &str, url: &Url) -> Option<StoredCookie> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.trim().split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let host = url.host_str()?.to_ascii_lowercase();
        let mut cookie = StoredCookie {
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            domain: host,
            path: default_path(url),
            expires: None,
            secure: false,
            http_only: false,
            host_only: true,
        };
        let mut max_age = None;
        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => {
                    cookie.domain = val.trim_start_matches('.').to_ascii_lowercase();
                    cookie.host_only = false;
                }
                "path" if val.starts_with('/') => cookie.path = val.to_string(),
                "expires" => {
                    cookie.expires = DateTime::parse_from_rfc2822(val)
                        .ok()
                        .map(|d| d.with_timezone(&Utc));
                }
                "max-age" => max_age = val.parse::<i64>().ok(),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }
        if let Some(secs) = max_age {
            cookie.expires = Some(Utc::now() + chrono::Duration::seconds(secs));
        }
        Some(cookie)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|e| e <= now)
    }

    fn same_identity(&self, other: &StoredCookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }

    /// Rebuild a `Set-Cookie` line and the URL to replay it against.
    fn replay(&self) -> Option<(String, Url)> {
        let scheme = if self.secure { "https" } else { "http" };
        let url = Url::parse(&format!("{scheme}://{}{}", self.domain, self.path)).ok()?;
        let mut line = format!("{}={}; Path={}", self.name, self.value, self.path);
        if !self.host_only {
            line.push_str(&format!("; Domain={}", self.domain));
        }
        if let Some(expires) = self.expires {
            line.push_str(&format!("; Expires={}", expires.to_rfc2822()));
        }
        if self.secure {
            line.push_str("; Secure");
        }
        if self.http_only {
            line.push_str("; HttpOnly");
        }
        Some((line, url))
    }
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => path[..pos].to_string(),
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CookieFile {
    #[serde(default)]
    cookies: Vec<StoredCookie>,
}

/// A `reqwest` cookie store persisted to a JSON file.
pub struct FileCookieJar {
    jar: Jar,
    path: PathBuf,
    snapshot: Mutex<Vec<StoredCookie>>,
}

impl FileCookieJar {
    /// Open `path`, replaying unexpired cookies into the jar.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cookies = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice::<CookieFile>(&data)?.cookies,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let now = Utc::now();
        let cookies: Vec<_> = cookies.into_iter().filter(|c| !c.is_expired(now)).collect();
        let jar = Jar::default();
        for cookie in &cookies {
            if let Some((line, url)) = cookie.replay() {
                jar.add_cookie_str(&line, &url);
            }
        }
        debug!("Loaded {} cookies from {}", cookies.len(), path.display());
        Ok(Self {
            jar,
            path,
            snapshot: Mutex::new(cookies),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The cookies that would be written on the next save.
    pub fn stored(&self) -> Vec<StoredCookie> {
        self.snapshot.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn merge(&self, latest: Vec<StoredCookie>) -> Result<()> {
        let Ok(mut snapshot) = self.snapshot.lock() else {
            return Ok(());
        };
        for cookie in latest {
            snapshot.retain(|c| !c.same_identity(&cookie));
            snapshot.push(cookie);
        }
        let now = Utc::now();
        snapshot.retain(|c| !c.is_expired(now));
        let file = CookieFile {
            cookies: snapshot.clone(),
        };
        write_atomic(&self.path, &serde_json::to_vec_pretty(&file)?)
    }
}

impl CookieStore for FileCookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let headers: Vec<HeaderValue> = cookie_headers.cloned().collect();
        let latest: Vec<StoredCookie> = headers
            .iter()
            .filter_map(|h| h.to_str().ok())
            .filter_map(|h| StoredCookie::parse(h, url))
            .collect();
        self.jar.set_cookies(&mut headers.iter(), url);
        if latest.is_empty() {
            return;
        }
        if let Err(e) = self.merge(latest) {
            warn!("Failed to persist cookies to {}: {}", self.path.display(), e);
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.jar.cookies(url)
    }
}
