//! `WWW-Authenticate` parsing and construction.

use std::collections::HashMap;

/// One parsed authentication challenge.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Challenge {
    pub scheme: String,
    /// Parameters keyed by lowercased name.
    pub params: HashMap<String, String>,
}

impl Challenge {
    /// Parse the first challenge of a `WWW-Authenticate` value. Parameter
    /// names are case-insensitive and values may be quoted.
    pub fn parse(header: &str) -> Option<Challenge> {
        let header = header.trim();
        if header.is_empty() {
            return None;
        }
        let (scheme, rest) = match header.find(char::is_whitespace) {
            Some(pos) => (&header[..pos], &header[pos..]),
            None => (header, ""),
        };
        if scheme.contains('=') {
            return None;
        }
        Some(Challenge {
            scheme: scheme.to_string(),
            params: parse_params(rest),
        })
    }

    pub fn is_bearer(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("bearer")
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn resource_metadata(&self) -> Option<&str> {
        self.param("resource_metadata")
    }

    pub fn authorization_uri(&self) -> Option<&str> {
        self.param("authorization_uri")
    }

    pub fn scopes(&self) -> Vec<String> {
        self.param("scope")
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default()
    }
}

fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();
    loop {
        while chars
            .peek()
            .is_some_and(|c| c.is_whitespace() || *c == ',')
        {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' || c.is_whitespace() {
                break;
            }
            name.push(c);
            chars.next();
        }
        if name.is_empty() {
            break;
        }
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek() != Some(&'=') {
            continue;
        }
        chars.next();
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' || c.is_whitespace() {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        params.insert(name.to_ascii_lowercase(), value);
    }
    params
}

/// Build a Bearer challenge pointing at the resource metadata document and,
/// for a backend-for-frontend, the authorization endpoint.
pub fn bearer_challenge(resource_metadata: &str, authorization_uri: Option<&str>) -> String {
    let mut value = format!("Bearer resource_metadata=\"{resource_metadata}\"");
    if let Some(uri) = authorization_uri {
        value.push_str(&format!(", authorization_uri=\"{uri}\""));
    }
    value
}
