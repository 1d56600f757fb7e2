//! ID token verification against an issuer's published keys.

use jsonwebtoken::{DecodingKey, Validation, decode, decode_header, jwk::JwkSet};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Verify `token`'s signature with `keys`, and check its issuer, expiry and,
/// when given, audience. Returns the claims.
pub fn verify_id_token(
    token: &str,
    keys: &JwkSet,
    issuer: &str,
    audience: Option<&str>,
) -> Result<Map<String, Value>> {
    let header = decode_header(token)
        .map_err(|e| Error::AuthorizationFailed(format!("malformed id token: {e}")))?;
    let jwk = match &header.kid {
        Some(kid) => keys.find(kid),
        None => keys.keys.first(),
    }
    .ok_or_else(|| Error::AuthorizationFailed("no matching key for id token".into()))?;
    let key = DecodingKey::from_jwk(jwk)
        .map_err(|e| Error::AuthorizationFailed(format!("unusable signing key: {e}")))?;

    let mut validation = Validation::new(header.alg);
    validation.set_issuer(&[issuer]);
    validation.validate_exp = true;
    match audience {
        Some(aud) => validation.set_audience(&[aud]),
        None => validation.validate_aud = false,
    }

    let data = decode::<Map<String, Value>>(token, &key, &validation)
        .map_err(|e| Error::AuthorizationFailed(format!("id token rejected: {e}")))?;
    Ok(data.claims)
}
