//! OIDC login: code exchange, ID token verification, claim extraction.
//!
//! The flow lands here at the callback stage: the client brings an
//! authorization code, we exchange it at the provider's token endpoint,
//! verify the returned ID token against the provider's JWKS, and extract the
//! `email` and `groups` claims. Any failure in the chain collapses to a
//! generic 401 for the client; the cause goes to the log.

use std::collections::HashMap;
use std::time::Duration;

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::models::Provider;

/// Timeout for every call to a provider endpoint.
const PROVIDER_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity asserted by a verified ID token.
#[derive(Debug, Clone)]
pub struct OidcIdentity {
    pub email: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Discovery {
    issuer: String,
    token_endpoint: String,
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    id_token: String,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<JwkKey>,
}

#[derive(Debug, Deserialize)]
struct JwkKey {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Option<String>,
}

/// ID token claims. Issuer, audience, and expiry are checked by
/// `jsonwebtoken` during decode.
#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    groups: GroupsClaim,
    #[serde(flatten)]
    #[allow(dead_code)]
    extra: HashMap<String, serde_json::Value>,
}

/// Groups claim may be a single value or an array depending on the provider.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
enum GroupsClaim {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl GroupsClaim {
    fn into_vec(self) -> Vec<String> {
        match self {
            GroupsClaim::None => vec![],
            GroupsClaim::Single(s) => vec![s],
            GroupsClaim::Multiple(v) => v,
        }
    }
}

/// HTTP client for OIDC provider endpoints.
pub struct OidcClient {
    http: reqwest::Client,
}

impl Default for OidcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OidcClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_HTTP_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        OidcClient { http }
    }

    /// Exchange an authorization code and verify the resulting ID token.
    pub async fn login(
        &self,
        provider: &Provider,
        code: &str,
        redirect_url: &str,
    ) -> Result<OidcIdentity> {
        let issuer = provider
            .issuer_url
            .as_deref()
            .ok_or_else(|| Error::internal("provider has no issuer URL"))?;
        let client_id = provider
            .client_id
            .as_deref()
            .ok_or_else(|| Error::internal("provider has no client id"))?;

        let discovery = self.discover(issuer).await?;
        if discovery.issuer != issuer {
            warn!(expected = %issuer, actual = %discovery.issuer, "issuer mismatch");
            return Err(Error::Unauthorized);
        }

        let id_token = self
            .exchange_code(&discovery.token_endpoint, provider, code, redirect_url)
            .await?;
        self.verify_id_token(&discovery.jwks_uri, issuer, client_id, &id_token)
            .await
    }

    async fn discover(&self, issuer: &str) -> Result<Discovery> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        debug!(url = %url, "fetching OIDC discovery document");
        let discovery = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                warn!(error = %e, "OIDC discovery fetch failed");
                Error::Unauthorized
            })?
            .json::<Discovery>()
            .await
            .map_err(|e| {
                warn!(error = %e, "invalid OIDC discovery document");
                Error::Unauthorized
            })?;
        Ok(discovery)
    }

    async fn exchange_code(
        &self,
        token_endpoint: &str,
        provider: &Provider,
        code: &str,
        redirect_url: &str,
    ) -> Result<String> {
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_url.to_string()),
        ];
        if let Some(client_id) = &provider.client_id {
            form.push(("client_id", client_id.clone()));
        }
        if let Some(client_secret) = &provider.client_secret {
            form.push(("client_secret", client_secret.clone()));
        }

        let response = self
            .http
            .post(token_endpoint)
            .form(&form)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                warn!(error = %e, "OIDC code exchange failed");
                Error::Unauthorized
            })?
            .json::<TokenEndpointResponse>()
            .await
            .map_err(|e| {
                warn!(error = %e, "invalid token endpoint response");
                Error::Unauthorized
            })?;
        Ok(response.id_token)
    }

    async fn verify_id_token(
        &self,
        jwks_uri: &str,
        issuer: &str,
        client_id: &str,
        id_token: &str,
    ) -> Result<OidcIdentity> {
        let header = decode_header(id_token).map_err(|e| {
            debug!(error = %e, "malformed ID token header");
            Error::Unauthorized
        })?;
        if !matches!(
            header.alg,
            Algorithm::RS256
                | Algorithm::RS384
                | Algorithm::RS512
                | Algorithm::ES256
                | Algorithm::ES384
        ) {
            warn!(alg = ?header.alg, "unsupported ID token algorithm");
            return Err(Error::Unauthorized);
        }

        let jwks = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                warn!(error = %e, "JWKS fetch failed");
                Error::Unauthorized
            })?
            .json::<JwksDocument>()
            .await
            .map_err(|e| {
                warn!(error = %e, "invalid JWKS document");
                Error::Unauthorized
            })?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[client_id]);

        // Prefer the key named by kid, but try every key: providers rotate
        // by key-set union just like the registry does.
        let mut candidates: Vec<&JwkKey> = jwks
            .keys
            .iter()
            .filter(|k| header.kid.is_none() || k.kid == header.kid)
            .collect();
        if candidates.is_empty() {
            candidates = jwks.keys.iter().collect();
        }

        for jwk in candidates {
            let Some(key) = decoding_key(jwk) else {
                continue;
            };
            if let Ok(data) = decode::<IdTokenClaims>(id_token, &key, &validation) {
                let claims = data.claims;
                let email = claims.email.ok_or_else(|| {
                    debug!("ID token is missing the email claim");
                    Error::Unauthorized
                })?;
                return Ok(OidcIdentity {
                    email,
                    groups: claims.groups.into_vec(),
                });
            }
        }

        debug!("ID token did not verify against any published key");
        Err(Error::Unauthorized)
    }
}

fn decoding_key(jwk: &JwkKey) -> Option<DecodingKey> {
    match jwk.kty.as_str() {
        "RSA" => {
            let (n, e) = (jwk.n.as_deref()?, jwk.e.as_deref()?);
            DecodingKey::from_rsa_components(n, e).ok()
        }
        "EC" => {
            let (x, y) = (jwk.x.as_deref()?, jwk.y.as_deref()?);
            DecodingKey::from_ec_components(x, y).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_claim_accepts_all_shapes() {
        let single: GroupsClaim = serde_json::from_str("\"devs\"").unwrap();
        assert_eq!(single.into_vec(), vec!["devs"]);

        let multiple: GroupsClaim = serde_json::from_str("[\"devs\", \"ops\"]").unwrap();
        assert_eq!(multiple.into_vec(), vec!["devs", "ops"]);

        let claims: IdTokenClaims =
            serde_json::from_str(r#"{"email": "a@b.com", "iss": "x"}"#).unwrap();
        assert!(claims.groups.into_vec().is_empty());
    }

    #[test]
    fn decoding_key_ignores_unusable_keys() {
        let jwk = JwkKey {
            kty: "oct".into(),
            kid: None,
            n: None,
            e: None,
            x: None,
            y: None,
        };
        assert!(decoding_key(&jwk).is_none());

        let missing_component = JwkKey {
            kty: "RSA".into(),
            kid: Some("k".into()),
            n: Some("abc".into()),
            e: None,
            x: None,
            y: None,
        };
        assert!(decoding_key(&missing_component).is_none());
    }
}
