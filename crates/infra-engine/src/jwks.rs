//! JWK caching and end-user token verification.
//!
//! The proxy validates every inbound JWT against the registry's published
//! key set. Keys are cached for five minutes behind an async mutex so only
//! one task refreshes at a time; a fetch failure fails the request closed.
//! Verification tries every published key: the registry rotates by key-set
//! union, so the newest key is not necessarily the signing key.

use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use infra_common::api::{JsonWebKey, JsonWebKeySet};
use infra_common::JWT_ISSUER;

use crate::client::RegistryClient;
use crate::error::{Error, Result};

/// How long fetched keys are served before a refresh.
pub const JWK_CACHE_REFRESH: Duration = Duration::from_secs(5 * 60);

/// Claims the proxy needs from a verified token.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    #[allow(dead_code)]
    pub iss: String,
    pub sub: String,
    pub email: String,
}

struct CachedKeys {
    keys: Vec<JsonWebKey>,
    fetched_at: Instant,
}

/// Mutex-guarded JWK cache in front of the registry.
pub struct JwkCache {
    client: Arc<RegistryClient>,
    cached: Mutex<Option<CachedKeys>>,
}

impl JwkCache {
    pub fn new(client: Arc<RegistryClient>) -> Self {
        JwkCache {
            client,
            cached: Mutex::new(None),
        }
    }

    /// Current key set, refreshed from the registry when stale. Holding the
    /// lock across the fetch keeps concurrent refreshers to one.
    async fn keys(&self) -> Result<Vec<JsonWebKey>> {
        let mut cached = self.cached.lock().await;
        if let Some(existing) = cached.as_ref() {
            if existing.fetched_at.elapsed() < JWK_CACHE_REFRESH {
                return Ok(existing.keys.clone());
            }
        }

        let set: JsonWebKeySet = self.client.fetch_jwks().await.map_err(|e| {
            warn!(error = %e, "JWKS refresh failed");
            // Fail closed: no keys means no verified requests.
            Error::unauthorized("signing keys unavailable")
        })?;
        if set.keys.is_empty() {
            return Err(Error::unauthorized("registry published no signing keys"));
        }
        debug!(key_count = set.keys.len(), "refreshed JWKS");
        let keys = set.keys.clone();
        *cached = Some(CachedKeys {
            keys: set.keys,
            fetched_at: Instant::now(),
        });
        Ok(keys)
    }

    /// Verify an end-user token and return its claims.
    pub async fn verify(&self, token: &str) -> Result<Claims> {
        let keys = self.keys().await?;
        verify_with_keys(token, &keys)
    }
}

/// Verify a token against a set of published keys, trying each in turn.
///
/// An expired token that carries a valid signature is reported as
/// [`Error::Expired`]; everything else collapses to unauthorized.
pub fn verify_with_keys(token: &str, keys: &[JsonWebKey]) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::ES256);
    validation.set_issuer(&[JWT_ISSUER]);
    validation.set_required_spec_claims(&["exp", "nbf", "iss"]);
    validation.validate_aud = false;
    validation.validate_nbf = true;

    let mut expired = false;
    for key in keys {
        let Ok(decoding) = DecodingKey::from_ec_components(&key.x, &key.y) else {
            continue;
        };
        match decode::<Claims>(token, &decoding, &validation) {
            Ok(data) => return Ok(data.claims),
            Err(err) if matches!(err.kind(), ErrorKind::ExpiredSignature) => {
                // Signature checked out with this key; only the deadline
                // failed.
                expired = true;
            }
            Err(_) => continue,
        }
    }
    if expired {
        Err(Error::Expired)
    } else {
        Err(Error::unauthorized("token did not verify against any key"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_lc_rs::rand::SystemRandom;
    use aws_lc_rs::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        iss: String,
        sub: String,
        email: String,
        exp: i64,
        nbf: i64,
    }

    struct TestKey {
        encoding: EncodingKey,
        public: JsonWebKey,
    }

    fn generate_key(kid: &str) -> TestKey {
        let rng = SystemRandom::new();
        let document =
            EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
        let pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, document.as_ref()).unwrap();
        let point = pair.public_key().as_ref();
        TestKey {
            encoding: EncodingKey::from_ec_der(document.as_ref()),
            public: JsonWebKey {
                kty: "EC".into(),
                crv: "P-256".into(),
                x: URL_SAFE_NO_PAD.encode(&point[1..33]),
                y: URL_SAFE_NO_PAD.encode(&point[33..65]),
                kid: kid.into(),
                alg: "ES256".into(),
                use_: "sig".into(),
            },
        }
    }

    fn sign(key: &TestKey, issuer: &str, email: &str, ttl_secs: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = TestClaims {
            iss: issuer.into(),
            sub: "1".into(),
            email: email.into(),
            exp: now + ttl_secs,
            nbf: now - 5,
        };
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(key.public.kid.clone());
        encode(&header, &claims, &key.encoding).unwrap()
    }

    #[test]
    fn valid_token_verifies() {
        let key = generate_key("a");
        let token = sign(&key, "infra", "alice@example.com", 300);
        let claims = verify_with_keys(&token, &[key.public.clone()]).unwrap();
        assert_eq!(claims.email, "alice@example.com");
    }

    #[test]
    fn verification_tries_every_published_key() {
        let old = generate_key("old");
        let new = generate_key("new");
        let token = sign(&old, "infra", "bob@example.com", 300);
        // Old key is not first in the set.
        let keys = vec![new.public.clone(), old.public.clone()];
        assert!(verify_with_keys(&token, &keys).is_ok());
    }

    #[test]
    fn expired_token_is_distinguished() {
        let key = generate_key("a");
        let token = sign(&key, "infra", "alice@example.com", -300);
        let err = verify_with_keys(&token, &[key.public.clone()]).unwrap_err();
        assert!(matches!(err, Error::Expired));
    }

    #[test]
    fn wrong_issuer_is_unauthorized() {
        let key = generate_key("a");
        let token = sign(&key, "not-infra", "alice@example.com", 300);
        let err = verify_with_keys(&token, &[key.public.clone()]).unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[test]
    fn unknown_key_is_unauthorized() {
        let signer = generate_key("a");
        let published = generate_key("b");
        let token = sign(&signer, "infra", "alice@example.com", 300);
        let err = verify_with_keys(&token, &[published.public.clone()]).unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[test]
    fn empty_key_set_is_unauthorized() {
        let key = generate_key("a");
        let token = sign(&key, "infra", "alice@example.com", 300);
        assert!(verify_with_keys(&token, &[]).is_err());
    }
}
