//! Short-lived JWT issuance and JWKS publication.
//!
//! The registry holds a rotating set of in-process ES256 keys. New tokens are
//! always signed with the newest key; `/.well-known/jwks.json` publishes the
//! public half of every key still in the set, so rotation is a set union
//! rather than a swap and verifiers must try each published key. Keys are
//! not persisted: a restart invalidates outstanding tokens, which their
//! five-minute lifetime tolerates.

use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use infra_common::api::{JsonWebKey, JsonWebKeySet};
use infra_common::{Id, JWT_ISSUER};

use crate::error::{Error, Result};

/// Lifetime of issued tokens.
pub const JWT_LIFETIME: Duration = Duration::minutes(5);

/// Keys older than this are dropped from the set on rotation. Comfortably
/// longer than the token lifetime so rotation never orphans a live token.
const KEY_RETIREMENT_AGE: Duration = Duration::hours(1);

/// Claims carried by every registry-issued token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    /// User id, as its decimal string form.
    pub sub: String,
    /// Name of the authenticated user.
    pub email: String,
    pub exp: i64,
    pub nbf: i64,
}

struct SigningKey {
    kid: String,
    encoding: EncodingKey,
    public: JsonWebKey,
    created_at: DateTime<Utc>,
}

impl SigningKey {
    fn generate() -> Result<SigningKey> {
        let rng = SystemRandom::new();
        let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| Error::internal("failed to generate signing key"))?;
        let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, document.as_ref())
            .map_err(|_| Error::internal("failed to load generated signing key"))?;

        // Uncompressed point: 0x04 || x || y, 32 bytes each for P-256.
        let point = pair.public_key().as_ref();
        if point.len() != 65 || point[0] != 0x04 {
            return Err(Error::internal("unexpected public key encoding"));
        }
        let x = URL_SAFE_NO_PAD.encode(&point[1..33]);
        let y = URL_SAFE_NO_PAD.encode(&point[33..65]);
        let kid = URL_SAFE_NO_PAD.encode(&Sha256::digest(point)[..8]);

        Ok(SigningKey {
            public: JsonWebKey {
                kty: "EC".to_string(),
                crv: "P-256".to_string(),
                x,
                y,
                kid: kid.clone(),
                alg: "ES256".to_string(),
                use_: "sig".to_string(),
            },
            kid,
            encoding: EncodingKey::from_ec_der(document.as_ref()),
            created_at: Utc::now(),
        })
    }
}

/// Issues user-facing JWTs and publishes the verification key set.
pub struct JwtIssuer {
    keys: RwLock<Vec<SigningKey>>,
}

impl JwtIssuer {
    pub fn new() -> Result<JwtIssuer> {
        Ok(JwtIssuer {
            keys: RwLock::new(vec![SigningKey::generate()?]),
        })
    }

    /// Add a fresh key to the set and retire keys old enough that no token
    /// signed with them can still be live. The set always keeps at least one
    /// key.
    pub fn rotate(&self) -> Result<()> {
        let fresh = SigningKey::generate()?;
        let mut keys = self.keys.write();
        let cutoff = Utc::now() - KEY_RETIREMENT_AGE;
        keys.retain(|k| k.created_at > cutoff);
        info!(kid = %fresh.kid, active = keys.len() + 1, "rotated signing key");
        keys.push(fresh);
        Ok(())
    }

    /// Public half of every active key.
    pub fn jwks(&self) -> JsonWebKeySet {
        JsonWebKeySet {
            keys: self.keys.read().iter().map(|k| k.public.clone()).collect(),
        }
    }

    /// Sign a token for the authenticated user with the newest key.
    pub fn issue(&self, user_id: Id, email: &str) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expires = now + JWT_LIFETIME;
        let claims = Claims {
            iss: JWT_ISSUER.to_string(),
            sub: user_id.to_string(),
            email: email.to_string(),
            exp: expires.timestamp(),
            nbf: now.timestamp(),
        };

        let keys = self.keys.read();
        let key = keys.last().ok_or_else(|| Error::internal("no signing key"))?;
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(key.kid.clone());

        let token = encode(&header, &claims, &key.encoding)
            .map_err(|e| Error::internal(format!("failed to sign token: {e}")))?;
        Ok((token, expires))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    fn verify_against_set(token: &str, jwks: &JsonWebKeySet) -> Option<Claims> {
        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_issuer(&[JWT_ISSUER]);
        validation.validate_aud = false;
        validation.validate_nbf = true;
        for key in &jwks.keys {
            let decoding = DecodingKey::from_ec_components(&key.x, &key.y).unwrap();
            if let Ok(data) = decode::<Claims>(token, &decoding, &validation) {
                return Some(data.claims);
            }
        }
        None
    }

    #[test]
    fn issued_token_verifies_against_published_jwks() {
        let issuer = JwtIssuer::new().unwrap();
        let (token, expires) = issuer.issue(Id::from(7), "alice@example.com").unwrap();
        assert!(expires > Utc::now());

        let claims = verify_against_set(&token, &issuer.jwks()).expect("token should verify");
        assert_eq!(claims.iss, "infra");
        assert_eq!(claims.sub, "7");
        assert_eq!(claims.email, "alice@example.com");
    }

    #[test]
    fn rotation_keeps_old_tokens_valid() {
        let issuer = JwtIssuer::new().unwrap();
        let (old_token, _) = issuer.issue(Id::from(1), "old@example.com").unwrap();

        issuer.rotate().unwrap();
        let (new_token, _) = issuer.issue(Id::from(2), "new@example.com").unwrap();

        let jwks = issuer.jwks();
        assert!(jwks.keys.len() >= 2, "rotation unions the key set");
        assert!(verify_against_set(&old_token, &jwks).is_some());
        assert!(verify_against_set(&new_token, &jwks).is_some());
    }

    #[test]
    fn tokens_from_a_different_issuer_do_not_verify() {
        let ours = JwtIssuer::new().unwrap();
        let theirs = JwtIssuer::new().unwrap();
        let (foreign, _) = theirs.issue(Id::from(3), "eve@example.com").unwrap();
        assert!(verify_against_set(&foreign, &ours.jwks()).is_none());
    }

    #[test]
    fn jwks_always_has_at_least_one_key() {
        let issuer = JwtIssuer::new().unwrap();
        issuer.rotate().unwrap();
        issuer.rotate().unwrap();
        assert!(!issuer.jwks().keys.is_empty());
    }
}
