//! The built-in local provider.
//!
//! Stores argon2id hashes on the identity row. Password mismatches surface
//! as the generic `Unauthorized` kind so login responses never distinguish
//! a wrong password from an unknown user.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{Error, Result};

/// Minimum accepted password length.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Hash a password into its PHC string form.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::internal(format!("failed to hash password: {e}")))
}

/// Check a password against a stored PHC hash.
pub fn verify_password(hash: &str, password: &str) -> Result<()> {
    let parsed = PasswordHash::new(hash).map_err(|e| {
        // A corrupt stored hash is a server problem, not a client one.
        Error::internal(format!("stored password hash is invalid: {e}"))
    })?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| Error::Unauthorized)
}

/// Random one-time password for admin-created users.
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_round_trip() {
        let hash = hash_password("hunter2hunter2").unwrap();
        assert!(verify_password(&hash, "hunter2hunter2").is_ok());
    }

    #[test]
    fn wrong_password_is_unauthorized() {
        let hash = hash_password("correct horse").unwrap();
        let err = verify_password(&hash, "battery staple").unwrap_err();
        assert!(matches!(err, Error::Unauthorized));
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password("same password").unwrap();
        let b = hash_password("same password").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn generated_passwords_are_long_enough() {
        let otp = generate_password();
        assert!(otp.len() >= MIN_PASSWORD_LENGTH);
    }
}
