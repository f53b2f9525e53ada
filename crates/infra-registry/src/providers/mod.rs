//! Identity provider adapters.
//!
//! Two families: the built-in local provider backed by password hashes in
//! the identities table, and OIDC providers (generic, Google, Okta, Azure)
//! that hand us an authorization code to exchange and verify.

pub mod local;
pub mod oidc;

pub use oidc::{OidcClient, OidcIdentity};
