//! Infra registry: the central identity and access control plane.
//!
//! Authenticates users against OIDC providers or the built-in local
//! provider, issues access keys and short-lived JWTs, and stores the grants
//! that engines project into cluster RBAC. See [`server::serve`] for the
//! process entrypoint.

pub mod access;
pub mod config;
pub mod error;
pub mod providers;
pub mod server;
pub mod store;
pub mod tokens;

pub use error::{Error, Result};
pub use server::{serve, ServerOptions};
