//! Shared types for the Infra control plane.
//!
//! This crate holds everything the registry, the engine, and API clients have
//! to agree on: opaque identifiers, the polymorphic grant subject, the JSON
//! wire types for every registry endpoint, and process logging setup.

pub mod api;
pub mod logging;
pub mod uid;

pub use uid::{Id, Subject};

/// Reserved identity name used by engines when they authenticate to the
/// registry. Hidden from user listings unless explicitly requested.
pub const CONNECTOR_IDENTITY_NAME: &str = "connector";

/// Privilege carried by the reserved engine grant `(connector, infra)`.
pub const CONNECTOR_PRIVILEGE: &str = "connector";

/// Resource name for grants that apply to the registry itself rather than a
/// destination cluster.
pub const INFRA_RESOURCE: &str = "infra";

/// Privilege required for administrative registry endpoints.
pub const ADMIN_PRIVILEGE: &str = "admin";

/// Issuer claim stamped into every JWT the registry signs.
pub const JWT_ISSUER: &str = "infra";

/// Header carrying the end-user JWT on requests to the engine proxy. The
/// regular `Authorization` header is reserved for the cluster credential the
/// proxy injects upstream.
pub const INFRA_AUTHORIZATION_HEADER: &str = "X-Infra-Authorization";

/// Header used to smuggle the original query string through proxies that drop
/// it on upgrade requests.
pub const INFRA_QUERY_HEADER: &str = "X-Infra-Query";
