//! Access key authentication and grant gates.
//!
//! The middleware resolves the bearer access key to its identity and
//! organization and stashes the result in request extensions. Handlers that
//! need more than authentication call [`require_admin`] or
//! [`require_connector`], which check for the corresponding grant on the
//! `infra` resource, group-inherited grants included.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use infra_common::{Id, Subject, ADMIN_PRIVILEGE, CONNECTOR_PRIVILEGE, INFRA_RESOURCE};

use crate::error::{Error, Result};
use crate::server::AppState;
use crate::store::grants::{list_grants, ListGrantsOptions};
use crate::store::models::{AccessKey, Identity};
use crate::store::{access_keys, Db};

/// Authenticated caller, available to handlers via `Extension<Access>`.
#[derive(Clone)]
pub struct Access {
    pub identity: Identity,
    pub key: AccessKey,
}

impl Access {
    pub fn organization_id(&self) -> Id {
        self.identity.organization_id
    }

    pub fn user_id(&self) -> Id {
        self.identity.id
    }
}

/// Extract the bearer token from an Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Middleware: authenticate the access key or fail with 401.
pub async fn require_access_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let token = bearer_token(request.headers()).ok_or(Error::Unauthorized)?;
    let (key, identity) = access_keys::validate_access_key(&state.db, token).await?;
    request.extensions_mut().insert(Access { identity, key });
    Ok(next.run(request).await)
}

async fn has_grant(db: &Db, access: &Access, privilege: &str) -> Result<bool> {
    let mut tx = db.read(access.organization_id()).await?;
    let page = list_grants(
        &mut tx,
        ListGrantsOptions {
            by_subject: Some(Subject::user(access.user_id())),
            include_inherited_from_groups: true,
            by_privileges: vec![privilege.to_string()],
            by_resource: Some(INFRA_RESOURCE.to_string()),
            ..Default::default()
        },
    )
    .await?;
    Ok(!page.grants.is_empty())
}

/// Require an `(admin, infra)` grant.
pub async fn require_admin(db: &Db, access: &Access) -> Result<()> {
    if has_grant(db, access, ADMIN_PRIVILEGE).await? {
        Ok(())
    } else {
        Err(Error::Forbidden)
    }
}

/// Require the `(connector, infra)` grant engines hold.
pub async fn require_connector(db: &Db, access: &Access) -> Result<()> {
    if has_grant(db, access, CONNECTOR_PRIVILEGE).await? {
        Ok(())
    } else {
        Err(Error::Forbidden)
    }
}

/// Require that the caller is the referenced user or an admin.
pub async fn require_self_or_admin(db: &Db, access: &Access, user_id: Id) -> Result<()> {
    if access.user_id() == user_id {
        return Ok(());
    }
    require_admin(db, access).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        let mut basic = HeaderMap::new();
        basic.insert("Authorization", "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&basic), None);

        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
