//! Embedded schema migration.
//!
//! Statements are idempotent so startup can run them unconditionally. The
//! `seq_update_index` sequence backs the grants table's monotonic cursor:
//! every insert and soft delete draws the next value, and values are never
//! reused.

use sqlx::PgPool;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS organizations (
        id BIGINT PRIMARY KEY,
        name TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        deleted_at TIMESTAMPTZ
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_organizations_name
        ON organizations (name) WHERE deleted_at IS NULL",
    "CREATE TABLE IF NOT EXISTS providers (
        id BIGINT PRIMARY KEY,
        organization_id BIGINT NOT NULL,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        issuer_url TEXT,
        client_id TEXT,
        client_secret TEXT,
        redirect_url TEXT,
        scopes TEXT[] NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        deleted_at TIMESTAMPTZ
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_providers_org_name
        ON providers (organization_id, name) WHERE deleted_at IS NULL",
    "CREATE TABLE IF NOT EXISTS identities (
        id BIGINT PRIMARY KEY,
        organization_id BIGINT NOT NULL,
        name TEXT NOT NULL,
        last_seen_at TIMESTAMPTZ,
        created_by BIGINT NOT NULL DEFAULT 0,
        verified BOOLEAN NOT NULL DEFAULT FALSE,
        verification_token TEXT,
        ssh_login_name TEXT,
        password_hash TEXT,
        one_time_password BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        deleted_at TIMESTAMPTZ
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_identities_org_name
        ON identities (organization_id, name) WHERE deleted_at IS NULL",
    "CREATE TABLE IF NOT EXISTS groups (
        id BIGINT PRIMARY KEY,
        organization_id BIGINT NOT NULL,
        provider_id BIGINT NOT NULL,
        name TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        deleted_at TIMESTAMPTZ
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_groups_org_provider_name
        ON groups (organization_id, provider_id, name) WHERE deleted_at IS NULL",
    "CREATE TABLE IF NOT EXISTS identities_groups (
        identity_id BIGINT NOT NULL,
        group_id BIGINT NOT NULL,
        PRIMARY KEY (identity_id, group_id)
    )",
    "CREATE TABLE IF NOT EXISTS identities_providers (
        identity_id BIGINT NOT NULL,
        provider_id BIGINT NOT NULL,
        PRIMARY KEY (identity_id, provider_id)
    )",
    "CREATE TABLE IF NOT EXISTS destinations (
        id BIGINT PRIMARY KEY,
        organization_id BIGINT NOT NULL,
        name TEXT NOT NULL,
        ca TEXT NOT NULL DEFAULT '',
        endpoint TEXT NOT NULL DEFAULT '',
        namespace TEXT NOT NULL DEFAULT '',
        sa_token TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        deleted_at TIMESTAMPTZ
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_destinations_org_name
        ON destinations (organization_id, name) WHERE deleted_at IS NULL",
    "CREATE SEQUENCE IF NOT EXISTS seq_update_index",
    "CREATE TABLE IF NOT EXISTS grants (
        id BIGINT PRIMARY KEY,
        organization_id BIGINT NOT NULL,
        subject TEXT NOT NULL,
        privilege TEXT NOT NULL,
        resource TEXT NOT NULL,
        created_by BIGINT NOT NULL DEFAULT 0,
        update_index BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        deleted_at TIMESTAMPTZ
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_grants_srp
        ON grants (organization_id, subject, privilege, resource)
        WHERE deleted_at IS NULL",
    "CREATE TABLE IF NOT EXISTS access_keys (
        id BIGINT PRIMARY KEY,
        organization_id BIGINT NOT NULL,
        name TEXT NOT NULL,
        issued_for BIGINT NOT NULL,
        provider_id BIGINT NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        extension BIGINT,
        extension_deadline TIMESTAMPTZ,
        scopes TEXT[] NOT NULL DEFAULT '{}',
        key_id TEXT NOT NULL,
        secret_checksum BYTEA NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        deleted_at TIMESTAMPTZ
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_access_keys_key_id
        ON access_keys (key_id) WHERE deleted_at IS NULL",
    "CREATE TABLE IF NOT EXISTS user_public_keys (
        id BIGINT PRIMARY KEY,
        organization_id BIGINT NOT NULL,
        user_id BIGINT NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        public_key TEXT NOT NULL,
        key_type TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        expires_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        deleted_at TIMESTAMPTZ
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_user_public_keys_fingerprint
        ON user_public_keys (fingerprint) WHERE deleted_at IS NULL",
];

pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
