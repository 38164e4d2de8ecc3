//! Destination records: CRUD lives outside the core; this crate only reads
//! them.

use gateway_models::{ForwardingRule, TlsPolicy};
use sqlx::types::Json;

#[derive(Debug, Clone)]
pub struct DestinationRow {
    pub id: uuid::Uuid,
    pub name: String,
    pub ae_title: String,
    pub host: String,
    pub port: i32,
    pub tls_policy: TlsPolicy,
    pub enabled: bool,
    pub forwarding_rule: ForwardingRule,
    pub concurrency_limit: i32,
    pub verify_on_connect: bool,
}

struct Raw {
    id: uuid::Uuid,
    name: String,
    ae_title: String,
    host: String,
    port: i32,
    tls_policy: TlsPolicy,
    enabled: bool,
    forwarding_rule: Json<ForwardingRule>,
    concurrency_limit: i32,
    verify_on_connect: bool,
}

impl From<Raw> for DestinationRow {
    fn from(r: Raw) -> Self {
        DestinationRow {
            id: r.id,
            name: r.name,
            ae_title: r.ae_title,
            host: r.host,
            port: r.port,
            tls_policy: r.tls_policy,
            enabled: r.enabled,
            forwarding_rule: r.forwarding_rule.0,
            concurrency_limit: r.concurrency_limit,
            verify_on_connect: r.verify_on_connect,
        }
    }
}

pub async fn get(pool: &sqlx::PgPool, id: uuid::Uuid) -> crate::Result<Option<DestinationRow>> {
    let row = sqlx::query_as!(
        Raw,
        r#"SELECT
            id, name, ae_title, host, port,
            tls_policy as "tls_policy: TlsPolicy",
            enabled,
            forwarding_rule as "forwarding_rule: Json<ForwardingRule>",
            concurrency_limit, verify_on_connect
        FROM destinations WHERE id = $1"#,
        id,
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(Into::into))
}

pub async fn list_enabled(pool: &sqlx::PgPool) -> crate::Result<Vec<DestinationRow>> {
    let rows = sqlx::query_as!(
        Raw,
        r#"SELECT
            id, name, ae_title, host, port,
            tls_policy as "tls_policy: TlsPolicy",
            enabled,
            forwarding_rule as "forwarding_rule: Json<ForwardingRule>",
            concurrency_limit, verify_on_connect
        FROM destinations WHERE enabled ORDER BY id"#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Fetches destinations by id, in any order, for joining against a batch of
/// claimed jobs.
pub async fn get_many(pool: &sqlx::PgPool, ids: &[uuid::Uuid]) -> crate::Result<Vec<DestinationRow>> {
    let rows = sqlx::query_as!(
        Raw,
        r#"SELECT
            id, name, ae_title, host, port,
            tls_policy as "tls_policy: TlsPolicy",
            enabled,
            forwarding_rule as "forwarding_rule: Json<ForwardingRule>",
            concurrency_limit, verify_on_connect
        FROM destinations WHERE id = ANY($1)"#,
        ids,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Locks the enabled destination set for the duration of the current
/// transaction, establishing the first step of the (destination, study,
/// series) lock order used by [`crate::admit::admit`].
pub async fn list_enabled_for_update(
    txn: &mut sqlx::PgConnection,
) -> crate::Result<Vec<DestinationRow>> {
    let rows = sqlx::query_as!(
        Raw,
        r#"SELECT
            id, name, ae_title, host, port,
            tls_policy as "tls_policy: TlsPolicy",
            enabled,
            forwarding_rule as "forwarding_rule: Json<ForwardingRule>",
            concurrency_limit, verify_on_connect
        FROM destinations WHERE enabled ORDER BY id FOR UPDATE"#,
    )
    .fetch_all(&mut *txn)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}
