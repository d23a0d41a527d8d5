//! Approval delegations.
//!
//! The partial unique index on `delegator_id WHERE is_active` keeps one
//! active delegation per delegator; a second insert surfaces as a unique
//! violation.

use sqlx::PgPool;
use uuid::Uuid;

use engine::runtime::Delegation;

use crate::models::DelegationRow;
use crate::DbError;

const DELEGATION_COLUMNS: &str =
    "id, delegator_id, delegate_id, starts_at, ends_at, reason, blueprint_ids, is_active, created_at";

/// Insert a delegation after retiring the delegator's delegations that
/// ended before it starts.
pub async fn insert(pool: &PgPool, d: &Delegation) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE blueprint_approval_delegations
        SET is_active = FALSE
        WHERE delegator_id = $1 AND is_active AND ends_at <= $2
        "#,
    )
    .bind(d.delegator_id)
    .bind(d.starts_at)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO blueprint_approval_delegations
            (id, delegator_id, delegate_id, starts_at, ends_at, reason, blueprint_ids, is_active, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(d.id)
    .bind(d.delegator_id)
    .bind(d.delegate_id)
    .bind(d.starts_at)
    .bind(d.ends_at)
    .bind(&d.reason)
    .bind(&d.blueprint_ids)
    .bind(d.is_active)
    .bind(d.created_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Delegation, DbError> {
    let row = sqlx::query_as::<_, DelegationRow>(&format!(
        "SELECT {DELEGATION_COLUMNS} FROM blueprint_approval_delegations WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::not_found("delegation", id))?;
    Ok(row.into())
}

pub async fn deactivate(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    let done = sqlx::query("UPDATE blueprint_approval_delegations SET is_active = FALSE WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(DbError::not_found("delegation", id));
    }
    Ok(())
}

/// Delegations where `user_id` is the delegator or the delegate.
pub async fn list_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Delegation>, DbError> {
    let rows = sqlx::query_as::<_, DelegationRow>(&format!(
        "SELECT {DELEGATION_COLUMNS} FROM blueprint_approval_delegations \
         WHERE delegator_id = $1 OR delegate_id = $1 ORDER BY created_at"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Delegation::from).collect())
}
