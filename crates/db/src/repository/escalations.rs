//! SLA escalation log: one row per (residency, escalation).

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use engine::runtime::EscalationLog;

use crate::models::EscalationLogRow;
use crate::DbError;

/// Claim an escalation for a residency. Returns `false` when another sweep
/// already claimed it; the primary key makes the claim race-free.
pub async fn claim(pool: &PgPool, log: &EscalationLog) -> Result<bool, DbError> {
    let done = sqlx::query(
        r#"
        INSERT INTO blueprint_sla_escalation_logs
            (residency_id, escalation_id, record_id, fired_at, succeeded, result)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (residency_id, escalation_id) DO NOTHING
        "#,
    )
    .bind(log.residency_id)
    .bind(log.escalation_id)
    .bind(log.record_id)
    .bind(log.fired_at)
    .bind(log.succeeded)
    .bind(&log.result)
    .execute(pool)
    .await?;
    Ok(done.rows_affected() == 1)
}

pub async fn record_result(
    pool: &PgPool,
    residency_id: Uuid,
    escalation_id: Uuid,
    succeeded: bool,
    result: Value,
) -> Result<(), DbError> {
    let done = sqlx::query(
        r#"
        UPDATE blueprint_sla_escalation_logs
        SET succeeded = $1, result = $2
        WHERE residency_id = $3 AND escalation_id = $4
        "#,
    )
    .bind(succeeded)
    .bind(result)
    .bind(residency_id)
    .bind(escalation_id)
    .execute(pool)
    .await?;
    if done.rows_affected() == 0 {
        return Err(DbError::not_found("escalation log", escalation_id));
    }
    Ok(())
}

pub async fn list_for_residency(pool: &PgPool, residency_id: Uuid) -> Result<Vec<EscalationLog>, DbError> {
    let rows = sqlx::query_as::<_, EscalationLogRow>(
        r#"
        SELECT residency_id, escalation_id, record_id, fired_at, succeeded, result
        FROM blueprint_sla_escalation_logs
        WHERE residency_id = $1
        ORDER BY fired_at
        "#,
    )
    .bind(residency_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(EscalationLog::from).collect())
}
