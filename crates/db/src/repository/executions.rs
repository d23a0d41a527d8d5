//! Transition executions and their approval requests.
//!
//! `apply_write` is the only multi-row write path; it runs in one
//! transaction and locks the execution row with `SELECT … FOR UPDATE` so
//! two commands against the same execution serialise. The row's `version`
//! must match the one the command read, otherwise the write is a conflict.

use chrono::Utc;
use sqlx::{PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use engine::runtime::{ApprovalRequest, ApprovalRequestStatus, ExecutionStatus, TransitionExecution};
use engine::store::ExecutionWrite;

use crate::models::{convert_all, ApprovalRequestRow, ExecutionRow};
use crate::repository::records;
use crate::DbError;

const EXECUTION_COLUMNS: &str = "id, blueprint_id, record_id, transition_id, from_state_id, to_state_id, \
     executed_by, status, submission, approval, started_at, completed_at, cancellation_reason, version";
const REQUEST_COLUMNS: &str = "id, execution_id, record_id, approver_id, requested_by, status, comments, \
     responded_at, created_at, original_approver_id, delegation_id, escalated_at, reminder_count, last_reminder_at";

// ---------------------------------------------------------------------------
// blueprint_executions
// ---------------------------------------------------------------------------

/// Insert a new execution and its approval requests in one transaction.
///
/// The partial unique index on `(record_id, transition_id)` rejects a second
/// open execution; that surfaces as a unique violation.
pub async fn insert_execution(
    pool: &PgPool,
    execution: &TransitionExecution,
    requests: &[ApprovalRequest],
) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO blueprint_executions
            (id, blueprint_id, record_id, transition_id, from_state_id, to_state_id, executed_by,
             status, submission, approval, started_at, completed_at, cancellation_reason, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(execution.id)
    .bind(execution.blueprint_id)
    .bind(execution.record_id)
    .bind(execution.transition_id)
    .bind(execution.from_state)
    .bind(execution.to_state)
    .bind(execution.executed_by)
    .bind(execution.status.as_str())
    .bind(serde_json::to_value(&execution.submission)?)
    .bind(execution.approval.as_ref().map(serde_json::to_value).transpose()?)
    .bind(execution.started_at)
    .bind(execution.completed_at)
    .bind(&execution.cancellation_reason)
    .bind(execution.version)
    .execute(&mut *tx)
    .await?;

    for request in requests {
        insert_request(&mut tx, request).await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<TransitionExecution, DbError> {
    let row = sqlx::query_as::<_, ExecutionRow>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM blueprint_executions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::not_found("execution", id))?;
    row.try_into()
}

pub async fn list_for_record(pool: &PgPool, record_id: Uuid) -> Result<Vec<TransitionExecution>, DbError> {
    let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM blueprint_executions WHERE record_id = $1 ORDER BY started_at"
    ))
    .bind(record_id)
    .fetch_all(pool)
    .await?;
    convert_all(rows)
}

pub async fn list_with_status(
    pool: &PgPool,
    status: ExecutionStatus,
) -> Result<Vec<TransitionExecution>, DbError> {
    let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM blueprint_executions WHERE status = $1 ORDER BY started_at"
    ))
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;
    convert_all(rows)
}

/// Apply an [`ExecutionWrite`] atomically.
///
/// Every guard is checked under row locks before anything is changed; any
/// failure rolls the whole transaction back when `tx` is dropped.
pub async fn apply_write(pool: &PgPool, write: ExecutionWrite) -> Result<(), DbError> {
    let exec = &write.execution;
    let mut tx = pool.begin().await?;

    let stored: Option<(String, i64)> =
        sqlx::query_as("SELECT status, version FROM blueprint_executions WHERE id = $1 FOR UPDATE")
            .bind(exec.id)
            .fetch_optional(&mut *tx)
            .await?;
    let (status, version) = stored.ok_or_else(|| DbError::not_found("execution", exec.id))?;
    if status != write.expected_status.as_str() {
        return Err(DbError::Conflict(format!(
            "execution {} is {status}, expected {}",
            exec.id, write.expected_status
        )));
    }
    if version != write.expected_version {
        return Err(DbError::Conflict(format!(
            "execution {} is at version {version}, expected {}",
            exec.id, write.expected_version
        )));
    }

    for request in write.decided_request.iter().chain(&write.updated_requests) {
        let current: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM blueprint_approval_requests WHERE id = $1 AND execution_id = $2 FOR UPDATE",
        )
        .bind(request.id)
        .bind(exec.id)
        .fetch_optional(&mut *tx)
        .await?;
        let (current,) = current.ok_or_else(|| DbError::not_found("approval request", request.id))?;
        if current != ApprovalRequestStatus::Pending.as_str() {
            return Err(DbError::Conflict(format!(
                "approval request {} is already {current}",
                request.id
            )));
        }
    }

    if let Some((expected, next)) = &write.record_state {
        records::move_record_state(&mut tx, *expected, next).await?;
    }

    for request in &write.new_requests {
        insert_request(&mut tx, request).await?;
    }
    if let Some(decided) = &write.decided_request {
        sqlx::query(
            r#"
            UPDATE blueprint_approval_requests
            SET status = $1, comments = $2, responded_at = $3
            WHERE id = $4
            "#,
        )
        .bind(decided.status.as_str())
        .bind(&decided.comments)
        .bind(decided.responded_at)
        .bind(decided.id)
        .execute(&mut *tx)
        .await?;
    }
    for request in &write.updated_requests {
        sqlx::query(
            r#"
            UPDATE blueprint_approval_requests
            SET approver_id = $1, original_approver_id = $2, delegation_id = $3,
                escalated_at = $4, reminder_count = $5, last_reminder_at = $6
            WHERE id = $7
            "#,
        )
        .bind(request.approver_id)
        .bind(request.original_approver_id)
        .bind(request.delegation_id)
        .bind(request.escalated_at)
        .bind(reminder_count(request)?)
        .bind(request.last_reminder_at)
        .bind(request.id)
        .execute(&mut *tx)
        .await?;
    }
    if let Some(close_as) = write.close_pending {
        let closed = sqlx::query(
            r#"
            UPDATE blueprint_approval_requests
            SET status = $1, responded_at = $2
            WHERE execution_id = $3 AND status = 'pending'
            "#,
        )
        .bind(close_as.as_str())
        .bind(Utc::now())
        .bind(exec.id)
        .execute(&mut *tx)
        .await?;
        debug!(execution_id = %exec.id, closed = closed.rows_affected(), "closed pending approval requests");
    }

    sqlx::query(
        r#"
        UPDATE blueprint_executions
        SET status = $1, submission = $2, approval = $3, completed_at = $4, cancellation_reason = $5,
            version = $6
        WHERE id = $7
        "#,
    )
    .bind(exec.status.as_str())
    .bind(serde_json::to_value(&exec.submission)?)
    .bind(exec.approval.as_ref().map(serde_json::to_value).transpose()?)
    .bind(exec.completed_at)
    .bind(&exec.cancellation_reason)
    .bind(exec.version)
    .bind(exec.id)
    .execute(&mut *tx)
    .await?;

    if let Some(item) = &write.history {
        records::append_history(&mut tx, item).await?;
    }

    tx.commit().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// blueprint_approval_requests
// ---------------------------------------------------------------------------

async fn insert_request(conn: &mut PgConnection, r: &ApprovalRequest) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO blueprint_approval_requests
            (id, execution_id, record_id, approver_id, requested_by, status, comments, responded_at, created_at,
             original_approver_id, delegation_id, escalated_at, reminder_count, last_reminder_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(r.id)
    .bind(r.execution_id)
    .bind(r.record_id)
    .bind(r.approver_id)
    .bind(r.requested_by)
    .bind(r.status.as_str())
    .bind(&r.comments)
    .bind(r.responded_at)
    .bind(r.created_at)
    .bind(r.original_approver_id)
    .bind(r.delegation_id)
    .bind(r.escalated_at)
    .bind(reminder_count(r)?)
    .bind(r.last_reminder_at)
    .execute(conn)
    .await?;
    Ok(())
}

fn reminder_count(r: &ApprovalRequest) -> Result<i32, DbError> {
    i32::try_from(r.reminder_count)
        .map_err(|_| DbError::Decode(format!("reminder_count of request {} out of range", r.id)))
}

pub async fn get_request(pool: &PgPool, id: Uuid) -> Result<ApprovalRequest, DbError> {
    let row = sqlx::query_as::<_, ApprovalRequestRow>(&format!(
        "SELECT {REQUEST_COLUMNS} FROM blueprint_approval_requests WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::not_found("approval request", id))?;
    row.try_into()
}

pub async fn list_requests(pool: &PgPool, execution_id: Uuid) -> Result<Vec<ApprovalRequest>, DbError> {
    let rows = sqlx::query_as::<_, ApprovalRequestRow>(&format!(
        "SELECT {REQUEST_COLUMNS} FROM blueprint_approval_requests WHERE execution_id = $1 ORDER BY created_at"
    ))
    .bind(execution_id)
    .fetch_all(pool)
    .await?;
    convert_all(rows)
}

pub async fn list_pending_for(pool: &PgPool, approver_id: Uuid) -> Result<Vec<ApprovalRequest>, DbError> {
    let rows = sqlx::query_as::<_, ApprovalRequestRow>(&format!(
        "SELECT {REQUEST_COLUMNS} FROM blueprint_approval_requests \
         WHERE approver_id = $1 AND status = 'pending' ORDER BY created_at"
    ))
    .bind(approver_id)
    .fetch_all(pool)
    .await?;
    convert_all(rows)
}
