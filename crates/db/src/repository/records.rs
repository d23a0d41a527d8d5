//! Record state and transition history.

use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use engine::runtime::{RecordState, TransitionHistoryItem};

use crate::models::{convert_all, HistoryRow, RecordStateRow};
use crate::DbError;

const HISTORY_COLUMNS: &str = "id, blueprint_id, record_id, execution_id, transition_id, transition_name, \
     from_state_id, to_state_id, executed_by, status, started_at, completed_at, reason";

// ---------------------------------------------------------------------------
// blueprint_record_states
// ---------------------------------------------------------------------------

pub async fn get_record_state(
    pool: &PgPool,
    blueprint_id: Uuid,
    record_id: Uuid,
) -> Result<Option<RecordState>, DbError> {
    let row = sqlx::query_as::<_, RecordStateRow>(
        r#"
        SELECT blueprint_id, record_id, current_state_id, state_entered_at, residency_id
        FROM blueprint_record_states
        WHERE blueprint_id = $1 AND record_id = $2
        "#,
    )
    .bind(blueprint_id)
    .bind(record_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(RecordState::from))
}

/// Insert `state` unless one exists, then return whatever is stored.
pub async fn init_record_state(pool: &PgPool, state: &RecordState) -> Result<RecordState, DbError> {
    sqlx::query(
        r#"
        INSERT INTO blueprint_record_states
            (blueprint_id, record_id, current_state_id, state_entered_at, residency_id)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (blueprint_id, record_id) DO NOTHING
        "#,
    )
    .bind(state.blueprint_id)
    .bind(state.record_id)
    .bind(state.current_state_id)
    .bind(state.state_entered_at)
    .bind(state.residency_id)
    .execute(pool)
    .await?;

    get_record_state(pool, state.blueprint_id, state.record_id)
        .await?
        .ok_or_else(|| DbError::not_found("record state", state.record_id))
}

pub async fn list_record_states(pool: &PgPool, blueprint_id: Uuid) -> Result<Vec<RecordState>, DbError> {
    let rows = sqlx::query_as::<_, RecordStateRow>(
        r#"
        SELECT blueprint_id, record_id, current_state_id, state_entered_at, residency_id
        FROM blueprint_record_states
        WHERE blueprint_id = $1
        ORDER BY state_entered_at
        "#,
    )
    .bind(blueprint_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(RecordState::from).collect())
}

/// Move a record to `next` only if it still sits in `expected`.
///
/// Runs on the caller's transaction.
pub async fn move_record_state(
    conn: &mut PgConnection,
    expected: Uuid,
    next: &RecordState,
) -> Result<(), DbError> {
    let done = sqlx::query(
        r#"
        UPDATE blueprint_record_states
        SET current_state_id = $1, state_entered_at = $2, residency_id = $3
        WHERE blueprint_id = $4 AND record_id = $5 AND current_state_id = $6
        "#,
    )
    .bind(next.current_state_id)
    .bind(next.state_entered_at)
    .bind(next.residency_id)
    .bind(next.blueprint_id)
    .bind(next.record_id)
    .bind(expected)
    .execute(conn)
    .await?;

    if done.rows_affected() == 0 {
        return Err(DbError::Conflict(format!(
            "record {} is no longer in state {expected}",
            next.record_id
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// blueprint_transition_history
// ---------------------------------------------------------------------------

/// Append a history row. History is never updated.
pub async fn append_history(conn: &mut PgConnection, item: &TransitionHistoryItem) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO blueprint_transition_history
            (id, blueprint_id, record_id, execution_id, transition_id, transition_name,
             from_state_id, to_state_id, executed_by, status, started_at, completed_at, reason)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(item.id)
    .bind(item.blueprint_id)
    .bind(item.record_id)
    .bind(item.execution_id)
    .bind(item.transition_id)
    .bind(&item.transition_name)
    .bind(item.from_state)
    .bind(item.to_state)
    .bind(item.executed_by)
    .bind(item.status.as_str())
    .bind(item.started_at)
    .bind(item.completed_at)
    .bind(&item.reason)
    .execute(conn)
    .await?;
    Ok(())
}

/// Oldest first.
pub async fn list_history(
    pool: &PgPool,
    blueprint_id: Uuid,
    record_id: Uuid,
) -> Result<Vec<TransitionHistoryItem>, DbError> {
    let rows = sqlx::query_as::<_, HistoryRow>(&format!(
        "SELECT {HISTORY_COLUMNS} FROM blueprint_transition_history \
         WHERE blueprint_id = $1 AND record_id = $2 ORDER BY seq"
    ))
    .bind(blueprint_id)
    .bind(record_id)
    .fetch_all(pool)
    .await?;
    convert_all(rows)
}
