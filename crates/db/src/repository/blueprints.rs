//! Blueprint definition CRUD: blueprints, states, transitions and SLAs.

use sqlx::PgPool;
use uuid::Uuid;

use engine::models::{Blueprint, BlueprintSla, State, Transition};
use engine::BlueprintGraph;

use crate::models::{convert_all, logic_str, BlueprintRow, SlaRow, StateRow, TransitionRow};
use crate::DbError;

const BLUEPRINT_COLUMNS: &str = "id, name, module_id, field, description, is_active, layout, created_at";
const STATE_COLUMNS: &str =
    "id, blueprint_id, name, field_option_value, color, is_initial, is_terminal, metadata";
const TRANSITION_COLUMNS: &str = "id, blueprint_id, name, description, button_label, from_state_id, \
     to_state_id, display_order, is_active, condition_logic, conditions, requirements, actions, approval";
const SLA_COLUMNS: &str = "id, blueprint_id, state_id, name, duration_hours, business_hours_only, \
     exclude_weekends, is_active, escalations";

// ---------------------------------------------------------------------------
// blueprints
// ---------------------------------------------------------------------------

/// Load a blueprint together with its states, transitions and SLAs.
pub async fn load_graph(pool: &PgPool, blueprint_id: Uuid) -> Result<BlueprintGraph, DbError> {
    let blueprint = sqlx::query_as::<_, BlueprintRow>(&format!(
        "SELECT {BLUEPRINT_COLUMNS} FROM blueprints WHERE id = $1"
    ))
    .bind(blueprint_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::not_found("blueprint", blueprint_id))?;

    let states = sqlx::query_as::<_, StateRow>(&format!(
        "SELECT {STATE_COLUMNS} FROM blueprint_states WHERE blueprint_id = $1 ORDER BY name"
    ))
    .bind(blueprint_id)
    .fetch_all(pool)
    .await?;

    let transitions = sqlx::query_as::<_, TransitionRow>(&format!(
        "SELECT {TRANSITION_COLUMNS} FROM blueprint_transitions WHERE blueprint_id = $1 \
         ORDER BY display_order, name"
    ))
    .bind(blueprint_id)
    .fetch_all(pool)
    .await?;

    let slas = sqlx::query_as::<_, SlaRow>(&format!(
        "SELECT {SLA_COLUMNS} FROM blueprint_slas WHERE blueprint_id = $1 ORDER BY name"
    ))
    .bind(blueprint_id)
    .fetch_all(pool)
    .await?;

    Ok(BlueprintGraph {
        blueprint: blueprint.into(),
        states: states.into_iter().map(State::from).collect(),
        transitions: convert_all(transitions)?,
        slas: convert_all(slas)?,
    })
}

pub async fn list_blueprints(pool: &PgPool, module_id: Option<Uuid>) -> Result<Vec<Blueprint>, DbError> {
    let rows = sqlx::query_as::<_, BlueprintRow>(&format!(
        "SELECT {BLUEPRINT_COLUMNS} FROM blueprints \
         WHERE $1::uuid IS NULL OR module_id = $1 ORDER BY created_at"
    ))
    .bind(module_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Blueprint::from).collect())
}

/// Insert or replace a blueprint row.
pub async fn upsert_blueprint(pool: &PgPool, bp: &Blueprint) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO blueprints (id, name, module_id, field, description, is_active, layout, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            module_id = EXCLUDED.module_id,
            field = EXCLUDED.field,
            description = EXCLUDED.description,
            is_active = EXCLUDED.is_active,
            layout = EXCLUDED.layout
        "#,
    )
    .bind(bp.id)
    .bind(&bp.name)
    .bind(bp.module_id)
    .bind(&bp.field)
    .bind(&bp.description)
    .bind(bp.is_active)
    .bind(&bp.layout)
    .bind(bp.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a blueprint. States, transitions, SLAs, record states and
/// executions go with it via `ON DELETE CASCADE`; history rows stay.
pub async fn delete_blueprint(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    let done = sqlx::query("DELETE FROM blueprints WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(DbError::not_found("blueprint", id));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// blueprint_states
// ---------------------------------------------------------------------------

pub async fn upsert_state(pool: &PgPool, s: &State) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO blueprint_states
            (id, blueprint_id, name, field_option_value, color, is_initial, is_terminal, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            field_option_value = EXCLUDED.field_option_value,
            color = EXCLUDED.color,
            is_initial = EXCLUDED.is_initial,
            is_terminal = EXCLUDED.is_terminal,
            metadata = EXCLUDED.metadata
        "#,
    )
    .bind(s.id)
    .bind(s.blueprint_id)
    .bind(&s.name)
    .bind(&s.field_option_value)
    .bind(&s.color)
    .bind(s.is_initial)
    .bind(s.is_terminal)
    .bind(&s.metadata)
    .execute(pool)
    .await
    .map_err(|e| missing_parent(e, "blueprint", s.blueprint_id))?;
    Ok(())
}

/// Transitions and SLAs touching the state are removed by cascade.
/// Delete a state unless records still sit in it.
pub async fn delete_state(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;

    let locked: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM blueprint_states WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
    if locked.is_none() {
        return Err(DbError::not_found("state", id));
    }

    let (occupants,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM blueprint_record_states WHERE current_state_id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
    if occupants > 0 {
        return Err(DbError::Conflict(format!("state {id} still holds {occupants} record(s)")));
    }

    sqlx::query("DELETE FROM blueprint_states WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// blueprint_transitions
// ---------------------------------------------------------------------------

pub async fn upsert_transition(pool: &PgPool, t: &Transition) -> Result<(), DbError> {
    let approval = t.approval.as_ref().map(serde_json::to_value).transpose()?;

    sqlx::query(
        r#"
        INSERT INTO blueprint_transitions
            (id, blueprint_id, name, description, button_label, from_state_id, to_state_id,
             display_order, is_active, condition_logic, conditions, requirements, actions, approval)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            description = EXCLUDED.description,
            button_label = EXCLUDED.button_label,
            from_state_id = EXCLUDED.from_state_id,
            to_state_id = EXCLUDED.to_state_id,
            display_order = EXCLUDED.display_order,
            is_active = EXCLUDED.is_active,
            condition_logic = EXCLUDED.condition_logic,
            conditions = EXCLUDED.conditions,
            requirements = EXCLUDED.requirements,
            actions = EXCLUDED.actions,
            approval = EXCLUDED.approval
        "#,
    )
    .bind(t.id)
    .bind(t.blueprint_id)
    .bind(&t.name)
    .bind(&t.description)
    .bind(&t.button_label)
    .bind(t.from_state.state_id())
    .bind(t.to_state)
    .bind(t.display_order)
    .bind(t.is_active)
    .bind(logic_str(t.condition_logic))
    .bind(serde_json::to_value(&t.conditions)?)
    .bind(serde_json::to_value(&t.requirements)?)
    .bind(serde_json::to_value(&t.actions)?)
    .bind(approval)
    .execute(pool)
    .await
    .map_err(|e| missing_parent(e, "blueprint", t.blueprint_id))?;
    Ok(())
}

pub async fn delete_transition(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    let done = sqlx::query("DELETE FROM blueprint_transitions WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(DbError::not_found("transition", id));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// blueprint_slas
// ---------------------------------------------------------------------------

pub async fn upsert_sla(pool: &PgPool, sla: &BlueprintSla) -> Result<(), DbError> {
    let hours = i32::try_from(sla.duration_hours)
        .map_err(|_| DbError::Decode(format!("SLA duration {} out of range", sla.duration_hours)))?;

    sqlx::query(
        r#"
        INSERT INTO blueprint_slas
            (id, blueprint_id, state_id, name, duration_hours, business_hours_only,
             exclude_weekends, is_active, escalations)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO UPDATE SET
            state_id = EXCLUDED.state_id,
            name = EXCLUDED.name,
            duration_hours = EXCLUDED.duration_hours,
            business_hours_only = EXCLUDED.business_hours_only,
            exclude_weekends = EXCLUDED.exclude_weekends,
            is_active = EXCLUDED.is_active,
            escalations = EXCLUDED.escalations
        "#,
    )
    .bind(sla.id)
    .bind(sla.blueprint_id)
    .bind(sla.state_id)
    .bind(&sla.name)
    .bind(hours)
    .bind(sla.business_hours_only)
    .bind(sla.exclude_weekends)
    .bind(sla.is_active)
    .bind(serde_json::to_value(&sla.escalations)?)
    .execute(pool)
    .await
    .map_err(|e| missing_parent(e, "state", sla.state_id))?;
    Ok(())
}

pub async fn delete_sla(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    let done = sqlx::query("DELETE FROM blueprint_slas WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(DbError::not_found("sla", id));
    }
    Ok(())
}

/// A foreign-key violation on insert means the parent row does not exist.
fn missing_parent(e: sqlx::Error, kind: &'static str, id: Uuid) -> DbError {
    match &e {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => DbError::not_found(kind, id),
        _ => DbError::Sqlx(e),
    }
}
