//! Record snapshots and the reader port the engine pulls them through.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::EngineError;

/// Field api name → current value.
pub type FieldSnapshot = Map<String, Value>;

/// Identity and field values of one business record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub record_id: Uuid,
    pub module_id: Uuid,
    #[serde(default)]
    pub owner_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub fields: FieldSnapshot,
}

impl RecordSnapshot {
    pub fn new(module_id: Uuid, fields: Value) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            module_id,
            owner_id: None,
            created_at: Utc::now(),
            fields: fields.as_object().cloned().unwrap_or_default(),
        }
    }
}

/// Supplies record snapshots. Implemented by the host application.
#[async_trait]
pub trait RecordReader: Send + Sync {
    async fn snapshot(&self, record_id: Uuid) -> Result<RecordSnapshot, EngineError>;
}

/// Reader used when the host wires none; every lookup is `NotFound`.
pub struct NoRecords;

#[async_trait]
impl RecordReader for NoRecords {
    async fn snapshot(&self, record_id: Uuid) -> Result<RecordSnapshot, EngineError> {
        Err(EngineError::not_found("record", record_id))
    }
}

/// In-process record table, for tests and embedding.
#[derive(Default)]
pub struct MemoryRecords {
    records: RwLock<HashMap<Uuid, RecordSnapshot>>,
}

impl MemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: RecordSnapshot) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.record_id, record);
    }

    /// Overwrite one field, as the execution layer would after a field write.
    pub fn set_field(&self, record_id: Uuid, field: &str, value: Value) {
        if let Some(record) = self
            .records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&record_id)
        {
            record.fields.insert(field.to_owned(), value);
        }
    }
}

#[async_trait]
impl RecordReader for MemoryRecords {
    async fn snapshot(&self, record_id: Uuid) -> Result<RecordSnapshot, EngineError> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&record_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("record", record_id))
    }
}
