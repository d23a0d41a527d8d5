//! Requirement validation — checks what a user submitted against the
//! requirements declared on a transition.
//!
//! Submissions accumulate: each `submit_requirements` call is merged into the
//! execution's stored submission (last write wins per field, attachment name,
//! checklist item) and the whole set is re-validated.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::{ChecklistItem, Requirement, RequirementKind};

/// A file the user attached while the execution was open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// Which attachment requirement this file answers. `None` counts for all.
    #[serde(default)]
    pub requirement_id: Option<Uuid>,
}

/// Everything a caller can submit towards a transition's requirements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequirementSubmission {
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub attachments: Vec<AttachmentDescriptor>,
    #[serde(default)]
    pub note: Option<String>,
    /// Checklist item id → ticked.
    #[serde(default)]
    pub checklist: BTreeMap<String, bool>,
}

impl RequirementSubmission {
    pub fn note(text: impl Into<String>) -> Self {
        Self { note: Some(text.into()), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.attachments.is_empty() && self.note.is_none() && self.checklist.is_empty()
    }

    /// Fold `other` into `self`; later values replace earlier ones key by key.
    pub fn merge(&mut self, other: RequirementSubmission) {
        self.fields.extend(other.fields);
        for attachment in other.attachments {
            match self.attachments.iter_mut().find(|a| a.name == attachment.name) {
                Some(existing) => *existing = attachment,
                None => self.attachments.push(attachment),
            }
        }
        if other.note.is_some() {
            self.note = other.note;
        }
        self.checklist.extend(other.checklist);
    }
}

/// Field-type rules for `mandatory_field` requirements (email format, picklist
/// membership, ...). Owned by the module/field system.
pub trait FieldValidator: Send + Sync {
    fn validate(&self, field: &str, value: &Value) -> Result<(), String>;
}

/// Validator that accepts any non-empty value.
pub struct AcceptAll;

impl FieldValidator for AcceptAll {
    fn validate(&self, _field: &str, _value: &Value) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequirementCheck {
    pub satisfied: bool,
    pub unmet: Vec<Uuid>,
    /// Human readable reason per unmet requirement, same order as `unmet`.
    pub errors: Vec<String>,
}

/// Validate `submission` against every required entry of `requirements`.
pub fn validate(
    requirements: &[Requirement],
    submission: &RequirementSubmission,
    fields: &dyn FieldValidator,
) -> RequirementCheck {
    let mut check = RequirementCheck::default();

    for requirement in requirements.iter().filter(|r| r.is_required) {
        if let Err(reason) = check_one(requirement, submission, fields) {
            check.unmet.push(requirement.id);
            check.errors.push(format!("{}: {}", display_label(requirement), reason));
        }
    }

    check.satisfied = check.unmet.is_empty();
    check
}

fn check_one(
    requirement: &Requirement,
    submission: &RequirementSubmission,
    fields: &dyn FieldValidator,
) -> Result<(), String> {
    match &requirement.kind {
        RequirementKind::MandatoryField { field } => {
            let value = submission.fields.get(field).unwrap_or(&Value::Null);
            if is_blank(value) {
                return Err(format!("field '{field}' is required"));
            }
            fields.validate(field, value)
        }

        RequirementKind::Attachment { min_count, max_size, allowed_types } => {
            let relevant: Vec<&AttachmentDescriptor> = submission
                .attachments
                .iter()
                .filter(|a| a.requirement_id.map_or(true, |id| id == requirement.id))
                .collect();

            let needed = min_count.unwrap_or(1).max(1) as usize;
            if relevant.len() < needed {
                return Err(format!("at least {needed} attachment(s) required, got {}", relevant.len()));
            }
            for attachment in relevant {
                if let Some(max) = max_size {
                    if attachment.size_bytes > *max {
                        return Err(format!("'{}' exceeds the {max} byte limit", attachment.name));
                    }
                }
                if !allowed_types.is_empty() && !type_allowed(attachment, allowed_types) {
                    return Err(format!("'{}' has a disallowed type '{}'", attachment.name, attachment.mime_type));
                }
            }
            Ok(())
        }

        RequirementKind::Note { min_length } => {
            let note = submission.note.as_deref().map(str::trim).unwrap_or("");
            match min_length {
                Some(min) if note.chars().count() < *min => {
                    Err(format!("note must be at least {min} characters"))
                }
                Some(_) => Ok(()),
                None if note.is_empty() => Err("note is required".to_owned()),
                None => Ok(()),
            }
        }

        RequirementKind::Checklist { items } => {
            let missing: Vec<&str> = items
                .iter()
                .filter(|item| item.required)
                .filter(|item| !submission.checklist.get(&item.id).copied().unwrap_or(false))
                .map(|item| item.label.as_str())
                .collect();
            if missing.is_empty() {
                Ok(())
            } else {
                Err(format!("unchecked items: {}", missing.join(", ")))
            }
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn type_allowed(attachment: &AttachmentDescriptor, allowed: &[String]) -> bool {
    let name = attachment.name.to_lowercase();
    allowed.iter().any(|t| {
        let t = t.to_lowercase();
        if t.starts_with('.') {
            name.ends_with(&t)
        } else if let Some(prefix) = t.strip_suffix("/*") {
            attachment.mime_type.to_lowercase().starts_with(&format!("{prefix}/"))
        } else {
            attachment.mime_type.eq_ignore_ascii_case(&t)
        }
    })
}

fn display_label(requirement: &Requirement) -> String {
    if let Some(label) = &requirement.label {
        return label.clone();
    }
    match &requirement.kind {
        RequirementKind::MandatoryField { field } => format!("Field '{field}'"),
        RequirementKind::Attachment { .. } => "Attachment".to_owned(),
        RequirementKind::Note { .. } => "Note".to_owned(),
        RequirementKind::Checklist { .. } => "Checklist".to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Presentation
// ---------------------------------------------------------------------------

/// A requirement shaped for a caller that has to render an input for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormattedRequirement {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub label: String,
    pub description: Option<String>,
    pub is_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ChecklistItem>,
}

/// Format requirements in display order.
pub fn format_requirements(requirements: &[Requirement]) -> Vec<FormattedRequirement> {
    let mut sorted: Vec<&Requirement> = requirements.iter().collect();
    sorted.sort_by_key(|r| r.display_order);

    sorted
        .into_iter()
        .map(|r| {
            let mut out = FormattedRequirement {
                id: r.id,
                kind: r.kind.tag(),
                label: display_label(r),
                description: r.description.clone(),
                is_required: r.is_required,
                field: None,
                allowed_types: Vec::new(),
                max_size: None,
                min_count: None,
                min_length: None,
                items: Vec::new(),
            };
            match &r.kind {
                RequirementKind::MandatoryField { field } => out.field = Some(field.clone()),
                RequirementKind::Attachment { min_count, max_size, allowed_types } => {
                    out.min_count = Some(min_count.unwrap_or(1).max(1));
                    out.max_size = *max_size;
                    out.allowed_types = allowed_types.clone();
                }
                RequirementKind::Note { min_length } => out.min_length = *min_length,
                RequirementKind::Checklist { items } => out.items = items.clone(),
            }
            out
        })
        .collect()
}
