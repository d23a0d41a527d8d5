//! Approval gate: who gets asked, how individual decisions fold into the
//! gate's outcome, and what happens to requests nobody answers (reminders,
//! escalation, expiry).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Approval, ApproverSource, EscalationTarget};
use crate::record::RecordSnapshot;
use crate::runtime::{ApprovalRequest, ApprovalRequestStatus, ApprovalState, GateStatus};
use crate::EngineError;

/// A single approver's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn request_status(self) -> ApprovalRequestStatus {
        match self {
            Self::Approve => ApprovalRequestStatus::Approved,
            Self::Reject => ApprovalRequestStatus::Rejected,
        }
    }
}

// ---------------------------------------------------------------------------
// Approver resolution
// ---------------------------------------------------------------------------

/// User directory lookups needed to turn an approver config into user IDs.
#[async_trait]
pub trait ApproverResolver: Send + Sync {
    /// Users holding any of `role_ids`.
    async fn users_with_roles(&self, role_ids: &[String]) -> Result<Vec<Uuid>, EngineError>;

    /// Managers above `user_id`, nearest first, at most `levels` deep.
    async fn manager_chain(&self, user_id: Uuid, levels: u32) -> Result<Vec<Uuid>, EngineError>;
}

/// Resolver with no directory behind it: roles and managers resolve to nobody.
pub struct NoDirectory;

#[async_trait]
impl ApproverResolver for NoDirectory {
    async fn users_with_roles(&self, _role_ids: &[String]) -> Result<Vec<Uuid>, EngineError> {
        Ok(Vec::new())
    }

    async fn manager_chain(&self, _user_id: Uuid, _levels: u32) -> Result<Vec<Uuid>, EngineError> {
        Ok(Vec::new())
    }
}

/// Fixed role and reporting tables.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    pub roles: HashMap<String, Vec<Uuid>>,
    /// user → direct manager
    pub managers: HashMap<Uuid, Uuid>,
}

impl StaticDirectory {
    pub fn with_role(mut self, role: impl Into<String>, users: Vec<Uuid>) -> Self {
        self.roles.insert(role.into(), users);
        self
    }

    pub fn with_manager(mut self, user: Uuid, manager: Uuid) -> Self {
        self.managers.insert(user, manager);
        self
    }
}

#[async_trait]
impl ApproverResolver for StaticDirectory {
    async fn users_with_roles(&self, role_ids: &[String]) -> Result<Vec<Uuid>, EngineError> {
        Ok(role_ids
            .iter()
            .filter_map(|r| self.roles.get(r))
            .flatten()
            .copied()
            .collect())
    }

    async fn manager_chain(&self, user_id: Uuid, levels: u32) -> Result<Vec<Uuid>, EngineError> {
        let mut chain = Vec::new();
        let mut current = user_id;
        for _ in 0..levels {
            match self.managers.get(&current) {
                Some(&manager) if !chain.contains(&manager) => {
                    chain.push(manager);
                    current = manager;
                }
                _ => break,
            }
        }
        Ok(chain)
    }
}

/// Resolve the concrete approver set for `approval` against `record`.
///
/// The result is de-duplicated and keeps first-seen order. It may be empty;
/// the caller decides what an empty set means.
pub async fn resolve_approvers(
    approval: &Approval,
    record: &RecordSnapshot,
    resolver: &dyn ApproverResolver,
) -> Result<Vec<Uuid>, EngineError> {
    let candidates = match &approval.approvers {
        ApproverSource::SpecificUsers { user_ids } => user_ids.clone(),
        ApproverSource::RoleBased { role_ids } => resolver.users_with_roles(role_ids).await?,
        ApproverSource::Manager { levels } => match record.owner_id {
            Some(owner) => resolver.manager_chain(owner, *levels).await?,
            None => Vec::new(),
        },
        ApproverSource::FieldValue { field } => record
            .fields
            .get(field)
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .into_iter()
            .collect(),
    };

    let mut seen = HashSet::new();
    Ok(candidates.into_iter().filter(|id| seen.insert(*id)).collect())
}

// ---------------------------------------------------------------------------
// Gate arithmetic
// ---------------------------------------------------------------------------

/// Fold the individual requests of one gate into its outcome.
///
/// Any rejection rejects. With `require_all` every request must be approved;
/// otherwise the first approval is enough.
pub fn aggregate(require_all: bool, requests: &[ApprovalRequest]) -> GateStatus {
    let mut approved = 0usize;
    for request in requests {
        match request.status {
            ApprovalRequestStatus::Rejected | ApprovalRequestStatus::Expired => return GateStatus::Rejected,
            ApprovalRequestStatus::Approved => approved += 1,
            _ => {}
        }
    }

    let done = if require_all { approved == requests.len() && approved > 0 } else { approved > 0 };
    if done {
        GateStatus::Approved
    } else {
        GateStatus::Pending
    }
}

/// When an undecided gate is rejected automatically, if ever.
pub fn auto_reject_at(approval: &Approval, state: &ApprovalState) -> Option<DateTime<Utc>> {
    approval
        .auto_reject_days
        .map(|days| state.entered_at + Duration::days(i64::from(days)))
}

pub fn is_expired(approval: &Approval, state: &ApprovalState, now: DateTime<Utc>) -> bool {
    state.status == GateStatus::Pending && auto_reject_at(approval, state).is_some_and(|at| now >= at)
}

pub fn auto_reject_reason(days: u32) -> String {
    format!("Automatically rejected after {days} days without response")
}

// ---------------------------------------------------------------------------
// Follow-up on unanswered requests
// ---------------------------------------------------------------------------

/// A pending request that has waited `escalation_hours` and was never escalated.
pub fn should_escalate(approval: &Approval, request: &ApprovalRequest, now: DateTime<Utc>) -> bool {
    let (Some(hours), Some(_)) = (approval.escalation_hours, &approval.escalate_to) else {
        return false;
    };
    request.status == ApprovalRequestStatus::Pending
        && request.escalated_at.is_none()
        && now - request.created_at >= Duration::hours(i64::from(hours))
}

/// A pending request due another reminder: `reminder_hours` since the last
/// one (or since it was created) and fewer than `max_reminders` sent.
pub fn should_remind(approval: &Approval, request: &ApprovalRequest, now: DateTime<Utc>) -> bool {
    let Some(hours) = approval.reminder_hours else {
        return false;
    };
    let since = request.last_reminder_at.unwrap_or(request.created_at);
    request.status == ApprovalRequestStatus::Pending
        && request.reminder_count < approval.max_reminders
        && now - since >= Duration::hours(i64::from(hours))
}

pub fn escalation_reason(hours: u32) -> String {
    format!("Escalated after {hours} hours without response")
}

/// The user an unanswered `request` is escalated to, if one can be found.
pub async fn escalation_target(
    target: &EscalationTarget,
    request: &ApprovalRequest,
    resolver: &dyn ApproverResolver,
) -> Result<Option<Uuid>, EngineError> {
    Ok(match target {
        EscalationTarget::Manager => {
            let of = request.original_approver_id.unwrap_or(request.requested_by);
            resolver.manager_chain(of, 1).await?.first().copied()
        }
        EscalationTarget::SpecificUser { user_id } => Some(*user_id),
        EscalationTarget::Role { role_ids } => resolver.users_with_roles(role_ids).await?.first().copied(),
    })
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(status: ApprovalRequestStatus) -> ApprovalRequest {
        ApprovalRequest {
            id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            record_id: Uuid::new_v4(),
            approver_id: Uuid::new_v4(),
            requested_by: Uuid::new_v4(),
            status,
            comments: None,
            responded_at: None,
            created_at: Utc::now(),
            original_approver_id: None,
            delegation_id: None,
            escalated_at: None,
            reminder_count: 0,
            last_reminder_at: None,
        }
    }

    fn waiting(hours: i64) -> ApprovalRequest {
        let mut r = request(ApprovalRequestStatus::Pending);
        r.created_at = Utc::now() - Duration::hours(hours);
        r
    }

    use ApprovalRequestStatus::{Approved, Pending, Rejected};

    #[test]
    fn require_all_waits_for_everyone() {
        assert_eq!(aggregate(true, &[request(Approved), request(Approved), request(Pending)]), GateStatus::Pending);
        assert_eq!(aggregate(true, &[request(Approved), request(Approved), request(Approved)]), GateStatus::Approved);
        assert_eq!(aggregate(true, &[request(Approved), request(Rejected), request(Pending)]), GateStatus::Rejected);
    }

    #[test]
    fn first_decision_wins_without_require_all() {
        assert_eq!(aggregate(false, &[request(Pending), request(Approved)]), GateStatus::Approved);
        assert_eq!(aggregate(false, &[request(Rejected), request(Pending)]), GateStatus::Rejected);
        assert_eq!(aggregate(false, &[request(Pending)]), GateStatus::Pending);
    }

    #[test]
    fn expiry_follows_auto_reject_days() {
        let mut approval = Approval::new(ApproverSource::Manager { levels: 1 });
        let state = ApprovalState {
            status: GateStatus::Pending,
            require_all: false,
            entered_at: Utc::now() - Duration::days(3),
            decided_at: None,
        };
        assert!(!is_expired(&approval, &state, Utc::now()));

        approval.auto_reject_days = Some(2);
        assert!(is_expired(&approval, &state, Utc::now()));

        approval.auto_reject_days = Some(5);
        assert!(!is_expired(&approval, &state, Utc::now()));
    }

    #[test]
    fn reason_names_the_day_count() {
        assert_eq!(auto_reject_reason(3), "Automatically rejected after 3 days without response");
    }

    #[test]
    fn escalates_once_after_the_configured_hours() {
        let mut approval = Approval::new(ApproverSource::Manager { levels: 1 });
        let now = Utc::now();
        assert!(!should_escalate(&approval, &waiting(100), now), "not configured");

        approval.escalation_hours = Some(24);
        approval.escalate_to = Some(EscalationTarget::Manager);
        assert!(!should_escalate(&approval, &waiting(23), now));
        assert!(should_escalate(&approval, &waiting(24), now));

        let mut done = waiting(48);
        done.escalated_at = Some(now - Duration::hours(1));
        assert!(!should_escalate(&approval, &done, now));

        assert_eq!(escalation_reason(24), "Escalated after 24 hours without response");
    }

    #[test]
    fn reminders_are_spaced_and_capped() {
        let mut approval = Approval::new(ApproverSource::Manager { levels: 1 });
        approval.reminder_hours = Some(8);
        approval.max_reminders = 2;
        let now = Utc::now();

        assert!(!should_remind(&approval, &waiting(7), now));
        let mut r = waiting(9);
        assert!(should_remind(&approval, &r, now));

        r.reminder_count = 1;
        r.last_reminder_at = Some(now - Duration::hours(2));
        assert!(!should_remind(&approval, &r, now), "too soon after the last one");
        r.last_reminder_at = Some(now - Duration::hours(8));
        assert!(should_remind(&approval, &r, now));

        r.reminder_count = 2;
        assert!(!should_remind(&approval, &r, now), "cap reached");
    }

    #[tokio::test]
    async fn escalation_targets() {
        let (requester, boss, approver, approver_boss, auditor) =
            (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let directory = StaticDirectory::default()
            .with_manager(requester, boss)
            .with_manager(approver, approver_boss)
            .with_role("audit", vec![auditor]);

        let mut r = waiting(30);
        r.requested_by = requester;
        assert_eq!(escalation_target(&EscalationTarget::Manager, &r, &directory).await.unwrap(), Some(boss));

        r.original_approver_id = Some(approver);
        assert_eq!(
            escalation_target(&EscalationTarget::Manager, &r, &directory).await.unwrap(),
            Some(approver_boss)
        );

        let role = EscalationTarget::Role { role_ids: vec!["audit".into()] };
        assert_eq!(escalation_target(&role, &r, &directory).await.unwrap(), Some(auditor));
        assert_eq!(escalation_target(&role, &r, &NoDirectory).await.unwrap(), None);
    }

    #[tokio::test]
    async fn resolves_each_approver_source() {
        let (owner, manager, director, reviewer) =
            (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let directory = StaticDirectory::default()
            .with_role("finance", vec![reviewer, manager])
            .with_manager(owner, manager)
            .with_manager(manager, director);

        let mut record = RecordSnapshot::new(Uuid::new_v4(), json!({ "reviewer": reviewer.to_string() }));
        record.owner_id = Some(owner);

        let roles = Approval::new(ApproverSource::RoleBased { role_ids: vec!["finance".into(), "finance".into()] });
        assert_eq!(resolve_approvers(&roles, &record, &directory).await.unwrap(), vec![reviewer, manager]);

        let chain = Approval::new(ApproverSource::Manager { levels: 2 });
        assert_eq!(resolve_approvers(&chain, &record, &directory).await.unwrap(), vec![manager, director]);

        let by_field = Approval::new(ApproverSource::FieldValue { field: "reviewer".into() });
        assert_eq!(resolve_approvers(&by_field, &record, &directory).await.unwrap(), vec![reviewer]);

        let nobody = Approval::new(ApproverSource::Manager { levels: 1 });
        assert!(resolve_approvers(&nobody, &record, &NoDirectory).await.unwrap().is_empty());
    }
}
