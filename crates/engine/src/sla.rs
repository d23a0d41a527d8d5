//! SLA tracking: how much of a state's time budget a record has used, and
//! which escalations are due.
//!
//! Time arithmetic goes through a [`BusinessCalendar`] so hosts can plug in
//! their own working hours and holidays. [`StandardCalendar`] counts 09:00 to
//! 17:00 UTC for business-hours SLAs and drops Saturdays and Sundays for
//! SLAs that exclude weekends.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{BlueprintSla, EscalationTrigger, SlaEscalation};

// ---------------------------------------------------------------------------
// Calendar
// ---------------------------------------------------------------------------

pub trait BusinessCalendar: Send + Sync {
    /// Seconds between `from` and `to` that count towards `sla`'s budget.
    fn elapsed_seconds(&self, sla: &BlueprintSla, from: DateTime<Utc>, to: DateTime<Utc>) -> i64;

    /// The instant at which `seconds` of counted time have passed since `start`.
    fn add_seconds(&self, sla: &BlueprintSla, start: DateTime<Utc>, seconds: i64) -> DateTime<Utc>;
}

/// Fixed working day in UTC, Monday to Friday when weekends are excluded.
#[derive(Debug, Clone, Copy)]
pub struct StandardCalendar {
    pub open_hour: u32,
    pub close_hour: u32,
}

impl Default for StandardCalendar {
    fn default() -> Self {
        Self { open_hour: 9, close_hour: 17 }
    }
}

/// Upper bound on days walked when adding counted time.
const MAX_CALENDAR_DAYS: u32 = 36_500;

impl StandardCalendar {
    fn is_wall_clock(sla: &BlueprintSla) -> bool {
        !sla.business_hours_only && !sla.exclude_weekends
    }

    /// The counted window of `date`, if any part of it counts.
    fn window(&self, sla: &BlueprintSla, date: NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if sla.exclude_weekends && matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return None;
        }
        let at = |hour: u32| {
            NaiveTime::from_hms_opt(hour, 0, 0).map(|t| Utc.from_utc_datetime(&date.and_time(t)))
        };
        if sla.business_hours_only {
            Some((at(self.open_hour)?, at(self.close_hour)?))
        } else {
            let start = at(0)?;
            Some((start, start + Duration::days(1)))
        }
    }
}

impl BusinessCalendar for StandardCalendar {
    fn elapsed_seconds(&self, sla: &BlueprintSla, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
        if to <= from {
            return 0;
        }
        if Self::is_wall_clock(sla) {
            return (to - from).num_seconds();
        }

        let mut total = 0;
        let mut date = from.date_naive();
        while date <= to.date_naive() {
            if let Some((open, close)) = self.window(sla, date) {
                let lo = open.max(from);
                let hi = close.min(to);
                if hi > lo {
                    total += (hi - lo).num_seconds();
                }
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        total
    }

    fn add_seconds(&self, sla: &BlueprintSla, start: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
        if Self::is_wall_clock(sla) || seconds <= 0 {
            return start + Duration::seconds(seconds.max(0));
        }

        let mut remaining = seconds;
        let mut date = start.date_naive();
        for _ in 0..MAX_CALENDAR_DAYS {
            if let Some((open, close)) = self.window(sla, date) {
                let lo = open.max(start);
                if close > lo {
                    let available = (close - lo).num_seconds();
                    if remaining <= available {
                        return lo + Duration::seconds(remaining);
                    }
                    remaining -= available;
                }
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        start + Duration::seconds(seconds)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaPhase {
    Active,
    /// The record left the state before the budget ran out.
    Completed,
    Breached,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlaStatus {
    pub sla_id: Uuid,
    pub sla_name: String,
    pub state_id: Uuid,
    pub entered_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    /// Reported within `0..=100`.
    pub percentage_elapsed: f64,
    /// Negative once overdue.
    pub remaining_seconds: i64,
    pub status: SlaPhase,
    pub is_breached: bool,
    pub is_approaching: bool,
}

/// Percentage at which `sla` counts as approaching: the lowest threshold among
/// its approaching escalations, else `default_percent`.
pub fn approaching_threshold(sla: &BlueprintSla, default_percent: f64) -> f64 {
    sla.escalations
        .iter()
        .filter(|e| e.trigger == EscalationTrigger::Approaching)
        .filter_map(|e| e.trigger_value)
        .min()
        .map(f64::from)
        .unwrap_or(default_percent)
}

/// Raw elapsed percentage, may exceed 100.
fn raw_percentage(
    sla: &BlueprintSla,
    entered_at: DateTime<Utc>,
    until: DateTime<Utc>,
    calendar: &dyn BusinessCalendar,
) -> f64 {
    let budget = i64::from(sla.duration_hours) * 3600;
    if budget == 0 {
        return 100.0;
    }
    calendar.elapsed_seconds(sla, entered_at, until) as f64 / budget as f64 * 100.0
}

/// Compute the SLA status for a residency that began at `entered_at`.
///
/// `left_at` is set when the record has already transitioned out of the state.
pub fn status(
    sla: &BlueprintSla,
    entered_at: DateTime<Utc>,
    left_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    calendar: &dyn BusinessCalendar,
    default_approaching_percent: f64,
) -> SlaStatus {
    let budget = i64::from(sla.duration_hours) * 3600;
    let due_at = calendar.add_seconds(sla, entered_at, budget);
    let until = left_at.unwrap_or(now);

    let percentage = raw_percentage(sla, entered_at, until, calendar);
    let overdue = until > due_at;

    let status = match (left_at, overdue) {
        (_, true) => SlaPhase::Breached,
        (Some(_), false) => SlaPhase::Completed,
        (None, false) => SlaPhase::Active,
    };
    let remaining_seconds = match status {
        SlaPhase::Completed => 0,
        _ => budget - calendar.elapsed_seconds(sla, entered_at, until),
    };
    let is_approaching = status == SlaPhase::Active
        && percentage >= approaching_threshold(sla, default_approaching_percent);

    SlaStatus {
        sla_id: sla.id,
        sla_name: sla.name.clone(),
        state_id: sla.state_id,
        entered_at,
        due_at,
        percentage_elapsed: percentage.clamp(0.0, 100.0),
        remaining_seconds,
        status,
        is_breached: status == SlaPhase::Breached,
        is_approaching,
    }
}

/// Escalations whose trigger has been reached for a record still in the state,
/// in display order. Firing-once bookkeeping is the caller's job.
pub fn due_escalations<'a>(
    sla: &'a BlueprintSla,
    entered_at: DateTime<Utc>,
    now: DateTime<Utc>,
    calendar: &dyn BusinessCalendar,
    default_approaching_percent: f64,
) -> Vec<&'a SlaEscalation> {
    let percentage = raw_percentage(sla, entered_at, now, calendar);
    let due_at = calendar.add_seconds(sla, entered_at, i64::from(sla.duration_hours) * 3600);

    let mut due: Vec<&SlaEscalation> = sla
        .escalations
        .iter()
        .filter(|e| match e.trigger {
            EscalationTrigger::Approaching => {
                let threshold = e.trigger_value.map(f64::from).unwrap_or(default_approaching_percent);
                percentage >= threshold
            }
            EscalationTrigger::Breached => now > due_at,
        })
        .collect();
    due.sort_by_key(|e| e.display_order);
    due
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sla(hours: u32) -> BlueprintSla {
        BlueprintSla::new(Uuid::new_v4(), Uuid::new_v4(), "response", hours)
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn wall_clock_breach_after_budget() {
        let s = sla(4);
        let now = Utc::now();
        let st = status(&s, now - Duration::hours(5), None, now, &StandardCalendar::default(), 80.0);
        assert!(st.is_breached);
        assert_eq!(st.status, SlaPhase::Breached);
        assert!(st.percentage_elapsed >= 100.0);
        assert!(st.remaining_seconds < 0);
    }

    #[test]
    fn wall_clock_half_way_is_active() {
        let s = sla(4);
        let now = Utc::now();
        let st = status(&s, now - Duration::hours(2), None, now, &StandardCalendar::default(), 80.0);
        assert_eq!(st.status, SlaPhase::Active);
        assert!((st.percentage_elapsed - 50.0).abs() < 0.01);
        assert_eq!(st.remaining_seconds, 2 * 3600);
        assert!(!st.is_approaching);
    }

    #[test]
    fn approaching_uses_lowest_escalation_threshold() {
        let mut s = sla(10);
        s.escalations.push(SlaEscalation::new(EscalationTrigger::Approaching, Some(90), "notify_user"));
        s.escalations.push(SlaEscalation::new(EscalationTrigger::Approaching, Some(60), "notify_user"));
        let now = Utc::now();
        let st = status(&s, now - Duration::hours(7), None, now, &StandardCalendar::default(), 80.0);
        assert!(st.is_approaching);
    }

    #[test]
    fn approaching_defaults_to_config_percent() {
        let s = sla(10);
        let now = Utc::now();
        let cal = StandardCalendar::default();
        assert!(!status(&s, now - Duration::hours(7), None, now, &cal, 80.0).is_approaching);
        assert!(status(&s, now - Duration::hours(8), None, now, &cal, 80.0).is_approaching);
    }

    #[test]
    fn exactly_at_due_is_not_yet_breached() {
        let mut s = sla(4);
        s.escalations.push(SlaEscalation::new(EscalationTrigger::Breached, None, "notify_user"));
        let cal = StandardCalendar::default();
        let entered = at(2026, 3, 2, 10, 0);
        let due = entered + Duration::hours(4);

        let st = status(&s, entered, None, due, &cal, 80.0);
        assert_eq!(st.due_at, due);
        assert_eq!(st.status, SlaPhase::Active);
        assert!(!st.is_breached);
        assert_eq!(st.remaining_seconds, 0);
        assert!(due_escalations(&s, entered, due, &cal, 80.0).is_empty());

        let later = due + Duration::seconds(1);
        assert!(status(&s, entered, None, later, &cal, 80.0).is_breached);
        assert_eq!(due_escalations(&s, entered, later, &cal, 80.0).len(), 1);
    }

    #[test]
    fn leaving_before_due_completes() {
        let s = sla(4);
        let entered = at(2026, 3, 2, 10, 0);
        let st = status(&s, entered, Some(entered + Duration::hours(1)), entered + Duration::hours(9), &StandardCalendar::default(), 80.0);
        assert_eq!(st.status, SlaPhase::Completed);
        assert!(!st.is_breached);
    }

    #[test]
    fn business_hours_skip_nights() {
        let mut s = sla(4);
        s.business_hours_only = true;
        let cal = StandardCalendar::default();
        // Monday 15:00 + 4 business hours = Tuesday 11:00.
        let entered = at(2026, 3, 2, 15, 0);
        assert_eq!(cal.add_seconds(&s, entered, 4 * 3600), at(2026, 3, 3, 11, 0));

        let st = status(&s, entered, None, at(2026, 3, 3, 9, 0), &cal, 80.0);
        assert_eq!(st.status, SlaPhase::Active);
        assert!((st.percentage_elapsed - 50.0).abs() < 0.01);
    }

    #[test]
    fn business_hours_with_weekends_excluded() {
        let mut s = sla(8);
        s.business_hours_only = true;
        s.exclude_weekends = true;
        let cal = StandardCalendar::default();
        // Friday 13:00 + 8 business hours = Monday 13:00.
        let entered = at(2026, 3, 6, 13, 0);
        assert_eq!(cal.add_seconds(&s, entered, 8 * 3600), at(2026, 3, 9, 13, 0));
        assert_eq!(cal.elapsed_seconds(&s, entered, at(2026, 3, 8, 23, 0)), 4 * 3600);
    }

    #[test]
    fn weekends_excluded_counts_full_weekdays() {
        let mut s = sla(24);
        s.exclude_weekends = true;
        let cal = StandardCalendar::default();
        // Friday noon + 24h skipping the weekend = Monday noon.
        let entered = at(2026, 3, 6, 12, 0);
        assert_eq!(cal.add_seconds(&s, entered, 24 * 3600), at(2026, 3, 9, 12, 0));
    }

    #[test]
    fn escalations_due_by_trigger() {
        let mut s = sla(10);
        s.escalations.push(SlaEscalation::new(EscalationTrigger::Breached, None, "notify_user"));
        s.escalations.push(SlaEscalation::new(EscalationTrigger::Approaching, Some(50), "send_email"));
        let cal = StandardCalendar::default();
        let now = Utc::now();

        let early = due_escalations(&s, now - Duration::hours(2), now, &cal, 80.0);
        assert!(early.is_empty());

        let mid = due_escalations(&s, now - Duration::hours(6), now, &cal, 80.0);
        assert_eq!(mid.len(), 1);
        assert_eq!(mid[0].action_type, "send_email");

        let late = due_escalations(&s, now - Duration::hours(11), now, &cal, 80.0);
        assert_eq!(late.len(), 2);
    }
}
