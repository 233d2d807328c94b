//! Status conditions and the rules for transitioning them.
//!
//! A condition list holds at most one entry per `type`. Types are only ever
//! appended or transitioned in place, never removed, so the relative order of
//! existing entries is stable.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// New condition stamped with the current time.
    pub fn new(type_: &str, status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Same condition with an explicit transition time.
    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.last_transition_time = ts;
        self
    }
}

/// Apply `new` to `conditions`.
///
/// - unknown type: appended
/// - known type, different status: replaced at its position, taking `new`'s timestamp
/// - known type, same status: reason and message refreshed, timestamp kept
///
/// Returns whether the list changed in any field.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) -> bool {
    let Some(idx) = conditions.iter().position(|c| c.type_ == new.type_) else {
        conditions.push(new);
        return true;
    };
    let existing = &mut conditions[idx];
    if existing.status != new.status {
        *existing = new;
        return true;
    }
    let mut changed = false;
    if existing.reason != new.reason {
        existing.reason = new.reason;
        changed = true;
    }
    if existing.message != new.message {
        existing.message = new.message;
        changed = true;
    }
    changed
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).map(|c| c.status == ConditionStatus::True).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn cond(type_: &str, status: ConditionStatus, reason: &str, at: i64) -> Condition {
        Condition::new(type_, status, reason, "msg").at(ts(at))
    }

    #[test]
    fn appends_new_types_in_order() {
        let mut v = Vec::new();
        assert!(set_condition(&mut v, cond("Available", ConditionStatus::Unknown, "Reconciling", 1)));
        assert!(set_condition(&mut v, cond("Degraded", ConditionStatus::False, "Ok", 2)));
        let types: Vec<_> = v.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, ["Available", "Degraded"]);
    }

    #[test]
    fn identical_status_keeps_transition_time() {
        let mut v = vec![cond("Available", ConditionStatus::True, "Reconciled", 10)];
        for at in 11..15 {
            set_condition(&mut v, cond("Available", ConditionStatus::True, "Reconciled", at));
        }
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].last_transition_time, ts(10));
    }

    #[test]
    fn identical_status_refreshes_reason_without_touching_time() {
        let mut v = vec![cond("Available", ConditionStatus::False, "Reconciling", 10)];
        let changed = set_condition(&mut v, cond("Available", ConditionStatus::False, "Resizing", 20));
        assert!(changed);
        assert_eq!(v[0].reason, "Resizing");
        assert_eq!(v[0].last_transition_time, ts(10));
        assert!(!set_condition(&mut v, cond("Available", ConditionStatus::False, "Resizing", 30)));
    }

    #[test]
    fn status_flip_rewrites_in_place_and_stamps_time() {
        let mut v = vec![
            cond("Available", ConditionStatus::Unknown, "Reconciling", 1),
            cond("Degraded", ConditionStatus::False, "Ok", 1),
        ];
        assert!(set_condition(&mut v, cond("Available", ConditionStatus::True, "Reconciled", 5)));
        assert_eq!(v.len(), 2);
        assert_eq!(v[0].type_, "Available");
        assert_eq!(v[0].status, ConditionStatus::True);
        assert_eq!(v[0].last_transition_time, ts(5));
        assert_eq!(v[1].type_, "Degraded");
    }

    #[test]
    fn never_duplicates_a_type() {
        let mut v = Vec::new();
        let statuses = [ConditionStatus::Unknown, ConditionStatus::False, ConditionStatus::True, ConditionStatus::False];
        for (i, s) in statuses.into_iter().enumerate() {
            set_condition(&mut v, cond("Available", s, "r", i as i64));
            set_condition(&mut v, cond("Progressing", s, "r", i as i64));
        }
        assert_eq!(v.len(), 2);
        assert!(!is_condition_true(&v, "Available"));
        assert_eq!(find_condition(&v, "Progressing").map(|c| c.status), Some(ConditionStatus::False));
    }

    #[test]
    fn serializes_with_kube_field_names() {
        let c = cond("Available", ConditionStatus::True, "Reconciled", 0);
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "Available");
        assert_eq!(v["status"], "True");
        assert_eq!(v["lastTransitionTime"], "1970-01-01T00:00:00Z");
    }
}
