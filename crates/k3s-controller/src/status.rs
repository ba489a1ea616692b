//! Condition bookkeeping for `K3s` status.
use chrono::{SecondsFormat, Utc};

use crate::api::{Condition, K3sStatus};

/// Condition reporting whether the cluster answered its last probe.
pub const READY: &str = "Ready";
/// Condition reporting that the cluster is still being brought up or checked.
pub const RECONCILING: &str = "Reconciling";

const TRUE: &str = "True";
const FALSE: &str = "False";

/// Marks the cluster as serving: `Ready=True`, `Reconciling=False`.
pub fn set_active(status: &mut K3sStatus) {
    let now = now();
    set_condition(&mut status.conditions, READY, TRUE, "Probed", "", &now);
    set_condition(&mut status.conditions, RECONCILING, FALSE, "", "", &now);
}

/// Marks the cluster as not serving yet, with `message` explaining why.
pub fn set_transitioning(status: &mut K3sStatus, message: &str) {
    let now = now();
    set_condition(&mut status.conditions, READY, FALSE, "Probing", message, &now);
    set_condition(&mut status.conditions, RECONCILING, TRUE, "Probing", message, &now);
}

/// Looks up a condition by type.
pub fn condition<'a>(status: &'a K3sStatus, type_: &str) -> Option<&'a Condition> {
    status.conditions.iter().find(|c| c.type_ == type_)
}

/// Upserts a condition by type. The transition time only moves when the
/// condition's status changes.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    now: &str,
) {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = now.to_string();
            }
            existing.status = status.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.last_update_time = now.to_string();
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: now.to_string(),
            last_update_time: now.to_string(),
        }),
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn conditions_are_upserted_by_type() {
        let mut conditions = vec![];
        set_condition(&mut conditions, READY, FALSE, "Probing", "down", "t1");
        set_condition(&mut conditions, READY, FALSE, "Probing", "still down", "t2");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "still down");
        assert_eq!(conditions[0].last_transition_time, "t1");
        assert_eq!(conditions[0].last_update_time, "t2");

        set_condition(&mut conditions, READY, TRUE, "Probed", "", "t3");
        assert_eq!(conditions[0].last_transition_time, "t3");
    }

    #[test]
    fn active_and_transitioning_flip_both_conditions() {
        let mut status = K3sStatus::default();
        set_transitioning(&mut status, "status check in-progress: refused");
        assert_eq!(condition(&status, READY).unwrap().status, "False");
        assert_eq!(condition(&status, RECONCILING).unwrap().status, "True");
        assert_eq!(
            condition(&status, READY).unwrap().message,
            "status check in-progress: refused"
        );

        set_active(&mut status);
        assert_eq!(condition(&status, READY).unwrap().status, "True");
        assert_eq!(condition(&status, RECONCILING).unwrap().status, "False");
        assert_eq!(status.conditions.len(), 2);
    }
}
