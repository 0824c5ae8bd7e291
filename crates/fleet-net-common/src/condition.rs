//! Condition helpers shared by every reconciler
//!
//! The equality helpers decide whether a status write is needed at all.
//! A current condition "matches" a desired one when its type, status and
//! reason agree and it was computed from the same or a newer generation, so
//! re-reconciling an unchanged object never writes.

use chrono::Utc;

use crate::crd::{Condition, ConditionStatus, InternalServiceExport, SERVICE_EXPORT_CONFLICT};

/// Reason for an export that agrees with the resolved Service spec
pub const REASON_NO_CONFLICT_FOUND: &str = "NoConflictFound";

/// Reason for an export whose ports differ from the resolved Service spec
pub const REASON_CONFLICT_FOUND: &str = "ConflictFound";

/// Type, status and reason match and `current` is not older than `desired`
pub fn equal_condition(current: Option<&Condition>, desired: Option<&Condition>) -> bool {
    match (current, desired) {
        (None, None) => true,
        (Some(c), Some(d)) => {
            c.type_ == d.type_
                && c.status == d.status
                && c.reason == d.reason
                && c.observed_generation >= d.observed_generation
        }
        _ => false,
    }
}

/// Like [`equal_condition`], but the message must match too
pub fn equal_condition_with_message(current: Option<&Condition>, desired: Option<&Condition>) -> bool {
    equal_condition(current, desired)
        && current.map(|c| &c.message) == desired.map(|d| &d.message)
}

/// Find the condition of the given type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Insert or update a condition, keeping the transition time unless the status changed
pub fn set_status_condition(conditions: &mut Vec<Condition>, new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status != new.status {
                existing.status = new.status;
                existing.last_transition_time = Utc::now();
            }
            existing.reason = new.reason;
            existing.message = new.message;
            existing.observed_generation = new.observed_generation;
        }
        None => conditions.push(new),
    }
}

/// The condition is True and computed from `generation`
pub fn is_condition_status_true(cond: Option<&Condition>, generation: i64) -> bool {
    cond.is_some_and(|c| c.status == ConditionStatus::True && c.observed_generation == generation)
}

/// The condition is False and computed from `generation`
pub fn is_condition_status_false(cond: Option<&Condition>, generation: i64) -> bool {
    cond.is_some_and(|c| c.status == ConditionStatus::False && c.observed_generation == generation)
}

fn exported_service_name(claim: &InternalServiceExport) -> String {
    let svc = &claim.spec.service_reference;
    format!("{}/{}", svc.namespace, svc.name)
}

/// `Conflict=False/NoConflictFound` for a claim that agrees with the resolved spec
pub fn unconflicted_service_export_condition(claim: &InternalServiceExport) -> Condition {
    Condition::new(
        SERVICE_EXPORT_CONFLICT,
        ConditionStatus::False,
        REASON_NO_CONFLICT_FOUND,
        format!(
            "service {} is exported without conflict",
            exported_service_name(claim)
        ),
        claim.metadata.generation.unwrap_or_default(),
    )
}

/// `Conflict=True/ConflictFound` for a claim that disagrees with the resolved spec
pub fn conflicted_service_export_condition(claim: &InternalServiceExport) -> Condition {
    Condition::new(
        SERVICE_EXPORT_CONFLICT,
        ConditionStatus::True,
        REASON_CONFLICT_FOUND,
        format!(
            "service {} is in conflict with other exported services",
            exported_service_name(claim)
        ),
        claim.metadata.generation.unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ExportedObjectReference, InternalServiceExportSpec};
    use chrono::Duration;
    use kube::api::ObjectMeta;

    fn cond(status: ConditionStatus, reason: &str, generation: i64) -> Condition {
        Condition::new("Conflict", status, reason, "msg", generation)
    }

    fn claim(generation: i64) -> InternalServiceExport {
        InternalServiceExport {
            metadata: ObjectMeta {
                name: Some("work-app".to_string()),
                namespace: Some("fleet-member-a".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: InternalServiceExportSpec {
                service_reference: ExportedObjectReference {
                    namespace: "work".to_string(),
                    name: "app".to_string(),
                    namespaced_name: "work/app".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
            status: None,
        }
    }

    /// Story: A re-reconcile of an unchanged object is a no-op
    ///
    /// The current condition was computed from a newer generation than the
    /// desired one, so no write is needed even though the desired condition
    /// was just built with a fresh timestamp.
    #[test]
    fn story_newer_observed_generation_counts_as_equal() {
        let current = cond(ConditionStatus::False, "NoConflictFound", 5);
        let desired = cond(ConditionStatus::False, "NoConflictFound", 4);
        assert!(equal_condition(Some(&current), Some(&desired)));
        assert!(!equal_condition(Some(&desired), Some(&current)));
    }

    #[test]
    fn equal_condition_checks_status_and_reason() {
        let a = cond(ConditionStatus::False, "NoConflictFound", 1);
        assert!(!equal_condition(
            Some(&a),
            Some(&cond(ConditionStatus::True, "NoConflictFound", 1))
        ));
        assert!(!equal_condition(
            Some(&a),
            Some(&cond(ConditionStatus::False, "ConflictFound", 1))
        ));
        assert!(equal_condition(None, None));
        assert!(!equal_condition(Some(&a), None));
        assert!(!equal_condition(None, Some(&a)));
    }

    #[test]
    fn message_sensitive_variant() {
        let a = cond(ConditionStatus::True, "ServiceIsValid", 1);
        let mut b = a.clone();
        assert!(equal_condition_with_message(Some(&a), Some(&b)));
        b.message = "different".to_string();
        assert!(equal_condition(Some(&a), Some(&b)));
        assert!(!equal_condition_with_message(Some(&a), Some(&b)));
    }

    /// Story: Transition time only moves when the status flips
    #[test]
    fn story_set_status_condition_preserves_transition_time() {
        let mut conditions = vec![cond(ConditionStatus::False, "NoConflictFound", 1)];
        let original = conditions[0].last_transition_time - Duration::hours(1);
        conditions[0].last_transition_time = original;

        set_status_condition(
            &mut conditions,
            Condition::new("Conflict", ConditionStatus::False, "NoConflictFound", "again", 2),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, original);
        assert_eq!(conditions[0].observed_generation, 2);
        assert_eq!(conditions[0].message, "again");

        set_status_condition(
            &mut conditions,
            cond(ConditionStatus::True, "ConflictFound", 3),
        );
        assert!(conditions[0].last_transition_time > original);

        set_status_condition(
            &mut conditions,
            Condition::new("Valid", ConditionStatus::True, "ServiceIsValid", "", 3),
        );
        assert_eq!(conditions.len(), 2);
        assert!(find_condition(&conditions, "Valid").is_some());
    }

    #[test]
    fn conflict_condition_builders() {
        let c = claim(7);
        let ok = unconflicted_service_export_condition(&c);
        assert_eq!(ok.type_, "Conflict");
        assert_eq!(ok.status, ConditionStatus::False);
        assert_eq!(ok.reason, "NoConflictFound");
        assert_eq!(ok.message, "service work/app is exported without conflict");
        assert_eq!(ok.observed_generation, 7);

        let bad = conflicted_service_export_condition(&c);
        assert_eq!(bad.status, ConditionStatus::True);
        assert_eq!(bad.reason, "ConflictFound");
        assert_eq!(
            bad.message,
            "service work/app is in conflict with other exported services"
        );
    }

    #[test]
    fn status_true_false_require_current_generation() {
        let c = Condition::new("Programmed", ConditionStatus::True, "Programmed", "", 2);
        assert!(is_condition_status_true(Some(&c), 2));
        assert!(!is_condition_status_true(Some(&c), 3));
        assert!(!is_condition_status_false(Some(&c), 2));
        assert!(!is_condition_status_true(None, 2));
    }
}
