use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Container, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::{Resource, ResourceExt};

use crate::traits::HasConditions;

/// Tri-state view of a condition. A condition observed for an older generation
/// is reported as `Unknown`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn new_condition(
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) -> metav1::Condition {
    metav1::Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.into(),
        observed_generation,
        last_transition_time: metav1::Time(Utc::now()),
    }
}

// Upserts the provided condition into the list, keyed by type.
//
// The last transition time is only replaced when the status flips. Returns true if anything
// a reader could observe changed: status, reason, message or the observed generation.
pub fn upsert_condition(
    conditions: &mut Option<Vec<metav1::Condition>>,
    new_cond: metav1::Condition,
) -> bool {
    let conditions = conditions.get_or_insert_with(Vec::new);
    match conditions.iter_mut().find(|c| c.type_ == new_cond.type_) {
        Some(condition) if condition.status == new_cond.status => {
            let changed = condition.reason != new_cond.reason
                || condition.message != new_cond.message
                || condition.observed_generation != new_cond.observed_generation;
            condition.reason = new_cond.reason;
            condition.message = new_cond.message;
            condition.observed_generation = new_cond.observed_generation;
            changed
        }
        Some(condition) => {
            *condition = new_cond;
            true
        }
        None => {
            conditions.push(new_cond);
            true
        }
    }
}

// Sets the provided condition on any object so long as it implements the HasConditions trait.
pub fn set_condition<T: HasConditions>(obj: &mut T, new_cond: metav1::Condition) -> bool {
    upsert_condition(obj.get_conditions_mut(), new_cond)
}

pub fn get_condition<'a>(
    conditions: Option<&'a Vec<metav1::Condition>>,
    type_: &str,
) -> Option<&'a metav1::Condition> {
    conditions.and_then(|conditions| conditions.iter().find(|c| c.type_ == type_))
}

/// Status of the condition, taking staleness into account.
pub fn condition_status<T: HasConditions>(obj: &T, type_: &str) -> ConditionStatus {
    match get_condition(obj.get_conditions(), type_) {
        Some(c) if c.observed_generation == obj.generation() => match c.status.as_str() {
            "True" => ConditionStatus::True,
            "False" => ConditionStatus::False,
            _ => ConditionStatus::Unknown,
        },
        _ => ConditionStatus::Unknown,
    }
}

pub fn is_condition_true<T: HasConditions>(obj: &T, type_: &str) -> bool {
    condition_status(obj, type_) == ConditionStatus::True
}

/// Marks the provided resource as provisioned by the means of the Provisioned condition.
pub fn mark_provisioned<T: HasConditions>(obj: &mut T, reason: &str, message: &str) -> bool {
    let cond = new_condition(
        crate::consts::CONDITION_PROVISIONED,
        ConditionStatus::True,
        reason,
        message,
        obj.generation(),
    );
    set_condition(obj, cond)
}

// Returns true if the provided error is a not found error.
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

pub fn get_pod_container_by_name_mut<'a>(
    spec: &'a mut PodSpec,
    name: &str,
) -> Option<&'a mut Container> {
    spec.containers.iter_mut().find(|c| c.name == name)
}

// Returns true if the object carries an owner reference to the given uid.
pub fn is_owned_by<K: Resource>(obj: &K, owner_uid: &str) -> bool {
    obj.owner_references().iter().any(|r| r.uid == owner_uid)
}

// Returns true if every label of the selector is present on the provided label set.
pub fn labels_match(
    labels: &BTreeMap<String, String>,
    selector: &BTreeMap<String, String>,
) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

pub fn is_being_deleted<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

pub fn label_map<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::*;
    use crate::types::{ControlPlane, DataPlane};

    fn dataplane_with_generation(generation: i64) -> DataPlane {
        let mut dp = DataPlane::new("dp", Default::default());
        dp.metadata.generation = Some(generation);
        dp
    }

    #[test]
    fn set_condition_reports_noop_writes() {
        let mut dp = dataplane_with_generation(1);
        let cond = new_condition(
            CONDITION_READY,
            ConditionStatus::False,
            REASON_PODS_NOT_READY,
            "waiting",
            Some(1),
        );
        assert!(set_condition(&mut dp, cond.clone()));
        assert!(!set_condition(&mut dp, cond.clone()));

        let mut changed_message = cond.clone();
        changed_message.message = "still waiting".to_string();
        assert!(set_condition(&mut dp, changed_message));
    }

    #[test]
    fn set_condition_keeps_transition_time_unless_status_flips() {
        let mut dp = dataplane_with_generation(1);
        let mut cond = new_condition(
            CONDITION_READY,
            ConditionStatus::False,
            REASON_PODS_NOT_READY,
            "",
            Some(1),
        );
        cond.last_transition_time = metav1::Time(Utc::now() - chrono::Duration::hours(1));
        let original = cond.last_transition_time.clone();
        set_condition(&mut dp, cond);

        dp.metadata.generation = Some(2);
        let bumped = new_condition(
            CONDITION_READY,
            ConditionStatus::False,
            REASON_PODS_NOT_READY,
            "",
            Some(2),
        );
        assert!(set_condition(&mut dp, bumped));
        let stored = get_condition(dp.get_conditions(), CONDITION_READY).unwrap();
        assert_eq!(stored.last_transition_time, original);
        assert_eq!(stored.observed_generation, Some(2));

        let flipped =
            new_condition(CONDITION_READY, ConditionStatus::True, REASON_PODS_READY, "", Some(2));
        assert!(set_condition(&mut dp, flipped));
        let stored = get_condition(dp.get_conditions(), CONDITION_READY).unwrap();
        assert_ne!(stored.last_transition_time, original);
        assert_eq!(dp.get_conditions().unwrap().len(), 1);
    }

    #[test]
    fn stale_condition_is_unknown() {
        let mut cp = ControlPlane::new("cp", Default::default());
        cp.metadata.generation = Some(3);
        mark_provisioned(&mut cp, REASON_PODS_READY, "pods for all Deployments are ready");
        assert_eq!(condition_status(&cp, CONDITION_PROVISIONED), ConditionStatus::True);

        cp.metadata.generation = Some(4);
        assert_eq!(condition_status(&cp, CONDITION_PROVISIONED), ConditionStatus::Unknown);
        assert!(!is_condition_true(&cp, CONDITION_PROVISIONED));
        assert_eq!(condition_status(&cp, CONDITION_READY), ConditionStatus::Unknown);
    }
}
