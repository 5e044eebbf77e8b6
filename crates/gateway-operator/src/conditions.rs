//! Status condition bookkeeping
//!
//! Conditions are an ordered set keyed by [`ConditionType`]. Setting a
//! condition is a no-op when nothing observable changes, never regresses to
//! an older generation, and only moves `lastTransitionTime` when the status
//! flips. Callers compare the returned flag to decide whether a status write
//! is needed at all.

use kube::Resource;

use crate::clock::Clock;
use crate::crd::{
    Condition, ConditionReason, ConditionStatus, ConditionType, ControlPlane, DataPlane,
};

/// A resource carrying a condition list in its status
pub trait ConditionedResource: Resource {
    fn conditions(&self) -> &[Condition];

    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    fn observed_generation_mut(&mut self) -> &mut Option<i64>;
}

impl ConditionedResource for DataPlane {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }

    fn observed_generation_mut(&mut self) -> &mut Option<i64> {
        &mut self.status.get_or_insert_with(Default::default).observed_generation
    }
}

impl ConditionedResource for ControlPlane {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }

    fn observed_generation_mut(&mut self) -> &mut Option<i64> {
        &mut self.status.get_or_insert_with(Default::default).observed_generation
    }
}

/// Desired value of one condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionUpdate {
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: ConditionReason,
    pub message: String,
}

impl ConditionUpdate {
    pub fn new(
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: ConditionReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type,
            status,
            reason,
            message: message.into(),
        }
    }

    pub fn truthy(condition_type: ConditionType, reason: ConditionReason, message: impl Into<String>) -> Self {
        Self::new(condition_type, ConditionStatus::True, reason, message)
    }

    pub fn falsy(condition_type: ConditionType, reason: ConditionReason, message: impl Into<String>) -> Self {
        Self::new(condition_type, ConditionStatus::False, reason, message)
    }
}

/// Look up a condition by type
pub fn get<R: ConditionedResource>(resource: &R, condition_type: ConditionType) -> Option<&Condition> {
    resource
        .conditions()
        .iter()
        .find(|c| c.condition_type == condition_type)
}

/// True when the condition exists with status True
pub fn is_true<R: ConditionedResource>(resource: &R, condition_type: ConditionType) -> bool {
    get(resource, condition_type).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Apply a condition update, returning whether the resource changed
pub fn set<R: ConditionedResource>(resource: &mut R, update: ConditionUpdate, clock: &dyn Clock) -> bool {
    let generation = resource.meta().generation.unwrap_or(0);
    let conditions = resource.conditions_mut();

    match conditions
        .iter_mut()
        .find(|c| c.condition_type == update.condition_type)
    {
        Some(existing) => {
            if existing.observed_generation > generation {
                return false;
            }
            let unchanged = existing.status == update.status
                && existing.reason == update.reason
                && existing.message == update.message
                && existing.observed_generation == generation;
            if unchanged {
                return false;
            }
            if existing.status != update.status {
                existing.last_transition_time = clock.now_rfc3339();
            }
            existing.status = update.status;
            existing.reason = update.reason;
            existing.message = update.message;
            existing.observed_generation = generation;
            true
        }
        None => {
            let condition = Condition {
                condition_type: update.condition_type,
                status: update.status,
                reason: update.reason,
                message: update.message,
                observed_generation: generation,
                last_transition_time: clock.now_rfc3339(),
            };
            let at = conditions
                .iter()
                .position(|c| c.condition_type > condition.condition_type)
                .unwrap_or(conditions.len());
            conditions.insert(at, condition);
            true
        }
    }
}

/// Record that the current generation has been acted upon
pub fn mark_observed<R: ConditionedResource>(resource: &mut R) -> bool {
    let generation = resource.meta().generation;
    let observed = resource.observed_generation_mut();
    if generation.is_some() && *observed < generation {
        *observed = generation;
        true
    } else {
        false
    }
}
