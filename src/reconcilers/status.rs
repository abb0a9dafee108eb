//! Status condition aggregation

use crate::crd::{Condition, DexServerStatus, RelatedObjectReference};

/// Merge `updates` into `existing` keyed by condition type
///
/// A matching record is replaced only when its status, reason or message
/// differ, so an unchanged outcome keeps its original transition time.
/// Records of other types are kept as they are, and unseen types are appended.
pub fn merge_conditions(existing: &[Condition], updates: &[Condition]) -> Vec<Condition> {
    let mut merged = existing.to_vec();

    for update in updates {
        match merged.iter_mut().find(|c| c.type_ == update.type_) {
            Some(current) => {
                if current.status != update.status
                    || current.reason != update.reason
                    || current.message != update.message
                {
                    *current = update.clone();
                }
            }
            None => merged.push(update.clone()),
        }
    }

    merged
}

/// Status after recording `condition`
///
/// Related objects are replaced when given and carried over otherwise.
pub fn next_status(
    current: Option<&DexServerStatus>,
    condition: Condition,
    related_objects: Option<Vec<RelatedObjectReference>>,
) -> DexServerStatus {
    let current = current.cloned().unwrap_or_default();
    DexServerStatus {
        conditions: merge_conditions(&current.conditions, &[condition]),
        related_objects: related_objects.unwrap_or(current.related_objects),
    }
}
