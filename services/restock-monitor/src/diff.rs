//! Availability diffing
//!
//! Pure functions over `AvailabilityMap`. The task state machine reads the
//! previous map, computes the change set, and only then stores the merged
//! map, so the previous map is never mutated mid-comparison.

use std::collections::BTreeSet;

use site::AvailabilityMap;

/// Variant keys that became available: `true` in `cur` and either absent
/// from `prev` or `false` there.
pub fn diff(prev: &AvailabilityMap, cur: &AvailabilityMap) -> BTreeSet<String> {
    cur.iter()
        .filter(|(_, in_stock)| **in_stock)
        .filter(|(key, _)| !prev.get(*key).copied().unwrap_or(false))
        .map(|(key, _)| key.clone())
        .collect()
}

/// The map stored after a successful poll: `prev` overlaid with `cur`.
/// Variants missing from `cur` keep their previous value.
pub fn merge(prev: &AvailabilityMap, cur: &AvailabilityMap) -> AvailabilityMap {
    let mut next = prev.clone();
    next.extend(cur.iter().map(|(k, v)| (k.clone(), *v)));
    next
}

/// The map stored after an out-of-stock poll: every known variant unavailable.
pub fn force_out_of_stock(prev: &AvailabilityMap) -> AvailabilityMap {
    prev.keys().map(|k| (k.clone(), false)).collect()
}
