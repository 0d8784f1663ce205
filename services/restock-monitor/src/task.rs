//! Per-task poll state machine
//!
//! Pure state machine: receives the outcome of one poll, returns
//! (new_state, action). The runner executes the I/O implied by each action
//! (pacing, proxy rotation, credential refresh, dispatch).
//!
//! Outcome handling:
//! - listing: diff against the stored map, store the merged map, dispatch
//!   the change set unless this is the first successful poll
//! - OutOfStock: every stored variant becomes unavailable
//! - NoVariants / NotLoaded: nothing stored changes
//! - Banned / Network / Unknown: recover, baseline untouched
//!
//! `first_run` is cleared by every outcome except the recovery ones, so a
//! task that starts out banned still treats its first real listing as the
//! baseline.

use std::collections::{BTreeSet, HashMap};

use site::{AvailabilityMap, ErrorKind, Listing, ProductInfo};
use uuid::Uuid;

use crate::diff;

/// State owned by one polling loop. Never shared between tasks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskState {
    /// `<product>@<site>`, used in logs and pool calls
    pub id: String,
    pub product: String,
    pub site: String,
    pub site_name: String,
    pub first_run: bool,
    pub request_count: u64,
    pub last_availability: AvailabilityMap,
    /// Latest known site option id per variant key
    pub variant_ids: HashMap<String, String>,
    /// Captured from the first successful parse
    pub info: Option<ProductInfo>,
}

impl TaskState {
    pub fn new(product: &str, site: &str, site_name: &str) -> Self {
        Self {
            id: format!("{product}@{site}"),
            product: product.to_string(),
            site: site.to_string(),
            site_name: site_name.to_string(),
            first_run: true,
            request_count: 0,
            last_availability: AvailabilityMap::new(),
            variant_ids: HashMap::new(),
            info: None,
        }
    }

    /// Whether the next request should use a new proxy and credential.
    /// True for the very first request and then every `rotate_every` requests.
    pub fn due_for_rotation(&self, rotate_every: u64) -> bool {
        rotate_every == 0 || self.request_count % rotate_every == 0
    }
}

/// Result of one poll as seen by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Listing(Listing),
    Failed(ErrorKind),
}

/// Newly available variants for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct RestockEvent {
    pub id: Uuid,
    pub product: String,
    pub site: String,
    pub site_name: String,
    /// Variant keys that just became available
    pub variants: BTreeSet<String>,
    /// Every variant currently in stock, including ones already announced
    pub in_stock: BTreeSet<String>,
    /// Site option ids for `variants`, where known
    pub variant_ids: HashMap<String, String>,
    pub info: ProductInfo,
}

/// What the runner should do after a poll.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskAction {
    /// Pace normally and poll again
    Continue,
    /// Rotate proxy, force-refresh the credential, pace longer
    Recover(ErrorKind),
    /// Hand the event to the dispatcher without waiting, then pace normally
    Dispatch(RestockEvent),
}

/// Handle one poll outcome. Pure function: no I/O.
pub fn handle_poll(mut state: TaskState, outcome: PollOutcome) -> (TaskState, TaskAction) {
    state.request_count += 1;

    match outcome {
        PollOutcome::Listing(listing) => {
            let changed = diff::diff(&state.last_availability, &listing.availability);
            state.last_availability = diff::merge(&state.last_availability, &listing.availability);
            state.variant_ids.extend(listing.variant_ids);
            if state.info.is_none() {
                state.info = Some(listing.info);
            }

            if state.first_run {
                state.first_run = false;
                return (state, TaskAction::Continue);
            }
            if changed.is_empty() {
                return (state, TaskAction::Continue);
            }

            let variant_ids = changed
                .iter()
                .filter_map(|k| state.variant_ids.get(k).map(|id| (k.clone(), id.clone())))
                .collect();
            let event = RestockEvent {
                id: Uuid::new_v4(),
                product: state.product.clone(),
                site: state.site.clone(),
                site_name: state.site_name.clone(),
                variants: changed,
                in_stock: state
                    .last_availability
                    .iter()
                    .filter(|(_, in_stock)| **in_stock)
                    .map(|(k, _)| k.clone())
                    .collect(),
                variant_ids,
                info: state.info.clone().unwrap_or_default(),
            };
            (state, TaskAction::Dispatch(event))
        }

        PollOutcome::Failed(kind) if kind.needs_recovery() => (state, TaskAction::Recover(kind)),

        PollOutcome::Failed(kind) => {
            if kind == ErrorKind::OutOfStock {
                state.last_availability = diff::force_out_of_stock(&state.last_availability);
            }
            state.first_run = false;
            (state, TaskAction::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(entries: &[(&str, bool)]) -> PollOutcome {
        PollOutcome::Listing(Listing {
            info: ProductInfo {
                name: Some("Runner OG".into()),
                ..ProductInfo::default()
            },
            availability: entries.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            ..Listing::default()
        })
    }

    fn map(entries: &[(&str, bool)]) -> AvailabilityMap {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn fresh() -> TaskState {
        TaskState::new("AB1234", "end-gb", "END.")
    }

    #[test]
    fn new_task_starts_on_first_run() {
        let state = fresh();
        assert_eq!(state.id, "AB1234@end-gb");
        assert!(state.first_run);
        assert!(state.last_availability.is_empty());
        assert!(state.due_for_rotation(25));
    }

    #[test]
    fn rotation_every_k_requests() {
        let mut state = fresh();
        state.request_count = 24;
        assert!(!state.due_for_rotation(25));
        state.request_count = 25;
        assert!(state.due_for_rotation(25));
    }

    #[test]
    fn first_listing_is_baseline_only() {
        let (state, action) = handle_poll(fresh(), listing(&[("9", true)]));
        assert_eq!(action, TaskAction::Continue);
        assert!(!state.first_run);
        assert_eq!(state.last_availability, map(&[("9", true)]));
        assert_eq!(state.request_count, 1);
        assert_eq!(state.info.unwrap().name.as_deref(), Some("Runner OG"));
    }

    #[test]
    fn end_to_end_restock_detection() {
        let (state, action) = handle_poll(fresh(), listing(&[("9", true)]));
        assert_eq!(action, TaskAction::Continue);

        let (state, action) = handle_poll(state, listing(&[("9", false), ("10", true)]));
        let TaskAction::Dispatch(event) = action else {
            panic!("expected dispatch, got {action:?}");
        };
        assert_eq!(event.variants, BTreeSet::from(["10".to_string()]));
        assert_eq!(event.in_stock, BTreeSet::from(["10".to_string()]));
        assert_eq!(event.product, "AB1234");
        assert_eq!(event.site_name, "END.");
        assert_eq!(state.last_availability, map(&[("9", false), ("10", true)]));
    }

    #[test]
    fn unchanged_listing_does_not_dispatch() {
        let (state, _) = handle_poll(fresh(), listing(&[("9", true)]));
        let (state, action) = handle_poll(state, listing(&[("9", true)]));
        assert_eq!(action, TaskAction::Continue);
        assert_eq!(state.request_count, 2);
    }

    #[test]
    fn out_of_stock_forces_all_variants_unavailable() {
        let mut state = fresh();
        state.first_run = false;
        state.last_availability = map(&[("9", true), ("10", false)]);

        let (state, action) = handle_poll(state, PollOutcome::Failed(ErrorKind::OutOfStock));
        assert_eq!(action, TaskAction::Continue);
        assert_eq!(state.last_availability, map(&[("9", false), ("10", false)]));

        // The same variant coming back is now a restock.
        let (_, action) = handle_poll(state, listing(&[("9", true)]));
        assert!(matches!(action, TaskAction::Dispatch(e) if e.variants.contains("9")));
    }

    #[test]
    fn known_states_clear_first_run() {
        for kind in [
            ErrorKind::OutOfStock,
            ErrorKind::NoVariants,
            ErrorKind::NotLoaded,
        ] {
            let (state, action) = handle_poll(fresh(), PollOutcome::Failed(kind));
            assert_eq!(action, TaskAction::Continue, "{kind:?}");
            assert!(!state.first_run, "{kind:?} must clear first_run");
        }
    }

    #[test]
    fn recovery_states_keep_first_run_and_baseline() {
        for kind in [ErrorKind::Banned, ErrorKind::Network, ErrorKind::Unknown(503)] {
            let mut state = fresh();
            state.last_availability = map(&[("9", true)]);
            let (state, action) = handle_poll(state, PollOutcome::Failed(kind));
            assert_eq!(action, TaskAction::Recover(kind));
            assert!(state.first_run, "{kind:?} must leave first_run set");
            assert_eq!(state.last_availability, map(&[("9", true)]));
        }
    }

    #[test]
    fn not_loaded_then_listing_dispatches() {
        // A 404 on the first poll establishes an (empty) baseline.
        let (state, _) = handle_poll(fresh(), PollOutcome::Failed(ErrorKind::NotLoaded));
        let (state, action) = handle_poll(state, listing(&[("9", true), ("10", false)]));
        let TaskAction::Dispatch(event) = action else {
            panic!("expected dispatch");
        };
        assert_eq!(event.variants, BTreeSet::from(["9".to_string()]));
        assert_eq!(state.last_availability.len(), 2);
    }

    #[test]
    fn missing_variants_keep_their_stored_value() {
        let (state, _) = handle_poll(fresh(), listing(&[("9", true), ("10", false)]));
        let (state, action) = handle_poll(state, listing(&[("10", false)]));
        assert_eq!(action, TaskAction::Continue);
        assert_eq!(state.last_availability, map(&[("9", true), ("10", false)]));
    }

    #[test]
    fn empty_listing_is_no_change() {
        let (state, _) = handle_poll(fresh(), listing(&[("9", false)]));
        let (state, action) = handle_poll(state, listing(&[]));
        assert_eq!(action, TaskAction::Continue);
        assert_eq!(state.last_availability, map(&[("9", false)]));
    }

    #[test]
    fn product_info_is_captured_once() {
        let (state, _) = handle_poll(fresh(), listing(&[("9", true)]));
        let later = PollOutcome::Listing(Listing {
            info: ProductInfo {
                name: Some("Renamed".into()),
                ..ProductInfo::default()
            },
            availability: map(&[("9", true)]),
            ..Listing::default()
        });
        let (state, _) = handle_poll(state, later);
        assert_eq!(state.info.unwrap().name.as_deref(), Some("Runner OG"));
    }

    #[test]
    fn restock_event_carries_option_ids_of_changed_variants() {
        let with_ids = |entries: &[(&str, bool, &str)]| {
            PollOutcome::Listing(Listing {
                availability: entries.iter().map(|(k, v, _)| (k.to_string(), *v)).collect(),
                variant_ids: entries
                    .iter()
                    .map(|(k, _, id)| (k.to_string(), id.to_string()))
                    .collect(),
                ..Listing::default()
            })
        };
        let (state, _) = handle_poll(
            fresh(),
            with_ids(&[("UK 9", false, "1093"), ("UK 10", true, "1094")]),
        );
        let (_, action) = handle_poll(
            state,
            with_ids(&[("UK 9", true, "1093"), ("UK 10", true, "1094")]),
        );
        let TaskAction::Dispatch(event) = action else {
            panic!("expected dispatch");
        };
        assert_eq!(
            event.variant_ids,
            HashMap::from([("UK 9".to_string(), "1093".to_string())])
        );
    }
}
