use std::sync::Arc;

use pretty_assertions::assert_eq;

use super::*;
use crate::error::Veto;
use crate::{EntryPath, Hub, Version};

fn add(tracker: &ChangeTracker, type_name: &str, key: &str) -> WriteableDatabase {
	let mut tx = tracker.new_transaction();
	tx.find_or_add_type(type_name)
		.add_instance(key, Bean::new(key.to_string()))
		.unwrap();
	tx
}

#[test]
fn end_without_start_is_invalid() {
	let hub = Hub::new();
	let guard = hub.tracker().write();
	assert_eq!(
		guard.end_or_defer_change(true).unwrap_err(),
		HubError::InvalidState("end_or_defer_change without matching start")
	);
}

#[test]
fn fold_without_open_change_is_invalid() {
	let hub = Hub::new();
	let tx = hub.new_transaction();
	let guard = hub.tracker().write();
	assert!(matches!(guard.fold(tx), Err(HubError::InvalidState(_))));
}

#[test]
fn manual_nesting_publishes_once_at_outermost_exit() {
	let hub = Hub::new();
	let tracker = hub.tracker();
	let guard = tracker.write();

	assert_eq!(guard.start_or_continue_change().unwrap(), 1);
	guard.fold(add(tracker, "A", "a")).unwrap();
	assert_eq!(guard.start_or_continue_change().unwrap(), 2);
	guard.fold(add(tracker, "B", "b")).unwrap();

	assert!(matches!(guard.end_or_defer_change(true), Ok(CommitOutcome::Joined)));
	assert_eq!(guard.depth(), 1);
	assert_eq!(hub.version(), Version::INITIAL, "nothing published before the outermost exit");
	assert_eq!(guard.in_flight(|c| c.folded()), Some(2));

	let outcome = guard.end_or_defer_change(true).unwrap();
	let snap = outcome.snapshot().unwrap();
	assert_eq!(snap.version(), Version::new(1));
	assert!(snap.get("A", "a").is_some());
	assert!(snap.get("B", "b").is_some());
	assert_eq!(guard.depth(), 0);
	assert!(guard.in_flight(|_| ()).is_none());
	drop(guard);
	assert_eq!(tracker.change_number(), 1);
}

#[test]
fn transaction_inside_open_change_sees_working_set() {
	let hub = Hub::new();
	let tracker = hub.tracker();
	let guard = tracker.write();
	guard.start_or_continue_change().unwrap();
	guard.fold(add(tracker, "A", "a")).unwrap();

	let tx = tracker.new_transaction();
	assert!(tx.get("A", "a").is_some());
	assert_eq!(tx.base_version(), Version::INITIAL);

	guard.end_or_defer_change(true).unwrap();
}

#[test]
fn failure_without_error_reports_invalid_state() {
	let hub = Hub::new();
	let guard = hub.tracker().write();
	guard.start_or_continue_change().unwrap();
	assert_eq!(
		guard.end_or_defer_change(false).unwrap_err(),
		HubError::InvalidState("change marked failed by a participant")
	);
	assert_eq!(guard.depth(), 0);
	drop(guard);
	assert_eq!(hub.version(), Version::INITIAL);
}

#[test]
fn inner_failure_surfaces_first_error_at_outermost() {
	let hub = Hub::new();
	let tracker = hub.tracker();
	let guard = tracker.write();
	guard.start_or_continue_change().unwrap();
	guard.fold(add(tracker, "A", "a")).unwrap();

	guard.start_or_continue_change().unwrap();
	let mut dup = tracker.new_transaction();
	dup.writeable_type("A").unwrap().remove_instance("a").unwrap();
	let mut again = tracker.new_transaction();
	again.writeable_type("A").unwrap().remove_instance("a").unwrap();
	guard.fold(dup).unwrap();
	let err = guard.fold(again).unwrap_err();
	assert_eq!(err, HubError::NotFound(EntryPath::instance("A", "a")));
	assert!(matches!(guard.end_or_defer_change(false), Ok(CommitOutcome::Joined)));

	assert_eq!(guard.end_or_defer_change(true).unwrap_err(), err);
	drop(guard);
	assert_eq!(hub.version(), Version::INITIAL);
	assert_eq!(tracker.change_number(), 0);
}

#[test]
fn empty_commit_still_publishes_a_version() {
	let hub = Hub::new();
	let outcome = hub.commit(hub.new_transaction()).unwrap();
	assert_eq!(outcome.snapshot().map(|s| s.version()), Some(Version::new(1)));
	assert_eq!(hub.tracker().change_number(), 1);
}

#[test]
fn stale_transaction_conflicts() {
	let hub = Hub::new();
	let stale = add(hub.tracker(), "A", "x");
	hub.commit(add(hub.tracker(), "A", "y")).unwrap();

	assert_eq!(
		hub.commit(stale).unwrap_err(),
		HubError::CommitConflict {
			base: Version::new(0),
			current: Version::new(1),
		}
	);
	assert_eq!(hub.version(), Version::new(1));
}

#[test]
fn listener_set_is_idempotent_and_ordered() {
	let hub = Hub::new();
	let tracker = hub.tracker();
	let first: Arc<dyn ChangeListener> = Arc::new(|_: &ChangeEvent| -> Result<(), Veto> { Ok(()) });
	let second: Arc<dyn ChangeListener> = Arc::new(|_: &ChangeEvent| -> Result<(), Veto> { Ok(()) });

	assert!(tracker.add_change_listener(first.clone()));
	assert!(!tracker.add_change_listener(first.clone()));
	assert!(tracker.add_change_listener(second.clone()));

	let listeners = tracker.change_listeners();
	assert_eq!(listeners.len(), 2);
	assert!(std::ptr::addr_eq(Arc::as_ptr(&listeners[0]), Arc::as_ptr(&first)));

	assert!(tracker.remove_change_listener(&first));
	assert!(!tracker.remove_change_listener(&first));
	assert_eq!(tracker.change_listeners().len(), 1);
}

#[test]
fn registry_access_requires_two_phase_change() {
	let hub = Hub::new();
	let tracker = hub.tracker();
	assert!(tracker.with_registry_transaction(|_| ()).is_none());

	let guard = tracker.write();
	guard.start_or_continue_change().unwrap();
	assert_eq!(guard.in_flight(InFlightChange::is_two_phase), Some(false));
	assert!(tracker.with_registry_transaction(|_| ()).is_none());
	guard.end_or_defer_change(true).unwrap();
}

#[test]
fn generated_ids_are_unique_per_context() {
	let hub = Hub::new();
	let a = hub.tracker().generated_id();
	let b = hub.tracker().generated_id();
	assert_ne!(a, b);
	assert!(a.starts_with("default-"));
}

#[test]
fn in_flight_callback_may_reenter_the_tracker() {
	let hub = Hub::new();
	let tracker = hub.tracker();
	let guard = tracker.write();
	guard.start_or_continue_change().unwrap();
	guard.fold(add(tracker, "A", "a")).unwrap();

	let seen = guard.in_flight(|change| {
		let joined = tracker.commit(add(tracker, "B", "b")).map(|o| o.is_published());
		(change.folded(), tracker.depth(), joined)
	});
	assert_eq!(seen, Some((1, 1, Ok(false))));
	assert_eq!(guard.in_flight(InFlightChange::folded), Some(2));

	let snap = guard.end_or_defer_change(true).unwrap().snapshot().cloned().unwrap();
	assert!(snap.get("A", "a").is_some());
	assert!(snap.get("B", "b").is_some());
}
