//! Commits issued from listener callbacks.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use common::{Recorder, Seen, add_instance, added_keys, init_tracing, value_of};
use pretty_assertions::assert_eq;
use strata_hub::{
	ChangeEvent, ChangeListener, CommitOutcome, ContextConfig, EntryPath, Hub, HubError, Veto, Version,
};

/// Adds `Derived/<key>` for every `Source/<key>` a change adds, from inside prepare.
fn deriving_listener(hub: &Hub, joined: Arc<AtomicUsize>) -> Arc<dyn ChangeListener> {
	let hub = hub.clone();
	Arc::new(move |event: &ChangeEvent| -> Result<(), Veto> {
		let keys = added_keys(event, "Source");
		if keys.is_empty() {
			return Ok(());
		}
		let mut tx = hub.new_transaction();
		for key in &keys {
			add_instance(&mut tx, "Derived", key, 0);
		}
		match hub.commit(tx) {
			Ok(CommitOutcome::Joined) => {
				joined.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}
			Ok(other) => Err(Veto::new(format!("expected to join, got {other:?}"))),
			Err(err) => Err(Veto::new(err.to_string())),
		}
	})
}

#[test]
fn listener_commit_joins_and_publishes_once() {
	init_tracing();
	let hub = Hub::new();
	let joined = Arc::new(AtomicUsize::new(0));
	hub.add_listener(deriving_listener(&hub, joined.clone()));
	let recorder = Recorder::new();
	hub.add_listener(recorder.as_listener());

	let mut tx = hub.new_transaction();
	add_instance(&mut tx, "Source", "a", 1);
	add_instance(&mut tx, "Source", "b", 2);
	let outcome = hub.commit(tx).unwrap();

	assert_eq!(joined.load(Ordering::SeqCst), 1);
	assert_eq!(outcome.snapshot().map(|s| s.version()), Some(Version::new(1)));
	assert_eq!(hub.version(), Version::new(1), "nested commit did not publish separately");
	assert_eq!(hub.tracker().change_number(), 1);
	assert_eq!(value_of(&hub, "Derived", "a"), Some(0));
	assert_eq!(value_of(&hub, "Derived", "b"), Some(0));

	let events = recorder.committed_events();
	assert_eq!(events.len(), 1);
	assert_eq!(added_keys(&events[0], "Derived"), vec!["a", "b"]);
	assert_eq!(added_keys(&events[0], "Source"), vec!["a", "b"]);
}

#[test]
fn prepare_event_reflects_change_at_pass_start() {
	init_tracing();
	let hub = Hub::new();
	hub.add_listener(deriving_listener(&hub, Arc::new(AtomicUsize::new(0))));
	let recorder = Recorder::new();
	hub.add_listener(recorder.as_listener());

	let mut tx = hub.new_transaction();
	add_instance(&mut tx, "Source", "a", 1);
	hub.commit(tx).unwrap();

	// Source type + instance at prepare time; Derived type + instance joined later.
	assert_eq!(
		recorder.seen(),
		vec![
			Seen::Prepare {
				version: 1,
				changes: 2,
			},
			Seen::Committed {
				version: 1,
				changes: 4,
			},
		]
	);
}

#[test]
fn failed_nested_commit_fails_the_outer_commit() {
	init_tracing();
	let hub = Hub::new();
	let inner_error = Arc::new(parking_lot::Mutex::new(None));
	let captured = inner_error.clone();
	let handle = hub.clone();
	hub.add_listener(Arc::new(move |event: &ChangeEvent| -> Result<(), Veto> {
		if added_keys(event, "Source").is_empty() {
			return Ok(());
		}
		// Both see `Source/a` in the open change; only the first removal can fold.
		let mut first = handle.new_transaction();
		let mut second = handle.new_transaction();
		first.writeable_type("Source").unwrap().remove_instance("a").unwrap();
		second.writeable_type("Source").unwrap().remove_instance("a").unwrap();
		assert!(matches!(handle.commit(first), Ok(CommitOutcome::Joined)));
		*captured.lock() = handle.commit(second).err();
		Ok(())
	}));

	let mut tx = hub.new_transaction();
	add_instance(&mut tx, "Source", "a", 1);
	let err = hub.commit(tx).unwrap_err();

	let expected = HubError::NotFound(EntryPath::Instance {
		type_name: "Source".into(),
		key: "a".into(),
	});
	assert_eq!(inner_error.lock().clone(), Some(expected.clone()));
	assert_eq!(err, expected, "outer caller sees the first recorded error");
	assert_eq!(hub.version(), Version::INITIAL);
	assert_eq!(hub.tracker().change_number(), 0);
}

#[test]
fn stale_nested_transaction_conflicts() {
	init_tracing();
	let hub = Hub::new();
	let mut early = hub.new_transaction();
	add_instance(&mut early, "Late", "k", 1);

	let mut seed = hub.new_transaction();
	add_instance(&mut seed, "Source", "seed", 0);
	hub.commit(seed).unwrap();

	let slot = Arc::new(parking_lot::Mutex::new(Some(early)));
	let handle = hub.clone();
	hub.add_listener(Arc::new(move |_: &ChangeEvent| -> Result<(), Veto> {
		if let Some(tx) = slot.lock().take() {
			let _ = handle.commit(tx);
		}
		Ok(())
	}));

	let mut tx = hub.new_transaction();
	add_instance(&mut tx, "Source", "a", 1);
	assert_eq!(
		hub.commit(tx).unwrap_err(),
		HubError::CommitConflict {
			base: Version::new(0),
			current: Version::new(1),
		}
	);
	assert_eq!(hub.version(), Version::new(1));
	assert_eq!(value_of(&hub, "Late", "k"), None);
}

/// Commits once more from `committed`.
struct Cascade {
	hub: Hub,
	fired: AtomicBool,
	outcome: parking_lot::Mutex<Option<Result<CommitOutcome, HubError>>>,
}

impl ChangeListener for Cascade {
	fn prepare(&self, _event: &ChangeEvent) -> Result<(), Veto> {
		Ok(())
	}

	fn committed(&self, _event: &ChangeEvent) {
		if self.fired.swap(true, Ordering::SeqCst) {
			return;
		}
		let mut tx = self.hub.new_transaction();
		add_instance(&mut tx, "Audit", "entry", 1);
		*self.outcome.lock() = Some(self.hub.commit(tx));
	}
}

#[test]
fn commit_from_committed_callback_starts_a_new_change() {
	init_tracing();
	let hub = Hub::new();
	let cascade = Arc::new(Cascade {
		hub: hub.clone(),
		fired: AtomicBool::new(false),
		outcome: parking_lot::Mutex::new(None),
	});
	hub.add_listener(cascade.clone());

	let mut tx = hub.new_transaction();
	add_instance(&mut tx, "Main", "k", 1);
	let outcome = hub.commit(tx).unwrap();

	assert_eq!(outcome.snapshot().map(|s| s.version()), Some(Version::new(1)));
	let inner = cascade.outcome.lock().take().unwrap().unwrap();
	assert_eq!(inner.snapshot().map(|s| s.version()), Some(Version::new(2)));
	assert_eq!(hub.version(), Version::new(2));
	assert_eq!(hub.tracker().change_number(), 2);
	assert_eq!(value_of(&hub, "Audit", "entry"), Some(1));
}

#[test]
fn commit_in_another_context_races_the_open_change() {
	init_tracing();
	let hub = Hub::new();
	let side = hub.add_context(ContextConfig::new("side")).unwrap();
	let side_handle = side.clone();
	hub.add_listener(Arc::new(move |_: &ChangeEvent| -> Result<(), Veto> {
		let mut tx = side_handle.new_transaction();
		add_instance(&mut tx, "Side", "x", 1);
		side_handle
			.commit(tx)
			.map(|_| ())
			.map_err(|e| Veto::new(e.to_string()))
	}));

	let mut tx = hub.new_transaction();
	add_instance(&mut tx, "Main", "k", 1);
	let err = hub.commit(tx).unwrap_err();

	assert_eq!(
		err,
		HubError::CommitConflict {
			base: Version::new(0),
			current: Version::new(1),
		}
	);
	assert_eq!(side.change_number(), 1);
	assert_eq!(hub.tracker().change_number(), 0);
	assert_eq!(value_of(&hub, "Side", "x"), Some(1));
	assert_eq!(value_of(&hub, "Main", "k"), None);
}
