//! Per-context change tracking: nesting, locking and listener dispatch.
//!
//! # Purpose
//!
//! Fold every commit issued while a change is open into one logical change,
//! and publish that change exactly once, either directly or through an
//! external registry transaction.
//!
//! # Mental model
//!
//! * Readers pin the hub's current `Arc<Snapshot>` and never touch the writer lock.
//! * Writers take a reentrant lock per context. The first commit opens an
//!   [`InFlightChange`]; commits issued while it is open (typically from a
//!   listener callback on the same thread) join it.
//! * The outermost exit resolves the change: vetoable prepare pass, then
//!   publication (standalone) or hand-off to the registry transaction
//!   (two-phase). Post-commit notifications run after the change is closed.
//!
//! # Key types
//!
//! | Type | Meaning | Constraints |
//! |---|---|---|
//! | [`ChangeTracker`] | Cloneable handle for one context | Listener set is per context |
//! | [`WriteGuard`] | Held reentrant writer lock | Nesting protocol is only reachable through it |
//! | [`InFlightChange`] | Working set of the open change | Present iff depth > 0 |
//! | [`CommitOutcome`] | What a commit call achieved | `Joined` never publishes |
//!
//! # Invariants
//!
//! * `depth == 0` iff no change is open.
//! * A failed sequence never publishes; the first recorded error reaches the
//!   outermost caller.
//! * The change number grows by one per published change.
//! * No `RefCell` borrow is held across a listener or coordinator call.
//!
//! # Failure modes
//!
//! * Stale transaction base: [`HubError::CommitConflict`].
//! * Listener rejection: [`HubError::ListenerVeto`]; with
//!   `compensate_on_failure`, listeners that already accepted get `rolled_back`.
//! * Registry abort: [`HubError::TwoPhaseAbort`].
//! * Unbalanced protocol calls: [`HubError::InvalidState`].

use std::cell::{RefCell, RefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, trace, warn};

use crate::change::diff;
use crate::config::ContextConfig;
use crate::error::{HubError, RegistryAbort, Result};
use crate::hub::HubShared;
use crate::snapshot::{Snapshot, TypeMap};
use crate::table::Bean;
use crate::transaction::{KeyGenerator, Operation, WriteableDatabase, apply};
use crate::two_phase::{HubParticipant, Phase, RegistryTransaction};

pub(crate) mod listeners;

pub use listeners::{ChangeEvent, ChangeListener};
use listeners::{ListenerSet, Notification, prepare_all};

#[cfg(test)]
mod tests;

/// Result of a successful commit call.
#[derive(Clone, Debug)]
pub enum CommitOutcome {
	/// The change was published as this snapshot.
	Published(Arc<Snapshot>),
	/// The commit joined an already open change; the outermost commit publishes.
	Joined,
	/// The registry transaction accepted the change but has not completed it yet.
	Deferred,
}

impl CommitOutcome {
	/// Published snapshot, if this call published one.
	pub fn snapshot(&self) -> Option<&Arc<Snapshot>> {
		match self {
			CommitOutcome::Published(snap) => Some(snap),
			_ => None,
		}
	}

	pub fn is_published(&self) -> bool {
		matches!(self, CommitOutcome::Published(_))
	}
}

/// How the open change gets published, decided once when it is opened.
pub(crate) enum CommitMode {
	Standalone,
	TwoPhase {
		/// Taken out temporarily by [`ChangeTracker::with_registry_transaction`].
		registry: Option<Box<dyn RegistryTransaction>>,
		participant: Arc<HubParticipant>,
	},
}

impl CommitMode {
	fn label(&self) -> &'static str {
		match self {
			CommitMode::Standalone => "standalone",
			CommitMode::TwoPhase { .. } => "two-phase",
		}
	}
}

/// Working set of the change currently open in a context.
#[derive(Clone)]
pub struct InFlightChange {
	base: Arc<Snapshot>,
	working: TypeMap,
	message: Option<Bean>,
	two_phase: bool,
	folded: usize,
}

impl InFlightChange {
	/// Snapshot the change will publish over.
	pub fn base(&self) -> &Arc<Snapshot> {
		&self.base
	}

	/// Number of transactions folded in so far.
	pub fn folded(&self) -> usize {
		self.folded
	}

	pub fn is_two_phase(&self) -> bool {
		self.two_phase
	}

	fn fold(&mut self, base: &Arc<Snapshot>, ops: &[Operation], message: Option<Bean>) -> Result<()> {
		if !Arc::ptr_eq(base, &self.base) {
			return Err(HubError::CommitConflict {
				base: base.version(),
				current: self.base.version(),
			});
		}
		let mut working = self.working.clone();
		for op in ops {
			apply(&mut working, op)?;
		}
		self.working = working;
		self.folded += 1;
		if self.message.is_none() {
			self.message = message;
		}
		Ok(())
	}
}

#[derive(Default)]
struct TrackerState {
	depth: usize,
	change: Option<InFlightChange>,
	/// Present iff `change` is, until the outermost exit takes it.
	mode: Option<CommitMode>,
	success: bool,
	first_error: Option<HubError>,
	listeners: ListenerSet,
}

struct TrackerInner {
	name: Arc<str>,
	hub: Arc<HubShared>,
	join_registry_transaction: bool,
	state: ReentrantMutex<RefCell<TrackerState>>,
	change_number: Arc<AtomicU64>,
	keys: Arc<KeyGenerator>,
}

impl TrackerInner {
	fn open_mode(&self) -> CommitMode {
		if !self.join_registry_transaction {
			return CommitMode::Standalone;
		}
		let coordinator = self.hub.coordinator.read().clone();
		let Some(coordinator) = coordinator else {
			trace!(context = %self.name, "no coordinator installed, committing standalone");
			return CommitMode::Standalone;
		};
		let Some(mut registry) = coordinator.begin() else {
			trace!(context = %self.name, "coordinator has no transaction, committing standalone");
			return CommitMode::Standalone;
		};
		let participant = Arc::new(HubParticipant::new(
			self.hub.clone(),
			self.change_number.clone(),
			self.name.clone(),
		));
		registry.register_participant(participant.clone());
		debug!(context = %self.name, "registered hub participant with registry transaction");
		CommitMode::TwoPhase {
			registry: Some(registry),
			participant,
		}
	}
}

/// Change tracking for one owning context.
///
/// Cloning is cheap and yields another handle to the same context.
#[derive(Clone)]
pub struct ChangeTracker {
	inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for ChangeTracker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChangeTracker")
			.field("name", &self.inner.name)
			.field("join_registry_transaction", &self.inner.join_registry_transaction)
			.field("change_number", &self.change_number())
			.finish()
	}
}

impl ChangeTracker {
	pub(crate) fn new(hub: Arc<HubShared>, config: &ContextConfig) -> Self {
		Self {
			inner: Arc::new(TrackerInner {
				name: Arc::from(config.name.as_str()),
				hub,
				join_registry_transaction: config.join_registry_transaction,
				state: ReentrantMutex::new(RefCell::new(TrackerState::default())),
				change_number: Arc::new(AtomicU64::new(0)),
				keys: Arc::new(KeyGenerator::new(config.name.as_str())),
			}),
		}
	}

	/// Context name.
	pub fn name(&self) -> &str {
		&self.inner.name
	}

	/// Pins the currently published snapshot.
	pub fn read(&self) -> Arc<Snapshot> {
		self.inner.hub.current.load_full()
	}

	/// Acquires the reentrant writer lock for this context.
	pub fn write(&self) -> WriteGuard<'_> {
		WriteGuard {
			tracker: &self.inner,
			guard: self.inner.state.lock(),
		}
	}

	/// Creates a transaction.
	///
	/// When called on the thread that holds this context's open change (for
	/// instance from a listener callback), the transaction starts from the
	/// change's working set so that it sees, and can build on, what the
	/// enclosing commit staged. Otherwise it starts from the published snapshot.
	pub fn new_transaction(&self) -> WriteableDatabase {
		if let Some(guard) = self.inner.state.try_lock()
			&& let Ok(state) = guard.try_borrow()
			&& let Some(change) = state.change.as_ref()
		{
			trace!(context = %self.inner.name, depth = state.depth, "transaction derived from open change");
			return WriteableDatabase::new(
				change.base.clone(),
				change.working.clone(),
				self.inner.keys.clone(),
			);
		}
		let base = self.read();
		let working = base.type_map().clone();
		WriteableDatabase::new(base, working, self.inner.keys.clone())
	}

	/// Commits a transaction, joining the open change if there is one.
	pub fn commit(&self, tx: WriteableDatabase) -> Result<CommitOutcome> {
		let guard = self.write();
		guard.start_or_continue_change()?;
		let folded = guard.fold(tx);
		let outcome = guard.end_or_defer_change(folded.is_ok())?;
		folded?;
		Ok(outcome)
	}

	/// Commits a transaction after attaching a commit message.
	pub fn commit_with_message(&self, mut tx: WriteableDatabase, message: Bean) -> Result<CommitOutcome> {
		tx.set_commit_message(message);
		self.commit(tx)
	}

	/// Registers a listener; returns false if it was already registered.
	pub fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) -> bool {
		let guard = self.write();
		let mut state = guard.state();
		let added = state.listeners.add(listener);
		trace!(context = %self.inner.name, added, listeners = state.listeners.len(), "add change listener");
		added
	}

	/// Unregisters a listener; returns false if it was not registered.
	pub fn remove_change_listener(&self, listener: &Arc<dyn ChangeListener>) -> bool {
		let guard = self.write();
		let removed = guard.state().listeners.remove(listener);
		trace!(context = %self.inner.name, removed, "remove change listener");
		removed
	}

	/// Copy of the listener set in notification order.
	pub fn change_listeners(&self) -> Vec<Arc<dyn ChangeListener>> {
		self.write().state().listeners.to_vec()
	}

	/// Number of changes published by this context.
	pub fn change_number(&self) -> u64 {
		self.inner.change_number.load(Ordering::Acquire)
	}

	/// Current nesting depth.
	pub fn depth(&self) -> usize {
		self.write().state().depth
	}

	/// Generates a key unique within this context.
	pub fn generated_id(&self) -> String {
		self.inner.keys.next_key()
	}

	/// Runs `f` against the registry transaction of the open two-phase change.
	///
	/// Returns `None` when no change is open or the change is standalone.
	pub fn with_registry_transaction<R>(&self, f: impl FnOnce(&mut dyn RegistryTransaction) -> R) -> Option<R> {
		let guard = self.write();
		let mut registry = {
			let mut state = guard.state();
			match state.mode.as_mut() {
				Some(CommitMode::TwoPhase { registry, .. }) => registry.take()?,
				_ => return None,
			}
		};
		let out = f(registry.as_mut());
		if let Some(CommitMode::TwoPhase { registry: slot, .. }) = guard.state().mode.as_mut() {
			*slot = Some(registry);
		}
		Some(out)
	}
}

/// Held writer lock of one context.
///
/// The lock is reentrant: a thread that already holds it may acquire it
/// again, which is how listener-triggered commits join the open change.
pub struct WriteGuard<'a> {
	tracker: &'a TrackerInner,
	guard: ReentrantMutexGuard<'a, RefCell<TrackerState>>,
}

impl WriteGuard<'_> {
	fn state(&self) -> RefMut<'_, TrackerState> {
		self.guard.borrow_mut()
	}

	/// Current nesting depth.
	pub fn depth(&self) -> usize {
		self.state().depth
	}

	/// Inspects a copy of the open change, if any.
	///
	/// `f` runs without the tracker state borrowed and may call back into
	/// the tracker.
	pub fn in_flight<R>(&self, f: impl FnOnce(&InFlightChange) -> R) -> Option<R> {
		let change = self.state().change.clone();
		change.as_ref().map(f)
	}

	/// Enters the change protocol: opens a change at depth 0, joins otherwise.
	///
	/// Returns the depth after entering.
	pub fn start_or_continue_change(&self) -> Result<usize> {
		{
			let mut state = self.state();
			if state.change.is_some() {
				state.depth += 1;
				trace!(context = %self.tracker.name, depth = state.depth, "joined open change");
				return Ok(state.depth);
			}
			if state.depth != 0 {
				return Err(HubError::InvalidState("nesting depth without an open change"));
			}
		}

		// Resolved before borrowing: the coordinator is external code.
		let mode = self.tracker.open_mode();
		let base = self.tracker.hub.current.load_full();
		let working = base.type_map().clone();

		let mut state = self.state();
		debug!(
			context = %self.tracker.name,
			base = base.version().value(),
			mode = mode.label(),
			"opened change"
		);
		state.change = Some(InFlightChange {
			base,
			working,
			message: None,
			two_phase: matches!(mode, CommitMode::TwoPhase { .. }),
			folded: 0,
		});
		state.mode = Some(mode);
		state.depth = 1;
		state.success = true;
		state.first_error = None;
		Ok(1)
	}

	/// Folds a transaction into the open change.
	///
	/// A failure marks the whole sequence failed; the outermost
	/// [`end_or_defer_change`](Self::end_or_defer_change) reports it.
	pub fn fold(&self, tx: WriteableDatabase) -> Result<()> {
		let (base, ops, message) = tx.into_parts();
		let mut state = self.state();
		let state = &mut *state;
		let Some(change) = state.change.as_mut() else {
			return Err(HubError::InvalidState("fold without an open change"));
		};
		let result = change.fold(&base, &ops, message);
		match &result {
			Ok(()) => trace!(
				context = %self.tracker.name,
				ops = ops.len(),
				folded = change.folded,
				"folded transaction"
			),
			Err(err) => {
				debug!(context = %self.tracker.name, error = %err, "transaction failed, sequence marked failed");
				state.success = false;
				if state.first_error.is_none() {
					state.first_error = Some(err.clone());
				}
			}
		}
		result
	}

	/// Leaves the change protocol.
	///
	/// Inner exits only decrement the depth. The outermost exit resolves the
	/// change and closes it.
	pub fn end_or_defer_change(&self, success: bool) -> Result<CommitOutcome> {
		{
			let mut state = self.state();
			if state.depth == 0 || state.change.is_none() {
				return Err(HubError::InvalidState("end_or_defer_change without matching start"));
			}
			if !success {
				state.success = false;
			}
			if state.depth > 1 {
				state.depth -= 1;
				trace!(context = %self.tracker.name, depth = state.depth, "deferred to enclosing change");
				return Ok(CommitOutcome::Joined);
			}
		}

		// Depth stays at 1 while resolving so that listener commits join.
		let close = CloseChange { guard: self };
		let (result, notifications) = self.resolve();
		drop(close);

		for notification in notifications {
			notification.deliver();
		}
		result
	}

	fn proposal(&self) -> (ChangeEvent, usize) {
		let state = self.state();
		let change = state.change.as_ref();
		let (base, working, message, folded) = match change {
			Some(c) => (c.base.clone(), c.working.clone(), c.message.clone(), c.folded),
			None => {
				let base = self.tracker.hub.current.load_full();
				let working = base.type_map().clone();
				(base, working, None, 0)
			}
		};
		let proposed = Arc::new(Snapshot::new(base.version().next(), working));
		let changes = diff(base.type_map(), proposed.type_map());
		let event = ChangeEvent::new(self.tracker.name.clone(), base, proposed, changes, message);
		(event, folded)
	}

	fn sequence_error(&self) -> Option<HubError> {
		let state = self.state();
		if state.success {
			return None;
		}
		Some(
			state
				.first_error
				.clone()
				.unwrap_or(HubError::InvalidState("change marked failed by a participant")),
		)
	}

	fn compensation(&self, accepted: Vec<Arc<dyn ChangeListener>>, event: ChangeEvent) -> Vec<Notification> {
		if self.tracker.hub.compensate_on_failure && !accepted.is_empty() {
			vec![Notification::rolled_back(accepted, event)]
		} else {
			Vec::new()
		}
	}

	fn resolve(&self) -> (Result<CommitOutcome>, Vec<Notification>) {
		if let Some(err) = self.sequence_error() {
			debug!(context = %self.tracker.name, error = %err, "discarding failed change");
			return (Err(err), Vec::new());
		}

		let listeners = self.state().listeners.to_vec();
		let (event, folded_at) = self.proposal();

		let accepted = match prepare_all(&listeners, &event) {
			Ok(accepted) => accepted,
			Err((veto, accepted)) => {
				return (Err(HubError::ListenerVeto(veto)), self.compensation(accepted, event));
			}
		};

		if let Some(err) = self.sequence_error() {
			debug!(context = %self.tracker.name, error = %err, "joined commit failed during prepare");
			return (Err(err), self.compensation(accepted, event));
		}

		let folded_now = self.state().change.as_ref().map_or(folded_at, |c| c.folded);
		let event = if folded_now != folded_at {
			trace!(context = %self.tracker.name, joined = folded_now - folded_at, "recomputing proposal");
			self.proposal().0
		} else {
			event
		};

		let mode = {
			let mut state = self.state();
			match (state.change.is_some(), state.mode.take()) {
				(true, Some(mode)) => mode,
				_ => return (Err(HubError::InvalidState("change closed while resolving")), Vec::new()),
			}
		};

		match mode {
			CommitMode::Standalone => self.publish(accepted, event),
			CommitMode::TwoPhase {
				registry,
				participant,
			} => self.resolve_two_phase(registry, participant, accepted, event),
		}
	}

	fn publish(
		&self,
		accepted: Vec<Arc<dyn ChangeListener>>,
		event: ChangeEvent,
	) -> (Result<CommitOutcome>, Vec<Notification>) {
		match self.tracker.hub.publish(event.base(), event.proposed().clone()) {
			Ok(()) => {
				let number = self.tracker.change_number.fetch_add(1, Ordering::AcqRel) + 1;
				debug!(
					context = %self.tracker.name,
					version = event.proposed().version().value(),
					changes = event.changes().len(),
					change_number = number,
					"published change"
				);
				let snapshot = event.proposed().clone();
				(
					Ok(CommitOutcome::Published(snapshot)),
					vec![Notification::committed(accepted, event)],
				)
			}
			Err(err) => {
				warn!(context = %self.tracker.name, error = %err, "publication lost race");
				(Err(err), self.compensation(accepted, event))
			}
		}
	}

	fn resolve_two_phase(
		&self,
		registry: Option<Box<dyn RegistryTransaction>>,
		participant: Arc<HubParticipant>,
		accepted: Vec<Arc<dyn ChangeListener>>,
		event: ChangeEvent,
	) -> (Result<CommitOutcome>, Vec<Notification>) {
		let Some(registry) = registry else {
			return (
				Err(HubError::InvalidState("registry transaction not returned")),
				self.compensation(accepted, event),
			);
		};

		participant.stage(event, accepted, self.tracker.hub.compensate_on_failure);
		debug!(context = %self.tracker.name, "committing registry transaction");
		let committed = registry.commit();
		if committed.is_err() {
			participant.rollback_if_pending();
		}
		let settled = participant.settle();

		let result = match (settled.phase, committed) {
			(Phase::Committed, _) => settled
				.published
				.map(CommitOutcome::Published)
				.ok_or(HubError::InvalidState("committed participant without snapshot")),
			(Phase::Staged | Phase::Prepared, Ok(())) => {
				debug!(context = %self.tracker.name, "registry transaction completes asynchronously");
				Ok(CommitOutcome::Deferred)
			}
			(_, Err(abort)) => {
				warn!(context = %self.tracker.name, reason = abort.reason(), "registry transaction aborted");
				Err(settled.error.unwrap_or(HubError::TwoPhaseAbort(abort)))
			}
			(Phase::RolledBack | Phase::Registered, Ok(())) => Err(settled.error.unwrap_or_else(|| {
				HubError::TwoPhaseAbort(RegistryAbort::new("hub participant rolled back"))
			})),
		};
		(result, settled.pending)
	}
}

/// Closes the open change when dropped, including while unwinding out of a
/// listener or registry callback.
struct CloseChange<'g, 'a> {
	guard: &'g WriteGuard<'a>,
}

impl Drop for CloseChange<'_, '_> {
	fn drop(&mut self) {
		let Ok(mut state) = self.guard.guard.try_borrow_mut() else {
			return;
		};
		if std::thread::panicking() {
			warn!(context = %self.guard.tracker.name, depth = state.depth, "discarding change after panic");
		}
		state.depth = 0;
		state.mode = None;
		let closed = state.change.take();
		drop(state);
		drop(closed);
	}
}
