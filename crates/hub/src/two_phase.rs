//! Participation in an external two-phase registry transaction.
//!
//! A context configured with `join_registry_transaction` asks the installed
//! [`TwoPhaseCoordinator`] for a transaction when it opens a change. If one
//! is returned, the hub registers a [`HubParticipant`] with it once, and the
//! outermost commit hands publication over to the registry: the participant
//! validates in `prepare` and publishes in `commit`.
//!
//! Participant callbacks never take a tracker lock, so a registry that
//! completes on another thread cannot deadlock against the committing one.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{HubError, RegistryAbort};
use crate::hub::HubShared;
use crate::snapshot::Snapshot;
use crate::tracker::listeners::Notification;
use crate::tracker::{ChangeEvent, ChangeListener};

/// Source of external registry transactions.
pub trait TwoPhaseCoordinator: Send + Sync {
	/// Returns the transaction the next change should join, if any.
	fn begin(&self) -> Option<Box<dyn RegistryTransaction>>;
}

/// One external registry transaction.
pub trait RegistryTransaction: Send {
	fn register_participant(&mut self, participant: Arc<dyn TwoPhaseResource>);

	/// Runs prepare and commit across all participants.
	///
	/// An `Ok` return does not imply completion: an asynchronous registry may
	/// finish later, on another thread.
	fn commit(self: Box<Self>) -> Result<(), RegistryAbort>;

	/// Access to the concrete transaction.
	fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Resource taking part in a registry transaction.
pub trait TwoPhaseResource: Send + Sync {
	fn prepare(&self) -> Result<(), RegistryAbort>;
	fn commit(&self);
	fn rollback(&self);
}

/// Lifecycle of a [`HubParticipant`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
	/// Registered, outermost commit not reached yet.
	Registered,
	/// Final change handed over, waiting for `prepare`.
	Staged,
	Prepared,
	Committed,
	RolledBack,
}

struct Staged {
	event: ChangeEvent,
	listeners: Vec<Arc<dyn ChangeListener>>,
	compensate: bool,
}

struct ParticipantState {
	phase: Phase,
	staged: Option<Staged>,
	published: Option<Arc<Snapshot>>,
	error: Option<HubError>,
	/// Set while the committing thread is inside `RegistryTransaction::commit`.
	resolving: bool,
	pending: Vec<Notification>,
}

/// What the committing thread learns once the registry returns.
pub(crate) struct Settled {
	pub(crate) phase: Phase,
	pub(crate) published: Option<Arc<Snapshot>>,
	pub(crate) error: Option<HubError>,
	pub(crate) pending: Vec<Notification>,
}

/// The hub's side of a registry transaction.
pub struct HubParticipant {
	hub: Arc<HubShared>,
	change_number: Arc<AtomicU64>,
	context: Arc<str>,
	state: Mutex<ParticipantState>,
}

impl std::fmt::Debug for HubParticipant {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HubParticipant")
			.field("context", &self.context)
			.field("phase", &self.phase())
			.finish()
	}
}

impl HubParticipant {
	pub(crate) fn new(hub: Arc<HubShared>, change_number: Arc<AtomicU64>, context: Arc<str>) -> Self {
		Self {
			hub,
			change_number,
			context,
			state: Mutex::new(ParticipantState {
				phase: Phase::Registered,
				staged: None,
				published: None,
				error: None,
				resolving: false,
				pending: Vec::new(),
			}),
		}
	}

	pub fn phase(&self) -> Phase {
		self.state.lock().phase
	}

	/// Context that owns the change.
	pub fn context(&self) -> &str {
		&self.context
	}

	/// Hands over the final change right before the registry commits.
	pub(crate) fn stage(&self, event: ChangeEvent, listeners: Vec<Arc<dyn ChangeListener>>, compensate: bool) {
		let mut state = self.state.lock();
		state.phase = Phase::Staged;
		state.staged = Some(Staged {
			event,
			listeners,
			compensate,
		});
		state.resolving = true;
	}

	/// Discards a staged change the registry gave up on without telling us.
	pub(crate) fn rollback_if_pending(&self) {
		if matches!(self.phase(), Phase::Staged | Phase::Prepared) {
			self.rollback();
		}
	}

	/// Ends the committing thread's involvement.
	///
	/// Later callbacks deliver their notifications directly.
	pub(crate) fn settle(&self) -> Settled {
		let mut state = self.state.lock();
		state.resolving = false;
		Settled {
			phase: state.phase,
			published: state.published.clone(),
			error: state.error.clone(),
			pending: std::mem::take(&mut state.pending),
		}
	}

	fn validate(&self, state: &mut ParticipantState) -> Result<(), RegistryAbort> {
		let Some(staged) = state.staged.as_ref() else {
			return Err(RegistryAbort::new("hub change not staged"));
		};
		let current = self.hub.current.load();
		if Arc::ptr_eq(&current, staged.event.base()) {
			return Ok(());
		}
		let err = HubError::CommitConflict {
			base: staged.event.base().version(),
			current: current.version(),
		};
		let abort = RegistryAbort::new(err.to_string());
		state.error = Some(err);
		Err(abort)
	}

	fn dispatch(state: &mut ParticipantState, notification: Notification) -> Option<Notification> {
		if state.resolving {
			state.pending.push(notification);
			None
		} else {
			Some(notification)
		}
	}
}

impl TwoPhaseResource for HubParticipant {
	fn prepare(&self) -> Result<(), RegistryAbort> {
		let mut state = self.state.lock();
		match state.phase {
			Phase::Prepared => Ok(()),
			Phase::Staged => {
				self.validate(&mut state)?;
				state.phase = Phase::Prepared;
				trace!(context = %self.context, "hub participant prepared");
				Ok(())
			}
			Phase::Registered => Err(RegistryAbort::new("hub change not staged")),
			Phase::Committed | Phase::RolledBack => Err(RegistryAbort::new("hub change already resolved")),
		}
	}

	fn commit(&self) {
		let mut state = self.state.lock();
		match state.phase {
			Phase::Prepared => {}
			Phase::Staged => {
				warn!(context = %self.context, "commit without prepare, validating now");
				if self.validate(&mut state).is_err() {
					drop(state);
					self.rollback();
					return;
				}
			}
			phase => {
				warn!(context = %self.context, ?phase, "ignoring commit in unexpected phase");
				return;
			}
		}

		let Some(staged) = state.staged.take() else {
			return;
		};
		let notification = match self.hub.publish(staged.event.base(), staged.event.proposed().clone()) {
			Ok(()) => {
				let number = self.change_number.fetch_add(1, Ordering::AcqRel) + 1;
				debug!(
					context = %self.context,
					version = staged.event.proposed().version().value(),
					change_number = number,
					"published change through registry transaction"
				);
				state.phase = Phase::Committed;
				state.published = Some(staged.event.proposed().clone());
				Some(Notification::committed(staged.listeners, staged.event))
			}
			Err(err) => {
				warn!(context = %self.context, error = %err, "registry commit lost publication race");
				state.phase = Phase::RolledBack;
				state.error = Some(err);
				staged
					.compensate
					.then(|| Notification::rolled_back(staged.listeners, staged.event))
			}
		};

		let ready = notification.and_then(|n| Self::dispatch(&mut state, n));
		drop(state);
		if let Some(n) = ready {
			n.deliver();
		}
	}

	fn rollback(&self) {
		let mut state = self.state.lock();
		if matches!(state.phase, Phase::Committed | Phase::RolledBack) {
			return;
		}
		state.phase = Phase::RolledBack;
		debug!(context = %self.context, "hub participant rolled back");
		let ready = state
			.staged
			.take()
			.filter(|s| s.compensate && !s.listeners.is_empty())
			.and_then(|s| Self::dispatch(&mut state, Notification::rolled_back(s.listeners, s.event)));
		drop(state);
		if let Some(n) = ready {
			n.deliver();
		}
	}
}

type Activation = Box<dyn FnOnce() -> Result<(), RegistryAbort> + Send>;

/// In-process coordinator that gives every change its own transaction.
#[derive(Debug, Default)]
pub struct LocalCoordinator;

impl LocalCoordinator {
	pub fn new() -> Self {
		Self
	}
}

impl TwoPhaseCoordinator for LocalCoordinator {
	fn begin(&self) -> Option<Box<dyn RegistryTransaction>> {
		Some(Box::new(LocalTransaction::default()))
	}
}

/// Transaction created by [`LocalCoordinator`].
///
/// Commit prepares every participant in registration order, then runs the
/// queued activations, then commits. Any failure rolls every participant back.
#[derive(Default)]
pub struct LocalTransaction {
	participants: Vec<Arc<dyn TwoPhaseResource>>,
	activations: Vec<Activation>,
}

impl LocalTransaction {
	/// Queues work that must succeed between prepare and commit.
	pub fn add_activation(&mut self, activation: impl FnOnce() -> Result<(), RegistryAbort> + Send + 'static) {
		self.activations.push(Box::new(activation));
	}

	pub fn participants(&self) -> usize {
		self.participants.len()
	}

	fn rollback_all(&self) {
		for participant in &self.participants {
			participant.rollback();
		}
	}
}

impl RegistryTransaction for LocalTransaction {
	fn register_participant(&mut self, participant: Arc<dyn TwoPhaseResource>) {
		self.participants.push(participant);
	}

	fn commit(self: Box<Self>) -> Result<(), RegistryAbort> {
		let this = *self;
		for (idx, participant) in this.participants.iter().enumerate() {
			if let Err(abort) = participant.prepare() {
				debug!(participant = idx, reason = abort.reason(), "prepare failed, rolling back");
				this.rollback_all();
				return Err(abort);
			}
		}

		let LocalTransaction {
			participants,
			activations,
		} = this;
		for activation in activations {
			if let Err(abort) = activation() {
				debug!(reason = abort.reason(), "activation failed, rolling back");
				for participant in &participants {
					participant.rollback();
				}
				return Err(abort);
			}
		}

		for participant in &participants {
			participant.commit();
		}
		Ok(())
	}

	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}
