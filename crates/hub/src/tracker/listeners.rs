//! Vetoable change listeners and their notification events.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::change::{Change, ChangeKind};
use crate::error::Veto;
use crate::snapshot::Snapshot;
use crate::table::Bean;

/// Observer of committed configuration changes.
///
/// Listeners are called synchronously, in registration order, on the thread
/// that resolves the change. [`prepare`](ChangeListener::prepare) runs while
/// the change is still open: returning a [`Veto`] fails the whole change, and
/// any commit issued from inside the callback joins the open change instead
/// of publishing separately.
pub trait ChangeListener: Send + Sync {
	/// Inspects a proposed change; `Err` vetoes it.
	fn prepare(&self, event: &ChangeEvent) -> Result<(), Veto>;

	/// Called after the change was published.
	fn committed(&self, _event: &ChangeEvent) {}

	/// Called after an accepted change failed to publish, when the hub is
	/// configured to compensate.
	fn rolled_back(&self, _event: &ChangeEvent) {}
}

impl<F> ChangeListener for F
where
	F: Fn(&ChangeEvent) -> Result<(), Veto> + Send + Sync,
{
	fn prepare(&self, event: &ChangeEvent) -> Result<(), Veto> {
		self(event)
	}
}

/// Everything a listener gets to see about one change.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
	context: Arc<str>,
	base: Arc<Snapshot>,
	proposed: Arc<Snapshot>,
	changes: Arc<[Change]>,
	message: Option<Bean>,
}

impl ChangeEvent {
	pub(crate) fn new(
		context: Arc<str>,
		base: Arc<Snapshot>,
		proposed: Arc<Snapshot>,
		changes: Vec<Change>,
		message: Option<Bean>,
	) -> Self {
		Self {
			context,
			base,
			proposed,
			changes: changes.into(),
			message,
		}
	}

	/// Name of the context that committed the change.
	pub fn context(&self) -> &str {
		&self.context
	}

	/// Snapshot the change is applied on top of.
	pub fn base(&self) -> &Arc<Snapshot> {
		&self.base
	}

	/// Snapshot that is (or would have been) published.
	pub fn proposed(&self) -> &Arc<Snapshot> {
		&self.proposed
	}

	pub fn changes(&self) -> &[Change] {
		&self.changes
	}

	/// Changes touching `type_name`.
	pub fn changes_for<'a>(&'a self, type_name: &'a str) -> impl Iterator<Item = &'a Change> {
		self.changes.iter().filter(move |c| c.type_name() == type_name)
	}

	/// First change of `kind` on `type_name`/`key`.
	pub fn find(&self, kind: ChangeKind, type_name: &str, key: &str) -> Option<&Change> {
		self.changes
			.iter()
			.find(|c| c.kind() == kind && c.type_name() == type_name && c.key() == Some(key))
	}

	pub fn message(&self) -> Option<&Bean> {
		self.message.as_ref()
	}
}

/// Insertion-ordered listener set with identity-based deduplication.
#[derive(Clone, Default)]
pub(crate) struct ListenerSet {
	listeners: Vec<Arc<dyn ChangeListener>>,
}

fn same_listener(a: &Arc<dyn ChangeListener>, b: &Arc<dyn ChangeListener>) -> bool {
	std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl ListenerSet {
	/// Returns false when the listener was already registered.
	pub(crate) fn add(&mut self, listener: Arc<dyn ChangeListener>) -> bool {
		if self.listeners.iter().any(|l| same_listener(l, &listener)) {
			return false;
		}
		self.listeners.push(listener);
		true
	}

	pub(crate) fn remove(&mut self, listener: &Arc<dyn ChangeListener>) -> bool {
		let before = self.listeners.len();
		self.listeners.retain(|l| !same_listener(l, listener));
		before != self.listeners.len()
	}

	pub(crate) fn to_vec(&self) -> Vec<Arc<dyn ChangeListener>> {
		self.listeners.clone()
	}

	pub(crate) fn len(&self) -> usize {
		self.listeners.len()
	}
}

/// Runs the vetoable prepare pass.
///
/// Returns the listeners that accepted, in order. On veto, the accepted
/// prefix is returned alongside the veto so the caller can compensate.
pub(crate) fn prepare_all(
	listeners: &[Arc<dyn ChangeListener>],
	event: &ChangeEvent,
) -> Result<Vec<Arc<dyn ChangeListener>>, (Veto, Vec<Arc<dyn ChangeListener>>)> {
	let mut accepted = Vec::with_capacity(listeners.len());
	for (idx, listener) in listeners.iter().enumerate() {
		if let Err(veto) = listener.prepare(event) {
			warn!(
				context = event.context(),
				listener = idx,
				reason = veto.reason(),
				"change vetoed"
			);
			return Err((veto, accepted));
		}
		accepted.push(listener.clone());
	}
	Ok(accepted)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum NotifyKind {
	Committed,
	RolledBack,
}

/// Notification queued until the tracker no longer holds an open change.
pub(crate) struct Notification {
	kind: NotifyKind,
	listeners: Vec<Arc<dyn ChangeListener>>,
	event: ChangeEvent,
}

impl Notification {
	pub(crate) fn committed(listeners: Vec<Arc<dyn ChangeListener>>, event: ChangeEvent) -> Self {
		Self {
			kind: NotifyKind::Committed,
			listeners,
			event,
		}
	}

	pub(crate) fn rolled_back(listeners: Vec<Arc<dyn ChangeListener>>, event: ChangeEvent) -> Self {
		Self {
			kind: NotifyKind::RolledBack,
			listeners,
			event,
		}
	}

	pub(crate) fn deliver(self) {
		debug!(
			context = self.event.context(),
			kind = ?self.kind,
			listeners = self.listeners.len(),
			version = self.event.proposed().version().value(),
			"delivering change notification"
		);
		for listener in &self.listeners {
			match self.kind {
				NotifyKind::Committed => listener.committed(&self.event),
				NotifyKind::RolledBack => listener.rolled_back(&self.event),
			}
		}
	}
}
