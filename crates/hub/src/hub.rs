//! The hub: published snapshot, change-tracking contexts and coordinator slot.

use std::sync::Arc;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use rustc_hash::FxBuildHasher;
use tracing::{debug, info};

use crate::config::{ConfigError, ContextConfig, DEFAULT_CONTEXT, HubConfig, validate_context_name};
use crate::error::{HubError, Result};
use crate::snapshot::{Snapshot, Version};
use crate::table::{Bean, Instance, TypeTable};
use crate::tracker::{ChangeListener, ChangeTracker, CommitOutcome};
use crate::transaction::WriteableDatabase;
use crate::two_phase::TwoPhaseCoordinator;

/// State shared by every context of one hub.
pub(crate) struct HubShared {
	pub(crate) current: ArcSwap<Snapshot>,
	pub(crate) coordinator: RwLock<Option<Arc<dyn TwoPhaseCoordinator>>>,
	pub(crate) compensate_on_failure: bool,
}

impl HubShared {
	/// Publishes `proposed` if `base` is still current.
	pub(crate) fn publish(&self, base: &Arc<Snapshot>, proposed: Arc<Snapshot>) -> Result<()> {
		let prev = self.current.compare_and_swap(base, proposed);
		if Arc::ptr_eq(&prev, base) {
			Ok(())
		} else {
			Err(HubError::CommitConflict {
				base: base.version(),
				current: prev.version(),
			})
		}
	}
}

struct HubInner {
	shared: Arc<HubShared>,
	default: ChangeTracker,
	contexts: RwLock<IndexMap<String, ChangeTracker, FxBuildHasher>>,
}

/// Transactional, snapshot-isolated configuration store.
///
/// Readers pin immutable [`Snapshot`]s and never block. Writers stage work in
/// a [`WriteableDatabase`] and commit it through a context's
/// [`ChangeTracker`]; the hub's own `commit` uses the default context.
///
/// Cloning is cheap and yields another handle to the same hub.
#[derive(Clone)]
pub struct Hub {
	inner: Arc<HubInner>,
}

impl std::fmt::Debug for Hub {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Hub")
			.field("version", &self.version())
			.field("contexts", &self.context_names())
			.finish()
	}
}

impl Default for Hub {
	fn default() -> Self {
		Self::new()
	}
}

impl Hub {
	/// Creates an empty hub at [`Version::INITIAL`] with only the default context.
	pub fn new() -> Self {
		Self::build(&HubConfig::default())
	}

	/// Creates an empty hub with the configured contexts.
	pub fn with_config(config: &HubConfig) -> Result<Self, ConfigError> {
		config.validate()?;
		Ok(Self::build(config))
	}

	fn build(config: &HubConfig) -> Self {
		let shared = Arc::new(HubShared {
			current: ArcSwap::from_pointee(Snapshot::default()),
			coordinator: RwLock::new(None),
			compensate_on_failure: config.hub.compensate_on_failure,
		});
		let default = ChangeTracker::new(shared.clone(), &config.default_context());
		let mut contexts = IndexMap::with_hasher(FxBuildHasher);
		for ctx in &config.contexts {
			contexts.insert(ctx.name.clone(), ChangeTracker::new(shared.clone(), ctx));
		}
		info!(
			contexts = contexts.len() + 1,
			compensate_on_failure = config.hub.compensate_on_failure,
			"hub created"
		);
		Self {
			inner: Arc::new(HubInner {
				shared,
				default,
				contexts: RwLock::new(contexts),
			}),
		}
	}

	/// Pins the currently published snapshot.
	pub fn current_snapshot(&self) -> Arc<Snapshot> {
		self.inner.shared.current.load_full()
	}

	pub fn version(&self) -> Version {
		self.inner.shared.current.load().version()
	}

	/// Table of `type_name` in the current snapshot.
	pub fn type_table(&self, type_name: &str) -> Option<Arc<TypeTable>> {
		self.inner.shared.current.load().type_table(type_name).cloned()
	}

	/// One instance from the current snapshot.
	pub fn instance(&self, type_name: &str, key: &str) -> Option<Instance> {
		self.inner.shared.current.load().get(type_name, key).cloned()
	}

	/// Creates a transaction in the default context.
	pub fn new_transaction(&self) -> WriteableDatabase {
		self.inner.default.new_transaction()
	}

	/// Commits a transaction in the default context.
	pub fn commit(&self, tx: WriteableDatabase) -> Result<CommitOutcome> {
		self.inner.default.commit(tx)
	}

	pub fn commit_with_message(&self, tx: WriteableDatabase, message: Bean) -> Result<CommitOutcome> {
		self.inner.default.commit_with_message(tx, message)
	}

	/// The default context.
	pub fn tracker(&self) -> &ChangeTracker {
		&self.inner.default
	}

	/// Looks up a context by name.
	pub fn context(&self, name: &str) -> Option<ChangeTracker> {
		if name == DEFAULT_CONTEXT {
			return Some(self.inner.default.clone());
		}
		self.inner.contexts.read().get(name).cloned()
	}

	/// Adds a named context.
	pub fn add_context(&self, config: ContextConfig) -> Result<ChangeTracker, ConfigError> {
		validate_context_name(&config.name)?;
		if config.name == DEFAULT_CONTEXT {
			return Err(ConfigError::DuplicateContext(config.name));
		}
		let mut contexts = self.inner.contexts.write();
		if contexts.contains_key(&config.name) {
			return Err(ConfigError::DuplicateContext(config.name));
		}
		let tracker = ChangeTracker::new(self.inner.shared.clone(), &config);
		debug!(context = %config.name, join = config.join_registry_transaction, "added context");
		contexts.insert(config.name, tracker.clone());
		Ok(tracker)
	}

	/// Context names, default first.
	pub fn context_names(&self) -> Vec<String> {
		let contexts = self.inner.contexts.read();
		let mut names = Vec::with_capacity(contexts.len() + 1);
		names.push(DEFAULT_CONTEXT.to_string());
		names.extend(contexts.keys().cloned());
		names
	}

	/// Installs the coordinator consulted by contexts that join registry
	/// transactions. Changes that are already open keep their mode.
	pub fn set_coordinator(&self, coordinator: Arc<dyn TwoPhaseCoordinator>) {
		*self.inner.shared.coordinator.write() = Some(coordinator);
		debug!("coordinator installed");
	}

	/// Removes the coordinator, returning it.
	pub fn clear_coordinator(&self) -> Option<Arc<dyn TwoPhaseCoordinator>> {
		self.inner.shared.coordinator.write().take()
	}

	pub fn has_coordinator(&self) -> bool {
		self.inner.shared.coordinator.read().is_some()
	}

	/// Registers a listener with the default context.
	pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) -> bool {
		self.inner.default.add_change_listener(listener)
	}

	/// Unregisters a listener from the default context.
	pub fn remove_listener(&self, listener: &Arc<dyn ChangeListener>) -> bool {
		self.inner.default.remove_change_listener(listener)
	}
}
