//! Transactional, snapshot-isolated configuration store.
//!
//! Configuration lives in named types, each a keyed set of opaque instances.
//! Readers work against immutable, versioned [`Snapshot`]s. Writers stage
//! changes in a [`WriteableDatabase`] and commit them through a
//! [`ChangeTracker`], which folds nested commits into one logical change,
//! runs vetoable [`ChangeListener`]s, and publishes the result either on its
//! own or as a participant of an external two-phase registry transaction.
//!
//! # Modules
//!
//! - [`table`] - Type tables, instances and opaque beans
//! - [`snapshot`] - Immutable versioned views
//! - [`transaction`] - Copy-on-write working copies
//! - [`change`] - Change records handed to listeners
//! - [`tracker`] - Nesting, locking and listener dispatch per context
//! - [`two_phase`] - Registry transaction participation
//! - [`config`] - TOML configuration
//!
//! # Example
//!
//! ```
//! use strata_hub::{Bean, Hub};
//!
//! let hub = Hub::new();
//! let mut tx = hub.new_transaction();
//! tx.add_type("Service")?.add_instance("a", Bean::new(8080u16))?;
//! let outcome = hub.commit(tx)?;
//! assert_eq!(outcome.snapshot().map(|s| s.version().value()), Some(1));
//! assert_eq!(hub.instance("Service", "a").and_then(|i| i.get::<u16>().copied()), Some(8080));
//! # Ok::<(), strata_hub::HubError>(())
//! ```

pub mod change;
pub mod config;
pub mod error;
mod hub;
pub mod snapshot;
pub mod table;
pub mod tracker;
pub mod transaction;
pub mod two_phase;

pub use change::{Change, ChangeKind};
pub use config::{ConfigError, ContextConfig, HubConfig, HubSection};
pub use error::{EntryPath, HubError, RegistryAbort, Result, Veto};
pub use hub::Hub;
pub use snapshot::{Snapshot, Version};
pub use table::{Bean, Instance, TypeTable};
pub use tracker::{ChangeEvent, ChangeListener, ChangeTracker, CommitOutcome, InFlightChange, WriteGuard};
pub use transaction::{Operation, WriteableDatabase, WriteableType};
pub use two_phase::{
	HubParticipant, LocalCoordinator, LocalTransaction, Phase, RegistryTransaction, TwoPhaseCoordinator,
	TwoPhaseResource,
};
