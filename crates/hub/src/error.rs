//! Error taxonomy for hub operations.

use std::fmt;

use thiserror::Error;

use crate::snapshot::Version;

/// Location of a type or an instance inside the hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryPath {
	/// A whole configuration type.
	Type(String),
	/// One instance of a configuration type.
	Instance {
		/// Name of the owning type.
		type_name: String,
		/// Instance key within the type.
		key: String,
	},
}

impl EntryPath {
	pub(crate) fn ty(type_name: &str) -> Self {
		Self::Type(type_name.to_string())
	}

	pub(crate) fn instance(type_name: &str, key: &str) -> Self {
		Self::Instance {
			type_name: type_name.to_string(),
			key: key.to_string(),
		}
	}
}

impl fmt::Display for EntryPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			EntryPath::Type(name) => write!(f, "type {name:?}"),
			EntryPath::Instance { type_name, key } => write!(f, "instance {type_name:?}/{key:?}"),
		}
	}
}

/// Rejection returned by a [`ChangeListener`](crate::ChangeListener) from its prepare step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct Veto {
	reason: String,
}

impl Veto {
	/// Creates a veto with a human readable reason.
	pub fn new(reason: impl Into<String>) -> Self {
		Self { reason: reason.into() }
	}

	/// Returns the reason given by the vetoing listener.
	pub fn reason(&self) -> &str {
		&self.reason
	}
}

/// Abort reported by an external registry transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct RegistryAbort {
	reason: String,
}

impl RegistryAbort {
	/// Creates an abort with a human readable reason.
	pub fn new(reason: impl Into<String>) -> Self {
		Self { reason: reason.into() }
	}

	/// Returns the abort reason.
	pub fn reason(&self) -> &str {
		&self.reason
	}
}

/// Errors surfaced by transactions, commits and change tracking.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
	/// An add targeted a type or instance that is already present.
	#[error("duplicate key: {0}")]
	DuplicateKey(EntryPath),

	/// A modify or remove targeted a type or instance that is absent.
	#[error("not found: {0}")]
	NotFound(EntryPath),

	/// A type was removed while it still held instances.
	#[error("type {type_name:?} still holds {instances} instance(s)")]
	TypeNotEmpty { type_name: String, instances: usize },

	/// The transaction's base snapshot is no longer the one it would publish over.
	#[error("commit conflict: transaction based on version {base}, hub is at version {current}")]
	CommitConflict { base: Version, current: Version },

	/// A change listener rejected the proposed change.
	#[error("change vetoed by listener: {0}")]
	ListenerVeto(#[from] Veto),

	/// The external registry transaction aborted.
	#[error("registry transaction aborted: {0}")]
	TwoPhaseAbort(#[from] RegistryAbort),

	/// The change protocol was driven out of order.
	#[error("invalid state: {0}")]
	InvalidState(&'static str),
}

/// Result type for hub operations.
pub type Result<T, E = HubError> = std::result::Result<T, E>;
