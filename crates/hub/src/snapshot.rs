//! Immutable, versioned views of the whole hub.
//!
//! # Role
//!
//! A [`Snapshot`] is what readers pin: a version number plus the type tables
//! that were current when it was published. Publication swaps one `Arc` for
//! another; nothing inside a published snapshot is ever mutated.
//!
//! # Invariants
//!
//! - Published versions increase by exactly one per publication.
//! - Types untouched by a commit keep the same `Arc<TypeTable>` in the next
//!   snapshot (structural sharing).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::table::{Instance, TypeTable};

/// Type tables keyed by type name, shared structurally between versions.
pub(crate) type TypeMap = BTreeMap<String, Arc<TypeTable>>;

/// Totally ordered snapshot version.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Version(u64);

impl Version {
	/// Version of an empty, never committed hub.
	pub const INITIAL: Version = Version(0);

	#[inline]
	pub const fn new(value: u64) -> Self {
		Self(value)
	}

	#[inline]
	pub const fn value(self) -> u64 {
		self.0
	}

	/// Returns the version that the next publication will carry.
	#[inline]
	pub const fn next(self) -> Self {
		Self(self.0 + 1)
	}
}

impl fmt::Display for Version {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Immutable point-in-time view of every configuration type.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
	version: Version,
	types: TypeMap,
}

impl Snapshot {
	pub(crate) fn new(version: Version, types: TypeMap) -> Self {
		Self { version, types }
	}

	pub fn version(&self) -> Version {
		self.version
	}

	/// Returns the table for `type_name`, if the type exists.
	pub fn type_table(&self, type_name: &str) -> Option<&Arc<TypeTable>> {
		self.types.get(type_name)
	}

	/// Looks up one instance.
	pub fn get(&self, type_name: &str, key: &str) -> Option<&Instance> {
		self.types.get(type_name)?.get(key)
	}

	pub fn contains_type(&self, type_name: &str) -> bool {
		self.types.contains_key(type_name)
	}

	/// Iterates type names in lexical order.
	pub fn type_names(&self) -> impl Iterator<Item = &str> {
		self.types.keys().map(String::as_str)
	}

	/// Iterates all tables in type-name order.
	pub fn types(&self) -> impl Iterator<Item = &Arc<TypeTable>> {
		self.types.values()
	}

	/// Number of types.
	pub fn len(&self) -> usize {
		self.types.len()
	}

	pub fn is_empty(&self) -> bool {
		self.types.is_empty()
	}

	pub(crate) fn type_map(&self) -> &TypeMap {
		&self.types
	}
}
