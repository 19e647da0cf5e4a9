//! Writable, copy-on-write working copies of a snapshot.
//!
//! # Role
//!
//! A [`WriteableDatabase`] stages adds, modifies and removes for any number
//! of types and records them in an ordered operation log. Nothing it does is
//! visible to other readers until it is committed through a
//! [`ChangeTracker`](crate::ChangeTracker) or the [`Hub`](crate::Hub).
//!
//! # Invariants
//!
//! - Types the transaction never touches keep sharing the base snapshot's
//!   `Arc<TypeTable>`; the first write to a type clones it (`Arc::make_mut`).
//! - Every logged operation was valid against the working view when it was
//!   recorded. Commit replays the log and re-validates it against the open
//!   change, which may already hold other folded transactions.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{EntryPath, HubError, Result};
use crate::snapshot::{Snapshot, TypeMap, Version};
use crate::table::{Bean, Instance, TypeTable};

/// One logged mutation.
#[derive(Clone, Debug)]
pub enum Operation {
	AddType {
		type_name: String,
	},
	RemoveType {
		type_name: String,
	},
	SetTypeMetadata {
		type_name: String,
		metadata: Option<Bean>,
	},
	AddInstance {
		type_name: String,
		key: String,
		instance: Instance,
	},
	ModifyInstance {
		type_name: String,
		key: String,
		instance: Instance,
	},
	RemoveInstance {
		type_name: String,
		key: String,
	},
}

impl Operation {
	pub fn type_name(&self) -> &str {
		match self {
			Operation::AddType { type_name }
			| Operation::RemoveType { type_name }
			| Operation::SetTypeMetadata { type_name, .. }
			| Operation::AddInstance { type_name, .. }
			| Operation::ModifyInstance { type_name, .. }
			| Operation::RemoveInstance { type_name, .. } => type_name,
		}
	}
}

fn table_mut<'a>(types: &'a mut TypeMap, type_name: &str) -> Result<&'a mut TypeTable> {
	types
		.get_mut(type_name)
		.map(Arc::make_mut)
		.ok_or_else(|| HubError::NotFound(EntryPath::ty(type_name)))
}

/// Applies one operation to a working type map.
///
/// On error the map is left exactly as it was.
pub(crate) fn apply(types: &mut TypeMap, op: &Operation) -> Result<()> {
	match op {
		Operation::AddType { type_name } => {
			if types.contains_key(type_name) {
				return Err(HubError::DuplicateKey(EntryPath::ty(type_name)));
			}
			types.insert(type_name.clone(), Arc::new(TypeTable::new(type_name.as_str())));
		}
		Operation::RemoveType { type_name } => {
			let table = types
				.get(type_name)
				.ok_or_else(|| HubError::NotFound(EntryPath::ty(type_name)))?;
			if !table.is_empty() {
				return Err(HubError::TypeNotEmpty {
					type_name: type_name.clone(),
					instances: table.len(),
				});
			}
			types.remove(type_name);
		}
		Operation::SetTypeMetadata { type_name, metadata } => {
			table_mut(types, type_name)?.set_metadata(metadata.clone());
		}
		Operation::AddInstance {
			type_name,
			key,
			instance,
		} => {
			check_instance(types, type_name, key, false)?;
			table_mut(types, type_name)?.insert_new(key, instance.clone())?;
		}
		Operation::ModifyInstance {
			type_name,
			key,
			instance,
		} => {
			check_instance(types, type_name, key, true)?;
			table_mut(types, type_name)?.replace(key, instance.clone())?;
		}
		Operation::RemoveInstance { type_name, key } => {
			check_instance(types, type_name, key, true)?;
			table_mut(types, type_name)?.remove(key)?;
		}
	}
	Ok(())
}

/// Validates an instance operation before `make_mut` clones a shared table.
fn check_instance(types: &TypeMap, type_name: &str, key: &str, present: bool) -> Result<()> {
	let table = types
		.get(type_name)
		.ok_or_else(|| HubError::NotFound(EntryPath::ty(type_name)))?;
	match (present, table.contains(key)) {
		(true, false) => Err(HubError::NotFound(EntryPath::instance(type_name, key))),
		(false, true) => Err(HubError::DuplicateKey(EntryPath::instance(type_name, key))),
		_ => Ok(()),
	}
}

/// Source of generated instance keys for one change-tracking context.
#[derive(Debug)]
pub(crate) struct KeyGenerator {
	prefix: String,
	next: AtomicU64,
}

impl KeyGenerator {
	pub(crate) fn new(prefix: impl Into<String>) -> Self {
		Self {
			prefix: prefix.into(),
			next: AtomicU64::new(0),
		}
	}

	pub(crate) fn next_key(&self) -> String {
		let n = self.next.fetch_add(1, Ordering::Relaxed);
		format!("{}-{}", self.prefix, n)
	}
}

/// Copy-on-write working copy of a snapshot.
pub struct WriteableDatabase {
	base: Arc<Snapshot>,
	working: TypeMap,
	ops: Vec<Operation>,
	message: Option<Bean>,
	keys: Arc<KeyGenerator>,
}

impl std::fmt::Debug for WriteableDatabase {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WriteableDatabase")
			.field("base_version", &self.base.version())
			.field("types", &self.working.len())
			.field("ops", &self.ops.len())
			.finish()
	}
}

impl WriteableDatabase {
	pub(crate) fn new(base: Arc<Snapshot>, working: TypeMap, keys: Arc<KeyGenerator>) -> Self {
		Self {
			base,
			working,
			ops: Vec::new(),
			message: None,
			keys,
		}
	}

	/// Snapshot this transaction was derived from.
	pub fn base(&self) -> &Arc<Snapshot> {
		&self.base
	}

	pub fn base_version(&self) -> Version {
		self.base.version()
	}

	/// Reads a type through the transaction's working view.
	pub fn type_table(&self, type_name: &str) -> Option<&TypeTable> {
		self.working.get(type_name).map(Arc::as_ref)
	}

	/// Reads an instance through the transaction's working view.
	pub fn get(&self, type_name: &str, key: &str) -> Option<&Instance> {
		self.working.get(type_name)?.get(key)
	}

	/// Iterates type names visible to this transaction.
	pub fn type_names(&self) -> impl Iterator<Item = &str> {
		self.working.keys().map(String::as_str)
	}

	/// Adds a new, empty type.
	pub fn add_type(&mut self, type_name: &str) -> Result<WriteableType<'_>> {
		self.record(Operation::AddType {
			type_name: type_name.to_string(),
		})?;
		Ok(WriteableType {
			db: self,
			type_name: type_name.to_string(),
		})
	}

	/// Returns the type, adding it first when absent.
	pub fn find_or_add_type(&mut self, type_name: &str) -> WriteableType<'_> {
		if !self.working.contains_key(type_name) {
			self.ops.push(Operation::AddType {
				type_name: type_name.to_string(),
			});
			self.working
				.insert(type_name.to_string(), Arc::new(TypeTable::new(type_name)));
		}
		WriteableType {
			db: self,
			type_name: type_name.to_string(),
		}
	}

	/// Returns a writable handle for an existing type.
	pub fn writeable_type(&mut self, type_name: &str) -> Option<WriteableType<'_>> {
		if !self.working.contains_key(type_name) {
			return None;
		}
		Some(WriteableType {
			db: self,
			type_name: type_name.to_string(),
		})
	}

	/// Removes an empty type.
	///
	/// Types that still hold instances are rejected with
	/// [`HubError::TypeNotEmpty`]; remove the instances first.
	pub fn remove_type(&mut self, type_name: &str) -> Result<()> {
		self.record(Operation::RemoveType {
			type_name: type_name.to_string(),
		})
	}

	/// Attaches an opaque message handed to listeners on commit.
	pub fn set_commit_message(&mut self, message: Bean) {
		self.message = Some(message);
	}

	pub fn commit_message(&self) -> Option<&Bean> {
		self.message.as_ref()
	}

	/// Operation log in recording order.
	pub fn operations(&self) -> &[Operation] {
		&self.ops
	}

	/// True when nothing has been staged.
	pub fn is_empty(&self) -> bool {
		self.ops.is_empty()
	}

	fn record(&mut self, op: Operation) -> Result<()> {
		apply(&mut self.working, &op)?;
		self.ops.push(op);
		Ok(())
	}

	pub(crate) fn into_parts(self) -> (Arc<Snapshot>, Vec<Operation>, Option<Bean>) {
		(self.base, self.ops, self.message)
	}
}

/// Writable handle for one type inside a [`WriteableDatabase`].
#[derive(Debug)]
pub struct WriteableType<'a> {
	db: &'a mut WriteableDatabase,
	type_name: String,
}

impl WriteableType<'_> {
	pub fn name(&self) -> &str {
		&self.type_name
	}

	/// Reads an instance through the working view.
	pub fn get(&self, key: &str) -> Option<&Instance> {
		self.db.get(&self.type_name, key)
	}

	/// Current working table for this type.
	pub fn table(&self) -> Option<&TypeTable> {
		self.db.type_table(&self.type_name)
	}

	/// Adds an instance under a new key.
	pub fn add_instance(&mut self, key: &str, instance: impl Into<Instance>) -> Result<()> {
		self.db.record(Operation::AddInstance {
			type_name: self.type_name.clone(),
			key: key.to_string(),
			instance: instance.into(),
		})
	}

	/// Adds an instance under a key generated by the owning context.
	pub fn add_generated(&mut self, instance: impl Into<Instance>) -> Result<String> {
		let mut key = self.db.keys.next_key();
		while self.get(&key).is_some() {
			key = self.db.keys.next_key();
		}
		self.add_instance(&key, instance)?;
		Ok(key)
	}

	/// Replaces an existing instance, returning the one it replaced.
	pub fn modify_instance(&mut self, key: &str, instance: impl Into<Instance>) -> Result<Instance> {
		let old = self
			.get(key)
			.cloned()
			.ok_or_else(|| HubError::NotFound(EntryPath::instance(&self.type_name, key)))?;
		self.db.record(Operation::ModifyInstance {
			type_name: self.type_name.clone(),
			key: key.to_string(),
			instance: instance.into(),
		})?;
		Ok(old)
	}

	/// Removes an existing instance, returning it.
	pub fn remove_instance(&mut self, key: &str) -> Result<Instance> {
		let old = self
			.get(key)
			.cloned()
			.ok_or_else(|| HubError::NotFound(EntryPath::instance(&self.type_name, key)))?;
		self.db.record(Operation::RemoveInstance {
			type_name: self.type_name.clone(),
			key: key.to_string(),
		})?;
		Ok(old)
	}

	/// Replaces the type's metadata.
	pub fn set_metadata(&mut self, metadata: Option<Bean>) -> Result<()> {
		self.db.record(Operation::SetTypeMetadata {
			type_name: self.type_name.clone(),
			metadata,
		})
	}
}
