//! Type tables and the opaque values they hold.
//!
//! # Role
//!
//! A [`TypeTable`] is the keyed, insertion-ordered set of instances for one
//! configuration type. Tables are immutable once published inside a
//! [`Snapshot`](crate::Snapshot); transactions mutate private copies.
//!
//! # Invariants
//!
//! - Each instance key appears at most once per table.
//! - Bean contents are never inspected; change detection compares identity only.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;

use crate::error::{EntryPath, HubError, Result};

type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;

/// Shared, type-erased configuration value.
///
/// Cloning a bean shares the underlying allocation. Two beans are the
/// [`same`](Bean::same) only when they share that allocation.
#[derive(Clone)]
pub struct Bean {
	value: Arc<dyn Any + Send + Sync>,
	type_name: &'static str,
}

impl Bean {
	/// Wraps a value in a new shared allocation.
	pub fn new<T: Any + Send + Sync>(value: T) -> Self {
		Self::from_arc(Arc::new(value))
	}

	/// Wraps an already shared value without copying it.
	pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
		Self {
			value,
			type_name: std::any::type_name::<T>(),
		}
	}

	/// Returns the value if it is a `T`.
	pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
		self.value.downcast_ref::<T>()
	}

	/// Returns the Rust type name recorded at construction.
	pub fn type_name(&self) -> &'static str {
		self.type_name
	}

	/// Identity comparison.
	pub fn same(&self, other: &Bean) -> bool {
		std::ptr::addr_eq(Arc::as_ptr(&self.value), Arc::as_ptr(&other.value))
	}
}

impl fmt::Debug for Bean {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Bean<{}>@{:p}", self.type_name, Arc::as_ptr(&self.value))
	}
}

fn same_opt(a: Option<&Bean>, b: Option<&Bean>) -> bool {
	match (a, b) {
		(None, None) => true,
		(Some(a), Some(b)) => a.same(b),
		_ => false,
	}
}

/// One configuration instance stored under a key of a [`TypeTable`].
#[derive(Clone, Debug)]
pub struct Instance {
	bean: Bean,
	parent: Option<String>,
	metadata: Option<Bean>,
}

impl Instance {
	/// Creates an instance without parent or metadata.
	pub fn new(bean: Bean) -> Self {
		Self {
			bean,
			parent: None,
			metadata: None,
		}
	}

	/// Sets the key of the parent instance for hierarchical types.
	pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
		self.parent = Some(parent.into());
		self
	}

	/// Attaches opaque metadata.
	pub fn with_metadata(mut self, metadata: Bean) -> Self {
		self.metadata = Some(metadata);
		self
	}

	pub fn bean(&self) -> &Bean {
		&self.bean
	}

	pub fn parent(&self) -> Option<&str> {
		self.parent.as_deref()
	}

	pub fn metadata(&self) -> Option<&Bean> {
		self.metadata.as_ref()
	}

	/// Returns the bean downcast to `T`.
	pub fn get<T: Any>(&self) -> Option<&T> {
		self.bean.downcast_ref::<T>()
	}

	/// True when bean, parent and metadata are identical.
	pub fn same(&self, other: &Instance) -> bool {
		self.bean.same(&other.bean)
			&& self.parent == other.parent
			&& same_opt(self.metadata.as_ref(), other.metadata.as_ref())
	}
}

impl From<Bean> for Instance {
	fn from(bean: Bean) -> Self {
		Self::new(bean)
	}
}

/// Keyed, insertion-ordered set of instances for one configuration type.
#[derive(Clone, Debug)]
pub struct TypeTable {
	name: String,
	instances: FxIndexMap<String, Instance>,
	metadata: Option<Bean>,
}

impl TypeTable {
	pub(crate) fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			instances: FxIndexMap::default(),
			metadata: None,
		}
	}

	/// Returns the type name.
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn metadata(&self) -> Option<&Bean> {
		self.metadata.as_ref()
	}

	/// Looks up an instance by key.
	pub fn get(&self, key: &str) -> Option<&Instance> {
		self.instances.get(key)
	}

	pub fn contains(&self, key: &str) -> bool {
		self.instances.contains_key(key)
	}

	pub fn len(&self) -> usize {
		self.instances.len()
	}

	pub fn is_empty(&self) -> bool {
		self.instances.is_empty()
	}

	/// Iterates `(key, instance)` pairs in insertion order.
	pub fn iter(&self) -> impl Iterator<Item = (&str, &Instance)> {
		self.instances.iter().map(|(k, v)| (k.as_str(), v))
	}

	pub fn keys(&self) -> impl Iterator<Item = &str> {
		self.instances.keys().map(String::as_str)
	}

	/// Iterates instances whose parent key is `parent`.
	pub fn children_of<'a>(&'a self, parent: &'a str) -> impl Iterator<Item = (&'a str, &'a Instance)> {
		self.iter().filter(move |(_, inst)| inst.parent() == Some(parent))
	}

	/// True when both tables carry the same metadata.
	pub(crate) fn same_metadata(&self, other: &TypeTable) -> bool {
		same_opt(self.metadata.as_ref(), other.metadata.as_ref())
	}

	pub(crate) fn set_metadata(&mut self, metadata: Option<Bean>) {
		self.metadata = metadata;
	}

	pub(crate) fn insert_new(&mut self, key: &str, instance: Instance) -> Result<()> {
		if self.instances.contains_key(key) {
			return Err(HubError::DuplicateKey(EntryPath::instance(&self.name, key)));
		}
		self.instances.insert(key.to_string(), instance);
		Ok(())
	}

	pub(crate) fn replace(&mut self, key: &str, instance: Instance) -> Result<Instance> {
		match self.instances.get_mut(key) {
			Some(slot) => Ok(std::mem::replace(slot, instance)),
			None => Err(HubError::NotFound(EntryPath::instance(&self.name, key))),
		}
	}

	pub(crate) fn remove(&mut self, key: &str) -> Result<Instance> {
		self.instances
			.shift_remove(key)
			.ok_or_else(|| HubError::NotFound(EntryPath::instance(&self.name, key)))
	}
}
