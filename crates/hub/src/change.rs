//! Change records computed between two snapshots.

use std::sync::Arc;

use crate::snapshot::TypeMap;
use crate::table::{Instance, TypeTable};

/// Kind of a single change record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
	AddType,
	RemoveType,
	/// Type metadata was replaced.
	ModifyType,
	AddInstance,
	ModifyInstance,
	RemoveInstance,
}

/// One `(type, key, old, new)` record delivered to change listeners.
#[derive(Clone, Debug)]
pub struct Change {
	kind: ChangeKind,
	type_name: String,
	key: Option<String>,
	old: Option<Instance>,
	new: Option<Instance>,
}

impl Change {
	fn for_type(kind: ChangeKind, type_name: &str) -> Self {
		Self {
			kind,
			type_name: type_name.to_string(),
			key: None,
			old: None,
			new: None,
		}
	}

	fn for_instance(
		kind: ChangeKind,
		type_name: &str,
		key: &str,
		old: Option<&Instance>,
		new: Option<&Instance>,
	) -> Self {
		Self {
			kind,
			type_name: type_name.to_string(),
			key: Some(key.to_string()),
			old: old.cloned(),
			new: new.cloned(),
		}
	}

	pub fn kind(&self) -> ChangeKind {
		self.kind
	}

	pub fn type_name(&self) -> &str {
		&self.type_name
	}

	/// Instance key; `None` for type-level records.
	pub fn key(&self) -> Option<&str> {
		self.key.as_deref()
	}

	pub fn old(&self) -> Option<&Instance> {
		self.old.as_ref()
	}

	pub fn new_value(&self) -> Option<&Instance> {
		self.new.as_ref()
	}
}

/// Computes the ordered change list that turns `base` into `proposed`.
///
/// Types are visited in name order. Within a type, removals come first in
/// base order, then additions and modifications in proposed order. Tables
/// shared between both maps are skipped without inspection.
pub(crate) fn diff(base: &TypeMap, proposed: &TypeMap) -> Vec<Change> {
	let mut out = Vec::new();

	for (name, old) in base {
		if !proposed.contains_key(name) {
			for (key, inst) in old.iter() {
				out.push(Change::for_instance(ChangeKind::RemoveInstance, name, key, Some(inst), None));
			}
			out.push(Change::for_type(ChangeKind::RemoveType, name));
		}
	}

	for (name, new) in proposed {
		match base.get(name) {
			None => {
				out.push(Change::for_type(ChangeKind::AddType, name));
				for (key, inst) in new.iter() {
					out.push(Change::for_instance(ChangeKind::AddInstance, name, key, None, Some(inst)));
				}
			}
			Some(old) if Arc::ptr_eq(old, new) => {}
			Some(old) => diff_table(&mut out, old, new),
		}
	}

	// Removed types sort among the others by name.
	out.sort_by(|a, b| a.type_name.cmp(&b.type_name));
	out
}

fn diff_table(out: &mut Vec<Change>, old: &TypeTable, new: &TypeTable) {
	let name = new.name();
	if !old.same_metadata(new) {
		out.push(Change::for_type(ChangeKind::ModifyType, name));
	}
	for (key, inst) in old.iter() {
		if !new.contains(key) {
			out.push(Change::for_instance(ChangeKind::RemoveInstance, name, key, Some(inst), None));
		}
	}
	for (key, inst) in new.iter() {
		match old.get(key) {
			None => out.push(Change::for_instance(ChangeKind::AddInstance, name, key, None, Some(inst))),
			Some(prev) if prev.same(inst) => {}
			Some(prev) => out.push(Change::for_instance(
				ChangeKind::ModifyInstance,
				name,
				key,
				Some(prev),
				Some(inst),
			)),
		}
	}
}
