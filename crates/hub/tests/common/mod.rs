//! Shared fixtures for hub integration tests.
#![allow(dead_code)]

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use strata_hub::{
	Bean, ChangeEvent, ChangeKind, ChangeListener, Hub, RegistryAbort, RegistryTransaction,
	TwoPhaseCoordinator, TwoPhaseResource, Veto, WriteableDatabase,
};

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Stages one instance add, creating the type if needed.
pub fn add_instance(tx: &mut WriteableDatabase, type_name: &str, key: &str, value: u32) {
	tx.find_or_add_type(type_name)
		.add_instance(key, Bean::new(value))
		.expect("add instance");
}

pub fn value_of(hub: &Hub, type_name: &str, key: &str) -> Option<u32> {
	hub.instance(type_name, key).and_then(|i| i.get::<u32>().copied())
}

/// One observed listener callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Seen {
	Prepare { version: u64, changes: usize },
	Committed { version: u64, changes: usize },
	RolledBack { version: u64 },
}

/// Listener that records every callback and optionally vetoes.
#[derive(Default)]
pub struct Recorder {
	seen: Mutex<Vec<Seen>>,
	events: Mutex<Vec<ChangeEvent>>,
	veto: Option<String>,
}

impl Recorder {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn vetoing(reason: &str) -> Arc<Self> {
		Arc::new(Self {
			veto: Some(reason.to_string()),
			..Self::default()
		})
	}

	pub fn seen(&self) -> Vec<Seen> {
		self.seen.lock().clone()
	}

	/// Events passed to `committed`, in order.
	pub fn committed_events(&self) -> Vec<ChangeEvent> {
		self.events.lock().clone()
	}

	pub fn as_listener(self: &Arc<Self>) -> Arc<dyn ChangeListener> {
		self.clone()
	}
}

impl ChangeListener for Recorder {
	fn prepare(&self, event: &ChangeEvent) -> Result<(), Veto> {
		self.seen.lock().push(Seen::Prepare {
			version: event.proposed().version().value(),
			changes: event.changes().len(),
		});
		match &self.veto {
			Some(reason) => Err(Veto::new(reason.clone())),
			None => Ok(()),
		}
	}

	fn committed(&self, event: &ChangeEvent) {
		self.seen.lock().push(Seen::Committed {
			version: event.proposed().version().value(),
			changes: event.changes().len(),
		});
		self.events.lock().push(event.clone());
	}

	fn rolled_back(&self, event: &ChangeEvent) {
		self.seen.lock().push(Seen::RolledBack {
			version: event.proposed().version().value(),
		});
	}
}

/// Keys added to `type_name` by a change event.
pub fn added_keys(event: &ChangeEvent, type_name: &str) -> Vec<String> {
	event
		.changes_for(type_name)
		.filter(|c| c.kind() == ChangeKind::AddInstance)
		.filter_map(|c| c.key().map(str::to_string))
		.collect()
}

/// How a [`ScriptedTransaction`] behaves on commit.
#[derive(Clone, Debug)]
pub enum Script {
	/// Prepare then commit every participant.
	Complete,
	/// Prepare every participant, then abort with this reason.
	AbortAfterPrepare(String),
	/// Return `Ok` without touching participants; the test finishes them.
	Defer,
}

/// Coordinator handing out scripted transactions and keeping their participants.
pub struct ScriptedCoordinator {
	script: Mutex<Script>,
	pub begun: Mutex<usize>,
	pub participants: Arc<Mutex<Vec<Arc<dyn TwoPhaseResource>>>>,
}

impl ScriptedCoordinator {
	pub fn new(script: Script) -> Arc<Self> {
		Arc::new(Self {
			script: Mutex::new(script),
			begun: Mutex::new(0),
			participants: Arc::new(Mutex::new(Vec::new())),
		})
	}

	pub fn set_script(&self, script: Script) {
		*self.script.lock() = script;
	}

	pub fn participant_count(&self) -> usize {
		self.participants.lock().len()
	}

	/// Finishes deferred transactions: prepare then commit all participants.
	pub fn complete_deferred(&self) -> Result<(), RegistryAbort> {
		let participants = self.participants.lock().clone();
		for p in &participants {
			if let Err(abort) = p.prepare() {
				for p in &participants {
					p.rollback();
				}
				return Err(abort);
			}
		}
		for p in &participants {
			p.commit();
		}
		Ok(())
	}

	pub fn abort_deferred(&self) {
		for p in self.participants.lock().iter() {
			p.rollback();
		}
	}
}

impl TwoPhaseCoordinator for ScriptedCoordinator {
	fn begin(&self) -> Option<Box<dyn RegistryTransaction>> {
		*self.begun.lock() += 1;
		Some(Box::new(ScriptedTransaction {
			script: self.script.lock().clone(),
			participants: Vec::new(),
			sink: self.participants.clone(),
			notes: Vec::new(),
		}))
	}
}

pub struct ScriptedTransaction {
	script: Script,
	participants: Vec<Arc<dyn TwoPhaseResource>>,
	sink: Arc<Mutex<Vec<Arc<dyn TwoPhaseResource>>>>,
	pub notes: Vec<String>,
}

impl RegistryTransaction for ScriptedTransaction {
	fn register_participant(&mut self, participant: Arc<dyn TwoPhaseResource>) {
		self.sink.lock().push(participant.clone());
		self.participants.push(participant);
	}

	fn commit(self: Box<Self>) -> Result<(), RegistryAbort> {
		let this = *self;
		match this.script {
			Script::Defer => Ok(()),
			Script::Complete => {
				for p in &this.participants {
					if let Err(abort) = p.prepare() {
						for p in &this.participants {
							p.rollback();
						}
						return Err(abort);
					}
				}
				for p in &this.participants {
					p.commit();
				}
				Ok(())
			}
			Script::AbortAfterPrepare(reason) => {
				for p in &this.participants {
					let _ = p.prepare();
				}
				for p in &this.participants {
					p.rollback();
				}
				Err(RegistryAbort::new(reason))
			}
		}
	}

	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}

/// Coordinator that never has an active transaction.
pub struct NoTransaction;

impl TwoPhaseCoordinator for NoTransaction {
	fn begin(&self) -> Option<Box<dyn RegistryTransaction>> {
		None
	}
}
