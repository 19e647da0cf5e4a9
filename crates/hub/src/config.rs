//! Hub configuration loaded from TOML.
//!
//! ```toml
//! [hub]
//! compensate_on_failure = false
//! join_registry_transaction = false
//!
//! [[contexts]]
//! name = "deployer"
//! join_registry_transaction = true
//! ```
//!
//! The `[hub]` table configures the default context; each `[[contexts]]`
//! entry adds a named change-tracking context.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Name of the context every hub starts with.
pub const DEFAULT_CONTEXT: &str = "default";

/// Errors that can occur when loading hub configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error parsing TOML syntax or structure.
	#[error("failed to parse hub config: {0}")]
	Parse(#[from] toml::de::Error),

	/// Error reading a configuration file.
	#[error("I/O error reading {path}: {error}")]
	Io {
		/// Path to the file that failed to read.
		path: PathBuf,
		/// The underlying I/O error.
		error: std::io::Error,
	},

	/// Two contexts share a name, or one reuses the default context's name.
	#[error("duplicate context name: {0}")]
	DuplicateContext(String),

	#[error("context name must not be empty")]
	EmptyContextName,
}

/// Settings for the hub and its default context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubSection {
	/// Send `rolled_back` to listeners that accepted a change which then
	/// failed (veto by a later listener, lost race, registry abort).
	pub compensate_on_failure: bool,
	/// Whether the default context joins registry transactions.
	pub join_registry_transaction: bool,
}

/// One named change-tracking context.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfig {
	pub name: String,
	#[serde(default)]
	pub join_registry_transaction: bool,
}

impl ContextConfig {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			join_registry_transaction: false,
		}
	}

	/// Sets whether commits in this context join registry transactions.
	pub fn join_registry_transaction(mut self, join: bool) -> Self {
		self.join_registry_transaction = join;
		self
	}
}

/// Top-level hub configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubConfig {
	pub hub: HubSection,
	pub contexts: Vec<ContextConfig>,
}

impl HubConfig {
	/// Parses and validates configuration from a TOML string.
	pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
		let config: HubConfig = toml::from_str(input)?;
		config.validate()?;
		Ok(config)
	}

	/// Reads, parses and validates a configuration file.
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let content = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		let config = Self::from_toml_str(&content)?;
		debug!(path = %path.display(), contexts = config.contexts.len(), "loaded hub config");
		Ok(config)
	}

	/// Configuration of the default context.
	pub fn default_context(&self) -> ContextConfig {
		ContextConfig::new(DEFAULT_CONTEXT).join_registry_transaction(self.hub.join_registry_transaction)
	}

	/// Checks context names: non-empty, unique, and not the default's.
	pub fn validate(&self) -> Result<(), ConfigError> {
		let mut seen = rustc_hash::FxHashSet::default();
		seen.insert(DEFAULT_CONTEXT);
		for ctx in &self.contexts {
			validate_context_name(&ctx.name)?;
			if !seen.insert(ctx.name.as_str()) {
				return Err(ConfigError::DuplicateContext(ctx.name.clone()));
			}
		}
		Ok(())
	}
}

pub(crate) fn validate_context_name(name: &str) -> Result<(), ConfigError> {
	if name.trim().is_empty() {
		return Err(ConfigError::EmptyContextName);
	}
	Ok(())
}
