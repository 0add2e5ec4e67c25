//! Name → implementation registries.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::access::{AccessMethod, ExecAccess, SshAccess};
use crate::environment::{EnvironmentDriver, NoopDriver};
use crate::error::{DriverError, DriverResult};

/// Implementations of one port, keyed by name.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    entries: BTreeMap<String, Arc<T>>,
}

pub type DriverRegistry = Registry<dyn EnvironmentDriver>;
pub type AccessRegistry = Registry<dyn AccessMethod>;

impl<T: ?Sized> Registry<T> {
    /// An empty registry; `kind` names the port in errors.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Register `entry` under `name`. A name can be registered only once.
    pub fn register(&mut self, name: impl Into<String>, entry: Arc<T>) -> DriverResult<()> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(DriverError::AlreadyRegistered {
                kind: self.kind,
                name,
            });
        }
        debug!(kind = self.kind, %name, "registered");
        self.entries.insert(name, entry);
        Ok(())
    }

    pub fn get(&self, name: &str) -> DriverResult<Arc<T>> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::Unknown {
                kind: self.kind,
                name: name.to_string(),
            })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

impl Registry<dyn EnvironmentDriver> {
    /// Registry holding the built-in environment drivers.
    pub fn builtin() -> Self {
        let mut registry = Self::new("environment driver");
        registry
            .entries
            .insert(NoopDriver::NAME.to_string(), Arc::new(NoopDriver));
        registry
    }
}

impl Registry<dyn AccessMethod> {
    /// Registry holding the built-in access methods.
    pub fn builtin() -> Self {
        let mut registry = Self::new("access method");
        registry
            .entries
            .insert(ExecAccess::NAME.to_string(), Arc::new(ExecAccess));
        registry
            .entries
            .insert(SshAccess::NAME.to_string(), Arc::new(SshAccess));
        registry
    }
}
