//! Name to factory registry
//!
//! One registry instance exists per provider kind (value providers, chargers,
//! meters, ...). Names are stored lowercase and matched case-insensitively.
//! A registry is filled once during bootstrap and is read-only afterwards.

use crate::error::{HeliosError, Result};
use std::collections::BTreeMap;

/// Append-only map from lowercase type name to factory
#[derive(Clone)]
pub struct Registry<F> {
    kind: &'static str,
    factories: BTreeMap<String, F>,
}

impl<F: Clone> Registry<F> {
    /// Create an empty registry for the given kind (used in error messages)
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: BTreeMap::new(),
        }
    }

    /// Kind of things this registry builds
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Register a factory; a duplicate name is a configuration error
    pub fn register(&mut self, name: &str, factory: F) -> Result<()> {
        let key = name.trim().to_lowercase();
        if key.is_empty() {
            return Err(HeliosError::config(format!(
                "cannot register {} with empty name",
                self.kind
            )));
        }
        if self.factories.contains_key(&key) {
            return Err(HeliosError::config(format!(
                "duplicate {} type: {}",
                self.kind, key
            )));
        }
        self.factories.insert(key, factory);
        Ok(())
    }

    /// Look up the factory registered under `name`
    pub fn lookup(&self, name: &str) -> Result<F> {
        self.factories
            .get(&name.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| HeliosError::config(format!("invalid {} type: {}", self.kind, name)))
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}
