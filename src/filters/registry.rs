//! Kind registry.
//!
//! # Responsibilities
//! - Map kind names to their `Kind` descriptors
//! - Reject duplicate registrations
//!
//! # Design Decisions
//! - The process-wide table is built on first use from the built-in kinds,
//!   so every registration happens before any lookup
//! - Read-only after construction; no locking, no unregistration

use std::collections::BTreeMap;
use std::sync::OnceLock;

use super::{aggregator, cert_extractor, fallback, proxy, FilterError, Kind};

/// Table of filter kinds keyed by name.
#[derive(Debug, Default)]
pub struct Registry {
    kinds: BTreeMap<&'static str, &'static Kind>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for kind in [
            &aggregator::KIND,
            &cert_extractor::KIND,
            &fallback::KIND,
            &proxy::KIND,
        ] {
            if let Err(e) = registry.register(kind) {
                panic!("BUG: {}", e);
            }
        }
        registry
    }

    /// Add a kind. Registering the same name twice is an error.
    pub fn register(&mut self, kind: &'static Kind) -> Result<(), FilterError> {
        if self.kinds.contains_key(kind.name) {
            return Err(FilterError::DuplicateKind(kind.name));
        }
        self.kinds.insert(kind.name, kind);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&'static Kind> {
        self.kinds.get(name).copied()
    }

    /// Like `get`, but unknown names are an error.
    pub fn lookup(&self, name: &str) -> Result<&'static Kind, FilterError> {
        self.get(name)
            .ok_or_else(|| FilterError::UnknownKind(name.to_string()))
    }

    /// All kinds, ordered by name.
    pub fn kinds(&self) -> impl Iterator<Item = &'static Kind> + '_ {
        self.kinds.values().copied()
    }
}

/// The process-wide registry of built-in kinds.
pub fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::with_builtins)
}
