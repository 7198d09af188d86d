// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Feature source contracts and the provider registry.
//!
//! A source is an opaque provider that contributes one domain of
//! features to the node snapshot. The registry runs every enabled
//! provider in sequence; providers are isolated from each other, and a
//! failing provider only loses its own domain for that cycle.
//!
//! Capability methods beyond `name`/`discover` have no-op defaults:
//! label sources additionally expose a direct label set, configurable
//! sources accept their section of the worker config, and event
//! sources declare filesystem paths whose changes should retrigger
//! discovery.

mod fake;
mod local;
mod system;

pub use fake::FakeSource;
pub use local::LocalSource;
pub use system::SystemSource;

use crate::snapshot::{DomainFeatures, FeatureSnapshot};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Source and registry errors.
#[derive(Debug, Error)]
pub enum SourceError {
    /// A source with the same name is already registered.
    #[error("duplicate source name {0:?}")]
    DuplicateSourceName(String),

    /// Discovery I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Per-source configuration was rejected.
    #[error("source config error: {0}")]
    Config(String),

    /// Discovery failed for a non-I/O reason.
    #[error("discovery failed: {0}")]
    Discovery(String),
}

/// A feature provider contributing one domain to the snapshot.
pub trait Source: Send {
    /// Domain name this source contributes. Unique per registry.
    fn name(&self) -> &str;

    /// Discover this source's features. Called once per cycle.
    fn discover(&mut self) -> Result<DomainFeatures, SourceError>;

    /// Direct labels exposed for backward compatibility. Only
    /// meaningful when [`is_label_source`](Source::is_label_source)
    /// returns true; reflects the most recent `discover` pass.
    fn labels(&self) -> Result<BTreeMap<String, String>, SourceError> {
        Ok(BTreeMap::new())
    }

    /// Whether this source contributes direct labels.
    fn is_label_source(&self) -> bool {
        false
    }

    /// Accept this source's section of the worker configuration.
    fn configure(&mut self, _config: &serde_yaml::Value) -> Result<(), SourceError> {
        Ok(())
    }

    /// Filesystem paths whose changes should retrigger discovery.
    fn watch_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Wildcard enabling every source in an enable list.
pub const ALL_SOURCES: &str = "all";

/// Name-keyed registry of feature providers.
pub struct SourceRegistry {
    sources: BTreeMap<String, Box<dyn Source>>,
    enabled_features: Vec<String>,
    enabled_labels: Vec<String>,
}

impl SourceRegistry {
    /// Create an empty registry with everything enabled.
    pub fn new() -> Self {
        Self {
            sources: BTreeMap::new(),
            enabled_features: vec![ALL_SOURCES.to_string()],
            enabled_labels: vec![ALL_SOURCES.to_string()],
        }
    }

    /// Create a registry pre-populated with the built-in sources.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        // Fresh registry, builtin names cannot collide.
        let _ = registry.register(Box::new(SystemSource::new()));
        let _ = registry.register(Box::new(LocalSource::new()));
        let _ = registry.register(Box::new(FakeSource::new()));
        registry
    }

    /// Register a provider under its declared name.
    pub fn register(&mut self, source: Box<dyn Source>) -> Result<(), SourceError> {
        let name = source.name().to_string();
        if self.sources.contains_key(&name) {
            return Err(SourceError::DuplicateSourceName(name));
        }
        self.sources.insert(name, source);
        Ok(())
    }

    /// Restrict which sources contribute features and labels.
    pub fn set_enabled(&mut self, feature_sources: &[String], label_sources: &[String]) {
        self.enabled_features = feature_sources.to_vec();
        self.enabled_labels = label_sources.to_vec();
    }

    /// Apply per-source configuration sections. Unknown section names
    /// are reported; a bad section disables nothing beyond itself.
    pub fn configure(
        &mut self,
        sections: &BTreeMap<String, serde_yaml::Value>,
    ) -> Vec<SourceError> {
        let mut errors = Vec::new();
        for (name, value) in sections {
            match self.sources.get_mut(name) {
                Some(source) => {
                    if let Err(e) = source.configure(value) {
                        errors.push(e);
                    }
                }
                None => errors.push(SourceError::Config(format!(
                    "config section for unknown source {:?}",
                    name
                ))),
            }
        }
        errors
    }

    /// Run every enabled provider and merge the results into a fresh
    /// snapshot. Each provider's domain is keyed by the provider name;
    /// a failing provider is omitted for this cycle and reported.
    pub fn discover(&mut self) -> (FeatureSnapshot, Vec<SourceError>) {
        let mut snapshot = FeatureSnapshot::new();
        let mut errors = Vec::new();

        for (name, source) in self.sources.iter_mut() {
            if !enabled(&self.enabled_features, name) {
                continue;
            }
            match source.discover() {
                Ok(features) => {
                    snapshot.insert_domain(name.clone(), features);
                }
                Err(e) => {
                    log::warn!("source {:?} failed discovery: {}", name, e);
                    errors.push(e);
                }
            }
        }
        (snapshot, errors)
    }

    /// Aggregate direct labels from the enabled label sources.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        for (name, source) in &self.sources {
            if !source.is_label_source() || !enabled(&self.enabled_labels, name) {
                continue;
            }
            match source.labels() {
                Ok(source_labels) => labels.extend(source_labels),
                Err(e) => log::warn!("label source {:?} failed: {}", name, e),
            }
        }
        labels
    }

    /// Union of the enabled sources' watch paths.
    pub fn watch_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for (name, source) in &self.sources {
            if enabled(&self.enabled_features, name) {
                paths.extend(source.watch_paths());
            }
        }
        paths.sort();
        paths.dedup();
        paths
    }

    /// Registered source names, in discovery order.
    pub fn source_names(&self) -> Vec<&str> {
        self.sources.keys().map(String::as_str).collect()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn enabled(list: &[String], name: &str) -> bool {
    list.iter().any(|entry| entry == ALL_SOURCES || entry == name)
}
