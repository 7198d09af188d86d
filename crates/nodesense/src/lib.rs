// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Nodesense - Cluster Node Feature Discovery
//!
//! Core library for the nodesense feature discovery and labeling system.
//! A per-node worker discovers hardware, kernel, and OS properties and
//! submits them as a typed feature snapshot to a cluster coordinator,
//! which evaluates declarative rules over the snapshots and publishes
//! the synthesized labels on the cluster's node objects.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Per-node worker                             |
//! |   Source registry -> FeatureSnapshot -> local rules -> submit      |
//! +--------------------------------------------------------------------+
//! |                    Worker <-> Coordinator wire                     |
//! |   Length-prefixed JSON: NodeFeatureUpdate / Ack / RuleSet          |
//! +--------------------------------------------------------------------+
//! |                          Coordinator                               |
//! |   Node registry -> rule engine -> reconciler -> node object        |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`FeatureSnapshot`] | Typed per-node feature container (flags, attributes, instances) |
//! | [`SourceRegistry`] | Name-keyed registry of feature providers |
//! | [`Rule`] | Declarative match + emission record |
//! | [`RuleSet`] | Ordered rule list evaluated with a shared variable context |
//! | [`Emission`] | Labels/annotations/resources/taints produced by matched rules |
//!
//! ## Modules Overview
//!
//! - [`snapshot`] - Feature snapshot model (start here)
//! - [`source`] - Feature source contracts, registry, and built-in sources
//! - [`rules`] - Match expressions, matcher terms, templates, rule evaluation
//! - [`labels`] - Label keys, emissions, tracking annotations
//! - [`protocol`] - Worker/coordinator wire protocol
//! - [`config`] - Worker configuration document

/// Worker configuration document (core section + per-source maps).
pub mod config;
/// Label keys, emission model, tracking annotations, whitelist filtering.
pub mod labels;
/// Worker <-> coordinator wire protocol (length-prefixed JSON).
pub mod protocol;
/// Rule engine: match expressions, feature matchers, templates.
pub mod rules;
/// Per-node feature snapshot model.
pub mod snapshot;
/// Feature source contracts, registry, and built-in sources.
pub mod source;

pub use config::{CoreConfig, WorkerConfig};
pub use labels::{Emission, Taint};
pub use rules::{MatchExpression, MatchOp, Rule, RuleSet};
pub use snapshot::{DomainFeatures, FeatureSnapshot, InstanceFeature};
pub use source::{Source, SourceRegistry};

/// Nodesense version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
