// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Nodesense Coordinator
//!
//! Cluster-scoped reconciler for the nodesense feature discovery
//! system. Collects per-node feature snapshots from workers, evaluates
//! the cluster rule set, and keeps every node object's labels,
//! annotations, extended resources, and taints in sync with the
//! desired state. One replica holds the reconciliation lease at a
//! time; followers keep their caches warm for fast takeover. A
//! garbage collector removes per-node auxiliary objects whose node
//! has left the cluster.
//!
//! ## Modules Overview
//!
//! - [`server`] - worker-facing submission endpoint and rule push
//! - [`registry`] - per-node snapshot cache with generation ordering
//! - [`reconciler`] - rule evaluation, diffing, atomic node updates
//! - [`nodeapi`] - control-plane client (HTTP backend + in-memory fake)
//! - [`election`] - lease-based leader election
//! - [`gc`] - auxiliary-object garbage collection
//! - [`rules`] - rule document loading and hot reload
//! - [`config`] - coordinator configuration

/// Coordinator configuration document.
pub mod config;
/// Lease-based leader election.
pub mod election;
/// Garbage collection of per-node auxiliary objects.
pub mod gc;
/// Control-plane (node API) client abstraction and backends.
pub mod nodeapi;
/// Node reconciliation and the bounded reconcile pool.
pub mod reconciler;
/// Per-node snapshot cache.
pub mod registry;
/// Rule document loading and hot reload.
pub mod rules;
/// Worker-facing submission server.
pub mod server;

pub use config::CoordinatorConfig;
pub use election::{ElectionOutcome, LeaseElector};
pub use gc::GarbageCollector;
pub use nodeapi::{ApiError, FakeNodeApi, HttpNodeApi, Node, NodeApi, NodeEvent, NodePatch};
pub use reconciler::Reconciler;
pub use registry::{NodeRegistry, SubmitOutcome};
pub use server::Server;
