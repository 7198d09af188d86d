// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control-plane (node API) abstraction.
//!
//! The coordinator reads and writes node objects, deletes per-node
//! auxiliary objects, and uses the cluster's lease primitive for
//! leader election. All of that goes through the [`NodeApi`] trait so
//! the reconciler, elector, and garbage collector are testable against
//! the in-memory [`FakeNodeApi`] and deployable against the HTTP
//! backend.

mod http;
mod memory;

pub use http::HttpNodeApi;
pub use memory::FakeNodeApi;

use nodesense::labels::Taint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Node API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The named object does not exist.
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    /// Concurrent modification detected (stale resource version).
    #[error("conflict updating node {0:?}")]
    Conflict(String),

    /// The per-call deadline elapsed.
    #[error("node API request timed out")]
    Timeout,

    /// Transport-level failure.
    #[error("node API transport error: {0}")]
    Transport(String),

    /// Unexpected response.
    #[error("node API status {status}: {message}")]
    Status { status: u16, message: String },
}

impl ApiError {
    /// True for errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub(crate) fn not_found(kind: &str, name: &str) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

/// A node object as held by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub name: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Extended-resource capacities.
    #[serde(default)]
    pub capacity: BTreeMap<String, String>,

    #[serde(default)]
    pub taints: Vec<Taint>,

    /// Optimistic-concurrency token, bumped on every write.
    #[serde(default)]
    pub resource_version: u64,
}

/// An atomic node update: all owned artifacts change in one write, so
/// a crash can never separate the labels from their tracking
/// annotation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    /// Resource version this patch was computed against; a mismatch
    /// on the server yields [`ApiError::Conflict`].
    pub expect_version: u64,

    #[serde(default)]
    pub set_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub remove_labels: Vec<String>,

    #[serde(default)]
    pub set_annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub remove_annotations: Vec<String>,

    #[serde(default)]
    pub set_capacity: BTreeMap<String, String>,
    #[serde(default)]
    pub remove_capacity: Vec<String>,

    /// Taints to ensure present (replacing same key+effect entries).
    #[serde(default)]
    pub set_taints: Vec<Taint>,
    /// Taint keys to remove.
    #[serde(default)]
    pub remove_taints: Vec<String>,
}

impl NodePatch {
    /// True if applying the patch would change nothing.
    pub fn is_noop(&self) -> bool {
        self.set_labels.is_empty()
            && self.remove_labels.is_empty()
            && self.set_annotations.is_empty()
            && self.remove_annotations.is_empty()
            && self.set_capacity.is_empty()
            && self.remove_capacity.is_empty()
            && self.set_taints.is_empty()
            && self.remove_taints.is_empty()
    }

    /// Apply the patch to a node object (shared by the fake backend
    /// and by tests asserting patch semantics).
    pub fn apply_to(&self, node: &mut Node) {
        for (k, v) in &self.set_labels {
            node.labels.insert(k.clone(), v.clone());
        }
        for k in &self.remove_labels {
            node.labels.remove(k);
        }
        for (k, v) in &self.set_annotations {
            node.annotations.insert(k.clone(), v.clone());
        }
        for k in &self.remove_annotations {
            node.annotations.remove(k);
        }
        for (k, v) in &self.set_capacity {
            node.capacity.insert(k.clone(), v.clone());
        }
        for k in &self.remove_capacity {
            node.capacity.remove(k);
        }
        for key in &self.remove_taints {
            node.taints.retain(|t| &t.key != key);
        }
        for taint in &self.set_taints {
            node.taints
                .retain(|t| !(t.key == taint.key && t.effect == taint.effect));
            node.taints.push(taint.clone());
        }
        node.resource_version += 1;
    }
}

/// Node lifecycle events from the control-plane watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeEvent {
    /// A node joined the cluster.
    Added { name: String },
    /// A node was removed from the cluster.
    Deleted { name: String },
}

/// Control-plane client contract.
pub trait NodeApi: Send + Sync + 'static {
    /// List all node objects.
    fn list_nodes(&self) -> impl Future<Output = Result<Vec<Node>, ApiError>> + Send;

    /// Fetch one node object.
    fn get_node(&self, name: &str) -> impl Future<Output = Result<Node, ApiError>> + Send;

    /// Apply an atomic patch to a node object.
    fn patch_node(
        &self,
        name: &str,
        patch: &NodePatch,
    ) -> impl Future<Output = Result<Node, ApiError>> + Send;

    /// List names of per-node auxiliary objects of a kind.
    fn list_objects(&self, kind: &str) -> impl Future<Output = Result<Vec<String>, ApiError>> + Send;

    /// Delete one auxiliary object. `NotFound` is surfaced; callers
    /// treating deletion as idempotent map it to success.
    fn delete_object(
        &self,
        kind: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Try to acquire a lease. Returns whether `holder` now holds it.
    fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        duration: Duration,
    ) -> impl Future<Output = Result<bool, ApiError>> + Send;

    /// Renew a held lease. Returns false when the lease was lost.
    fn renew_lease(
        &self,
        name: &str,
        holder: &str,
        duration: Duration,
    ) -> impl Future<Output = Result<bool, ApiError>> + Send;

    /// Subscribe to node lifecycle events.
    fn watch_nodes(
        &self,
    ) -> impl Future<Output = Result<tokio::sync::mpsc::Receiver<NodeEvent>, ApiError>> + Send;
}
