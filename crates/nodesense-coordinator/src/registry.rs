// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-node snapshot cache.
//!
//! Holds the latest accepted submission per node. Submissions are
//! processed in arrival order per node; a stale generation (one the
//! cache has already surpassed) is dropped so an in-flight old
//! reconciliation can never win over a newer submission. Duplicate
//! generations are the at-least-once retransmissions of the wire
//! protocol and are acknowledged without effect.

use nodesense::labels::Emission;
use nodesense::protocol::NodeFeatureUpdate;
use nodesense::snapshot::FeatureSnapshot;
use std::collections::HashMap;
use std::time::Instant;

/// Cached state for one node.
#[derive(Debug, Clone)]
pub struct NodeState {
    /// Generation of the worker submission.
    pub generation: u64,

    /// The node's feature snapshot.
    pub snapshot: FeatureSnapshot,

    /// Worker-local emission submitted alongside the snapshot.
    pub local_emission: Emission,

    /// When this state was accepted.
    #[allow(dead_code)]
    pub received_at: Instant,
}

/// Outcome of offering a submission to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// New state accepted; reconciliation should run.
    Accepted,
    /// Same generation seen before (retransmission); ack only.
    Duplicate,
    /// Older than the cached generation; dropped.
    Stale,
}

/// The coordinator's snapshot cache.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, NodeState>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a worker submission.
    pub fn submit(&mut self, update: NodeFeatureUpdate) -> SubmitOutcome {
        match self.nodes.get(&update.node_name) {
            Some(state) if update.generation < state.generation => SubmitOutcome::Stale,
            Some(state) if update.generation == state.generation => SubmitOutcome::Duplicate,
            _ => {
                self.nodes.insert(
                    update.node_name,
                    NodeState {
                        generation: update.generation,
                        snapshot: update.snapshot,
                        local_emission: update.local_emission,
                        received_at: Instant::now(),
                    },
                );
                SubmitOutcome::Accepted
            }
        }
    }

    /// Cached state for a node.
    pub fn get(&self, node_name: &str) -> Option<&NodeState> {
        self.nodes.get(node_name)
    }

    /// Forget a node (it left the cluster).
    pub fn remove(&mut self, node_name: &str) -> Option<NodeState> {
        self.nodes.remove(node_name)
    }

    /// Names of all cached nodes.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Number of cached nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no node has submitted yet.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
