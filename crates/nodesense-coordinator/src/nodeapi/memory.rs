// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory node API backend.
//!
//! Backs the coordinator's scenario tests and local development runs.
//! Behaves like the real control plane: optimistic concurrency on
//! node writes, idempotent deletes, lease expiry, and node lifecycle
//! events fanned out to watchers.

use super::{ApiError, Node, NodeApi, NodeEvent, NodePatch};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    objects: BTreeMap<String, BTreeSet<String>>,
    leases: HashMap<String, LeaseState>,
    watchers: Vec<mpsc::Sender<NodeEvent>>,
    patch_count: u64,
}

struct LeaseState {
    holder: String,
    expires_at: Instant,
}

/// In-memory [`NodeApi`] implementation.
#[derive(Clone, Default)]
pub struct FakeNodeApi {
    state: Arc<Mutex<State>>,
}

impl FakeNodeApi {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add (or replace) a node object and notify watchers.
    pub fn put_node(&self, node: Node) {
        let name = node.name.clone();
        let mut state = self.lock();
        let added = state.nodes.insert(name.clone(), node).is_none();
        if added {
            notify(&mut state, NodeEvent::Added { name });
        }
    }

    /// Remove a node object and notify watchers.
    pub fn remove_node(&self, name: &str) {
        let mut state = self.lock();
        if state.nodes.remove(name).is_some() {
            notify(
                &mut state,
                NodeEvent::Deleted {
                    name: name.to_string(),
                },
            );
        }
    }

    /// Create an auxiliary object.
    pub fn put_object(&self, kind: &str, name: &str) {
        self.lock()
            .objects
            .entry(kind.to_string())
            .or_default()
            .insert(name.to_string());
    }

    /// Check whether an auxiliary object exists.
    pub fn has_object(&self, kind: &str, name: &str) -> bool {
        self.lock()
            .objects
            .get(kind)
            .map(|set| set.contains(name))
            .unwrap_or(false)
    }

    /// Snapshot a node object for assertions.
    pub fn node(&self, name: &str) -> Option<Node> {
        self.lock().nodes.get(name).cloned()
    }

    /// Number of successful node patches applied.
    pub fn patch_count(&self) -> u64 {
        self.lock().patch_count
    }

    /// Force-expire a lease (test hook for takeover scenarios).
    pub fn expire_lease(&self, name: &str) {
        if let Some(lease) = self.lock().leases.get_mut(name) {
            lease.expires_at = Instant::now() - Duration::from_secs(1);
        }
    }
}

fn notify(state: &mut State, event: NodeEvent) {
    state
        .watchers
        .retain(|watcher| watcher.try_send(event.clone()).is_ok());
}

impl NodeApi for FakeNodeApi {
    async fn list_nodes(&self) -> Result<Vec<Node>, ApiError> {
        Ok(self.lock().nodes.values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> Result<Node, ApiError> {
        self.lock()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::not_found("node", name))
    }

    async fn patch_node(&self, name: &str, patch: &NodePatch) -> Result<Node, ApiError> {
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| ApiError::not_found("node", name))?;
        if node.resource_version != patch.expect_version {
            return Err(ApiError::Conflict(name.to_string()));
        }
        patch.apply_to(node);
        let node = node.clone();
        state.patch_count += 1;
        Ok(node)
    }

    async fn list_objects(&self, kind: &str) -> Result<Vec<String>, ApiError> {
        Ok(self
            .lock()
            .objects
            .get(kind)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_object(&self, kind: &str, name: &str) -> Result<(), ApiError> {
        let mut state = self.lock();
        let removed = state
            .objects
            .get_mut(kind)
            .map(|set| set.remove(name))
            .unwrap_or(false);
        if removed {
            Ok(())
        } else {
            Err(ApiError::not_found(kind, name))
        }
    }

    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<bool, ApiError> {
        let mut state = self.lock();
        let now = Instant::now();
        match state.leases.get_mut(name) {
            Some(lease) if lease.holder != holder && lease.expires_at > now => Ok(false),
            Some(lease) => {
                lease.holder = holder.to_string();
                lease.expires_at = now + duration;
                Ok(true)
            }
            None => {
                state.leases.insert(
                    name.to_string(),
                    LeaseState {
                        holder: holder.to_string(),
                        expires_at: now + duration,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn renew_lease(
        &self,
        name: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<bool, ApiError> {
        let mut state = self.lock();
        let now = Instant::now();
        match state.leases.get_mut(name) {
            Some(lease) if lease.holder == holder && lease.expires_at > now => {
                lease.expires_at = now + duration;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn watch_nodes(&self) -> Result<mpsc::Receiver<NodeEvent>, ApiError> {
        let (tx, rx) = mpsc::channel(64);
        self.lock().watchers.push(tx);
        Ok(rx)
    }
}
