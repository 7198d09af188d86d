// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Garbage collection of per-node auxiliary objects.
//!
//! Auxiliary objects (topology objects, custom per-node resources)
//! are named after their node and must not outlive it. Node-deletion
//! events trigger immediate cleanup; a periodic sweep catches missed
//! events and handles startup. Deletion is idempotent: NotFound is
//! success.

use crate::nodeapi::{ApiError, NodeApi, NodeEvent};
use crate::registry::NodeRegistry;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};

/// The auxiliary-object garbage collector.
pub struct GarbageCollector<N: NodeApi> {
    api: Arc<N>,
    registry: Arc<RwLock<NodeRegistry>>,
    kinds: Vec<String>,
    interval: Duration,
}

impl<N: NodeApi> GarbageCollector<N> {
    /// Create a collector for the given object kinds.
    pub fn new(
        api: Arc<N>,
        registry: Arc<RwLock<NodeRegistry>>,
        kinds: Vec<String>,
        interval: Duration,
    ) -> Self {
        Self {
            api,
            registry,
            kinds,
            interval,
        }
    }

    /// Run until shutdown: subscribe to node events and sweep
    /// periodically. An initial sweep runs at startup.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        let mut events = match self.api.watch_nodes().await {
            Ok(rx) => Some(rx),
            Err(e) => {
                tracing::warn!("node watch unavailable, relying on sweeps: {}", e);
                None
            }
        };

        self.sweep().await;

        loop {
            match events.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.interval) => self.sweep().await,
                        event = rx.recv() => match event {
                            Some(NodeEvent::Deleted { name }) => self.on_node_deleted(&name).await,
                            Some(NodeEvent::Added { .. }) => {}
                            None => {
                                tracing::warn!("node watch closed, relying on sweeps");
                                events = None;
                            }
                        },
                        _ = shutdown.notified() => break,
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.interval) => self.sweep().await,
                        _ = shutdown.notified() => break,
                    }
                }
            }
        }
        tracing::debug!("garbage collector stopped");
    }

    /// Immediate cleanup after a node deletion. Also drops the node's
    /// cached snapshot so a later leader does not resurrect it.
    pub async fn on_node_deleted(&self, name: &str) {
        tracing::info!("node {:?} deleted, removing auxiliary objects", name);
        self.registry.write().await.remove(name);
        for kind in &self.kinds {
            self.delete(kind, name).await;
        }
    }

    /// Full reconciliation pass: delete every auxiliary object whose
    /// name is not a live node.
    pub async fn sweep(&self) {
        let live: HashSet<String> = match self.api.list_nodes().await {
            Ok(nodes) => nodes.into_iter().map(|n| n.name).collect(),
            Err(e) => {
                tracing::warn!("gc sweep skipped, cannot list nodes: {}", e);
                return;
            }
        };

        for kind in &self.kinds {
            let objects = match self.api.list_objects(kind).await {
                Ok(objects) => objects,
                Err(e) => {
                    tracing::warn!("gc sweep cannot list {:?} objects: {}", kind, e);
                    continue;
                }
            };
            for name in objects {
                if !live.contains(&name) {
                    tracing::info!("gc: {} {:?} has no live node", kind, name);
                    self.delete(kind, &name).await;
                }
            }
        }
    }

    async fn delete(&self, kind: &str, name: &str) {
        match self.api.delete_object(kind, name).await {
            Ok(()) | Err(ApiError::NotFound { .. }) => {}
            Err(e) => tracing::warn!("failed to delete {} {:?}: {}", kind, name, e),
        }
    }
}
