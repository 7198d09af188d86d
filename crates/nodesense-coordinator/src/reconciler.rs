// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node reconciliation: from cached snapshot to published node object.
//!
//! A reconcile pass is idempotent. It evaluates the cluster rule set
//! over the node's cached snapshot, merges the worker-local emission
//! (cluster rules win unless advisory), diffs against the live node
//! object, and applies one atomic patch carrying both the artifact
//! changes and the tracking annotations. Keys owned by nodesense that
//! are no longer emitted are removed; keys owned by other controllers
//! are never touched.
//!
//! Conflicts (stale resource version) are retried with fresh fetches
//! up to the configured budget; transient API failures are retried
//! with exponential backoff and jitter before bubbling.

use crate::nodeapi::{ApiError, Node, NodeApi, NodePatch};
use crate::registry::NodeRegistry;
use nodesense::labels::{
    self, format_owned_keys, parse_owned_keys, Emission, ANNOTATION_PREFIX,
    EXTENDED_RESOURCES_ANNOTATION, FEATURE_ANNOTATIONS_ANNOTATION, FEATURE_LABELS_ANNOTATION,
    FEATURE_LABEL_PREFIX, TAINTS_ANNOTATION,
};
use nodesense::rules::RuleSet;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};

const TRANSIENT_RETRIES: usize = 4;
const TRANSIENT_BASE_DELAY: Duration = Duration::from_millis(200);
const TRANSIENT_MAX_DELAY: Duration = Duration::from_secs(5);

/// The per-node reconciler.
pub struct Reconciler<N: NodeApi> {
    api: Arc<N>,
    registry: Arc<RwLock<NodeRegistry>>,
    rules: Arc<RwLock<RuleSet>>,
    conflict_retries: usize,
    node_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<N: NodeApi> Reconciler<N> {
    /// Create a reconciler.
    pub fn new(
        api: Arc<N>,
        registry: Arc<RwLock<NodeRegistry>>,
        rules: Arc<RwLock<RuleSet>>,
        conflict_retries: usize,
    ) -> Self {
        Self {
            api,
            registry,
            rules,
            conflict_retries,
            node_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile one node. Idempotent; a no-op when the desired state
    /// already matches the node object.
    pub async fn reconcile(&self, node_name: &str) -> Result<(), ApiError> {
        let lock = self.node_lock(node_name).await;
        let _guard = lock.lock().await;

        let (snapshot, local_emission) = {
            let registry = self.registry.read().await;
            match registry.get(node_name) {
                Some(state) => (state.snapshot.clone(), state.local_emission.clone()),
                None => {
                    tracing::debug!("no cached snapshot for {:?}, nothing to do", node_name);
                    return Ok(());
                }
            }
        };

        let desired = {
            let rules = self.rules.read().await;
            let outcome = rules.evaluate(&snapshot);
            labels::merge_with_precedence(&outcome.advisory, &local_emission, &outcome.strict)
        };

        for attempt in 0..=self.conflict_retries {
            let node = match self
                .with_transient_retries(|| self.api.get_node(node_name))
                .await
            {
                Ok(node) => node,
                Err(ApiError::NotFound { .. }) => {
                    tracing::debug!("node object {:?} does not exist yet", node_name);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let patch = build_patch(&node, &desired);
            if patch.is_noop() {
                tracing::debug!("node {:?} already up to date", node_name);
                return Ok(());
            }

            match self
                .with_transient_retries(|| self.api.patch_node(node_name, &patch))
                .await
            {
                Ok(_) => {
                    tracing::info!(
                        "updated node {:?}: {} label(s), {} annotation(s)",
                        node_name,
                        desired.labels.len(),
                        desired.annotations.len()
                    );
                    return Ok(());
                }
                Err(ApiError::Conflict(_)) if attempt < self.conflict_retries => {
                    tracing::debug!(
                        "conflict updating {:?} (attempt {}), refetching",
                        node_name,
                        attempt + 1
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(ApiError::Conflict(node_name.to_string()))
    }

    async fn with_transient_retries<T, F, Fut>(&self, mut call: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut delay = TRANSIENT_BASE_DELAY;
        let mut attempts = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempts < TRANSIENT_RETRIES => {
                    attempts += 1;
                    let jittered = delay.mul_f64(1.0 + fastrand::f64() * 0.25);
                    tracing::debug!("transient node API error: {} (retry in {:?})", e, jittered);
                    tokio::time::sleep(jittered).await;
                    delay = (delay * 2).min(TRANSIENT_MAX_DELAY);
                }
                other => return other,
            }
        }
    }

    async fn node_lock(&self, node_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.node_locks.lock().await;
        Arc::clone(
            locks
                .entry(node_name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Compute the atomic patch turning `node` into the desired published
/// state, including tracking-annotation maintenance.
pub fn build_patch(node: &Node, desired: &Emission) -> NodePatch {
    let mut patch = NodePatch {
        expect_version: node.resource_version,
        ..Default::default()
    };

    // Labels.
    let owned_labels = owned_keys(
        node,
        FEATURE_LABELS_ANNOTATION,
        node.labels.keys().filter(|k| k.starts_with(FEATURE_LABEL_PREFIX)),
    );
    for (key, value) in &desired.labels {
        if node.labels.get(key) != Some(value) {
            patch.set_labels.insert(key.clone(), value.clone());
        }
    }
    for key in &owned_labels {
        if !desired.labels.contains_key(key) && node.labels.contains_key(key) {
            patch.remove_labels.push(key.clone());
        }
    }

    // Emitted annotations (the tracking annotations themselves are
    // managed below, never through this path).
    let owned_annotations = owned_keys(
        node,
        FEATURE_ANNOTATIONS_ANNOTATION,
        node.annotations
            .keys()
            .filter(|k| k.starts_with(ANNOTATION_PREFIX) && !labels::is_tracking_annotation(k)),
    );
    for (key, value) in &desired.annotations {
        if node.annotations.get(key) != Some(value) {
            patch.set_annotations.insert(key.clone(), value.clone());
        }
    }
    for key in &owned_annotations {
        if !desired.annotations.contains_key(key) && node.annotations.contains_key(key) {
            patch.remove_annotations.push(key.clone());
        }
    }

    // Extended resources.
    let owned_capacity = owned_keys(
        node,
        EXTENDED_RESOURCES_ANNOTATION,
        node.capacity.keys().filter(|k| k.starts_with(FEATURE_LABEL_PREFIX)),
    );
    for (key, value) in &desired.extended_resources {
        if node.capacity.get(key) != Some(value) {
            patch.set_capacity.insert(key.clone(), value.clone());
        }
    }
    for key in &owned_capacity {
        if !desired.extended_resources.contains_key(key) && node.capacity.contains_key(key) {
            patch.remove_capacity.push(key.clone());
        }
    }

    // Taints. Ownership comes from the tracking annotation only.
    let owned_taints: BTreeSet<String> = node
        .annotations
        .get(TAINTS_ANNOTATION)
        .map(|v| parse_owned_keys(v))
        .unwrap_or_default();
    let desired_taint_keys: BTreeSet<&String> = desired.taints.iter().map(|t| &t.key).collect();
    for taint in &desired.taints {
        if !node.taints.contains(taint) {
            patch.set_taints.push(taint.clone());
        }
    }
    for key in &owned_taints {
        if !desired_taint_keys.contains(key) && node.taints.iter().any(|t| &t.key == key) {
            patch.remove_taints.push(key.clone());
        }
    }

    // Tracking annotations travel in the same patch as the artifacts
    // they describe.
    track(&mut patch, node, FEATURE_LABELS_ANNOTATION, desired.labels.keys());
    track(
        &mut patch,
        node,
        FEATURE_ANNOTATIONS_ANNOTATION,
        desired.annotations.keys(),
    );
    track(
        &mut patch,
        node,
        EXTENDED_RESOURCES_ANNOTATION,
        desired.extended_resources.keys(),
    );
    let taint_keys: Vec<String> = desired.taints.iter().map(|t| t.key.clone()).collect();
    track(&mut patch, node, TAINTS_ANNOTATION, taint_keys.iter());

    patch
}

fn owned_keys<'a, I: Iterator<Item = &'a String>>(
    node: &Node,
    tracking_annotation: &str,
    prefixed: I,
) -> BTreeSet<String> {
    let mut owned: BTreeSet<String> = node
        .annotations
        .get(tracking_annotation)
        .map(|v| parse_owned_keys(v))
        .unwrap_or_default();
    owned.extend(prefixed.cloned());
    owned
}

fn track<'a, I: Iterator<Item = &'a String>>(
    patch: &mut NodePatch,
    node: &Node,
    annotation: &str,
    keys: I,
) {
    let value = format_owned_keys(keys);
    if value.is_empty() {
        if node.annotations.contains_key(annotation) {
            patch.remove_annotations.push(annotation.to_string());
        }
    } else if node.annotations.get(annotation) != Some(&value) {
        patch.set_annotations.insert(annotation.to_string(), value);
    }
}

/// Spawn the bounded reconciliation pool. Workers pull node names off
/// the shared queue; requests arriving while not leader are dropped
/// (the cache stays warm and a fresh leader re-enqueues everything).
pub fn spawn_pool<N: NodeApi>(
    reconciler: Arc<Reconciler<N>>,
    workers: usize,
    queue: mpsc::Receiver<String>,
    is_leader: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let queue = Arc::new(Mutex::new(queue));
    (0..workers)
        .map(|_| {
            let reconciler = Arc::clone(&reconciler);
            let queue = Arc::clone(&queue);
            let is_leader = Arc::clone(&is_leader);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                loop {
                    let node = {
                        let mut queue = queue.lock().await;
                        tokio::select! {
                            node = queue.recv() => node,
                            _ = shutdown.notified() => return,
                        }
                    };
                    let Some(node) = node else { return };
                    if !is_leader.load(Ordering::Relaxed) {
                        continue;
                    }
                    if let Err(e) = reconciler.reconcile(&node).await {
                        tracing::warn!("reconciliation of {:?} failed: {}", node, e);
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodeapi::FakeNodeApi;
    use nodesense::labels::Taint;
    use nodesense::protocol::NodeFeatureUpdate;
    use nodesense::rules::parse_rule_document;
    use nodesense::snapshot::{DomainFeatures, FeatureSnapshot};

    fn desired_with_labels(pairs: &[(&str, &str)]) -> Emission {
        let mut e = Emission::new();
        for (k, v) in pairs {
            e.labels.insert(k.to_string(), v.to_string());
        }
        e
    }

    #[test]
    fn test_build_patch_sets_labels_and_tracking() {
        let node = Node {
            name: "n1".to_string(),
            ..Default::default()
        };
        let desired = desired_with_labels(&[("feature.x/avx2", "true")]);

        let patch = build_patch(&node, &desired);
        assert_eq!(
            patch.set_labels.get("feature.x/avx2").map(String::as_str),
            Some("true")
        );
        assert_eq!(
            patch
                .set_annotations
                .get(FEATURE_LABELS_ANNOTATION)
                .map(String::as_str),
            Some("feature.x/avx2")
        );
    }

    #[test]
    fn test_build_patch_removes_stale_owned_keys_only() {
        let mut node = Node {
            name: "n1".to_string(),
            ..Default::default()
        };
        node.labels
            .insert("feature.x/old".to_string(), "true".to_string());
        node.labels
            .insert("other-controller/keep".to_string(), "true".to_string());
        node.annotations.insert(
            FEATURE_LABELS_ANNOTATION.to_string(),
            "feature.x/old".to_string(),
        );

        let patch = build_patch(&node, &Emission::new());
        assert_eq!(patch.remove_labels, vec!["feature.x/old".to_string()]);
        assert_eq!(
            patch.remove_annotations,
            vec![FEATURE_LABELS_ANNOTATION.to_string()]
        );
    }

    #[test]
    fn test_build_patch_removes_prefixed_strays_without_tracking() {
        // A label under our prefix but missing from the tracking
        // annotation is still ours to clean up.
        let mut node = Node {
            name: "n1".to_string(),
            ..Default::default()
        };
        node.labels.insert(
            format!("{}stray", FEATURE_LABEL_PREFIX),
            "true".to_string(),
        );

        let patch = build_patch(&node, &Emission::new());
        assert_eq!(
            patch.remove_labels,
            vec![format!("{}stray", FEATURE_LABEL_PREFIX)]
        );
    }

    #[test]
    fn test_build_patch_is_noop_when_converged() {
        let mut node = Node {
            name: "n1".to_string(),
            ..Default::default()
        };
        let desired = desired_with_labels(&[("feature.x/avx2", "true")]);

        let patch = build_patch(&node, &desired);
        patch.apply_to(&mut node);

        let second = build_patch(&node, &desired);
        assert!(second.is_noop(), "expected noop, got {:?}", second);
    }

    #[test]
    fn test_build_patch_taints() {
        let mut node = Node {
            name: "n1".to_string(),
            ..Default::default()
        };
        node.taints.push(Taint {
            key: "stale/taint".to_string(),
            value: None,
            effect: "NoSchedule".to_string(),
        });
        node.annotations
            .insert(TAINTS_ANNOTATION.to_string(), "stale/taint".to_string());

        let mut desired = Emission::new();
        desired.taints.push(Taint {
            key: "gpu.x/dedicated".to_string(),
            value: Some("true".to_string()),
            effect: "NoSchedule".to_string(),
        });

        let patch = build_patch(&node, &desired);
        assert_eq!(patch.remove_taints, vec!["stale/taint".to_string()]);
        assert_eq!(patch.set_taints.len(), 1);
        assert_eq!(
            patch
                .set_annotations
                .get(TAINTS_ANNOTATION)
                .map(String::as_str),
            Some("gpu.x/dedicated")
        );
    }

    fn rule_set(doc: &str) -> RuleSet {
        let (rules, diags) = parse_rule_document(doc).unwrap();
        assert!(diags.is_empty(), "{:?}", diags);
        RuleSet::new(1, rules)
    }

    async fn reconciler_fixture(
        doc: &str,
    ) -> (Arc<Reconciler<FakeNodeApi>>, FakeNodeApi, Arc<RwLock<NodeRegistry>>) {
        let api = FakeNodeApi::new();
        let registry = Arc::new(RwLock::new(NodeRegistry::new()));
        let rules = Arc::new(RwLock::new(rule_set(doc)));
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(api.clone()),
            Arc::clone(&registry),
            rules,
            3,
        ));
        (reconciler, api, registry)
    }

    fn avx2_snapshot() -> FeatureSnapshot {
        let mut snap = FeatureSnapshot::new();
        let mut cpu = DomainFeatures::new();
        cpu.add_flag("flags", "sse4");
        cpu.add_flag("flags", "avx2");
        snap.insert_domain("cpu", cpu);
        snap
    }

    #[tokio::test]
    async fn test_reconcile_without_cached_snapshot_is_noop() {
        let (reconciler, api, _registry) = reconciler_fixture("[]").await;
        api.put_node(Node {
            name: "n1".to_string(),
            ..Default::default()
        });
        reconciler.reconcile("n1").await.unwrap();
        assert_eq!(api.patch_count(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_applies_rule_emission() {
        let doc = r#"
- name: "avx2"
  labels:
    feature.x/avx2: "true"
  matchFeatures:
    - feature: cpu.flags
      matchExpressions:
        avx2: { op: Exists }
"#;
        let (reconciler, api, registry) = reconciler_fixture(doc).await;
        api.put_node(Node {
            name: "n1".to_string(),
            ..Default::default()
        });
        registry.write().await.submit(NodeFeatureUpdate {
            node_name: "n1".to_string(),
            generation: 1,
            snapshot: avx2_snapshot(),
            local_emission: Emission::new(),
        });

        reconciler.reconcile("n1").await.unwrap();

        let node = api.node("n1").unwrap();
        assert_eq!(
            node.labels.get("feature.x/avx2").map(String::as_str),
            Some("true")
        );
        assert_eq!(
            node.annotations
                .get(FEATURE_LABELS_ANNOTATION)
                .map(String::as_str),
            Some("feature.x/avx2")
        );
    }

    #[tokio::test]
    async fn test_reconcile_twice_is_idempotent() {
        let doc = r#"
- name: "avx2"
  labels:
    feature.x/avx2: "true"
"#;
        let (reconciler, api, registry) = reconciler_fixture(doc).await;
        api.put_node(Node {
            name: "n1".to_string(),
            ..Default::default()
        });
        registry.write().await.submit(NodeFeatureUpdate {
            node_name: "n1".to_string(),
            generation: 1,
            snapshot: avx2_snapshot(),
            local_emission: Emission::new(),
        });

        reconciler.reconcile("n1").await.unwrap();
        let after_first = api.patch_count();
        reconciler.reconcile("n1").await.unwrap();
        assert_eq!(api.patch_count(), after_first);
    }

    #[tokio::test]
    async fn test_cluster_rules_override_local_unless_advisory() {
        let doc = r#"
- name: "strict"
  labels:
    tier: "cluster"
- name: "hint"
  advisory: true
  labels:
    zone: "cluster-hint"
"#;
        let (reconciler, api, registry) = reconciler_fixture(doc).await;
        api.put_node(Node {
            name: "n1".to_string(),
            ..Default::default()
        });

        let mut local = Emission::new();
        local
            .labels
            .insert("feature.nodesense.io/tier".to_string(), "local".to_string());
        local
            .labels
            .insert("feature.nodesense.io/zone".to_string(), "local".to_string());
        registry.write().await.submit(NodeFeatureUpdate {
            node_name: "n1".to_string(),
            generation: 1,
            snapshot: avx2_snapshot(),
            local_emission: local,
        });

        reconciler.reconcile("n1").await.unwrap();
        let node = api.node("n1").unwrap();
        assert_eq!(
            node.labels
                .get("feature.nodesense.io/tier")
                .map(String::as_str),
            Some("cluster")
        );
        assert_eq!(
            node.labels
                .get("feature.nodesense.io/zone")
                .map(String::as_str),
            Some("local")
        );
    }

    #[tokio::test]
    async fn test_missing_node_object_is_not_an_error() {
        let doc = r#"
- name: "always"
  labels:
    x: "1"
"#;
        let (reconciler, _api, registry) = reconciler_fixture(doc).await;
        registry.write().await.submit(NodeFeatureUpdate {
            node_name: "ghost".to_string(),
            generation: 1,
            snapshot: FeatureSnapshot::new(),
            local_emission: Emission::new(),
        });
        reconciler.reconcile("ghost").await.unwrap();
    }
}
