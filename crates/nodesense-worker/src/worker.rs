// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The per-node discovery loop.
//!
//! Each cycle runs the enabled feature sources, evaluates the
//! worker-local rules, and submits the result to the coordinator.
//! The loop then sleeps until the configured interval elapses, a
//! watched filesystem path changes, or shutdown is requested.
//!
//! A submission is skipped when the snapshot is canonically unchanged
//! and the cluster rule version has not moved; an unacknowledged
//! submission is retransmitted on the next cycle under its original
//! generation. Discovery failure never terminates the loop: it logs
//! and backs off exponentially (with jitter) up to a ceiling.

use crate::client::{ClientError, ClientEvent, CoordinatorClient};
use nodesense::config::{ConfigError, WorkerConfig};
use nodesense::labels::{self, Emission};
use nodesense::protocol::NodeFeatureUpdate;
use nodesense::rules::RuleSet;
use nodesense::snapshot::FeatureSnapshot;
use nodesense::source::SourceRegistry;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const MAX_BACKOFF: Duration = Duration::from_secs(60);
const ACK_WAIT: Duration = Duration::from_millis(500);

/// Worker error types.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Submission failure.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Snapshot serialization failure in one-shot mode.
    #[error("dump error: {0}")]
    Dump(String),
}

/// Events that wake the discovery loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A watched filesystem path changed.
    FsEvent,
    /// Shut the worker down.
    Shutdown,
}

/// Exponential backoff with jitter.
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a backoff starting at `base` and capped at `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Reset to the base delay.
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    /// Next delay: doubles up to the cap, with up to +25% jitter.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay.mul_f64(1.0 + fastrand::f64() * 0.25)
    }
}

/// The per-node worker.
pub struct Worker {
    node_name: String,
    sleep_interval: Duration,
    no_publish: bool,
    whitelist: Option<Regex>,
    registry: SourceRegistry,
    client: CoordinatorClient,
    local_rules: RuleSet,
    cluster_rules: RuleSet,
    generation: u64,
    pending: Option<NodeFeatureUpdate>,
    last_canonical: Option<Vec<u8>>,
    last_rules_version: u64,
    triggers: Receiver<Trigger>,
    stop: Arc<AtomicBool>,
}

impl Worker {
    /// Create a worker from validated configuration.
    pub fn new(
        node_name: String,
        config: &WorkerConfig,
        registry: SourceRegistry,
        client: CoordinatorClient,
        local_rules: RuleSet,
        triggers: Receiver<Trigger>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, WorkerError> {
        config.core.validate()?;
        Ok(Self {
            node_name,
            sleep_interval: config.core.sleep_interval()?,
            no_publish: config.core.no_publish,
            whitelist: config.core.label_white_list()?,
            registry,
            client,
            local_rules,
            cluster_rules: RuleSet::default(),
            generation: 0,
            pending: None,
            last_canonical: None,
            last_rules_version: 0,
            triggers,
            stop,
        })
    }

    /// Run the discovery loop until shutdown.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        tracing::info!(
            "worker for node {:?} started (interval {:?}, coordinator {})",
            self.node_name,
            self.sleep_interval,
            self.client.server_address()
        );

        let mut backoff = Backoff::new(Duration::from_secs(1), MAX_BACKOFF);
        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            let wait = match self.cycle() {
                Ok(()) => {
                    backoff.reset();
                    self.sleep_interval
                }
                Err(e) => {
                    let delay = backoff.next();
                    tracing::warn!("discovery cycle failed: {} (retrying in {:?})", e, delay);
                    delay
                }
            };
            if !self.wait_for_trigger(wait) {
                break;
            }
        }

        self.client.disconnect();
        tracing::info!("worker stopped");
        Ok(())
    }

    /// Filesystem paths the enabled event sources want watched.
    pub fn watch_paths(&self) -> Vec<PathBuf> {
        self.registry.watch_paths()
    }

    /// Run a single discovery pass and return the result as YAML.
    pub fn oneshot(&mut self) -> Result<String, WorkerError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Dump {
            node_name: String,
            snapshot: FeatureSnapshot,
            labels: BTreeMap<String, String>,
        }

        let (snapshot, errors) = self.registry.discover();
        for e in &errors {
            tracing::warn!("feature source error: {}", e);
        }
        let emission = self.local_emission(&snapshot);
        serde_yaml::to_string(&Dump {
            node_name: self.node_name.clone(),
            snapshot,
            labels: emission.labels,
        })
        .map_err(|e| WorkerError::Dump(e.to_string()))
    }

    fn cycle(&mut self) -> Result<(), WorkerError> {
        // Pick up acks and rule pushes from the previous cycle first.
        self.drain_events(Duration::ZERO);

        let (snapshot, errors) = self.registry.discover();
        for e in &errors {
            tracing::warn!("feature source error: {}", e);
        }

        let local_emission = self.local_emission(&snapshot);
        let canonical = snapshot.canonical_bytes();
        let unchanged = self.last_canonical.as_deref() == Some(canonical.as_slice())
            && self.last_rules_version == self.cluster_rules.version;

        if self.no_publish {
            tracing::info!(
                "no-publish: computed {} label(s) for node {:?}",
                local_emission.labels.len(),
                self.node_name
            );
            self.last_canonical = Some(canonical);
            self.last_rules_version = self.cluster_rules.version;
            return Ok(());
        }

        let update = if unchanged {
            match &self.pending {
                // Missing ack: retransmit under the original generation.
                Some(pending) => pending.clone(),
                None => {
                    tracing::debug!("snapshot unchanged, skipping submission");
                    return Ok(());
                }
            }
        } else {
            self.generation += 1;
            NodeFeatureUpdate {
                node_name: self.node_name.clone(),
                generation: self.generation,
                snapshot,
                local_emission,
            }
        };

        let generation = update.generation;
        self.client.submit(&update)?;
        self.pending = Some(update);
        self.last_canonical = Some(canonical);
        self.last_rules_version = self.cluster_rules.version;
        tracing::debug!("submitted generation {}", generation);

        self.drain_events(ACK_WAIT);
        Ok(())
    }

    /// Compute the worker-local emission: local rules, direct source
    /// labels, whitelist filtering. Variables never leave the node.
    fn local_emission(&self, snapshot: &FeatureSnapshot) -> Emission {
        let outcome = self.local_rules.evaluate(snapshot);
        let mut emission = outcome.advisory;
        emission.merge_from(&outcome.strict);

        for (key, value) in self.registry.labels() {
            let qualified = match labels::qualify_key(&key) {
                Ok(k) => k,
                Err(e) => {
                    tracing::warn!("dropping source label: {}", e);
                    continue;
                }
            };
            if let Err(e) = labels::validate_value(&qualified, &value) {
                tracing::warn!("dropping source label: {}", e);
                continue;
            }
            emission.labels.insert(qualified, value);
        }

        if let Some(whitelist) = &self.whitelist {
            let dropped = labels::filter_whitelist(&mut emission.labels, whitelist);
            if !dropped.is_empty() {
                tracing::debug!("label whitelist dropped {} label(s)", dropped.len());
            }
        }

        emission.vars.clear();
        emission
    }

    fn drain_events(&mut self, wait: Duration) {
        for event in self.client.poll_events(wait) {
            match event {
                ClientEvent::Acked { generation } => {
                    if self
                        .pending
                        .as_ref()
                        .map(|u| u.generation <= generation)
                        .unwrap_or(false)
                    {
                        self.pending = None;
                    }
                    tracing::debug!("generation {} acknowledged", generation);
                }
                ClientEvent::Rules(set) => self.install_rules(set),
                ClientEvent::ServerError { code, message } => {
                    tracing::warn!("coordinator error {}: {}", code, message);
                }
            }
        }
    }

    /// Install a pushed cluster rule set. The version participates in
    /// change detection so a rule change forces a resubmission even if
    /// the snapshot itself did not move.
    fn install_rules(&mut self, set: RuleSet) {
        let mut valid = Vec::with_capacity(set.rules.len());
        for mut rule in set.rules {
            match rule.validate() {
                Ok(()) => valid.push(rule),
                Err(e) => tracing::warn!("rejecting pushed rule {:?}: {}", rule.name, e),
            }
        }
        tracing::info!(
            "cluster rule set v{} installed ({} rule(s))",
            set.version,
            valid.len()
        );
        self.cluster_rules = RuleSet::new(set.version, valid);
    }

    /// Block until the next trigger or timeout. Returns false when the
    /// worker should shut down. Filesystem event bursts are coalesced.
    fn wait_for_trigger(&self, wait: Duration) -> bool {
        match self.triggers.recv_timeout(wait) {
            Ok(Trigger::Shutdown) => return false,
            Ok(Trigger::FsEvent) => {
                tracing::debug!("filesystem change, rediscovering");
                while let Ok(trigger) = self.triggers.try_recv() {
                    if trigger == Trigger::Shutdown {
                        return false;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return false,
        }
        !self.stop.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use nodesense::config::WorkerConfig;
    use std::sync::mpsc::channel;

    fn test_worker(no_publish: bool) -> (Worker, std::sync::mpsc::Sender<Trigger>, Arc<AtomicBool>) {
        let config = WorkerConfig::from_yaml(&format!(
            "core:\n  noPublish: {}\n  sleepInterval: 10ms\n  featureSources: [fake]\n",
            no_publish
        ))
        .unwrap();
        let mut registry = SourceRegistry::with_builtins();
        registry.set_enabled(
            &config.core.feature_sources,
            &["none".to_string()], // no direct labels in tests
        );
        let client = CoordinatorClient::new(ClientConfig {
            server_address: "127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let (tx, rx) = channel();
        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker::new(
            "test-node".to_string(),
            &config,
            registry,
            client,
            RuleSet::default(),
            rx,
            Arc::clone(&stop),
        )
        .unwrap();
        (worker, tx, stop)
    }

    #[test]
    fn test_no_publish_cycle_succeeds_without_server() {
        let (mut worker, _tx, _stop) = test_worker(true);
        worker.cycle().unwrap();
        assert!(worker.last_canonical.is_some());
        assert_eq!(worker.generation, 0);
    }

    #[test]
    fn test_change_detection_skips_unchanged_submission() {
        let (mut worker, _tx, _stop) = test_worker(false);

        // First cycle fails at submit (no server) but records nothing.
        assert!(worker.cycle().is_err());

        // Pretend the first submission happened and was acked.
        let (snapshot, _) = worker.registry.discover();
        worker.last_canonical = Some(snapshot.canonical_bytes());
        worker.pending = None;
        let generation = worker.generation;

        // Unchanged snapshot, no pending: nothing to send, no error.
        worker.cycle().unwrap();
        assert_eq!(worker.generation, generation);
    }

    #[test]
    fn test_missing_ack_forces_retransmission_attempt() {
        let (mut worker, _tx, _stop) = test_worker(false);
        let (snapshot, _) = worker.registry.discover();
        worker.last_canonical = Some(snapshot.canonical_bytes());
        worker.generation = 4;
        worker.pending = Some(NodeFeatureUpdate {
            node_name: "test-node".to_string(),
            generation: 4,
            snapshot,
            local_emission: Emission::new(),
        });

        // Unchanged but unacked: the cycle tries to resubmit (and the
        // submit error proves the attempt happened).
        assert!(worker.cycle().is_err());
        assert_eq!(worker.generation, 4);
    }

    #[test]
    fn test_rule_version_change_defeats_change_detection() {
        let (mut worker, _tx, _stop) = test_worker(false);
        let (snapshot, _) = worker.registry.discover();
        worker.last_canonical = Some(snapshot.canonical_bytes());
        worker.last_rules_version = 0;
        worker.install_rules(RuleSet::new(2, Vec::new()));

        // Rules moved: a fresh submission is attempted (and fails
        // because there is no server).
        assert!(worker.cycle().is_err());
        assert_eq!(worker.generation, 1);
    }

    #[test]
    fn test_shutdown_trigger_stops_run() {
        let (mut worker, tx, _stop) = test_worker(true);
        let handle = std::thread::spawn(move || worker.run());
        std::thread::sleep(Duration::from_millis(50));
        tx.send(Trigger::Shutdown).unwrap();
        let result = handle.join().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_stop_flag_stops_run() {
        let (mut worker, _tx, stop) = test_worker(true);
        let handle = std::thread::spawn(move || worker.run());
        std::thread::sleep(Duration::from_millis(50));
        stop.store(true, Ordering::Relaxed);
        // The loop notices the flag after the pending wait times out.
        let result = handle.join().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(4));
        let d1 = backoff.next();
        let d2 = backoff.next();
        let d3 = backoff.next();
        let d4 = backoff.next();

        assert!(d1 >= Duration::from_secs(1) && d1 < Duration::from_millis(1300));
        assert!(d2 >= Duration::from_secs(2) && d2 < Duration::from_millis(2600));
        assert!(d3 >= Duration::from_secs(4) && d3 < Duration::from_millis(5200));
        // Capped.
        assert!(d4 >= Duration::from_secs(4) && d4 < Duration::from_millis(5200));

        backoff.reset();
        assert!(backoff.next() < Duration::from_millis(1300));
    }

    #[test]
    fn test_install_rules_rejects_invalid() {
        let (mut worker, _tx, _stop) = test_worker(true);
        let doc = r#"
- name: "bad"
  matchFeatures:
    - feature: nodot
- name: "good"
  labels:
    x: "1"
"#;
        // Parse without validation to simulate a push of a bad rule.
        let rules: Vec<nodesense::rules::Rule> = serde_yaml::from_str(doc).unwrap();
        worker.install_rules(RuleSet::new(9, rules));
        assert_eq!(worker.cluster_rules.version, 9);
        assert_eq!(worker.cluster_rules.rules.len(), 1);
        assert_eq!(worker.cluster_rules.rules[0].name, "good");
    }
}
