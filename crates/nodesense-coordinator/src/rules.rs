// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cluster rule document loading and hot reload.
//!
//! The operator's rule document is a YAML or JSON sequence of rule
//! records on local disk. The file's directory is watched; any change
//! reloads the document and hands the valid rules to the server,
//! which versions, pushes, and re-reconciles. Invalid rules are
//! dropped with a diagnostic; a document that fails to parse leaves
//! the previous rule set in place.

use crate::server::Server;
use nodesense::config::ConfigError;
use nodesense::rules::{parse_rule_document, Rule};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const RELOAD_DEBOUNCE: Duration = Duration::from_millis(200);

/// Load and validate a rule document from disk.
pub fn load_rules_file(path: &Path) -> Result<Vec<Rule>, ConfigError> {
    let doc = std::fs::read_to_string(path)?;
    let (rules, diagnostics) =
        parse_rule_document(&doc).map_err(|e| ConfigError::Parse(e.to_string()))?;
    for d in &diagnostics {
        tracing::warn!("rule document {:?}: {}", path, d);
    }
    tracing::info!(
        "loaded {} rule(s) from {:?} ({} rejected)",
        rules.len(),
        path,
        diagnostics.len()
    );
    Ok(rules)
}

/// Keeps the OS watcher for the rule document alive.
pub struct RuleWatcher {
    _watcher: RecommendedWatcher,
}

/// Watch a rule document and reload it into the server on change.
///
/// The parent directory is watched so editors that replace the file
/// (rename-over-write) are picked up too.
pub fn spawn_rule_watcher(
    path: PathBuf,
    server: Arc<Server>,
) -> Result<RuleWatcher, notify::Error> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    let _ = tx.send(());
                }
            }
            Err(e) => tracing::warn!("rule watch error: {}", e),
        },
        notify::Config::default(),
    )?;

    let watch_root = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    watcher.watch(&watch_root, RecursiveMode::NonRecursive)?;
    tracing::info!("watching rule document {:?}", path);

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            // Editors produce bursts; settle before reloading.
            tokio::time::sleep(RELOAD_DEBOUNCE).await;
            while rx.try_recv().is_ok() {}

            match load_rules_file(&path) {
                Ok(rules) => server.reload_rules(rules).await,
                Err(e) => {
                    tracing::warn!("rule reload failed, keeping previous set: {}", e);
                }
            }
        }
    });

    Ok(RuleWatcher { _watcher: watcher })
}
