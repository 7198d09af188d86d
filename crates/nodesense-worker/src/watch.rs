// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Filesystem watches that retrigger discovery.
//!
//! Uses native OS file watching (inotify on Linux, FSEvents on macOS)
//! on the paths declared by the enabled event sources; any create,
//! modify, or remove event forwards one trigger into the worker loop,
//! where bursts are coalesced.

use crate::worker::Trigger;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::mpsc::Sender;

/// Keeps the OS watcher alive for as long as the worker runs.
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
    watched: Vec<PathBuf>,
}

impl FsWatcher {
    /// Start watching `paths`, forwarding change events as triggers.
    ///
    /// Paths that do not exist yet are skipped with a log line; the
    /// worker still rediscovers them on the sleep interval.
    pub fn start(paths: &[PathBuf], triggers: Sender<Trigger>) -> Result<Self, notify::Error> {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        let _ = triggers.send(Trigger::FsEvent);
                    }
                }
                Err(e) => {
                    tracing::warn!("filesystem watch error: {}", e);
                }
            },
            notify::Config::default(),
        )?;

        let mut watched = Vec::new();
        for path in paths {
            if !path.exists() {
                tracing::debug!("watch path {:?} does not exist, skipping", path);
                continue;
            }
            match watcher.watch(path, RecursiveMode::Recursive) {
                Ok(()) => watched.push(path.clone()),
                Err(e) => tracing::warn!("failed to watch {:?}: {}", path, e),
            }
        }
        tracing::info!("watching {} filesystem path(s)", watched.len());

        Ok(Self {
            _watcher: watcher,
            watched,
        })
    }

    /// Paths successfully registered with the OS watcher.
    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }
}
