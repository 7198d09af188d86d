// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! System source: hostname and OS release identity.

use super::{Source, SourceError};
use crate::snapshot::DomainFeatures;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const DEFAULT_OS_RELEASE: &str = "/etc/os-release";
const DEFAULT_HOSTNAME: &str = "/proc/sys/kernel/hostname";

/// Discovers `system.name` (hostname) and `system.osrelease`
/// (ID / VERSION_ID / ... from the os-release file).
pub struct SystemSource {
    os_release_path: PathBuf,
    hostname_path: PathBuf,
    last_labels: BTreeMap<String, String>,
}

impl SystemSource {
    /// Create a source reading the standard system paths.
    pub fn new() -> Self {
        Self {
            os_release_path: PathBuf::from(DEFAULT_OS_RELEASE),
            hostname_path: PathBuf::from(DEFAULT_HOSTNAME),
            last_labels: BTreeMap::new(),
        }
    }

    /// Override the os-release path.
    pub fn with_os_release(mut self, path: impl Into<PathBuf>) -> Self {
        self.os_release_path = path.into();
        self
    }

    /// Override the hostname path.
    pub fn with_hostname_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.hostname_path = path.into();
        self
    }
}

impl Default for SystemSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for SystemSource {
    fn name(&self) -> &str {
        "system"
    }

    fn discover(&mut self) -> Result<DomainFeatures, SourceError> {
        let mut features = DomainFeatures::new();
        self.last_labels.clear();

        if let Ok(hostname) = std::fs::read_to_string(&self.hostname_path) {
            let hostname = hostname.trim();
            if !hostname.is_empty() {
                features.add_attribute("name", "nodename", hostname);
            }
        }

        for (key, value) in read_os_release(&self.os_release_path)? {
            if key == "ID" || key == "VERSION_ID" {
                self.last_labels
                    .insert(format!("system-os_release.{}", key), value.clone());
            }
            features.add_attribute("osrelease", key, value);
        }

        Ok(features)
    }

    fn labels(&self) -> Result<BTreeMap<String, String>, SourceError> {
        Ok(self.last_labels.clone())
    }

    fn is_label_source(&self) -> bool {
        true
    }
}

fn read_os_release(path: &Path) -> Result<Vec<(String, String)>, SourceError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        // Missing os-release is not a failure; the domain is just thin.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SourceError::Io(e)),
    };

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            (key.trim().to_string(), value.to_string())
        })
        .collect())
}
