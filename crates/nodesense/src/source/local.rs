// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local source: operator-provided feature files.
//!
//! Reads every regular file in the feature-file directory. Each
//! non-empty, non-comment line is `name[=value]`: lines with a value
//! become attributes of the `local.labels` feature, bare lines become
//! elements of the `local.flags` feature. All lines are additionally
//! exposed as direct labels.
//!
//! The directory is watched, so dropping or editing a feature file
//! retriggers discovery without waiting for the sleep interval.

use super::{Source, SourceError};
use crate::snapshot::DomainFeatures;
use std::collections::BTreeMap;
use std::path::PathBuf;

const DEFAULT_FEATURE_DIR: &str = "/etc/nodesense/features.d";

/// Feature-file source.
pub struct LocalSource {
    dir: PathBuf,
    last_labels: BTreeMap<String, String>,
}

impl LocalSource {
    /// Create a source reading the default feature-file directory.
    pub fn new() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_FEATURE_DIR),
            last_labels: BTreeMap::new(),
        }
    }

    /// Override the feature-file directory.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }
}

impl Default for LocalSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for LocalSource {
    fn name(&self) -> &str {
        "local"
    }

    fn discover(&mut self) -> Result<DomainFeatures, SourceError> {
        let mut features = DomainFeatures::new();
        self.last_labels.clear();

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            // No feature directory means no local features.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(features),
            Err(e) => return Err(SourceError::Io(e)),
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        for path in paths {
            let content = std::fs::read_to_string(&path)?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match line.split_once('=') {
                    Some((key, value)) => {
                        let key = key.trim();
                        let value = value.trim();
                        features.add_attribute("labels", key, value);
                        self.last_labels.insert(key.to_string(), value.to_string());
                    }
                    None => {
                        features.add_flag("flags", line);
                        self.last_labels.insert(line.to_string(), "true".to_string());
                    }
                }
            }
        }
        Ok(features)
    }

    fn labels(&self) -> Result<BTreeMap<String, String>, SourceError> {
        Ok(self.last_labels.clone())
    }

    fn is_label_source(&self) -> bool {
        true
    }

    fn watch_paths(&self) -> Vec<PathBuf> {
        vec![self.dir.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_feature_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("10-storage"),
            "ssd\nnvme-count=2\n# ignored\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("20-net"), "sriov\n").unwrap();

        let mut source = LocalSource::new().with_dir(dir.path());
        let features = source.discover().unwrap();

        let flags = features.flags.get("flags").unwrap();
        assert!(flags.elements.contains("ssd"));
        assert!(flags.elements.contains("sriov"));

        let attrs = features.attributes.get("labels").unwrap();
        assert_eq!(
            attrs.elements.get("nvme-count").map(String::as_str),
            Some("2")
        );

        let labels = source.labels().unwrap();
        assert_eq!(labels.get("ssd").map(String::as_str), Some("true"));
        assert_eq!(labels.get("nvme-count").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_missing_dir_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = LocalSource::new().with_dir(dir.path().join("missing"));
        let features = source.discover().unwrap();
        assert!(features.is_empty());
    }

    #[test]
    fn test_watch_paths_name_the_feature_dir() {
        let source = LocalSource::new().with_dir("/tmp/features.d");
        assert_eq!(source.watch_paths(), vec![PathBuf::from("/tmp/features.d")]);
    }
}
