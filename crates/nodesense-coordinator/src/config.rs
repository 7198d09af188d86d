// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Coordinator configuration.

use nodesense::config::{parse_duration, ConfigError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Coordinator configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinatorConfig {
    /// Address to bind the worker-facing listener to.
    pub bind_address: String,

    /// TCP port for worker submissions.
    pub port: u16,

    /// Control-plane (node API) endpoint.
    pub api_endpoint: String,

    /// Per-call deadline for node API requests.
    pub api_timeout: String,

    /// Leader-election lease name.
    pub lease_name: String,

    /// Lease duration; a holder that fails to renew for this long
    /// loses leadership.
    pub lease_duration: String,

    /// Interval between lease renewals.
    pub renew_interval: String,

    /// Retry budget for node-update conflicts.
    pub conflict_retries: usize,

    /// Number of reconciliation workers (0 = number of CPUs).
    pub reconcile_workers: usize,

    /// Cluster-scoped rule document (watched for changes).
    pub rules_path: Option<PathBuf>,

    /// Garbage-collection sweep interval.
    pub gc_interval: String,

    /// Auxiliary per-node object kinds subject to garbage collection.
    pub gc_kinds: Vec<String>,

    /// Maximum wire message size accepted from workers.
    pub max_message_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8123,
            api_endpoint: "http://127.0.0.1:8080".to_string(),
            api_timeout: "30s".to_string(),
            lease_name: "nodesense-coordinator".to_string(),
            lease_duration: "15s".to_string(),
            renew_interval: "5s".to_string(),
            conflict_retries: 3,
            reconcile_workers: 0,
            rules_path: None,
            gc_interval: "5m".to_string(),
            gc_kinds: vec!["topology".to_string()],
            max_message_size: nodesense::protocol::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl CoordinatorConfig {
    /// Load and validate a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all recognized fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port cannot be 0".to_string()));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "maxMessageSize cannot be 0".to_string(),
            ));
        }
        let lease = self.lease_duration()?;
        let renew = self.renew_interval()?;
        if renew >= lease {
            return Err(ConfigError::Invalid(
                "renewInterval must be shorter than leaseDuration".to_string(),
            ));
        }
        self.api_timeout()?;
        self.gc_interval()?;
        Ok(())
    }

    /// Parsed node API deadline.
    pub fn api_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.api_timeout)
    }

    /// Parsed lease duration.
    pub fn lease_duration(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.lease_duration)
    }

    /// Parsed renew interval.
    pub fn renew_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.renew_interval)
    }

    /// Parsed GC sweep interval.
    pub fn gc_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.gc_interval)
    }

    /// Effective reconciliation pool size.
    pub fn effective_workers(&self) -> usize {
        if self.reconcile_workers > 0 {
            self.reconcile_workers
        } else {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(4)
        }
    }
}
