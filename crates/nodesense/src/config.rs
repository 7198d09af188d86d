// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker configuration document.
//!
//! A YAML file with a `core:` section recognized here and per-source
//! `sources:` sections that are opaque to the core; each provider
//! declares its own schema and is handed its section at startup.
//!
//! ```yaml
//! core:
//!   sleepInterval: 60s
//!   labelWhiteList: "^cpu-"
//!   featureSources: [all]
//!   labelSources: [all]
//! sources:
//!   fake:
//!     flags: [flag_1]
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config document could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// A recognized field holds an invalid value.
    #[error("invalid value: {0}")]
    Invalid(String),
}

/// The `core:` section of the worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    /// Compute and log labels but do not submit to the coordinator.
    pub no_publish: bool,

    /// Discovery interval, e.g. "60s", "5m", "1m30s".
    pub sleep_interval: String,

    /// Regex a label name (without prefix) must match to be published.
    pub label_white_list: Option<String>,

    /// Sources contributing features ("all" or explicit names).
    pub feature_sources: Vec<String>,

    /// Sources contributing direct labels ("all" or explicit names).
    pub label_sources: Vec<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            no_publish: false,
            sleep_interval: "60s".to_string(),
            label_white_list: None,
            feature_sources: vec!["all".to_string()],
            label_sources: vec!["all".to_string()],
        }
    }
}

impl CoreConfig {
    /// Parsed discovery interval.
    pub fn sleep_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.sleep_interval)
    }

    /// Compiled whitelist regex, if configured.
    pub fn label_white_list(&self) -> Result<Option<Regex>, ConfigError> {
        self.label_white_list
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern)
                    .map_err(|e| ConfigError::Invalid(format!("labelWhiteList: {}", e)))
            })
            .transpose()
    }

    /// Validate all recognized fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.sleep_interval()?;
        if interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sleepInterval cannot be zero".to_string(),
            ));
        }
        self.label_white_list()?;
        if self.feature_sources.is_empty() {
            return Err(ConfigError::Invalid(
                "featureSources cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// The complete worker configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Core settings.
    #[serde(default)]
    pub core: CoreConfig,

    /// Per-source sections, opaque to the core.
    #[serde(default)]
    pub sources: BTreeMap<String, serde_yaml::Value>,
}

impl WorkerConfig {
    /// Load and validate a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a configuration document.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.core.validate()?;
        Ok(config)
    }
}

/// Parse a duration string: one or more `<number><unit>` segments with
/// units `ms`, `s`, `m`, `h`; a bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ConfigError::Invalid("empty duration".to_string()));
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        let secs: u64 = s
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad duration {:?}", s)))?;
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| ConfigError::Invalid(format!("bad duration {:?}", s)))?;
        if digits_end == 0 {
            return Err(ConfigError::Invalid(format!("bad duration {:?}", s)));
        }
        let number: u64 = rest[..digits_end]
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad duration {:?}", s)))?;
        rest = &rest[digits_end..];

        let (unit, remainder) = if let Some(r) = rest.strip_prefix("ms") {
            ("ms", r)
        } else if let Some(r) = rest.strip_prefix('s') {
            ("s", r)
        } else if let Some(r) = rest.strip_prefix('m') {
            ("m", r)
        } else if let Some(r) = rest.strip_prefix('h') {
            ("h", r)
        } else {
            return Err(ConfigError::Invalid(format!("bad duration unit in {:?}", s)));
        };
        rest = remainder;

        total += match unit {
            "ms" => Duration::from_millis(number),
            "s" => Duration::from_secs(number),
            "m" => Duration::from_secs(number * 60),
            _ => Duration::from_secs(number * 3600),
        };
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_yaml("{}").unwrap();
        assert!(!config.core.no_publish);
        assert_eq!(
            config.core.sleep_interval().unwrap(),
            Duration::from_secs(60)
        );
        assert_eq!(config.core.feature_sources, vec!["all".to_string()]);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_full_document() {
        let doc = r#"
core:
  noPublish: true
  sleepInterval: 5m
  labelWhiteList: "^cpu-"
  featureSources: [system, fake]
  labelSources: [local]
sources:
  fake:
    flags: [custom]
"#;
        let config = WorkerConfig::from_yaml(doc).unwrap();
        assert!(config.core.no_publish);
        assert_eq!(
            config.core.sleep_interval().unwrap(),
            Duration::from_secs(300)
        );
        assert!(config.core.label_white_list().unwrap().is_some());
        assert_eq!(config.core.feature_sources.len(), 2);
        assert!(config.sources.contains_key("fake"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "core:\n  sleepInterval: 10s").unwrap();
        let config = WorkerConfig::from_file(file.path()).unwrap();
        assert_eq!(
            config.core.sleep_interval().unwrap(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_invalid_whitelist_rejected() {
        let doc = "core:\n  labelWhiteList: \"(unclosed\"\n";
        assert!(WorkerConfig::from_yaml(doc).is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let doc = "core:\n  sleepInterval: 0s\n";
        assert!(WorkerConfig::from_yaml(doc).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("10s junk").is_err());
    }
}
