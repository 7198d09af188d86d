// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fake source: deterministic features for tests and demos.

use super::{Source, SourceError};
use crate::snapshot::{DomainFeatures, InstanceFeature};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Configurable synthetic feature provider.
pub struct FakeSource {
    config: FakeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FakeConfig {
    flags: Vec<String>,
    attributes: BTreeMap<String, String>,
    instance_count: usize,
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self {
            flags: vec![
                "flag_1".to_string(),
                "flag_2".to_string(),
                "flag_3".to_string(),
            ],
            attributes: BTreeMap::from([
                ("attr_1".to_string(), "true".to_string()),
                ("attr_2".to_string(), "false".to_string()),
            ]),
            instance_count: 3,
        }
    }
}

impl FakeSource {
    /// Create a fake source with the default feature set.
    pub fn new() -> Self {
        Self {
            config: FakeConfig::default(),
        }
    }
}

impl Default for FakeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for FakeSource {
    fn name(&self) -> &str {
        "fake"
    }

    fn discover(&mut self) -> Result<DomainFeatures, SourceError> {
        let mut features = DomainFeatures::new();
        for flag in &self.config.flags {
            features.add_flag("flag", flag.clone());
        }
        for (key, value) in &self.config.attributes {
            features.add_attribute("attribute", key.clone(), value.clone());
        }
        for i in 0..self.config.instance_count {
            features.add_instance(
                "instance",
                InstanceFeature::new([
                    ("name".to_string(), format!("instance_{}", i)),
                    ("attr_1".to_string(), "true".to_string()),
                ]),
            );
        }
        Ok(features)
    }

    fn configure(&mut self, config: &serde_yaml::Value) -> Result<(), SourceError> {
        self.config = FakeConfig::deserialize(config.clone())
            .map_err(|e| SourceError::Config(e.to_string()))?;
        Ok(())
    }
}
