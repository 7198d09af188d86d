// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Label keys, emissions, and ownership tracking.
//!
//! Everything nodesense writes to a node object shares a well-known
//! prefix, and the complete set of owned keys is recorded in tracking
//! annotations so stale keys can be removed across restarts without
//! clobbering keys owned by other controllers.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Default prefix for feature labels emitted without an explicit prefix.
pub const FEATURE_LABEL_PREFIX: &str = "feature.nodesense.io/";

/// Prefix for all nodesense annotations.
pub const ANNOTATION_PREFIX: &str = "nodesense.io/";

/// Tracking annotation listing the label keys owned by nodesense.
pub const FEATURE_LABELS_ANNOTATION: &str = "nodesense.io/feature-labels";

/// Tracking annotation listing the annotation keys owned by nodesense.
pub const FEATURE_ANNOTATIONS_ANNOTATION: &str = "nodesense.io/feature-annotations";

/// Tracking annotation listing the extended-resource keys owned by nodesense.
pub const EXTENDED_RESOURCES_ANNOTATION: &str = "nodesense.io/extended-resources";

/// Tracking annotation listing the taint keys owned by nodesense.
pub const TAINTS_ANNOTATION: &str = "nodesense.io/taints";

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

/// True for the tracking annotations the coordinator manages itself;
/// rules may not emit them.
pub fn is_tracking_annotation(key: &str) -> bool {
    matches!(
        key,
        FEATURE_LABELS_ANNOTATION
            | FEATURE_ANNOTATIONS_ANNOTATION
            | EXTENDED_RESOURCES_ANNOTATION
            | TAINTS_ANNOTATION
    )
}

/// Label and emission errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelError {
    /// Key failed validation.
    #[error("invalid label key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// Value failed validation.
    #[error("invalid value {value:?} for key {key:?}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// A node taint emitted by a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Taint {
    /// Taint key (same syntax as a label key).
    pub key: String,

    /// Optional taint value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Taint effect (e.g. "NoSchedule", "NoExecute").
    pub effect: String,
}

/// The set of node artifacts produced by matched rules: labels,
/// annotations, extended resources, taints, and rule variables.
///
/// Variables participate in rule chaining only; they are never
/// published on the node object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Emission {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub extended_resources: BTreeMap<String, String>,

    #[serde(default)]
    pub taints: Vec<Taint>,

    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl Emission {
    /// Create an empty emission.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if nothing would be published and no vars were set.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
            && self.annotations.is_empty()
            && self.extended_resources.is_empty()
            && self.taints.is_empty()
            && self.vars.is_empty()
    }

    /// Merge `other` into `self`; on key conflict `other` wins.
    ///
    /// Taints are deduplicated by `(key, effect)`, later entries
    /// replacing earlier ones.
    pub fn merge_from(&mut self, other: &Emission) {
        for (k, v) in &other.labels {
            self.labels.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.annotations {
            self.annotations.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.extended_resources {
            self.extended_resources.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.vars {
            self.vars.insert(k.clone(), v.clone());
        }
        for taint in &other.taints {
            self.taints
                .retain(|t| !(t.key == taint.key && t.effect == taint.effect));
            self.taints.push(taint.clone());
        }
    }
}

/// Merge a cluster-scoped and a worker-local emission.
///
/// Cluster rules take precedence over local emissions, except that
/// emissions from rules marked advisory yield to local values.
pub fn merge_with_precedence(advisory: &Emission, local: &Emission, strict: &Emission) -> Emission {
    let mut out = advisory.clone();
    out.merge_from(local);
    out.merge_from(strict);
    out
}

/// Qualify a label key with the default feature prefix when it has no
/// explicit prefix, then validate it.
pub fn qualify_key(key: &str) -> Result<String, LabelError> {
    let qualified = if key.contains('/') {
        key.to_string()
    } else {
        format!("{}{}", FEATURE_LABEL_PREFIX, key)
    };
    validate_key(&qualified)?;
    Ok(qualified)
}

/// Validate a fully-qualified label key: `[prefix/]name`, DNS-subdomain
/// prefix up to 253 chars, alphanumeric-bounded name up to 63 chars.
pub fn validate_key(key: &str) -> Result<(), LabelError> {
    let (prefix, name) = match key.rsplit_once('/') {
        Some((p, n)) => (Some(p), n),
        None => (None, key),
    };

    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN {
            return Err(LabelError::InvalidKey {
                key: key.to_string(),
                reason: format!("prefix must be 1..={} characters", MAX_PREFIX_LEN),
            });
        }
        let prefix_ok = prefix.split('.').all(|part| {
            !part.is_empty()
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !part.starts_with('-')
                && !part.ends_with('-')
        });
        if !prefix_ok {
            return Err(LabelError::InvalidKey {
                key: key.to_string(),
                reason: "prefix is not a valid DNS subdomain".to_string(),
            });
        }
    }

    if !valid_name(name) {
        return Err(LabelError::InvalidKey {
            key: key.to_string(),
            reason: format!(
                "name must be 1..={} alphanumeric-bounded characters",
                MAX_NAME_LEN
            ),
        });
    }
    Ok(())
}

/// Validate a label value: empty, or alphanumeric-bounded up to 63 chars.
pub fn validate_value(key: &str, value: &str) -> Result<(), LabelError> {
    if value.is_empty() || valid_name(value) {
        Ok(())
    } else {
        Err(LabelError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: format!(
                "value must be empty or 1..={} alphanumeric-bounded characters",
                MAX_NAME_LEN
            ),
        })
    }
}

fn valid_name(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_NAME_LEN {
        return false;
    }
    let bytes = s.as_bytes();
    let bounded =
        bytes[0].is_ascii_alphanumeric() && bytes[bytes.len() - 1].is_ascii_alphanumeric();
    bounded
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Drop labels whose unprefixed name does not match the whitelist.
/// Returns the keys that were removed.
pub fn filter_whitelist(labels: &mut BTreeMap<String, String>, whitelist: &Regex) -> Vec<String> {
    let dropped: Vec<String> = labels
        .keys()
        .filter(|key| {
            let name = key.rsplit_once('/').map(|(_, n)| n).unwrap_or(key);
            !whitelist.is_match(name)
        })
        .cloned()
        .collect();
    for key in &dropped {
        labels.remove(key);
    }
    dropped
}

/// Encode an owned-key set for a tracking annotation.
pub fn format_owned_keys<'a, I: IntoIterator<Item = &'a String>>(keys: I) -> String {
    let sorted: BTreeSet<&str> = keys.into_iter().map(String::as_str).collect();
    sorted.into_iter().collect::<Vec<_>>().join(",")
}

/// Decode an owned-key set from a tracking annotation value.
pub fn parse_owned_keys(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
