// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-node feature snapshot model.
//!
//! A snapshot maps a domain name ("cpu", "kernel", "pci") to the typed
//! feature sets discovered for that domain. Every domain carries three
//! disjoint collections:
//!
//! - **flags** -- presence-only features (an instruction-set bit, a
//!   loaded kernel module name)
//! - **attributes** -- key to string-value features (a kernel version,
//!   a numeric capacity)
//! - **instances** -- ordered lists of attribute maps, one element per
//!   occurrence of a compound thing (one PCI device, one NVDIMM)
//!
//! Snapshots are immutable once built by the source registry. Structural
//! equality is defined over the canonical byte encoding: sorted keys,
//! instance lists ordered by their own encoding. Two snapshots that
//! differ only in map iteration order or instance order are equal.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Snapshot model errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// A feature reference was not of the form `domain.feature`.
    #[error("invalid feature reference {0:?}: expected \"domain.feature\"")]
    InvalidFeatureRef(String),
}

/// A presence-only feature set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagFeatureSet {
    /// Flag names present on this node.
    pub elements: BTreeSet<String>,
}

/// A key -> string-value feature set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeFeatureSet {
    /// Attribute values keyed by attribute name.
    pub elements: BTreeMap<String, String>,
}

/// One occurrence of a compound feature (e.g. one PCI device).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFeature {
    /// Attributes of this instance.
    pub attributes: BTreeMap<String, String>,
}

impl InstanceFeature {
    /// Create an instance from an attribute list.
    pub fn new<K, V, I>(attributes: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Get an attribute value.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    fn write_canonical(&self, out: &mut Vec<u8>) {
        for (k, v) in &self.attributes {
            put_str(out, k);
            put_str(out, v);
        }
    }
}

/// An ordered list of instances of one compound feature.
///
/// Element order is preserved as discovered but carries no meaning;
/// the canonical encoding sorts elements by their own encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFeatureSet {
    /// Discovered instances, in discovery order.
    pub elements: Vec<InstanceFeature>,
}

/// All features discovered for a single domain.
///
/// The three collections occupy disjoint feature-name spaces; empty
/// collections are represented as empty maps, never absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainFeatures {
    /// Flag feature sets keyed by feature name.
    #[serde(default)]
    pub flags: BTreeMap<String, FlagFeatureSet>,

    /// Attribute feature sets keyed by feature name.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeFeatureSet>,

    /// Instance feature sets keyed by feature name.
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceFeatureSet>,
}

impl DomainFeatures {
    /// Create an empty domain feature set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a flag element to the named flag feature.
    pub fn add_flag(&mut self, feature: &str, element: impl Into<String>) {
        self.flags
            .entry(feature.to_string())
            .or_default()
            .elements
            .insert(element.into());
    }

    /// Add an attribute to the named attribute feature.
    pub fn add_attribute(
        &mut self,
        feature: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.attributes
            .entry(feature.to_string())
            .or_default()
            .elements
            .insert(key.into(), value.into());
    }

    /// Append an instance to the named instance feature.
    pub fn add_instance(&mut self, feature: &str, instance: InstanceFeature) {
        self.instances
            .entry(feature.to_string())
            .or_default()
            .elements
            .push(instance);
    }

    /// True if no features were discovered for this domain.
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.attributes.is_empty() && self.instances.is_empty()
    }

    fn write_canonical(&self, out: &mut Vec<u8>) {
        out.push(b'F');
        for (name, set) in &self.flags {
            put_str(out, name);
            for elem in &set.elements {
                put_str(out, elem);
            }
            out.push(0);
        }
        out.push(b'A');
        for (name, set) in &self.attributes {
            put_str(out, name);
            for (k, v) in &set.elements {
                put_str(out, k);
                put_str(out, v);
            }
            out.push(0);
        }
        out.push(b'I');
        for (name, set) in &self.instances {
            put_str(out, name);
            // Instance order is not semantic: sort by encoding so two
            // discovery passes that enumerate devices differently
            // produce identical canonical bytes.
            let mut encoded: Vec<Vec<u8>> = set
                .elements
                .iter()
                .map(|inst| {
                    let mut buf = Vec::new();
                    inst.write_canonical(&mut buf);
                    buf
                })
                .collect();
            encoded.sort();
            for buf in encoded {
                out.extend_from_slice(&(buf.len() as u32).to_be_bytes());
                out.extend_from_slice(&buf);
            }
            out.push(0);
        }
    }
}

/// The complete typed set of a node's discovered properties at one
/// point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    /// Per-domain features keyed by domain name. Domain names are
    /// unique; the registry prefixes them with the provider name.
    pub domains: BTreeMap<String, DomainFeatures>,
}

impl FeatureSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a domain. Replaces any previous features for the domain.
    pub fn insert_domain(&mut self, name: impl Into<String>, features: DomainFeatures) {
        self.domains.insert(name.into(), features);
    }

    /// Look up a domain.
    pub fn domain(&self, name: &str) -> Option<&DomainFeatures> {
        self.domains.get(name)
    }

    /// Look up a flag feature by `(domain, feature)` reference.
    pub fn flag_set(&self, domain: &str, feature: &str) -> Option<&FlagFeatureSet> {
        self.domains.get(domain)?.flags.get(feature)
    }

    /// Look up an attribute feature by `(domain, feature)` reference.
    pub fn attribute_set(&self, domain: &str, feature: &str) -> Option<&AttributeFeatureSet> {
        self.domains.get(domain)?.attributes.get(feature)
    }

    /// Look up an instance feature by `(domain, feature)` reference.
    pub fn instance_set(&self, domain: &str, feature: &str) -> Option<&InstanceFeatureSet> {
        self.domains.get(domain)?.instances.get(feature)
    }

    /// Number of domains in the snapshot.
    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    /// True if no domain contributed any features.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Canonical byte encoding of the snapshot.
    ///
    /// Keys are emitted in sorted order and instance lists are ordered
    /// by their own encoding, so structural equality is byte equality.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (domain, features) in &self.domains {
            put_str(&mut out, domain);
            features.write_canonical(&mut out);
        }
        out
    }

    /// Structural equality over canonical forms.
    pub fn structurally_equal(&self, other: &FeatureSnapshot) -> bool {
        self.canonical_bytes() == other.canonical_bytes()
    }
}

/// Split a `domain.feature` reference into its two halves.
///
/// The split is at the first dot; feature names may themselves contain
/// dots.
pub fn split_feature_ref(s: &str) -> Result<(&str, &str), SnapshotError> {
    match s.split_once('.') {
        Some((domain, feature)) if !domain.is_empty() && !feature.is_empty() => {
            Ok((domain, feature))
        }
        _ => Err(SnapshotError::InvalidFeatureRef(s.to_string())),
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_domain() -> DomainFeatures {
        let mut cpu = DomainFeatures::new();
        cpu.add_flag("flags", "sse4");
        cpu.add_flag("flags", "avx2");
        cpu.add_attribute("topology", "sockets", "2");
        cpu
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = FeatureSnapshot::new();
        assert!(snap.is_empty());
        assert_eq!(snap.domain_count(), 0);
        assert!(snap.canonical_bytes().is_empty());
    }

    #[test]
    fn test_domain_lookup() {
        let mut snap = FeatureSnapshot::new();
        snap.insert_domain("cpu", cpu_domain());

        assert!(snap.domain("cpu").is_some());
        assert!(snap.domain("memory").is_none());

        let flags = snap.flag_set("cpu", "flags").unwrap();
        assert!(flags.elements.contains("avx2"));

        let topo = snap.attribute_set("cpu", "topology").unwrap();
        assert_eq!(topo.elements.get("sockets").map(String::as_str), Some("2"));

        assert!(snap.instance_set("cpu", "flags").is_none());
    }

    #[test]
    fn test_flag_insertion_is_idempotent() {
        let mut d = DomainFeatures::new();
        d.add_flag("flags", "avx2");
        d.add_flag("flags", "avx2");
        assert_eq!(d.flags.get("flags").unwrap().elements.len(), 1);
    }

    #[test]
    fn test_canonical_equality_ignores_insertion_order() {
        let mut a = FeatureSnapshot::new();
        let mut d1 = DomainFeatures::new();
        d1.add_flag("flags", "sse4");
        d1.add_flag("flags", "avx2");
        a.insert_domain("cpu", d1);

        let mut b = FeatureSnapshot::new();
        let mut d2 = DomainFeatures::new();
        d2.add_flag("flags", "avx2");
        d2.add_flag("flags", "sse4");
        b.insert_domain("cpu", d2);

        assert!(a.structurally_equal(&b));
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn test_canonical_equality_ignores_instance_order() {
        let nvidia = InstanceFeature::new([("vendor", "10de"), ("class", "0300")]);
        let intel = InstanceFeature::new([("vendor", "8086"), ("class", "0200")]);

        let mut a = FeatureSnapshot::new();
        let mut d1 = DomainFeatures::new();
        d1.add_instance("device", nvidia.clone());
        d1.add_instance("device", intel.clone());
        a.insert_domain("pci", d1);

        let mut b = FeatureSnapshot::new();
        let mut d2 = DomainFeatures::new();
        d2.add_instance("device", intel);
        d2.add_instance("device", nvidia);
        b.insert_domain("pci", d2);

        assert!(a.structurally_equal(&b));
    }

    #[test]
    fn test_canonical_inequality_on_value_change() {
        let mut a = FeatureSnapshot::new();
        let mut d1 = DomainFeatures::new();
        d1.add_attribute("version", "full", "5.15.3");
        a.insert_domain("kernel", d1);

        let mut b = FeatureSnapshot::new();
        let mut d2 = DomainFeatures::new();
        d2.add_attribute("version", "full", "5.15.4");
        b.insert_domain("kernel", d2);

        assert!(!a.structurally_equal(&b));
    }

    #[test]
    fn test_canonical_distinguishes_section_membership() {
        // A flag named "x" and an attribute feature named "x" must not
        // collide in the canonical form.
        let mut a = FeatureSnapshot::new();
        let mut d1 = DomainFeatures::new();
        d1.add_flag("x", "y");
        a.insert_domain("d", d1);

        let mut b = FeatureSnapshot::new();
        let mut d2 = DomainFeatures::new();
        d2.add_attribute("x", "y", "");
        b.insert_domain("d", d2);

        assert!(!a.structurally_equal(&b));
    }

    #[test]
    fn test_split_feature_ref() {
        assert_eq!(split_feature_ref("cpu.flags").unwrap(), ("cpu", "flags"));
        assert_eq!(
            split_feature_ref("kernel.config.NO_HZ").unwrap(),
            ("kernel", "config.NO_HZ")
        );
        assert!(split_feature_ref("cpu").is_err());
        assert!(split_feature_ref(".flags").is_err());
        assert!(split_feature_ref("cpu.").is_err());
    }

    #[test]
    fn test_serde_roundtrip_preserves_structure() {
        let mut snap = FeatureSnapshot::new();
        snap.insert_domain("cpu", cpu_domain());
        let mut pci = DomainFeatures::new();
        pci.add_instance(
            "device",
            InstanceFeature::new([("vendor", "10de"), ("class", "0300")]),
        );
        snap.insert_domain("pci", pci);

        let json = serde_json::to_string(&snap).unwrap();
        let parsed: FeatureSnapshot = serde_json::from_str(&json).unwrap();
        assert!(snap.structurally_equal(&parsed));
        assert_eq!(snap, parsed);
    }
}
