// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Feature matcher terms: expressions applied to one snapshot feature.
//!
//! A term names a `domain.feature` target and carries per-element
//! match expressions plus an optional name expression. Matching
//! semantics depend on the kind of feature the target resolves to:
//!
//! - **flags** -- every keyed expression is evaluated against the
//!   flag's presence; `matchName` matches if any element name does.
//! - **attributes** -- every keyed expression is evaluated against the
//!   attribute's string value; `matchName` matches if any attribute
//!   name does.
//! - **instances** -- the term matches if at least one instance
//!   satisfies all expressions (evaluated against that instance's
//!   attributes) and `matchName` (against its `name` attribute).
//!
//! A term whose target feature is absent from the snapshot never
//! matches.

use super::expression::MatchExpression;
use super::RuleError;
use crate::snapshot::{
    split_feature_ref, AttributeFeatureSet, FeatureSnapshot, FlagFeatureSet, InstanceFeature,
    InstanceFeatureSet,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One feature matcher term.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureMatcherTerm {
    /// Target feature as a `domain.feature` reference.
    pub feature: String,

    /// Per-element match expressions keyed by element name.
    #[serde(default)]
    pub match_expressions: BTreeMap<String, MatchExpression>,

    /// Optional expression applied to element names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_name: Option<MatchExpression>,
}

/// Elements of one feature that satisfied a matcher term, retained for
/// template expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchedElements {
    /// Matched flag names.
    Flags(BTreeSet<String>),
    /// Matched attributes.
    Attributes(BTreeMap<String, String>),
    /// Matched instances.
    Instances(Vec<InstanceFeature>),
}

/// Matched elements keyed by the term's `domain.feature` reference.
pub type MatchedFeatures = BTreeMap<String, MatchedElements>;

impl FeatureMatcherTerm {
    /// Create a term matching on feature presence alone.
    pub fn on_feature(feature: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            match_expressions: BTreeMap::new(),
            match_name: None,
        }
    }

    /// Add a keyed expression.
    pub fn with_expression(mut self, key: impl Into<String>, expr: MatchExpression) -> Self {
        self.match_expressions.insert(key.into(), expr);
        self
    }

    /// Set the name expression.
    pub fn with_match_name(mut self, expr: MatchExpression) -> Self {
        self.match_name = Some(expr);
        self
    }

    /// Validate the feature reference and all expressions.
    pub fn validate(&mut self) -> Result<(), RuleError> {
        split_feature_ref(&self.feature)?;
        for expr in self.match_expressions.values_mut() {
            expr.validate()?;
        }
        if let Some(expr) = self.match_name.as_mut() {
            expr.validate()?;
        }
        Ok(())
    }

    /// Evaluate the term against a snapshot.
    ///
    /// Returns the matched elements when the term matches, `None`
    /// otherwise (including when the target feature is absent).
    pub fn evaluate(
        &self,
        snapshot: &FeatureSnapshot,
    ) -> Result<Option<MatchedElements>, RuleError> {
        let (domain, feature) = split_feature_ref(&self.feature)?;

        if let Some(set) = snapshot.flag_set(domain, feature) {
            return self.match_flags(set);
        }
        if let Some(set) = snapshot.attribute_set(domain, feature) {
            return self.match_attributes(set);
        }
        if let Some(set) = snapshot.instance_set(domain, feature) {
            return self.match_instances(set);
        }
        Ok(None)
    }

    fn match_flags(&self, set: &FlagFeatureSet) -> Result<Option<MatchedElements>, RuleError> {
        let mut matched = BTreeSet::new();

        for (key, expr) in &self.match_expressions {
            let present = set.elements.contains(key);
            let value = if present { Some("true") } else { None };
            if !expr.match_value(value)? {
                return Ok(None);
            }
            if present {
                matched.insert(key.clone());
            }
        }

        if let Some(name_expr) = &self.match_name {
            let mut any = false;
            for name in &set.elements {
                if name_expr.match_name(name)? {
                    matched.insert(name.clone());
                    any = true;
                }
            }
            if !any {
                return Ok(None);
            }
        }

        if self.match_expressions.is_empty() && self.match_name.is_none() {
            matched = set.elements.clone();
        }
        Ok(Some(MatchedElements::Flags(matched)))
    }

    fn match_attributes(
        &self,
        set: &AttributeFeatureSet,
    ) -> Result<Option<MatchedElements>, RuleError> {
        let mut matched = BTreeMap::new();

        for (key, expr) in &self.match_expressions {
            let value = set.elements.get(key).map(String::as_str);
            if !expr.match_value(value)? {
                return Ok(None);
            }
            if let Some(value) = value {
                matched.insert(key.clone(), value.to_string());
            }
        }

        if let Some(name_expr) = &self.match_name {
            let mut any = false;
            for (name, value) in &set.elements {
                if name_expr.match_name(name)? {
                    matched.insert(name.clone(), value.clone());
                    any = true;
                }
            }
            if !any {
                return Ok(None);
            }
        }

        if self.match_expressions.is_empty() && self.match_name.is_none() {
            matched = set.elements.clone();
        }
        Ok(Some(MatchedElements::Attributes(matched)))
    }

    fn match_instances(
        &self,
        set: &InstanceFeatureSet,
    ) -> Result<Option<MatchedElements>, RuleError> {
        let mut matched = Vec::new();

        'instances: for instance in &set.elements {
            for (key, expr) in &self.match_expressions {
                let value = instance.attribute(key);
                if !expr.match_value(value)? {
                    continue 'instances;
                }
            }
            if let Some(name_expr) = &self.match_name {
                match instance.attribute("name") {
                    Some(name) if name_expr.match_name(name)? => {}
                    _ => continue 'instances,
                }
            }
            matched.push(instance.clone());
        }

        if matched.is_empty() {
            return Ok(None);
        }
        Ok(Some(MatchedElements::Instances(matched)))
    }
}

/// Evaluate a conjunction of terms. All terms must match; the matched
/// elements of every term are returned keyed by feature reference.
///
/// A `TypeMismatch` raised by a term is logged and collapses the whole
/// conjunction to a non-match.
pub fn match_feature_terms(
    terms: &[FeatureMatcherTerm],
    snapshot: &FeatureSnapshot,
) -> Result<Option<MatchedFeatures>, RuleError> {
    let mut matched = MatchedFeatures::new();
    for term in terms {
        match term.evaluate(snapshot) {
            Ok(Some(elements)) => {
                matched.insert(term.feature.clone(), elements);
            }
            Ok(None) => return Ok(None),
            Err(RuleError::TypeMismatch(reason)) => {
                log::debug!(
                    "type mismatch matching feature {}: {}",
                    term.feature,
                    reason
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Some(matched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::expression::MatchOp;
    use crate::snapshot::DomainFeatures;

    fn snapshot() -> FeatureSnapshot {
        let mut snap = FeatureSnapshot::new();

        let mut cpu = DomainFeatures::new();
        cpu.add_flag("flags", "sse4");
        cpu.add_flag("flags", "avx2");
        snap.insert_domain("cpu", cpu);

        let mut kernel = DomainFeatures::new();
        kernel.add_attribute("version", "full", "5.15.3");
        kernel.add_attribute("version", "major", "5");
        snap.insert_domain("kernel", kernel);

        let mut pci = DomainFeatures::new();
        pci.add_instance(
            "device",
            InstanceFeature::new([("vendor", "10de"), ("class", "0300"), ("name", "gpu0")]),
        );
        pci.add_instance(
            "device",
            InstanceFeature::new([("vendor", "8086"), ("class", "0200"), ("name", "eth0")]),
        );
        snap.insert_domain("pci", pci);

        snap
    }

    fn expr<const N: usize>(op: MatchOp, value: [&str; N]) -> MatchExpression {
        let mut e = MatchExpression::new(op, value);
        e.validate().unwrap();
        e
    }

    #[test]
    fn test_flag_term_matches_on_presence() {
        let term = FeatureMatcherTerm::on_feature("cpu.flags")
            .with_expression("avx2", expr(MatchOp::Exists, []));
        match term.evaluate(&snapshot()).unwrap() {
            Some(MatchedElements::Flags(flags)) => {
                assert!(flags.contains("avx2"));
            }
            other => panic!("expected flag match, got {:?}", other),
        }
    }

    #[test]
    fn test_flag_term_does_not_exist() {
        let term = FeatureMatcherTerm::on_feature("cpu.flags")
            .with_expression("sve", expr(MatchOp::DoesNotExist, []));
        assert!(term.evaluate(&snapshot()).unwrap().is_some());

        let term = FeatureMatcherTerm::on_feature("cpu.flags")
            .with_expression("avx2", expr(MatchOp::DoesNotExist, []));
        assert!(term.evaluate(&snapshot()).unwrap().is_none());
    }

    #[test]
    fn test_flag_term_match_name_wildcard() {
        let term = FeatureMatcherTerm::on_feature("cpu.flags")
            .with_match_name(expr(MatchOp::InRegexp, ["^avx"]));
        match term.evaluate(&snapshot()).unwrap() {
            Some(MatchedElements::Flags(flags)) => {
                assert_eq!(flags.len(), 1);
                assert!(flags.contains("avx2"));
            }
            other => panic!("expected flag match, got {:?}", other),
        }

        let term = FeatureMatcherTerm::on_feature("cpu.flags")
            .with_match_name(expr(MatchOp::InRegexp, ["^sve"]));
        assert!(term.evaluate(&snapshot()).unwrap().is_none());
    }

    #[test]
    fn test_empty_term_matches_existing_feature() {
        let term = FeatureMatcherTerm::on_feature("cpu.flags");
        match term.evaluate(&snapshot()).unwrap() {
            Some(MatchedElements::Flags(flags)) => assert_eq!(flags.len(), 2),
            other => panic!("expected all flags, got {:?}", other),
        }
    }

    #[test]
    fn test_absent_feature_never_matches() {
        let term = FeatureMatcherTerm::on_feature("memory.numa");
        assert!(term.evaluate(&snapshot()).unwrap().is_none());

        // Even a DoesNotExist expression cannot match an absent feature.
        let term = FeatureMatcherTerm::on_feature("memory.numa")
            .with_expression("anything", expr(MatchOp::DoesNotExist, []));
        assert!(term.evaluate(&snapshot()).unwrap().is_none());
    }

    #[test]
    fn test_attribute_term() {
        let term = FeatureMatcherTerm::on_feature("kernel.version")
            .with_expression("major", expr(MatchOp::In, ["5", "6"]));
        match term.evaluate(&snapshot()).unwrap() {
            Some(MatchedElements::Attributes(attrs)) => {
                assert_eq!(attrs.get("major").map(String::as_str), Some("5"));
            }
            other => panic!("expected attribute match, got {:?}", other),
        }

        let term = FeatureMatcherTerm::on_feature("kernel.version")
            .with_expression("major", expr(MatchOp::Gt, ["5"]));
        assert!(term.evaluate(&snapshot()).unwrap().is_none());
    }

    #[test]
    fn test_instance_term_requires_single_instance_satisfying_all() {
        let term = FeatureMatcherTerm::on_feature("pci.device")
            .with_expression("vendor", expr(MatchOp::In, ["10de"]))
            .with_expression("class", expr(MatchOp::In, ["0300"]));
        match term.evaluate(&snapshot()).unwrap() {
            Some(MatchedElements::Instances(instances)) => {
                assert_eq!(instances.len(), 1);
                assert_eq!(instances[0].attribute("name"), Some("gpu0"));
            }
            other => panic!("expected instance match, got {:?}", other),
        }

        // vendor and class from different instances must not combine.
        let term = FeatureMatcherTerm::on_feature("pci.device")
            .with_expression("vendor", expr(MatchOp::In, ["10de"]))
            .with_expression("class", expr(MatchOp::In, ["0200"]));
        assert!(term.evaluate(&snapshot()).unwrap().is_none());
    }

    #[test]
    fn test_instance_match_name() {
        let term = FeatureMatcherTerm::on_feature("pci.device")
            .with_match_name(expr(MatchOp::InRegexp, ["^gpu"]));
        match term.evaluate(&snapshot()).unwrap() {
            Some(MatchedElements::Instances(instances)) => assert_eq!(instances.len(), 1),
            other => panic!("expected instance match, got {:?}", other),
        }
    }

    #[test]
    fn test_conjunction_all_terms_must_match() {
        let terms = vec![
            FeatureMatcherTerm::on_feature("cpu.flags")
                .with_expression("avx2", expr(MatchOp::Exists, [])),
            FeatureMatcherTerm::on_feature("kernel.version")
                .with_expression("major", expr(MatchOp::In, ["5"])),
        ];
        let matched = match_feature_terms(&terms, &snapshot()).unwrap().unwrap();
        assert_eq!(matched.len(), 2);
        assert!(matched.contains_key("cpu.flags"));
        assert!(matched.contains_key("kernel.version"));

        let terms = vec![
            FeatureMatcherTerm::on_feature("cpu.flags")
                .with_expression("avx2", expr(MatchOp::Exists, [])),
            FeatureMatcherTerm::on_feature("absent.domain"),
        ];
        assert!(match_feature_terms(&terms, &snapshot()).unwrap().is_none());
    }

    #[test]
    fn test_type_mismatch_collapses_to_non_match() {
        let terms = vec![FeatureMatcherTerm::on_feature("kernel.version")
            .with_expression("full", expr(MatchOp::Gt, ["4"]))];
        // "5.15.3" does not parse as an integer: non-match, not error.
        assert!(match_feature_terms(&terms, &snapshot()).unwrap().is_none());
    }

    #[test]
    fn test_term_validation_rejects_bad_feature_ref() {
        let mut term = FeatureMatcherTerm::on_feature("nodot");
        assert!(term.validate().is_err());
    }
}
