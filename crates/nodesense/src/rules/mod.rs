// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Rule engine: declarative feature-to-label synthesis.
//!
//! A rule couples a match section (a conjunction of feature matcher
//! terms plus an optional disjunction of alternatives) with an
//! emission section (literal and templated labels, annotations,
//! extended resources, taints, and variables). Rules are evaluated in
//! document order against one node's feature snapshot; variables set
//! by earlier rules are visible to later ones. Evaluation is pure:
//! the same snapshot and rule list always produce the same emissions.
//!
//! # Example rule document
//!
//! ```yaml
//! - name: "nvidia gpu"
//!   labels:
//!     gpu/nvidia: "true"
//!   matchFeatures:
//!     - feature: pci.device
//!       matchExpressions:
//!         vendor: { op: In, value: ["10de"] }
//!         class: { op: In, value: ["0300"] }
//! ```

mod expression;
mod matcher;
mod template;

pub use expression::{MatchExpression, MatchOp, MatchValue};
pub use matcher::{match_feature_terms, FeatureMatcherTerm, MatchedElements, MatchedFeatures};
pub use template::{parse_key_value_lines, Template};

use crate::labels::{self, Emission, LabelError, Taint};
use crate::snapshot::{FeatureSnapshot, SnapshotError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Rule engine errors.
#[derive(Debug, Error)]
pub enum RuleError {
    /// Operator arity or operand type constraint violated.
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    /// An `InRegexp` pattern failed to compile.
    #[error("invalid regex {pattern:?}: {reason}")]
    InvalidRegex { pattern: String, reason: String },

    /// A present input failed integer parsing during evaluation.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Template parse or expansion failure.
    #[error("template error: {0}")]
    Template(String),

    /// Malformed feature reference.
    #[error(transparent)]
    Feature(#[from] SnapshotError),

    /// Emitted key or value failed validation.
    #[error(transparent)]
    Label(#[from] LabelError),

    /// A rule was rejected by the loader.
    #[error("invalid rule {rule:?}: {reason}")]
    InvalidRule { rule: String, reason: String },

    /// The rule document itself could not be parsed.
    #[error("rule document parse error: {0}")]
    Parse(String),
}

/// One alternative inside `matchAny`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchAnyElem {
    /// Conjunction of terms for this alternative.
    pub match_features: Vec<FeatureMatcherTerm>,
}

/// A declarative rule record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Human-readable identifier, used in logs only.
    pub name: String,

    /// Literal labels to emit when the rule matches.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Templated labels, expanded against matched features and vars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels_template: Option<String>,

    /// Literal annotations to emit.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Literal extended resources to emit.
    #[serde(default)]
    pub extended_resources: BTreeMap<String, String>,

    /// Templated extended resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_resources_template: Option<String>,

    /// Node taints to emit.
    #[serde(default)]
    pub taints: Vec<Taint>,

    /// Literal variables visible to later rules.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,

    /// Templated variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars_template: Option<String>,

    /// Conjunction of feature matcher terms; all must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_features: Option<Vec<FeatureMatcherTerm>>,

    /// Disjunction of alternatives; at least one must match when given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_any: Option<Vec<MatchAnyElem>>,

    /// Advisory cluster rules yield to worker-local emissions on key
    /// conflict instead of overriding them.
    #[serde(default)]
    pub advisory: bool,

    #[serde(skip)]
    labels_tmpl: Option<Template>,
    #[serde(skip)]
    extended_resources_tmpl: Option<Template>,
    #[serde(skip)]
    vars_tmpl: Option<Template>,
}

impl Rule {
    /// Create a named rule matching unconditionally.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Validate matchers and expressions, and pre-parse templates.
    pub fn validate(&mut self) -> Result<(), RuleError> {
        if let Some(terms) = self.match_features.as_mut() {
            for term in terms {
                term.validate()?;
            }
        }
        if let Some(alternatives) = self.match_any.as_mut() {
            for alt in alternatives {
                for term in &mut alt.match_features {
                    term.validate()?;
                }
            }
        }
        self.labels_tmpl = self
            .labels_template
            .as_deref()
            .map(Template::parse)
            .transpose()?;
        self.extended_resources_tmpl = self
            .extended_resources_template
            .as_deref()
            .map(Template::parse)
            .transpose()?;
        self.vars_tmpl = self.vars_template.as_deref().map(Template::parse).transpose()?;
        Ok(())
    }

    /// Evaluate the rule against a snapshot and variable context.
    ///
    /// Returns the rule's emission when it matches, `None` otherwise.
    /// A rule with neither `matchFeatures` nor `matchAny` always
    /// matches.
    pub fn evaluate(
        &self,
        snapshot: &FeatureSnapshot,
        vars: &BTreeMap<String, String>,
    ) -> Result<Option<Emission>, RuleError> {
        let mut matched = MatchedFeatures::new();

        if let Some(terms) = &self.match_features {
            match match_feature_terms(terms, snapshot)? {
                Some(elements) => matched.extend(elements),
                None => return Ok(None),
            }
        }

        if let Some(alternatives) = &self.match_any {
            let mut any = false;
            for alt in alternatives {
                if let Some(elements) = match_feature_terms(&alt.match_features, snapshot)? {
                    matched.extend(elements);
                    any = true;
                }
            }
            if !any {
                return Ok(None);
            }
        }

        let mut emission = Emission::new();

        for (key, value) in self.expand(&self.labels_tmpl, &self.labels_template, &matched, vars)? {
            emission.labels.insert(labels::qualify_key(&key)?, value);
        }
        for (key, value) in &self.labels {
            emission
                .labels
                .insert(labels::qualify_key(key)?, value.clone());
        }
        for (key, value) in &emission.labels {
            labels::validate_value(key, value)?;
        }

        for (key, value) in self.expand(
            &self.extended_resources_tmpl,
            &self.extended_resources_template,
            &matched,
            vars,
        )? {
            emission
                .extended_resources
                .insert(labels::qualify_key(&key)?, value);
        }
        for (key, value) in &self.extended_resources {
            emission
                .extended_resources
                .insert(labels::qualify_key(key)?, value.clone());
        }

        for (key, value) in &self.annotations {
            let qualified = if key.contains('/') {
                key.clone()
            } else {
                format!("{}{}", labels::ANNOTATION_PREFIX, key)
            };
            labels::validate_key(&qualified)?;
            if labels::is_tracking_annotation(&qualified) {
                return Err(RuleError::Label(LabelError::InvalidKey {
                    key: qualified,
                    reason: "reserved tracking annotation".to_string(),
                }));
            }
            emission.annotations.insert(qualified, value.clone());
        }

        for (key, value) in self.expand(&self.vars_tmpl, &self.vars_template, &matched, vars)? {
            emission.vars.insert(key, value);
        }
        for (key, value) in &self.vars {
            emission.vars.insert(key.clone(), value.clone());
        }

        for taint in &self.taints {
            labels::validate_key(&taint.key)?;
            emission.taints.push(taint.clone());
        }

        Ok(Some(emission))
    }

    fn expand(
        &self,
        cached: &Option<Template>,
        source: &Option<String>,
        matched: &MatchedFeatures,
        vars: &BTreeMap<String, String>,
    ) -> Result<Vec<(String, String)>, RuleError> {
        let parsed;
        let template = match (cached, source) {
            (Some(template), _) => template,
            (None, Some(source)) => {
                parsed = Template::parse(source)?;
                &parsed
            }
            (None, None) => return Ok(Vec::new()),
        };
        Ok(parse_key_value_lines(&template.expand(matched, vars)?))
    }
}

/// Outcome of evaluating a rule list: emissions from strict rules and
/// from advisory rules, kept apart for precedence merging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSetOutcome {
    /// Emissions from strict rules (override worker-local values).
    pub strict: Emission,
    /// Emissions from advisory rules (yield to worker-local values).
    pub advisory: Emission,
}

/// A versioned, ordered rule list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    /// Monotonic version, bumped on every reload.
    #[serde(default)]
    pub version: u64,

    /// Rules in document order.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// Create a rule set.
    pub fn new(version: u64, rules: Vec<Rule>) -> Self {
        Self { version, rules }
    }

    /// Evaluate all rules in document order against a snapshot.
    ///
    /// A rule that fails evaluation (bad template lookup, invalid
    /// emitted key) is logged and skipped; other rules proceed.
    pub fn evaluate(&self, snapshot: &FeatureSnapshot) -> RuleSetOutcome {
        let mut vars: BTreeMap<String, String> = BTreeMap::new();
        let mut outcome = RuleSetOutcome::default();

        for rule in &self.rules {
            match rule.evaluate(snapshot, &vars) {
                Ok(Some(emission)) => {
                    log::debug!("rule {:?} matched", rule.name);
                    for (key, value) in &emission.vars {
                        vars.insert(key.clone(), value.clone());
                    }
                    if rule.advisory {
                        outcome.advisory.merge_from(&emission);
                    } else {
                        outcome.strict.merge_from(&emission);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("rule {:?} failed to evaluate: {}", rule.name, e);
                }
            }
        }
        outcome
    }
}

/// Parse a rule document (a YAML or JSON sequence of rule records).
///
/// Invalid rules are dropped and reported as diagnostics; valid rules
/// are returned validated and with their templates pre-parsed. A
/// document that fails to parse at all is an error.
pub fn parse_rule_document(doc: &str) -> Result<(Vec<Rule>, Vec<RuleError>), RuleError> {
    let rules: Vec<Rule> =
        serde_yaml::from_str(doc).map_err(|e| RuleError::Parse(e.to_string()))?;

    let mut valid = Vec::with_capacity(rules.len());
    let mut diagnostics = Vec::new();
    for mut rule in rules {
        match rule.validate() {
            Ok(()) => valid.push(rule),
            Err(e) => diagnostics.push(RuleError::InvalidRule {
                rule: rule.name.clone(),
                reason: e.to_string(),
            }),
        }
    }
    Ok((valid, diagnostics))
}
