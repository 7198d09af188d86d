// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Match expressions: the leaves of the rule expression tree.
//!
//! An expression is an `(op, value-list)` pair evaluated against one
//! input value that may be absent. Value lists are canonicalized at
//! load time: booleans become `"true"`/`"false"`, numbers their
//! shortest decimal form, and bare scalars a one-element list, so a
//! rule author can write `value: 4096` and `value: ["4096"]`
//! interchangeably.

use super::RuleError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

/// Match operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOp {
    /// Always true.
    Any,
    /// Input is one of the listed values.
    In,
    /// Input is none of the listed values.
    NotIn,
    /// Input matches at least one of the listed regexes.
    InRegexp,
    /// Input is present.
    Exists,
    /// Input is absent.
    DoesNotExist,
    /// Input parses as an integer greater than the listed value.
    Gt,
    /// Input parses as an integer less than the listed value.
    Lt,
    /// Input parses as an integer strictly between the two listed values.
    GtLt,
    /// Input is the string "true".
    IsTrue,
    /// Input is the string "false".
    IsFalse,
}

/// Canonicalized expression value list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MatchValue(pub Vec<String>);

impl MatchValue {
    /// Number of values.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no values were given.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for MatchValue {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

// Rule documents come from YAML/JSON where scalars are dynamically
// typed; canonicalize on the way in.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawValue {
    List(Vec<RawScalar>),
    One(RawScalar),
}

impl RawScalar {
    fn canonicalize(self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(n) => n.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s,
        }
    }
}

impl<'de> Deserialize<'de> for MatchValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawValue::deserialize(deserializer)?;
        let values = match raw {
            RawValue::List(list) => list.into_iter().map(RawScalar::canonicalize).collect(),
            RawValue::One(scalar) => vec![scalar.canonicalize()],
        };
        Ok(Self(values))
    }
}

/// A single match expression.
///
/// Hand-constructed expressions should be run through [`validate`]
/// before evaluation; the rule loader does this for every expression
/// in a rule document. Validation also caches compiled regexes for
/// `InRegexp`.
///
/// [`validate`]: MatchExpression::validate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchExpression {
    /// Operator to apply.
    pub op: MatchOp,

    /// Operand values; arity depends on the operator.
    #[serde(default)]
    pub value: MatchValue,

    #[serde(skip)]
    compiled: Vec<Regex>,
}

impl MatchExpression {
    /// Create an expression from an operator and values.
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(op: MatchOp, value: I) -> Self {
        Self {
            op,
            value: value.into_iter().collect(),
            compiled: Vec::new(),
        }
    }

    /// Create a zero-operand expression.
    pub fn bare(op: MatchOp) -> Self {
        Self::new(op, Vec::<String>::new())
    }

    /// Validate operator arity and operand types; compile and cache
    /// `InRegexp` patterns.
    pub fn validate(&mut self) -> Result<(), RuleError> {
        match self.op {
            MatchOp::Any | MatchOp::Exists | MatchOp::DoesNotExist | MatchOp::IsTrue
            | MatchOp::IsFalse => {
                if !self.value.is_empty() {
                    return Err(RuleError::InvalidExpression(format!(
                        "{:?} takes no values, got {}",
                        self.op,
                        self.value.len()
                    )));
                }
            }
            MatchOp::In | MatchOp::NotIn => {
                if self.value.is_empty() {
                    return Err(RuleError::InvalidExpression(format!(
                        "{:?} requires at least one value",
                        self.op
                    )));
                }
            }
            MatchOp::InRegexp => {
                if self.value.is_empty() {
                    return Err(RuleError::InvalidExpression(
                        "InRegexp requires at least one value".to_string(),
                    ));
                }
                self.compiled = compile_regexes(&self.value.0)?;
            }
            MatchOp::Gt | MatchOp::Lt => {
                if self.value.len() != 1 {
                    return Err(RuleError::InvalidExpression(format!(
                        "{:?} requires exactly one value, got {}",
                        self.op,
                        self.value.len()
                    )));
                }
                parse_int(&self.value.0[0])?;
            }
            MatchOp::GtLt => {
                if self.value.len() != 2 {
                    return Err(RuleError::InvalidExpression(format!(
                        "GtLt requires exactly two values, got {}",
                        self.value.len()
                    )));
                }
                let low = parse_int(&self.value.0[0])?;
                let high = parse_int(&self.value.0[1])?;
                if low >= high {
                    return Err(RuleError::InvalidExpression(format!(
                        "GtLt bounds must satisfy {} < {}",
                        low, high
                    )));
                }
            }
        }
        Ok(())
    }

    /// Evaluate the expression against an input value.
    ///
    /// `None` means the input is absent: only `Any` and
    /// `DoesNotExist` match an absent input. Integer operators return
    /// a `TypeMismatch` error when a present input does not parse.
    pub fn match_value(&self, value: Option<&str>) -> Result<bool, RuleError> {
        let matched = match self.op {
            MatchOp::Any => true,
            MatchOp::Exists => value.is_some(),
            MatchOp::DoesNotExist => value.is_none(),
            MatchOp::In => match value {
                Some(v) => self.value.0.iter().any(|candidate| candidate == v),
                None => false,
            },
            MatchOp::NotIn => match value {
                Some(v) => !self.value.0.iter().any(|candidate| candidate == v),
                None => false,
            },
            MatchOp::InRegexp => match value {
                Some(v) => {
                    let tmp: Vec<Regex>;
                    let regexes: &[Regex] = if self.compiled.len() == self.value.len() {
                        &self.compiled
                    } else {
                        tmp = compile_regexes(&self.value.0)?;
                        &tmp
                    };
                    regexes.iter().any(|re| re.is_match(v))
                }
                None => false,
            },
            MatchOp::Gt => match value {
                Some(v) => parse_int(v)? > self.bound(0)?,
                None => false,
            },
            MatchOp::Lt => match value {
                Some(v) => parse_int(v)? < self.bound(0)?,
                None => false,
            },
            MatchOp::GtLt => match value {
                Some(v) => {
                    let n = parse_int(v)?;
                    self.bound(0)? < n && n < self.bound(1)?
                }
                None => false,
            },
            MatchOp::IsTrue => value == Some("true"),
            MatchOp::IsFalse => value == Some("false"),
        };
        Ok(matched)
    }

    /// Evaluate the expression against an element name.
    pub fn match_name(&self, name: &str) -> Result<bool, RuleError> {
        self.match_value(Some(name))
    }

    fn bound(&self, idx: usize) -> Result<i64, RuleError> {
        let raw = self.value.0.get(idx).ok_or_else(|| {
            RuleError::InvalidExpression(format!("{:?} is missing operand {}", self.op, idx))
        })?;
        parse_int(raw)
    }
}

fn compile_regexes(patterns: &[String]) -> Result<Vec<Regex>, RuleError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|e| RuleError::InvalidRegex {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

fn parse_int(s: &str) -> Result<i64, RuleError> {
    s.trim()
        .parse::<i64>()
        .map_err(|_| RuleError::TypeMismatch(format!("{:?} is not an integer", s)))
}
