// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Text templates for rule emissions.
//!
//! Templates expand against the elements matched by a rule's feature
//! terms plus the running variable context. The language is small:
//!
//! ```text
//! {{ .vars.NAME }}                  value of a rule variable
//! {{ .DOMAIN.FEATURE.KEY }}         matched attribute (or flag) value
//! {{ range .DOMAIN.FEATURE }}       iterate matched elements
//!   {{ .name }}                     flag name / attribute name
//!   {{ .value }}                    attribute value
//!   {{ .ATTR }}                     instance attribute
//! {{ end }}
//! ```
//!
//! Ranges do not nest. Templates are parsed at rule-load time; lookup
//! failures (an unmatched feature, an undefined variable) surface at
//! expansion time. Each non-empty line of the expanded text is parsed
//! as `key[=value]` with a default value of `"true"`.

use super::matcher::{MatchedElements, MatchedFeatures};
use super::RuleError;
use std::collections::BTreeMap;

/// A parsed emission template.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    nodes: Vec<Node>,
}

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    /// Dotted path with the leading `.` stripped.
    Lookup(String),
    Range {
        path: String,
        body: Vec<Node>,
    },
}

enum ElementCtx<'a> {
    Flag(&'a str),
    Attribute(&'a str, &'a str),
    Instance(&'a crate::snapshot::InstanceFeature),
}

struct Frame {
    range_path: Option<String>,
    nodes: Vec<Node>,
}

impl Template {
    /// Parse a template string.
    pub fn parse(source: &str) -> Result<Self, RuleError> {
        let mut frames = vec![Frame {
            range_path: None,
            nodes: Vec::new(),
        }];
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                push_text(&mut frames, &rest[..start]);
            }
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                RuleError::Template(format!("unclosed {{{{ in template {:?}", source))
            })?;
            let token = after[..end].trim();
            rest = &after[end + 2..];

            if let Some(range_arg) = token.strip_prefix("range ") {
                if frames.len() > 1 {
                    return Err(RuleError::Template(
                        "nested range is not supported".to_string(),
                    ));
                }
                frames.push(Frame {
                    range_path: Some(parse_path(range_arg.trim())?),
                    nodes: Vec::new(),
                });
            } else if token == "end" {
                let frame = match frames.pop() {
                    Some(frame) if frame.range_path.is_some() => frame,
                    _ => {
                        return Err(RuleError::Template(
                            "end without a matching range".to_string(),
                        ))
                    }
                };
                let path = frame.range_path.unwrap_or_default();
                push_node(
                    &mut frames,
                    Node::Range {
                        path,
                        body: frame.nodes,
                    },
                );
            } else {
                push_node(&mut frames, Node::Lookup(parse_path(token)?));
            }
        }
        if !rest.is_empty() {
            push_text(&mut frames, rest);
        }

        if frames.len() != 1 {
            return Err(RuleError::Template("range without end".to_string()));
        }
        let root = frames.remove(0);
        Ok(Self {
            source: source.to_string(),
            nodes: root.nodes,
        })
    }

    /// The original template text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Expand the template against matched features and variables.
    pub fn expand(
        &self,
        matched: &MatchedFeatures,
        vars: &BTreeMap<String, String>,
    ) -> Result<String, RuleError> {
        let mut out = String::new();
        expand_nodes(&self.nodes, matched, vars, None, &mut out)?;
        Ok(out)
    }
}

fn push_text(frames: &mut [Frame], text: &str) {
    if let Some(frame) = frames.last_mut() {
        frame.nodes.push(Node::Text(text.to_string()));
    }
}

fn push_node(frames: &mut [Frame], node: Node) {
    if let Some(frame) = frames.last_mut() {
        frame.nodes.push(node);
    }
}

fn parse_path(token: &str) -> Result<String, RuleError> {
    let path = token
        .strip_prefix('.')
        .ok_or_else(|| RuleError::Template(format!("expected a .path, got {:?}", token)))?;
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(RuleError::Template(format!("malformed path {:?}", token)));
    }
    Ok(path.to_string())
}

fn expand_nodes(
    nodes: &[Node],
    matched: &MatchedFeatures,
    vars: &BTreeMap<String, String>,
    element: Option<&ElementCtx<'_>>,
    out: &mut String,
) -> Result<(), RuleError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Lookup(path) => {
                out.push_str(&resolve_lookup(path, matched, vars, element)?);
            }
            Node::Range { path, body } => {
                let elements = matched.get(path).ok_or_else(|| {
                    RuleError::Template(format!("range over unmatched feature {:?}", path))
                })?;
                match elements {
                    MatchedElements::Flags(flags) => {
                        for name in flags {
                            let ctx = ElementCtx::Flag(name);
                            expand_nodes(body, matched, vars, Some(&ctx), out)?;
                        }
                    }
                    MatchedElements::Attributes(attrs) => {
                        for (name, value) in attrs {
                            let ctx = ElementCtx::Attribute(name, value);
                            expand_nodes(body, matched, vars, Some(&ctx), out)?;
                        }
                    }
                    MatchedElements::Instances(instances) => {
                        for instance in instances {
                            let ctx = ElementCtx::Instance(instance);
                            expand_nodes(body, matched, vars, Some(&ctx), out)?;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn resolve_lookup(
    path: &str,
    matched: &MatchedFeatures,
    vars: &BTreeMap<String, String>,
    element: Option<&ElementCtx<'_>>,
) -> Result<String, RuleError> {
    if let Some(name) = path.strip_prefix("vars.") {
        return vars
            .get(name)
            .cloned()
            .ok_or_else(|| RuleError::Template(format!("undefined variable {:?}", name)));
    }

    // Inside a range, bare names bind to the current element.
    if let Some(ctx) = element {
        if !path.contains('.') {
            return match ctx {
                ElementCtx::Flag(name) => match path {
                    "name" => Ok((*name).to_string()),
                    _ => Err(RuleError::Template(format!(
                        "flag elements expose only .name, got .{}",
                        path
                    ))),
                },
                ElementCtx::Attribute(name, value) => match path {
                    "name" => Ok((*name).to_string()),
                    "value" => Ok((*value).to_string()),
                    _ => Err(RuleError::Template(format!(
                        "attribute elements expose .name and .value, got .{}",
                        path
                    ))),
                },
                ElementCtx::Instance(instance) => {
                    instance.attribute(path).map(str::to_string).ok_or_else(|| {
                        RuleError::Template(format!("instance has no attribute {:?}", path))
                    })
                }
            };
        }
    }

    // `.domain.feature.key`: the longest matched feature ref wins so
    // feature names containing dots resolve correctly.
    let mut best: Option<(&str, &MatchedElements)> = None;
    for (feature_ref, elements) in matched {
        let is_prefix = path
            .strip_prefix(feature_ref.as_str())
            .map(|tail| tail.starts_with('.'))
            .unwrap_or(false);
        if is_prefix && best.map(|(r, _)| feature_ref.len() > r.len()).unwrap_or(true) {
            best = Some((feature_ref, elements));
        }
    }
    let (feature_ref, elements) = best.ok_or_else(|| {
        RuleError::Template(format!("lookup {:?} does not name a matched feature", path))
    })?;
    let key = &path[feature_ref.len() + 1..];

    match elements {
        MatchedElements::Flags(flags) => {
            if flags.contains(key) {
                Ok("true".to_string())
            } else {
                Err(RuleError::Template(format!(
                    "flag {:?} not matched in {:?}",
                    key, feature_ref
                )))
            }
        }
        MatchedElements::Attributes(attrs) => attrs.get(key).cloned().ok_or_else(|| {
            RuleError::Template(format!(
                "attribute {:?} not matched in {:?}",
                key, feature_ref
            ))
        }),
        MatchedElements::Instances(_) => Err(RuleError::Template(format!(
            "feature {:?} holds instances; use range",
            feature_ref
        ))),
    }
}

/// Parse expanded template output: one `key[=value]` per non-empty
/// line, defaulting the value to `"true"`.
pub fn parse_key_value_lines(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once('=') {
            Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
            None => (line.to_string(), "true".to_string()),
        })
        .collect()
}
