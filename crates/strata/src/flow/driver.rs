//! fixed-point driver
//!
//! Repeats full rewrite passes until one changes nothing, then strips
//! temporary nodes and aggregates remaining diagnostics. Passes are
//! bounded by tree size so cyclic references report instead of looping.

use crate::binding::{Binding, Features};
use crate::node::{Issue, Node, Value};
use crate::visit::VisitNodes;
use indexmap::IndexMap;
use std::fmt;

const PASS_FACTOR: usize = 4;
const PASS_MINIMUM: usize = 16;

/// A diagnostic bound to a document position.
#[derive(derive_new::new, Debug, Clone)]
pub struct FlowIssue {
    pub path: Vec<String>,
    pub source: String,
    pub issue: Issue,
}

impl fmt::Display for FlowIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() {
            "<root>".to_string()
        } else {
            self.path.join(".")
        };
        write!(f, "{path}: {} (in {})", self.issue, self.source)
    }
}

/// The aggregate result of a flow that did not fully resolve. The partial
/// output is still available for inspection.
#[derive(Debug)]
pub struct FlowError {
    pub node: Node,
    pub issues: Vec<FlowIssue>,
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flow failed with {} unresolved or erroneous node(s)",
            self.issues.len()
        )?;
        for issue in &self.issues {
            write!(f, "\n  {issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FlowError {}

/// Flows a source document against a sequence of stubs, first stub wins.
pub fn flow(source: &Node, stubs: &[Node]) -> Result<Node, FlowError> {
    flow_with(Features::default(), source, stubs)
}

/// Like [flow], with explicit feature switches.
pub fn flow_with(features: Features, source: &Node, stubs: &[Node]) -> Result<Node, FlowError> {
    let env = Binding::new(stubs.to_vec(), source.source_name(), features);
    let result = flow_to_fixed_point(source, &env);
    env.state().cleanup();
    finalize(result)
}

/// Runs a flow inside an outer environment: the outer binding's scope and
/// state are inherited, so templates and tags of the outer run stay
/// visible. Without an outer binding this is a plain [flow].
pub fn nested_flow(
    outer: Option<&Binding>,
    source: &Node,
    stubs: &[Node],
) -> Result<Node, FlowError> {
    match outer {
        None => flow(source, stubs),
        Some(outer) => {
            let env = outer.nested(stubs.to_vec(), source.source_name());
            // the outer environment owns the state and its cleanup
            finalize(flow_to_fixed_point(source, &env))
        }
    }
}

pub(crate) fn flow_to_fixed_point(source: &Node, env: &Binding) -> Node {
    let limit = source.node_count() * PASS_FACTOR + PASS_MINIMUM;
    let mut current = source.clone();
    for pass in 0..limit {
        let next = super::flow(&current, env, true, false);
        if next == current {
            tracing::debug!(pass, "fixed point reached");
            return next;
        }
        current = next;
    }
    tracing::debug!(limit, "pass limit exhausted");
    current
}

fn finalize(node: Node) -> Result<Node, FlowError> {
    let issues = collect_issues(&node);
    let cleaned = cleanup(&node);
    if issues.is_empty() {
        Ok(cleaned)
    } else {
        Err(FlowError {
            node: cleaned,
            issues,
        })
    }
}

fn collect_issues(node: &Node) -> Vec<FlowIssue> {
    let mut issues = Vec::new();
    node.visit_nodes(&mut |path: &[String], node: &Node| {
        if node.value().is_expression() || node.has_error() || node.has_failed() {
            let issue = if node.issue().is_empty() {
                Issue::new("node unresolved")
            } else {
                node.issue().clone()
            };
            issues.push(FlowIssue::new(
                path.to_vec(),
                node.source_name().to_string(),
                issue,
            ));
        }
    });
    issues
}

/// Strips nodes flagged temporary or local from the final containers.
fn cleanup(node: &Node) -> Node {
    fn keep(node: &Node) -> bool {
        !(node.flags().temporary() || node.flags().local())
    }

    match node.value() {
        Value::Object(map) => {
            let mut new_map = IndexMap::new();
            for (key, value) in map {
                if keep(value) {
                    new_map.insert(key.clone(), cleanup(value));
                }
            }
            Node::substitute(Value::Object(new_map), node)
        }
        Value::Array(items) => Node::substitute(
            Value::Array(
                items
                    .iter()
                    .filter(|item| keep(item))
                    .map(|item| cleanup(item))
                    .collect(),
            ),
            node,
        ),
        _ => node.clone(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::document::parse_document;

    #[test]
    fn cyclic_references_report_instead_of_looping() {
        let source = parse_document("a: (( b ))\nb: (( a ))\n", "cycle").unwrap();
        let err = flow(&source, &[]).unwrap_err();
        assert_eq!(err.issues.len(), 2);
        assert!(err.to_string().contains("unresolved"));
    }

    #[test]
    fn partial_output_is_preserved_on_error() {
        let source = parse_document("a: 1\nb: (( missing ))\n", "partial").unwrap();
        let err = flow(&source, &[]).unwrap_err();
        let map = err.node.value().as_object().unwrap();
        assert_eq!(map.get("a").unwrap().value(), &Value::Integer(1));
        assert!(map.get("b").unwrap().value().is_expression());
        assert_eq!(err.issues.len(), 1);
        assert_eq!(err.issues[0].path, vec!["b".to_string()]);
    }
}
