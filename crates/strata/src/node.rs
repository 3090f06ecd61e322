//! annotated node model
//!
//! Every value handled by the engine is a [Node]: a polymorphic [Value]
//! together with the name of the document it came from and an [Annotation]
//! envelope. Rewrites never mutate in place; the builder methods consume a
//! node and return the updated one.

use crate::binding::Binding;
use crate::expr::Expr;
use indexmap::IndexMap;
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use std::fmt;

/// Bit flags carried in a node's annotation.
///
/// Flags accumulate with `|` and survive value substitution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags(u16);

impl NodeFlags {
    /// Node is dropped from the final output.
    pub const TEMPORARY: NodeFlags = NodeFlags(1 << 0);
    /// Like `TEMPORARY`, but also invisible to stub overrides.
    pub const LOCAL: NodeFlags = NodeFlags(1 << 1);
    /// Value carried over from a former processing state.
    pub const STATE: NodeFlags = NodeFlags(1 << 2);
    /// Stub value only applies where the source has no own value.
    pub const DEFAULT: NodeFlags = NodeFlags(1 << 3);
    /// Stub entry is copied into the source even without a merge.
    pub const INJECT: NodeFlags = NodeFlags(1 << 4);
    /// Entry was produced by injection or an explicit merge.
    pub const INJECTED: NodeFlags = NodeFlags(1 << 5);
    /// Flag was propagated from a flagged parent.
    pub const IMPLIED: NodeFlags = NodeFlags(1 << 6);
    /// Template value is re-materialized on every access.
    pub const DYNAMIC: NodeFlags = NodeFlags(1 << 7);
    /// Value was substituted from a stub.
    pub const OVERRIDDEN: NodeFlags = NodeFlags(1 << 8);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: NodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: NodeFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn temporary(self) -> bool {
        self.contains(Self::TEMPORARY)
    }

    pub fn local(self) -> bool {
        self.contains(Self::LOCAL)
    }

    pub fn state(self) -> bool {
        self.contains(Self::STATE)
    }

    pub fn default_flag(self) -> bool {
        self.contains(Self::DEFAULT)
    }

    pub fn inject(self) -> bool {
        self.contains(Self::INJECT)
    }

    pub fn injected(self) -> bool {
        self.contains(Self::INJECTED)
    }

    pub fn dynamic(self) -> bool {
        self.contains(Self::DYNAMIC)
    }

    /// Flags a stub node passes on to the overriding source map.
    pub fn inherited(self) -> NodeFlags {
        NodeFlags(self.0 & (Self::TEMPORARY.0 | Self::STATE.0))
    }

    /// Whether children of a node with these flags receive `IMPLIED`.
    pub fn propagate_implied(self) -> bool {
        self.intersects(NodeFlags(
            Self::TEMPORARY.0 | Self::LOCAL.0 | Self::STATE.0,
        ))
    }
}

impl std::ops::BitOr for NodeFlags {
    type Output = NodeFlags;

    fn bitor(self, rhs: NodeFlags) -> NodeFlags {
        NodeFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for NodeFlags {
    fn bitor_assign(&mut self, rhs: NodeFlags) {
        self.0 |= rhs.0;
    }
}

/// A diagnostic message with nested sub-issues.
///
/// Issues preserve subtree structure: a failing `for` body, for example,
/// nests one issue per failing iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Issue {
    pub message: String,
    pub nested: Vec<Issue>,
}

impl Issue {
    pub fn new(message: impl Into<String>) -> Issue {
        Issue {
            message: message.into(),
            nested: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.message.is_empty() && self.nested.is_empty()
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for nested in &self.nested {
            write!(f, "\n  {nested}")?;
        }
        Ok(())
    }
}

/// A captured subtree plus the binding active at capture time.
///
/// Templates are materialized lazily by substitution expressions; the
/// captured binding deliberately excludes the scope introduced by the
/// template's own map.
#[derive(Debug, Clone)]
pub struct TemplateValue {
    pub path: Vec<String>,
    pub node: Box<Node>,
    pub binding: Binding,
}

impl TemplateValue {
    pub fn new(path: Vec<String>, node: Node, binding: Binding) -> TemplateValue {
        TemplateValue {
            path,
            node: Box::new(node),
            binding,
        }
    }
}

// binding identity is not part of template equality
impl PartialEq for TemplateValue {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.node == other.node
    }
}

/// All possible value kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    String(String),
    Array(Vec<Node>),
    Object(IndexMap<String, Node>),
    /// An unevaluated embedded expression.
    Expression(Expr),
    /// A deferred subtree with its captured binding.
    Template(TemplateValue),
}

impl Value {
    /// Value kind for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::Array(_) => "list",
            Value::Object(_) => "map",
            Value::Expression(_) => "expression",
            Value::Template(_) => "template",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_expression(&self) -> bool {
        matches!(self, Value::Expression(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Node>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Node]> {
        match self {
            Value::Array(l) => Some(l),
            _ => None,
        }
    }
}

/// The annotation envelope carried on every node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Annotation {
    redirect_path: Option<Vec<String>>,
    replace: bool,
    preferred: bool,
    merged: bool,
    key_name: Option<String>,
    error: bool,
    failed: bool,
    undefined: bool,
    issue: Issue,
    tag: Option<String>,
    flags: NodeFlags,
    template: Option<Box<TemplateValue>>,
}

impl Annotation {
    pub fn redirect_path(&self) -> Option<&[String]> {
        self.redirect_path.as_deref()
    }

    pub fn has_replace(&self) -> bool {
        self.replace
    }

    pub fn is_preferred(&self) -> bool {
        self.preferred
    }

    /// Merged nodes are not candidates for stub override. Replaced and
    /// redirected nodes count as merged.
    pub fn is_merged(&self) -> bool {
        self.merged || self.replace || self.redirect_path.is_some()
    }

    pub fn key_name(&self) -> Option<&str> {
        self.key_name.as_deref()
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn is_undefined(&self) -> bool {
        self.undefined
    }

    pub fn issue(&self) -> &Issue {
        &self.issue
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn template(&self) -> Option<&TemplateValue> {
        self.template.as_deref()
    }
}

/// An annotated document value.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    value: Value,
    source_name: String,
    annotation: Annotation,
}

impl Node {
    pub fn new(value: Value, source_name: &str) -> Node {
        Node {
            value,
            source_name: source_name.to_string(),
            annotation: Annotation::default(),
        }
    }

    /// New value, same source and annotation.
    pub fn substitute(value: Value, node: &Node) -> Node {
        Node {
            value,
            source_name: node.source_name.clone(),
            annotation: node.annotation.clone(),
        }
    }

    /// New value plus a redirect for subsequent stub lookups.
    pub fn redirect(value: Value, node: &Node, redirect: Option<Vec<String>>) -> Node {
        let mut node = Node::substitute(value, node);
        if redirect.is_some() {
            node.annotation.redirect_path = redirect;
        }
        node
    }

    /// New value that fully replaces the stub's value for this subtree.
    pub fn replace(value: Value, node: &Node, redirect: Option<Vec<String>>) -> Node {
        let mut node = Node::redirect(value, node, redirect);
        node.annotation.replace = true;
        node
    }

    /// A resolved value that retains its pre-evaluation template.
    pub fn dynamic(value: Value, template: TemplateValue, source_name: &str) -> Node {
        let mut node = Node::new(value, source_name);
        node.annotation.template = Some(Box::new(template));
        node
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn annotation(&self) -> &Annotation {
        &self.annotation
    }

    pub fn redirect_path(&self) -> Option<&[String]> {
        self.annotation.redirect_path()
    }

    pub fn has_replace(&self) -> bool {
        self.annotation.has_replace()
    }

    pub fn is_preferred(&self) -> bool {
        self.annotation.is_preferred()
    }

    pub fn is_merged(&self) -> bool {
        self.annotation.is_merged()
    }

    pub fn key_name(&self) -> Option<&str> {
        self.annotation.key_name()
    }

    pub fn has_error(&self) -> bool {
        self.annotation.has_error()
    }

    pub fn has_failed(&self) -> bool {
        self.annotation.has_failed()
    }

    pub fn is_undefined(&self) -> bool {
        self.annotation.is_undefined()
    }

    pub fn issue(&self) -> &Issue {
        self.annotation.issue()
    }

    pub fn tag(&self) -> Option<&str> {
        self.annotation.tag()
    }

    pub fn flags(&self) -> NodeFlags {
        self.annotation.flags()
    }

    pub fn template(&self) -> Option<&TemplateValue> {
        self.annotation.template()
    }

    pub fn preferred(mut self) -> Node {
        self.annotation.preferred = true;
        self
    }

    pub fn merged(mut self) -> Node {
        self.annotation.merged = true;
        self
    }

    pub fn undefined(mut self) -> Node {
        self.annotation.undefined = true;
        self
    }

    /// Sets the list identity key; an empty name is a no-op.
    pub fn keyed(mut self, key_name: &str) -> Node {
        if !key_name.is_empty() {
            self.annotation.key_name = Some(key_name.to_string());
        }
        self
    }

    pub fn tagged(mut self, tag: &str) -> Node {
        if !tag.is_empty() {
            self.annotation.tag = Some(tag.to_string());
        }
        self
    }

    pub fn flagged(mut self, flags: NodeFlags) -> Node {
        self.annotation.flags |= flags;
        self
    }

    /// Attaches a diagnostic; an empty issue only updates the error and
    /// failed markers.
    pub fn issued(mut self, error: bool, failed: bool, issue: Issue) -> Node {
        if !issue.is_empty() {
            self.annotation.issue = issue;
        }
        self.annotation.error = error;
        self.annotation.failed = failed;
        self
    }

    /// True when no in-document directive (replace or redirect) excluded
    /// this node from the standard stub override.
    pub fn standard_override(&self) -> bool {
        !self.annotation.replace && self.annotation.redirect_path.is_none()
    }

    /// True when the subtree contains no unevaluated expression.
    pub fn is_resolved(&self) -> bool {
        match &self.value {
            Value::Expression(_) => false,
            Value::Array(items) => items.iter().all(Node::is_resolved),
            Value::Object(map) => map.values().all(Node::is_resolved),
            _ => true,
        }
    }

    /// Number of nodes in the subtree, used to bound the pass count.
    pub fn node_count(&self) -> usize {
        match &self.value {
            Value::Array(items) => 1 + items.iter().map(Node::node_count).sum::<usize>(),
            Value::Object(map) => 1 + map.values().map(Node::node_count).sum::<usize>(),
            _ => 1,
        }
    }

    /// Structural value comparison that ignores annotations.
    pub fn equivalent(&self, other: &Node) -> bool {
        match (&self.value, &other.value) {
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equivalent(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| match b.get(k) {
                        Some(o) => v.equivalent(o),
                        None => false,
                    })
            }
            (a, b) => a == b,
        }
    }
}

/// Map keys in sorted order; the engine always iterates maps this way.
pub fn sorted_keys(map: &IndexMap<String, Node>) -> Vec<String> {
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort();
    keys
}

/// Resolves one path step against a node.
///
/// Steps are either plain map keys, list indices (`[2]`), or list identity
/// selectors (`name:frontend` selects the map entry whose `name` field is
/// the string `frontend`).
pub fn follow_step<'a>(node: &'a Node, step: &str) -> Option<&'a Node> {
    match node.value() {
        Value::Object(map) => map.get(step),
        Value::Array(items) => {
            if let Some(index) = step.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                let index: usize = index.parse().ok()?;
                return items.get(index);
            }
            let (field, wanted) = step.split_once(':')?;
            items.iter().find(|item| {
                find_field(item, field).and_then(|n| n.value().as_str()) == Some(wanted)
            })
        }
        _ => None,
    }
}

/// Resolves a full path of steps against a node.
pub fn find_path<'a>(mut node: &'a Node, path: &[String]) -> Option<&'a Node> {
    for step in path {
        node = follow_step(node, step)?;
    }
    Some(node)
}

/// Direct field lookup in a map node, returning the raw entry.
pub fn find_field<'a>(node: &'a Node, field: &str) -> Option<&'a Node> {
    node.value().as_object().and_then(|map| map.get(field))
}

/// Field lookup that only yields resolved string values.
pub fn find_string_field<'a>(node: &'a Node, field: &str) -> Option<&'a str> {
    find_field(node, field).and_then(|n| n.value().as_str())
}

impl serde::Serialize for Node {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.value() {
            Value::Null => serializer.serialize_unit(),
            Value::Boolean(value) => serializer.serialize_bool(*value),
            Value::Integer(value) => serializer.serialize_i64(*value),
            Value::Decimal(value) => serializer.serialize_f64(*value),
            Value::String(value) => serializer.serialize_str(value),
            Value::Array(items) => {
                let mut ser = serializer.serialize_seq(Some(items.len()))?;
                for element in items {
                    ser.serialize_element(element)?;
                }
                ser.end()
            }
            Value::Object(map) => {
                let mut ser = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    ser.serialize_entry(key, value)?;
                }
                ser.end()
            }
            Value::Expression(expr) => serializer.serialize_str(&format!("(( {expr} ))")),
            Value::Template(_) => serializer.serialize_str("<template>"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(value: Value) -> Node {
        Node::new(value, "test")
    }

    #[test]
    fn flags_accumulate() {
        let flags = NodeFlags::TEMPORARY | NodeFlags::INJECT;
        assert!(flags.temporary());
        assert!(flags.inject());
        assert!(!flags.dynamic());
        assert_eq!(flags.inherited(), NodeFlags::TEMPORARY);
    }

    #[test]
    fn merged_includes_replace_and_redirect() {
        let n = node(Value::Integer(1));
        assert!(!n.is_merged());
        let replaced = Node::replace(Value::Integer(1), &n, None);
        assert!(replaced.is_merged());
        let redirected = Node::redirect(Value::Integer(1), &n, Some(vec!["a".into()]));
        assert!(redirected.is_merged());
    }

    #[test]
    fn step_lookup() {
        let mut inner = IndexMap::new();
        inner.insert("name".to_string(), node(Value::String("one".into())));
        inner.insert("v".to_string(), node(Value::Integer(1)));
        let list = node(Value::Array(vec![node(Value::Object(inner))]));

        let by_index = follow_step(&list, "[0]").unwrap();
        assert!(by_index.value().is_object());
        let by_name = follow_step(&list, "name:one").unwrap();
        assert!(by_name.equivalent(by_index));
        assert!(follow_step(&list, "name:two").is_none());
    }

    #[test]
    fn equivalence_ignores_annotations() {
        let a = node(Value::Integer(4));
        let b = node(Value::Integer(4)).merged().flagged(NodeFlags::TEMPORARY);
        assert!(a.equivalent(&b));
        assert!(a != b);
    }
}
