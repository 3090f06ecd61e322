//! control dispatch
//!
//! A map is a control node when exactly one of its keys matches a
//! registered control name. Residual keys are partitioned into fields and
//! options (`*`-prefixed in the registration); option values are treated as
//! templates so handlers can re-evaluate them per iteration.

use crate::binding::Binding;
use crate::expr::Expr;
use crate::node::{sorted_keys, Issue, Node, Value};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::cell::RefCell;
use std::collections::HashMap;

static NAME_SYNTAX: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-zA-Z0-9_]+$").unwrap());

/// Handler contract: control value, containing node, fields, options,
/// binding. A false second result means "not yet evaluable, retry".
pub type ControlHandler = fn(
    &Node,
    &Node,
    &IndexMap<String, Node>,
    &IndexMap<String, Node>,
    &Binding,
) -> (Node, bool);

#[derive(Debug, Clone)]
pub struct Control {
    pub name: String,
    options: Vec<String>,
    fields: Vec<String>,
    handler: ControlHandler,
}

impl Control {
    fn is_option(&self, key: &str) -> bool {
        self.options.iter().any(|option| option == key)
    }

    fn is_declared_field(&self, key: &str) -> bool {
        self.fields.iter().any(|field| field == key)
    }
}

/// Registered control constructs; extension point for embedders.
#[derive(Debug, Default)]
pub struct ControlRegistry {
    controls: RefCell<HashMap<String, Control>>,
}

impl ControlRegistry {
    pub fn with_builtins() -> ControlRegistry {
        let registry = ControlRegistry::default();
        registry.register("for", flow_for, &["*do", "*mapkey"]);
        registry
    }

    /// Registers a control. `*`-prefixed specs declare options, plain
    /// specs declare allowed regular fields.
    pub fn register(&self, name: &str, handler: ControlHandler, specs: &[&str]) {
        let mut options = Vec::new();
        let mut fields = Vec::new();
        for spec in specs {
            match spec.strip_prefix('*') {
                Some(option) => options.push(option.to_string()),
                None => fields.push(spec.to_string()),
            }
        }
        self.controls.borrow_mut().insert(
            name.to_string(),
            Control {
                name: name.to_string(),
                options,
                fields,
                handler,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Control> {
        self.controls.borrow().get(name).cloned()
    }
}

/// Classifies a map node as a control node. Two keys naming different
/// controls are an error.
pub(crate) fn is_control(node: &Node, env: &Binding) -> Result<bool, String> {
    let Some(map) = node.value().as_object() else {
        return Ok(false);
    };
    let mut found: Option<&str> = None;
    for key in map.keys() {
        if env.state().controls().get(key).is_some() {
            if let Some(existing) = found {
                return Err(format!(
                    "ambiguous control: '{existing}' and '{key}' in one map"
                ));
            }
            found = Some(key);
        }
    }
    Ok(found.is_some())
}

fn find_control(map: &IndexMap<String, Node>, env: &Binding) -> Option<Control> {
    for key in map.keys() {
        if let Some(control) = env.state().controls().get(key) {
            return Some(control);
        }
    }
    None
}

/// Whether a map key's value must be captured as a template: true for the
/// option keys of the control the map belongs to.
pub(crate) fn requires_template(key: &str, map: &IndexMap<String, Node>, env: &Binding) -> bool {
    match find_control(map, env) {
        Some(control) => key != control.name && control.is_option(key),
        None => false,
    }
}

/// Dispatches a flowed map to its control handler, if any.
pub(crate) fn flow_control(node: Node, undefined: &IndexMap<String, Node>, env: &Binding) -> Node {
    let Some(map) = node.value().as_object() else {
        return node;
    };
    let Some(control) = find_control(map, env) else {
        return node;
    };
    tracing::trace!(control = %control.name, path = ?env.path(), "control dispatch");

    let mut fields = IndexMap::new();
    let mut options = IndexMap::new();
    for (key, value) in map {
        if *key == control.name {
            continue;
        }
        if control.is_option(key) {
            options.insert(key.clone(), value.clone());
        } else {
            if !control.is_declared_field(key) {
                tracing::trace!(key = %key, "undeclared control field");
            }
            fields.insert(key.clone(), value.clone());
        }
    }
    if !undefined.is_empty() {
        tracing::trace!(keys = ?undefined.keys().collect::<Vec<_>>(), "undefined control entries");
    }

    let Some(value) = map.get(&control.name) else {
        return node;
    };
    let (result, _) = (control.handler)(value, &node, &fields, &options, env);
    result
}

fn control_issue(name: &str, node: &Node, message: impl Into<String>) -> (Node, bool) {
    let issue = Issue::new(format!("{name} control: {}", message.into()));
    (node.clone().issued(true, true, issue), true)
}

fn control_issue_nested(name: &str, node: &Node, mut issue: Issue) -> (Node, bool) {
    issue.message = format!("{name} control: {}", issue.message);
    (node.clone().issued(true, true, issue), true)
}

// ── the `for` control ───────────────────────────────────────────────

#[derive(Debug)]
enum ControlIterator {
    List(Vec<Node>),
    Map(Vec<(String, Node)>),
}

impl ControlIterator {
    fn len(&self) -> usize {
        match self {
            ControlIterator::List(items) => items.len(),
            ControlIterator::Map(pairs) => pairs.len(),
        }
    }

    fn index_value(&self, i: usize) -> Value {
        match self {
            ControlIterator::List(_) => Value::Integer(i as i64),
            ControlIterator::Map(pairs) => Value::String(pairs[i].0.clone()),
        }
    }

    fn value(&self, i: usize) -> Node {
        match self {
            ControlIterator::List(items) => items[i].clone(),
            ControlIterator::Map(pairs) => pairs[i].1.clone(),
        }
    }
}

#[derive(Debug)]
struct Iteration {
    name: String,
    index_name: String,
    current: usize,
    values: ControlIterator,
}

fn check_name(kind: &str, name: &str) -> Result<(), String> {
    if !NAME_SYNTAX.is_match(name) {
        return Err(format!(
            "invalid {kind} variable name {name:?} (must match {})",
            NAME_SYNTAX.as_str()
        ));
    }
    Ok(())
}

fn control_iterator(name: &str, values: &Node) -> Result<ControlIterator, String> {
    match values.value() {
        Value::Array(items) => Ok(ControlIterator::List(items.clone())),
        Value::Object(map) => {
            let mut pairs = Vec::with_capacity(map.len());
            for key in sorted_keys(map) {
                if let Some(value) = map.get(&key) {
                    let value = value.clone();
                    pairs.push((key, value));
                }
            }
            Ok(ControlIterator::Map(pairs))
        }
        other => Err(format!(
            "control variable '{name}' requires list or map value, but got {}",
            other.kind()
        )),
    }
}

fn control_iteration(name: &str, index: &str, values: &Node) -> Result<Iteration, String> {
    check_name("range", name)?;
    let index_name = if index.is_empty() {
        format!("index-{name}")
    } else {
        check_name("index", index)?;
        index.to_string()
    };
    Ok(Iteration {
        name: name.to_string(),
        index_name,
        current: 0,
        values: control_iterator(name, values)?,
    })
}

/// Iteration ranges from the `for` value: either the map form
/// `{ "<var>" | "<idxvar>,<var>": <list-or-map> }` or the list form of
/// `{name, values, index?}` entries. Ranges sort by variable name; the
/// last one varies fastest.
fn for_ranges(val: &Node) -> Result<Vec<Iteration>, String> {
    let mut ranges = Vec::new();
    match val.value() {
        Value::Object(def) => {
            for key in sorted_keys(def) {
                let Some(values) = def.get(&key) else {
                    continue;
                };
                let parts: Vec<&str> = key.split(',').collect();
                let (index, name) = match parts.as_slice() {
                    [name] => ("", name.trim()),
                    [index, name] => (index.trim(), name.trim()),
                    _ => return Err(format!("invalid control variable spec {key:?}")),
                };
                ranges.push(control_iteration(name, index, values)?);
            }
        }
        Value::Array(def) => {
            for entry in def {
                let Some(spec) = entry.value().as_object() else {
                    return Err(format!(
                        "control variable list entry requires a map but got {}",
                        entry.value().kind()
                    ));
                };
                let name = match spec.get("name").map(Node::value) {
                    Some(Value::String(name)) => name.clone(),
                    Some(other) => {
                        return Err(format!(
                            "control variable name must be of type string but got {}",
                            other.kind()
                        ))
                    }
                    None => {
                        return Err("control variable list entry requires name field".to_string())
                    }
                };
                let index = match spec.get("index").map(Node::value) {
                    Some(Value::String(index)) => index.clone(),
                    Some(other) => {
                        return Err(format!(
                            "control index variable name must be of type string but got {}",
                            other.kind()
                        ))
                    }
                    None => String::new(),
                };
                let Some(values) = spec.get("values") else {
                    return Err("control variable list entry requires values field".to_string());
                };
                if spec.len() > 3 {
                    return Err(
                        "control variable list entry requires two or three fields: name, values and optionally index"
                            .to_string(),
                    );
                }
                for key in spec.keys() {
                    if !matches!(key.as_str(), "name" | "values" | "index") {
                        return Err(format!("invalid control variable list entry field {key:?}"));
                    }
                }
                ranges.push(control_iteration(&name, &index, values)?);
            }
        }
        other => {
            return Err(format!(
                "value field must be map or list but got {}",
                other.kind()
            ))
        }
    }
    Ok(ranges)
}

fn substitution_of(template: &crate::node::TemplateValue) -> Expr {
    Expr::Substitution {
        target: Box::new(Expr::TemplateRef(Box::new(template.clone()))),
        scope: Vec::new(),
    }
}

fn short_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{s:?}"),
        Value::Integer(v) => v.to_string(),
        Value::Decimal(v) => v.to_string(),
        Value::Boolean(v) => v.to_string(),
        Value::Null => "nil".to_string(),
        other => format!("<{}>", other.kind()),
    }
}

fn variables_issue(ranges: &[Iteration], issue: Issue) -> Issue {
    let mut desc = String::from("control variables:");
    let mut sep = " ";
    for range in ranges {
        desc.push_str(&format!(
            "{sep}{}[{}]={}",
            range.name,
            short_value(&range.values.index_value(range.current)),
            short_value(range.values.value(range.current).value()),
        ));
        sep = "; ";
    }
    Issue {
        message: format!("{desc}: {}", issue.message),
        nested: issue.nested,
    }
}

fn flow_for(
    val: &Node,
    node: &Node,
    fields: &IndexMap<String, Node>,
    opts: &IndexMap<String, Node>,
    env: &Binding,
) -> (Node, bool) {
    if !fields.is_empty() {
        return control_issue("for", node, "no regular fields allowed in for control");
    }
    if !val.is_resolved() {
        return (node.clone(), false);
    }
    let Some(body) = opts.get("do") else {
        return control_issue("for", node, "do field required in for control");
    };
    if !body.is_resolved() {
        return (node.clone(), false);
    }

    let mapkey = match opts.get("mapkey") {
        None => None,
        Some(key) => {
            if !key.is_resolved() {
                return (node.clone(), false);
            }
            match key.value() {
                Value::Template(template) => Some(substitution_of(template)),
                _ => return control_issue("for", node, "mapkey must be a template expression"),
            }
        }
    };

    let subst = match body.value() {
        Value::Template(template) => Some(substitution_of(template)),
        _ => None,
    };

    let mut ranges = match for_ranges(val) {
        Ok(ranges) => ranges,
        Err(message) => return control_issue("for", node, message),
    };
    ranges.sort_by(|a, b| a.name.cmp(&b.name));

    let mut result_list: Vec<Node> = Vec::new();
    let mut result_map: IndexMap<String, Node> = IndexMap::new();
    let mut done = true;
    let mut issue = Issue::default();

    if ranges.iter().all(|range| range.values.len() > 0) {
        'outer: loop {
            let mut inp = IndexMap::new();
            for range in &ranges {
                inp.insert(range.name.clone(), range.values.value(range.current));
                inp.insert(
                    range.index_name.clone(),
                    Node::new(range.values.index_value(range.current), "for"),
                );
            }
            let scope = env.with_local_scope(inp);

            let mut key = String::new();
            let mut entry_ok = true;
            if let Some(mapkey) = &mapkey {
                let (value, info, ok) = mapkey.evaluate(&scope, false);
                if !ok {
                    done = false;
                    entry_ok = false;
                    if !info.issue.is_empty() {
                        issue.nested.push(variables_issue(&ranges, info.issue));
                    }
                } else {
                    match value {
                        Some(Value::String(name)) => key = name,
                        other => {
                            done = false;
                            entry_ok = false;
                            let kind = other.map(|v| v.kind()).unwrap_or("null");
                            issue.nested.push(variables_issue(
                                &ranges,
                                Issue::new(format!(
                                    "map key must be a string, but found {kind}"
                                )),
                            ));
                        }
                    }
                }
            }

            if entry_ok {
                match &subst {
                    Some(subst) => {
                        let (value, info, ok) = subst.evaluate(&scope, false);
                        if !ok {
                            done = false;
                            if !info.issue.is_empty() {
                                issue.nested.push(variables_issue(&ranges, info.issue));
                            }
                        } else {
                            let value = value.unwrap_or(Value::Null);
                            if mapkey.is_some() {
                                result_map.insert(key, Node::new(value, node.source_name()));
                            } else {
                                result_list.push(Node::new(value, node.source_name()));
                            }
                        }
                    }
                    None => {
                        if mapkey.is_some() {
                            result_map.insert(key, body.clone());
                        } else {
                            result_list.push(body.clone());
                        }
                    }
                }
            }

            // odometer: last range varies fastest
            let mut idx = ranges.len();
            loop {
                if idx == 0 {
                    break 'outer;
                }
                idx -= 1;
                ranges[idx].current += 1;
                if ranges[idx].current < ranges[idx].values.len() {
                    break;
                }
                ranges[idx].current = 0;
            }
        }
    }

    if !done {
        if !issue.nested.is_empty() {
            issue.message = "error evaluating for body".to_string();
            return control_issue_nested("for", node, issue);
        }
        return (node.clone(), false);
    }
    if mapkey.is_some() {
        (Node::new(Value::Object(result_map), node.source_name()), true)
    } else {
        (Node::new(Value::Array(result_list), node.source_name()), true)
    }
}
