//! list flow
//!
//! Splices inline merge entries, determines identity-based path steps for
//! list-of-map merges, handles `key:<field>` identity renames, stub
//! injection and in-place flattening of control elements.

use super::{
    as_template, control, flow, flow_inner, has_unparsed_expression, inherited_flags,
    simple_merge_compatibility_check, update_node, ALT_MERGE_KEY, MERGE_KEY,
};
use crate::binding::Binding;
use crate::node::{find_field, find_string_field, Issue, Node, NodeFlags, TemplateValue, Value};
use indexmap::IndexMap;

/// Default identity field for list-of-map merges.
const DEFAULT_KEY_NAME: &str = "name";

struct MergeOutcome {
    result: Value,
    process: bool,
    replaced: bool,
    redirect: Option<Vec<String>>,
    key_name: Option<String>,
    merged: bool,
    flags: NodeFlags,
    tag: Option<String>,
    stub: Option<Node>,
}

pub(crate) fn flow_list(root: &Node, env: &Binding, template: bool) -> Node {
    tracing::trace!(path = ?env.path(), "flow list");
    let outcome = process_merges(root, env, template);
    let mut merged_value = outcome.result;
    let mut flags = outcome.flags;
    let mut env = env.clone();

    if outcome.process {
        if let Some(path) = &outcome.redirect {
            env = env.redirect_overwrite(path.clone());
        }
        let mut new_list = Vec::new();
        if let Value::Array(items) = &merged_value {
            for (index, item) in items.iter().enumerate() {
                let (step, resolved) = step_name(index, item, outcome.key_name.as_deref(), &env);
                tracing::trace!(step = %step, resolved, "list element");
                let item = if resolved {
                    flow(item, &env.with_path(&step), false, false)
                } else {
                    item.clone()
                };
                if !item.is_undefined() {
                    new_list.push(item);
                }
            }
        }

        if outcome.merged {
            flags |= NodeFlags::INJECTED;
        } else if let Some(stub) = &outcome.stub {
            if !root.flags().injected() {
                if let Value::Array(stub_items) = stub.value() {
                    let mut injected: Vec<Node> = stub_items
                        .iter()
                        .filter(|item| item.flags().inject())
                        .cloned()
                        .collect();
                    injected.extend(new_list);
                    new_list = injected;
                }
                flags |= NodeFlags::INJECTED;
            }
        }
        merged_value = Value::Array(new_list);
    }

    let mut result = root.clone();
    if let Some(key_name) = &outcome.key_name {
        result = result.keyed(key_name);
    }
    result = if outcome.replaced {
        Node::replace(merged_value, &result, outcome.redirect.clone())
    } else if outcome.redirect.is_some() {
        Node::redirect(merged_value, &result, outcome.redirect.clone())
    } else {
        Node::substitute(merged_value, &result)
    };
    update_node(result, flags, outcome.tag.as_deref())
}

/// An inline list entry merge: a single-entry map under the merge key.
fn unresolved_list_entry_merge(node: &Node) -> Option<(Node, String)> {
    let map = node.value().as_object()?;
    if map.len() != 1 {
        return None;
    }
    let (key, value) = map.iter().next()?;
    if key == MERGE_KEY || key == ALT_MERGE_KEY {
        return Some((value.clone(), key.clone()));
    }
    None
}

fn process_merges(orig: &Node, env: &Binding, mut template: bool) -> MergeOutcome {
    let (mut flags, stub) = inherited_flags(env);
    let mut tag = orig.tag().map(str::to_string);
    let mut spliced: Vec<Node> = Vec::new();
    let mut process = true;
    let mut merged = false;
    let mut key_name = orig.key_name().map(str::to_string);
    let mut replaced = orig.has_replace();
    let mut redirect = orig.redirect_path().map(<[String]>::to_vec);
    let root: Vec<Node> = orig.value().as_array().map(<[Node]>::to_vec).unwrap_or_default();

    for val in &root {
        let mut current = val.clone();

        if let Some((inline, qualifier)) = unresolved_list_entry_merge(val) {
            let initial = matches!(inline.value(), Value::String(_));
            let mut result = flow_inner(&inline, env, false, false);
            if let Some(name) = result.key_name() {
                key_name = Some(name.to_string());
            }

            if let Value::Expression(expression) = result.value().clone() {
                if simple_merge_compatibility_check(initial, &result) {
                    continue;
                }
                if let Some(marker) = as_template(&expression, template) {
                    flags |= marker.node_flags();
                    if let Some(marker_tag) = &marker.tag {
                        tag = Some(marker_tag.clone());
                    }
                    if marker.template {
                        tracing::debug!(path = ?env.path(), "list becomes template");
                        template = true;
                        process = false;
                        match marker.template_expression(orig) {
                            None => continue,
                            Some(inner) => result = inner,
                        }
                    }
                }
                let mut new_map = IndexMap::new();
                new_map.insert(qualifier, result);
                current = Node::substitute(Value::Object(new_map), orig);
                process = false;
            } else {
                let spliced_list = match result.value() {
                    Value::Array(inline_items) => {
                        merged = true;
                        let additions = new_entries(inline_items, &root, key_name.as_deref());
                        replaced = result.has_replace();
                        redirect = result.redirect_path().map(<[String]>::to_vec);
                        if replaced {
                            spliced = additions;
                            process = false;
                            break;
                        }
                        spliced.extend(additions);
                        true
                    }
                    _ => false,
                };
                if spliced_list
                    || result.value().is_null()
                    || !has_unparsed_expression(&result, env)
                {
                    redirect = result.redirect_path().map(<[String]>::to_vec);
                    if result.is_merged() {
                        merged = true;
                    }
                    continue;
                }
                // unparsed scalar under the merge key: keep the original
                // entry and retry next pass
            }
        }

        let (current, new_key) = process_key_tag(&current);
        if let Some(new_key) = new_key {
            key_name = Some(new_key);
        }
        spliced.push(current);
    }

    let result = if template {
        Value::Template(TemplateValue::new(
            env.path().to_vec(),
            Node::new(Value::Array(spliced), orig.source_name()),
            env.clone(),
        ))
    } else {
        let mut processed = Vec::with_capacity(spliced.len());
        for val in spliced {
            match control::is_control(&val, env) {
                Err(message) => processed.push(val.issued(true, true, Issue::new(message))),
                Ok(true) => {
                    let evaluated = flow_inner(&val, env, false, false);
                    if let Value::Array(items) = evaluated.value() {
                        processed.extend(items.iter().cloned());
                        continue;
                    }
                    process = false;
                    processed.push(evaluated);
                }
                Ok(false) => processed.push(val),
            }
        }
        Value::Array(processed)
    };

    MergeOutcome {
        result,
        process,
        replaced,
        redirect,
        key_name,
        merged,
        flags,
        tag,
        stub,
    }
}

/// Determines the path step for a list element: identity-based when the
/// element is a map with a resolved identity field, positional otherwise.
/// Elements whose identity is still an unresolved expression wait a pass.
fn step_name(
    index: usize,
    value: &Node,
    key_name: Option<&str>,
    env: &Binding,
) -> (String, bool) {
    let key = key_name.unwrap_or(DEFAULT_KEY_NAME);
    if let Some(name) = find_string_field(value, key) {
        return (format!("{key}:{name}"), true);
    }

    let step = format!("[{index}]");
    if let Some(raw) = find_field(value, key) {
        if raw.value().is_expression() {
            let flowed = flow(raw, &env.with_path(&step), false, false);
            if flowed.value().is_expression() {
                return (step, false);
            }
            if let Some(name) = flowed.value().as_str() {
                return (format!("{key}:{name}"), true);
            }
        }
    }
    (step, true)
}

/// Renames the identity field for this and subsequent entries: a map key
/// `key:<field>` selects `<field>` as the identity.
fn process_key_tag(value: &Node) -> (Node, Option<String>) {
    let Some(map) = value.value().as_object() else {
        return (value.clone(), None);
    };

    let mut key_name = None;
    for key in map.keys() {
        if let Some((prefix, field)) = key.split_once(':') {
            if prefix == "key" && !field.is_empty() {
                key_name = Some(field.to_string());
            }
        }
    }
    let Some(key_name) = key_name else {
        return (value.clone(), None);
    };

    let mut new_map = IndexMap::new();
    for (key, entry) in map {
        let renamed = match key.split_once(':') {
            Some(("key", field)) if !field.is_empty() => field.to_string(),
            _ => key.clone(),
        };
        new_map.insert(renamed, entry.clone());
    }
    (
        Node::substitute(Value::Object(new_map), value),
        Some(key_name),
    )
}

/// Entries of `added` whose identity is not yet present in `existing`.
fn new_entries(added: &[Node], existing: &[Node], key_name: Option<&str>) -> Vec<Node> {
    let key = key_name.unwrap_or(DEFAULT_KEY_NAME);
    added
        .iter()
        .filter(|candidate| match find_string_field(candidate, key) {
            Some(name) => !existing
                .iter()
                .any(|entry| find_string_field(entry, key) == Some(name)),
            None => true,
        })
        .cloned()
        .collect()
}
