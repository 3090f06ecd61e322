//! map flow
//!
//! Handles the `<<` merge directive, entry recursion in sorted-key order,
//! stub injection and template capture.

use super::{
    as_template, control, flow, flow_inner, has_unparsed_expression, inherited_flags,
    simple_merge_compatibility_check, substitute_node, update_node, ALT_MERGE_KEY, MERGE_KEY,
};
use crate::binding::Binding;
use crate::node::{sorted_keys, Issue, Node, NodeFlags, TemplateValue, Value};
use indexmap::IndexMap;

pub(crate) fn flow_map(
    root: &Node,
    env: &Binding,
    should_override: bool,
    mut template: bool,
) -> Node {
    let (mut flags, stub) = inherited_flags(env);
    let mut tag = root.tag().map(str::to_string);
    let mut processed = true;
    let mut merged = false;
    let issue = root.issue().clone();
    let failed = root.has_failed();
    let Value::Object(root_map) = root.value().clone() else {
        return root.clone();
    };

    let root_env = env.clone();
    let mut env = env.with_scope(&root_map);

    let mut redirect = root.redirect_path().map(<[String]>::to_vec);
    let mut replace = root.has_replace();
    let mut new_map: IndexMap<String, Node> = IndexMap::new();
    let mut undefined: IndexMap<String, Node> = IndexMap::new();
    let mut insert_error: Option<String> = None;
    let mut add_entries = true;

    tracing::trace!(path = ?env.path(), template, "flow map");

    let mut merge_key = MERGE_KEY;
    let mut merge_val = root_map.get(MERGE_KEY).cloned();
    if merge_val.is_some() {
        if root_map.contains_key(ALT_MERGE_KEY) {
            return root
                .clone()
                .issued(true, true, Issue::new("multiple merge keys not allowed"));
        }
    } else {
        merge_key = ALT_MERGE_KEY;
        merge_val = root_map.get(ALT_MERGE_KEY).cloned();
    }

    if let Some(val) = merge_val.take() {
        let initial = matches!(val.value(), Value::String(_));
        let base = flow_inner(&val, &env, false, false);
        if base.is_undefined() {
            return root.clone().undefined();
        }
        match base.value().clone() {
            Value::Expression(expression) => {
                let marker = as_template(&expression, template);
                if let Some(marker) = &marker {
                    if let Some(marker_tag) = &marker.tag {
                        tag = Some(marker_tag.clone());
                    }
                    flags |= marker.node_flags();
                }
                if marker.as_ref().map(|m| m.template).unwrap_or(false) {
                    tracing::debug!(path = ?env.path(), "map becomes template");
                    template = true;
                    merge_val = marker
                        .expect("template marker present")
                        .template_expression(root);
                } else if simple_merge_compatibility_check(initial, &base) {
                    tracing::trace!("skip optional merge");
                    merge_val = None;
                } else {
                    // merge still unresolved; leave entries for a later pass
                    processed = false;
                    merge_val = Some(base);
                }
            }
            _ => {
                if let Some(path) = base.redirect_path() {
                    redirect = Some(path.to_vec());
                    env = env.redirect_overwrite(path.to_vec());
                }
                if base.is_merged() {
                    merged = true;
                }
                let base_is_map = base.value().is_object();
                if let Value::Object(entries) = base.value() {
                    for (key, value) in entries {
                        new_map.insert(key.clone(), value.clone());
                    }
                }
                replace = base.has_replace();
                let parse_pending = has_unparsed_expression(&base, &env);
                if !base_is_map && !base.value().is_null() && !parse_pending {
                    insert_error = Some(format!(
                        "require map value for '<<' insert, found '{}'",
                        base.value().kind()
                    ));
                }
                if base_is_map || base.value().is_null() || !parse_pending {
                    merge_val = None;
                    if replace {
                        add_entries = false;
                    }
                } else {
                    merge_val = Some(base);
                }
            }
        }
    }

    if template {
        processed = false;
    }

    if add_entries {
        for key in sorted_keys(&root_map) {
            let val = if key == merge_key {
                match &merge_val {
                    None => continue,
                    Some(val) => val.clone(),
                }
            } else {
                let Some(entry) = root_map.get(&key) else {
                    continue;
                };
                if processed {
                    flow(
                        entry,
                        &env.with_path(&key),
                        should_override,
                        control::requires_template(&key, &root_map, &env),
                    )
                } else {
                    entry.clone()
                }
            };

            if val.is_undefined() {
                undefined.insert(key, val);
            } else {
                let val = if flags.propagate_implied() {
                    val.flagged(NodeFlags::IMPLIED)
                } else {
                    val
                };
                new_map.insert(key, val);
            }
        }
    }

    if merged {
        flags |= NodeFlags::INJECTED;
    } else if let Some(stub) = &stub {
        if !flags.injected() {
            if let Value::Object(entries) = stub.value() {
                for (key, value) in entries {
                    if value.flags().inject() && !new_map.contains_key(key) {
                        let (value, _) = substitute_node(value);
                        new_map.insert(
                            key.clone(),
                            value.flagged(NodeFlags::INJECT | NodeFlags::INJECTED),
                        );
                    }
                }
            }
        }
    }

    let result = if template {
        Value::Template(TemplateValue::new(
            env.path().to_vec(),
            Node::new(Value::Object(new_map), root.source_name()),
            root_env,
        ))
    } else {
        Value::Object(new_map)
    };

    let mut node = if replace {
        Node::replace(result, root, redirect.clone())
    } else {
        Node::redirect(result, root, redirect.clone())
    };

    if insert_error.is_some() || failed {
        node = match insert_error {
            Some(message) => node.issued(true, true, Issue::new(message)),
            None => node.issued(true, true, issue),
        };
    } else {
        node = control::flow_control(node, &undefined, &env);
    }
    update_node(node, flags, tag.as_deref())
}
