//! the flow engine
//!
//! One pass of the engine is a recursive walk rewriting every node: maps
//! handle merge directives and stub injection, lists splice inline merges,
//! scalars are scanned for embedded expressions and expressions are
//! evaluated. The [driver] repeats passes until nothing changes.

pub(crate) mod control;
pub(crate) mod driver;
mod list;
mod map;

use crate::binding::{Binding, TagScope};
use crate::expr::{self, Embedded, Expr, Info, MarkerExpr, Span};
use crate::node::{Issue, Node, NodeFlags, TemplateValue, Value};

pub(crate) const MERGE_KEY: &str = "<<";
pub(crate) const ALT_MERGE_KEY: &str = "<<<";

/// Rewrites one node and publishes its tag once the subtree is resolved.
pub(crate) fn flow(root: &Node, env: &Binding, should_override: bool, enforce_template: bool) -> Node {
    let node = flow_inner(root, env, should_override, enforce_template);
    let Some(tag) = node.tag().map(str::to_string) else {
        return node;
    };
    if !node.is_resolved() {
        return node;
    }
    tracing::trace!(tag = %tag, path = ?env.path(), "resolved tagged node");
    let (name, scope) = match tag.strip_prefix('*') {
        Some(rest) => (rest, TagScope::Global),
        None => (tag.as_str(), TagScope::Stream),
    };
    match env.state().set_tag(name, &node, env.path(), scope) {
        Ok(()) => node,
        Err(err) => node.issued(true, true, Issue::new(err.to_string())),
    }
}

fn flow_inner(root: &Node, env: &Binding, should_override: bool, enforce_template: bool) -> Node {
    let mut flags = root.flags();
    let mut replace = root.has_replace();
    let mut redirect = root.redirect_path().map(<[String]>::to_vec);
    let preferred = root.is_preferred();
    let merged = root.is_merged();
    let mut key_name = root.key_name().map(str::to_string);
    let mut source = root.source_name().to_string();
    let mut template = root.template().cloned();

    let mut env = env.clone();
    if let Some(path) = &redirect {
        env = env.redirect_overwrite(path.clone());
    }

    tracing::trace!(path = ?env.path(), kind = root.value().kind(), "flow");

    let mut root = root.clone();
    if !replace {
        if merged && !root.value().is_expression() {
            return root;
        }
        match root.value().clone() {
            Value::Object(_) => {
                let is_control = match control::is_control(&root, &env) {
                    Ok(is_control) => is_control,
                    Err(message) => return root.issued(true, true, Issue::new(message)),
                };
                root = map::flow_map(&root, &env, !is_control, enforce_template);
                if !is_control {
                    return root;
                }
                if root.value().is_object() {
                    // control not yet evaluable, retry next pass
                    return root;
                }
                // the control produced a value; it may still be overridden
            }
            Value::Array(_) => return list::flow_list(&root, &env, enforce_template),
            Value::Expression(value) => {
                let mut env = env.clone();
                if root.source_name() != env.source_name() {
                    env = env.with_source(root.source_name());
                }

                let mut eval: Option<Value> = None;
                let mut info = Info::default();
                let mut ok = true;

                let marker = as_template(&value, enforce_template);
                if let Some(marker) = &marker {
                    if let Some(tag) = &marker.tag {
                        if root.tag().is_none() {
                            root = root.tagged(tag);
                        }
                    }
                }

                let is_template_marker = marker.as_ref().map(|m| m.template).unwrap_or(false);
                if is_template_marker {
                    let marker = marker.expect("template marker present");
                    match marker.template_expression(&root) {
                        None => {
                            info.set_error("empty template value");
                            if !should_override {
                                return root.issued(true, false, info.issue.clone());
                            }
                            ok = false;
                        }
                        Some(captured) => {
                            tracing::debug!(path = ?env.path(), "capture template value");
                            eval = Some(Value::Template(TemplateValue::new(
                                env.path().to_vec(),
                                captured,
                                env.clone(),
                            )));
                        }
                    }
                    flags |= marker.node_flags();
                } else {
                    let (value, eval_info, eval_ok) = value.evaluate(&env, false);
                    eval = value;
                    info = eval_info;
                    ok = eval_ok;
                }

                flags |= info.flags;
                if flags.dynamic() {
                    let is_template_value = matches!(eval, Some(Value::Template(_)));
                    if !is_template_value && template.is_none() {
                        info.set_error("dynamic marker for non-template value node");
                        if !should_override {
                            return root.issued(true, false, info.issue.clone());
                        }
                        ok = false;
                    }
                    if template.is_none() {
                        if let Some(value) = eval.take() {
                            let (value, retained) = substitute_value(value, flags);
                            eval = Some(value);
                            template = retained;
                        }
                    }
                }
                replace = replace || info.replace;

                if !ok {
                    root = root.issued(true, info.failed, info.issue.clone());
                    if !should_override {
                        return root;
                    }
                    // fall through: a stub may still provide the value
                } else {
                    if let Some(name) = &info.source_name {
                        source = name.clone();
                    }
                    let tag = root.tag().map(str::to_string);
                    let value = eval.unwrap_or(Value::Null);
                    let mut result = match &template {
                        Some(retained) => Node::dynamic(value, retained.clone(), &source),
                        None => Node::new(value, &source),
                    };

                    if matches!(result.value(), Value::String(_)) {
                        // evaluation may produce new embedded expressions
                        if let Some(rescanned) = flow_string(&result, &env) {
                            result = rescanned;
                        }
                    }
                    let is_expression = result.value().is_expression();

                    if !info.issue.is_empty() {
                        result = result.issued(false, info.failed, info.issue.clone());
                    }
                    if info.undefined {
                        result = result.undefined();
                    }
                    if preferred || info.preferred {
                        result = result.preferred();
                    }
                    if let Some(name) = &info.key_name {
                        key_name = Some(name.clone());
                        result = result.keyed(name);
                    }
                    if let Some(path) = &info.redirect_path {
                        redirect = Some(path.clone());
                    }
                    if let Some(path) = &redirect {
                        result = Node::redirect(result.value().clone(), &result, Some(path.clone()));
                    }
                    if replace {
                        result = Node::replace(result.value().clone(), &result, redirect.clone());
                    } else if merged || info.merged {
                        result = result.merged();
                    }
                    result = update_node(result, flags, tag.as_deref());

                    if is_expression
                        || result.is_merged()
                        || !should_override
                        || result.is_preferred()
                    {
                        return result;
                    }
                    replace = result.has_replace();
                    root = result;
                }
            }
            Value::String(_) => {
                if let Some(result) = flow_string(&root, &env) {
                    if result.value().is_expression() {
                        // resolve the expression before considering overrides
                        return result;
                    }
                    root = result;
                }
            }
            _ => {}
        }
    }

    if !merged && root.standard_override() && should_override && !env.no_merge() {
        tracing::trace!(path = ?env.path(), stub_path = ?env.stub_path(), "stub lookup");
        if let Some(overridden) = env.find_in_stubs(env.stub_path()) {
            if !overridden.flags().default_flag() && !root.flags().injected() {
                let (substituted, _) = substitute_node(&overridden);
                let mut result = substituted;
                if let Some(name) = &key_name {
                    result = result.keyed(name);
                }
                if replace {
                    result = Node::replace(result.value().clone(), &result, redirect.clone());
                } else if let Some(path) = &redirect {
                    result = Node::redirect(result.value().clone(), &result, Some(path.clone()));
                }
                tracing::debug!(path = ?env.path(), source = result.source_name(), "stub override");
                root = result.flagged(flags | NodeFlags::OVERRIDDEN);
            }
        }
    }

    root
}

/// Detects and parses an embedded expression in a string scalar.
///
/// Parse failures keep the scalar and annotate it with an issue so the
/// diagnostic survives to the final report.
pub(crate) fn flow_string(root: &Node, env: &Binding) -> Option<Node> {
    let source = root.value().as_str()?;
    let embedded = expr::embedded_expression(source, env.state().interpolation_enabled())?;

    let parsed = match embedded {
        Embedded::Whole(body) => expr::parse(&body),
        Embedded::Parts(parts) => parts
            .into_iter()
            .map(|part| match part {
                Span::Literal(literal) => Ok(Expr::StringLit(literal)),
                Span::Source(body) => expr::parse(&body),
            })
            .collect::<Result<Vec<Expr>, _>>()
            .map(Expr::Concat),
    };

    match parsed {
        Ok(expression) => {
            tracing::trace!(path = ?env.path(), %expression, "parsed expression");
            Some(Node::substitute(Value::Expression(expression), root))
        }
        Err(err) => Some(root.clone().issued(
            true,
            false,
            Issue::new(format!("failed to parse expression: {err}")),
        )),
    }
}

/// A string scalar that still carries unparsed embedded expression syntax.
pub(crate) fn has_unparsed_expression(node: &Node, env: &Binding) -> bool {
    match node.value().as_str() {
        Some(scalar) => {
            expr::embedded_expression(scalar, env.state().interpolation_enabled()).is_some()
        }
        None => false,
    }
}

/// `TEMPORARY` and `STATE` flags of a matching stub node are inherited by
/// the overriding source container.
pub(crate) fn inherited_flags(env: &Binding) -> (NodeFlags, Option<Node>) {
    match env.find_in_stubs(env.stub_path()) {
        Some(stub) => (stub.flags().inherited(), Some(stub)),
        None => (NodeFlags::default(), None),
    }
}

/*
 * compatibility rule: a single merge key was always optional, so
 * `<<: (( merge ))` behaves like `<<: (( merge || nil ))`. The first pass
 * only parses the scalar; the check applies from the second pass on.
 */
pub(crate) fn simple_merge_compatibility_check(initial: bool, node: &Node) -> bool {
    if initial {
        return false;
    }
    matches!(node.value(), Value::Expression(Expr::Merge(merge)) if merge.is_simple())
}

/// Marker view of an expression. When a template is enforced for the
/// position, plain expressions are wrapped into a template marker.
pub(crate) fn as_template(expression: &Expr, enforce_template: bool) -> Option<MarkerExpr> {
    match expression {
        Expr::Marker(marker) => {
            let mut marker = marker.clone();
            if enforce_template {
                marker.template = true;
            }
            Some(marker)
        }
        other if enforce_template => Some(MarkerExpr::template_of(other.clone())),
        _ => None,
    }
}

pub(crate) fn update_node(mut node: Node, flags: NodeFlags, tag: Option<&str>) -> Node {
    if !node.flags().contains(flags) {
        node = node.flagged(flags);
    }
    if let Some(tag) = tag {
        if node.tag() != Some(tag) {
            node = node.tagged(tag);
        }
    }
    node
}

/// Rewraps a dynamic node as a substitution over its retained template so
/// every access re-materializes against the live scope.
pub(crate) fn substitute_node(node: &Node) -> (Node, bool) {
    let template = match node.value() {
        Value::Template(template) => Some(template.clone()),
        _ => node.template().cloned(),
    };
    if node.flags().dynamic() {
        if let Some(template) = template {
            let substitution = Expr::Substitution {
                target: Box::new(Expr::TemplateRef(Box::new(template.clone()))),
                scope: Vec::new(),
            };
            let result = Node::dynamic(Value::Expression(substitution), template, "<substitute>")
                .flagged(node.flags());
            return (result, true);
        }
    }
    (node.clone(), false)
}

pub(crate) fn substitute_value(
    value: Value,
    flags: NodeFlags,
) -> (Value, Option<TemplateValue>) {
    if flags.dynamic() {
        if let Value::Template(template) = value {
            let substitution = Expr::Substitution {
                target: Box::new(Expr::TemplateRef(Box::new(template.clone()))),
                scope: Vec::new(),
            };
            return (Value::Expression(substitution), Some(template));
        }
    }
    (value, None)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::binding::Features;
    use pretty_assertions::assert_eq;

    fn env() -> Binding {
        Binding::new(Vec::new(), "test", Features::default())
    }

    fn interpolating_env() -> Binding {
        Binding::new(
            Vec::new(),
            "test",
            Features {
                interpolation: true,
            },
        )
    }

    #[test]
    fn flow_string_parses_anchored_expressions() {
        let node = Node::new(Value::String("(( 1 + 2 ))".into()), "test");
        let parsed = flow_string(&node, &env()).unwrap();
        assert!(parsed.value().is_expression());
    }

    #[test]
    fn flow_string_ignores_plain_scalars() {
        let node = Node::new(Value::String("hello".into()), "test");
        assert!(flow_string(&node, &env()).is_none());
    }

    #[test]
    fn flow_string_attaches_parse_issues() {
        let node = Node::new(Value::String("(( 1 + ))".into()), "test");
        let result = flow_string(&node, &env()).unwrap();
        assert!(result.has_error());
        assert!(result
            .issue()
            .message
            .starts_with("failed to parse expression"));
        assert_eq!(result.value().as_str(), Some("(( 1 + ))"));
    }

    #[test]
    fn flow_string_builds_concatenations() {
        let node = Node::new(Value::String("a-(( 1 ))-b".into()), "test");
        let parsed = flow_string(&node, &interpolating_env()).unwrap();
        match parsed.value() {
            Value::Expression(Expr::Concat(parts)) => assert_eq!(parts.len(), 3),
            other => panic!("expected concatenation, got {other:?}"),
        }
    }

    #[test]
    fn simple_merge_check_requires_second_pass() {
        let merge = Node::new(
            Value::Expression(expr::parse("merge").unwrap()),
            "test",
        );
        assert!(simple_merge_compatibility_check(false, &merge));
        assert!(!simple_merge_compatibility_check(true, &merge));

        let with_path = Node::new(
            Value::Expression(expr::parse("merge a.b").unwrap()),
            "test",
        );
        assert!(!simple_merge_compatibility_check(false, &with_path));
    }

    #[test]
    fn enforced_templates_wrap_plain_expressions() {
        let expression = expr::parse("i * i").unwrap();
        let marker = as_template(&expression, true).unwrap();
        assert!(marker.template);
        assert_eq!(marker.inner, Some(Box::new(expression)));
        assert!(as_template(&expr::parse("i").unwrap(), false).is_none());
    }
}
