//! expression evaluation
//!
//! Evaluation follows the engine contract: `(value, info, ok)` where a
//! false `ok` means "not resolvable in this pass, try again"; a non-empty
//! issue on the info marks a hard failure. References resolve against the
//! binding's scope chain and only yield values whose subtree is fully
//! resolved, which is what drives the outer fixed-point iteration.

use super::{BinOp, Expr, Info, MergeExpr, RefStep};
use crate::binding::Binding;
use crate::node::{Issue, Node, Value};
use indexmap::IndexMap;

type Evaluated = (Option<Value>, Info, bool);

fn pending() -> Evaluated {
    (None, Info::default(), false)
}

fn resolved(value: Value) -> Evaluated {
    (Some(value), Info::default(), true)
}

fn failure(message: String) -> Evaluated {
    let mut info = Info::default();
    info.set_error(message);
    (None, info, false)
}

impl Expr {
    /// Evaluate under a binding.
    ///
    /// With `partial` set, unresolvable references fail silently (used for
    /// alternative operands, where "not there" is an answer rather than an
    /// error).
    pub fn evaluate(&self, env: &Binding, partial: bool) -> Evaluated {
        match self {
            Expr::Integer(v) => resolved(Value::Integer(*v)),
            Expr::Decimal(v) => resolved(Value::Decimal(*v)),
            Expr::Boolean(v) => resolved(Value::Boolean(*v)),
            Expr::StringLit(v) => resolved(Value::String(v.clone())),
            Expr::Nil => resolved(Value::Null),
            Expr::Undefined => {
                let mut info = Info::default();
                info.undefined = true;
                (Some(Value::Null), info, true)
            }
            Expr::List(items) => self.eval_list(items, env, partial),
            Expr::Reference(steps) => self.eval_reference(steps, env, partial),
            Expr::Concat(parts) => self.eval_concat(parts, env, partial),
            Expr::Or(lhs, rhs) => {
                let (value, info, ok) = lhs.evaluate(env, true);
                if ok {
                    return (value, info, true);
                }
                if info.undefined || info.failed {
                    return rhs.evaluate(env, partial);
                }
                pending()
            }
            Expr::Binary { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs, env, partial),
            Expr::Neg(inner) => {
                let (value, info, ok) = inner.evaluate(env, partial);
                if !ok {
                    return (None, info, false);
                }
                match value {
                    Some(Value::Integer(v)) => match v.checked_neg() {
                        Some(v) => resolved(Value::Integer(v)),
                        None => failure("integer overflow in negation".to_string()),
                    },
                    Some(Value::Decimal(v)) => resolved(Value::Decimal(-v)),
                    Some(other) => failure(format!("cannot negate {}", other.kind())),
                    None => pending(),
                }
            }
            Expr::Prefer(inner) => {
                let (value, mut info, ok) = inner.evaluate(env, partial);
                info.preferred = true;
                (value, info, ok)
            }
            Expr::Merge(merge) => self.eval_merge(merge, env, partial),
            Expr::Marker(marker) => {
                if marker.template {
                    return failure("template marker not allowed inside an expression".to_string());
                }
                match &marker.inner {
                    None => {
                        let mut info = Info::default();
                        info.flags = marker.flags;
                        (Some(Value::Null), info, true)
                    }
                    Some(inner) => {
                        let (value, mut info, ok) = inner.evaluate(env, partial);
                        info.flags |= marker.flags;
                        (value, info, ok)
                    }
                }
            }
            Expr::Substitution { target, scope } => {
                self.eval_substitution(target, scope, env, partial)
            }
            Expr::TemplateRef(template) => resolved(Value::Template((**template).clone())),
            Expr::Call { name, args } => self.eval_call(name, args, env, partial),
        }
    }

    fn eval_list(&self, items: &[Expr], env: &Binding, partial: bool) -> Evaluated {
        let mut result = Vec::with_capacity(items.len());
        for item in items {
            let (value, info, ok) = item.evaluate(env, partial);
            if !ok {
                return (None, info, false);
            }
            result.push(Node::new(value.unwrap_or(Value::Null), env.source_name()));
        }
        resolved(Value::Array(result))
    }

    fn eval_reference(&self, steps: &[RefStep], env: &Binding, partial: bool) -> Evaluated {
        let first = match steps.first() {
            Some(RefStep::Key(name)) => name,
            _ => return failure("reference must start with a name".to_string()),
        };
        let Some(mut node) = env.resolve_symbol(first) else {
            let mut info = Info::default();
            info.undefined = true;
            if !partial {
                info.issue = Issue::new(format!("'{self}' not found"));
            }
            return (None, info, false);
        };

        for step in &steps[1..] {
            if node.value().is_expression() {
                return pending();
            }
            let found = match (node.value(), step) {
                (Value::Object(map), RefStep::Key(key)) => map.get(key).cloned(),
                (Value::Array(items), RefStep::Index(index)) => items.get(*index).cloned(),
                _ => None,
            };
            match found {
                Some(next) => node = next,
                None => {
                    let mut info = Info::default();
                    // missing entries of unresolved containers may still
                    // appear through a merge; retry instead of failing
                    if node.is_resolved() {
                        info.undefined = true;
                        if !partial {
                            info.issue = Issue::new(format!("'{self}' not found"));
                        }
                    }
                    return (None, info, false);
                }
            }
        }

        if !node.is_resolved() {
            return pending();
        }
        resolved(node.into_value())
    }

    fn eval_concat(&self, parts: &[Expr], env: &Binding, partial: bool) -> Evaluated {
        let mut out = String::new();
        for part in parts {
            let (value, info, ok) = part.evaluate(env, partial);
            if !ok {
                return (None, info, false);
            }
            match scalar_fragment(&value.unwrap_or(Value::Null)) {
                Ok(fragment) => out.push_str(&fragment),
                Err(message) => return failure(message),
            }
        }
        resolved(Value::String(out))
    }

    fn eval_binary(
        &self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        env: &Binding,
        partial: bool,
    ) -> Evaluated {
        let (lhs, info, ok) = lhs.evaluate(env, partial);
        if !ok {
            return (None, info, false);
        }
        let (rhs, info, ok) = rhs.evaluate(env, partial);
        if !ok {
            return (None, info, false);
        }
        match numeric(op, &lhs.unwrap_or(Value::Null), &rhs.unwrap_or(Value::Null)) {
            Ok(value) => resolved(value),
            Err(message) => failure(message),
        }
    }

    fn eval_merge(&self, merge: &MergeExpr, env: &Binding, partial: bool) -> Evaluated {
        let path: Vec<String> = merge
            .path
            .clone()
            .unwrap_or_else(|| env.stub_path().to_vec());

        match env.find_in_stubs(&path) {
            Some(found) => {
                let (found, _) = crate::flow::substitute_node(&found);
                if !found.is_resolved() {
                    return pending();
                }
                let mut info = Info::default();
                info.merged = true;
                info.replace = merge.replace;
                info.source_name = Some(found.source_name().to_string());
                if merge.path.is_some() {
                    info.redirect_path = Some(path);
                }
                if let Some(key_name) = found.key_name() {
                    info.key_name = Some(key_name.to_string());
                }
                (Some(found.into_value()), info, true)
            }
            None => {
                let mut info = Info::default();
                info.undefined = true;
                if !partial {
                    info.issue = Issue::new(format!(
                        "merge target '{}' not found in any stub",
                        path.join(".")
                    ));
                }
                (None, info, false)
            }
        }
    }

    fn eval_substitution(
        &self,
        target: &Expr,
        scope: &[(String, Expr)],
        env: &Binding,
        partial: bool,
    ) -> Evaluated {
        let (value, info, ok) = target.evaluate(env, true);
        if !ok {
            return (None, info, false);
        }
        let template = match value {
            Some(Value::Template(template)) => template,
            Some(other) => {
                return failure(format!(
                    "substitution target must be a template, found {}",
                    other.kind()
                ))
            }
            None => return pending(),
        };

        let mut entries = IndexMap::new();
        for (key, expr) in scope {
            let (value, info, ok) = expr.evaluate(env, partial);
            if !ok {
                return (None, info, false);
            }
            entries.insert(
                key.clone(),
                Node::new(value.unwrap_or(Value::Null), env.source_name()),
            );
        }

        let mut sub_env = template.binding.clone().with_no_merge();
        for frame in env.local_frames() {
            sub_env = sub_env.with_local_scope(frame);
        }
        if !entries.is_empty() {
            sub_env = sub_env.with_local_scope(entries);
        }

        if !env.state().enter_substitution() {
            return failure("substitution nesting too deep".to_string());
        }
        let result = crate::flow::driver::flow_to_fixed_point(&template.node, &sub_env);
        env.state().leave_substitution();

        if result.has_error() || result.has_failed() {
            let mut info = Info::default();
            info.issue = Issue::new("template substitution failed".to_string());
            info.issue.nested.push(result.issue().clone());
            info.failed = true;
            return (None, info, false);
        }
        if !result.is_resolved() {
            return pending();
        }
        resolved(result.into_value())
    }

    fn eval_call(&self, name: &str, args: &[Expr], env: &Binding, partial: bool) -> Evaluated {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            let (value, info, ok) = arg.evaluate(env, partial);
            if !ok {
                return (None, info, false);
            }
            values.push(value.unwrap_or(Value::Null));
        }
        match name {
            "length" => match values.as_slice() {
                [Value::String(s)] => resolved(Value::Integer(s.chars().count() as i64)),
                [Value::Array(l)] => resolved(Value::Integer(l.len() as i64)),
                [Value::Object(m)] => resolved(Value::Integer(m.len() as i64)),
                [other] => failure(format!("length undefined for {}", other.kind())),
                _ => failure("length takes exactly one argument".to_string()),
            },
            "join" => {
                let Some((Value::String(sep), rest)) = values.split_first() else {
                    return failure("join requires a string separator".to_string());
                };
                let mut fragments = Vec::new();
                for value in rest {
                    match value {
                        Value::Array(items) => {
                            for item in items {
                                match scalar_fragment(item.value()) {
                                    Ok(fragment) => fragments.push(fragment),
                                    Err(message) => return failure(message),
                                }
                            }
                        }
                        other => match scalar_fragment(other) {
                            Ok(fragment) => fragments.push(fragment),
                            Err(message) => return failure(message),
                        },
                    }
                }
                resolved(Value::String(fragments.join(sep)))
            }
            _ => failure(format!("unknown function '{name}'")),
        }
    }
}

fn scalar_fragment(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Integer(v) => Ok(v.to_string()),
        Value::Decimal(v) => Ok(v.to_string()),
        Value::Boolean(v) => Ok(v.to_string()),
        other => Err(format!("cannot render {} as string", other.kind())),
    }
}

fn numeric(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, String> {
    match (lhs, rhs) {
        (Value::Integer(a), Value::Integer(b)) => {
            let (a, b) = (*a, *b);
            let result = match op {
                BinOp::Add => a.checked_add(b),
                BinOp::Sub => a.checked_sub(b),
                BinOp::Mul => a.checked_mul(b),
                BinOp::Div => {
                    if b == 0 {
                        return Err("division by zero".to_string());
                    }
                    a.checked_div(b)
                }
                BinOp::Mod => {
                    if b == 0 {
                        return Err("division by zero".to_string());
                    }
                    a.checked_rem(b)
                }
            };
            result
                .map(Value::Integer)
                .ok_or_else(|| "integer overflow".to_string())
        }
        (Value::Integer(_) | Value::Decimal(_), Value::Integer(_) | Value::Decimal(_)) => {
            let a = decimal(lhs);
            let b = decimal(rhs);
            let result = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => {
                    if b == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    a / b
                }
                BinOp::Mod => {
                    if b == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    a % b
                }
            };
            Ok(Value::Decimal(result))
        }
        _ => Err(format!(
            "non-numeric operand for '{}' ({} and {})",
            op.symbol(),
            lhs.kind(),
            rhs.kind()
        )),
    }
}

fn decimal(value: &Value) -> f64 {
    match value {
        Value::Integer(v) => *v as f64,
        Value::Decimal(v) => *v,
        _ => 0.0,
    }
}
