//! embedded expression sublanguage
//!
//! The flow engine treats expressions through a narrow contract: parse a
//! scalar body into an [Expr], call [Expr::evaluate] until it resolves, and
//! pattern-match the [marker](MarkerExpr) variant. Everything else about
//! the language is private to this module tree.

mod eval;
mod parser;

pub use parser::{parse, ParseError};

use crate::node::{Issue, Node, NodeFlags, TemplateValue, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// One step of a reference path.
#[derive(Debug, Clone, PartialEq)]
pub enum RefStep {
    Key(String),
    Index(usize),
}

impl fmt::Display for RefStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefStep::Key(key) => write!(f, "{key}"),
            RefStep::Index(index) => write!(f, "[{index}]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
        }
    }
}

/// A merge directive: pull the value for the current (or an explicit) stub
/// path into the document.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeExpr {
    pub path: Option<Vec<String>>,
    pub replace: bool,
}

impl MergeExpr {
    /// The zero-argument `(( merge ))`, optional under `<<` for
    /// compatibility.
    pub fn is_simple(&self) -> bool {
        self.path.is_none() && !self.replace
    }
}

/// A marker expression: sets flags, a tag or template treatment on its host
/// node, optionally wrapping an inner expression.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MarkerExpr {
    pub template: bool,
    pub flags: NodeFlags,
    pub tag: Option<String>,
    pub inner: Option<Box<Expr>>,
}

impl MarkerExpr {
    /// A pure template marker around an expression, used when a map key
    /// enforces template treatment.
    pub fn template_of(inner: Expr) -> MarkerExpr {
        MarkerExpr {
            template: true,
            flags: NodeFlags::default(),
            tag: None,
            inner: Some(Box::new(inner)),
        }
    }

    pub fn node_flags(&self) -> NodeFlags {
        self.flags
    }

    /// The wrapped expression as a node, if any.
    pub fn template_expression(&self, root: &Node) -> Option<Node> {
        self.inner
            .as_ref()
            .map(|inner| Node::substitute(Value::Expression((**inner).clone()), root))
    }
}

/// The expression AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    StringLit(String),
    Nil,
    /// The `~~` literal: resolves and marks the host node undefined.
    Undefined,
    List(Vec<Expr>),
    Reference(Vec<RefStep>),
    /// Literal spans and sub-expressions of an interpolated scalar.
    Concat(Vec<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Neg(Box<Expr>),
    Prefer(Box<Expr>),
    Merge(MergeExpr),
    Marker(MarkerExpr),
    Substitution {
        target: Box<Expr>,
        scope: Vec<(String, Expr)>,
    },
    /// An already-captured template, produced when wrapping dynamic nodes.
    TemplateRef(Box<TemplateValue>),
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

/// Side conditions reported by an evaluation.
#[derive(Debug, Clone, Default)]
pub struct Info {
    pub issue: Issue,
    pub failed: bool,
    pub undefined: bool,
    pub redirect_path: Option<Vec<String>>,
    pub replace: bool,
    pub merged: bool,
    pub preferred: bool,
    pub key_name: Option<String>,
    pub source_name: Option<String>,
    pub flags: NodeFlags,
}

impl Info {
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.issue = Issue::new(message);
        self.failed = true;
    }
}

static ANCHORED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)^\(\((.*)\)\)$").unwrap());
static EMBEDDED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\(\((.*?)\)\)").unwrap());

/// The expression content of a scalar, if any.
#[derive(Debug, Clone, PartialEq)]
pub enum Embedded {
    /// The scalar is exactly one `(( ... ))` expression.
    Whole(String),
    /// Interpolation: literal spans alternating with expression bodies.
    Parts(Vec<Span>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Span {
    Literal(String),
    Source(String),
}

/// Detects embedded expression syntax in a scalar.
pub fn embedded_expression(scalar: &str, interpolation: bool) -> Option<Embedded> {
    if let Some(captures) = ANCHORED.captures(scalar) {
        return Some(Embedded::Whole(captures[1].to_string()));
    }
    if !interpolation {
        return None;
    }

    let mut parts = Vec::new();
    let mut cursor = 0;
    for found in EMBEDDED.captures_iter(scalar) {
        let all = found.get(0).expect("capture 0 always present");
        if all.start() > cursor {
            parts.push(Span::Literal(scalar[cursor..all.start()].to_string()));
        }
        parts.push(Span::Source(found[1].to_string()));
        cursor = all.end();
    }
    if parts.is_empty() {
        return None;
    }
    if cursor < scalar.len() {
        parts.push(Span::Literal(scalar[cursor..].to_string()));
    }
    Some(Embedded::Parts(parts))
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Integer(v) => write!(f, "{v}"),
            Expr::Decimal(v) => write!(f, "{v}"),
            Expr::Boolean(v) => write!(f, "{v}"),
            Expr::StringLit(v) => write!(f, "{v:?}"),
            Expr::Nil => write!(f, "nil"),
            Expr::Undefined => write!(f, "~~"),
            Expr::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Expr::Reference(steps) => {
                for (i, step) in steps.iter().enumerate() {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{step}")?;
                }
                Ok(())
            }
            Expr::Concat(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{part}")?;
                }
                Ok(())
            }
            Expr::Or(lhs, rhs) => write!(f, "{lhs} || {rhs}"),
            Expr::Binary { op, lhs, rhs } => write!(f, "{lhs} {} {rhs}", op.symbol()),
            Expr::Neg(inner) => write!(f, "-{inner}"),
            Expr::Prefer(inner) => write!(f, "prefer {inner}"),
            Expr::Merge(merge) => {
                write!(f, "merge")?;
                if merge.replace {
                    write!(f, " replace")?;
                }
                if let Some(path) = &merge.path {
                    write!(f, " {}", path.join("."))?;
                }
                Ok(())
            }
            Expr::Marker(marker) => {
                let mut sep = "";
                if marker.template {
                    write!(f, "&template")?;
                    sep = " ";
                }
                for (flag, name) in [
                    (NodeFlags::TEMPORARY, "&temporary"),
                    (NodeFlags::LOCAL, "&local"),
                    (NodeFlags::STATE, "&state"),
                    (NodeFlags::DEFAULT, "&default"),
                    (NodeFlags::INJECT, "&inject"),
                    (NodeFlags::DYNAMIC, "&dynamic"),
                ] {
                    if marker.flags.contains(flag) {
                        write!(f, "{sep}{name}")?;
                        sep = " ";
                    }
                }
                if let Some(tag) = &marker.tag {
                    write!(f, "{sep}&tag:{tag}")?;
                    sep = " ";
                }
                if let Some(inner) = &marker.inner {
                    write!(f, "{sep}({inner})")?;
                }
                Ok(())
            }
            Expr::Substitution { target, scope } => {
                write!(f, "*{target}")?;
                if !scope.is_empty() {
                    write!(f, " {{ ")?;
                    for (i, (key, value)) in scope.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{key} = {value}")?;
                    }
                    write!(f, " }}")?;
                }
                Ok(())
            }
            Expr::TemplateRef(_) => write!(f, "<template>"),
            Expr::Call { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}
