//! # strata - declarative document flow
//!
//! `strata` merges a source document tree with a sequence of auxiliary
//! trees ("stubs") and evaluates embedded `(( ... ))` expressions against
//! the merged context, rewriting the tree until a fixed point.
//!
//! ## Introduction for developers
//!
//! Read this to understand how the engine works internally.
//!
//! ### The node model
//!
//! Every value is a [Node]: a [Value] (scalars, ordered maps, lists, an
//! unevaluated expression, or a captured template) plus an [Annotation]
//! envelope. Annotations carry everything a rewrite needs to remember
//! about a node between passes: redirect paths, replace/merge markers,
//! the list identity key, diagnostics, a tag and the node flags. Nodes are
//! immutable; rewrites build new ones (see [node]).
//!
//! ### One pass
//!
//! A pass walks the tree with an environment ([Binding]) tracking the
//! document path, the stub path and the scope chain:
//!
//! - *maps* handle the `<<` merge directive first: markers turn the map
//!   into a template, a resolved merge seeds the output with the stub's
//!   entries, and the zero-argument `(( merge ))` without stub backing is
//!   skipped. Entries are then flowed in sorted-key order, and `INJECT`
//!   flagged stub entries that are missing get copied in.
//! - *lists* splice inline merge entries (`- <<: (( merge ))`) by the
//!   identity field (`name` by default, renamable via `key:<field>` or the
//!   merge result's key name), then flow each element under an
//!   identity-based path step such as `name:frontend`.
//! - *scalars* are scanned for embedded expression syntax and replaced by
//!   expression nodes to be evaluated on the next pass.
//! - *expressions* are evaluated against the scope chain; unresolved
//!   references keep the expression for the next pass.
//!
//! After content rewriting, a node that is not protected (merged,
//! preferred, replaced or redirected) is overridden by a matching stub
//! value, which is how stub values win over source values at the leaves.
//!
//! ### Fixed point
//!
//! The driver repeats passes until nothing changes (bounded by tree size,
//! so reference cycles terminate), strips `TEMPORARY`/`LOCAL` nodes and
//! aggregates the diagnostics that are still present into a [FlowError]
//! carrying the partial output.
//!
//! ### Templates and controls
//!
//! A map or list marked `&template` becomes a [TemplateValue] closing over
//! its binding; substitution expressions (`(( *ref { a = 1 } ))`)
//! materialize it through a nested fixed-point flow. Control maps (a key
//! matching a registered control, e.g. `for`) are dispatched to handlers
//! registered in the [ControlRegistry].
//!
//! ### Logging
//!
//! The engine traces every rewrite step via `tracing`; tests typically
//! install a subscriber filtered by the `STRATA_LOG` environment variable.

mod binding;
mod document;
mod expr;
mod flow;
mod node;
mod visit;

pub use binding::{Binding, Features, State, TagBinding, TagError, TagScope};
pub use document::{parse_document, DocumentError};
pub use expr::{
    parse as parse_expression, BinOp, Expr, Info, MarkerExpr, MergeExpr, ParseError, RefStep,
};
pub use flow::control::{Control, ControlHandler, ControlRegistry};
pub use flow::driver::{flow, flow_with, nested_flow, FlowError, FlowIssue};
pub use node::{
    find_path, sorted_keys, Annotation, Issue, Node, NodeFlags, TemplateValue, Value,
};
pub use visit::{Visit, VisitNodes};

/// Convenience entry: parse YAML sources and flow them.
///
/// The first argument is the source document, the rest are stubs in
/// precedence order (first wins).
pub fn flow_sources(source: &str, stubs: &[&str]) -> anyhow::Result<Node> {
    let source = parse_document(source, "source")?;
    let mut stub_nodes = Vec::with_capacity(stubs.len());
    for (index, stub) in stubs.iter().enumerate() {
        stub_nodes.push(parse_document(stub, &format!("stub-{index}"))?);
    }
    flow(&source, &stub_nodes).map_err(|err| anyhow::anyhow!("{err}"))
}
