//! evaluation environment
//!
//! A [Binding] carries everything a rewrite step needs to know about its
//! position: the document path, the stub path (they diverge after a
//! redirect), the scope chain for reference resolution and the shared
//! per-run [State]. Bindings are immutable; every `with_*` method returns a
//! new binding and shares the expensive parts via reference counting.

use crate::flow::control::ControlRegistry;
use crate::node::{find_path, Node};
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Upper bound for nested template substitutions. Self-referential
/// templates exhaust the bound and report instead of looping.
const MAX_SUBSTITUTION_DEPTH: usize = 64;

/// Feature switches for a flow run.
#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
    /// Recognize `(( ... ))` substrings inside larger scalars and
    /// concatenate them with the literal spans.
    pub interpolation: bool,
}

/// Scope of a published tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagScope {
    /// Visible within the current document stream.
    Stream,
    /// Visible across nested flows (leading `*` on the tag).
    Global,
}

/// A resolved node published under a tag name.
#[derive(derive_new::new, Debug, Clone)]
pub struct TagBinding {
    pub node: Node,
    pub path: Vec<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum TagError {
    #[error("duplicate tag '{name}' (already set for {path})")]
    Duplicate { name: String, path: String },
}

/// Shared per-run state: the tag registry, feature switches, the control
/// registry and the substitution depth guard.
///
/// The state is owned by the binding chain rather than by the module so
/// that independent flow invocations cannot interfere.
#[derive(Debug)]
pub struct State {
    tags: RefCell<HashMap<(TagScope, String), TagBinding>>,
    features: Features,
    controls: ControlRegistry,
    depth: Cell<usize>,
}

impl State {
    pub fn new(features: Features) -> State {
        State {
            tags: RefCell::new(HashMap::new()),
            features,
            controls: ControlRegistry::with_builtins(),
            depth: Cell::new(0),
        }
    }

    pub fn interpolation_enabled(&self) -> bool {
        self.features.interpolation
    }

    pub fn controls(&self) -> &ControlRegistry {
        &self.controls
    }

    /// Registers an additional control construct. `*`-prefixed specs
    /// declare options, plain specs declare allowed fields.
    pub fn register_control(
        &self,
        name: &str,
        handler: crate::flow::control::ControlHandler,
        specs: &[&str],
    ) {
        self.controls.register(name, handler, specs);
    }

    /// Publishes a resolved node under a tag name.
    ///
    /// Re-publication for the same document path is idempotent; a second
    /// path claiming the name is a conflict.
    pub fn set_tag(
        &self,
        name: &str,
        node: &Node,
        path: &[String],
        scope: TagScope,
    ) -> Result<(), TagError> {
        let key = (scope, name.to_string());
        let mut tags = self.tags.borrow_mut();
        if let Some(existing) = tags.get(&key) {
            if existing.path != path {
                return Err(TagError::Duplicate {
                    name: name.to_string(),
                    path: existing.path.join("."),
                });
            }
        }
        tracing::trace!(name, scope = ?scope, path = ?path, "publish tag");
        tags.insert(key, TagBinding::new(node.clone(), path.to_vec()));
        Ok(())
    }

    /// Looks a tag up, stream scope before global.
    pub fn lookup_tag(&self, name: &str) -> Option<Node> {
        let tags = self.tags.borrow();
        for scope in [TagScope::Stream, TagScope::Global] {
            if let Some(binding) = tags.get(&(scope, name.to_string())) {
                return Some(binding.node.clone());
            }
        }
        None
    }

    /// Clears the per-run registry once the owning environment finishes.
    pub fn cleanup(&self) {
        self.tags.borrow_mut().clear();
        self.depth.set(0);
    }

    pub(crate) fn enter_substitution(&self) -> bool {
        let depth = self.depth.get();
        if depth >= MAX_SUBSTITUTION_DEPTH {
            return false;
        }
        self.depth.set(depth + 1);
        true
    }

    pub(crate) fn leave_substitution(&self) {
        let depth = self.depth.get();
        self.depth.set(depth.saturating_sub(1));
    }
}

/// One frame of the scope chain.
#[derive(Debug)]
struct Scope {
    entries: IndexMap<String, Node>,
    /// Local frames (controls, substitutions) follow template
    /// materialization into the captured binding; static map frames do not.
    local: bool,
    parent: Option<Rc<Scope>>,
}

/// The immutable evaluation context threaded through the walk.
#[derive(Debug, Clone)]
pub struct Binding {
    path: Vec<String>,
    stub_path: Vec<String>,
    source_name: String,
    scope: Option<Rc<Scope>>,
    stubs: Rc<Vec<Node>>,
    state: Rc<State>,
    no_merge: bool,
}

impl Binding {
    pub fn new(stubs: Vec<Node>, source_name: &str, features: Features) -> Binding {
        Binding {
            path: Vec::new(),
            stub_path: Vec::new(),
            source_name: source_name.to_string(),
            scope: None,
            stubs: Rc::new(stubs),
            state: Rc::new(State::new(features)),
            no_merge: false,
        }
    }

    /// A binding for a nested flow: fresh paths and stubs, shared state,
    /// inherited scope chain.
    pub fn nested(&self, stubs: Vec<Node>, source_name: &str) -> Binding {
        Binding {
            path: Vec::new(),
            stub_path: Vec::new(),
            source_name: source_name.to_string(),
            scope: self.scope.clone(),
            stubs: Rc::new(stubs),
            state: Rc::clone(&self.state),
            no_merge: self.no_merge,
        }
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn stub_path(&self) -> &[String] {
        &self.stub_path
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn no_merge(&self) -> bool {
        self.no_merge
    }

    /// Descend one step; document and stub path move together.
    pub fn with_path(&self, step: &str) -> Binding {
        let mut next = self.clone();
        next.path.push(step.to_string());
        next.stub_path.push(step.to_string());
        next
    }

    /// Point further stub lookups at an absolute path.
    pub fn redirect_overwrite(&self, path: Vec<String>) -> Binding {
        let mut next = self.clone();
        next.stub_path = path;
        next
    }

    pub fn with_source(&self, source_name: &str) -> Binding {
        let mut next = self.clone();
        next.source_name = source_name.to_string();
        next
    }

    pub fn with_no_merge(&self) -> Binding {
        let mut next = self.clone();
        next.no_merge = true;
        next
    }

    /// Push a static scope frame (the entries of the map being flowed).
    pub fn with_scope(&self, entries: &IndexMap<String, Node>) -> Binding {
        self.push_scope(entries.clone(), false)
    }

    /// Push a local scope frame (control variables, substitution scopes).
    pub fn with_local_scope(&self, entries: IndexMap<String, Node>) -> Binding {
        self.push_scope(entries, true)
    }

    fn push_scope(&self, entries: IndexMap<String, Node>, local: bool) -> Binding {
        let mut next = self.clone();
        next.scope = Some(Rc::new(Scope {
            entries,
            local,
            parent: self.scope.clone(),
        }));
        next
    }

    /// The local frames of this binding, outermost first. Substitution
    /// overlays them onto a template's captured binding.
    pub(crate) fn local_frames(&self) -> Vec<IndexMap<String, Node>> {
        let mut frames = Vec::new();
        let mut current = self.scope.as_ref();
        while let Some(scope) = current {
            if scope.local {
                frames.push(scope.entries.clone());
            }
            current = scope.parent.as_ref();
        }
        frames.reverse();
        frames
    }

    /// Resolve the first segment of a reference: scope chain inside-out,
    /// then the tag registry.
    pub fn resolve_symbol(&self, name: &str) -> Option<Node> {
        let mut current = self.scope.as_ref();
        while let Some(scope) = current {
            if let Some(node) = scope.entries.get(name) {
                return Some(node.clone());
            }
            current = scope.parent.as_ref();
        }
        self.state.lookup_tag(name)
    }

    /// Looks a path up in the stubs, first match wins.
    pub fn find_in_stubs(&self, path: &[String]) -> Option<Node> {
        for stub in self.stubs.iter() {
            if let Some(found) = find_path(stub, path) {
                tracing::trace!(path = ?path, source = found.source_name(), "stub hit");
                return Some(found.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::Value;
    use pretty_assertions::assert_eq;

    fn entries(pairs: &[(&str, i64)]) -> IndexMap<String, Node> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Node::new(Value::Integer(*v), "test")))
            .collect()
    }

    #[test]
    fn scope_resolution_is_inside_out() {
        let env = Binding::new(Vec::new(), "test", Features::default());
        let env = env.with_scope(&entries(&[("a", 1), ("b", 2)]));
        let env = env.with_local_scope(entries(&[("a", 10)]));

        assert_eq!(
            env.resolve_symbol("a").unwrap().value(),
            &Value::Integer(10)
        );
        assert_eq!(env.resolve_symbol("b").unwrap().value(), &Value::Integer(2));
        assert!(env.resolve_symbol("c").is_none());
    }

    #[test]
    fn local_frames_exclude_static_scopes() {
        let env = Binding::new(Vec::new(), "test", Features::default());
        let env = env.with_scope(&entries(&[("s", 1)]));
        let env = env.with_local_scope(entries(&[("outer", 1)]));
        let env = env.with_local_scope(entries(&[("inner", 2)]));

        let frames = env.local_frames();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains_key("outer"));
        assert!(frames[1].contains_key("inner"));
    }

    #[test]
    fn tag_registry_detects_conflicts() {
        let state = State::new(Features::default());
        let node = Node::new(Value::Integer(1), "test");
        state
            .set_tag("x", &node, &["a".to_string()], TagScope::Global)
            .unwrap();
        // same path is idempotent
        state
            .set_tag("x", &node, &["a".to_string()], TagScope::Global)
            .unwrap();
        let err = state
            .set_tag("x", &node, &["b".to_string()], TagScope::Global)
            .unwrap_err();
        assert!(err.to_string().contains("duplicate tag 'x'"));
    }

    #[test]
    fn redirect_moves_only_the_stub_path() {
        let env = Binding::new(Vec::new(), "test", Features::default());
        let env = env.with_path("a").redirect_overwrite(vec!["b".to_string()]);
        let env = env.with_path("c");
        assert_eq!(env.path(), ["a", "c"]);
        assert_eq!(env.stub_path(), ["b", "c"]);
    }
}
