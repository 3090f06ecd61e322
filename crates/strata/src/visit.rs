//! visitor pattern helpers

use crate::node::{sorted_keys, Node, Value};

/// Visitor that receives every node together with its document path.
pub trait Visit {
    fn visit(&mut self, path: &[String], node: &Node);
}

// blanket impl for FnMut
impl<F> Visit for F
where
    F: FnMut(&[String], &Node),
{
    fn visit(&mut self, path: &[String], node: &Node) {
        self(path, node)
    }
}

/// Recursively visit all nodes of a subtree.
///
/// Maps are visited in sorted-key order, lists positionally with `[index]`
/// path steps, matching the walk order of the engine itself.
pub trait VisitNodes {
    fn visit_nodes(&self, visitor: &mut dyn Visit);
}

impl VisitNodes for Node {
    fn visit_nodes(&self, visitor: &mut dyn Visit) {
        let mut path = Vec::new();
        walk(self, &mut path, visitor);
    }
}

fn walk(node: &Node, path: &mut Vec<String>, visitor: &mut dyn Visit) {
    visitor.visit(path, node);
    match node.value() {
        Value::Object(map) => {
            for key in sorted_keys(map) {
                if let Some(child) = map.get(&key) {
                    path.push(key);
                    walk(child, path, visitor);
                    path.pop();
                }
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                path.push(format!("[{index}]"));
                walk(child, path, visitor);
                path.pop();
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indexmap::IndexMap;

    #[test]
    fn walks_every_node_with_paths() {
        let mut map = IndexMap::new();
        map.insert("b".to_string(), Node::new(Value::Integer(2), "test"));
        map.insert(
            "a".to_string(),
            Node::new(
                Value::Array(vec![Node::new(Value::Integer(1), "test")]),
                "test",
            ),
        );
        let root = Node::new(Value::Object(map), "test");

        let mut seen = Vec::new();
        root.visit_nodes(&mut |path: &[String], _node: &Node| {
            seen.push(path.join("."));
        });

        assert_eq!(seen, vec!["", "a", "a.[0]", "b"]);
    }
}
