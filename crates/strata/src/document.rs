//! document boundary
//!
//! Converts parsed YAML into annotated [Node] trees. Only the shapes the
//! engine works on are accepted: string keys, `i64`/`f64` numbers. The
//! conversion attaches the document's source name to every node so
//! diagnostics can point back to their origin.

use crate::node::{Node, Value};
use indexmap::IndexMap;

#[derive(thiserror::Error, Debug)]
pub enum DocumentError {
    #[error("unable to parse yaml document")]
    YamlParseFailed(#[from] serde_yaml::Error),
    #[error("map keys must be strings, found {0}")]
    NonStringKey(String),
    #[error("number out of range: {0}")]
    NumberOutOfRange(String),
}

/// Parses YAML text into an annotated node tree.
pub fn parse_document(source: &str, source_name: &str) -> Result<Node, DocumentError> {
    let value: serde_yaml::Value = serde_yaml::from_str(source)?;
    convert(value, source_name)
}

fn convert(value: serde_yaml::Value, source_name: &str) -> Result<Node, DocumentError> {
    use serde_yaml::Value as Yaml;

    let value = match value {
        Yaml::Null => Value::Null,
        Yaml::Bool(value) => Value::Boolean(value),
        Yaml::Number(number) => {
            if let Some(value) = number.as_i64() {
                Value::Integer(value)
            } else if let Some(value) = number.as_f64() {
                Value::Decimal(value)
            } else {
                return Err(DocumentError::NumberOutOfRange(number.to_string()));
            }
        }
        Yaml::String(value) => Value::String(value),
        Yaml::Sequence(items) => Value::Array(
            items
                .into_iter()
                .map(|item| convert(item, source_name))
                .collect::<Result<Vec<Node>, DocumentError>>()?,
        ),
        Yaml::Mapping(mapping) => {
            let mut map = IndexMap::new();
            for (key, value) in mapping {
                let Yaml::String(key) = key else {
                    return Err(DocumentError::NonStringKey(format!("{key:?}")));
                };
                map.insert(key, convert(value, source_name)?);
            }
            Value::Object(map)
        }
        Yaml::Tagged(tagged) => return convert(tagged.value, source_name),
    };
    Ok(Node::new(value, source_name))
}

/// Utility macro to build a document [Node] from YAML text.
///
/// ```
/// let doc = strata::document!("a: 1");
/// assert!(doc.value().is_object());
///
/// let named = strata::document!("stub" => "a: 2");
/// assert_eq!(named.source_name(), "stub");
/// ```
///
/// # Panic
/// Panics on invalid input.
///
/// ```should_panic
/// strata::document!(": not : valid : yaml :");
/// ```
#[macro_export]
macro_rules! document {
    ($source:expr) => {
        $crate::parse_document($source, "test").expect("document must parse")
    };
    ($name:expr => $source:expr) => {
        $crate::parse_document($source, $name).expect("document must parse")
    };
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn converts_scalars_and_containers() {
        let doc = parse_document(
            "a: 1\nb: text\nc:\n- true\n- 2.5\nd: ~\n",
            "doc",
        )
        .unwrap();
        let map = doc.value().as_object().unwrap();
        assert_eq!(map.get("a").unwrap().value(), &Value::Integer(1));
        assert_eq!(
            map.get("b").unwrap().value(),
            &Value::String("text".to_string())
        );
        let list = map.get("c").unwrap().value().as_array().unwrap();
        assert_eq!(list[0].value(), &Value::Boolean(true));
        assert_eq!(list[1].value(), &Value::Decimal(2.5));
        assert_eq!(map.get("d").unwrap().value(), &Value::Null);
    }

    #[test]
    fn preserves_map_order() {
        let doc = parse_document("z: 1\na: 2\nm: 3\n", "doc").unwrap();
        let keys: Vec<&String> = doc.value().as_object().unwrap().keys().collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn merge_key_stays_a_plain_key() {
        let doc = parse_document("<<: (( merge ))\na: 1\n", "doc").unwrap();
        let map = doc.value().as_object().unwrap();
        assert_eq!(
            map.get("<<").unwrap().value().as_str(),
            Some("(( merge ))")
        );
    }

    #[test]
    fn rejects_non_string_keys() {
        let err = parse_document("1: x\n", "doc").unwrap_err();
        assert!(matches!(err, DocumentError::NonStringKey(_)));
    }

    #[test]
    fn source_name_is_attached_everywhere() {
        let doc = parse_document("a:\n  b: 1\n", "origin").unwrap();
        let inner = crate::node::find_path(&doc, &["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(inner.source_name(), "origin");
    }
}
