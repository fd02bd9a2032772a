//! Conversions between JSON-LD records and Bolt values.
//!
//! Neo4j properties cannot hold maps, heterogeneous lists or nulls, so
//! those values are written as JSON strings. The keys written that way are
//! listed in the `_json_props` property and only those are parsed back on
//! read; every other string comes back verbatim.
//!
//! User keys named `id` or starting with `_` are stored under a `_user_`
//! prefix so they never collide with the fields the store owns.

use std::collections::{HashMap, HashSet};

use neo4rs::{BoltType, Row};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{GraphError, Result};
use crate::models::{Edge, Node, EDGE_TYPE};

/// Shared label carried by every node this backend writes.
pub const NODE_LABEL: &str = "GraphNode";

/// Stored list of the property keys that hold JSON text.
pub const JSON_KEYS: &str = "_json_props";

const USER_PREFIX: &str = "_user_";

/// Stored property name for a user key.
pub fn stored_key(key: &str) -> String {
    if key == "id" || key.starts_with('_') {
        format!("{}{}", USER_PREFIX, key)
    } else {
        key.to_string()
    }
}

/// Inverse of [`stored_key`].
pub fn user_key(stored: &str) -> String {
    stored
        .strip_prefix(USER_PREFIX)
        .unwrap_or(stored)
        .to_string()
}

/// Values Neo4j cannot store natively.
pub fn needs_json(value: &Value) -> bool {
    matches!(value, Value::Null | Value::Array(_) | Value::Object(_))
}

pub fn encode_value(value: &Value) -> BoltType {
    match value {
        Value::Bool(b) => BoltType::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => BoltType::from(i),
            None => BoltType::from(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => BoltType::from(s.clone()),
        Value::Null | Value::Array(_) | Value::Object(_) => BoltType::from(value.to_string()),
    }
}

/// Stored user properties and the stored keys that were JSON-encoded.
/// The key list is not part of the map.
pub fn encode_user_props(props: &Map<String, Value>) -> (HashMap<String, BoltType>, Vec<String>) {
    let mut encoded = HashMap::with_capacity(props.len());
    let mut json_keys = Vec::new();
    for (key, value) in props {
        let stored = stored_key(key);
        if needs_json(value) {
            json_keys.push(stored.clone());
        }
        encoded.insert(stored, encode_value(value));
    }
    json_keys.sort();
    (encoded, json_keys)
}

/// Stored user properties including the `_json_props` list.
pub fn encode_props(props: &Map<String, Value>) -> HashMap<String, BoltType> {
    let (mut encoded, json_keys) = encode_user_props(props);
    if !json_keys.is_empty() {
        encoded.insert(JSON_KEYS.into(), BoltType::from(json_keys));
    }
    encoded
}

/// Undo [`encode_value`]. Only values whose key was recorded as JSON are
/// parsed.
pub fn decode_value(value: Value, json_encoded: bool) -> Value {
    match value {
        Value::String(s) if json_encoded => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        other => other,
    }
}

fn take_json_keys(props: &mut Map<String, Value>) -> HashSet<String> {
    match props.remove(JSON_KEYS) {
        Some(Value::Array(keys)) => keys
            .into_iter()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect(),
        _ => HashSet::new(),
    }
}

/// User properties from what is left of a stored map once the fixed
/// fields are taken out.
fn decode_props(mut props: Map<String, Value>) -> Map<String, Value> {
    let json_keys = take_json_keys(&mut props);
    props
        .into_iter()
        .map(|(k, v)| {
            let value = decode_value(v, json_keys.contains(&k));
            (user_key(&k), value)
        })
        .collect()
}

/// `hasTopic` -> `HASTOPIC`, `depends-on` -> `DEPENDS_ON`.
pub fn relationship_type(relation: &str) -> String {
    let mapped: String = relation
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    if mapped.is_empty() || mapped.starts_with(|c: char| c.is_ascii_digit()) {
        format!("R_{}", mapped)
    } else {
        mapped
    }
}

/// Backtick-quoted identifier for labels and property keys.
pub fn quote(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

pub fn field<T: DeserializeOwned>(row: &Row, key: &str) -> Result<T> {
    row.get::<T>(key)
        .map_err(|e| GraphError::storage("neo4j", format!("column {}: {}", key, e)))
}

/// Build a node from `properties(n) AS props, labels(n) AS labels`.
pub fn node_from_parts(mut props: Map<String, Value>, labels: &[String]) -> Result<Node> {
    let id = match props.remove("id") {
        Some(Value::String(id)) => id,
        _ => return Err(GraphError::storage("neo4j", "node without a string id property")),
    };
    let node_type = labels
        .iter()
        .find(|l| l.as_str() != NODE_LABEL)
        .cloned()
        .unwrap_or_else(|| NODE_LABEL.to_string());
    let created_at = take_string(&mut props, "created_at");
    let updated_at = take_string(&mut props, "updated_at");

    Ok(Node {
        node_type,
        id,
        created_at,
        updated_at,
        properties: decode_props(props),
    })
}

pub fn node_from_row(row: &Row) -> Result<Node> {
    let props: Map<String, Value> = field(row, "props")?;
    let labels: Vec<String> = field(row, "labels")?;
    node_from_parts(props, &labels)
}

/// Build an edge from `startNode(r).id AS from_id, endNode(r).id AS to_id,
/// type(r) AS rel_type, properties(r) AS props`.
pub fn edge_from_parts(
    mut props: Map<String, Value>,
    from_id: String,
    to_id: String,
    rel_type: &str,
) -> Edge {
    let relation = match props.remove("relation") {
        Some(Value::String(r)) => r,
        _ => rel_type.to_lowercase(),
    };
    let id = take_string(&mut props, "id");
    let created_at = take_string(&mut props, "created_at");
    Edge {
        id,
        kind: EDGE_TYPE.to_string(),
        from_id,
        relation,
        to_id,
        created_at,
        properties: decode_props(props),
    }
}

pub fn edge_from_row(row: &Row) -> Result<Edge> {
    let props: Map<String, Value> = field(row, "props")?;
    let from_id: String = field(row, "from_id")?;
    let to_id: String = field(row, "to_id")?;
    let rel_type: String = field(row, "rel_type")?;
    Ok(edge_from_parts(props, from_id, to_id, &rel_type))
}

fn take_string(props: &mut Map<String, Value>, key: &str) -> String {
    match props.remove(key) {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Stored property map for a node: user properties plus the fixed fields.
pub fn node_props(node: &Node) -> HashMap<String, BoltType> {
    let mut props = encode_props(&node.properties);
    props.insert("id".into(), BoltType::from(node.id.clone()));
    props.insert("created_at".into(), BoltType::from(node.created_at.clone()));
    props.insert("updated_at".into(), BoltType::from(node.updated_at.clone()));
    props
}

pub fn edge_props(edge: &Edge) -> HashMap<String, BoltType> {
    let mut props = encode_props(&edge.properties);
    props.insert("id".into(), BoltType::from(edge.id.clone()));
    props.insert("relation".into(), BoltType::from(edge.relation.clone()));
    props.insert("created_at".into(), BoltType::from(edge.created_at.clone()));
    props
}

/// Columns every edge query returns.
pub const EDGE_COLUMNS: &str =
    "startNode(r).id AS from_id, endNode(r).id AS to_id, type(r) AS rel_type, properties(r) AS props";

pub const NODE_COLUMNS: &str = "properties(n) AS props, labels(n) AS labels";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_relationship_type_mapping() {
        assert_eq!(relationship_type("hasTopic"), "HASTOPIC");
        assert_eq!(relationship_type("depends-on"), "DEPENDS_ON");
        assert_eq!(relationship_type("supports goal"), "SUPPORTS_GOAL");
        assert_eq!(relationship_type("2x"), "R_2X");
    }

    #[test]
    fn test_quote_escapes_backticks() {
        assert_eq!(quote("Task"), "`Task`");
        assert_eq!(quote("we`ird"), "`we``ird`");
    }

    /// What a `properties(n)` column yields for a map written with
    /// [`encode_props`]: strings stay strings, the key list comes back as a
    /// JSON array.
    fn as_read_back(props: HashMap<String, BoltType>) -> Map<String, Value> {
        props
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    BoltType::String(s) => Value::String(s.value),
                    BoltType::Integer(i) => json!(i.value),
                    BoltType::Float(f) => json!(f.value),
                    BoltType::Boolean(b) => json!(b.value),
                    BoltType::List(list) => Value::Array(
                        list.value
                            .into_iter()
                            .filter_map(|item| match item {
                                BoltType::String(s) => Some(Value::String(s.value)),
                                _ => None,
                            })
                            .collect(),
                    ),
                    other => panic!("unexpected stored value {:?}", other),
                };
                (k, value)
            })
            .collect()
    }

    #[test]
    fn test_only_recorded_keys_are_decoded() {
        let encoded = encode_value(&json!("[1, 2]"));
        assert_eq!(encoded, BoltType::from("[1, 2]".to_string()));
        assert_eq!(decode_value(json!("[1, 2]"), false), json!("[1, 2]"));
        assert_eq!(decode_value(json!("[1,2]"), true), json!([1, 2]));
        assert_eq!(decode_value(json!("null"), true), Value::Null);
    }

    #[test]
    fn test_node_properties_round_trip() {
        let data = json!({
            "name": "Ship",
            "looks_like_list": "[1, 2]",
            "looks_like_map": "{\"k\": 1}",
            "meta": {"k": 1, "tags": ["a", "b"]},
            "mixed": [1, "two", null],
            "cleared": null,
            "id": "external-7",
            "_private": true,
            "count": 3
        });
        let node = Node::new("Task", "task:1", "t0", data.as_object().cloned().unwrap());

        let stored = node_props(&node);
        assert_eq!(stored["id"], BoltType::from("task:1".to_string()));
        assert_eq!(stored["_user_id"], BoltType::from("external-7".to_string()));
        assert!(stored.contains_key("_user__private"));

        let back = node_from_parts(
            as_read_back(stored),
            &["GraphNode".to_string(), "Task".to_string()],
        )
        .unwrap();
        assert_eq!(back.id, "task:1");
        assert_eq!(back.properties, node.properties);
        assert!(back.properties.get(JSON_KEYS).is_none());
    }

    #[test]
    fn test_json_key_list_names_stored_keys() {
        let data = json!({"plain": "x", "nested": [1], "id": null});
        let (encoded, json_keys) = encode_user_props(data.as_object().unwrap());
        assert_eq!(json_keys, vec!["_user_id", "nested"]);
        assert!(!encoded.contains_key(JSON_KEYS));
        assert!(encode_props(data.as_object().unwrap()).contains_key(JSON_KEYS));
        assert!(!encode_props(json!({"a": 1}).as_object().unwrap()).contains_key(JSON_KEYS));
    }

    #[test]
    fn test_key_escaping_is_reversible() {
        for key in ["name", "id", "_json_props", "_user_id", "__x"] {
            assert_eq!(user_key(&stored_key(key)), key);
        }
        assert_eq!(stored_key("name"), "name");
        assert_eq!(stored_key("_json_props"), "_user__json_props");
    }

    #[test]
    fn test_node_from_parts_picks_type_label() {
        let props = json!({
            "id": "task:1",
            "created_at": "t0",
            "updated_at": "t1",
            "name": "Ship",
            "tags": "[\"x\"]",
            "_json_props": ["tags"]
        });
        let node = node_from_parts(
            props.as_object().cloned().unwrap(),
            &["GraphNode".to_string(), "Task".to_string()],
        )
        .unwrap();
        assert_eq!(node.node_type, "Task");
        assert_eq!(node.id, "task:1");
        assert_eq!(node.updated_at, "t1");
        assert_eq!(node.properties["tags"], json!(["x"]));
        assert!(node.properties.get("id").is_none());
    }

    #[test]
    fn test_edge_from_parts_prefers_stored_relation() {
        let props = json!({
            "id": "edge:1",
            "relation": "hasTopic",
            "created_at": "t0",
            "weight": 0.5,
            "_user_id": "ext",
            "note": null
        });
        let edge = edge_from_parts(
            props.as_object().cloned().unwrap(),
            "a".into(),
            "b".into(),
            "HASTOPIC",
        );
        assert_eq!(edge.relation, "hasTopic");
        assert_eq!(edge.id, "edge:1");
        assert_eq!(edge.properties["weight"], 0.5);
        assert_eq!(edge.properties["id"], "ext");
        // Nothing recorded the key as JSON, so a native null stays null.
        assert_eq!(edge.properties["note"], Value::Null);

        let bare = edge_from_parts(Map::new(), "a".into(), "b".into(), "DEPENDSON");
        assert_eq!(bare.relation, "dependson");
    }
}
