use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys owned by the store; never kept inside `properties`.
pub const NODE_RESERVED_KEYS: [&str; 4] = ["@type", "@id", "created_at", "updated_at"];

/// A typed graph entity in its JSON-LD wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "@type")]
    pub node_type: String,
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl Node {
    pub fn new(node_type: &str, id: &str, now: &str, data: Map<String, Value>) -> Self {
        Self {
            node_type: node_type.to_string(),
            id: id.to_string(),
            created_at: now.to_string(),
            updated_at: now.to_string(),
            properties: strip_reserved(data, &NODE_RESERVED_KEYS),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn str_prop(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    /// Shallow merge (`merge = true`) or full replacement of the properties.
    pub fn apply_update(&mut self, data: Map<String, Value>, merge: bool, now: &str) {
        let data = strip_reserved(data, &NODE_RESERVED_KEYS);
        if merge {
            self.properties.extend(data);
        } else {
            self.properties = data;
        }
        self.updated_at = now.to_string();
    }

    /// Exact equality on every filter key. Reserved keys compare against
    /// the fixed fields.
    pub fn matches(&self, filters: &Map<String, Value>) -> bool {
        filters.iter().all(|(key, expected)| match key.as_str() {
            "@type" => expected.as_str() == Some(self.node_type.as_str()),
            "@id" => expected.as_str() == Some(self.id.as_str()),
            "created_at" => expected.as_str() == Some(self.created_at.as_str()),
            "updated_at" => expected.as_str() == Some(self.updated_at.as_str()),
            _ => self.properties.get(key) == Some(expected),
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub(crate) fn strip_reserved(mut data: Map<String, Value>, reserved: &[&str]) -> Map<String, Value> {
    for key in reserved {
        data.remove(*key);
    }
    data
}

/// `{type lowercased}:{12 hex}`
pub fn generate_node_id(node_type: &str) -> String {
    format!("{}:{}", node_type.to_lowercase(), short_hex())
}

pub(crate) fn short_hex() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_wire_shape_is_flat_json_ld() {
        let node = Node::new(
            "Task",
            "task:abc",
            "2025-01-01T00:00:00+13:00",
            props(json!({"name": "Ship it", "tags": ["a", "b"]})),
        );
        let v = node.to_value();
        assert_eq!(v["@type"], "Task");
        assert_eq!(v["@id"], "task:abc");
        assert_eq!(v["name"], "Ship it");
        assert_eq!(v["tags"][1], "b");
        assert!(v.get("properties").is_none());
    }

    #[test]
    fn test_round_trip_preserves_nested_values() {
        let node = Node::new(
            "Goal",
            "goal:1",
            "2025-01-01T00:00:00+13:00",
            props(json!({"meta": {"score": 0.5, "flags": [true, null]}, "n": 7})),
        );
        let text = serde_json::to_string(&node).unwrap();
        let back: Node = serde_json::from_str(&text).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_reserved_keys_are_dropped_from_data() {
        let node = Node::new(
            "Task",
            "task:1",
            "t0",
            props(json!({"@id": "spoof", "created_at": "never", "x": 1})),
        );
        assert_eq!(node.id, "task:1");
        assert_eq!(node.created_at, "t0");
        assert_eq!(node.properties.len(), 1);
    }

    #[test]
    fn test_merge_and_replace() {
        let mut merged = Node::new("Task", "task:1", "t0", props(json!({"x": 1, "y": 2})));
        merged.apply_update(props(json!({"y": 3})), true, "t1");
        assert_eq!(Value::Object(merged.properties.clone()), json!({"x": 1, "y": 3}));
        assert_eq!(merged.updated_at, "t1");
        assert_eq!(merged.created_at, "t0");

        let mut replaced = Node::new("Task", "task:1", "t0", props(json!({"x": 1, "y": 2})));
        replaced.apply_update(props(json!({"y": 3})), false, "t1");
        assert_eq!(Value::Object(replaced.properties.clone()), json!({"y": 3}));
        assert_eq!(replaced.node_type, "Task");
    }

    #[test]
    fn test_filters_are_exact_and_conjunctive() {
        let node = Node::new("Task", "task:1", "t0", props(json!({"status": "pending", "p": 2})));
        assert!(node.matches(&props(json!({"status": "pending"}))));
        assert!(node.matches(&props(json!({"status": "pending", "p": 2}))));
        assert!(!node.matches(&props(json!({"status": "pending", "p": "2"}))));
        assert!(!node.matches(&props(json!({"missing": null}))));
        assert!(node.matches(&props(json!({"@type": "Task"}))));
    }

    #[test]
    fn test_generated_id_prefix() {
        let id = generate_node_id("Topic");
        let (prefix, hex) = id.split_once(':').unwrap();
        assert_eq!(prefix, "topic");
        assert_eq!(hex.len(), 12);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
