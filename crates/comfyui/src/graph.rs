//! Typed node-graph model.
//!
//! Two serializations exist for the same graph. The *API format* is
//! what gets submitted for execution: a flat map of node id →
//! `{class_type, inputs}` where each input is either a literal value
//! or a link to another node's output slot. The *UI format* is the
//! editor's serialization (separate node and link lists, cosmetic
//! nodes included); it is only ever read, never submitted.
//!
//! `BTreeMap` keeps node iteration deterministic (id order), which the
//! artifact-selection fallback and reference-image wiring rely on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Execution-ready graph: node id → node. Submitted as the `prompt`
/// field of `POST /prompt`.
pub type NodeGraph = BTreeMap<String, Node>;

/// A single processing node in API format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// ComfyUI class identifier, e.g. `"KSampler"`.
    pub class_type: String,
    /// Named inputs: literal widget values or links to other nodes.
    #[serde(default)]
    pub inputs: BTreeMap<String, InputValue>,
}

/// A node input: either a link `[source_node_id, source_slot]` or an
/// inline literal (string, number, bool).
///
/// Untagged on the wire; the link shape is tried first, matching the
/// ComfyUI convention that a two-element `[string, number]` array is
/// always a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    /// Reference to another node's output slot.
    Link(String, u32),
    /// Literal widget value.
    Value(serde_json::Value),
}

impl Node {
    /// Create a node with no inputs.
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            class_type: class_type.into(),
            inputs: BTreeMap::new(),
        }
    }

    /// Builder-style literal input.
    pub fn with_input(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.set_input(name, value);
        self
    }

    /// Builder-style link input.
    pub fn with_link(mut self, name: &str, source: &str, slot: u32) -> Self {
        self.inputs
            .insert(name.to_string(), InputValue::Link(source.to_string(), slot));
        self
    }

    /// Set a literal input, replacing any existing value or link.
    pub fn set_input(&mut self, name: &str, value: impl Into<serde_json::Value>) {
        self.inputs
            .insert(name.to_string(), InputValue::Value(value.into()));
    }

    /// Whether the node declares an input with this name (link or literal).
    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }

    /// Literal string value of an input, if present.
    pub fn input_str(&self, name: &str) -> Option<&str> {
        match self.inputs.get(name) {
            Some(InputValue::Value(serde_json::Value::String(s))) => Some(s),
            _ => None,
        }
    }

    /// The node's `text` input, if it is a literal string.
    pub fn text(&self) -> Option<&str> {
        self.input_str("text")
    }

    /// Overwrite the node's `text` input.
    pub fn set_text(&mut self, text: &str) {
        self.set_input("text", text);
    }
}

/// Node ids of a given class, in declaration order.
///
/// Node ids are numeric strings; "declaration order" means numeric
/// order, with non-numeric ids sorted lexicographically after.
pub fn node_ids_by_class(graph: &NodeGraph, class_type: &str) -> Vec<String> {
    let mut ids: Vec<String> = graph
        .iter()
        .filter(|(_, node)| node.class_type == class_type)
        .map(|(id, _)| id.clone())
        .collect();
    ids.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    });
    ids
}

// ---------------------------------------------------------------------------
// UI (editor) format
// ---------------------------------------------------------------------------

/// Editor-format graph: node list plus link table.
#[derive(Debug, Clone, Deserialize)]
pub struct UiGraph {
    #[serde(default)]
    pub nodes: Vec<UiNode>,
    /// Raw link rows `[id, src_node, src_slot, dst_node, dst_slot, ..]`;
    /// parsed leniently via [`UiLink::parse`].
    #[serde(default)]
    pub links: Vec<serde_json::Value>,
}

/// A node as serialized by the editor.
#[derive(Debug, Clone, Deserialize)]
pub struct UiNode {
    pub id: i64,
    #[serde(rename = "type")]
    pub node_type: String,
    /// Declared input slots, in slot order.
    #[serde(default)]
    pub inputs: Vec<UiInputSlot>,
    /// Inline widget values, in the class's positional widget order.
    #[serde(default)]
    pub widgets_values: Vec<serde_json::Value>,
}

/// One declared input slot of a [`UiNode`].
#[derive(Debug, Clone, Deserialize)]
pub struct UiInputSlot {
    #[serde(default)]
    pub name: String,
    /// Link id feeding this slot, if connected.
    #[serde(default)]
    pub link: Option<i64>,
}

/// A parsed link-table row.
#[derive(Debug, Clone, PartialEq)]
pub struct UiLink {
    pub id: i64,
    pub source_node: String,
    pub source_slot: u32,
    pub target_node: String,
    pub target_slot: u32,
}

impl UiLink {
    /// Parse a raw link row. Rows shorter than four elements (or with
    /// non-numeric fields) are malformed and yield `None`.
    pub fn parse(row: &serde_json::Value) -> Option<Self> {
        let row = row.as_array()?;
        if row.len() < 4 {
            return None;
        }
        Some(Self {
            id: row[0].as_i64()?,
            source_node: row[1].as_i64()?.to_string(),
            source_slot: row[2].as_u64()? as u32,
            target_node: row[3].as_i64()?.to_string(),
            target_slot: row.get(4).and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_value_roundtrips_link_and_literal() {
        let node = Node::new("KSampler")
            .with_input("seed", 7)
            .with_link("model", "2", 0);
        let raw = serde_json::to_value(&node).unwrap();
        assert_eq!(raw["inputs"]["seed"], json!(7));
        assert_eq!(raw["inputs"]["model"], json!(["2", 0]));

        let back: Node = serde_json::from_value(raw).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn link_shape_deserializes_as_link_not_literal() {
        let node: Node =
            serde_json::from_value(json!({"class_type": "VAEDecode", "inputs": {"samples": ["5", 0]}}))
                .unwrap();
        assert_eq!(
            node.inputs["samples"],
            InputValue::Link("5".to_string(), 0)
        );
    }

    #[test]
    fn text_accessors() {
        let mut node = Node::new("CLIPTextEncode").with_input("text", "old");
        assert_eq!(node.text(), Some("old"));
        node.set_text("new");
        assert_eq!(node.text(), Some("new"));
    }

    #[test]
    fn linked_text_is_not_a_literal() {
        let node = Node::new("CLIPTextEncode").with_link("text", "9", 0);
        assert_eq!(node.text(), None);
    }

    #[test]
    fn ids_by_class_sort_numerically() {
        let mut graph = NodeGraph::new();
        graph.insert("12".into(), Node::new("LoadImage"));
        graph.insert("2".into(), Node::new("LoadImage"));
        graph.insert("5".into(), Node::new("SaveImage"));
        assert_eq!(node_ids_by_class(&graph, "LoadImage"), vec!["2", "12"]);
    }

    #[test]
    fn link_row_parses_with_and_without_target_slot() {
        let full = UiLink::parse(&json!([9, 4, 0, 6, 1, "IMAGE"])).unwrap();
        assert_eq!(full.source_node, "4");
        assert_eq!(full.target_slot, 1);

        let short = UiLink::parse(&json!([9, 4, 0, 6])).unwrap();
        assert_eq!(short.target_slot, 0);

        assert!(UiLink::parse(&json!([9, 4])).is_none());
        assert!(UiLink::parse(&json!("not a row")).is_none());
    }
}
