//! UI→API graph conversion.
//!
//! Editor exports carry cosmetic nodes (notes, reroutes, groups) and a
//! separate link table; the execution API wants a flat node map with
//! inline link references. Conversion is pure: filter the cosmetic
//! nodes, keep only links whose endpoints both survive, and rebuild
//! each node's inputs from its declared slots plus its positional
//! widget values.
//!
//! A link whose source or target was filtered out is silently dropped:
//! the filtered node carried no execution semantics, so the dangling
//! edge is cosmetic too.

use std::collections::{BTreeMap, HashMap};

use fabula_core::node_classes;

use crate::graph::{InputValue, Node, NodeGraph, UiGraph, UiLink};

/// Whether raw template JSON is in editor (UI) format.
///
/// UI exports have a top-level `nodes` array; API-format graphs are a
/// flat id→node map and never contain that key.
pub fn is_ui_format(raw: &serde_json::Value) -> bool {
    raw.get("nodes").is_some()
}

/// Parse raw template JSON into an API-format graph, converting from
/// the editor format when necessary.
pub fn graph_from_json(raw: &str) -> Result<NodeGraph, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    if is_ui_format(&value) {
        let ui: UiGraph = serde_json::from_value(value)?;
        Ok(to_api_format(&ui))
    } else {
        serde_json::from_value(value)
    }
}

/// Convert an editor-format graph to the execution (API) format.
///
/// Pure, no I/O. Idempotent in the sense that an API-format graph
/// round-tripped through serde is untouched — only UI exports have
/// anything to convert.
pub fn to_api_format(ui: &UiGraph) -> NodeGraph {
    let surviving: Vec<&crate::graph::UiNode> = ui
        .nodes
        .iter()
        .filter(|n| !node_classes::is_ui_only(&n.node_type))
        .collect();
    let surviving_ids: std::collections::HashSet<String> =
        surviving.iter().map(|n| n.id.to_string()).collect();

    // Link table keyed by link id; only edges between surviving nodes.
    let mut link_table: HashMap<i64, UiLink> = HashMap::new();
    for row in &ui.links {
        if let Some(link) = UiLink::parse(row) {
            if surviving_ids.contains(&link.source_node)
                && surviving_ids.contains(&link.target_node)
            {
                link_table.insert(link.id, link);
            } else {
                tracing::debug!(
                    link_id = link.id,
                    source = %link.source_node,
                    target = %link.target_node,
                    "Dropping link with filtered endpoint",
                );
            }
        }
    }

    let mut graph = NodeGraph::new();
    for ui_node in surviving {
        let mut inputs: BTreeMap<String, InputValue> = BTreeMap::new();

        // Connected slots resolve to links.
        for (slot_index, slot) in ui_node.inputs.iter().enumerate() {
            let name = if slot.name.is_empty() {
                format!("input_{slot_index}")
            } else {
                slot.name.clone()
            };
            if let Some(link) = slot.link.and_then(|id| link_table.get(&id)) {
                inputs.insert(
                    name,
                    InputValue::Link(link.source_node.clone(), link.source_slot),
                );
            }
        }

        // Inline widget values map positionally, per the class's
        // declared widget layout. Unknown classes keep links only.
        if let Some(layout) = node_classes::widget_layout(&ui_node.node_type) {
            for (name, value) in layout.iter().zip(ui_node.widgets_values.iter()) {
                inputs
                    .entry(name.to_string())
                    .or_insert_with(|| InputValue::Value(value.clone()));
            }
        }

        graph.insert(
            ui_node.id.to_string(),
            Node {
                class_type: ui_node.node_type.clone(),
                inputs,
            },
        );
    }

    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn sample_ui_graph() -> UiGraph {
        serde_json::from_value(json!({
            "nodes": [
                {
                    "id": 1,
                    "type": "CheckpointLoaderSimple",
                    "inputs": [],
                    "widgets_values": ["dreamshaper.safetensors"]
                },
                {
                    "id": 2,
                    "type": "CLIPTextEncode",
                    "inputs": [{"name": "clip", "link": 10}],
                    "widgets_values": ["a castle at dusk"]
                },
                {
                    "id": 3,
                    "type": "Note",
                    "inputs": [],
                    "widgets_values": ["remember to tweak cfg"]
                },
                {
                    "id": 4,
                    "type": "SaveImage",
                    "inputs": [{"name": "images", "link": 11}]
                }
            ],
            "links": [
                [10, 1, 1, 2, 0, "CLIP"],
                [11, 2, 0, 4, 0, "IMAGE"],
                [12, 3, 0, 4, 1, "STRING"]
            ]
        }))
        .unwrap()
    }

    #[test]
    fn ui_only_nodes_are_filtered() {
        let graph = to_api_format(&sample_ui_graph());
        assert!(!graph.contains_key("3"));
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn surviving_links_are_resolved_with_slots() {
        let graph = to_api_format(&sample_ui_graph());
        assert_eq!(
            graph["2"].inputs["clip"],
            InputValue::Link("1".to_string(), 1)
        );
        assert_eq!(
            graph["4"].inputs["images"],
            InputValue::Link("2".to_string(), 0)
        );
    }

    #[test]
    fn links_to_filtered_nodes_are_dropped() {
        let graph = to_api_format(&sample_ui_graph());
        // Link 12 sourced from the Note node; slot stays unbound.
        assert!(!graph["4"].inputs.contains_key("input_1"));
        assert_eq!(graph["4"].inputs.len(), 1);
    }

    #[test]
    fn widget_values_map_positionally() {
        let graph = to_api_format(&sample_ui_graph());
        assert_eq!(
            graph["1"].input_str("ckpt_name"),
            Some("dreamshaper.safetensors")
        );
        assert_eq!(graph["2"].text(), Some("a castle at dusk"));
    }

    #[test]
    fn linked_slot_wins_over_widget_value() {
        // CLIPTextEncode's clip slot is linked; widget text fills `text`
        // but must not clobber the link.
        let graph = to_api_format(&sample_ui_graph());
        assert_matches!(graph["2"].inputs["clip"], InputValue::Link(..));
    }

    #[test]
    fn conversion_is_idempotent_via_serde() {
        let graph = to_api_format(&sample_ui_graph());
        let raw = serde_json::to_value(&graph).unwrap();
        assert!(!is_ui_format(&raw));
        let back: NodeGraph = serde_json::from_value(raw).unwrap();
        assert_eq!(back, graph);
    }

    #[test]
    fn ui_format_detection() {
        assert!(is_ui_format(&json!({"nodes": [], "links": []})));
        assert!(!is_ui_format(&json!({"1": {"class_type": "KSampler", "inputs": {}}})));
    }
}
