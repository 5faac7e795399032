use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{AxProperty, NodeId, RawAxNode};

#[derive(Error, Debug)]
pub enum AxTreeError {
    #[error("accessibility child id {0} resolves in neither id index")]
    Lookup(i64),
    #[error("accessibility node carries neither a backend nor a local id")]
    MissingId,
}

/// A kept node of the readable accessibility tree.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AxTreeNode {
    #[serde(flatten)]
    pub id: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<AxTreeNode>>,
}

// the full node list addresses children by two disjoint id namespaces; a
// node carrying both ids is indexed under both keys
struct AxIndex<'a> {
    by_backend: HashMap<i64, &'a RawAxNode>,
    by_local: HashMap<i64, &'a RawAxNode>,
}

impl<'a> AxIndex<'a> {
    fn build(nodes: &'a [RawAxNode]) -> Self {
        let mut by_backend = HashMap::new();
        let mut by_local = HashMap::new();
        for node in nodes {
            if let Some(id) = node.backend_dom_node_id {
                by_backend.insert(id, node);
            }
            if let Some(id) = node.node_id {
                by_local.insert(id, node);
            }
        }
        Self { by_backend, by_local }
    }

    fn resolve(&self, id: i64) -> Option<&'a RawAxNode> {
        self.by_backend
            .get(&id)
            .or_else(|| self.by_local.get(&id))
            .copied()
    }
}

/// Converts the protocol's root accessibility node plus the full node list
/// into a pruned, spliced output tree.
///
/// The recursion yields zero, one, or many nodes per visit: an ignored node
/// contributes its non-ignored descendants in place, preserving order. A
/// child id that resolves in neither index is a hard failure; no partial
/// tree is returned.
pub fn build_ax_tree(root: &RawAxNode, all: &[RawAxNode]) -> Result<Vec<AxTreeNode>, AxTreeError> {
    let index = AxIndex::build(all);
    convert(root, &index)
}

fn convert(node: &RawAxNode, index: &AxIndex<'_>) -> Result<Vec<AxTreeNode>, AxTreeError> {
    let mut children = Vec::new();
    if let Some(child_ids) = &node.child_ids {
        for &child_id in child_ids {
            let child = index.resolve(child_id).ok_or(AxTreeError::Lookup(child_id))?;
            children.extend(convert(child, index)?);
        }
    }

    if node.ignored {
        return Ok(children);
    }

    let id = node
        .backend_dom_node_id
        .map(NodeId::Backend)
        .or(node.node_id.map(NodeId::Local))
        .ok_or(AxTreeError::MissingId)?;

    let name = node.name.as_ref().and_then(|n| n.value.clone()).filter(|v| {
        !matches!(v, Value::String(s) if s.is_empty())
    });

    let properties = node
        .properties
        .as_ref()
        .map(|props| props.iter().map(property_entry).collect::<Vec<_>>())
        .filter(|props| !props.is_empty());

    Ok(vec![AxTreeNode {
        id,
        role: node.role.as_ref().and_then(|r| r.value.clone()),
        name,
        description: node.description.as_ref().and_then(|d| d.value.clone()),
        value: node.value.as_ref().and_then(|v| v.value.clone()),
        properties,
        children: (!children.is_empty()).then_some(children),
    }])
}

// a property with a plain value unwraps to {name: value}; one carrying
// related-node references keeps its wrapper verbatim
fn property_entry(property: &AxProperty) -> Value {
    let value = match &property.value.value {
        Some(value) => value.clone(),
        None => serde_json::to_value(&property.value).unwrap_or(Value::Null),
    };
    let mut entry = serde_json::Map::with_capacity(1);
    entry.insert(property.name.clone(), value);
    Value::Object(entry)
}

/// Indented one-line-per-node rendering of a built tree, compact enough to
/// hand to an agent as plain text.
pub fn render_text(nodes: &[AxTreeNode]) -> String {
    let mut out = String::new();
    for node in nodes {
        render_node(node, 0, &mut out);
    }
    out
}

fn render_node(node: &AxTreeNode, depth: usize, out: &mut String) {
    let mut parts = vec![match node.id {
        NodeId::Backend(id) => format!("[{id}]"),
        NodeId::Local(id) => format!("[local {id}]"),
    }];
    if let Some(role) = &node.role {
        parts.push(value_text(role));
    }
    if let Some(name) = &node.name {
        parts.push(format!("\"{}\"", value_text(name).replace('"', "'")));
    }
    if let Some(properties) = &node.properties {
        for property in properties {
            if let Value::Object(map) = property {
                for (key, value) in map {
                    parts.push(format!("{key}={}", value_text(value)));
                }
            }
        }
    }

    out.push_str(&"  ".repeat(depth));
    out.push_str(&parts.join(" "));
    out.push('\n');

    if let Some(children) = &node.children {
        for child in children {
            render_node(child, depth + 1, out);
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
