use std::fmt;

use async_trait::async_trait;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("{method} failed: {message}")]
    Call { method: &'static str, message: String },
    #[error("node {0} did not resolve to a remote object")]
    Unresolvable(NodeId),
    #[error("node description carries no protocol id")]
    MissingNodeAddress,
}

impl ProtocolError {
    pub fn call(method: &'static str, message: impl fmt::Display) -> Self {
        Self::Call {
            method,
            message: message.to_string(),
        }
    }
}

/// A node address in one of the protocol's two id namespaces. Backend ids are
/// stable for the lifetime of the document; local ids only within one
/// snapshot. A node is addressed by exactly one of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeId {
    Backend(i64),
    Local(i64),
}

impl NodeId {
    pub fn value(self) -> i64 {
        match self {
            NodeId::Backend(id) | NodeId::Local(id) => id,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Backend(id) => write!(f, "backend:{id}"),
            NodeId::Local(id) => write!(f, "local:{id}"),
        }
    }
}

// serialized as the single key the protocol itself uses, so output trees
// carry one id field, never both
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            NodeId::Backend(id) => map.serialize_entry("backendNodeId", id)?,
            NodeId::Local(id) => map.serialize_entry("nodeId", id)?,
        }
        map.end()
    }
}

// accessibility node ids travel as numeric strings on the wire
fn id_string_or_number<'de, D: Deserializer<'de>>(de: D) -> Result<Option<i64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Text(String),
    }
    match Option::<Raw>::deserialize(de)? {
        None => Ok(None),
        Some(Raw::Num(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => s.parse().map(Some).map_err(D::Error::custom),
    }
}

fn ids_string_or_number<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<i64>>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Text(String),
    }
    match Option::<Vec<Raw>>::deserialize(de)? {
        None => Ok(None),
        Some(raw) => raw
            .into_iter()
            .map(|r| match r {
                Raw::Num(n) => Ok(n),
                Raw::Text(s) => s.parse().map_err(D::Error::custom),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
    }
}

/// A wrapped accessibility value: `{"type": ..., "value": ...}`, sometimes
/// carrying related-node references instead of a plain value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AxValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AxProperty {
    pub name: String,
    pub value: AxValue,
}

/// One node of the protocol's full accessibility node list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawAxNode {
    #[serde(deserialize_with = "id_string_or_number")]
    pub node_id: Option<i64>,
    #[serde(rename = "backendDOMNodeId")]
    pub backend_dom_node_id: Option<i64>,
    pub ignored: bool,
    pub role: Option<AxValue>,
    pub name: Option<AxValue>,
    pub description: Option<AxValue>,
    pub value: Option<AxValue>,
    pub properties: Option<Vec<AxProperty>>,
    #[serde(deserialize_with = "ids_string_or_number")]
    pub child_ids: Option<Vec<i64>>,
}

/// A DOM node as described by the protocol, either as the piercing document
/// tree or as a single node description.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawDomNode {
    pub node_id: Option<i64>,
    pub backend_node_id: Option<i64>,
    pub node_type: i64,
    pub node_name: String,
    pub local_name: String,
    pub node_value: String,
    pub attributes: Option<Vec<String>>,
    pub children: Option<Vec<RawDomNode>>,
}

impl RawDomNode {
    pub fn is_element(&self) -> bool {
        self.node_type == 1
    }

    /// Preferred protocol address for this node.
    pub fn id(&self) -> Option<NodeId> {
        self.backend_node_id
            .map(NodeId::Backend)
            .or(self.node_id.map(NodeId::Local))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StyleProperty {
    pub name: String,
    pub value: String,
}

/// Where an attached event listener's handler lives.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenerLocation {
    #[serde(rename = "type")]
    pub kind: String,
    pub script_id: String,
    pub line_number: i64,
    pub column_number: i64,
}

/// Result of invoking a function on a live object. The exception indicator is
/// surfaced as-is; callers decide how to fail.
#[derive(Debug, Clone, Default)]
pub struct FunctionResult {
    pub value: Option<Value>,
    pub exception_details: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEventKind {
    Down,
    Up,
}

/// The browser-control command surface the snapshot and interaction engine
/// consumes. One implementation speaks to a real page; tests swap in an
/// in-memory fake.
#[async_trait]
pub trait CdpClient: Send + Sync {
    async fn root_ax_node(&self) -> Result<RawAxNode, ProtocolError>;

    async fn full_ax_nodes(&self) -> Result<Vec<RawAxNode>, ProtocolError>;

    /// The DOM tree, `depth = -1` for the whole document.
    async fn document(&self, depth: i64, pierce: bool) -> Result<RawDomNode, ProtocolError>;

    async fn describe_node(&self, id: NodeId) -> Result<RawDomNode, ProtocolError>;

    /// Resolves a node to a live object id usable with `call_function_on`.
    async fn resolve_node(&self, id: NodeId) -> Result<String, ProtocolError>;

    async fn call_function_on(
        &self,
        object_id: &str,
        declaration: &str,
        args: Vec<Value>,
    ) -> Result<FunctionResult, ProtocolError>;

    async fn computed_style(&self, id: NodeId) -> Result<Vec<StyleProperty>, ProtocolError>;

    async fn event_listeners(&self, object_id: &str)
        -> Result<Vec<ListenerLocation>, ProtocolError>;

    async fn script_source(&self, script_id: &str) -> Result<String, ProtocolError>;

    async fn focus_node(&self, id: NodeId) -> Result<(), ProtocolError>;

    async fn dispatch_key_event(&self, kind: KeyEventKind, key: &str)
        -> Result<(), ProtocolError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_serializes_as_single_key() {
        let backend = serde_json::to_value(NodeId::Backend(7)).unwrap();
        assert_eq!(backend, serde_json::json!({ "backendNodeId": 7 }));
        let local = serde_json::to_value(NodeId::Local(12)).unwrap();
        assert_eq!(local, serde_json::json!({ "nodeId": 12 }));
    }

    #[test]
    fn ax_node_ids_accept_numeric_strings() {
        let node: RawAxNode = serde_json::from_value(serde_json::json!({
            "nodeId": "31",
            "ignored": false,
            "childIds": ["32", 33],
        }))
        .unwrap();
        assert_eq!(node.node_id, Some(31));
        assert_eq!(node.child_ids, Some(vec![32, 33]));
    }

    #[test]
    fn ax_value_round_trips_related_nodes() {
        let raw = serde_json::json!({
            "type": "nodeList",
            "relatedNodes": [{ "backendDOMNodeId": 2959, "text": "HTML" }],
        });
        let value: AxValue = serde_json::from_value(raw.clone()).unwrap();
        assert!(value.value.is_none());
        assert_eq!(serde_json::to_value(&value).unwrap(), raw);
    }
}
