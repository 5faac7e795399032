use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::ax_tree::{self, AxTreeError, AxTreeNode};
use crate::interact::{classify_node, InteractError, Interactor, NativeInteraction};
use crate::listeners::{ListenerEntry, ListenerResolver};
use crate::protocol::{CdpClient, NodeId, ProtocolError, RawDomNode};
use crate::styles::StyleFilter;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error(transparent)]
    Ax(#[from] AxTreeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Interact(#[from] InteractError),
    #[error("attribute list for node {0} has an odd number of entries")]
    OddAttributeList(NodeId),
}

/// A DOM node decorated with everything an agent needs to act on it. Internal
/// bookkeeping fields of the raw tree (type codes, child counts, parent
/// links) never appear here.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomTreeNode {
    #[serde(flatten)]
    pub id: NodeId,
    pub node_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listeners: Option<Vec<ListenerEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_interactions: Option<Vec<NativeInteraction>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub styles: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<DomTreeNode>>,
}

/// The protocol's flat `[name, value, name, value, ...]` attribute list as a
/// map. An odd-length list is rejected, not truncated.
pub fn attributes_to_map(flat: &[String]) -> Option<BTreeMap<String, String>> {
    if flat.len() % 2 != 0 {
        return None;
    }
    Some(
        flat.chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect(),
    )
}

/// Builds per-request snapshots of the live page: the readable accessibility
/// tree and the enriched DOM tree. Nothing is cached between calls.
pub struct PageInspector {
    cdp: Arc<dyn CdpClient>,
    interactor: Interactor,
    listeners: ListenerResolver,
    styles: StyleFilter,
}

impl PageInspector {
    pub fn new(cdp: Arc<dyn CdpClient>) -> Self {
        Self::with_style_filter(cdp, StyleFilter::default())
    }

    pub fn with_style_filter(cdp: Arc<dyn CdpClient>, styles: StyleFilter) -> Self {
        Self {
            interactor: Interactor::new(cdp.clone()),
            listeners: ListenerResolver::new(cdp.clone()),
            cdp,
            styles,
        }
    }

    pub fn interactor(&self) -> &Interactor {
        &self.interactor
    }

    /// Fetches the designated root and the full node list, then reconciles
    /// them into the spliced output tree.
    pub async fn ax_tree(&self) -> Result<Vec<AxTreeNode>, SnapshotError> {
        let root = self.cdp.root_ax_node().await?;
        let all = self.cdp.full_ax_nodes().await?;
        debug!(nodes = all.len(), "building accessibility tree");
        Ok(ax_tree::build_ax_tree(&root, &all)?)
    }

    /// Fetches the piercing document tree and enriches it. Returns `None`
    /// when the root itself is hidden.
    pub async fn dom_tree(&self) -> Result<Option<DomTreeNode>, SnapshotError> {
        let root = self.cdp.document(-1, true).await?;
        self.enrich(&root).await
    }

    // recursion is boxed: the future would otherwise be infinitely sized
    fn enrich<'a>(
        &'a self,
        node: &'a RawDomNode,
    ) -> BoxFuture<'a, Result<Option<DomTreeNode>, SnapshotError>> {
        async move {
            let id = node.id().ok_or(ProtocolError::MissingNodeAddress)?;

            let attributes = match &node.attributes {
                Some(flat) if !flat.is_empty() => {
                    Some(attributes_to_map(flat).ok_or(SnapshotError::OddAttributeList(id))?)
                }
                _ => None,
            };

            let value = self
                .interactor
                .value_of(node, true)
                .await?
                .filter(|v| !v.is_empty());

            let mut listeners = None;
            let mut native_interactions = None;
            let mut styles = None;
            if node.is_element() {
                let resolved = self.listeners.resolve(id).await?;
                if !resolved.is_empty() {
                    listeners = Some(resolved);
                }

                let capabilities = classify_node(&node.node_name, node.attributes.as_deref());
                if !capabilities.is_empty() {
                    native_interactions = Some(capabilities);
                }

                let filtered = self.styles.filter(&self.cdp.computed_style(id).await?);
                if is_hidden(&filtered) {
                    debug!(%id, "dropping hidden subtree");
                    return Ok(None);
                }
                if !filtered.is_empty() {
                    styles = Some(filtered);
                }
            }

            let mut children = Vec::new();
            if let Some(raw_children) = &node.children {
                for child in raw_children {
                    if let Some(kept) = self.enrich(child).await? {
                        children.push(kept);
                    }
                }
            }

            Ok(Some(DomTreeNode {
                id,
                node_name: node.node_name.clone(),
                attributes,
                value,
                node_value: (!node.node_value.is_empty()).then(|| node.node_value.clone()),
                listeners,
                native_interactions,
                styles,
                children: (!children.is_empty()).then_some(children),
            }))
        }
        .boxed()
    }
}

fn is_hidden(styles: &BTreeMap<String, String>) -> bool {
    styles.get("display").is_some_and(|v| v == "none")
        || styles.get("visibility").is_some_and(|v| v == "hidden")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testkit::{FakeCdp, FakeNode};
    use crate::protocol::RawAxNode;

    fn raw(backend_id: i64, node_type: i64, name: &str) -> RawDomNode {
        RawDomNode {
            node_id: Some(backend_id * 10),
            backend_node_id: Some(backend_id),
            node_type,
            node_name: name.to_uppercase(),
            local_name: if node_type == 1 {
                name.to_lowercase()
            } else {
                String::new()
            },
            node_value: String::new(),
            attributes: None,
            children: None,
        }
    }

    #[test]
    fn attribute_normalization_round_trips() {
        let flat = vec![
            "a".to_string(),
            "1".to_string(),
            "b".to_string(),
            "2".to_string(),
        ];
        let map = attributes_to_map(&flat).unwrap();
        assert_eq!(map.get("a").map(String::as_str), Some("1"));
        assert_eq!(map.get("b").map(String::as_str), Some("2"));

        let reflattened: Vec<String> = map
            .iter()
            .flat_map(|(k, v)| [k.clone(), v.clone()])
            .collect();
        assert_eq!(attributes_to_map(&reflattened).unwrap(), map);
    }

    #[test]
    fn odd_attribute_lists_are_rejected() {
        assert!(attributes_to_map(&["a".to_string()]).is_none());
    }

    fn inspector(cdp: &Arc<FakeCdp>) -> PageInspector {
        PageInspector::new(cdp.clone())
    }

    #[tokio::test]
    async fn enriches_values_interactions_and_styles() {
        let mut document = raw(1, 9, "#document");
        let mut body = raw(2, 1, "body");
        let mut input = raw(3, 1, "input");
        input.attributes = Some(vec!["type".to_string(), "text".to_string()]);
        let mut text = raw(4, 3, "#text");
        text.node_value = "hello".to_string();
        body.children = Some(vec![input, text]);
        document.children = Some(vec![body]);

        let mut cdp = FakeCdp::new([
            FakeNode::element(2, "body"),
            FakeNode::element(3, "input")
                .with_attr("type", "text")
                .with_value("typed")
                .with_style("cursor", "pointer"),
        ]);
        cdp.document = Some(document);
        let cdp = Arc::new(cdp);

        let tree = inspector(&cdp).dom_tree().await.unwrap().unwrap();
        assert_eq!(tree.node_name, "#DOCUMENT");
        let body = &tree.children.as_ref().unwrap()[0];
        let children = body.children.as_ref().unwrap();

        let input = &children[0];
        assert_eq!(input.id, NodeId::Backend(3));
        assert_eq!(
            input.attributes.as_ref().unwrap().get("type").map(String::as_str),
            Some("text")
        );
        assert_eq!(input.value.as_deref(), Some("typed"));
        assert_eq!(
            input.native_interactions.as_deref(),
            Some(&[NativeInteraction::Focus, NativeInteraction::SetValue][..])
        );
        assert_eq!(
            input.styles.as_ref().unwrap().get("cursor").map(String::as_str),
            Some("pointer")
        );

        let text = &children[1];
        assert_eq!(text.node_value.as_deref(), Some("hello"));
        assert!(text.value.is_none());
        assert!(text.native_interactions.is_none());
    }

    #[tokio::test]
    async fn hidden_subtrees_are_dropped_entirely() {
        let mut document = raw(1, 9, "#document");
        let shown = raw(2, 1, "div");
        let mut hidden = raw(3, 1, "div");
        hidden.children = Some(vec![raw(4, 1, "span")]);
        document.children = Some(vec![shown, hidden]);

        let mut cdp = FakeCdp::new([
            FakeNode::element(2, "div"),
            FakeNode::element(3, "div").with_style("display", "none"),
            FakeNode::element(4, "span"),
        ]);
        cdp.document = Some(document);
        let cdp = Arc::new(cdp);

        let tree = inspector(&cdp).dom_tree().await.unwrap().unwrap();
        let children = tree.children.as_ref().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, NodeId::Backend(2));
    }

    #[tokio::test]
    async fn visibility_hidden_prunes_like_display_none() {
        let mut document = raw(1, 9, "#document");
        let hidden = raw(2, 1, "div");
        document.children = Some(vec![hidden]);

        let mut cdp = FakeCdp::new([
            FakeNode::element(2, "div").with_style("visibility", "hidden")
        ]);
        cdp.document = Some(document);
        let cdp = Arc::new(cdp);

        let tree = inspector(&cdp).dom_tree().await.unwrap().unwrap();
        assert!(tree.children.is_none());
    }

    #[tokio::test]
    async fn odd_attribute_list_fails_the_build() {
        let mut document = raw(1, 9, "#document");
        let mut broken = raw(2, 1, "div");
        broken.attributes = Some(vec!["lonely".to_string()]);
        document.children = Some(vec![broken]);

        let mut cdp = FakeCdp::new([FakeNode::element(2, "div")]);
        cdp.document = Some(document);
        let cdp = Arc::new(cdp);

        let err = inspector(&cdp).dom_tree().await.unwrap_err();
        assert!(matches!(err, SnapshotError::OddAttributeList(_)));
    }

    #[tokio::test]
    async fn ax_tree_goes_through_the_protocol() {
        let root: RawAxNode = serde_json::from_value(serde_json::json!({
            "nodeId": "1",
            "backendDOMNodeId": 50,
            "ignored": false,
            "role": { "type": "role", "value": "RootWebArea" },
            "childIds": ["2"],
        }))
        .unwrap();
        let child: RawAxNode = serde_json::from_value(serde_json::json!({
            "nodeId": "2",
            "backendDOMNodeId": 51,
            "ignored": false,
            "role": { "type": "role", "value": "button" },
            "name": { "type": "computedString", "value": "Go" },
        }))
        .unwrap();

        let mut cdp = FakeCdp::new([]);
        cdp.ax_root = Some(root.clone());
        cdp.ax_nodes = vec![root, child];
        let cdp = Arc::new(cdp);

        let tree = inspector(&cdp).ax_tree().await.unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].id, NodeId::Backend(50));
        let children = tree[0].children.as_ref().unwrap();
        assert_eq!(children[0].name, Some(serde_json::Value::from("Go")));
    }
}
