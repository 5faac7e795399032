use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::protocol::{CdpClient, KeyEventKind, NodeId, ProtocolError, RawDomNode};

// input type groups, keyed by the effective (uppercased) type attribute
const INPUT_TYPES_WITH_VALUE: &[&str] = &[
    "COLOR",
    "DATE",
    "DATETIME-LOCAL",
    "EMAIL",
    "MONTH",
    "NUMBER",
    "PASSWORD",
    "RANGE",
    "SEARCH",
    "TEL",
    "TEXT",
    "TIME",
    "URL",
    "WEEK",
];
const INPUT_TYPES_CHECKABLE: &[&str] = &["RADIO", "CHECKBOX"];
const INPUT_TYPES_CLICKABLE: &[&str] = &["BUTTON", "SUBMIT", "IMAGE", "RESET", "RADIO", "CHECKBOX"];

const CLICK_FN: &str = "function() { if (this.nodeType === Node.TEXT_NODE) { this.parentElement.click() } else { this.click() } }";
const SET_VALUE_FN: &str = "function(value) { this.value = value }";
const GET_VALUE_FN: &str = "function() { return this.value }";
const SET_CHECKED_FN: &str = "function(checked) { this.checked = checked }";
const GET_CHECKED_FN: &str = "function() { return this.checked }";
const SUBMIT_FN: &str =
    "function() { if (this.form) { return this.form.submit() } return this.submit() }";
const SELECT_INDEX_FN: &str = "function(index) { this.selectedIndex = index }";

#[derive(Error, Debug)]
pub enum InteractError {
    #[error("node {0} is not an element")]
    NotAnElement(NodeId),
    #[error("cannot {operation} on element '{element}'")]
    UnsupportedElement {
        operation: &'static str,
        element: String,
    },
    #[error("input type '{input_type}' does not support {operation}")]
    UnsupportedOperation {
        operation: &'static str,
        input_type: String,
    },
    #[error("value should be either 'checked' or 'unchecked', got '{0}'")]
    InvalidValue(String),
    #[error("script exception: {0}")]
    Script(Value),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// What a caller can natively do with an element, determined by tag name and,
/// for inputs, the effective type attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NativeInteraction {
    Focus,
    Click,
    SendKey,
    SetValue,
    GetValue,
    Submit,
    SelectIndex,
}

/// The uppercased `type` attribute of an input, `TEXT` when absent, scanned
/// out of the protocol's flat `[name, value, ...]` attribute list.
pub fn effective_input_type(attributes: Option<&[String]>) -> String {
    if let Some(attributes) = attributes {
        for pair in attributes.chunks_exact(2) {
            if pair[0] == "type" {
                return pair[1].to_ascii_uppercase();
            }
        }
    }
    "TEXT".to_string()
}

/// The closed dispatch table mapping tag name (and effective input type) to
/// interaction capabilities. Unmatched combinations support nothing.
pub fn classify(tag: &str, input_type: Option<&str>) -> Vec<NativeInteraction> {
    use NativeInteraction::*;
    match tag.to_ascii_uppercase().as_str() {
        "A" => vec![Click],
        "INPUT" => {
            let ty = input_type
                .map(|t| t.to_ascii_uppercase())
                .unwrap_or_else(|| "TEXT".to_string());
            if INPUT_TYPES_CHECKABLE.contains(&ty.as_str()) {
                vec![Focus, Click]
            } else if INPUT_TYPES_CLICKABLE.contains(&ty.as_str()) {
                vec![Focus, Click]
            } else if ty == "SEARCH" {
                vec![Focus, SetValue, Submit]
            } else if INPUT_TYPES_WITH_VALUE.contains(&ty.as_str()) {
                vec![Focus, SetValue]
            } else {
                Vec::new()
            }
        }
        "TEXTAREA" => vec![Focus, SetValue],
        "SELECT" => vec![Focus, SelectIndex],
        "FORM" => vec![Focus, Submit],
        _ => Vec::new(),
    }
}

/// Capabilities of a described DOM node.
pub fn classify_node(node_name: &str, attributes: Option<&[String]>) -> Vec<NativeInteraction> {
    let input_type = effective_input_type(attributes);
    classify(node_name, Some(&input_type))
}

/// Executes synthetic interactions against nodes through the protocol.
pub struct Interactor {
    cdp: Arc<dyn CdpClient>,
}

impl Interactor {
    pub fn new(cdp: Arc<dyn CdpClient>) -> Self {
        Self { cdp }
    }

    /// Resolves the node and invokes `declaration` on the live object,
    /// translating a reported script exception into a failure.
    async fn invoke(
        &self,
        id: NodeId,
        declaration: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, InteractError> {
        let object_id = self.cdp.resolve_node(id).await?;
        let result = self.cdp.call_function_on(&object_id, declaration, args).await?;
        if let Some(detail) = result.exception_details {
            return Err(InteractError::Script(detail));
        }
        Ok(result.value)
    }

    fn target(node: &RawDomNode) -> Result<NodeId, InteractError> {
        node.id().ok_or(InteractError::Protocol(
            ProtocolError::MissingNodeAddress,
        ))
    }

    /// Clicks the node. A text node clicks its parent element instead.
    pub async fn click(&self, id: NodeId) -> Result<(), InteractError> {
        debug!(%id, "click");
        self.invoke(id, CLICK_FN, Vec::new()).await.map(drop)
    }

    pub async fn focus(&self, id: NodeId) -> Result<(), InteractError> {
        debug!(%id, "focus");
        self.cdp.focus_node(id).await?;
        Ok(())
    }

    /// Focuses the node, then sends each character as a key-down/key-up pair.
    pub async fn send_keys(&self, id: NodeId, keys: &str) -> Result<(), InteractError> {
        debug!(%id, keys, "send keys");
        self.focus(id).await?;
        for ch in keys.chars() {
            let key = ch.to_string();
            self.cdp.dispatch_key_event(KeyEventKind::Down, &key).await?;
            self.cdp.dispatch_key_event(KeyEventKind::Up, &key).await?;
        }
        Ok(())
    }

    pub async fn set_value(&self, id: NodeId, value: &str) -> Result<(), InteractError> {
        let node = self.cdp.describe_node(id).await?;
        self.set_value_on(&node, value).await
    }

    /// Sets a value on an already-described node. Inputs dispatch on their
    /// effective type; checkable inputs take a checked/unchecked state.
    pub async fn set_value_on(&self, node: &RawDomNode, value: &str) -> Result<(), InteractError> {
        let id = Self::target(node)?;
        if !node.is_element() {
            return Err(InteractError::NotAnElement(id));
        }
        debug!(%id, value, element = %node.local_name, "set value");

        match node.local_name.as_str() {
            "select" | "textarea" => {
                self.invoke(id, SET_VALUE_FN, vec![Value::String(value.to_string())])
                    .await
                    .map(drop)
            }
            "input" => {
                let ty = effective_input_type(node.attributes.as_deref());
                if INPUT_TYPES_WITH_VALUE.contains(&ty.as_str()) {
                    self.invoke(id, SET_VALUE_FN, vec![Value::String(value.to_string())])
                        .await
                        .map(drop)
                } else if INPUT_TYPES_CHECKABLE.contains(&ty.as_str()) {
                    let checked = match value {
                        "checked" | "true" => true,
                        "unchecked" | "false" => false,
                        other => return Err(InteractError::InvalidValue(other.to_string())),
                    };
                    self.invoke(id, SET_CHECKED_FN, vec![Value::Bool(checked)])
                        .await
                        .map(drop)
                } else {
                    Err(InteractError::UnsupportedOperation {
                        operation: "set value",
                        input_type: ty,
                    })
                }
            }
            other => Err(InteractError::UnsupportedElement {
                operation: "set value",
                element: other.to_string(),
            }),
        }
    }

    pub async fn get_value(&self, id: NodeId, safe: bool) -> Result<Option<String>, InteractError> {
        let node = self.cdp.describe_node(id).await?;
        self.value_of(&node, safe).await
    }

    /// Reads the live value of an already-described node, mirroring the
    /// set-value dispatch. In safe mode an unsupported node reads as absent
    /// instead of failing.
    pub async fn value_of(
        &self,
        node: &RawDomNode,
        safe: bool,
    ) -> Result<Option<String>, InteractError> {
        let id = Self::target(node)?;
        if !node.is_element() {
            return if safe {
                Ok(None)
            } else {
                Err(InteractError::NotAnElement(id))
            };
        }

        match node.local_name.as_str() {
            "select" | "textarea" => {
                let value = self.invoke(id, GET_VALUE_FN, Vec::new()).await?;
                Ok(Some(render_value(value)))
            }
            "input" => {
                let ty = effective_input_type(node.attributes.as_deref());
                if INPUT_TYPES_WITH_VALUE.contains(&ty.as_str()) {
                    let value = self.invoke(id, GET_VALUE_FN, Vec::new()).await?;
                    Ok(Some(render_value(value)))
                } else if INPUT_TYPES_CHECKABLE.contains(&ty.as_str()) {
                    let checked = self.invoke(id, GET_CHECKED_FN, Vec::new()).await?;
                    let state = if checked.and_then(|v| v.as_bool()).unwrap_or(false) {
                        "checked"
                    } else {
                        "unchecked"
                    };
                    Ok(Some(state.to_string()))
                } else if safe {
                    Ok(None)
                } else {
                    Err(InteractError::UnsupportedOperation {
                        operation: "get value",
                        input_type: ty,
                    })
                }
            }
            other => {
                if safe {
                    Ok(None)
                } else {
                    Err(InteractError::UnsupportedElement {
                        operation: "get value",
                        element: other.to_string(),
                    })
                }
            }
        }
    }

    /// Submits a form, or a search input's owning form.
    pub async fn submit(&self, id: NodeId) -> Result<(), InteractError> {
        let node = self.cdp.describe_node(id).await?;
        let supported = node.is_element()
            && (node.local_name == "form"
                || (node.local_name == "input"
                    && effective_input_type(node.attributes.as_deref()) == "SEARCH"));
        if !supported {
            return Err(InteractError::UnsupportedElement {
                operation: "submit",
                element: node.local_name.clone(),
            });
        }
        debug!(%id, "submit");
        self.invoke(Self::target(&node)?, SUBMIT_FN, Vec::new())
            .await
            .map(drop)
    }

    /// Selects an option on a select element by index.
    pub async fn select_index(&self, id: NodeId, index: i64) -> Result<(), InteractError> {
        let node = self.cdp.describe_node(id).await?;
        if !node.is_element() || node.local_name != "select" {
            return Err(InteractError::UnsupportedElement {
                operation: "select index",
                element: node.local_name.clone(),
            });
        }
        debug!(%id, index, "select index");
        self.invoke(
            Self::target(&node)?,
            SELECT_INDEX_FN,
            vec![Value::from(index)],
        )
        .await
        .map(drop)
    }
}

fn render_value(value: Option<Value>) -> String {
    match value {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testkit::{FakeCdp, FakeNode};
    use NativeInteraction::*;

    #[test]
    fn dispatch_table_matches_element_kinds() {
        assert_eq!(classify("a", None), vec![Click]);
        assert_eq!(classify("input", Some("checkbox")), vec![Focus, Click]);
        assert_eq!(classify("input", Some("radio")), vec![Focus, Click]);
        assert_eq!(classify("input", Some("submit")), vec![Focus, Click]);
        assert_eq!(classify("input", Some("search")), vec![Focus, SetValue, Submit]);
        assert_eq!(classify("input", Some("email")), vec![Focus, SetValue]);
        assert_eq!(classify("input", None), vec![Focus, SetValue]);
        assert_eq!(classify("input", Some("hidden")), Vec::new());
        assert_eq!(classify("textarea", None), vec![Focus, SetValue]);
        assert_eq!(classify("select", None), vec![Focus, SelectIndex]);
        assert_eq!(classify("form", None), vec![Focus, Submit]);
        assert_eq!(classify("div", None), Vec::new());
    }

    #[test]
    fn effective_type_defaults_to_text() {
        assert_eq!(effective_input_type(None), "TEXT");
        let attrs = vec!["name".to_string(), "q".to_string()];
        assert_eq!(effective_input_type(Some(&attrs)), "TEXT");
        let attrs = vec!["type".to_string(), "Checkbox".to_string()];
        assert_eq!(effective_input_type(Some(&attrs)), "CHECKBOX");
    }

    fn interactor(cdp: &Arc<FakeCdp>) -> Interactor {
        Interactor::new(cdp.clone())
    }

    #[tokio::test]
    async fn set_then_get_select_value() {
        let cdp = Arc::new(FakeCdp::new([FakeNode::element(1, "select")]));
        let ops = interactor(&cdp);
        ops.set_value(NodeId::Backend(1), "2").await.unwrap();
        let value = ops.get_value(NodeId::Backend(1), false).await.unwrap();
        assert_eq!(value.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn checkbox_round_trips_checked_state() {
        let cdp = Arc::new(FakeCdp::new([
            FakeNode::element(4, "input").with_attr("type", "checkbox")
        ]));
        let ops = interactor(&cdp);

        ops.set_value(NodeId::Backend(4), "checked").await.unwrap();
        let value = ops.get_value(NodeId::Backend(4), false).await.unwrap();
        assert_eq!(value.as_deref(), Some("checked"));

        ops.set_value(NodeId::Backend(4), "unchecked").await.unwrap();
        let value = ops.get_value(NodeId::Backend(4), false).await.unwrap();
        assert_eq!(value.as_deref(), Some("unchecked"));

        let err = ops.set_value(NodeId::Backend(4), "maybe").await.unwrap_err();
        assert!(matches!(err, InteractError::InvalidValue(v) if v == "maybe"));
    }

    #[tokio::test]
    async fn set_value_rejects_non_elements_and_wrong_kinds() {
        let cdp = Arc::new(FakeCdp::new([
            FakeNode::text(7),
            FakeNode::element(8, "div"),
            FakeNode::element(9, "input").with_attr("type", "reset"),
        ]));
        let ops = interactor(&cdp);

        let err = ops.set_value(NodeId::Backend(7), "x").await.unwrap_err();
        assert!(matches!(err, InteractError::NotAnElement(_)));

        let err = ops.set_value(NodeId::Backend(8), "x").await.unwrap_err();
        assert!(matches!(err, InteractError::UnsupportedElement { .. }));

        let err = ops.set_value(NodeId::Backend(9), "x").await.unwrap_err();
        assert!(matches!(err, InteractError::UnsupportedOperation { .. }));
    }

    #[tokio::test]
    async fn safe_mode_reads_absent_instead_of_failing() {
        let cdp = Arc::new(FakeCdp::new([
            FakeNode::element(2, "div"),
            FakeNode::element(3, "input").with_attr("type", "hidden"),
        ]));
        let ops = interactor(&cdp);

        assert!(ops.get_value(NodeId::Backend(2), true).await.unwrap().is_none());
        assert!(ops.get_value(NodeId::Backend(3), true).await.unwrap().is_none());
        assert!(ops.get_value(NodeId::Backend(2), false).await.is_err());
    }

    #[tokio::test]
    async fn submit_allows_forms_and_search_inputs_only() {
        let cdp = Arc::new(FakeCdp::new([
            FakeNode::element(1, "form"),
            FakeNode::element(2, "input").with_attr("type", "search"),
            FakeNode::element(3, "input").with_attr("type", "text"),
            FakeNode::element(4, "div"),
        ]));
        let ops = interactor(&cdp);

        ops.submit(NodeId::Backend(1)).await.unwrap();
        ops.submit(NodeId::Backend(2)).await.unwrap();
        assert_eq!(*cdp.submitted.lock().unwrap(), vec![1, 2]);

        for id in [3, 4] {
            let err = ops.submit(NodeId::Backend(id)).await.unwrap_err();
            assert!(matches!(err, InteractError::UnsupportedElement { .. }));
        }
    }

    #[tokio::test]
    async fn select_index_requires_a_select() {
        let cdp = Arc::new(FakeCdp::new([
            FakeNode::element(1, "select"),
            FakeNode::element(2, "textarea"),
        ]));
        let ops = interactor(&cdp);

        ops.select_index(NodeId::Backend(1), 2).await.unwrap();
        assert_eq!(cdp.node(1).selected_index, 2);

        let err = ops.select_index(NodeId::Backend(2), 0).await.unwrap_err();
        assert!(matches!(err, InteractError::UnsupportedElement { .. }));
    }

    #[tokio::test]
    async fn send_keys_focuses_then_types_each_character() {
        let cdp = Arc::new(FakeCdp::new([FakeNode::element(5, "input")]));
        let ops = interactor(&cdp);
        ops.send_keys(NodeId::Backend(5), "hi").await.unwrap();

        assert_eq!(*cdp.focused.lock().unwrap(), vec![5]);
        let events = cdp.key_events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                (KeyEventKind::Down, "h".to_string()),
                (KeyEventKind::Up, "h".to_string()),
                (KeyEventKind::Down, "i".to_string()),
                (KeyEventKind::Up, "i".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn script_exceptions_abort_the_operation() {
        let mut node = FakeNode::element(6, "select");
        node.throws = Some("boom".to_string());
        let cdp = Arc::new(FakeCdp::new([node]));
        let ops = interactor(&cdp);

        let err = ops.set_value(NodeId::Backend(6), "1").await.unwrap_err();
        assert!(matches!(err, InteractError::Script(_)));
        assert_eq!(cdp.node(6).value, "");
    }

    #[tokio::test]
    async fn click_reaches_the_live_object() {
        let cdp = Arc::new(FakeCdp::new([FakeNode::element(11, "a")]));
        interactor(&cdp).click(NodeId::Backend(11)).await.unwrap();
        assert_eq!(*cdp.clicked.lock().unwrap(), vec![11]);
    }
}
