use std::sync::Arc;

use serde::Serialize;

use crate::protocol::{CdpClient, NodeId, ProtocolError};

/// An attached event listener with its handler's source text.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerEntry {
    pub listener_type: String,
    pub listener_function_code: String,
}

/// Resolves the event listeners attached to a node and extracts each
/// handler's source from its owning script.
pub struct ListenerResolver {
    cdp: Arc<dyn CdpClient>,
}

impl ListenerResolver {
    pub fn new(cdp: Arc<dyn CdpClient>) -> Self {
        Self { cdp }
    }

    pub async fn resolve(&self, id: NodeId) -> Result<Vec<ListenerEntry>, ProtocolError> {
        let object_id = self.cdp.resolve_node(id).await?;
        let listeners = self.cdp.event_listeners(&object_id).await?;

        let mut entries = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let source = self.cdp.script_source(&listener.script_id).await?;
            entries.push(ListenerEntry {
                listener_type: listener.kind,
                listener_function_code: slice_handler(
                    &source,
                    listener.line_number,
                    listener.column_number,
                ),
            });
        }
        Ok(entries)
    }
}

// Best-effort: the protocol reports where a handler starts but not where it
// ends, so the extraction is a textual slice from the recorded line/column to
// the end of the script source. The column offset applies to the first kept
// line only; slicing is by characters, never mid-codepoint.
fn slice_handler(source: &str, line: i64, column: i64) -> String {
    let line = usize::try_from(line).unwrap_or(0);
    let column = usize::try_from(column).unwrap_or(0);

    let mut kept = Vec::new();
    for (index, text) in source.lines().enumerate().skip(line) {
        if index == line {
            kept.push(text.chars().skip(column).collect());
        } else {
            kept.push(text.to_string());
        }
    }
    kept.join("\n")
}
