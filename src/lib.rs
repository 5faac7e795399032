//! Expose a live browser page to an automated caller: compact accessibility
//! and DOM snapshots over the Chrome DevTools Protocol, plus synthetic
//! interactions (click, focus, type, set value, submit, select) against
//! specific nodes.

pub mod ax_tree;
pub mod browser;
pub mod dom_tree;
pub mod interact;
pub mod listeners;
pub mod protocol;
pub mod styles;

pub use ax_tree::{build_ax_tree, AxTreeError, AxTreeNode};
pub use browser::{BrowserSession, ConsoleMessage, PageClient, PageInfo};
pub use dom_tree::{DomTreeNode, PageInspector, SnapshotError};
pub use interact::{classify, InteractError, Interactor, NativeInteraction};
pub use listeners::{ListenerEntry, ListenerResolver};
pub use protocol::{CdpClient, NodeId, ProtocolError};
pub use styles::StyleFilter;
