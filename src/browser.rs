use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::accessibility::{
    self, GetFullAxTreeParams, GetRootAxNodeParams,
};
use chromiumoxide::cdp::browser_protocol::css::{self, GetComputedStyleForNodeParams};
use chromiumoxide::cdp::browser_protocol::dom::{
    self, BackendNodeId, DescribeNodeParams, FocusParams, GetBoxModelParams, GetDocumentParams,
    ResolveNodeParams,
};
use chromiumoxide::cdp::browser_protocol::dom_debugger::GetEventListenersParams;
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams, NavigateParams, ReloadParams, Viewport,
};
use chromiumoxide::cdp::js_protocol::debugger::{self, GetScriptSourceParams};
use chromiumoxide::cdp::js_protocol::runtime::{
    self, CallArgument, CallFunctionOnParams, EventConsoleApiCalled, RemoteObjectId, ScriptId,
};
use chromiumoxide::handler::Handler;
use chromiumoxide::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{
    CdpClient, FunctionResult, KeyEventKind, ListenerLocation, NodeId, ProtocolError, RawAxNode,
    RawDomNode, StyleProperty,
};

// user data dirs whose DevToolsActivePort file reveals a running chrome
const CHROME_PROFILES: &[&str] = &[
    ".config/google-chrome",
    ".config/chromium",
    "Library/Application Support/Google/Chrome",
    "Library/Application Support/Chromium",
];

/// One connected browser with a tracked page list. All snapshot and
/// interaction work goes through `client()`, which wraps the selected page.
pub struct BrowserSession {
    browser: Browser,
    _handler_task: JoinHandle<()>,
    pages: Vec<Page>,
    selected: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageInfo {
    pub index: usize,
    pub url: String,
    pub selected: bool,
}

impl BrowserSession {
    /// Connects to an already-running Chrome when one is discoverable,
    /// otherwise launches a fresh one with a dedicated debug profile.
    pub async fn connect() -> Result<Self> {
        if let Some(ws_url) = discover_websocket_url().await {
            info!(%ws_url, "connecting to running chrome");
            match Browser::connect(&ws_url).await {
                Ok((browser, handler)) => return Self::from_browser(browser, handler).await,
                Err(e) => warn!(error = %e, "connect failed, launching a fresh chrome"),
            }
        }

        info!("launching chrome");
        let (browser, handler) = launch_chrome().await?;
        Self::from_browser(browser, handler).await
    }

    async fn from_browser(browser: Browser, handler: Handler) -> Result<Self> {
        let handler_task = tokio::spawn(handler_loop(handler));
        let pages = browser.pages().await.unwrap_or_default();
        Ok(Self {
            browser,
            _handler_task: handler_task,
            pages,
            selected: 0,
        })
    }

    fn selected_page(&self) -> Result<&Page> {
        self.pages
            .get(self.selected)
            .ok_or_else(|| anyhow!("no page selected"))
    }

    async fn refresh_pages(&mut self) -> Result<()> {
        self.pages = self.browser.pages().await?;
        if self.selected >= self.pages.len() && !self.pages.is_empty() {
            self.selected = 0;
        }
        Ok(())
    }

    /// A protocol client over the selected page, with the required protocol
    /// domains enabled and console capture attached.
    pub async fn client(&self) -> Result<Arc<PageClient>> {
        let page = self.selected_page()?.clone();
        Ok(Arc::new(PageClient::attach(page).await?))
    }

    pub async fn list_pages(&mut self) -> Result<Vec<PageInfo>> {
        self.refresh_pages().await?;
        let mut out = Vec::with_capacity(self.pages.len());
        for (index, page) in self.pages.iter().enumerate() {
            out.push(PageInfo {
                index,
                url: page.url().await?.unwrap_or_default(),
                selected: index == self.selected,
            });
        }
        Ok(out)
    }

    pub async fn select_page(&mut self, index: usize, bring_to_front: bool) -> Result<()> {
        self.refresh_pages().await?;
        if index >= self.pages.len() {
            bail!("page index {index} out of range (0..{})", self.pages.len());
        }
        self.selected = index;
        if bring_to_front {
            self.pages[index].bring_to_front().await?;
        }
        Ok(())
    }

    pub async fn new_page(&mut self, url: &str) -> Result<()> {
        let page = self.browser.new_page(url).await?;
        self.pages.push(page);
        self.selected = self.pages.len() - 1;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        let page = self.selected_page()?;
        page.execute(
            NavigateParams::builder()
                .url(url)
                .build()
                .map_err(|e| anyhow!("navigate params: {e}"))?,
        )
        .await?;
        self.wait_until_loaded(Duration::from_secs(10)).await
    }

    pub async fn back(&self) -> Result<()> {
        self.selected_page()?.evaluate("history.back()").await?;
        Ok(())
    }

    pub async fn forward(&self) -> Result<()> {
        self.selected_page()?.evaluate("history.forward()").await?;
        Ok(())
    }

    pub async fn reload(&self, ignore_cache: bool) -> Result<()> {
        self.selected_page()?
            .execute(ReloadParams::builder().ignore_cache(ignore_cache).build())
            .await?;
        self.wait_until_loaded(Duration::from_secs(10)).await
    }

    pub async fn current_url(&self) -> Result<String> {
        Ok(self.selected_page()?.url().await?.unwrap_or_default())
    }

    /// Polls `document.readyState` until the page settles.
    pub async fn wait_until_loaded(&self, timeout: Duration) -> Result<()> {
        let page = self.selected_page()?;
        let start = Instant::now();
        loop {
            let ready: Option<String> = page
                .evaluate("document.readyState")
                .await
                .ok()
                .and_then(|r| r.into_value().ok());
            if ready.as_deref() == Some("complete") {
                return Ok(());
            }
            if start.elapsed() > timeout {
                bail!("timed out waiting for the page to finish loading");
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

// drains browser events for the lifetime of the connection
async fn handler_loop(mut handler: Handler) {
    while let Some(event) = handler.next().await {
        if event.is_err() {
            break;
        }
    }
}

async fn discover_websocket_url() -> Option<String> {
    if let Ok(url) = std::env::var("PAGELENS_CDP_URL") {
        return Some(url);
    }

    let home = std::env::var("HOME").unwrap_or_default();
    for profile in CHROME_PROFILES {
        let port_file = PathBuf::from(&home).join(profile).join("DevToolsActivePort");
        if let Ok(content) = tokio::fs::read_to_string(&port_file).await {
            let mut lines = content.lines();
            if let (Some(port), Some(path)) = (lines.next(), lines.next()) {
                return Some(format!("ws://127.0.0.1:{}{}", port.trim(), path.trim()));
            }
        }
    }

    // a devtools endpoint listening on the conventional port
    if let Ok(resp) = reqwest::get("http://127.0.0.1:9222/json/version").await {
        if let Ok(version) = resp.json::<Value>().await {
            if let Some(ws) = version.get("webSocketDebuggerUrl").and_then(Value::as_str) {
                return Some(ws.to_string());
            }
        }
    }

    None
}

async fn launch_chrome() -> Result<(Browser, Handler)> {
    let home = std::env::var("HOME").unwrap_or_default();
    // chrome refuses remote debugging on its default profile; keep our own
    let user_data_dir = PathBuf::from(&home).join(".pagelens-chrome");

    let mut config = BrowserConfig::builder()
        .disable_default_args()
        .user_data_dir(&user_data_dir)
        .viewport(None);
    if std::env::var("PAGELENS_HEADFUL").is_ok() {
        config = config.with_head();
    }

    Browser::launch(config.build().map_err(|e| anyhow!("browser config: {e}"))?)
        .await
        .context("failed to launch chrome")
}

/// A captured console API call.
#[derive(Debug, Clone, Serialize)]
pub struct ConsoleMessage {
    pub level: String,
    pub text: String,
}

impl ConsoleMessage {
    fn from_event(event: &EventConsoleApiCalled) -> Self {
        let text = event
            .args
            .iter()
            .map(|arg| match (&arg.value, &arg.description) {
                (Some(Value::String(s)), _) => s.clone(),
                (Some(other), _) => other.to_string(),
                (None, Some(description)) => description.clone(),
                _ => "undefined".to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            level: format!("{:?}", event.r#type).to_lowercase(),
            text,
        }
    }
}

/// The protocol client for one page. Enables the DOM, CSS, Accessibility,
/// Debugger, and Runtime domains on attach and buffers console output.
pub struct PageClient {
    page: Page,
    console: Arc<Mutex<Vec<ConsoleMessage>>>,
    _console_task: JoinHandle<()>,
}

impl PageClient {
    pub async fn attach(page: Page) -> Result<Self> {
        page.execute(dom::EnableParams::default())
            .await
            .context("DOM.enable")?;
        page.execute(css::EnableParams::default())
            .await
            .context("CSS.enable")?;
        page.execute(accessibility::EnableParams::default())
            .await
            .context("Accessibility.enable")?;
        page.execute(debugger::EnableParams::default())
            .await
            .context("Debugger.enable")?;
        page.execute(runtime::EnableParams::default())
            .await
            .context("Runtime.enable")?;

        let console = Arc::new(Mutex::new(Vec::new()));
        let sink = console.clone();
        let mut events = page
            .event_listener::<EventConsoleApiCalled>()
            .await
            .context("console event listener")?;
        let console_task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let message = ConsoleMessage::from_event(&event);
                sink.lock().unwrap().push(message);
            }
        });

        debug!("page client attached");
        Ok(Self {
            page,
            console,
            _console_task: console_task,
        })
    }

    /// Returns and clears the buffered console output.
    pub fn drain_console(&self) -> Vec<ConsoleMessage> {
        std::mem::take(&mut self.console.lock().unwrap())
    }

    /// Full-page JPEG screenshot.
    pub async fn screenshot(&self) -> Result<Vec<u8>, ProtocolError> {
        self.capture(None).await
    }

    /// JPEG screenshot clipped to one node's box-model content area.
    pub async fn node_screenshot(&self, id: NodeId) -> Result<Vec<u8>, ProtocolError> {
        let resp = self
            .page
            .execute(box_model_params(id))
            .await
            .map_err(|e| ProtocolError::call("DOM.getBoxModel", e))?;
        let model = &resp.result.model;
        let quad = model.content.inner();
        let clip = Viewport {
            x: quad[0],
            y: quad[1],
            width: model.width as f64,
            height: model.height as f64,
            scale: 1.0,
        };
        self.capture(Some(clip)).await
    }

    async fn capture(&self, clip: Option<Viewport>) -> Result<Vec<u8>, ProtocolError> {
        let mut builder = CaptureScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Jpeg)
            .capture_beyond_viewport(true);
        if let Some(clip) = clip {
            builder = builder.clip(clip);
        }
        let resp = self
            .page
            .execute(builder.build())
            .await
            .map_err(|e| ProtocolError::call("Page.captureScreenshot", e))?;
        let data: &str = resp.result.data.as_ref();
        BASE64
            .decode(data.as_bytes())
            .map_err(|e| ProtocolError::call("Page.captureScreenshot", e))
    }

    fn convert<T: DeserializeOwned>(
        value: impl Serialize,
        method: &'static str,
    ) -> Result<T, ProtocolError> {
        serde_json::to_value(value)
            .and_then(serde_json::from_value)
            .map_err(|e| ProtocolError::call(method, e))
    }
}

fn describe_params(id: NodeId) -> DescribeNodeParams {
    match id {
        NodeId::Backend(v) => DescribeNodeParams::builder()
            .backend_node_id(BackendNodeId::new(v))
            .build(),
        NodeId::Local(v) => DescribeNodeParams::builder()
            .node_id(dom::NodeId::new(v))
            .build(),
    }
}

fn resolve_params(id: NodeId) -> ResolveNodeParams {
    match id {
        NodeId::Backend(v) => ResolveNodeParams::builder()
            .backend_node_id(BackendNodeId::new(v))
            .build(),
        NodeId::Local(v) => ResolveNodeParams::builder()
            .node_id(dom::NodeId::new(v))
            .build(),
    }
}

fn focus_params(id: NodeId) -> FocusParams {
    match id {
        NodeId::Backend(v) => FocusParams::builder()
            .backend_node_id(BackendNodeId::new(v))
            .build(),
        NodeId::Local(v) => FocusParams::builder().node_id(dom::NodeId::new(v)).build(),
    }
}

fn box_model_params(id: NodeId) -> GetBoxModelParams {
    match id {
        NodeId::Backend(v) => GetBoxModelParams::builder()
            .backend_node_id(BackendNodeId::new(v))
            .build(),
        NodeId::Local(v) => GetBoxModelParams::builder()
            .node_id(dom::NodeId::new(v))
            .build(),
    }
}

#[async_trait]
impl CdpClient for PageClient {
    async fn root_ax_node(&self) -> Result<RawAxNode, ProtocolError> {
        let resp = self
            .page
            .execute(GetRootAxNodeParams::builder().build())
            .await
            .map_err(|e| ProtocolError::call("Accessibility.getRootAXNode", e))?;
        Self::convert(&resp.result.node, "Accessibility.getRootAXNode")
    }

    async fn full_ax_nodes(&self) -> Result<Vec<RawAxNode>, ProtocolError> {
        let resp = self
            .page
            .execute(GetFullAxTreeParams::builder().build())
            .await
            .map_err(|e| ProtocolError::call("Accessibility.getFullAXTree", e))?;
        Self::convert(&resp.result.nodes, "Accessibility.getFullAXTree")
    }

    async fn document(&self, depth: i64, pierce: bool) -> Result<RawDomNode, ProtocolError> {
        let resp = self
            .page
            .execute(
                GetDocumentParams::builder()
                    .depth(depth)
                    .pierce(pierce)
                    .build(),
            )
            .await
            .map_err(|e| ProtocolError::call("DOM.getDocument", e))?;
        Self::convert(&resp.result.root, "DOM.getDocument")
    }

    async fn describe_node(&self, id: NodeId) -> Result<RawDomNode, ProtocolError> {
        let resp = self
            .page
            .execute(describe_params(id))
            .await
            .map_err(|e| ProtocolError::call("DOM.describeNode", e))?;
        Self::convert(&resp.result.node, "DOM.describeNode")
    }

    async fn resolve_node(&self, id: NodeId) -> Result<String, ProtocolError> {
        let resp = self
            .page
            .execute(resolve_params(id))
            .await
            .map_err(|e| ProtocolError::call("DOM.resolveNode", e))?;
        let object_id = resp
            .result
            .object
            .object_id
            .clone()
            .ok_or(ProtocolError::Unresolvable(id))?;
        Ok(object_id.inner().clone())
    }

    async fn call_function_on(
        &self,
        object_id: &str,
        declaration: &str,
        args: Vec<Value>,
    ) -> Result<FunctionResult, ProtocolError> {
        let arguments: Vec<CallArgument> = args
            .into_iter()
            .map(|value| CallArgument::builder().value(value).build())
            .collect();
        let params = CallFunctionOnParams::builder()
            .object_id(RemoteObjectId::new(object_id))
            .function_declaration(declaration)
            .arguments(arguments)
            .build()
            .map_err(|e| ProtocolError::call("Runtime.callFunctionOn", e))?;

        let resp = self
            .page
            .execute(params)
            .await
            .map_err(|e| ProtocolError::call("Runtime.callFunctionOn", e))?;
        Ok(FunctionResult {
            value: resp.result.result.value.clone(),
            exception_details: resp
                .result
                .exception_details
                .as_ref()
                .map(|details| serde_json::to_value(details).unwrap_or(Value::Null)),
        })
    }

    async fn computed_style(&self, id: NodeId) -> Result<Vec<StyleProperty>, ProtocolError> {
        // the CSS domain only takes session-local ids; describe to obtain one
        let local_id = match id {
            NodeId::Local(v) => v,
            NodeId::Backend(_) => self.describe_node(id).await?.node_id.unwrap_or(0),
        };
        let params = GetComputedStyleForNodeParams::builder()
            .node_id(dom::NodeId::new(local_id))
            .build()
            .map_err(|e| ProtocolError::call("CSS.getComputedStyleForNode", e))?;
        let resp = self
            .page
            .execute(params)
            .await
            .map_err(|e| ProtocolError::call("CSS.getComputedStyleForNode", e))?;
        Self::convert(&resp.result.computed_style, "CSS.getComputedStyleForNode")
    }

    async fn event_listeners(
        &self,
        object_id: &str,
    ) -> Result<Vec<ListenerLocation>, ProtocolError> {
        let params = GetEventListenersParams::builder()
            .object_id(RemoteObjectId::new(object_id))
            .build()
            .map_err(|e| ProtocolError::call("DOMDebugger.getEventListeners", e))?;
        let resp = self
            .page
            .execute(params)
            .await
            .map_err(|e| ProtocolError::call("DOMDebugger.getEventListeners", e))?;
        Self::convert(&resp.result.listeners, "DOMDebugger.getEventListeners")
    }

    async fn script_source(&self, script_id: &str) -> Result<String, ProtocolError> {
        let params = GetScriptSourceParams::builder()
            .script_id(ScriptId::new(script_id))
            .build()
            .map_err(|e| ProtocolError::call("Debugger.getScriptSource", e))?;
        let resp = self
            .page
            .execute(params)
            .await
            .map_err(|e| ProtocolError::call("Debugger.getScriptSource", e))?;
        Ok(resp.result.script_source.clone())
    }

    async fn focus_node(&self, id: NodeId) -> Result<(), ProtocolError> {
        self.page
            .execute(focus_params(id))
            .await
            .map_err(|e| ProtocolError::call("DOM.focus", e))?;
        Ok(())
    }

    async fn dispatch_key_event(&self, kind: KeyEventKind, key: &str) -> Result<(), ProtocolError> {
        let event_type = match kind {
            KeyEventKind::Down => DispatchKeyEventType::KeyDown,
            KeyEventKind::Up => DispatchKeyEventType::KeyUp,
        };
        let params = DispatchKeyEventParams::builder()
            .r#type(event_type)
            .key(key)
            .text(key)
            .unmodified_text(key)
            .build()
            .map_err(|e| ProtocolError::call("Input.dispatchKeyEvent", e))?;
        self.page
            .execute(params)
            .await
            .map_err(|e| ProtocolError::call("Input.dispatchKeyEvent", e))?;
        Ok(())
    }
}
