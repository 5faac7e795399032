use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use mimalloc::MiMalloc;
use tracing_subscriber::EnvFilter;

use pagelens::ax_tree::render_text;
use pagelens::browser::BrowserSession;
use pagelens::dom_tree::PageInspector;
use pagelens::interact::Interactor;
use pagelens::protocol::NodeId;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Inspect and drive a live Chrome page over the DevTools protocol.
#[derive(Parser)]
#[command(name = "pagelens", version, about)]
struct Cli {
    /// Navigate the selected page to this URL first
    #[arg(short, long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum SnapshotKind {
    /// Readable accessibility tree
    Ax,
    /// Enriched DOM tree
    Dom,
}

#[derive(Subcommand)]
enum Command {
    /// Print a snapshot of the current page
    Snapshot {
        kind: SnapshotKind,
        /// Render the accessibility tree as indented text instead of JSON
        #[arg(long)]
        text: bool,
    },
    /// Click a node by backend node id
    Click { id: i64 },
    /// Focus a node
    Focus { id: i64 },
    /// Send keystrokes to a node
    Type { id: i64, keys: String },
    /// Set the value of an input, select, or textarea
    SetValue { id: i64, value: String },
    /// Read the live value of a node
    GetValue {
        id: i64,
        /// Report nothing instead of failing on unsupported elements
        #[arg(long)]
        safe: bool,
    },
    /// Submit a form (or search input)
    Submit { id: i64 },
    /// Select an option on a select element by index
    SelectIndex { id: i64, index: i64 },
    /// Capture a JPEG screenshot of the page, or of one node
    Screenshot {
        #[arg(long)]
        id: Option<i64>,
        #[arg(short, long, default_value = "page.jpg")]
        out: PathBuf,
    },
    /// Print and clear captured console output
    Logs,
    /// List open pages
    Pages,
    /// Print the current page URL
    Url,
    /// Go one step back in history
    Back,
    /// Go one step forward in history
    Forward,
    /// Reload the current page
    Reload {
        #[arg(long)]
        ignore_cache: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if dotenvy::dotenv().is_err() {
        let _ = dotenvy::from_filename("../.env");
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut session = BrowserSession::connect().await?;
    let client = session.client().await?;

    if let Some(url) = &cli.url {
        session.navigate(url).await?;
    }

    match cli.command {
        Command::Snapshot { kind, text } => {
            let inspector = PageInspector::new(client.clone());
            match kind {
                SnapshotKind::Ax => {
                    let tree = inspector.ax_tree().await?;
                    if text {
                        print!("{}", render_text(&tree));
                    } else {
                        println!("{}", serde_json::to_string_pretty(&tree)?);
                    }
                }
                SnapshotKind::Dom => {
                    let tree = inspector.dom_tree().await?;
                    println!("{}", serde_json::to_string_pretty(&tree)?);
                }
            }
        }
        Command::Click { id } => {
            Interactor::new(client.clone()).click(NodeId::Backend(id)).await?;
            session
                .wait_until_loaded(std::time::Duration::from_secs(10))
                .await?;
            println!("ok");
        }
        Command::Focus { id } => {
            Interactor::new(client.clone()).focus(NodeId::Backend(id)).await?;
            println!("ok");
        }
        Command::Type { id, keys } => {
            Interactor::new(client.clone())
                .send_keys(NodeId::Backend(id), &keys)
                .await?;
            println!("ok");
        }
        Command::SetValue { id, value } => {
            Interactor::new(client.clone())
                .set_value(NodeId::Backend(id), &value)
                .await?;
            println!("ok");
        }
        Command::GetValue { id, safe } => {
            let value = Interactor::new(client.clone())
                .get_value(NodeId::Backend(id), safe)
                .await?;
            if let Some(value) = value {
                println!("{value}");
            }
        }
        Command::Submit { id } => {
            Interactor::new(client.clone()).submit(NodeId::Backend(id)).await?;
            println!("ok");
        }
        Command::SelectIndex { id, index } => {
            Interactor::new(client.clone())
                .select_index(NodeId::Backend(id), index)
                .await?;
            println!("ok");
        }
        Command::Screenshot { id, out } => {
            let image = match id {
                Some(id) => client.node_screenshot(NodeId::Backend(id)).await?,
                None => client.screenshot().await?,
            };
            tokio::fs::write(&out, image).await?;
            println!("{}", out.display());
        }
        Command::Logs => {
            println!("{}", serde_json::to_string_pretty(&client.drain_console())?);
        }
        Command::Pages => {
            println!("{}", serde_json::to_string_pretty(&session.list_pages().await?)?);
        }
        Command::Url => {
            println!("{}", session.current_url().await?);
        }
        Command::Back => {
            session.back().await?;
            println!("ok");
        }
        Command::Forward => {
            session.forward().await?;
            println!("ok");
        }
        Command::Reload { ignore_cache } => {
            session.reload(ignore_cache).await?;
            println!("ok");
        }
    }

    Ok(())
}
