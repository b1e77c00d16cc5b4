//! `socket-trigger` CLI entry-point.
//!
//! Available sub-commands:
//! - `listen`  : open a workflow's socket trigger and run the workflow for
//!   every inbound message.
//! - `validate`: validate a workflow JSON file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use engine::{default_registry, ExecutorConfig, Workflow, WorkflowActivity, WorkflowBridge, WorkflowExecutor};
use trigger::{AuthContext, ConnectionManager, StaticAuthProvider};

#[derive(Parser)]
#[command(
    name = "socket-trigger",
    about = "Run workflows from a persistent outbound WebSocket connection",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect the workflow's trigger and run the workflow per message.
    Listen {
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// Stop after the first message (manual test run).
        #[arg(long)]
        once: bool,
        #[command(flatten)]
        credentials: CredentialArgs,
    },
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
}

#[derive(clap::Args)]
struct CredentialArgs {
    #[arg(long, env = "SOCKET_TRIGGER_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
    #[arg(long, env = "SOCKET_TRIGGER_CLIENT_ID")]
    client_id: Option<String>,
    #[arg(long, env = "SOCKET_TRIGGER_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,
    /// OAuth2 credential JSON (`oauthTokenData`, `clientId`, `clientSecret`).
    /// Explicit flags take precedence over values read from this file.
    #[arg(long)]
    credentials_file: Option<PathBuf>,
}

impl CredentialArgs {
    fn resolve(self) -> Result<Option<AuthContext>> {
        let from_file = match &self.credentials_file {
            Some(path) => {
                let raw: serde_json::Value = read_json(path)?;
                Some(AuthContext::from_oauth2(&raw))
            }
            None => None,
        };
        let base = from_file.unwrap_or_default();

        let auth = AuthContext::new(
            self.access_token.or_else(|| base.access_token().map(str::to_owned)),
            self.client_id.or_else(|| base.client_id().map(str::to_owned)),
            self.client_secret.or_else(|| base.client_secret().map(str::to_owned)),
        );
        Ok((!auth.is_empty()).then_some(auth))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Listen {
            path,
            once,
            credentials,
        } => listen(&path, once, credentials).await,
        Command::Validate { path } => {
            let workflow = load_workflow(&path)?;
            workflow
                .trigger_config()
                .context("workflow trigger is not a usable socket trigger")?;
            let plan = engine::plan(&workflow).context("workflow graph is invalid")?;
            println!("Workflow is valid. Execution order: {:?}", plan.order());
            Ok(())
        }
    }
}

async fn listen(path: &Path, once: bool, credentials: CredentialArgs) -> Result<()> {
    let workflow = load_workflow(path)?;
    let config = workflow
        .trigger_config()
        .context("workflow trigger is not a usable socket trigger")?;
    engine::plan(&workflow).context("workflow graph is invalid")?;
    let auth = credentials.resolve()?;

    let executor = Arc::new(WorkflowExecutor::new(default_registry(), ExecutorConfig::default()));
    let (activity_tx, mut activity_rx) = mpsc::unbounded_channel();
    let bridge = WorkflowBridge::new(Arc::new(workflow), executor).with_observer(activity_tx);

    let mut manager = ConnectionManager::new(config, Arc::new(bridge));
    if let Some(auth) = auth {
        manager = manager.with_auth_provider(Arc::new(StaticAuthProvider(auth)));
    }

    manager
        .activate()
        .await
        .context("failed to open the socket trigger")?;
    info!(uri = %manager.config().uri, once, "listening");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            activity = activity_rx.recv() => match activity {
                Some(WorkflowActivity::Executed(result)) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                    if once {
                        break;
                    }
                }
                Some(WorkflowActivity::Rejected { error, .. }) => {
                    warn!("event dropped: {error}");
                    if once {
                        break;
                    }
                }
                Some(WorkflowActivity::TriggerError(_)) => {}
                None => break,
            },
        }
    }

    manager.deactivate().await;
    Ok(())
}

fn load_workflow(path: &Path) -> Result<Workflow> {
    read_json(path)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}
