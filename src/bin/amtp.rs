//! AMTP command-line client.
//!
//! # Commands
//!
//! - `agent` - Run an echo agent until Ctrl-C
//! - `send` - Send one message
//! - `inbox` - Pull one batch from the inbox
//! - `validate` - Validate a payload against a schema file offline
//!
//! `send` and `inbox` register the configured address for the duration of
//! the command and unregister it on exit. Pass `--keep-registered` when an
//! `amtp agent` is serving the same address, otherwise it is deregistered.

use std::path::{Path, PathBuf};

use amtp::{
    protocol::{DeliveryMode, HandlerResponse, Message},
    schema::Schema,
    Config, DeliveryFailure, Session, VERSION,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "amtp")]
#[command(version = VERSION)]
#[command(about = "AMTP - Agent Message Transfer Protocol client", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/amtp/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent address (agent@domain)
    #[arg(long, global = true)]
    address: Option<String>,

    /// Gateway URL
    #[arg(long, global = true)]
    gateway: Option<String>,

    /// Delivery mode (pull, push)
    #[arg(long, global = true)]
    mode: Option<DeliveryMode>,

    /// API key
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo agent that replies with a receipt
    Agent,

    /// Send a message
    Send {
        /// Recipient addresses
        #[arg(long = "to", required = true, num_args = 1..)]
        to: Vec<String>,

        /// Subject line
        #[arg(short, long)]
        subject: Option<String>,

        /// JSON payload
        #[arg(short, long)]
        payload: Option<String>,

        /// Schema reference
        #[arg(long)]
        schema: Option<String>,

        /// Leave the address registered on exit
        #[arg(long)]
        keep_registered: bool,
    },

    /// Pull one batch from the inbox
    Inbox {
        /// Maximum messages to pull
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Acknowledge pulled messages
        #[arg(long)]
        ack: bool,

        /// Leave the address registered on exit
        #[arg(long)]
        keep_registered: bool,
    },

    /// Validate a payload against a schema (offline)
    Validate {
        /// Schema file ({id, name, version, schema, description})
        #[arg(long)]
        schema: PathBuf,

        /// Payload file (JSON)
        #[arg(long)]
        payload: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    if let Commands::Validate { schema, payload } = &cli.command {
        return cmd_validate(schema, payload);
    }

    let config = load_config(&cli)?;
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        match cli.command {
            Commands::Agent => cmd_agent(&config).await,
            Commands::Send {
                to,
                subject,
                payload,
                schema,
                keep_registered,
            } => cmd_send(&config, to, subject, payload, schema, keep_registered).await,
            Commands::Inbox {
                limit,
                ack,
                keep_registered,
            } => cmd_inbox(&config, limit, ack, keep_registered).await,
            Commands::Validate { .. } => Ok(()),
        }
    })
}

fn init_logging(verbose: bool, json_logs: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// File/env config with CLI flags applied on top
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(address) = &cli.address {
        config.agent.address = Some(address.clone());
    }
    if let Some(gateway) = &cli.gateway {
        config.agent.gateway_url = gateway.clone();
    }
    if let Some(mode) = cli.mode {
        config.agent.delivery_mode = mode;
    }
    if let Some(key) = &cli.api_key {
        config.agent.api_key = Some(key.clone());
    }

    Ok(config)
}

async fn cmd_agent(config: &Config) -> anyhow::Result<()> {
    let session = Session::builder_from_config(config)?.build()?;

    session.on_message(|msg: Message| async move {
        tracing::info!(
            "Message {} from {}: {}",
            msg.message_id,
            msg.sender,
            msg.subject.as_deref().unwrap_or("(no subject)")
        );
        anyhow::Ok(HandlerResponse::Reply(json!({
            "status": "received",
            "original_message_id": msg.message_id,
            "original_payload": msg.payload,
        })))
    });
    session.on_error(|failure: DeliveryFailure| async move {
        tracing::warn!("Delivery failure: {}", failure);
        anyhow::Ok(())
    });

    println!("Echo agent {} running. Press Ctrl-C to stop.", session.address());
    session
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await?;

    let stats = session.stats();
    println!(
        "Stopped. received={} replied={} acknowledged={} failures={}",
        stats.messages_received,
        stats.replies_sent,
        stats.messages_acknowledged,
        stats.delivery_failures
    );
    Ok(())
}

async fn cmd_send(
    config: &Config,
    to: Vec<String>,
    subject: Option<String>,
    payload: Option<String>,
    schema: Option<String>,
    keep_registered: bool,
) -> anyhow::Result<()> {
    let session = Session::builder_from_config(config)?.build()?;

    let mut message = Message::new("", to);
    if let Some(subject) = subject {
        message = message.with_subject(subject);
    }
    if let Some(raw) = payload {
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid --payload JSON: {}", e))?;
        message = message.with_payload(value);
    }
    if let Some(schema) = schema {
        message = message.with_schema(schema);
    }

    session.register().await?;
    let result = session.send(message).await;
    release(&session, keep_registered).await;

    println!("{}", result?);
    Ok(())
}

async fn cmd_inbox(
    config: &Config,
    limit: usize,
    ack: bool,
    keep_registered: bool,
) -> anyhow::Result<()> {
    let session = Session::builder_from_config(config)?.build()?;
    session.register().await?;

    let outcome = async {
        let messages = session.receive_batch(limit).await?;
        let wire = messages
            .iter()
            .map(Message::to_transport)
            .collect::<amtp::Result<Vec<_>>>()?;
        println!("{}", serde_json::to_string_pretty(&wire)?);

        if ack {
            for message in &messages {
                session.acknowledge(&message.message_id).await?;
            }
        }
        anyhow::Ok(())
    }
    .await;

    release(&session, keep_registered).await;
    outcome
}

/// End a one-shot command's session
async fn release(session: &Session, keep_registered: bool) {
    if keep_registered {
        tracing::debug!("Leaving {} registered", session.address());
    } else {
        session.unregister().await;
    }
    session.close();
}

fn cmd_validate(schema_path: &Path, payload_path: &Path) -> anyhow::Result<()> {
    let schema = Schema::from_json(&std::fs::read_to_string(schema_path)?)?;
    let payload: Value = serde_json::from_str(&std::fs::read_to_string(payload_path)?)?;

    let violations = schema.validate_detailed(&payload);
    if violations.is_empty() {
        println!("OK: payload conforms to {}", schema.id());
        return Ok(());
    }

    for violation in &violations {
        println!("{violation}");
    }
    anyhow::bail!(
        "{} violation(s) against {}",
        violations.len(),
        schema.id()
    )
}
