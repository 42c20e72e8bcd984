//! Topicbot CLI entry point.

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt as _;
use std::path::PathBuf;
use topicbot::config::{self, Config};
use topicbot::messaging::TopicTransport;
use topicbot::{InboundEnvelope, InboundEvent};

#[derive(Parser)]
#[command(name = "topicbot")]
#[command(about = "Runs several Telegram bots as one transport, one bot per forum topic")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start every bot and process inbound updates until Ctrl-C
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Enable debug logging
        #[arg(short, long)]
        debug: bool,

        /// Write logs to a daily rolling file in this directory instead of the terminal
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Validate config, check bot permissions, and print bot identities as JSON
    Check {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Move legacy top-level telegram keys into [messaging.telegram]
    MigrateConfig {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(Args, Default)]
struct ConfigArgs {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> anyhow::Result<Config> {
        match &self.config {
            Some(path) => Config::load_from_path(path)
                .with_context(|| format!("failed to load config from {}", path.display())),
            None => Config::load().with_context(|| "failed to load configuration"),
        }
    }

    fn path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| config::default_instance_dir().join("config.toml"))
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run {
        config: ConfigArgs::default(),
        debug: false,
        log_dir: None,
    });

    // rustls needs a process-wide crypto provider before the first TLS handshake.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider was already installed");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    match command {
        Command::Run {
            config,
            debug,
            log_dir,
        } => {
            let _guard = match &log_dir {
                Some(log_dir) => Some(topicbot::logging::init_background_tracing(log_dir, debug)?),
                None => {
                    topicbot::logging::init_foreground_tracing(debug)?;
                    None
                }
            };
            runtime.block_on(cmd_run(config))
        }
        Command::Check { config } => {
            topicbot::logging::init_foreground_tracing(false)?;
            runtime.block_on(cmd_check(config))
        }
        Command::MigrateConfig { config } => {
            topicbot::logging::init_foreground_tracing(false)?;
            cmd_migrate_config(config)
        }
    }
}

async fn cmd_run(config_args: ConfigArgs) -> anyhow::Result<()> {
    tracing::info!("starting topicbot");

    let config = config_args.load()?;
    tracing::info!(
        instance_dir = %config.instance_dir.display(),
        bots = config.bot_count(),
        "configuration loaded"
    );

    let transport =
        TopicTransport::from_config(&config).context("failed to build telegram transport")?;

    let report = transport.verify_permissions().await;
    if !report.all_passed() {
        tracing::warn!(
            failed = report.failed.len(),
            "some bots lack group permissions; their topics are served by the primary bot"
        );
    }

    let mut inbound = transport
        .inbound_stream()
        .context("failed to start inbound stream")?;

    tracing::info!("topicbot started");

    loop {
        tokio::select! {
            envelope = inbound.next() => {
                let Some(envelope) = envelope else {
                    tracing::info!("inbound stream ended");
                    break;
                };
                handle_envelope(&transport, &envelope).await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    tracing::info!("shutting down");
    drop(inbound);
    if let Err(error) = transport.close().await {
        tracing::error!(%error, "shutdown incomplete");
        return Err(error.into());
    }

    tracing::info!("topicbot stopped");
    Ok(())
}

async fn handle_envelope(transport: &TopicTransport, envelope: &InboundEnvelope) {
    match &envelope.event {
        InboundEvent::Message(message) => {
            tracing::info!(
                bot = %envelope.source_key,
                update_id = envelope.update_id,
                conversation_id = message.conversation_id,
                topic_id = ?envelope.topic_hint,
                sender_id = ?message.sender_id,
                text = message.text.as_deref().unwrap_or_default(),
                "inbound message"
            );
        }
        InboundEvent::Interaction(interaction) => {
            tracing::info!(
                bot = %envelope.source_key,
                update_id = envelope.update_id,
                conversation_id = ?interaction.conversation_id,
                topic_id = ?envelope.topic_hint,
                data = ?interaction.data,
                "inbound interaction"
            );
            if let Err(error) = transport.answer_interaction(envelope, None).await {
                tracing::warn!(bot = %envelope.source_key, %error, "failed to answer interaction");
            }
        }
    }
}

async fn cmd_check(config_args: ConfigArgs) -> anyhow::Result<()> {
    let config = config_args.load()?;
    let transport =
        TopicTransport::from_config(&config).context("failed to build telegram transport")?;

    for failure in transport.confirm_identities().await {
        tracing::warn!(%failure, "identity not confirmed");
    }
    let report = transport.verify_permissions().await;

    let snapshots = serde_json::to_string_pretty(&transport.identities())
        .context("failed to serialize identities")?;
    println!("{snapshots}");

    transport.close().await?;

    if report.all_passed() {
        Ok(())
    } else {
        let failures = report
            .failed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        anyhow::bail!("permission check failed: {failures}")
    }
}

fn cmd_migrate_config(config_args: ConfigArgs) -> anyhow::Result<()> {
    let path = config_args.path();
    let changed = config::migrate_config_file(&path)
        .with_context(|| format!("failed to migrate {}", path.display()))?;

    if changed {
        println!("migrated {}", path.display());
    } else {
        println!("{} is already up to date", path.display());
    }
    Ok(())
}
