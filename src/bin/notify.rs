use anyhow::Result;
use clap::{ArgGroup, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use tg_communicator::config::{self, Config};
use tg_communicator::db;
use tg_communicator::engine::DeliveryEngine;
use tg_communicator::messenger::TelegramMessenger;
use tg_communicator::model::{Audience, Envelope};
use tg_communicator::worker::SendWorker;

#[derive(Debug, Parser)]
#[command(author, version, about = "Author, start and track broadcast notifications")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Create a draft notification
    #[command(group(
        ArgGroup::new("audience")
            .required(true)
            .args(["team", "channel", "user", "all_users"])
    ))]
    Create {
        #[arg(long)]
        title: String,
        #[arg(long)]
        body: String,
        #[arg(long, num_args = 1..)]
        team: Vec<String>,
        #[arg(long, num_args = 1..)]
        channel: Vec<String>,
        #[arg(long, num_args = 1..)]
        user: Vec<String>,
        /// Every user of the configured tenant
        #[arg(long)]
        all_users: bool,
        #[arg(long)]
        author: Option<String>,
        /// Start delivery right after creating the draft
        #[arg(long)]
        start: bool,
    },
    /// Resolve the audience and queue a draft for delivery
    Start { id: String },
    /// Stop sending to recipients not yet attempted
    Cancel { id: String },
    /// Show state and counters
    Status {
        id: String,
        /// Include per-recipient results
        #[arg(long)]
        results: bool,
    },
    /// Block until the notification is completed or failed
    Wait {
        id: String,
        #[arg(long, default_value = "1000")]
        poll_ms: u64,
    },
    /// Run one send worker until the queue is empty, then exit
    Drain,
}

#[derive(Debug, Serialize)]
struct Created {
    id: String,
    work_units: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Queued {
    id: String,
    work_units: usize,
}

#[derive(Debug, Serialize)]
struct Drained {
    work_units: usize,
}

fn print<T: Serialize>(envelope: &Envelope<T>) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(envelope)?);
    Ok(())
}

fn audience_from(
    cfg: &Config,
    team: Vec<String>,
    channel: Vec<String>,
    user: Vec<String>,
    all_users: bool,
) -> Audience {
    if all_users {
        Audience::AllUsers(cfg.app.tenant_id.clone())
    } else if !team.is_empty() {
        Audience::Teams(team)
    } else if !channel.is_empty() {
        Audience::Channels(channel)
    } else {
        Audience::Users(user)
    }
}

async fn run(cfg: &Config, engine: &DeliveryEngine, cmd: Cmd) -> Result<()> {
    match cmd {
        Cmd::Create {
            title,
            body,
            team,
            channel,
            user,
            all_users,
            author,
            start,
        } => {
            let audience = audience_from(cfg, team, channel, user, all_users);
            let id = match engine
                .create_draft(&title, &body, audience, author.as_deref())
                .await
            {
                Ok(id) => id,
                Err(err) => return print(&Envelope::<Created>::error(err.to_string())),
            };
            if !start {
                return print(&Envelope::ok(Created {
                    id,
                    work_units: None,
                }));
            }
            match engine.start_delivery(&id).await {
                Ok(units) => print(&Envelope::ok(Created {
                    id,
                    work_units: Some(units),
                })),
                Err(err) => print(&Envelope::<Created>::error(format!(
                    "draft {id} created but not started: {err}"
                ))),
            }
        }
        Cmd::Start { id } => match engine.start_delivery(&id).await {
            Ok(work_units) => print(&Envelope::ok(Queued { id, work_units })),
            Err(err) => print(&Envelope::<Queued>::error(err.to_string())),
        },
        Cmd::Cancel { id } => match engine.cancel(&id).await {
            Ok(()) => print(&Envelope::ok(id)),
            Err(err) => print(&Envelope::<String>::error(err.to_string())),
        },
        Cmd::Status { id, results } => {
            let progress = match engine.progress(&id).await {
                Ok(n) => n,
                Err(err) => return print(&Envelope::<serde_json::Value>::error(err.to_string())),
            };
            let mut value = serde_json::to_value(&progress)?;
            value["pending"] = progress.counters.pending().into();
            if results {
                value["results"] = serde_json::to_value(engine.results(&id).await?)?;
            }
            print(&Envelope::ok(value))
        }
        Cmd::Wait { id, poll_ms } => {
            match engine
                .wait_for_terminal(&id, Duration::from_millis(poll_ms))
                .await
            {
                Ok(n) => print(&Envelope::ok(n)),
                Err(err) => print(&Envelope::<()>::error(err.to_string())),
            }
        }
        Cmd::Drain => {
            let worker = SendWorker::new(
                engine.pool().clone(),
                Arc::new(TelegramMessenger::new(cfg.telegram.bot_token.clone())),
                engine.aggregator().clone(),
                cfg.retry_policy(),
                cfg.lease(),
            )
            .with_concurrency(cfg.delivery.unit_concurrency);
            let work_units = worker.drain().await?;
            info!(work_units, "queue drained");
            print(&Envelope::ok(Drained { work_units }))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let engine = DeliveryEngine::from_config(pool, &cfg);
    run(&cfg, &engine, args.command).await
}
