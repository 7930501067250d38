use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::prelude::*;
use tokio::sync::watch;
use tracing::{error, info};

use tg_communicator::aggregator::{log_terminal_events, Aggregator};
use tg_communicator::config;
use tg_communicator::db;
use tg_communicator::handlers::{self, FrontEnd};
use tg_communicator::messenger::TelegramMessenger;
use tg_communicator::worker::{self, SendWorker};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

async fn on_message(bot: Bot, msg: Message, front: FrontEnd) -> ResponseResult<()> {
    if let Err(err) = handlers::handle_update(&bot, &front, &msg).await {
        error!(?err, "failed to handle update");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let aggregator = Aggregator::new(pool.clone());
    let events = tokio::spawn(log_terminal_events(aggregator.subscribe()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let send_worker = Arc::new(
        SendWorker::new(
            pool.clone(),
            Arc::new(TelegramMessenger::new(cfg.telegram.bot_token.clone())),
            aggregator,
            cfg.retry_policy(),
            cfg.lease(),
        )
        .with_concurrency(cfg.delivery.unit_concurrency),
    );
    let workers = worker::spawn_pool(
        send_worker,
        cfg.delivery.workers,
        cfg.poll_interval(),
        shutdown_rx,
    );
    info!(workers = workers.len(), "send workers started");

    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let me = bot.get_me().await?;
    let front = FrontEnd {
        pool: pool.clone(),
        tenant_id: cfg.app.tenant_id.clone(),
        filter: cfg.tenant_filter(),
        bot_id: me.id,
    };

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(on_message))
        .branch(Update::filter_channel_post().endpoint(on_message));

    info!("starting telegram bot");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![front])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("bot stopped; waiting for send workers");
    let _ = shutdown_tx.send(true);
    for handle in workers {
        if let Err(err) = handle.await {
            error!(?err, "send worker panicked");
        }
    }
    // Workers held the last senders; the listener ends once they are gone.
    let _ = events.await;
    Ok(())
}
