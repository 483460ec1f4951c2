use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use millionboxes::{
    config::Config,
    engine::{
        cache::{spawn_refresher, StateCache},
        consumer::{handler::CheckboxActionHandler, Consumer},
        queue::{connect_transport, wire::CheckboxAction, CheckboxQueue, QueueProvider},
        store::{sqlite::SqliteCheckboxStore, Gateway},
    },
    ids::{IdGenerator, UuidV7},
    service::ActionPublisher,
    telemetry, Error, Result,
};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "millionboxes", about = "Checkbox state sync engine")]
struct Cli {
    /// Config file; defaults to config/<environment>.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply queued checkbox actions until interrupted.
    Consume {
        /// Host a state cache kept current by this consumer.
        #[arg(long)]
        with_cache: bool,
    },
    /// Publish a single checkbox action.
    Publish {
        #[arg(long)]
        checkbox: u32,
        #[arg(long)]
        action: CheckboxAction,
        #[arg(long)]
        user: Option<Uuid>,
        #[arg(long, default_value = "127.0.0.1")]
        ip: String,
    },
    /// Print the stored state of one checkbox.
    Status { checkbox: u32 },
    /// Load every checkbox into a cache and report how many are checked.
    LoadCache,
    /// Create and seed a SQLite database.
    BootstrapSqlite {
        /// Overrides database.url.
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error [{}]: {e}", e.code());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    telemetry::init(&config.logging)?;
    info!(environment = %config.environment, "configuration loaded");

    match cli.command {
        Command::Consume { with_cache } => consume(&config, with_cache).await,
        Command::Publish {
            checkbox,
            action,
            user,
            ip,
        } => publish(&config, checkbox, action, user, &ip).await,
        Command::Status { checkbox } => {
            let gateway = Gateway::connect(&config).await?;
            let status = gateway.status(checkbox).await;
            gateway.close().await;
            let status = status?;
            println!(
                "checkbox {checkbox}: {} (last updated {})",
                if status.checked { "checked" } else { "unchecked" },
                status.last_updated
            );
            Ok(())
        }
        Command::LoadCache => {
            let gateway = Gateway::connect(&config).await?;
            let cache = StateCache::new(config.checkbox_count as usize);
            cache.init()?;
            let checked = cache.reload_from(&gateway).await;
            gateway.close().await;
            println!("{} of {} checkboxes checked", checked?, cache.len());
            Ok(())
        }
        Command::BootstrapSqlite { url } => {
            let url = match url {
                Some(url) => url,
                None => config.database.require_url()?.to_string(),
            };
            if !url.starts_with("sqlite:") {
                return Err(Error::Config(format!("{url:?} is not a sqlite url")));
            }
            let store = SqliteCheckboxStore::connect(
                &url,
                &config.database,
                config.checkbox_count,
            )
            .await?;
            let seeded = store.bootstrap().await?;
            println!("{url}: schema ready, {seeded} checkboxes seeded");
            Ok(())
        }
    }
}

async fn consume(config: &Config, with_cache: bool) -> Result<()> {
    let gateway = Gateway::connect(config).await?;
    let queue = CheckboxQueue::new(connect_transport(&config.queue).await?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handler = CheckboxActionHandler::new(gateway.clone(), queue.clone());
    let mut refresher = None;
    if with_cache {
        let cache = Arc::new(StateCache::new(config.checkbox_count as usize));
        cache.init()?;
        cache.reload_from(&gateway).await?;
        if let Some(period) = config.cache.refresh_interval() {
            refresher = Some(spawn_refresher(
                cache.clone(),
                gateway.clone(),
                period,
                shutdown_rx.clone(),
            ));
        }
        handler = handler.with_cache(cache);
    }
    let consumer = Consumer::new(queue, Arc::new(handler), config);

    let health = gateway
        .spawn_health_check(config.database.health_check_period(), shutdown_rx.clone());
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let stats = consumer.run(shutdown_rx).await;
    telemetry::join_logged("health check", health).await;
    if let Some(refresher) = refresher {
        telemetry::join_logged("cache refresher", refresher).await;
    }
    gateway.close().await;
    info!(%stats, "consumer stopped");
    Ok(())
}

async fn publish(
    config: &Config,
    checkbox: u32,
    action: CheckboxAction,
    user: Option<Uuid>,
    ip: &str,
) -> Result<()> {
    if config.queue.provider == QueueProvider::Memory {
        warn!("memory queue selected; the action will not outlive this process");
    }

    let queue = CheckboxQueue::new(connect_transport(&config.queue).await?);
    let publisher = ActionPublisher::new(
        queue,
        Arc::new(UuidV7),
        config.server_name.as_str(),
        config.checkbox_count,
    );
    let user = match user {
        Some(user) => user,
        None => UuidV7.new_id()?,
    };
    let (request_id, receipt) = publisher.request_action(action, checkbox, user, ip).await?;
    println!(
        "request {request_id} published as message {} (sequence {})",
        receipt.message_id, receipt.sequence_number
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
