use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strato_core::config::Config;
use strato_core::error::{Result, StratoError};
use strato_core::feed::HttpFeedSource;
use strato_core::local::{HttpLocalStore, LocalStore};
use strato_core::migrate::{Migrator, MigratorConfig};
use strato_core::provider::{ProviderConfig, RemoteProvider};
use strato_core::shard::Partition;
use strato_core::stats::StatsReporterFactory;
use strato_core::status::{MigrationStatusList, SyncStatusStore};
use strato_core::sync::{InFlight, SyncEngine};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "strato")]
#[command(about = "Cloud sync, migration and shunting for the local object cluster")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push local mutations to the configured remote buckets
    Sync {
        /// Path to configuration file
        #[arg(short, long, default_value = "/etc/strato/sync.json")]
        config: PathBuf,
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
    /// Pull remote buckets into the local cluster
    Migrate {
        /// Path to configuration file
        #[arg(short, long, default_value = "/etc/strato/sync.json")]
        config: PathBuf,
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
    /// Serve the namespace-merging proxy
    Shunt {
        /// Path to configuration file
        #[arg(short, long, default_value = "/etc/strato/sync.json")]
        config: PathBuf,
        /// Listen address
        #[arg(short, long, default_value = "0.0.0.0:8085")]
        bind: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strato=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sync { config, once } => {
            let Some(cfg) = load_config(&config) else {
                return;
            };
            if let Err(e) = run_sync(cfg, config, once).await {
                tracing::error!("Sync daemon failed: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Migrate { config, once } => {
            let Some(cfg) = load_config(&config) else {
                return;
            };
            if let Err(e) = run_migrate(cfg, config, once).await {
                tracing::error!("Migrator failed: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Shunt { config, bind } => {
            if let Err(e) = run_shunt(config, bind).await {
                tracing::error!("Shunt failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}

/// A missing config file exits cleanly so supervisors do not restart-storm
/// a host that simply has no mappings yet; a present-but-broken one is
/// fatal.
fn load_config(path: &PathBuf) -> Option<Config> {
    if !path.exists() {
        tracing::warn!("Config {} does not exist, nothing to do", path.display());
        return None;
    }
    match Config::from_file(path) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::error!("Invalid config {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("signal handler installs");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

async fn run_sync(mut config: Config, config_path: PathBuf, once: bool) -> Result<()> {
    let status = Arc::new(SyncStatusStore::new(config.status_dir.clone()));
    let purged = status.purge_stale(&config.containers).await?;
    if purged > 0 {
        tracing::info!("Purged {} stale status entries at startup", purged);
    }

    let mut watcher = strato_core::config::ConfigWatcher::new(config_path);
    watcher.poll();
    let in_flight = Arc::new(InFlight::default());
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let stats_factory = StatsReporterFactory::new(
            config.statsd_host.as_deref(),
            config.statsd_port,
            config.statsd_prefix.as_deref(),
        );
        let local: Arc<dyn LocalStore> = Arc::new(HttpLocalStore::new(&config.local_endpoint));
        let feed = HttpFeedSource::new(&config.local_endpoint);
        let partition = Partition::new(config.process, config.processes);

        let cycle_start = std::time::Instant::now();
        let mut shutdown_requested = false;
        {
            let cycle = run_sync_cycle(
                &config,
                &status,
                &stats_factory,
                local,
                &feed,
                partition,
                &in_flight,
            );
            tokio::pin!(cycle);
            tokio::select! {
                result = &mut cycle => {
                    if let Err(e) = result {
                        tracing::error!("Sync pass failed: {}", e);
                    }
                }
                _ = &mut shutdown => {
                    // In-flight work gets graceful_timeout to finish; status
                    // checkpoints happen per batch, so whatever lands is saved.
                    tracing::info!("Shutdown requested, draining");
                    let _ = tokio::time::timeout(
                        Duration::from_secs_f64(config.graceful_timeout),
                        &mut cycle,
                    )
                    .await;
                    shutdown_requested = true;
                }
            }
        }
        if shutdown_requested {
            break;
        }
        if once {
            tracing::info!("Finished cycle in {:.2?}", cycle_start.elapsed());
            return Ok(());
        }

        let naptime = Duration::from_secs_f64(
            (config.poll_interval - cycle_start.elapsed().as_secs_f64()).max(0.0),
        );
        tracing::info!(
            "Finished cycle in {:.2?}, sleeping for {:.2?}",
            cycle_start.elapsed(),
            naptime
        );
        tokio::select! {
            _ = tokio::time::sleep(naptime) => {}
            _ = &mut shutdown => break,
        }
        if let Some(new_config) = watcher.poll() {
            tracing::info!("Configuration reloaded");
            config = new_config;
        }
    }
    Ok(())
}

async fn run_sync_cycle(
    config: &Config,
    status: &Arc<SyncStatusStore>,
    stats_factory: &StatsReporterFactory,
    local: Arc<dyn LocalStore>,
    feed: &HttpFeedSource,
    partition: Partition,
    in_flight: &Arc<InFlight>,
) -> Result<()> {
    for profile in &config.containers {
        // A wildcard profile fans out into one engine per container.
        let resolved = if profile.per_account() {
            let mut containers = Vec::new();
            let mut marker = String::new();
            loop {
                let page = local
                    .list_account(&profile.account, &marker, config.items_chunk)
                    .await?;
                let Some(last) = page.last() else { break };
                marker = last.name.clone();
                containers.extend(page.into_iter().map(|entry| entry.name));
            }
            containers
                .into_iter()
                .map(|container| profile.for_container(&container))
                .collect()
        } else {
            vec![profile.clone()]
        };

        // Containers run concurrently, bounded by the enumerator pool;
        // each engine has its own row workers inside.
        futures_util::stream::iter(resolved)
            .for_each_concurrent(config.enumerator_workers.max(1), |profile| {
                let local = local.clone();
                let status = status.clone();
                let in_flight = in_flight.clone();
                let stats = stats_factory.instance(&profile.account, &profile.container);
                async move {
                    let account = profile.account.clone();
                    let container = profile.container.clone();
                    let provider =
                        match RemoteProvider::create(ProviderConfig::from_sync(&profile)).await {
                            Ok(provider) => Arc::new(provider),
                            Err(e) => {
                                tracing::error!(
                                    "Provider for {}/{} unavailable: {}",
                                    account,
                                    container,
                                    e
                                );
                                return;
                            }
                        };
                    let engine = match SyncEngine::new(
                        profile,
                        provider,
                        local,
                        status,
                        stats,
                        partition,
                        in_flight,
                        config.workers,
                        config.items_chunk,
                        3,
                    ) {
                        Ok(engine) => Arc::new(engine),
                        Err(e) => {
                            tracing::error!("Engine for {}/{}: {}", account, container, e);
                            return;
                        }
                    };
                    match engine.run_pass(feed).await {
                        Ok(stats) => {
                            tracing::info!(
                                "Synced {}/{}: {} scanned, {} uploaded, {} deleted, {} errors",
                                account,
                                container,
                                stats.scanned,
                                stats.uploaded,
                                stats.deleted,
                                stats.errors
                            );
                        }
                        Err(e) => {
                            tracing::error!("Pass for {}/{} failed: {}", account, container, e);
                        }
                    }
                }
            })
            .await;
    }
    Ok(())
}

async fn run_migrate(mut config: Config, config_path: PathBuf, once: bool) -> Result<()> {
    let settings = config
        .migrator_settings
        .clone()
        .ok_or_else(|| StratoError::Config("missing migrator_settings section".to_string()))?;

    let mut watcher = strato_core::config::ConfigWatcher::new(config_path);
    watcher.poll();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let settings = config.migrator_settings.clone().unwrap_or_else(|| settings.clone());
        let stats_factory = StatsReporterFactory::new(
            config.statsd_host.as_deref(),
            config.statsd_port,
            settings.statsd_prefix.as_deref(),
        );
        let cycle_start = std::time::Instant::now();
        let mut shutdown_requested = false;
        {
            let cycle = run_migrate_cycle(&config, &settings, &stats_factory);
            tokio::pin!(cycle);
            tokio::select! {
                result = &mut cycle => {
                    if let Err(e) = result {
                        tracing::error!("Migration cycle failed: {}", e);
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, draining");
                    let _ = tokio::time::timeout(
                        Duration::from_secs_f64(config.graceful_timeout),
                        &mut cycle,
                    )
                    .await;
                    shutdown_requested = true;
                }
            }
        }
        if shutdown_requested {
            break;
        }
        if once {
            tracing::info!("Finished cycle in {:.2?}", cycle_start.elapsed());
            return Ok(());
        }
        let naptime = Duration::from_secs_f64(
            (settings.poll_interval - cycle_start.elapsed().as_secs_f64()).max(0.0),
        );
        tracing::info!(
            "Finished cycle in {:.2?}, sleeping for {:.2?}",
            cycle_start.elapsed(),
            naptime
        );
        tokio::select! {
            _ = tokio::time::sleep(naptime) => {}
            _ = &mut shutdown => break,
        }
        if let Some(new_config) = watcher.poll() {
            tracing::info!("Configuration reloaded");
            config = new_config;
        }
    }
    Ok(())
}

async fn run_migrate_cycle(
    config: &Config,
    settings: &strato_core::config::MigratorSettings,
    stats_factory: &StatsReporterFactory,
) -> Result<()> {
    let mut status = MigrationStatusList::open(settings.status_file.clone()).await?;
    let local: Arc<dyn LocalStore> = Arc::new(HttpLocalStore::new(&config.local_endpoint));
    let partition = Partition::new(settings.process, settings.processes);
    let mut handled = Vec::new();

    for profile in &config.migrations {
        if !profile.all_buckets()
            && !partition.owns_container(&settings.ring_name, profile.local_container())
        {
            continue;
        }
        let provider =
            match RemoteProvider::create(ProviderConfig::from_migration(profile)).await {
                Ok(provider) => Arc::new(provider),
                Err(e) => {
                    tracing::error!("Provider for {} unavailable: {}", profile.aws_bucket, e);
                    handled.push(strato_core::status::MigrationKey::of(profile));
                    continue;
                }
            };
        tracing::info!(
            "Processing {}:{}:{}",
            profile.aws_endpoint,
            profile.aws_identity,
            profile.aws_bucket
        );
        let migrator = Migrator::new(
            profile.clone(),
            provider,
            local.clone(),
            MigratorConfig {
                items_chunk: settings.items_chunk,
                workers: settings.workers,
                segment_size: settings.segment_size,
                max_object_size: config.max_object_size,
                ring_name: settings.ring_name.clone(),
                partition,
            },
            stats_factory.instance(&profile.account, profile.local_container()),
        );
        match migrator.next_pass(&mut status).await {
            Ok(keys) => handled.extend(keys),
            Err(e) => {
                // Keep the status entry so the next cycle retries rather
                // than pruning a migration that merely hiccuped.
                handled.push(strato_core::status::MigrationKey::of(profile));
                tracing::error!("Migration of {} failed: {}", profile.aws_bucket, e);
            }
        }
    }

    status.prune(&handled).await?;
    Ok(())
}

async fn run_shunt(config_path: PathBuf, bind: String) -> Result<()> {
    if !config_path.exists() {
        tracing::warn!(
            "Config {} does not exist, nothing to shunt",
            config_path.display()
        );
        return Ok(());
    }
    let state = strato_shunt::ShuntState::new(config_path)?;
    let app = strato_shunt::router(state);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("Shunt listening on {}", bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
