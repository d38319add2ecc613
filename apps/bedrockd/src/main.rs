use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

mod backup;
mod config;
mod console;
mod remote;
mod supervisor;

use backup::BackupKind;
use console::ConsoleCommand;
use remote::lock::RemoteLock;
use remote::{sync, RemoteStore};
use supervisor::{Driver, ServerEvent, ServerHandle};

const CONFIG_PATH: &str = "config.json";
const SAVE_QUERY_INTERVAL: Duration = Duration::from_secs(5);
const STOP_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let config = config::load(Path::new(CONFIG_PATH))?;
    let worlds_dir = config.server.worlds_dir();
    let backups_dir = config.backup.backups_dir.clone();

    let remote_store = if config.backup.remote.enabled {
        let store = Arc::new(
            RemoteStore::connect(&config.backup.remote, &config.server.level_name).await?,
        );
        store.ensure_bucket(&config.backup.remote.region).await?;
        Some(store)
    } else {
        None
    };

    let lock = match &remote_store {
        Some(store) => RemoteLock::new(store.clone()),
        None => RemoteLock::disabled(),
    };
    lock.claim().await?;

    if let Some(store) = &remote_store {
        sync::reconcile_on_startup(
            store,
            &backups_dir,
            &config.backup.remote.keep,
            &config.backup.local_keep,
        )
        .await;
    }

    match backup::restore::restore_latest(&backups_dir, &worlds_dir).await {
        Ok(Some(name)) => info!(archive = %name, "restored latest backup before start"),
        Ok(None) => {}
        Err(err) => warn!("startup restore failed: {err:#}"),
    }

    info!("starting Minecraft Bedrock server");
    info!("use the 'stop' command to stop the server gracefully, or data since the last backup may be lost");

    let (mut server, mut events) =
        ServerHandle::spawn(&config.server.executable(), &config.server.root).await?;
    let mut console_rx = console::spawn_reader();
    let mut driver = Driver::new(config.clone(), remote_store.clone());

    let period = Duration::from_secs(config.backup.frequency_minutes * 60);
    let mut backup_timer = interval_at(Instant::now() + period, period);
    backup_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut query_timer = tokio::time::interval(SAVE_QUERY_INTERVAL);

    // Failed writes to the child's stdin mean the process is dead or dying;
    // the stdout reader will deliver Closed shortly, and that arm owns the
    // forced-stop recovery. So write failures are logged, never fatal here.
    loop {
        tokio::select! {
            _ = backup_timer.tick() => {
                if let Err(err) = driver.trigger_backup(&mut server, BackupKind::Scheduled).await {
                    warn!("failed to command server: {err:#}");
                }
            }
            _ = query_timer.tick() => {
                if let Err(err) = driver.poll_save_query(&mut server).await {
                    warn!("failed to command server: {err:#}");
                }
            }
            event = events.recv() => match event {
                Some(ServerEvent::Line(line)) => {
                    match driver.handle_server_line(&mut server, &line).await {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(err) => warn!("failed to command server: {err:#}"),
                    }
                }
                Some(ServerEvent::Closed) | None => {
                    if driver.state.stop_requested {
                        break;
                    }
                    error!("server process terminated unexpectedly, taking forced-stop backup");
                    forced_backup(&config).await;
                    std::process::exit(1);
                }
            },
            line = console_rx.recv() => {
                let Some(line) = line else { continue };
                match console::parse_command(&line) {
                    None => {}
                    Some(ConsoleCommand::Backup) => {
                        if let Err(err) = driver.trigger_backup(&mut server, BackupKind::Manual).await {
                            warn!("failed to command server: {err:#}");
                        }
                    }
                    Some(ConsoleCommand::Stop) => {
                        if let Err(err) = driver.request_graceful_stop(&mut server).await {
                            warn!("failed to command server: {err:#}");
                        }
                    }
                    Some(ConsoleCommand::InterceptedSave) => {
                        info!("use the 'backup' command to create a manual backup");
                    }
                    Some(ConsoleCommand::ResourceUsage) => {
                        match server.resource_usage().await {
                            Some(usage) => info!(
                                cpu_percent = usage.cpu_percent,
                                memory_mib = usage.memory_bytes / 1024 / 1024,
                                "server resource usage"
                            ),
                            None => warn!("server process has no stats to report"),
                        }
                    }
                    Some(ConsoleCommand::ForceRestoreUsage) => {
                        info!("usage: force-restore <archive-name>");
                    }
                    Some(ConsoleCommand::ForceRestore(name)) => {
                        warn!(archive = %name, "forcefully stopping server to restore backup; current world state will be snapshotted first");
                        let _ = server.write_line("stop").await;
                        server.wait_for_exit(STOP_GRACE).await;
                        forced_backup(&config).await;
                        match backup::restore::restore(&backups_dir, &worlds_dir, &name).await {
                            Ok(true) => info!(archive = %name, "restored archive"),
                            Ok(false) => {
                                warn!(archive = %name, "unable to restore backup, restarting server as is");
                            }
                            Err(err) => {
                                warn!(archive = %name, "restore failed, restarting server as is: {err:#}");
                            }
                        }
                        let (new_server, new_events) =
                            ServerHandle::spawn(&config.server.executable(), &config.server.root)
                                .await?;
                        server = new_server;
                        events = new_events;
                        driver.reset();
                    }
                    Some(ConsoleCommand::Passthrough(cmd)) => {
                        info!("piping unrecognized command to the server console");
                        if let Err(err) = server.write_line(&cmd).await {
                            warn!("failed to command server: {err:#}");
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, taking forced-stop backup before exit");
                forced_backup(&config).await;
                std::process::exit(1);
            }
        }
    }

    // The final ON_STOP archive is already on disk; tear the server down.
    let _ = server.write_line("stop").await;
    server.wait_for_exit(STOP_GRACE).await;
    if let Err(err) = lock.release().await {
        warn!("failed to release remote backup lock: {err:#}");
    }
    info!("shutdown complete");
    Ok(())
}

async fn forced_backup(config: &config::Config) {
    match backup::unscheduled_backup(
        &config.server.worlds_dir(),
        &config.backup.backups_dir,
        &config.server.level_name,
        config.backup.local_keep.for_kind(BackupKind::OnForcedStop),
    )
    .await
    {
        Ok(name) => info!(archive = %name, "forced-stop backup created"),
        Err(err) => error!("forced-stop backup failed: {err:#}"),
    }
}
