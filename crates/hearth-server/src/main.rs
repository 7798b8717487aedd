//! # hearth-server
//!
//! Daemon hosting the Hearth messaging engine.
//!
//! This binary:
//! - opens the local SQLite store (`HEARTH_DB_PATH` or the platform data dir)
//! - runs the **scheduled dispatcher** poll loop
//! - runs periodic **sweeps**: self-destruct and view-limit cleanup, stale
//!   claim recovery, missed-window expiry and retention purges
//! - logs lifecycle notifications emitted by the in-process room fan-out

mod config;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use hearth_core::{KeyManager, MessageService, RoomFanout, ScheduledDispatcher};
use hearth_store::Database;

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hearth_server=debug,hearth_core=debug")),
        )
        .init();

    info!("Starting Hearth daemon v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    info!(path = ?db.path(), "Store opened");
    let db = db.into_shared();

    let fanout = Arc::new(RoomFanout::new(config.fanout_buffer));
    let keys = Arc::new(KeyManager::new(config.key_manager()));
    let service = MessageService::new(config.message_service(), db.clone(), keys, fanout.clone());
    let dispatcher =
        ScheduledDispatcher::new(config.dispatcher(), db, service.clone(), fanout.clone());

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller = dispatcher.clone();
    let poll_interval = config.poll_interval;
    let dispatch_task = tokio::spawn(async move { poller.run(poll_interval, shutdown_rx).await });

    // Periodic sweeps
    let sweeper = dispatcher.clone();
    let sweep_service = service.clone();
    let retention = config.retention();
    let sweep_interval = config.sweep_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            run_sweeps(&sweep_service, &sweeper, retention, Utc::now());
        }
    });

    // Notification log
    let mut notifications = fanout.watch_notifications()?;
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            debug!(?notification, "lifecycle notification");
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run until shutdown
    // -----------------------------------------------------------------------
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = dispatch_task.await {
        error!(error = %e, "Dispatcher task failed");
    }

    Ok(())
}

/// One pass of every periodic sweep. Failures are logged, never fatal.
fn run_sweeps(
    service: &MessageService,
    dispatcher: &ScheduledDispatcher,
    retention: chrono::Duration,
    now: DateTime<Utc>,
) {
    let lifecycle = service.lifecycle();

    if let Err(e) = lifecycle.cleanup_expired_messages(now) {
        error!(error = %e, "Self-destruct sweep failed");
    }
    if let Err(e) = lifecycle.cleanup_messages_at_view_limit(now) {
        error!(error = %e, "View-limit sweep failed");
    }
    match dispatcher.sweep(now) {
        Ok(report) => debug!(
            released = report.released,
            expired = report.expired,
            "Dispatcher sweep finished"
        ),
        Err(e) => error!(error = %e, "Dispatcher sweep failed"),
    }
    if let Err(e) = dispatcher.purge_terminal(now) {
        error!(error = %e, "Scheduled retention purge failed");
    }
    let Some(cutoff) = now.checked_sub_signed(retention) else {
        error!(retention_days = retention.num_days(), "Retention window out of range, skipping purge");
        return;
    };
    match lifecycle.purge_destroyed(cutoff) {
        Ok(0) => {}
        Ok(n) => info!(count = n, "Purged destroyed messages"),
        Err(e) => error!(error = %e, "Message retention purge failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use hearth_shared::protocol::{EphemeralOptions, ScheduleOptions, SendRequest};
    use hearth_shared::types::{RoomId, ScheduledStatus, UserId};
    use hearth_store::SharedDatabase;

    fn engine(dir: &tempfile::TempDir) -> (SharedDatabase, MessageService, ScheduledDispatcher) {
        let config = ServerConfig::default();
        let db = Database::open_at(&dir.path().join("hearth.db"))
            .unwrap()
            .into_shared();
        let fanout = Arc::new(RoomFanout::default());
        let service = MessageService::new(
            config.message_service(),
            db.clone(),
            Arc::new(KeyManager::new(config.key_manager())),
            fanout.clone(),
        );
        let dispatcher =
            ScheduledDispatcher::new(config.dispatcher(), db.clone(), service.clone(), fanout);
        (db, service, dispatcher)
    }

    #[tokio::test]
    async fn test_sweeps_destroy_and_expire() {
        let dir = tempfile::tempdir().unwrap();
        let (db, service, dispatcher) = engine(&dir);
        let now = Utc::now();

        let timed = SendRequest {
            ephemeral: EphemeralOptions {
                self_destruct_at: Some(now + Duration::minutes(1)),
                ..Default::default()
            },
            ..SendRequest::text(RoomId(1), UserId(1), "see you soon")
        };
        service.send(timed, now).await.unwrap();

        let later = SendRequest {
            schedule: Some(ScheduleOptions {
                scheduled_for: now + Duration::minutes(5),
                recurrence_pattern: None,
                end_date: None,
                max_retries: None,
            }),
            ..SendRequest::text(RoomId(1), UserId(1), "reminder")
        };
        service.send(later, now).await.unwrap();

        run_sweeps(&service, &dispatcher, Duration::days(30), now + Duration::hours(2));

        let messages = db
            .with(|db| db.get_messages_for_room(RoomId(1), 10))
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_destroyed());
        assert_eq!(
            dispatcher.count_by_status(ScheduledStatus::Expired).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_sweeps_survive_out_of_range_retention() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, service, dispatcher) = engine(&dir);

        run_sweeps(&service, &dispatcher, Duration::days(100_000_000), Utc::now());
        run_sweeps(&service, &dispatcher, Duration::days(30), Utc::now());
    }
}
