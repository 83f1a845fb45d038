//! Retention manager for cleaning up old events.

use crate::db::Store;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Deletes hits and failures older than the retention period.
pub struct RetentionManager {
    store: Arc<Store>,
    remove_after_days: u32,
    cleanup_interval: Duration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, remove_after_days: u32, cleanup_interval: Duration) -> Self {
        Self {
            store,
            remove_after_days,
            cleanup_interval,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task. Does nothing when retention is 0 days.
    pub fn start(&self) {
        if self.remove_after_days == 0 {
            tracing::info!("RetentionManager: Event retention disabled");
            return;
        }

        let store = self.store.clone();
        let stop = self.stop.clone();
        let days = self.remove_after_days;
        let period = self.cleanup_interval.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            let mut rx = tx.subscribe();
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx);
            }

            let mut interval = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, days, Utc::now());
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

fn process_retention(store: &Store, days: u32, now: DateTime<Utc>) {
    let Some(cutoff) = ChronoDuration::try_days(i64::from(days)).and_then(|d| now.checked_sub_signed(d))
    else {
        tracing::warn!("RetentionManager: Retention of {} days reaches past the earliest time, skipping", days);
        return;
    };

    match store.delete_events_before(cutoff) {
        Ok(removed) if removed.hits > 0 || removed.failures > 0 => {
            tracing::info!(
                "RetentionManager: Removed {} hits and {} failures older than {}",
                removed.hits,
                removed.failures,
                cutoff
            );
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!("RetentionManager: Failed to delete old events: {}", e);
        }
    }
}
