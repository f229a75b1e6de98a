//! Stuck-work recovery.
//!
//! A worker that crashes or hangs leaves its claims in `processing`. The
//! recovery task periodically returns any assignment older than the stuck
//! threshold to `pending` with an incremented retry count; the unified
//! claim path then picks the item up like any other retry.

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use factlane_store::{Item, SqliteQueueStore};

use crate::settings::QueueSettings;

/// Cadence of the recovery sweep.
const RECOVERY_TICK_SECONDS: u64 = 5;

pub struct RecoveryManager {
    store: SqliteQueueStore,
    settings: QueueSettings,
    shutdown: watch::Receiver<bool>,
}

impl RecoveryManager {
    pub fn new(
        store: SqliteQueueStore,
        settings: QueueSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            settings,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("recovery manager started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match tick(&self.store, &self.settings) {
                Ok(recovered) if !recovered.is_empty() => {
                    info!(count = recovered.len(), "recovered stuck assignments");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "recovery tick failed"),
            }
            let interval = std::time::Duration::from_secs(RECOVERY_TICK_SECONDS);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("recovery manager stopped");
    }
}

/// One recovery sweep. Also used by the control API's reset-stuck
/// operation for immediate effect.
pub fn tick(
    store: &SqliteQueueStore,
    settings: &QueueSettings,
) -> Result<Vec<Item>, factlane_store::StoreError> {
    let recovered = store.recover_stuck(Utc::now(), settings.stuck_threshold())?;
    for item in &recovered {
        warn!(
            item_id = item.id,
            stage = %item.stage,
            retry_count = item.retry_count,
            "stuck assignment returned to pending"
        );
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use factlane_store::{ItemStatus, NewItem, Stage};
    use serde_json::json;

    fn open_store(name: &str) -> SqliteQueueStore {
        let path = std::env::temp_dir().join(format!(
            "factlane-recovery-{}-{}.db",
            name,
            uuid::Uuid::new_v4()
        ));
        SqliteQueueStore::open(path.to_str().expect("utf8")).expect("open")
    }

    #[test]
    fn tick_requeues_expired_assignments_only() {
        let store = open_store("tick");
        let settings = QueueSettings::new(store.clone());
        let now = Utc::now();
        store
            .insert_item(
                &NewItem {
                    source_id: "fresh".into(),
                    title: "t".into(),
                    author: "a".into(),
                    body: String::new(),
                    url: None,
                    created_utc: now,
                    metadata: json!({}),
                },
                now,
            )
            .expect("insert");
        store
            .insert_item(
                &NewItem {
                    source_id: "stale".into(),
                    title: "t".into(),
                    author: "a".into(),
                    body: String::new(),
                    url: None,
                    created_utc: now,
                    metadata: json!({}),
                },
                now,
            )
            .expect("insert");

        // One recent claim, one that predates the stuck threshold.
        store
            .claim_pending(Stage::Triage, 1, now, now - Duration::minutes(30), now, "w-live")
            .expect("claim fresh");
        let crashed_at = now - Duration::minutes(31);
        store
            .claim_pending(
                Stage::Triage,
                1,
                crashed_at,
                crashed_at - Duration::minutes(30),
                crashed_at,
                "w-crashed",
            )
            .expect("claim stale");

        let recovered = tick(&store, &settings).expect("tick");
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].source_id, "stale");
        assert_eq!(recovered[0].status, ItemStatus::Pending);
        assert_eq!(recovered[0].retry_count, 1);
    }
}
