//! Settings snapshot over the store's key/value table.
//!
//! Every knob has a default; a missing or unparsable row falls back to it
//! so a half-configured deployment keeps running. Updates written through
//! the control API are observed on the next loop iteration.

use chrono::Duration;
use tracing::warn;

use factlane_store::{
    SqliteQueueStore, Stage, SETTING_MAX_RETRIES, SETTING_POLL_INTERVAL_PREFIX,
    SETTING_RETRY_TIMEOUT, SETTING_STUCK_THRESHOLD,
};

pub const DEFAULT_RETRY_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_STUCK_THRESHOLD_MINUTES: u64 = 30;

pub fn default_poll_interval_seconds(stage: Stage) -> u64 {
    match stage {
        Stage::Triage => 5,
        Stage::Research => 15,
        Stage::Response => 10,
        Stage::Editorial => 5,
        Stage::PostQueue => 5,
        _ => 10,
    }
}

#[derive(Clone)]
pub struct QueueSettings {
    store: SqliteQueueStore,
}

impl QueueSettings {
    pub fn new(store: SqliteQueueStore) -> Self {
        Self { store }
    }

    /// Backoff observed between retry attempts of one item.
    pub fn retry_timeout(&self) -> Duration {
        Duration::seconds(self.read_u64(SETTING_RETRY_TIMEOUT, DEFAULT_RETRY_TIMEOUT_SECONDS) as i64)
    }

    /// Attempts before an item is failed and logged to fallback.
    pub fn max_retry_attempts(&self) -> u32 {
        self.read_u64(SETTING_MAX_RETRIES, DEFAULT_MAX_RETRY_ATTEMPTS as u64) as u32
    }

    /// Age of an assignment beyond which the worker is assumed crashed.
    pub fn stuck_threshold(&self) -> Duration {
        Duration::minutes(
            self.read_u64(SETTING_STUCK_THRESHOLD, DEFAULT_STUCK_THRESHOLD_MINUTES) as i64,
        )
    }

    /// Loop cadence of one stage worker.
    pub fn poll_interval(&self, stage: Stage) -> std::time::Duration {
        let key = format!("{}{}", SETTING_POLL_INTERVAL_PREFIX, stage.as_str());
        std::time::Duration::from_secs(self.read_u64(&key, default_poll_interval_seconds(stage)))
    }

    fn read_u64(&self, key: &str, default: u64) -> u64 {
        match self.store.get_setting(key) {
            Ok(Some(raw)) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(key, raw = %raw, "setting value is not a number, using default");
                default
            }),
            Ok(None) => default,
            Err(err) => {
                warn!(key, error = %err, "setting read failed, using default");
                default
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn open_store(name: &str) -> SqliteQueueStore {
        let path = std::env::temp_dir().join(format!(
            "factlane-settings-{}-{}.db",
            name,
            uuid::Uuid::new_v4()
        ));
        SqliteQueueStore::open(path.to_str().expect("utf8")).expect("open")
    }

    #[test]
    fn defaults_apply_when_unset() {
        let settings = QueueSettings::new(open_store("defaults"));
        assert_eq!(settings.retry_timeout(), Duration::seconds(300));
        assert_eq!(settings.max_retry_attempts(), 3);
        assert_eq!(settings.stuck_threshold(), Duration::minutes(30));
        assert_eq!(
            settings.poll_interval(Stage::Research),
            std::time::Duration::from_secs(15)
        );
        assert_eq!(
            settings.poll_interval(Stage::Editorial),
            std::time::Duration::from_secs(5)
        );
    }

    #[test]
    fn stored_values_override_defaults_on_next_read() {
        let store = open_store("overrides");
        let settings = QueueSettings::new(store.clone());
        store
            .upsert_setting(SETTING_MAX_RETRIES, "7", Utc::now())
            .expect("write setting");
        store
            .upsert_setting("poll_interval_seconds.triage", "1", Utc::now())
            .expect("write setting");
        assert_eq!(settings.max_retry_attempts(), 7);
        assert_eq!(
            settings.poll_interval(Stage::Triage),
            std::time::Duration::from_secs(1)
        );
    }
}
