//! SQLite-backed queue store.
//!
//! A single connection behind a mutex serializes all writes, so the
//! claim query and the artifact-plus-transition write are each one
//! atomic unit of work against every other store user in the process.
//! Across processes SQLite's file locking provides the same exclusion.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::error::StoreError;
use crate::item::{
    Directive, EndpointBinding, FallbackReason, FallbackRecord, FallbackStatus, Item, ItemStatus,
    NewItem, ProviderKind, Stage, StageArtifact, StageStatusStat, WORKABLE_STAGES,
};

const SCHEMA_VERSION: i64 = 3;

/// Queue settings recognized by the orchestrator. Everything else is
/// rejected at write time so typos never silently tune nothing.
pub const SETTING_RETRY_TIMEOUT: &str = "retry_timeout_seconds";
pub const SETTING_MAX_RETRIES: &str = "max_retry_attempts";
pub const SETTING_STUCK_THRESHOLD: &str = "stuck_post_threshold_minutes";
pub const SETTING_POLL_INTERVAL_PREFIX: &str = "poll_interval_seconds.";

pub fn is_recognized_setting(key: &str) -> bool {
    matches!(
        key,
        SETTING_RETRY_TIMEOUT | SETTING_MAX_RETRIES | SETTING_STUCK_THRESHOLD
    ) || key
        .strip_prefix(SETTING_POLL_INTERVAL_PREFIX)
        .map(|stage| WORKABLE_STAGES.iter().any(|s| s.as_str() == stage))
        .unwrap_or(false)
}

/// Durable store shared by workers, the recovery task and the control API.
#[derive(Clone)]
pub struct SqliteQueueStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQueueStore {
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)
            .map_err(|e| StoreError::Driver(format!("open queue store: {}", e)))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Driver("queue store lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        ensure_migration_table(&conn)?;
        let current = current_schema_version(&conn)?;
        if current > SCHEMA_VERSION {
            return Err(StoreError::Driver(format!(
                "queue schema version {} is newer than supported {}",
                current, SCHEMA_VERSION
            )));
        }
        if current < 1 {
            apply_migration_v1(&conn)?;
            record_migration(&conn, 1, "baseline_queue_tables")?;
        }
        if current < 2 {
            apply_migration_v2(&conn)?;
            record_migration(&conn, 2, "fallback_event_resolution")?;
        }
        if current < 3 {
            apply_migration_v3(&conn)?;
            record_migration(&conn, 3, "item_retry_bookkeeping")?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    /// Ingestion write contract: insert a new submission at
    /// `(triage, pending, retry_count = 0)`. A duplicate `source_id` is a
    /// silent no-op and returns `None`.
    pub fn insert_item(&self, item: &NewItem, now: DateTime<Utc>) -> Result<Option<i64>, StoreError> {
        let metadata = serde_json::to_string(&item.metadata)
            .map_err(|e| StoreError::Driver(format!("encode item metadata: {}", e)))?;
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO items
                   (source_id, title, author, body, url, created_utc_ms,
                    stage, status, retry_count, metadata, inserted_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'triage', 'pending', 0, ?7, ?8)",
                params![
                    item.source_id,
                    item.title,
                    item.author,
                    item.body,
                    item.url,
                    dt_to_ms(item.created_utc),
                    metadata,
                    dt_to_ms(now)
                ],
            )
            .map_err(|e| StoreError::driver("insert item", e))?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    pub fn get_item(&self, item_id: i64) -> Result<Option<Item>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM items WHERE id = ?1", ITEM_COLUMNS),
            params![item_id],
            map_row_to_item,
        )
        .optional()
        .map_err(|e| StoreError::driver("get item", e))
    }

    /// Atomically claim up to `limit` items for `worker_id`.
    ///
    /// Eligible rows are `pending` items outside their retry-backoff window
    /// plus `processing` rows whose assignment went stale before
    /// `stale_cutoff` (the unified claim-and-reclaim path). Rows come back
    /// ordered by `metadata.priority DESC, created_utc ASC` and are already
    /// stamped `processing`/`assigned_to`/`assigned_at`.
    pub fn claim_pending(
        &self,
        stage: Stage,
        limit: usize,
        now: DateTime<Utc>,
        stale_cutoff: DateTime<Utc>,
        backoff_cutoff: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<Vec<Item>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::driver("begin claim tx", e))?;

        let candidate_ids: Vec<i64> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM items
                     WHERE stage = ?1
                       AND (
                            (status = 'pending'
                               AND (last_retry_at_ms IS NULL OR last_retry_at_ms <= ?2))
                         OR (status = 'processing'
                               AND assigned_at_ms IS NOT NULL
                               AND assigned_at_ms < ?3)
                       )
                     ORDER BY CAST(COALESCE(json_extract(metadata, '$.priority'), 5) AS INTEGER) DESC,
                              created_utc_ms ASC
                     LIMIT ?4",
                )
                .map_err(|e| StoreError::driver("prepare claim query", e))?;
            let rows = stmt
                .query_map(
                    params![
                        stage.as_str(),
                        dt_to_ms(backoff_cutoff),
                        dt_to_ms(stale_cutoff),
                        limit as i64
                    ],
                    |row| row.get::<_, i64>(0),
                )
                .map_err(|e| StoreError::driver("query claim candidates", e))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row.map_err(|e| StoreError::driver("scan claim candidate", e))?);
            }
            ids
        };

        let mut claimed = Vec::with_capacity(candidate_ids.len());
        for id in &candidate_ids {
            tx.execute(
                "UPDATE items
                 SET status = 'processing', assigned_to = ?2, assigned_at_ms = ?3
                 WHERE id = ?1",
                params![id, worker_id, dt_to_ms(now)],
            )
            .map_err(|e| StoreError::driver("stamp claim", e))?;
            let item = tx
                .query_row(
                    &format!("SELECT {} FROM items WHERE id = ?1", ITEM_COLUMNS),
                    params![id],
                    map_row_to_item,
                )
                .map_err(|e| StoreError::driver("read claimed item", e))?;
            claimed.push(item);
        }

        tx.commit()
            .map_err(|e| StoreError::driver("commit claim tx", e))?;
        Ok(claimed)
    }

    /// Append a stage artifact and apply the transition directive in one
    /// transaction. There is no observable state where the artifact exists
    /// but the item does not yet reflect the directive.
    pub fn write_artifact_and_transition(
        &self,
        item_id: i64,
        stage: Stage,
        payload: &Value,
        directive: &Directive,
        now: DateTime<Utc>,
    ) -> Result<StageArtifact, StoreError> {
        if let Directive::Advance { next } = directive {
            if matches!(next, Stage::Triage | Stage::Completed | Stage::Rejected) {
                return Err(StoreError::InvalidDirective(format!(
                    "cannot advance to `{}`",
                    next
                )));
            }
        }

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::driver("begin artifact tx", e))?;

        let current_stage: Option<String> = tx
            .query_row(
                "SELECT stage FROM items WHERE id = ?1",
                params![item_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::driver("read item stage", e))?;
        let Some(current_stage) = current_stage else {
            return Err(StoreError::NotFound(item_id));
        };
        let current_stage = Stage::parse(&current_stage)?;
        if current_stage.is_terminal() {
            return Err(StoreError::Terminal(item_id, current_stage));
        }

        let encoded = serde_json::to_string(payload)
            .map_err(|e| StoreError::Driver(format!("encode artifact payload: {}", e)))?;
        tx.execute(
            "INSERT INTO artifacts (item_id, stage, payload, created_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![item_id, stage.as_str(), encoded, dt_to_ms(now)],
        )
        .map_err(|e| StoreError::driver("append artifact", e))?;
        let artifact_id = tx.last_insert_rowid();

        match directive {
            Directive::Advance { next } => {
                tx.execute(
                    "UPDATE items
                     SET stage = ?2, status = 'pending',
                         assigned_to = NULL, assigned_at_ms = NULL,
                         processed_at_ms = ?3, retry_count = 0,
                         last_retry_at_ms = NULL, last_error = NULL
                     WHERE id = ?1",
                    params![item_id, next.as_str(), dt_to_ms(now)],
                )
                .map_err(|e| StoreError::driver("advance item", e))?;
            }
            Directive::Reject => {
                tx.execute(
                    "UPDATE items
                     SET stage = 'rejected', status = 'rejected',
                         assigned_to = NULL, assigned_at_ms = NULL,
                         processed_at_ms = ?2
                     WHERE id = ?1",
                    params![item_id, dt_to_ms(now)],
                )
                .map_err(|e| StoreError::driver("reject item", e))?;
            }
            Directive::Complete => {
                tx.execute(
                    "UPDATE items
                     SET stage = 'completed', status = 'completed',
                         assigned_to = NULL, assigned_at_ms = NULL,
                         processed_at_ms = ?2
                     WHERE id = ?1",
                    params![item_id, dt_to_ms(now)],
                )
                .map_err(|e| StoreError::driver("complete item", e))?;
            }
            Directive::Retry { reason } => {
                tx.execute(
                    "UPDATE items
                     SET status = 'pending',
                         assigned_to = NULL, assigned_at_ms = NULL,
                         processed_at_ms = ?2, retry_count = retry_count + 1,
                         last_retry_at_ms = ?2, last_error = ?3
                     WHERE id = ?1",
                    params![item_id, dt_to_ms(now), reason],
                )
                .map_err(|e| StoreError::driver("requeue item for retry", e))?;
            }
        }

        tx.commit()
            .map_err(|e| StoreError::driver("commit artifact tx", e))?;
        Ok(StageArtifact {
            artifact_id,
            item_id,
            stage,
            payload: payload.clone(),
            created_at: now,
        })
    }

    /// Requeue `processing` rows whose assignment is older than `threshold`,
    /// incrementing their retry count. Returns the affected items.
    pub fn recover_stuck(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<Vec<Item>, StoreError> {
        let cutoff = now - threshold;
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::driver("begin recovery tx", e))?;

        let stuck_ids: Vec<i64> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM items
                     WHERE status = 'processing'
                       AND assigned_at_ms IS NOT NULL
                       AND assigned_at_ms < ?1
                     ORDER BY assigned_at_ms ASC",
                )
                .map_err(|e| StoreError::driver("prepare stuck query", e))?;
            let rows = stmt
                .query_map(params![dt_to_ms(cutoff)], |row| row.get::<_, i64>(0))
                .map_err(|e| StoreError::driver("query stuck items", e))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row.map_err(|e| StoreError::driver("scan stuck item", e))?);
            }
            ids
        };

        let mut recovered = Vec::with_capacity(stuck_ids.len());
        for id in &stuck_ids {
            tx.execute(
                "UPDATE items
                 SET status = 'pending',
                     assigned_to = NULL, assigned_at_ms = NULL,
                     retry_count = retry_count + 1,
                     last_retry_at_ms = ?2
                 WHERE id = ?1",
                params![id, dt_to_ms(now)],
            )
            .map_err(|e| StoreError::driver("requeue stuck item", e))?;
            let item = tx
                .query_row(
                    &format!("SELECT {} FROM items WHERE id = ?1", ITEM_COLUMNS),
                    params![id],
                    map_row_to_item,
                )
                .map_err(|e| StoreError::driver("read recovered item", e))?;
            recovered.push(item);
        }

        tx.commit()
            .map_err(|e| StoreError::driver("commit recovery tx", e))?;
        Ok(recovered)
    }

    /// Read-only stuck report for the control API; mutates nothing.
    pub fn list_stuck(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
        limit: usize,
    ) -> Result<Vec<Item>, StoreError> {
        let cutoff = now - threshold;
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM items
                 WHERE status = 'processing'
                   AND assigned_at_ms IS NOT NULL
                   AND assigned_at_ms < ?1
                 ORDER BY assigned_at_ms ASC
                 LIMIT ?2",
                ITEM_COLUMNS
            ))
            .map_err(|e| StoreError::driver("prepare stuck report", e))?;
        let rows = stmt
            .query_map(params![dt_to_ms(cutoff), limit as i64], map_row_to_item)
            .map_err(|e| StoreError::driver("query stuck report", e))?;
        collect_items(rows)
    }

    /// Merge a new claim-ordering priority into the item's metadata.
    /// Handlers set this alongside an advance so later stages claim the
    /// item in the urgency order the earlier stage decided.
    pub fn update_priority(&self, item_id: i64, priority: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE items
                 SET metadata = json_set(metadata, '$.priority', ?2)
                 WHERE id = ?1",
                params![item_id, priority],
            )
            .map_err(|e| StoreError::driver("update item priority", e))?;
        if updated == 0 {
            return Err(StoreError::NotFound(item_id));
        }
        Ok(())
    }

    /// Transition an item to `failed` after retry exhaustion. The stage is
    /// left untouched so the operator can inspect and resubmit in place.
    pub fn mark_failed(
        &self,
        item_id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE items
                 SET status = 'failed',
                     assigned_to = NULL, assigned_at_ms = NULL,
                     processed_at_ms = ?2, last_error = ?3
                 WHERE id = ?1",
                params![item_id, dt_to_ms(now), reason],
            )
            .map_err(|e| StoreError::driver("mark item failed", e))?;
        if updated == 0 {
            return Err(StoreError::NotFound(item_id));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------

    /// Latest artifact payload for every stage feeding `up_to_stage`.
    pub fn read_prior_artifacts(
        &self,
        item_id: i64,
        up_to_stage: Stage,
    ) -> Result<BTreeMap<Stage, Value>, StoreError> {
        let conn = self.lock()?;
        let mut priors = BTreeMap::new();
        for stage in up_to_stage.prior_stages() {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM artifacts
                     WHERE item_id = ?1 AND stage = ?2
                     ORDER BY created_at_ms DESC, artifact_id DESC
                     LIMIT 1",
                    params![item_id, stage.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::driver("read prior artifact", e))?;
            if let Some(raw) = payload {
                let value = serde_json::from_str(&raw)
                    .map_err(|e| StoreError::Driver(format!("decode artifact payload: {}", e)))?;
                priors.insert(*stage, value);
            }
        }
        Ok(priors)
    }

    /// Full artifact history of an item, oldest first (newest last).
    pub fn item_history(&self, item_id: i64) -> Result<Vec<StageArtifact>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT artifact_id, item_id, stage, payload, created_at_ms
                 FROM artifacts
                 WHERE item_id = ?1
                 ORDER BY created_at_ms ASC, artifact_id ASC",
            )
            .map_err(|e| StoreError::driver("prepare item history", e))?;
        let rows = stmt
            .query_map(params![item_id], map_row_to_artifact)
            .map_err(|e| StoreError::driver("query item history", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| StoreError::driver("scan item history", e))?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Observability queries
    // ------------------------------------------------------------------

    pub fn count_by_stage_and_status(&self) -> Result<Vec<StageStatusStat>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT stage, status, COUNT(*), AVG(retry_count), MIN(created_utc_ms)
                 FROM items
                 GROUP BY stage, status
                 ORDER BY stage, status",
            )
            .map_err(|e| StoreError::driver("prepare queue stats", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            })
            .map_err(|e| StoreError::driver("query queue stats", e))?;
        let mut out = Vec::new();
        for row in rows {
            let (stage, status, count, avg_retry, oldest) =
                row.map_err(|e| StoreError::driver("scan queue stats", e))?;
            out.push(StageStatusStat {
                stage: Stage::parse(&stage)?,
                status: ItemStatus::parse(&status)?,
                count: count.max(0) as u64,
                avg_retry_count: avg_retry,
                oldest: oldest.map(ms_to_dt),
            });
        }
        Ok(out)
    }

    pub fn list_pending(&self, stage: Stage, limit: usize) -> Result<Vec<Item>, StoreError> {
        self.list_by_stage_status(stage, ItemStatus::Pending, limit)
    }

    pub fn list_by_stage_status(
        &self,
        stage: Stage,
        status: ItemStatus,
        limit: usize,
    ) -> Result<Vec<Item>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM items
                 WHERE stage = ?1 AND status = ?2
                 ORDER BY CAST(COALESCE(json_extract(metadata, '$.priority'), 5) AS INTEGER) DESC,
                          created_utc_ms ASC
                 LIMIT ?3",
                ITEM_COLUMNS
            ))
            .map_err(|e| StoreError::driver("prepare stage listing", e))?;
        let rows = stmt
            .query_map(
                params![stage.as_str(), status.as_str(), limit as i64],
                map_row_to_item,
            )
            .map_err(|e| StoreError::driver("query stage listing", e))?;
        collect_items(rows)
    }

    pub fn list_rejected(&self, limit: usize) -> Result<Vec<Item>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM items
                 WHERE status = 'rejected'
                 ORDER BY processed_at_ms DESC
                 LIMIT ?1",
                ITEM_COLUMNS
            ))
            .map_err(|e| StoreError::driver("prepare rejected listing", e))?;
        let rows = stmt
            .query_map(params![limit as i64], map_row_to_item)
            .map_err(|e| StoreError::driver("query rejected listing", e))?;
        collect_items(rows)
    }

    // ------------------------------------------------------------------
    // Fallback log
    // ------------------------------------------------------------------

    pub fn append_fallback(
        &self,
        item_id: i64,
        stage: Stage,
        reason: FallbackReason,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO fallback_events (item_id, stage, reason, detail, status, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
            params![item_id, stage.as_str(), reason.as_str(), detail, dt_to_ms(now)],
        )
        .map_err(|e| StoreError::driver("append fallback event", e))?;
        Ok(())
    }

    pub fn list_fallback(&self, limit: usize) -> Result<Vec<FallbackRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT event_id, item_id, stage, reason, detail, status, created_at_ms, resolved_at_ms
                 FROM fallback_events
                 ORDER BY created_at_ms DESC
                 LIMIT ?1",
            )
            .map_err(|e| StoreError::driver("prepare fallback listing", e))?;
        let rows = stmt
            .query_map(params![limit as i64], map_row_to_fallback)
            .map_err(|e| StoreError::driver("query fallback listing", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| StoreError::driver("scan fallback listing", e))?);
        }
        Ok(out)
    }

    /// Operator resubmission: put a failed item back to `pending` at its
    /// current stage with a fresh retry budget, and mark its active
    /// fallback events resolved.
    pub fn resubmit_fallback(&self, item_id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::driver("begin resubmit tx", e))?;
        let updated = tx
            .execute(
                "UPDATE items
                 SET status = 'pending',
                     assigned_to = NULL, assigned_at_ms = NULL,
                     retry_count = 0, last_retry_at_ms = NULL, last_error = NULL
                 WHERE id = ?1 AND status != 'rejected'",
                params![item_id],
            )
            .map_err(|e| StoreError::driver("resubmit item", e))?;
        if updated == 0 {
            return Err(StoreError::NotFound(item_id));
        }
        tx.execute(
            "UPDATE fallback_events
             SET status = 'resolved', resolved_at_ms = ?2
             WHERE item_id = ?1 AND status = 'active'",
            params![item_id, dt_to_ms(now)],
        )
        .map_err(|e| StoreError::driver("resolve fallback events", e))?;
        tx.commit()
            .map_err(|e| StoreError::driver("commit resubmit tx", e))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Endpoint bindings
    // ------------------------------------------------------------------

    pub fn upsert_endpoint(
        &self,
        binding: &EndpointBinding,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO endpoints
               (stage, provider, base_url, model, max_concurrent, timeout_seconds, auth_env_key, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(stage) DO UPDATE SET
               provider = excluded.provider,
               base_url = excluded.base_url,
               model = excluded.model,
               max_concurrent = excluded.max_concurrent,
               timeout_seconds = excluded.timeout_seconds,
               auth_env_key = excluded.auth_env_key,
               updated_at_ms = excluded.updated_at_ms",
            params![
                binding.stage.as_str(),
                binding.provider.as_str(),
                binding.base_url,
                binding.model,
                binding.max_concurrent as i64,
                binding.timeout_seconds as i64,
                binding.auth_env_key,
                dt_to_ms(now)
            ],
        )
        .map_err(|e| StoreError::driver("upsert endpoint", e))?;
        Ok(())
    }

    pub fn get_endpoint(&self, stage: Stage) -> Result<Option<EndpointBinding>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT stage, provider, base_url, model, max_concurrent, timeout_seconds, auth_env_key
             FROM endpoints WHERE stage = ?1",
            params![stage.as_str()],
            map_row_to_endpoint,
        )
        .optional()
        .map_err(|e| StoreError::driver("get endpoint", e))
    }

    pub fn list_endpoints(&self) -> Result<Vec<EndpointBinding>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT stage, provider, base_url, model, max_concurrent, timeout_seconds, auth_env_key
                 FROM endpoints ORDER BY stage",
            )
            .map_err(|e| StoreError::driver("prepare endpoint listing", e))?;
        let rows = stmt
            .query_map([], map_row_to_endpoint)
            .map_err(|e| StoreError::driver("query endpoint listing", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| StoreError::driver("scan endpoint listing", e))?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Settings and pause flags
    // ------------------------------------------------------------------

    pub fn upsert_setting(
        &self,
        key: &str,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if !is_recognized_setting(key) {
            return Err(StoreError::UnknownSetting(key.to_string()));
        }
        if value.trim().parse::<u64>().is_err() {
            return Err(StoreError::InvalidSettingValue {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (setting_key, setting_value, updated_at_ms)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(setting_key) DO UPDATE SET
               setting_value = excluded.setting_value,
               updated_at_ms = excluded.updated_at_ms",
            params![key, value.trim(), dt_to_ms(now)],
        )
        .map_err(|e| StoreError::driver("upsert setting", e))?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT setting_value FROM settings WHERE setting_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StoreError::driver("get setting", e))
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT setting_key, setting_value FROM settings ORDER BY setting_key")
            .map_err(|e| StoreError::driver("prepare settings listing", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| StoreError::driver("query settings listing", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| StoreError::driver("scan settings listing", e))?);
        }
        Ok(out)
    }

    pub fn set_pause(&self, stage: Stage, paused: bool, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO stage_state (stage, is_paused, updated_at_ms)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(stage) DO UPDATE SET
               is_paused = excluded.is_paused,
               updated_at_ms = excluded.updated_at_ms",
            params![stage.as_str(), paused as i64, dt_to_ms(now)],
        )
        .map_err(|e| StoreError::driver("set pause flag", e))?;
        Ok(())
    }

    pub fn get_pause(&self, stage: Stage) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let paused: Option<i64> = conn
            .query_row(
                "SELECT is_paused FROM stage_state WHERE stage = ?1",
                params![stage.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::driver("get pause flag", e))?;
        Ok(paused.unwrap_or(0) != 0)
    }
}

const ITEM_COLUMNS: &str = "id, source_id, title, author, body, url, created_utc_ms, stage, status, \
                            assigned_to, assigned_at_ms, processed_at_ms, retry_count, last_error, \
                            last_retry_at_ms, metadata, inserted_at_ms";

fn map_row_to_item(row: &Row<'_>) -> rusqlite::Result<Item> {
    let stage: String = row.get(7)?;
    let status: String = row.get(8)?;
    let metadata: String = row.get(15)?;
    Ok(Item {
        id: row.get(0)?,
        source_id: row.get(1)?,
        title: row.get(2)?,
        author: row.get(3)?,
        body: row.get(4)?,
        url: row.get(5)?,
        created_utc: ms_to_dt(row.get(6)?),
        stage: Stage::parse(&stage).map_err(into_rusqlite_err)?,
        status: ItemStatus::parse(&status).map_err(into_rusqlite_err)?,
        assigned_to: row.get(9)?,
        assigned_at: row.get::<_, Option<i64>>(10)?.map(ms_to_dt),
        processed_at: row.get::<_, Option<i64>>(11)?.map(ms_to_dt),
        retry_count: row.get::<_, i64>(12)?.max(0) as u32,
        last_error: row.get(13)?,
        last_retry_at: row.get::<_, Option<i64>>(14)?.map(ms_to_dt),
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| into_rusqlite_err(StoreError::Driver(format!("item metadata: {}", e))))?,
        inserted_at: ms_to_dt(row.get(16)?),
    })
}

fn map_row_to_artifact(row: &Row<'_>) -> rusqlite::Result<StageArtifact> {
    let stage: String = row.get(2)?;
    let payload: String = row.get(3)?;
    Ok(StageArtifact {
        artifact_id: row.get(0)?,
        item_id: row.get(1)?,
        stage: Stage::parse(&stage).map_err(into_rusqlite_err)?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| into_rusqlite_err(StoreError::Driver(format!("artifact payload: {}", e))))?,
        created_at: ms_to_dt(row.get(4)?),
    })
}

fn map_row_to_endpoint(row: &Row<'_>) -> rusqlite::Result<EndpointBinding> {
    let stage: String = row.get(0)?;
    let provider: String = row.get(1)?;
    Ok(EndpointBinding {
        stage: Stage::parse(&stage).map_err(into_rusqlite_err)?,
        provider: ProviderKind::parse(&provider).map_err(into_rusqlite_err)?,
        base_url: row.get(2)?,
        model: row.get(3)?,
        max_concurrent: row.get::<_, i64>(4)?.max(0) as usize,
        timeout_seconds: row.get::<_, i64>(5)?.max(0) as u64,
        auth_env_key: row.get(6)?,
    })
}

fn map_row_to_fallback(row: &Row<'_>) -> rusqlite::Result<FallbackRecord> {
    let stage: String = row.get(2)?;
    let reason: String = row.get(3)?;
    let status: String = row.get(5)?;
    Ok(FallbackRecord {
        event_id: row.get(0)?,
        item_id: row.get(1)?,
        stage: Stage::parse(&stage).map_err(into_rusqlite_err)?,
        reason: FallbackReason::parse(&reason).unwrap_or(FallbackReason::HandlerError),
        detail: row.get(4)?,
        status: if status == "resolved" {
            FallbackStatus::Resolved
        } else {
            FallbackStatus::Active
        },
        created_at: ms_to_dt(row.get(6)?),
        resolved_at: row.get::<_, Option<i64>>(7)?.map(ms_to_dt),
    })
}

fn collect_items(
    rows: rusqlite::MappedRows<'_, impl FnMut(&Row<'_>) -> rusqlite::Result<Item>>,
) -> Result<Vec<Item>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| StoreError::driver("scan item row", e))?);
    }
    Ok(out)
}

fn into_rusqlite_err(err: StoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn ensure_migration_table(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          applied_at_ms INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| StoreError::Driver(format!("init migration table: {}", e)))?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64, StoreError> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |r| r.get(0),
    )
    .map_err(|e| StoreError::Driver(format!("read schema version: {}", e)))
}

fn record_migration(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, name, applied_at_ms) VALUES (?1, ?2, ?3)",
        params![version, name, dt_to_ms(Utc::now())],
    )
    .map_err(|e| StoreError::Driver(format!("record migration: {}", e)))?;
    Ok(())
}

fn apply_migration_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS items (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          source_id TEXT NOT NULL UNIQUE,
          title TEXT NOT NULL,
          author TEXT NOT NULL,
          body TEXT NOT NULL,
          url TEXT NULL,
          created_utc_ms INTEGER NOT NULL,
          stage TEXT NOT NULL,
          status TEXT NOT NULL,
          assigned_to TEXT NULL,
          assigned_at_ms INTEGER NULL,
          processed_at_ms INTEGER NULL,
          retry_count INTEGER NOT NULL DEFAULT 0,
          metadata TEXT NOT NULL DEFAULT '{}',
          inserted_at_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS artifacts (
          artifact_id INTEGER PRIMARY KEY AUTOINCREMENT,
          item_id INTEGER NOT NULL,
          stage TEXT NOT NULL,
          payload TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS endpoints (
          stage TEXT PRIMARY KEY,
          provider TEXT NOT NULL,
          base_url TEXT NOT NULL,
          model TEXT NOT NULL,
          max_concurrent INTEGER NOT NULL,
          timeout_seconds INTEGER NOT NULL,
          auth_env_key TEXT NULL,
          updated_at_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS settings (
          setting_key TEXT PRIMARY KEY,
          setting_value TEXT NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS stage_state (
          stage TEXT PRIMARY KEY,
          is_paused INTEGER NOT NULL DEFAULT 0,
          updated_at_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS fallback_events (
          event_id INTEGER PRIMARY KEY AUTOINCREMENT,
          item_id INTEGER NOT NULL,
          stage TEXT NOT NULL,
          reason TEXT NOT NULL,
          detail TEXT NULL,
          created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_items_stage_status_assigned
          ON items(stage, status, assigned_at_ms);
        CREATE INDEX IF NOT EXISTS idx_artifacts_item_stage_created
          ON artifacts(item_id, stage, created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_fallback_events_created
          ON fallback_events(created_at_ms DESC);
        "#,
    )
    .map_err(|e| StoreError::Driver(format!("apply migration v1: {}", e)))?;
    Ok(())
}

fn apply_migration_v2(conn: &Connection) -> Result<(), StoreError> {
    add_column_if_missing(
        conn,
        "fallback_events",
        "status",
        "TEXT NOT NULL DEFAULT 'active'",
    )?;
    add_column_if_missing(conn, "fallback_events", "resolved_at_ms", "INTEGER NULL")?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fallback_events_item_status
         ON fallback_events(item_id, status)",
        [],
    )
    .map_err(|e| StoreError::Driver(format!("apply migration v2: {}", e)))?;
    Ok(())
}

fn apply_migration_v3(conn: &Connection) -> Result<(), StoreError> {
    add_column_if_missing(conn, "items", "last_error", "TEXT NULL")?;
    add_column_if_missing(conn, "items", "last_retry_at_ms", "INTEGER NULL")?;
    Ok(())
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    column_def: &str,
) -> Result<(), StoreError> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn
        .prepare(&pragma)
        .map_err(|e| StoreError::Driver(format!("prepare table_info {}: {}", table, e)))?;
    let cols = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| StoreError::Driver(format!("query table_info {}: {}", table, e)))?;
    for col in cols {
        let name = col.map_err(|e| StoreError::driver("scan table_info", e))?;
        if name == column {
            return Ok(());
        }
    }
    let alter = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_def);
    conn.execute(&alter, [])
        .map_err(|e| StoreError::Driver(format!("alter table {} add {}: {}", table, column, e)))?;
    Ok(())
}
