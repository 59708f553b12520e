// src/storage/database.rs
//! SQLite storage engine
//!
//! Runs and their steps live in one database file opened in WAL mode with
//! `synchronous=NORMAL`, so readers and the writer do not block each other.
//! Every thread gets its own connection; connections are never shared.
//!
//! Step batches are written with one multi-row statement per chunk. Indexed
//! columns are projected with `json_extract` out of the JSON text the
//! pipeline already produced, next to the processed blob.

use crate::processing::{EncodedEvent, ProcessingPipeline};
use crate::storage::models::{
    ExportedStep, ReadStore, RunExport, RunFilter, RunRecord, RunUpdate, StepFilter, StepRecord,
    StorageStats,
};
use crate::storage::schema;
use crate::utils::config::TraceConfig;
use crate::utils::errors::{EngineError, Result};
use crate::utils::time::{days_ago_ms, now_ms};
use once_cell::sync::OnceCell;
use rusqlite::{params, params_from_iter, Connection, DatabaseName, OptionalExtension, ToSql};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Rows per multi-row INSERT (two bound parameters each)
const MAX_ROWS_PER_STATEMENT: usize = 400;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

static NEXT_DATABASE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Open connections of this thread, keyed by database instance
    static CONNECTIONS: RefCell<HashMap<u64, Connection>> = RefCell::new(HashMap::new());
}

/// SQLite store of runs and steps
pub struct Database {
    id: u64,
    path: PathBuf,
    retention_days: i64,
    initialized: OnceCell<()>,
}

impl Database {
    /// Create a handle; nothing is opened until [`initialize`](Self::initialize)
    pub fn new(config: &TraceConfig) -> Self {
        Self {
            id: NEXT_DATABASE_ID.fetch_add(1, Ordering::Relaxed),
            path: config.db_path.clone(),
            retention_days: config.retention_days,
            initialized: OnceCell::new(),
        }
    }

    /// Create and initialize in one step
    pub fn open(config: &TraceConfig) -> Result<Self> {
        let db = Self::new(config);
        db.initialize()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the schema and apply migrations. Idempotent.
    pub fn initialize(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| {
                if let Some(parent) = self.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            EngineError::StorageFailed(format!(
                                "Failed to create directory {:?}: {}",
                                parent, e
                            ))
                        })?;
                    }
                }

                self.with_conn_unchecked(schema::migrate)?;
                info!("Database initialized at {:?}", self.path);
                Ok::<(), EngineError>(())
            })
            .map(|_| ())
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(|e| {
            EngineError::StorageFailed(format!("Failed to open database {:?}: {}", self.path, e))
        })?;

        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;

        debug!(
            "Opened database connection for thread {:?}",
            std::thread::current().name().unwrap_or("unnamed")
        );
        Ok(conn)
    }

    /// Run `f` on this thread's connection
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if self.initialized.get().is_none() {
            return Err(EngineError::NotInitialized(format!(
                "Database {:?} used before initialize()",
                self.path
            )));
        }
        self.with_conn_unchecked(f)
    }

    fn with_conn_unchecked<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        // Taken out of the map while in use, so nested calls open their own
        let cached = CONNECTIONS.with(|conns| conns.borrow_mut().remove(&self.id));
        let conn = match cached {
            Some(conn) => conn,
            None => self.open_connection()?,
        };

        let result = f(&conn);

        CONNECTIONS.with(|conns| {
            conns.borrow_mut().entry(self.id).or_insert(conn);
        });
        result
    }

    /// Close the calling thread's connection
    pub fn close(&self) {
        let conn = CONNECTIONS.with(|conns| conns.borrow_mut().remove(&self.id));
        if let Some(conn) = conn {
            if let Err((_, e)) = conn.close() {
                warn!("Failed to close database connection: {}", e);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Insert a run, or update it in place with metadata merged
    pub fn insert_run(&self, run: &RunRecord) -> Result<()> {
        let metadata = serde_json::to_string(&run.metadata)?;

        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO runs (
                    id, name, status, started_at, completed_at, duration_ms,
                    agent_type, user_id, session_id, metadata
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    status = excluded.status,
                    started_at = excluded.started_at,
                    completed_at = COALESCE(excluded.completed_at, runs.completed_at),
                    duration_ms = COALESCE(excluded.duration_ms, runs.duration_ms),
                    agent_type = COALESCE(excluded.agent_type, runs.agent_type),
                    user_id = COALESCE(excluded.user_id, runs.user_id),
                    session_id = COALESCE(excluded.session_id, runs.session_id),
                    metadata = json_patch(COALESCE(runs.metadata, '{}'), excluded.metadata)
                "#,
                params![
                    run.id,
                    run.name,
                    run.status.as_str(),
                    run.started_at,
                    run.completed_at,
                    run.duration_ms,
                    run.agent_type,
                    run.user_id,
                    run.session_id,
                    metadata,
                ],
            )?;
            debug!("Inserted run {}", run.id);
            Ok(())
        })
    }

    /// Apply a partial update; returns whether the run exists
    pub fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<bool> {
        let metadata = update
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.with_conn(|conn| {
            let changed = conn.execute(
                r#"
                UPDATE runs SET
                    status = COALESCE(?1, status),
                    completed_at = COALESCE(?2, completed_at),
                    duration_ms = COALESCE(?3, duration_ms),
                    metadata = CASE
                        WHEN ?4 IS NULL THEN metadata
                        ELSE json_patch(COALESCE(metadata, '{}'), ?4)
                    END
                WHERE id = ?5
                "#,
                params![
                    update.status.map(|s| s.as_str()),
                    update.completed_at,
                    update.duration_ms,
                    metadata,
                    run_id,
                ],
            )?;

            if changed == 0 {
                warn!("Run {} not found for update", run_id);
            }
            Ok(changed > 0)
        })
    }

    /// Insert a batch of encoded events; returns how many rows were stored.
    ///
    /// A chunk that fails as a whole (e.g. one orphaned step) is retried row
    /// by row so the rest of the batch still lands.
    pub fn insert_steps(&self, steps: &[EncodedEvent]) -> Result<usize> {
        if steps.is_empty() {
            return Ok(0);
        }

        let inserted = self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut inserted = 0;

            for chunk in steps.chunks(MAX_ROWS_PER_STATEMENT) {
                let sql = insert_steps_sql(chunk.len());
                let args = step_params(chunk);

                match tx.execute(&sql, args.as_slice()) {
                    Ok(_) => inserted += chunk.len(),
                    Err(e) => {
                        warn!(
                            "Batch insert of {} steps failed ({}), retrying row by row",
                            chunk.len(),
                            e
                        );
                        let single = insert_steps_sql(1);
                        for step in chunk {
                            let args = step_params(std::slice::from_ref(step));
                            match tx.execute(&single, args.as_slice()) {
                                Ok(_) => inserted += 1,
                                Err(e) => error!("Failed to insert step: {}", e),
                            }
                        }
                    }
                }
            }

            tx.commit()?;
            Ok(inserted)
        })?;

        metrics::counter!("agentlens_steps_inserted_total").increment(inserted as u64);
        debug!("Inserted {}/{} steps", inserted, steps.len());
        Ok(inserted)
    }

    /// Delete a run and all of its steps; returns whether the run existed
    pub fn delete_run(&self, run_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let (steps, runs) = delete_run_rows(conn, run_id)?;
            if runs > 0 {
                info!("Deleted run {} and {} steps", run_id, steps);
            } else {
                warn!("Run {} not found for deletion", run_id);
            }
            Ok(runs > 0)
        })
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        self.with_conn(|conn| {
            let run = conn
                .query_row(
                    "SELECT * FROM runs WHERE id = ?1",
                    [run_id],
                    RunRecord::from_row,
                )
                .optional()?;
            Ok(run)
        })
    }

    /// Filtered, ordered, paginated run listing
    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let mut sql = String::from("SELECT * FROM runs WHERE 1=1");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.as_str()));
        }
        if let Some(user_id) = &filter.user_id {
            sql.push_str(" AND user_id = ?");
            args.push(Box::new(user_id.clone()));
        }
        if let Some(session_id) = &filter.session_id {
            sql.push_str(" AND session_id = ?");
            args.push(Box::new(session_id.clone()));
        }
        if let Some(search) = &filter.search {
            sql.push_str(" AND name LIKE ? ESCAPE '\\'");
            args.push(Box::new(format!("%{}%", escape_like(search))));
        }
        if let Some(after) = filter.started_after {
            sql.push_str(" AND started_at >= ?");
            args.push(Box::new(after));
        }
        if let Some(before) = filter.started_before {
            sql.push_str(" AND started_at < ?");
            args.push(Box::new(before));
        }

        sql.push_str(&format!(
            " ORDER BY {} {} LIMIT ? OFFSET ?",
            filter.order_by.column(),
            if filter.descending { "DESC" } else { "ASC" }
        ));
        args.push(Box::new(filter.limit as i64));
        args.push(Box::new(filter.offset as i64));

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let runs = stmt
                .query_map(params_from_iter(args.iter()), RunRecord::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(runs)
        })
    }

    /// Steps of a run in timestamp order, payload included
    pub fn get_run_steps(&self, run_id: &str, filter: &StepFilter) -> Result<Vec<StepRecord>> {
        let mut sql = String::from("SELECT * FROM steps WHERE run_id = ?");
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(run_id.to_string())];

        if let Some(kind) = filter.event_type {
            sql.push_str(" AND type = ?");
            args.push(Box::new(kind.as_str()));
        }

        sql.push_str(" ORDER BY timestamp ASC, id ASC");

        match filter.limit {
            Some(limit) => {
                sql.push_str(" LIMIT ? OFFSET ?");
                args.push(Box::new(limit as i64));
                args.push(Box::new(filter.offset as i64));
            }
            None if filter.offset > 0 => {
                sql.push_str(" LIMIT -1 OFFSET ?");
                args.push(Box::new(filter.offset as i64));
            }
            None => {}
        }

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let steps = stmt
                .query_map(params_from_iter(args.iter()), |row| StepRecord::from_row(row, true))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(steps)
        })
    }

    /// Timeline of a run; the lean form skips payload blobs
    pub fn get_run_timeline(&self, run_id: &str, include_data: bool) -> Result<Vec<StepRecord>> {
        let sql = if include_data {
            "SELECT * FROM steps WHERE run_id = ?1 ORDER BY timestamp ASC, id ASC"
        } else {
            "SELECT id, run_id, timestamp, type, name, status, duration_ms, parent_event_id \
             FROM steps WHERE run_id = ?1 ORDER BY timestamp ASC, id ASC"
        };

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let steps = stmt
                .query_map([run_id], |row| StepRecord::from_row(row, include_data))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(steps)
        })
    }

    /// Raw processed payload of one step
    pub fn get_step_data(&self, step_id: &str) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            let data = conn
                .query_row("SELECT data FROM steps WHERE id = ?1", [step_id], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(data)
        })
    }

    pub fn get_stats(&self) -> Result<StorageStats> {
        let recent_cutoff = now_ms() - 86_400_000;

        self.with_conn(|conn| {
            let (total_runs, running_runs, completed_runs, failed_runs, recent_runs_24h) = conn
                .query_row(
                    r#"
                    SELECT
                        COUNT(*),
                        COALESCE(SUM(status = 'running'), 0),
                        COALESCE(SUM(status = 'completed'), 0),
                        COALESCE(SUM(status = 'failed'), 0),
                        COALESCE(SUM(started_at > ?1), 0)
                    FROM runs
                    "#,
                    [recent_cutoff],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )?;

            let total_steps: i64 =
                conn.query_row("SELECT COUNT(*) FROM steps", [], |row| row.get(0))?;

            let db_size_bytes: i64 = conn.query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )?;

            Ok(StorageStats {
                total_runs: total_runs as u64,
                running_runs: running_runs as u64,
                completed_runs: completed_runs as u64,
                failed_runs: failed_runs as u64,
                total_steps: total_steps as u64,
                db_size_bytes: db_size_bytes.max(0) as u64,
                recent_runs_24h: recent_runs_24h as u64,
            })
        })
    }

    /// A run and its timeline with payloads decoded through `pipeline`
    pub fn export_run(
        &self,
        run_id: &str,
        pipeline: &ProcessingPipeline,
    ) -> Result<Option<RunExport>> {
        let Some(run) = self.get_run(run_id)? else {
            return Ok(None);
        };

        let timeline = self
            .get_run_timeline(run_id, true)?
            .into_iter()
            .map(|mut step| {
                let (data, decode_error) = match step.data.take() {
                    Some(bytes) => match pipeline.decode(&bytes) {
                        Ok(map) => (Some(map), None),
                        Err(e) => {
                            warn!("Failed to decode step {}: {}", step.id, e);
                            (None, Some(e.to_string()))
                        }
                    },
                    None => (None, None),
                };
                ExportedStep {
                    step,
                    data,
                    decode_error,
                }
            })
            .collect();

        Ok(Some(RunExport { run, timeline }))
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    /// Delete runs started before now minus the retention period.
    /// `None` uses the configured retention; zero or less disables pruning.
    pub fn prune_old_runs(&self, retention_days: Option<i64>) -> Result<usize> {
        let retention_days = retention_days.unwrap_or(self.retention_days);
        if retention_days <= 0 {
            info!("Pruning disabled (retention_days <= 0)");
            return Ok(0);
        }

        let cutoff = days_ago_ms(retention_days)?;
        self.with_conn(|conn| {
            // Steps go with their runs via ON DELETE CASCADE
            let deleted = conn.execute("DELETE FROM runs WHERE started_at < ?1", [cutoff])?;
            if deleted == 0 {
                info!("No runs older than {} days to prune", retention_days);
            } else {
                info!("Pruned {} runs older than {} days", deleted, retention_days);
            }
            Ok(deleted)
        })
    }

    /// Delete the oldest runs until the live data fits in `max_bytes`,
    /// then reclaim the freed space. Returns the number of runs deleted.
    pub fn prune_by_size(&self, max_bytes: u64) -> Result<usize> {
        if max_bytes == 0 {
            return Ok(0);
        }

        let deleted = self.with_conn(|conn| {
            let mut deleted = 0;
            loop {
                let used = used_bytes(conn)?;
                if used <= max_bytes {
                    break;
                }

                let oldest: Option<String> = conn
                    .query_row(
                        "SELECT id FROM runs ORDER BY started_at ASC, id ASC LIMIT 1",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?;

                let Some(run_id) = oldest else {
                    warn!(
                        "Database still uses {} bytes with no runs left (budget {})",
                        used, max_bytes
                    );
                    break;
                };

                delete_run_rows(conn, &run_id)?;
                deleted += 1;
            }
            Ok(deleted)
        })?;

        if deleted > 0 {
            info!("Pruned {} runs to fit {} bytes", deleted, max_bytes);
            self.vacuum()?;
        }
        Ok(deleted)
    }

    /// Rebuild the file to reclaim free pages and truncate the WAL
    pub fn vacuum(&self) -> Result<()> {
        info!("Running VACUUM...");
        self.with_conn(|conn| {
            conn.execute_batch("VACUUM")?;
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            Ok(())
        })?;
        info!("VACUUM completed");
        Ok(())
    }

    /// Snapshot the live database into `dest` using the online backup API
    pub fn backup(&self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        info!("Creating backup to {:?}...", dest);
        self.with_conn(|conn| {
            conn.backup(DatabaseName::Main, dest, None).map_err(|e| {
                EngineError::StorageFailed(format!("Backup to {:?} failed: {}", dest, e))
            })
        })?;
        info!("Backup completed");
        Ok(())
    }
}

impl ReadStore for Database {
    fn get_stats(&self) -> Result<StorageStats> {
        Database::get_stats(self)
    }

    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        Database::list_runs(self, filter)
    }

    fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Database::get_run(self, run_id)
    }

    fn get_run_steps(&self, run_id: &str, filter: &StepFilter) -> Result<Vec<StepRecord>> {
        Database::get_run_steps(self, run_id, filter)
    }

    fn get_run_timeline(&self, run_id: &str, include_data: bool) -> Result<Vec<StepRecord>> {
        Database::get_run_timeline(self, run_id, include_data)
    }

    fn get_step_data(&self, step_id: &str) -> Result<Option<Vec<u8>>> {
        Database::get_step_data(self, step_id)
    }
}

/// Multi-row INSERT; row `i` binds its JSON as `?(2i+1)` and blob as `?(2i+2)`
fn insert_steps_sql(rows: usize) -> String {
    let mut sql = String::from(
        "INSERT OR REPLACE INTO steps \
         (id, run_id, timestamp, type, name, status, duration_ms, data, parent_event_id) VALUES ",
    );

    for i in 0..rows {
        let json = 2 * i + 1;
        let blob = json + 1;
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&format!(
            "(json_extract(?{j}, '$.event_id'), json_extract(?{j}, '$.run_id'), \
             json_extract(?{j}, '$.timestamp_ms'), json_extract(?{j}, '$.type'), \
             json_extract(?{j}, '$.name'), json_extract(?{j}, '$.status'), \
             json_extract(?{j}, '$.duration_ms'), ?{b}, json_extract(?{j}, '$.parent_event_id'))",
            j = json,
            b = blob
        ));
    }
    sql
}

fn step_params(steps: &[EncodedEvent]) -> Vec<&dyn ToSql> {
    let mut args: Vec<&dyn ToSql> = Vec::with_capacity(steps.len() * 2);
    for step in steps {
        args.push(&step.json);
        args.push(&step.blob);
    }
    args
}

fn delete_run_rows(conn: &Connection, run_id: &str) -> Result<(usize, usize)> {
    let tx = conn.unchecked_transaction()?;
    let steps = tx.execute("DELETE FROM steps WHERE run_id = ?1", [run_id])?;
    let runs = tx.execute("DELETE FROM runs WHERE id = ?1", [run_id])?;
    tx.commit()?;
    Ok((steps, runs))
}

/// Bytes held by pages that are in use
fn used_bytes(conn: &Connection) -> Result<u64> {
    let used: i64 = conn.query_row(
        "SELECT (page_count - freelist_count) * page_size \
         FROM pragma_page_count(), pragma_freelist_count(), pragma_page_size()",
        [],
        |row| row.get(0),
    )?;
    Ok(used.max(0) as u64)
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
