//! The local catalog: the authoritative record of what has been backed up
//!
//! Everything the engine persists lives in a single sqlite file: synced
//! photos, jobs and their errors, structured logs, destinations, verification
//! runs, and backup schedules. The connection sits behind a mutex so there is
//! exactly one writer per process; readers are welcome to clone the `Arc` and
//! call in from wherever. Remote listings are never written here; the
//! catalog is the source of truth and remote state is only ever compared
//! against it.

mod migrations;
mod types;
mod wrappers;

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::{source::DateRangeFilter, utils};

pub use self::types::{
    DestinationKind, DestinationRecord, DestinationStats, HealthStatus, JobStatus, LogEntry,
    LogLevel, LogStream, Schedule, ScheduledBackupJob, SyncErrorRecord, SyncJob, SyncedPhoto,
    VerificationJob, VerificationKind,
};
use self::wrappers::{Json, UuidText};

const SCHEMA: &str = include_str!("schema.sql");

/// Keep `in (...)` parameter lists comfortably below sqlite's variable limit
const BATCH_PARAMS: usize = 500;

const CATALOG_FILE: &str = "catalog.db3";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed opening the catalog at {path}: {source}")]
    Init {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("catalog query `{sql}` failed: {source}")]
    Query {
        sql: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("catalog schema migration to version {version} failed: {source}")]
    Schema {
        version: u32,
        #[source]
        source: rusqlite::Error,
    },
}

trait QueryContext<T> {
    fn for_query(self, sql: &'static str) -> Result<T, CatalogError>;
}

impl<T> QueryContext<T> for rusqlite::Result<T> {
    fn for_query(self, sql: &'static str) -> Result<T, CatalogError> {
        self.map_err(|source| CatalogError::Query { sql, source })
    }
}

pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let data_dir = utils::snapvault_data_dir()
            .ok_or_else(|| anyhow::anyhow!("Failed to locate data dir"))?;
        Ok(data_dir.join(CATALOG_FILE))
    }

    pub fn open_or_create(path: &Path) -> Result<Self, CatalogError> {
        let init_err = |source: anyhow::Error| CatalogError::Init {
            path: path.to_owned(),
            source,
        };

        if let Some(db_dir) = path.parent() {
            fs::create_dir_all(db_dir).map_err(|err| init_err(err.into()))?;
        }
        let mut conn = Connection::open(path).map_err(|err| init_err(err.into()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|err| init_err(err.into()))?;
        migrations::apply(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, CatalogError> {
        let mut conn = Connection::open_in_memory().map_err(|source| CatalogError::Init {
            path: PathBuf::from(":memory:"),
            source: source.into(),
        })?;
        conn.execute_batch(SCHEMA)
            .map_err(|source| CatalogError::Init {
                path: PathBuf::from(":memory:"),
                source: source.into(),
            })?;
        migrations::apply(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---- synced photos ----

    /// Looks up existing rows for `(local_id, destination)` pairs
    ///
    /// Only ids that have a row show up in the returned map. Inputs are
    /// chunked so the generated `in (...)` lists stay within sqlite's bound
    /// parameter limit.
    pub fn batch_get_synced(
        &self,
        local_ids: &[String],
        destination_id: Uuid,
    ) -> Result<HashMap<String, SyncedPhoto>, CatalogError> {
        let conn = self.conn.lock();
        let dest = destination_id.to_string();
        let mut found = HashMap::with_capacity(local_ids.len());

        for chunk in local_ids.chunks(BATCH_PARAMS) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "select id, local_id, destination_id, remote_path, checksum, sync_date, \
                 file_size, last_verified_date, file_metadata \
                 from synced_photos where destination_id = ? and local_id in ({placeholders})"
            );
            let mut stmt = conn.prepare_cached(&sql).for_query("batch get synced")?;

            let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(chunk.len() + 1);
            params.push(&dest);
            for local_id in chunk {
                params.push(local_id);
            }

            let rows = stmt
                .query_map(params.as_slice(), synced_from_row)
                .for_query("batch get synced")?;
            for row in rows {
                let photo = row.for_query("batch get synced")?;
                found.insert(photo.local_id.clone(), photo);
            }
        }

        Ok(found)
    }

    pub fn get_synced_for_destination(
        &self,
        destination_id: Uuid,
    ) -> Result<Vec<SyncedPhoto>, CatalogError> {
        const SQL: &str = "select id, local_id, destination_id, remote_path, checksum, \
             sync_date, file_size, last_verified_date, file_metadata \
             from synced_photos where destination_id = ?1 order by sync_date";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        let rows = stmt
            .query_map([destination_id.to_string()], synced_from_row)
            .for_query(SQL)?;
        rows.collect::<rusqlite::Result<_>>().for_query(SQL)
    }

    pub fn upsert_synced(&self, photo: &SyncedPhoto) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        upsert_synced_stmt(&conn, photo)
    }

    /// Atomic per batch: either every row lands or none do
    pub fn upsert_synced_batch(&self, photos: &[SyncedPhoto]) -> Result<(), CatalogError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().for_query("upsert synced batch")?;
        for photo in photos {
            upsert_synced_stmt(&tx, photo)?;
        }
        tx.commit().for_query("upsert synced batch")
    }

    pub fn delete_synced(&self, id: Uuid) -> Result<(), CatalogError> {
        const SQL: &str = "delete from synced_photos where id = ?1";

        let conn = self.conn.lock();
        conn.execute(SQL, [id.to_string()]).for_query(SQL)?;
        Ok(())
    }

    /// Idempotent: replaying the same ids and timestamp is a no-op
    pub fn update_last_verified_batch(
        &self,
        ids: &[Uuid],
        when: DateTime<Utc>,
    ) -> Result<(), CatalogError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().for_query("update last verified")?;
        for chunk in ids.chunks(BATCH_PARAMS) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "update synced_photos set last_verified_date = ? where id in ({placeholders})"
            );
            let mut stmt = tx.prepare_cached(&sql).for_query("update last verified")?;

            let texts: Vec<String> = chunk.iter().map(Uuid::to_string).collect();
            let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(chunk.len() + 1);
            params.push(&when);
            for id in &texts {
                params.push(id);
            }
            stmt.execute(params.as_slice())
                .for_query("update last verified")?;
        }
        tx.commit().for_query("update last verified")
    }

    pub fn stats(&self, destination_id: Uuid) -> Result<DestinationStats, CatalogError> {
        const SQL: &str = "select count(*), coalesce(sum(file_size), 0) \
             from synced_photos where destination_id = ?1";

        let conn = self.conn.lock();
        conn.query_row(SQL, [destination_id.to_string()], |row| {
            Ok(DestinationStats {
                photo_count: row.get(0)?,
                total_bytes: row.get(1)?,
            })
        })
        .for_query(SQL)
    }

    // ---- sync jobs ----

    pub fn create_job(&self, job: &SyncJob) -> Result<(), CatalogError> {
        const SQL: &str = "insert into sync_jobs (id, destination_id, status, start_time, end_time, \
             photos_scanned, photos_synced, photos_failed, bytes_transferred, average_speed) \
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        stmt.execute((
            UuidText(job.id),
            UuidText(job.destination_id),
            job.status.as_str(),
            job.start_time,
            job.end_time,
            job.photos_scanned,
            job.photos_synced,
            job.photos_failed,
            job.bytes_transferred,
            job.average_speed,
        ))
        .for_query(SQL)?;
        Ok(())
    }

    pub fn update_job(&self, job: &SyncJob) -> Result<(), CatalogError> {
        const SQL: &str = "update sync_jobs set status = ?2, end_time = ?3, photos_scanned = ?4, \
             photos_synced = ?5, photos_failed = ?6, bytes_transferred = ?7, \
             average_speed = ?8 where id = ?1";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        stmt.execute((
            UuidText(job.id),
            job.status.as_str(),
            job.end_time,
            job.photos_scanned,
            job.photos_synced,
            job.photos_failed,
            job.bytes_transferred,
            job.average_speed,
        ))
        .for_query(SQL)?;
        Ok(())
    }

    pub fn get_job(&self, id: Uuid) -> Result<Option<SyncJob>, CatalogError> {
        const SQL: &str = "select id, destination_id, status, start_time, end_time, photos_scanned, \
             photos_synced, photos_failed, bytes_transferred, average_speed \
             from sync_jobs where id = ?1";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        stmt.query_row([id.to_string()], job_from_row)
            .optional()
            .for_query(SQL)
    }

    pub fn recent_jobs(&self, limit: u32) -> Result<Vec<SyncJob>, CatalogError> {
        const SQL: &str = "select id, destination_id, status, start_time, end_time, photos_scanned, \
             photos_synced, photos_failed, bytes_transferred, average_speed \
             from sync_jobs order by start_time desc limit ?1";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        let rows = stmt.query_map([limit], job_from_row).for_query(SQL)?;
        rows.collect::<rusqlite::Result<_>>().for_query(SQL)
    }

    /// Startup recovery: any job a previous process left `running` or
    /// `paused` is rewritten to `failed` in one transaction
    pub fn cleanup_stale_jobs(&self) -> Result<usize, CatalogError> {
        const SQL: &str = "update sync_jobs set status = 'failed', end_time = ?1 \
             where status in ('running', 'paused')";

        let mut conn = self.conn.lock();
        let tx = conn.transaction().for_query(SQL)?;
        let stale = tx.execute(SQL, [Utc::now()]).for_query(SQL)?;
        tx.commit().for_query(SQL)?;
        Ok(stale)
    }

    pub fn record_sync_error(&self, error: &SyncErrorRecord) -> Result<(), CatalogError> {
        const SQL: &str = "insert into sync_errors (id, job_id, photo_id, error_message, \
             error_category, timestamp, retry_count) values (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        stmt.execute((
            UuidText(error.id),
            UuidText(error.job_id),
            &error.photo_id,
            &error.error_message,
            &error.error_category,
            error.timestamp,
            error.retry_count,
        ))
        .for_query(SQL)?;
        Ok(())
    }

    pub fn errors_for_job(&self, job_id: Uuid) -> Result<Vec<SyncErrorRecord>, CatalogError> {
        const SQL: &str = "select id, job_id, photo_id, error_message, error_category, timestamp, \
             retry_count from sync_errors where job_id = ?1 order by timestamp";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        let rows = stmt
            .query_map([job_id.to_string()], |row| {
                Ok(SyncErrorRecord {
                    id: row.get::<_, UuidText>(0)?.into(),
                    job_id: row.get::<_, UuidText>(1)?.into(),
                    photo_id: row.get(2)?,
                    error_message: row.get(3)?,
                    error_category: row.get(4)?,
                    timestamp: row.get(5)?,
                    retry_count: row.get(6)?,
                })
            })
            .for_query(SQL)?;
        rows.collect::<rusqlite::Result<_>>().for_query(SQL)
    }

    // ---- structured logs ----

    /// Batched append; the engines buffer and hand us up to ~50 entries at a
    /// time
    pub fn save_logs(&self, stream: LogStream, batch: &[LogEntry]) -> Result<(), CatalogError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().for_query("save logs")?;
        {
            let sql = format!(
                "insert into {} (id, job_id, timestamp, level, category, message, photo_ref, \
                 details) values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                stream.table()
            );
            let mut stmt = tx.prepare_cached(&sql).for_query("save logs")?;
            for entry in batch {
                stmt.execute((
                    UuidText(entry.id),
                    entry.job_id.map(UuidText),
                    entry.timestamp,
                    entry.level.as_str(),
                    &entry.category,
                    &entry.message,
                    &entry.photo_ref,
                    entry.details.clone().map(Json),
                ))
                .for_query("save logs")?;
            }
        }
        tx.commit().for_query("save logs")
    }

    pub fn recent_logs(
        &self,
        stream: LogStream,
        limit: u32,
    ) -> Result<Vec<LogEntry>, CatalogError> {
        let sql = format!(
            "select id, job_id, timestamp, level, category, message, photo_ref, details \
             from {} order by timestamp desc limit ?1",
            stream.table()
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql).for_query("recent logs")?;
        let rows = stmt.query_map([limit], log_from_row).for_query("recent logs")?;
        rows.collect::<rusqlite::Result<_>>().for_query("recent logs")
    }

    /// Maintenance: drops log entries older than `days` and finished jobs of
    /// the same age, cascading to their errors and logs
    pub fn purge_older_than(&self, days: u32) -> Result<usize, CatalogError> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));

        let mut conn = self.conn.lock();
        let tx = conn.transaction().for_query("purge older than")?;
        let mut purged = 0;

        for table in ["sync_logs", "verification_logs"] {
            let sql = format!("delete from {table} where timestamp < ?1");
            purged += tx.execute(&sql, [cutoff]).for_query("purge older than")?;
        }

        // Old finished jobs go too, taking their errors and remaining logs
        // with them. Running jobs are never aged out.
        purged += tx
            .execute(
                "delete from sync_errors where job_id in \
                 (select id from sync_jobs where end_time is not null and end_time < ?1)",
                [cutoff],
            )
            .for_query("purge older than")?;
        purged += tx
            .execute(
                "delete from sync_logs where job_id in \
                 (select id from sync_jobs where end_time is not null and end_time < ?1)",
                [cutoff],
            )
            .for_query("purge older than")?;
        purged += tx
            .execute(
                "delete from sync_jobs where end_time is not null and end_time < ?1",
                [cutoff],
            )
            .for_query("purge older than")?;

        tx.commit().for_query("purge older than")?;
        Ok(purged)
    }

    // ---- destinations ----

    pub fn upsert_destination(&self, dest: &DestinationRecord) -> Result<(), CatalogError> {
        const SQL: &str = "insert or replace into destinations (id, name, kind, config_blob, \
             created_at, last_health_check, health_status) values (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        stmt.execute((
            UuidText(dest.id),
            &dest.name,
            dest.kind.as_str(),
            &dest.config_blob,
            dest.created_at,
            dest.last_health_check,
            dest.health_status.as_str(),
        ))
        .for_query(SQL)?;
        Ok(())
    }

    pub fn get_destination(&self, id: Uuid) -> Result<Option<DestinationRecord>, CatalogError> {
        const SQL: &str = "select id, name, kind, config_blob, created_at, last_health_check, \
             health_status from destinations where id = ?1";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        stmt.query_row([id.to_string()], destination_from_row)
            .optional()
            .for_query(SQL)
    }

    pub fn find_destination(&self, name: &str) -> Result<Option<DestinationRecord>, CatalogError> {
        const SQL: &str = "select id, name, kind, config_blob, created_at, last_health_check, \
             health_status from destinations where name = ?1";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        stmt.query_row([name], destination_from_row)
            .optional()
            .for_query(SQL)
    }

    pub fn list_destinations(&self) -> Result<Vec<DestinationRecord>, CatalogError> {
        const SQL: &str = "select id, name, kind, config_blob, created_at, last_health_check, \
             health_status from destinations order by created_at";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        let rows = stmt.query_map((), destination_from_row).for_query(SQL)?;
        rows.collect::<rusqlite::Result<_>>().for_query(SQL)
    }

    /// Removes the destination plus everything recorded against it
    pub fn delete_destination(&self, id: Uuid) -> Result<(), CatalogError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().for_query("delete destination")?;
        let dest = id.to_string();
        tx.execute("delete from synced_photos where destination_id = ?1", [&dest])
            .for_query("delete destination")?;
        tx.execute("delete from schedules where destination_id = ?1", [&dest])
            .for_query("delete destination")?;
        tx.execute("delete from destinations where id = ?1", [&dest])
            .for_query("delete destination")?;
        tx.commit().for_query("delete destination")
    }

    pub fn record_health_check(
        &self,
        id: Uuid,
        status: HealthStatus,
        when: DateTime<Utc>,
    ) -> Result<(), CatalogError> {
        const SQL: &str = "update destinations set last_health_check = ?2, health_status = ?3 \
             where id = ?1";

        let conn = self.conn.lock();
        conn.execute(SQL, (id.to_string(), when, status.as_str()))
            .for_query(SQL)?;
        Ok(())
    }

    // ---- verification jobs ----

    pub fn create_verification_job(&self, job: &VerificationJob) -> Result<(), CatalogError> {
        const SQL: &str = "insert into verification_jobs (id, destination_id, kind, start_time, \
             end_time, total_photos, verified_count, mismatch_count, missing_count, error_count) \
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        stmt.execute((
            UuidText(job.id),
            UuidText(job.destination_id),
            job.kind.as_str(),
            job.start_time,
            job.end_time,
            job.total_photos,
            job.verified_count,
            job.mismatch_count,
            job.missing_count,
            job.error_count,
        ))
        .for_query(SQL)?;
        Ok(())
    }

    pub fn update_verification_job(&self, job: &VerificationJob) -> Result<(), CatalogError> {
        const SQL: &str = "update verification_jobs set end_time = ?2, total_photos = ?3, \
             verified_count = ?4, mismatch_count = ?5, missing_count = ?6, error_count = ?7 \
             where id = ?1";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        stmt.execute((
            UuidText(job.id),
            job.end_time,
            job.total_photos,
            job.verified_count,
            job.mismatch_count,
            job.missing_count,
            job.error_count,
        ))
        .for_query(SQL)?;
        Ok(())
    }

    pub fn recent_verification_jobs(&self, limit: u32) -> Result<Vec<VerificationJob>, CatalogError> {
        const SQL: &str = "select id, destination_id, kind, start_time, end_time, total_photos, \
             verified_count, mismatch_count, missing_count, error_count \
             from verification_jobs order by start_time desc limit ?1";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok(VerificationJob {
                    id: row.get::<_, UuidText>(0)?.into(),
                    destination_id: row.get::<_, UuidText>(1)?.into(),
                    kind: parse_col(row, 2, VerificationKind::parse)?,
                    start_time: row.get(3)?,
                    end_time: row.get(4)?,
                    total_photos: row.get(5)?,
                    verified_count: row.get(6)?,
                    mismatch_count: row.get(7)?,
                    missing_count: row.get(8)?,
                    error_count: row.get(9)?,
                })
            })
            .for_query(SQL)?;
        rows.collect::<rusqlite::Result<_>>().for_query(SQL)
    }

    // ---- schedules ----

    pub fn upsert_schedule(&self, job: &ScheduledBackupJob) -> Result<(), CatalogError> {
        const SQL: &str = "insert or replace into schedules (id, destination_id, name, is_enabled, \
             schedule, filter, created_at, last_run_time, next_run_time, last_run_status) \
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        stmt.execute((
            UuidText(job.id),
            UuidText(job.destination_id),
            &job.name,
            job.is_enabled,
            Json(job.schedule),
            Json(job.filter),
            job.created_at,
            job.last_run_time,
            job.next_run_time,
            &job.last_run_status,
        ))
        .for_query(SQL)?;
        Ok(())
    }

    pub fn list_schedules(&self) -> Result<Vec<ScheduledBackupJob>, CatalogError> {
        const SQL: &str = "select id, destination_id, name, is_enabled, schedule, filter, \
             created_at, last_run_time, next_run_time, last_run_status \
             from schedules order by created_at";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        let rows = stmt.query_map((), schedule_from_row).for_query(SQL)?;
        rows.collect::<rusqlite::Result<_>>().for_query(SQL)
    }

    pub fn list_enabled_schedules(&self) -> Result<Vec<ScheduledBackupJob>, CatalogError> {
        const SQL: &str = "select id, destination_id, name, is_enabled, schedule, filter, \
             created_at, last_run_time, next_run_time, last_run_status \
             from schedules where is_enabled = 1 order by created_at";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        let rows = stmt.query_map((), schedule_from_row).for_query(SQL)?;
        rows.collect::<rusqlite::Result<_>>().for_query(SQL)
    }

    pub fn list_due_at(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledBackupJob>, CatalogError> {
        const SQL: &str = "select id, destination_id, name, is_enabled, schedule, filter, \
             created_at, last_run_time, next_run_time, last_run_status \
             from schedules where is_enabled = 1 and next_run_time is not null \
             and next_run_time <= ?1 order by next_run_time";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        let rows = stmt.query_map([now], schedule_from_row).for_query(SQL)?;
        rows.collect::<rusqlite::Result<_>>().for_query(SQL)
    }

    pub fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduledBackupJob>, CatalogError> {
        const SQL: &str = "select id, destination_id, name, is_enabled, schedule, filter, \
             created_at, last_run_time, next_run_time, last_run_status \
             from schedules where id = ?1";

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
        stmt.query_row([id.to_string()], schedule_from_row)
            .optional()
            .for_query(SQL)
    }

    pub fn set_schedule_enabled(&self, id: Uuid, enabled: bool) -> Result<(), CatalogError> {
        const SQL: &str = "update schedules set is_enabled = ?2 where id = ?1";

        let conn = self.conn.lock();
        conn.execute(SQL, (id.to_string(), enabled)).for_query(SQL)?;
        Ok(())
    }

    pub fn record_run_result(
        &self,
        id: Uuid,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
        status: &str,
    ) -> Result<(), CatalogError> {
        const SQL: &str = "update schedules set last_run_time = ?2, next_run_time = ?3, \
             last_run_status = ?4, is_enabled = is_enabled and ?3 is not null where id = ?1";

        let conn = self.conn.lock();
        conn.execute(SQL, (id.to_string(), last_run, next_run, status))
            .for_query(SQL)?;
        Ok(())
    }

    pub fn delete_schedule(&self, id: Uuid) -> Result<(), CatalogError> {
        const SQL: &str = "delete from schedules where id = ?1";

        let conn = self.conn.lock();
        conn.execute(SQL, [id.to_string()]).for_query(SQL)?;
        Ok(())
    }
}

fn upsert_synced_stmt(conn: &Connection, photo: &SyncedPhoto) -> Result<(), CatalogError> {
    // `(local_id, destination_id)` collisions replace the old row wholesale
    const SQL: &str = "insert into synced_photos (id, local_id, destination_id, remote_path, \
         checksum, sync_date, file_size, last_verified_date, file_metadata) \
         values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
         on conflict (local_id, destination_id) do update set \
         id = excluded.id, remote_path = excluded.remote_path, checksum = excluded.checksum, \
         sync_date = excluded.sync_date, file_size = excluded.file_size, \
         last_verified_date = excluded.last_verified_date, file_metadata = excluded.file_metadata";

    let mut stmt = conn.prepare_cached(SQL).for_query(SQL)?;
    stmt.execute((
        UuidText(photo.id),
        &photo.local_id,
        UuidText(photo.destination_id),
        &photo.remote_path,
        &photo.checksum,
        photo.sync_date,
        photo.file_size,
        photo.last_verified_date,
        &photo.file_metadata,
    ))
    .for_query(SQL)?;
    Ok(())
}

fn parse_col<T>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    parse(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unrecognized value `{text}`").into(),
        )
    })
}

fn synced_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncedPhoto> {
    Ok(SyncedPhoto {
        id: row.get::<_, UuidText>(0)?.into(),
        local_id: row.get(1)?,
        destination_id: row.get::<_, UuidText>(2)?.into(),
        remote_path: row.get(3)?,
        checksum: row.get(4)?,
        sync_date: row.get(5)?,
        file_size: row.get(6)?,
        last_verified_date: row.get(7)?,
        file_metadata: row.get(8)?,
    })
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncJob> {
    Ok(SyncJob {
        id: row.get::<_, UuidText>(0)?.into(),
        destination_id: row.get::<_, UuidText>(1)?.into(),
        status: parse_col(row, 2, JobStatus::parse)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        photos_scanned: row.get(5)?,
        photos_synced: row.get(6)?,
        photos_failed: row.get(7)?,
        bytes_transferred: row.get(8)?,
        average_speed: row.get(9)?,
    })
}

fn log_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
    Ok(LogEntry {
        id: row.get::<_, UuidText>(0)?.into(),
        job_id: row.get::<_, Option<UuidText>>(1)?.map(Into::into),
        timestamp: row.get(2)?,
        level: parse_col(row, 3, LogLevel::parse)?,
        category: row.get(4)?,
        message: row.get(5)?,
        photo_ref: row.get(6)?,
        details: row
            .get::<_, Option<Json<serde_json::Value>>>(7)?
            .map(|json| json.0),
    })
}

fn destination_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DestinationRecord> {
    Ok(DestinationRecord {
        id: row.get::<_, UuidText>(0)?.into(),
        name: row.get(1)?,
        kind: parse_col(row, 2, DestinationKind::parse)?,
        config_blob: row.get(3)?,
        created_at: row.get(4)?,
        last_health_check: row.get(5)?,
        health_status: parse_col(row, 6, HealthStatus::parse)?,
    })
}

fn schedule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledBackupJob> {
    Ok(ScheduledBackupJob {
        id: row.get::<_, UuidText>(0)?.into(),
        destination_id: row.get::<_, UuidText>(1)?.into(),
        name: row.get(2)?,
        is_enabled: row.get(3)?,
        schedule: row.get::<_, Json<Schedule>>(4)?.0,
        filter: row.get::<_, Json<DateRangeFilter>>(5)?.0,
        created_at: row.get(6)?,
        last_run_time: row.get(7)?,
        next_run_time: row.get(8)?,
        last_run_status: row.get(9)?,
    })
}
