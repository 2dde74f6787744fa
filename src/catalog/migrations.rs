//! Schema version bookkeeping
//!
//! The catalog keeps a monotonically increasing version in the
//! `schema_version` table. Opening an older file applies the missing
//! migrations in order; every migration is written to be idempotent (guarded
//! `add column`, `create .. if not exists`) so a crash between a migration and
//! its version row is harmless. Fresh files get the full schema from
//! `schema.sql` at open and only record the current version here.

use chrono::Utc;
use rusqlite::Connection;
use tracing::info;

use super::CatalogError;

pub(super) const CURRENT_VERSION: u32 = 3;

pub(super) fn apply(conn: &mut Connection) -> Result<(), CatalogError> {
    let persisted = persisted_version(conn)?;

    match persisted {
        // Fresh file: schema.sql already created the current layout
        None => record_version(conn, CURRENT_VERSION),
        Some(version) if version < CURRENT_VERSION => {
            for target in (version + 1)..=CURRENT_VERSION {
                info!("Migrating catalog schema from version {version} to {target}");
                migrate_to(conn, target)?;
                record_version(conn, target)?;
            }
            Ok(())
        }
        Some(_) => Ok(()),
    }
}

fn migrate_to(conn: &mut Connection, target: u32) -> Result<(), CatalogError> {
    let schema_err = |source| CatalogError::Schema {
        version: target,
        source,
    };

    let tx = conn.transaction().map_err(schema_err)?;
    match target {
        // v2 started keeping the source metadata snapshot on synced rows
        2 => {
            if !column_exists(&tx, "synced_photos", "file_metadata").map_err(schema_err)? {
                tx.execute("alter table synced_photos add column file_metadata text", ())
                    .map_err(schema_err)?;
            }
        }
        // v3 introduced scheduled backups and per-job throughput
        3 => {
            if !column_exists(&tx, "sync_jobs", "average_speed").map_err(schema_err)? {
                tx.execute("alter table sync_jobs add column average_speed real", ())
                    .map_err(schema_err)?;
            }
            tx.execute_batch(
                "create table if not exists schedules (
                    id text primary key,
                    destination_id text not null,
                    name text not null,
                    is_enabled integer not null default 1,
                    schedule text not null,
                    filter text not null,
                    created_at text not null,
                    last_run_time text,
                    next_run_time text,
                    last_run_status text
                );
                create index if not exists idx_schedules_next_run
                    on schedules (next_run_time);",
            )
            .map_err(schema_err)?;
        }
        unknown => {
            return Err(CatalogError::Schema {
                version: unknown,
                source: rusqlite::Error::InvalidQuery,
            })
        }
    }
    tx.commit().map_err(schema_err)
}

fn persisted_version(conn: &Connection) -> Result<Option<u32>, CatalogError> {
    conn.query_row("select max(version) from schema_version", (), |row| {
        row.get::<_, Option<u32>>(0)
    })
    .map_err(|source| CatalogError::Schema { version: 0, source })
}

fn record_version(conn: &Connection, version: u32) -> Result<(), CatalogError> {
    conn.execute(
        "insert or ignore into schema_version (version, applied_at) values (?1, ?2)",
        (version, Utc::now()),
    )
    .map_err(|source| CatalogError::Schema { version, source })?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("pragma table_info({table})"))?;
    let mut rows = stmt.query(())?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
