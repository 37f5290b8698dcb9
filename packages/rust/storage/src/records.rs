//! libSQL record store (`records.db`): the output contract of a run.
//!
//! Every record that exits the pipeline is upserted here with its full field
//! map and quality breakdown. Rejected records are kept but flagged
//! non-searchable.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use paperflow_shared::{ExitOutcome, PaperflowError, Result};
use serde_json::Value;

use crate::migrations;

/// One exited record as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record_id: String,
    pub status: ExitOutcome,
    pub searchable: bool,
    pub score: Option<f64>,
    pub components: Option<Value>,
    pub fields: BTreeMap<String, Value>,
    pub run_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Counts over the record store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordCounts {
    pub completed: u64,
    pub rejected: u64,
    pub searchable: u64,
}

/// A finished or in-flight run as recorded in history.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRow {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub report_json: Option<String>,
}

fn storage_err(e: impl std::fmt::Display) -> PaperflowError {
    PaperflowError::Storage(e.to_string())
}

/// Handle on `records.db`.
pub struct RecordStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl RecordStore {
    /// Open or create the database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PaperflowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let store = Self { db, conn };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    PaperflowError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 before the first migration.
    pub async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// Insert or replace a record.
    pub async fn upsert(&self, record: &StoredRecord) -> Result<()> {
        let fields_json = serde_json::to_string(&record.fields).map_err(storage_err)?;
        let components_json = record
            .components
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(storage_err)?;

        self.conn
            .execute(
                "INSERT INTO records (record_id, status, searchable, score, components_json, fields_json, run_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(record_id) DO UPDATE SET
                   status = excluded.status,
                   searchable = excluded.searchable,
                   score = excluded.score,
                   components_json = excluded.components_json,
                   fields_json = excluded.fields_json,
                   run_id = excluded.run_id,
                   updated_at = excluded.updated_at",
                params![
                    record.record_id.as_str(),
                    record.status.as_str(),
                    i64::from(record.searchable),
                    record.score,
                    components_json,
                    fields_json,
                    record.run_id.as_str(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn get(&self, record_id: &str) -> Result<Option<StoredRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_id, status, searchable, score, components_json, fields_json, run_id, updated_at
                 FROM records WHERE record_id = ?1",
                params![record_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Records with the given status, ordered by ID.
    pub async fn list_by_status(&self, status: ExitOutcome, limit: u32) -> Result<Vec<StoredRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_id, status, searchable, score, components_json, fields_json, run_id, updated_at
                 FROM records WHERE status = ?1 ORDER BY record_id LIMIT ?2",
                params![status.as_str(), limit],
            )
            .await
            .map_err(storage_err)?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(row_to_record(&row)?);
        }
        Ok(out)
    }

    pub async fn counts(&self) -> Result<RecordCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT
                   COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN status = 'rejected' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(searchable), 0)
                 FROM records",
                params![],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(RecordCounts {
                completed: row.get::<u64>(0).map_err(storage_err)?,
                rejected: row.get::<u64>(1).map_err(storage_err)?,
                searchable: row.get::<u64>(2).map_err(storage_err)?,
            }),
            Ok(None) => Ok(RecordCounts::default()),
            Err(e) => Err(storage_err(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Run history
    // -----------------------------------------------------------------------

    pub async fn start_run(&self, run_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO runs (run_id, started_at) VALUES (?1, ?2)",
                params![run_id, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn finish_run(&self, run_id: &str, report_json: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE runs SET finished_at = ?1, report_json = ?2 WHERE run_id = ?3",
                params![now.as_str(), report_json, run_id],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// The most recently started run.
    pub async fn last_run(&self) -> Result<Option<RunRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, started_at, finished_at, report_json
                 FROM runs ORDER BY started_at DESC, run_id DESC LIMIT 1",
                params![],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(RunRow {
                run_id: row.get::<String>(0).map_err(storage_err)?,
                started_at: row.get::<String>(1).map_err(storage_err)?,
                finished_at: row.get::<String>(2).ok(),
                report_json: row.get::<String>(3).ok(),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }
}

fn row_to_record(row: &libsql::Row) -> Result<StoredRecord> {
    let status = match row.get::<String>(1).map_err(storage_err)?.as_str() {
        "completed" => ExitOutcome::Completed,
        "rejected" => ExitOutcome::Rejected,
        other => return Err(PaperflowError::Storage(format!("unknown status '{other}'"))),
    };
    let components = match row.get::<String>(4).ok() {
        Some(s) => Some(serde_json::from_str(&s).map_err(storage_err)?),
        None => None,
    };
    let fields_json: String = row.get(5).map_err(storage_err)?;
    let updated_at: String = row.get(7).map_err(storage_err)?;

    Ok(StoredRecord {
        record_id: row.get::<String>(0).map_err(storage_err)?,
        status,
        searchable: row.get::<i64>(2).map_err(storage_err)? != 0,
        score: row.get::<f64>(3).ok(),
        components,
        fields: serde_json::from_str(&fields_json).map_err(storage_err)?,
        run_id: row.get::<String>(6).map_err(storage_err)?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| PaperflowError::Storage(format!("invalid date: {e}")))?,
    })
}
