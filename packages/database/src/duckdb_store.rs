//! `DuckDB`-backed [`ImportStore`].
//!
//! Entities are stored as JSON documents next to the columns the store
//! filters and orders on. `DuckDB` connections are synchronous, so every
//! call runs on the blocking pool while holding the connection mutex;
//! read-modify-write operations run inside a transaction.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use duckdb::{Connection, params, params_from_iter};
use facility_import_models::{
    Facility, FacilityLocation, ImportJob, ImportJobStatus, ImportedRecord, JobStatsDelta,
    RecordResolution,
};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::{BatchWrite, ImportStore, RecordQuery, StoreError, ensure_resolved};

const SELECT_JOB: &str = "SELECT body FROM import_jobs WHERE id = ?";
const SELECT_FACILITY: &str = "SELECT body FROM facilities WHERE id = ?";
const SELECT_RECORD: &str = "SELECT body FROM imported_records WHERE id = ?";

/// Import store persisted in a `DuckDB` database.
#[derive(Clone)]
pub struct DuckDbStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for DuckDbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbStore").finish_non_exhaustive()
    }
}

impl DuckDbStore {
    /// Opens (or creates) the store at `path` and ensures the schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory, connection, or schema
    /// creation fails.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            crate::paths::ensure_dir(parent).map_err(|e| StoreError::Backend {
                message: format!("cannot create {}: {e}", parent.display()),
            })?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens the store at the default path.
    ///
    /// # Errors
    ///
    /// See [`DuckDbStore::open`].
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(&crate::paths::import_db_path())
    }

    /// Opens a throwaway in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the connection or schema creation fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Backend {
                message: "DuckDB connection mutex poisoned".to_string(),
            })?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend {
            message: format!("DuckDB task failed: {e}"),
        })?
    }
}

fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS import_jobs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS facilities (
            id TEXT PRIMARY KEY,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS imported_records (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            facility_id TEXT NOT NULL,
            quality TEXT NOT NULL,
            needs_review BOOLEAN NOT NULL,
            created_at TEXT NOT NULL,
            row_number BIGINT NOT NULL,
            body TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Fixed-width UTC timestamp, so text order is chronological order.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn load_one<T: DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    id: Uuid,
) -> Result<Option<T>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params![id.to_string()])?;
    match rows.next()? {
        Some(row) => {
            let body: String = row.get(0)?;
            Ok(Some(serde_json::from_str(&body)?))
        }
        None => Ok(None),
    }
}

fn load_all<T: DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    values: &[String],
) -> Result<Vec<T>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let bodies = stmt
        .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<String>, _>>()?;
    bodies
        .iter()
        .map(|body| serde_json::from_str(body).map_err(StoreError::from))
        .collect()
}

fn require_job(conn: &Connection, id: Uuid) -> Result<ImportJob, StoreError> {
    load_one(conn, SELECT_JOB, id)?.ok_or(StoreError::Missing { entity: "job", id })
}

fn require_record(conn: &Connection, id: Uuid) -> Result<ImportedRecord, StoreError> {
    load_one(conn, SELECT_RECORD, id)?.ok_or(StoreError::Missing {
        entity: "record",
        id,
    })
}

fn write_job(conn: &Connection, job: &ImportJob) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE import_jobs SET status = ?, body = ? WHERE id = ?",
        params![
            job.status.as_ref(),
            serde_json::to_string(job)?,
            job.id.to_string()
        ],
    )?;
    Ok(())
}

fn insert_record(conn: &Connection, record: &ImportedRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO imported_records
            (id, job_id, facility_id, quality, needs_review, created_at, row_number, body)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            record.id.to_string(),
            record.job_id.to_string(),
            record.facility_id.to_string(),
            record.address_match_quality.as_ref(),
            record.needs_review,
            timestamp(&record.created_at),
            i64::try_from(record.row_number).unwrap_or(i64::MAX),
            serde_json::to_string(record)?,
        ],
    )?;
    Ok(())
}

fn write_record(conn: &Connection, record: &ImportedRecord) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE imported_records SET quality = ?, needs_review = ?, body = ? WHERE id = ?",
        params![
            record.address_match_quality.as_ref(),
            record.needs_review,
            serde_json::to_string(record)?,
            record.id.to_string(),
        ],
    )?;
    Ok(())
}

fn exists(conn: &Connection, table: &str, id: Uuid) -> Result<bool, StoreError> {
    let sql = format!("SELECT COUNT(*) FROM {table} WHERE id = ?");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![id.to_string()])?;
    let count: i64 = match rows.next()? {
        Some(row) => row.get(0)?,
        None => 0,
    };
    Ok(count > 0)
}

#[async_trait]
impl ImportStore for DuckDbStore {
    async fn insert_job(&self, job: &ImportJob) -> Result<(), StoreError> {
        let job = job.clone();
        self.with_conn(move |conn| {
            if exists(conn, "import_jobs", job.id)? {
                return Err(StoreError::Conflict {
                    message: format!("duplicate job id {}", job.id),
                });
            }
            conn.execute(
                "INSERT INTO import_jobs (id, status, created_at, body) VALUES (?, ?, ?, ?)",
                params![
                    job.id.to_string(),
                    job.status.as_ref(),
                    timestamp(&job.created_at),
                    serde_json::to_string(&job)?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ImportJob>, StoreError> {
        self.with_conn(move |conn| load_one(conn, SELECT_JOB, id))
            .await
    }

    async fn list_jobs(&self) -> Result<Vec<ImportJob>, StoreError> {
        self.with_conn(|conn| {
            load_all(
                conn,
                "SELECT body FROM import_jobs ORDER BY created_at DESC, id",
                &[],
            )
        })
        .await
    }

    async fn transition_job(
        &self,
        id: Uuid,
        from: ImportJobStatus,
        to: ImportJobStatus,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut job = require_job(&tx, id)?;
            if job.status != from {
                return Ok(false);
            }

            let now = Utc::now();
            job.status = to;
            job.updated_at = now;
            if error.is_some() {
                job.error = error;
            }
            if to == ImportJobStatus::Completed {
                job.stats.completed_at = Some(now);
            }
            write_job(&tx, &job)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn increment_job_stats(
        &self,
        id: Uuid,
        delta: &JobStatsDelta,
    ) -> Result<(), StoreError> {
        let delta = *delta;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut job = require_job(&tx, id)?;
            delta.apply_to(&mut job.stats);
            job.updated_at = Utc::now();
            write_job(&tx, &job)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn set_total_records(&self, id: Uuid, total_records: u64) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut job = require_job(&tx, id)?;
            job.stats.total_records = total_records;
            job.updated_at = Utc::now();
            write_job(&tx, &job)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn commit_batch(&self, writes: Vec<BatchWrite>) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for write in &writes {
                match write {
                    BatchWrite::CreateFacility(facility) => {
                        if exists(&tx, "facilities", facility.id)? {
                            return Err(StoreError::Conflict {
                                message: format!("duplicate facility id {}", facility.id),
                            });
                        }
                        tx.execute(
                            "INSERT INTO facilities (id, body) VALUES (?, ?)",
                            params![facility.id.to_string(), serde_json::to_string(facility)?],
                        )?;
                    }
                    BatchWrite::CreateRecord(record) => {
                        if exists(&tx, "imported_records", record.id)? {
                            return Err(StoreError::Conflict {
                                message: format!("duplicate record id {}", record.id),
                            });
                        }
                        if !exists(&tx, "facilities", record.facility_id)? {
                            return Err(StoreError::Conflict {
                                message: format!(
                                    "record {} links to unknown facility {}",
                                    record.id, record.facility_id
                                ),
                            });
                        }
                        insert_record(&tx, record)?;
                    }
                }
            }
            tx.commit()?;
            log::debug!("Committed batch of {} writes", writes.len());
            Ok(())
        })
        .await
    }

    async fn get_facility(&self, id: Uuid) -> Result<Option<Facility>, StoreError> {
        self.with_conn(move |conn| load_one(conn, SELECT_FACILITY, id))
            .await
    }

    async fn update_facility_location(
        &self,
        id: Uuid,
        location: &FacilityLocation,
        slug: &str,
    ) -> Result<(), StoreError> {
        let location = location.clone();
        let slug = slug.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut facility: Facility =
                load_one(&tx, SELECT_FACILITY, id)?.ok_or(StoreError::Missing {
                    entity: "facility",
                    id,
                })?;
            facility.location = location;
            facility.slug = slug;
            facility.updated_at = Utc::now();
            tx.execute(
                "UPDATE facilities SET body = ? WHERE id = ?",
                params![serde_json::to_string(&facility)?, id.to_string()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<ImportedRecord>, StoreError> {
        self.with_conn(move |conn| load_one(conn, SELECT_RECORD, id))
            .await
    }

    async fn query_records(&self, query: &RecordQuery) -> Result<Vec<ImportedRecord>, StoreError> {
        let query = *query;
        self.with_conn(move |conn| {
            let mut sql = String::from("SELECT body FROM imported_records WHERE 1 = 1");
            let mut values = Vec::new();

            if let Some(job_id) = query.job_id {
                sql.push_str(" AND job_id = ?");
                values.push(job_id.to_string());
            }
            if let Some(quality) = query.quality {
                sql.push_str(" AND quality = ?");
                values.push(quality.as_ref().to_string());
            }
            match query.needs_review {
                Some(true) => sql.push_str(" AND needs_review"),
                Some(false) => sql.push_str(" AND NOT needs_review"),
                None => {}
            }
            sql.push_str(" ORDER BY created_at, row_number");

            load_all(conn, &sql, &values)
        })
        .await
    }

    async fn resolve_record(
        &self,
        id: Uuid,
        resolution: &RecordResolution,
    ) -> Result<bool, StoreError> {
        ensure_resolved(resolution)?;
        let resolution = resolution.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut record = require_record(&tx, id)?;
            if record.address_match_quality.is_resolved() {
                return Ok(false);
            }
            record.apply(&resolution);
            write_record(&tx, &record)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn correct_record(
        &self,
        id: Uuid,
        raw_address: &str,
        resolution: &RecordResolution,
    ) -> Result<(), StoreError> {
        ensure_resolved(resolution)?;
        let resolution = resolution.clone();
        let raw_address = raw_address.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut record = require_record(&tx, id)?;
            record.raw_address = raw_address;
            record.apply(&resolution);
            write_record(&tx, &record)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facility_import_models::AddressMatchQuality;

    fn pair(job_id: Uuid, row_number: u64) -> (Facility, ImportedRecord) {
        let now = Utc::now();
        let facility = Facility {
            id: Uuid::new_v4(),
            name: format!("Clinic {row_number}"),
            website: None,
            slug: format!("clinic-{row_number}"),
            location: FacilityLocation::placeholder(),
            created_at: now,
            updated_at: now,
        };
        let record = ImportedRecord {
            id: Uuid::new_v4(),
            job_id,
            facility_id: facility.id,
            row_number,
            name: facility.name.clone(),
            website: None,
            raw_address: "1 Main St".to_string(),
            address_match_quality: AddressMatchQuality::Pending,
            needs_review: false,
            geocoding_error: None,
            processed_at: None,
            created_at: now,
        };
        (facility, record)
    }

    #[tokio::test]
    async fn round_trips_jobs_and_records() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let job = ImportJob::new("f.csv", "u", 2);
        store.insert_job(&job).await.unwrap();

        let (f1, r1) = pair(job.id, 1);
        let (f2, r2) = pair(job.id, 2);
        store
            .commit_batch(vec![
                BatchWrite::CreateFacility(f1),
                BatchWrite::CreateRecord(r1.clone()),
                BatchWrite::CreateFacility(f2),
                BatchWrite::CreateRecord(r2.clone()),
            ])
            .await
            .unwrap();

        let pending = store.query_records(&RecordQuery::pending(job.id)).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, r1.id);

        assert!(
            store
                .resolve_record(r2.id, &RecordResolution::partial())
                .await
                .unwrap()
        );
        let review = store
            .query_records(&RecordQuery::needing_review(Some(job.id)))
            .await
            .unwrap();
        assert_eq!(review.len(), 1);
        assert_eq!(review[0].id, r2.id);
    }

    #[tokio::test]
    async fn failed_batch_rolls_back() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let (f, _) = pair(Uuid::new_v4(), 1);
        let (_, dangling) = pair(Uuid::new_v4(), 2);

        let err = store
            .commit_batch(vec![
                BatchWrite::CreateFacility(f.clone()),
                BatchWrite::CreateRecord(dangling),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(store.get_facility(f.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transition_and_increment() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let job = ImportJob::new("f.csv", "u", 1);
        store.insert_job(&job).await.unwrap();

        assert!(
            store
                .transition_job(job.id, ImportJobStatus::Pending, ImportJobStatus::Importing, None)
                .await
                .unwrap()
        );
        store
            .increment_job_stats(
                job.id,
                &JobStatsDelta {
                    processed_records: 1,
                    ..JobStatsDelta::default()
                },
            )
            .await
            .unwrap();

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ImportJobStatus::Importing);
        assert_eq!(stored.stats.processed_records, 1);
    }

    #[tokio::test]
    async fn total_override_keeps_status_and_error() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let job = ImportJob::new("f.csv", "u", 5);
        store.insert_job(&job).await.unwrap();
        store
            .transition_job(
                job.id,
                ImportJobStatus::Pending,
                ImportJobStatus::Failed,
                Some("stopped".to_string()),
            )
            .await
            .unwrap();

        store.set_total_records(job.id, 2).await.unwrap();

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.stats.total_records, 2);
        assert_eq!(stored.status, ImportJobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("stopped"));
    }
}
