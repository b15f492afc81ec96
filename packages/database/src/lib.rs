#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Persistence collaborator for the facility import pipeline.
//!
//! [`ImportStore`] is the boundary the pipeline writes through: create,
//! read and update by id, one atomic multi-record batch write, and
//! equality queries ordered by timestamp. Two implementations ship here:
//!
//! - [`memory::MemoryStore`], an in-process store used by tests and by
//!   applications that keep import state in memory.
//! - `duckdb_store::DuckDbStore` (feature `duckdb`), backed by a `DuckDB`
//!   file with each batch written inside one transaction.

pub mod memory;

#[cfg(feature = "duckdb")]
pub mod duckdb_store;
#[cfg(feature = "duckdb")]
pub mod paths;

use async_trait::async_trait;
use facility_import_models::{
    AddressMatchQuality, Facility, FacilityLocation, ImportJob, ImportJobStatus, ImportedRecord,
    JobStatsDelta, RecordResolution,
};
use uuid::Uuid;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The entity to update does not exist.
    #[error("{entity} {id} not found")]
    Missing {
        /// Entity kind (`"job"`, `"facility"`, `"record"`).
        entity: &'static str,
        /// Requested id.
        id: Uuid,
    },

    /// A write conflicts with existing data (duplicate id, dangling link).
    #[error("Write conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// The backend rejected or failed the operation.
    #[error("Store backend error: {message}")]
    Backend {
        /// Description of what went wrong.
        message: String,
    },

    /// Entity (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `DuckDB` error.
    #[cfg(feature = "duckdb")]
    #[error("DuckDB error: {0}")]
    DuckDb(duckdb::Error),
}

#[cfg(feature = "duckdb")]
impl From<duckdb::Error> for StoreError {
    fn from(e: duckdb::Error) -> Self {
        Self::DuckDb(e)
    }
}

/// One create in an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchWrite {
    /// Create a facility with placeholder location fields.
    CreateFacility(Facility),
    /// Create the tracking record paired with a facility.
    CreateRecord(ImportedRecord),
}

/// Equality filters for [`ImportStore::query_records`].
///
/// Every `Some` field must match. Results are ordered by `created_at`,
/// then `row_number`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordQuery {
    /// Owning job.
    pub job_id: Option<Uuid>,
    /// Match quality.
    pub quality: Option<AddressMatchQuality>,
    /// Review flag.
    pub needs_review: Option<bool>,
}

impl RecordQuery {
    /// All records of one job.
    #[must_use]
    pub const fn for_job(job_id: Uuid) -> Self {
        Self {
            job_id: Some(job_id),
            quality: None,
            needs_review: None,
        }
    }

    /// Records of one job still waiting for geocoding.
    #[must_use]
    pub const fn pending(job_id: Uuid) -> Self {
        Self {
            job_id: Some(job_id),
            quality: Some(AddressMatchQuality::Pending),
            needs_review: None,
        }
    }

    /// Records flagged for review, optionally scoped to one job.
    #[must_use]
    pub const fn needing_review(job_id: Option<Uuid>) -> Self {
        Self {
            job_id,
            quality: None,
            needs_review: Some(true),
        }
    }

    /// Returns `true` if `record` satisfies every filter.
    #[must_use]
    pub fn matches(&self, record: &ImportedRecord) -> bool {
        self.job_id.is_none_or(|id| record.job_id == id)
            && self
                .quality
                .is_none_or(|q| record.address_match_quality == q)
            && self.needs_review.is_none_or(|r| record.needs_review == r)
    }
}

/// Storage for import jobs, tracking records, and the facility location
/// fields the pipeline owns.
///
/// Individual writes are independent; only [`ImportStore::commit_batch`]
/// spans multiple entities atomically.
#[async_trait]
pub trait ImportStore: Send + Sync {
    /// Inserts a new job.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the id exists, or a backend
    /// error.
    async fn insert_job(&self, job: &ImportJob) -> Result<(), StoreError>;

    /// Reads a job by id.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the read fails.
    async fn get_job(&self, id: Uuid) -> Result<Option<ImportJob>, StoreError>;

    /// Lists all jobs, newest first.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the read fails.
    async fn list_jobs(&self) -> Result<Vec<ImportJob>, StoreError>;

    /// Moves a job from `from` to `to` if, and only if, it is currently in
    /// `from`. Sets `error` when given and stamps `completed_at` on
    /// `Completed`.
    ///
    /// Returns `false` if the job was not in `from`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] if the job does not exist.
    async fn transition_job(
        &self,
        id: Uuid,
        from: ImportJobStatus,
        to: ImportJobStatus,
        error: Option<String>,
    ) -> Result<bool, StoreError>;

    /// Atomically adds `delta` to the job's counters.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] if the job does not exist.
    async fn increment_job_stats(&self, id: Uuid, delta: &JobStatsDelta)
    -> Result<(), StoreError>;

    /// Overwrites `stats.total_records`, leaving status, error and every
    /// other counter as they are.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] if the job does not exist.
    async fn set_total_records(&self, id: Uuid, total_records: u64) -> Result<(), StoreError>;

    /// Applies every write or none of them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] for duplicate ids or records whose
    /// facility is neither stored nor part of the batch, or a backend
    /// error. Nothing is written in either case.
    async fn commit_batch(&self, writes: Vec<BatchWrite>) -> Result<(), StoreError>;

    /// Reads a facility by id.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the read fails.
    async fn get_facility(&self, id: Uuid) -> Result<Option<Facility>, StoreError>;

    /// Overwrites the location fields and slug of a facility.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] if the facility does not exist.
    async fn update_facility_location(
        &self,
        id: Uuid,
        location: &FacilityLocation,
        slug: &str,
    ) -> Result<(), StoreError>;

    /// Reads a tracking record by id.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the read fails.
    async fn get_record(&self, id: Uuid) -> Result<Option<ImportedRecord>, StoreError>;

    /// Returns records matching `query`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the read fails.
    async fn query_records(&self, query: &RecordQuery) -> Result<Vec<ImportedRecord>, StoreError>;

    /// Moves a record out of `Pending`. Returns `false` (and writes
    /// nothing) if the record already left `Pending`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] if the record does not exist, or
    /// [`StoreError::Conflict`] if `resolution` is itself `Pending`.
    async fn resolve_record(
        &self,
        id: Uuid,
        resolution: &RecordResolution,
    ) -> Result<bool, StoreError>;

    /// Replaces the address and outcome of a record during manual review.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] if the record does not exist, or
    /// [`StoreError::Conflict`] if `resolution` is `Pending`.
    async fn correct_record(
        &self,
        id: Uuid,
        raw_address: &str,
        resolution: &RecordResolution,
    ) -> Result<(), StoreError>;
}

/// Rejects resolutions that would put a record back into `Pending`.
pub(crate) fn ensure_resolved(resolution: &RecordResolution) -> Result<(), StoreError> {
    if resolution.quality.is_resolved() {
        Ok(())
    } else {
        Err(StoreError::Conflict {
            message: "a record cannot be moved back to pending".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(job_id: Uuid, quality: AddressMatchQuality) -> ImportedRecord {
        ImportedRecord {
            id: Uuid::new_v4(),
            job_id,
            facility_id: Uuid::new_v4(),
            row_number: 1,
            name: "Clinic".to_string(),
            website: None,
            raw_address: "1 Main St".to_string(),
            address_match_quality: quality,
            needs_review: quality.needs_review(),
            geocoding_error: None,
            processed_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn query_filters_by_every_field() {
        let job = Uuid::new_v4();
        let pending = record(job, AddressMatchQuality::Pending);
        let partial = record(job, AddressMatchQuality::Partial);
        let other_job = record(Uuid::new_v4(), AddressMatchQuality::None);

        assert!(RecordQuery::pending(job).matches(&pending));
        assert!(!RecordQuery::pending(job).matches(&partial));
        assert!(RecordQuery::needing_review(Some(job)).matches(&partial));
        assert!(!RecordQuery::needing_review(Some(job)).matches(&other_job));
        assert!(RecordQuery::needing_review(None).matches(&other_job));
        assert!(RecordQuery::default().matches(&pending));
    }

    #[test]
    fn pending_resolution_is_rejected() {
        let mut resolution = RecordResolution::exact();
        assert!(ensure_resolved(&resolution).is_ok());
        resolution.quality = AddressMatchQuality::Pending;
        assert!(matches!(
            ensure_resolved(&resolution),
            Err(StoreError::Conflict { .. })
        ));
    }
}
