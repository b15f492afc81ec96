//! Job lifecycle and aggregate statistics.
//!
//! Status changes go through [`ImportStore::transition_job`], a
//! compare-and-set on the current status, so a phase that lost a race with
//! a cancellation notices instead of overwriting it.

use std::sync::Arc;

use facility_database::{ImportStore, RecordQuery};
use facility_import_models::{ImportJob, ImportJobStatus, JobStatsDelta, RecordResolution};
use uuid::Uuid;

use crate::ImportError;

/// Error recorded on a job, and on its pending records, when a user
/// cancels it.
pub const CANCELLED_MESSAGE: &str = "Import cancelled by user";

/// Owns job state: creation, reads, cancellation, and the phase
/// transitions used by ingestion and the batch processor.
#[derive(Clone)]
pub struct JobController {
    store: Arc<dyn ImportStore>,
}

impl JobController {
    /// Creates a controller writing through `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ImportStore>) -> Self {
        Self { store }
    }

    /// Creates a `Pending` job with zeroed stats and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Persistence`] if the insert fails.
    pub async fn create_job(
        &self,
        file_name: &str,
        created_by: &str,
        total_records: u64,
    ) -> Result<Uuid, ImportError> {
        let job = ImportJob::new(file_name, created_by, total_records);
        self.store.insert_job(&job).await?;
        log::info!(
            "Created import job {} for '{file_name}' ({total_records} records)",
            job.id
        );
        Ok(job.id)
    }

    /// Reads a job.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::NotFound`] for an unknown id, or
    /// [`ImportError::Persistence`] if the read fails.
    pub async fn get_job(&self, job_id: Uuid) -> Result<ImportJob, ImportError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(ImportError::NotFound {
                entity: "job",
                id: job_id,
            })
    }

    /// Lists all jobs, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Persistence`] if the read fails.
    pub async fn list_jobs(&self) -> Result<Vec<ImportJob>, ImportError> {
        Ok(self.store.list_jobs().await?)
    }

    /// Cancels a running job.
    ///
    /// The job moves to `Failed` with [`CANCELLED_MESSAGE`] and every record
    /// still pending is resolved to `none` with the same message. Records
    /// already past pending are left alone, and geocode requests already in
    /// flight are not interrupted; the processor stops before its next
    /// batch.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::InvalidState`] (without writing anything)
    /// unless the job is importing or geocoding, [`ImportError::NotFound`]
    /// for an unknown id, or [`ImportError::Persistence`].
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<ImportJob, ImportError> {
        loop {
            let job = self.get_job(job_id).await?;
            if !job.status.is_active() {
                return Err(ImportError::InvalidState {
                    job_id,
                    status: job.status,
                    operation: "cancel",
                });
            }
            if self
                .store
                .transition_job(
                    job_id,
                    job.status,
                    ImportJobStatus::Failed,
                    Some(CANCELLED_MESSAGE.to_string()),
                )
                .await?
            {
                break;
            }
            // The job changed phase under us; re-read and try again.
        }

        let swept = self.sweep_pending(job_id).await?;
        log::error!("Import job {job_id} cancelled by user ({swept} pending records unresolved)");

        self.get_job(job_id).await
    }

    /// Resolves every pending record of a job to `none` with
    /// [`CANCELLED_MESSAGE`]. Returns how many records were swept.
    pub(crate) async fn sweep_pending(&self, job_id: Uuid) -> Result<u64, ImportError> {
        let resolution = RecordResolution::unresolved(CANCELLED_MESSAGE);
        let mut swept = 0;
        for record in self.store.query_records(&RecordQuery::pending(job_id)).await? {
            if self.store.resolve_record(record.id, &resolution).await? {
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Current status of a job.
    pub(crate) async fn status(&self, job_id: Uuid) -> Result<ImportJobStatus, ImportError> {
        Ok(self.get_job(job_id).await?.status)
    }

    /// Moves a job from `from` to `to`.
    ///
    /// Returns `Ok(false)` if the job has already failed (cancelled or
    /// failed by another writer), in which case the caller should stop.
    pub(crate) async fn advance(
        &self,
        job_id: Uuid,
        from: ImportJobStatus,
        to: ImportJobStatus,
        operation: &'static str,
    ) -> Result<bool, ImportError> {
        if self.store.transition_job(job_id, from, to, None).await? {
            log::debug!("Import job {job_id}: {from} -> {to}");
            return Ok(true);
        }

        match self.status(job_id).await? {
            ImportJobStatus::Failed => Ok(false),
            status => Err(ImportError::InvalidState {
                job_id,
                status,
                operation,
            }),
        }
    }

    /// Moves a geocoding job to `Completed`. Returns `false` if it was
    /// cancelled first.
    pub(crate) async fn complete_job(&self, job_id: Uuid) -> Result<bool, ImportError> {
        self.advance(
            job_id,
            ImportJobStatus::Geocoding,
            ImportJobStatus::Completed,
            "complete",
        )
        .await
    }

    /// Fails a non-terminal job with `message`. Returns `false` if the job
    /// had already finished.
    pub(crate) async fn fail_job(&self, job_id: Uuid, message: &str) -> Result<bool, ImportError> {
        loop {
            let status = self.status(job_id).await?;
            if status.is_terminal() {
                return Ok(false);
            }
            if self
                .store
                .transition_job(
                    job_id,
                    status,
                    ImportJobStatus::Failed,
                    Some(message.to_string()),
                )
                .await?
            {
                log::error!("Import job {job_id} failed: {message}");
                return Ok(true);
            }
        }
    }

    /// Passes `result` through, failing the job first if it is an error.
    pub(crate) async fn fail_on_error<T>(
        &self,
        job_id: Uuid,
        result: Result<T, ImportError>,
    ) -> Result<T, ImportError> {
        if let Err(e) = &result {
            if let Err(write_err) = self.fail_job(job_id, &e.to_string()).await {
                log::error!("Failed to record failure of import job {job_id}: {write_err}");
            }
        }
        result
    }

    /// Adds `delta` to the job's counters in one write.
    pub(crate) async fn record_stats(
        &self,
        job_id: Uuid,
        delta: &JobStatsDelta,
    ) -> Result<(), ImportError> {
        if !delta.is_empty() {
            self.store.increment_job_stats(job_id, delta).await?;
        }
        Ok(())
    }

    /// Overwrites `total_records` (the upload turned out to have a
    /// different row count than announced). Status and error are not
    /// touched, so a concurrent cancellation stands.
    pub(crate) async fn set_total_records(
        &self,
        job_id: Uuid,
        announced: u64,
        received: u64,
    ) -> Result<(), ImportError> {
        log::warn!("Import job {job_id}: announced {announced} records but received {received}");
        self.store.set_total_records(job_id, received).await?;
        Ok(())
    }
}

/// Returns `true` if every submitted row has been accounted for by
/// ingestion (`processed + failed == total`).
#[must_use]
pub const fn stats_consistent(job: &ImportJob) -> bool {
    job.stats.processed_records + job.stats.failed_records == job.stats.total_records
}
