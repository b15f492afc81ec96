//! Entry point tying ingestion and geocoding together.
//!
//! [`ImportPipeline::submit`] validates an upload, creates its job, and
//! runs both phases on a spawned tokio task. The returned [`ImportTask`]
//! can be awaited, polled, or cancelled. Whatever ends the run, the
//! outcome is on the job: a run that errors or whose task dies fails the
//! job with the message.

use std::sync::Arc;

use facility_database::ImportStore;
use facility_geocoder::Geocoder;
use facility_import_models::{ImportJob, ImportJobStatus, ImportRow};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ProcessorConfig;
use crate::controller::JobController;
use crate::ingest::{Ingestor, ValidatedRow, validate_rows};
use crate::processor::GeocodingProcessor;
use crate::progress::{ProgressCallback, null_progress};
use crate::review::ReviewQueue;
use crate::ImportError;

/// Owns the collaborators and starts import runs.
#[derive(Clone)]
pub struct ImportPipeline {
    store: Arc<dyn ImportStore>,
    geocoder: Arc<dyn Geocoder>,
    config: ProcessorConfig,
    progress: Arc<dyn ProgressCallback>,
    controller: JobController,
}

impl ImportPipeline {
    /// Creates a pipeline.
    #[must_use]
    pub fn new(
        store: Arc<dyn ImportStore>,
        geocoder: Arc<dyn Geocoder>,
        config: ProcessorConfig,
    ) -> Self {
        let controller = JobController::new(Arc::clone(&store));
        Self {
            store,
            geocoder,
            config,
            progress: null_progress(),
            controller,
        }
    }

    /// Reports geocoding progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Job reads and cancellation.
    #[must_use]
    pub const fn jobs(&self) -> &JobController {
        &self.controller
    }

    /// The review queue over this pipeline's store and geocoder.
    #[must_use]
    pub fn review_queue(&self) -> ReviewQueue {
        ReviewQueue::new(
            Arc::clone(&self.store),
            Arc::clone(&self.geocoder),
            self.config.clone(),
        )
    }

    /// Validates `rows`, creates a job, and starts importing in the
    /// background.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Validation`] listing every invalid row (no job
    /// is created), or [`ImportError::Persistence`] if the job cannot be
    /// created.
    pub async fn submit(
        &self,
        file_name: &str,
        created_by: &str,
        rows: Vec<ImportRow>,
    ) -> Result<ImportTask, ImportError> {
        let rows = validate_rows(rows)?;
        self.submit_validated(file_name, created_by, rows).await
    }

    /// Creates a job for already validated rows and starts importing in
    /// the background.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Persistence`] if the job cannot be created.
    pub async fn submit_validated(
        &self,
        file_name: &str,
        created_by: &str,
        rows: Vec<ValidatedRow>,
    ) -> Result<ImportTask, ImportError> {
        let job_id = self
            .controller
            .create_job(file_name, created_by, rows.len() as u64)
            .await?;

        let ingestor = Ingestor::new(Arc::clone(&self.store));
        let processor = self.processor();
        Ok(self.spawn(job_id, async move {
            let summary = ingestor.ingest_rows(job_id, &rows).await?;
            if !summary.cancelled {
                processor.run(job_id).await?;
            }
            Ok(())
        }))
    }

    /// Re-runs the geocoding phase for a job left in `geocoding`, after a
    /// crash or a run whose record writes failed. Only records still
    /// pending are attempted.
    ///
    /// The caller must ensure no other run is active for the same job.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::InvalidState`] unless the job is geocoding,
    /// or [`ImportError::NotFound`] for an unknown id.
    pub async fn resume_geocoding(&self, job_id: Uuid) -> Result<ImportTask, ImportError> {
        let status = self.controller.status(job_id).await?;
        if status != ImportJobStatus::Geocoding {
            return Err(ImportError::InvalidState {
                job_id,
                status,
                operation: "resume geocoding",
            });
        }

        let processor = self.processor();
        Ok(self.spawn(job_id, async move {
            processor.run(job_id).await?;
            Ok(())
        }))
    }

    fn processor(&self) -> GeocodingProcessor {
        GeocodingProcessor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.geocoder),
            self.config.clone(),
        )
        .with_progress(Arc::clone(&self.progress))
    }

    fn spawn<F>(&self, job_id: Uuid, run: F) -> ImportTask
    where
        F: Future<Output = Result<(), ImportError>> + Send + 'static,
    {
        let controller = self.controller.clone();
        let handle = tokio::spawn(async move {
            let result = run.await;
            controller.fail_on_error(job_id, result).await
        });

        ImportTask {
            job_id,
            controller: self.controller.clone(),
            handle,
        }
    }
}

/// Handle to a background import run.
pub struct ImportTask {
    job_id: Uuid,
    controller: JobController,
    handle: JoinHandle<Result<(), ImportError>>,
}

impl std::fmt::Debug for ImportTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportTask")
            .field("job_id", &self.job_id)
            .field("finished", &self.handle.is_finished())
            .finish_non_exhaustive()
    }
}

impl ImportTask {
    /// The job this run drives.
    #[must_use]
    pub const fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Returns `true` once the run has ended, successfully or not.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Current state of the job, without waiting.
    ///
    /// # Errors
    ///
    /// See [`JobController::get_job`].
    pub async fn job(&self) -> Result<ImportJob, ImportError> {
        self.controller.get_job(self.job_id).await
    }

    /// Cancels the job. In-flight geocode requests finish; no further
    /// batch starts. The run itself ends shortly after and can still be
    /// awaited.
    ///
    /// # Errors
    ///
    /// See [`JobController::cancel_job`].
    pub async fn cancel(&self) -> Result<ImportJob, ImportError> {
        self.controller.cancel_job(self.job_id).await
    }

    /// Waits for the run to end and returns the final job.
    ///
    /// A cancelled run is not an error; the returned job is `Failed` with
    /// the cancellation message.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the run (already recorded on the job),
    /// or [`ImportError::Task`] if the task panicked or was aborted.
    pub async fn wait(self) -> Result<ImportJob, ImportError> {
        match self.handle.await {
            Ok(Ok(())) => self.controller.get_job(self.job_id).await,
            Ok(Err(e)) => Err(e),
            Err(join_err) => {
                let message = format!("Import task ended abnormally: {join_err}");
                if let Err(e) = self.controller.fail_job(self.job_id, &message).await {
                    log::error!("Failed to record failure of import job {}: {e}", self.job_id);
                }
                Err(ImportError::Task { message })
            }
        }
    }
}
