//! Geocoding batch processor (the `geocoding` phase).
//!
//! Pending records are split into fixed-size batches. Batches run strictly
//! in order; within a batch every record is geocoded on its own spawned
//! task and the batch waits for all of them. The configured delay is
//! enforced between the end of one batch and the start of the next, and
//! the job status is re-checked before each batch so a cancellation stops
//! the run.
//!
//! Each record's outcome is decided by the provider's first candidate
//! only:
//!
//! | Result                     | Quality   | Review | Counters                    |
//! |----------------------------|-----------|--------|-----------------------------|
//! | no candidates              | `none`    | yes    | `failed_geocoding`          |
//! | first candidate approximate| `partial` | yes    | `geocoded`, `partial`       |
//! | first candidate exact      | `exact`   | no     | `geocoded`                  |
//! | provider/transport error   | `none`    | yes    | `failed_geocoding`          |
//!
//! Counters are aggregated per batch by this task alone and written with
//! one increment after the batch joins.

use std::sync::Arc;

use facility_database::{ImportStore, RecordQuery};
use facility_geocoder::address::normalize_query;
use facility_geocoder::{GeocodeCandidate, GeocodeRequest, Geocoder};
use facility_import_models::{
    AddressMatchQuality, FacilityLocation, ImportJobStatus, ImportedRecord, JobStatsDelta,
    RecordResolution,
};
use futures::future::join_all;
use uuid::Uuid;

use crate::config::ProcessorConfig;
use crate::controller::JobController;
use crate::outcome::{ItemOutcome, isolate};
use crate::progress::{ProgressCallback, null_progress};
use crate::slug::slugify;
use crate::ImportError;

/// Error recorded on a record whose address had no candidates.
pub const NOT_FOUND_MESSAGE: &str = "Address not found";

/// How the first candidate of a geocode response classifies a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Confident match.
    Exact(GeocodeCandidate),
    /// Approximate match.
    Partial(GeocodeCandidate),
    /// No candidates.
    NotFound,
}

/// Classifies a provider response. Only the first candidate counts.
#[must_use]
pub fn classify(candidates: Vec<GeocodeCandidate>) -> Classification {
    match candidates.into_iter().next() {
        None => Classification::NotFound,
        Some(top) if top.approximate => Classification::Partial(top),
        Some(top) => Classification::Exact(top),
    }
}

/// The decided outcome for one address, before it is written.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressResolution {
    /// Tracking record update.
    pub resolution: RecordResolution,
    /// New facility location and slug, for exact and partial matches.
    pub location: Option<(FacilityLocation, String)>,
}

impl AddressResolution {
    /// Counter changes this outcome contributes.
    #[must_use]
    pub fn delta(&self) -> JobStatsDelta {
        let mut delta = JobStatsDelta::default();
        match self.resolution.quality {
            AddressMatchQuality::Exact => delta.geocoded_addresses = 1,
            AddressMatchQuality::Partial => {
                delta.geocoded_addresses = 1;
                delta.partial_matches = 1;
            }
            AddressMatchQuality::None => delta.failed_geocoding = 1,
            AddressMatchQuality::Pending => {}
        }
        delta
    }
}

/// Geocodes one address for the facility named `name` and decides its
/// outcome. Provider errors become an unresolved outcome carrying the
/// error message; this never fails.
pub async fn geocode_one(
    geocoder: &dyn Geocoder,
    config: &ProcessorConfig,
    name: &str,
    raw_address: &str,
) -> AddressResolution {
    let request = GeocodeRequest::new(normalize_query(raw_address))
        .with_region(config.region.clone())
        .with_timeout(config.request_timeout);

    let candidates = match geocoder.geocode(&request).await {
        Ok(candidates) => candidates,
        Err(e) => {
            log::warn!("Geocoding failed for '{}': {e}", request.address);
            return AddressResolution {
                resolution: RecordResolution::unresolved(e.to_string()),
                location: None,
            };
        }
    };

    let (resolution, top) = match classify(candidates) {
        Classification::NotFound => {
            log::debug!("No match for '{}'", request.address);
            return AddressResolution {
                resolution: RecordResolution::unresolved(NOT_FOUND_MESSAGE),
                location: None,
            };
        }
        Classification::Partial(top) => (RecordResolution::partial(), top),
        Classification::Exact(top) => (RecordResolution::exact(), top),
    };

    let location = FacilityLocation {
        city: top.city().to_string(),
        state: top.state().to_string(),
        coordinates: Some(top.coordinates),
        address: top.formatted_address,
    };
    let slug = slugify(&[name, location.address.as_str()]);

    AddressResolution {
        resolution,
        location: Some((location, slug)),
    }
}

/// Splits `items` into consecutive batches of `batch_size` (the last one
/// may be shorter). A zero size is treated as one.
#[must_use]
pub fn plan_batches<T>(items: Vec<T>, batch_size: usize) -> Vec<Vec<T>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        batches.push(items.by_ref().take(batch_size).collect());
    }
    batches
}

/// Counts from one geocoding run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Batches started.
    pub batches: usize,
    /// Records attempted.
    pub attempted: u64,
    /// Counter changes written to the job.
    pub stats: JobStatsDelta,
    /// Records whose outcome could not be written; they stay pending.
    pub write_failures: u64,
    /// Counter changes still unwritten after the last batch.
    pub unrecorded: JobStatsDelta,
    /// The job was cancelled before all batches ran.
    pub cancelled: bool,
}

impl RunSummary {
    /// Whether records were left pending for another run to pick up.
    #[must_use]
    pub const fn is_incomplete(&self) -> bool {
        self.write_failures > 0
    }
}

/// Runs the geocoding phase of a job.
#[derive(Clone)]
pub struct GeocodingProcessor {
    store: Arc<dyn ImportStore>,
    geocoder: Arc<dyn Geocoder>,
    controller: JobController,
    config: Arc<ProcessorConfig>,
    progress: Arc<dyn ProgressCallback>,
}

impl GeocodingProcessor {
    /// Creates a processor with no progress reporting.
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
            controller,
            config: Arc::new(config),
            progress: null_progress(),
        }
    }

    /// Reports progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Geocodes every pending record of a job in `geocoding` status, then
    /// moves it to `completed`.
    ///
    /// Individual geocoding failures only flag records for review. The job
    /// fails only if the phase cannot start: the provider is not ready or
    /// the pending query fails. A job cancelled mid-run stops before the
    /// next batch and stays failed.
    ///
    /// A record whose outcome cannot be written stays pending and keeps the
    /// job in `geocoding`, so a later run picks it up. A failed counter
    /// write is retried with the next batch.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::InvalidState`] (leaving the job untouched) if
    /// the job is not geocoding. Other errors fail the job before being
    /// returned.
    pub async fn run(&self, job_id: Uuid) -> Result<RunSummary, ImportError> {
        let status = self.controller.status(job_id).await?;
        if status != ImportJobStatus::Geocoding {
            return Err(ImportError::InvalidState {
                job_id,
                status,
                operation: "geocode",
            });
        }

        let result = self.run_batches(job_id).await;
        self.controller.fail_on_error(job_id, result).await
    }

    async fn run_batches(&self, job_id: Uuid) -> Result<RunSummary, ImportError> {
        self.geocoder.check_ready()?;

        let pending = self.store.query_records(&RecordQuery::pending(job_id)).await?;
        let total = pending.len();
        let batches = plan_batches(pending, self.config.batch_size);
        let batch_count = batches.len();

        log::info!(
            "Import job {job_id}: geocoding {total} records in {batch_count} batches via {}",
            self.geocoder.name()
        );
        self.progress.set_total(total as u64);

        let mut summary = RunSummary::default();
        for (index, batch) in batches.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.batch_delay).await;
            }
            if self.controller.status(job_id).await? != ImportJobStatus::Geocoding {
                log::warn!(
                    "Import job {job_id}: stopped before batch {}/{batch_count}",
                    index + 1
                );
                summary.cancelled = true;
                break;
            }

            self.progress
                .set_message(format!("Batch {}/{batch_count}", index + 1));
            summary.batches += 1;
            summary.attempted += batch.len() as u64;

            let (delta, write_failures) = self.process_batch(batch).await;
            summary.write_failures += write_failures;
            summary.unrecorded.merge(&delta);
            self.flush_stats(job_id, &mut summary).await;

            log::info!(
                "Import job {job_id}: batch {}/{batch_count}: {} exact, {} partial, {} unresolved",
                index + 1,
                delta.geocoded_addresses - delta.partial_matches,
                delta.partial_matches,
                delta.failed_geocoding
            );
        }

        if !summary.unrecorded.is_empty() {
            log::error!(
                "Import job {job_id}: counters for {} records could not be written",
                summary.unrecorded.geocoded_addresses + summary.unrecorded.failed_geocoding
            );
        }

        if !summary.cancelled && summary.is_incomplete() {
            log::warn!(
                "Import job {job_id}: {} records left pending, staying in geocoding",
                summary.write_failures
            );
        } else if !summary.cancelled && !self.controller.complete_job(job_id).await? {
            summary.cancelled = true;
        }

        let finish = if summary.cancelled {
            "Geocoding cancelled"
        } else if summary.is_incomplete() {
            "Geocoding interrupted"
        } else {
            "Geocoding complete"
        };
        self.progress.finish(format!(
            "{finish}: {} geocoded, {} unresolved",
            summary.stats.geocoded_addresses, summary.stats.failed_geocoding
        ));
        log::info!("Import job {job_id}: {finish}");

        Ok(summary)
    }

    /// Writes the counters accumulated in `summary.unrecorded`. A failed
    /// write keeps them for the next batch.
    async fn flush_stats(&self, job_id: Uuid, summary: &mut RunSummary) {
        match self.controller.record_stats(job_id, &summary.unrecorded).await {
            Ok(()) => {
                summary.stats.merge(&summary.unrecorded);
                summary.unrecorded = JobStatsDelta::default();
            }
            Err(e) => log::error!("Import job {job_id}: counter update deferred: {e}"),
        }
    }

    /// Geocodes one batch concurrently and returns the counter changes for
    /// the records whose outcome was written, plus the number of records
    /// whose write failed.
    async fn process_batch(&self, batch: Vec<ImportedRecord>) -> (JobStatsDelta, u64) {
        let tasks = batch.into_iter().map(|record| {
            let label = format!("Record {} (row {})", record.id, record.row_number);
            let worker = self.clone();
            let handle = tokio::spawn(async move { worker.resolve(&record).await });
            async move {
                match handle.await {
                    Ok(result) => isolate(label, result),
                    Err(e) => ItemOutcome::failed(label, e),
                }
            }
        });

        let mut delta = JobStatsDelta::default();
        let mut write_failures = 0;
        for outcome in join_all(tasks).await {
            match outcome {
                ItemOutcome::Success(Some(written)) => delta.merge(&written),
                ItemOutcome::Success(None) => {}
                ItemOutcome::Failed { .. } => write_failures += 1,
            }
            self.progress.inc(1);
        }
        (delta, write_failures)
    }

    /// Geocodes and writes one record. Returns `None` if the record left
    /// `pending` elsewhere (a cancellation sweep) before its outcome was
    /// written.
    async fn resolve(&self, record: &ImportedRecord) -> Result<Option<JobStatsDelta>, ImportError> {
        let outcome = geocode_one(
            self.geocoder.as_ref(),
            &self.config,
            &record.name,
            &record.raw_address,
        )
        .await;

        let still_pending = self
            .store
            .get_record(record.id)
            .await?
            .is_some_and(|r| r.address_match_quality == AddressMatchQuality::Pending);
        if !still_pending {
            return Ok(None);
        }

        if let Some((location, slug)) = &outcome.location {
            self.store
                .update_facility_location(record.facility_id, location, slug)
                .await?;
        }

        if self.store.resolve_record(record.id, &outcome.resolution).await? {
            Ok(Some(outcome.delta()))
        } else {
            Ok(None)
        }
    }
}
