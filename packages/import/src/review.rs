//! Manual review queue.
//!
//! Records resolved as `partial` or `none` are flagged for review. The
//! queue lists them and lets a reviewer resubmit a corrected address,
//! which is geocoded with the same per-record logic as the batch
//! processor. Partial matches stay published while flagged; hiding them is
//! up to the consuming application.

use std::sync::Arc;

use facility_database::{ImportStore, RecordQuery};
use facility_geocoder::Geocoder;
use facility_import_models::{AddressMatchQuality, ImportedRecord};
use uuid::Uuid;

use crate::config::ProcessorConfig;
use crate::controller::JobController;
use crate::processor::geocode_one;
use crate::{ImportError, ValidationError};

/// Record counts for one job, by match quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReviewSummary {
    /// All tracking records of the job.
    pub total: u64,
    /// Not attempted yet.
    pub pending: u64,
    /// Confident matches.
    pub exact: u64,
    /// Approximate matches.
    pub partial: u64,
    /// Not found, provider error, or cancelled.
    pub unresolved: u64,
    /// Records flagged for review (`partial + unresolved`).
    pub needs_review: u64,
}

/// Read view over flagged records, plus the correction entry point.
#[derive(Clone)]
pub struct ReviewQueue {
    store: Arc<dyn ImportStore>,
    geocoder: Arc<dyn Geocoder>,
    controller: JobController,
    config: Arc<ProcessorConfig>,
}

impl ReviewQueue {
    /// Creates a queue over `store`; resubmissions go through `geocoder`.
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
        }
    }

    /// Records flagged for review, oldest first, optionally for one job.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::NotFound`] for an unknown job, or
    /// [`ImportError::Persistence`].
    pub async fn list(&self, job_id: Option<Uuid>) -> Result<Vec<ImportedRecord>, ImportError> {
        if let Some(job_id) = job_id {
            self.controller.get_job(job_id).await?;
        }
        Ok(self
            .store
            .query_records(&RecordQuery::needing_review(job_id))
            .await?)
    }

    /// Counts a job's records by match quality.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::NotFound`] for an unknown job, or
    /// [`ImportError::Persistence`].
    pub async fn summary(&self, job_id: Uuid) -> Result<ReviewSummary, ImportError> {
        self.controller.get_job(job_id).await?;
        let records = self.store.query_records(&RecordQuery::for_job(job_id)).await?;

        let mut summary = ReviewSummary::default();
        for record in &records {
            summary.total += 1;
            match record.address_match_quality {
                AddressMatchQuality::Pending => summary.pending += 1,
                AddressMatchQuality::Exact => summary.exact += 1,
                AddressMatchQuality::Partial => summary.partial += 1,
                AddressMatchQuality::None => summary.unresolved += 1,
            }
            if record.needs_review {
                summary.needs_review += 1;
            }
        }
        Ok(summary)
    }

    /// Geocodes `corrected_address` for a flagged record and stores the
    /// new outcome along with the corrected address.
    ///
    /// An exact match clears the review flag and updates the facility
    /// location; a partial match updates the location but stays flagged;
    /// no match keeps the facility as it was. Job counters describe the
    /// original run and are not changed.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Validation`] for a blank address,
    /// [`ImportError::NotFound`] for an unknown record,
    /// [`ImportError::NotInReview`] if the record is not flagged, or
    /// [`ImportError::Persistence`].
    pub async fn resubmit(
        &self,
        record_id: Uuid,
        corrected_address: &str,
    ) -> Result<ImportedRecord, ImportError> {
        let record = self.require_record(record_id).await?;
        let corrected_address = corrected_address.trim();
        if corrected_address.is_empty() {
            return Err(ValidationError::single(record.row_number, "address", "is required").into());
        }
        if !record.needs_review {
            return Err(ImportError::NotInReview { record_id });
        }

        let outcome = geocode_one(
            self.geocoder.as_ref(),
            &self.config,
            &record.name,
            corrected_address,
        )
        .await;

        if let Some((location, slug)) = &outcome.location {
            self.store
                .update_facility_location(record.facility_id, location, slug)
                .await?;
        }
        self.store
            .correct_record(record_id, corrected_address, &outcome.resolution)
            .await?;

        log::info!(
            "Record {record_id} resubmitted with corrected address: {}",
            outcome.resolution.quality
        );

        self.require_record(record_id).await
    }

    async fn require_record(&self, record_id: Uuid) -> Result<ImportedRecord, ImportError> {
        self.store
            .get_record(record_id)
            .await?
            .ok_or(ImportError::NotFound {
                entity: "record",
                id: record_id,
            })
    }
}
