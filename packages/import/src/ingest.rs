//! Bulk record ingestion (the `importing` phase).
//!
//! Each validated row becomes a facility with placeholder location fields
//! and a pending tracking record. Rows are prepared individually, so a row
//! that cannot be turned into a facility is counted as failed without
//! affecting the others, and all prepared pairs are written in one atomic
//! batch.

use std::sync::Arc;

use chrono::Utc;
use facility_database::{BatchWrite, ImportStore};
use facility_import_models::{
    AddressMatchQuality, Facility, FacilityLocation, ImportJobStatus, ImportRow, ImportedRecord,
    JobStatsDelta,
};
use uuid::Uuid;

use crate::controller::JobController;
use crate::outcome::{ItemOutcome, isolate, tally};
use crate::slug::slugify;
use crate::{ImportError, RowViolation, ValidationError};

/// A row that passed [`validate_rows`]. Ingestion only accepts these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRow {
    row_number: u64,
    name: String,
    website: Option<String>,
    raw_address: String,
}

impl ValidatedRow {
    /// 1-based position in the upload.
    #[must_use]
    pub const fn row_number(&self) -> u64 {
        self.row_number
    }

    /// Trimmed facility name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Website, if one was supplied.
    #[must_use]
    pub fn website(&self) -> Option<&str> {
        self.website.as_deref()
    }

    /// Trimmed free-text address.
    #[must_use]
    pub fn raw_address(&self) -> &str {
        &self.raw_address
    }
}

/// Checks the upload contract: non-empty name and address, and a
/// well-formed `http(s)` URL when a website is given.
///
/// Every violation across every row is collected before failing.
///
/// # Errors
///
/// Returns a [`ValidationError`] listing all violations.
pub fn validate_rows(rows: Vec<ImportRow>) -> Result<Vec<ValidatedRow>, ValidationError> {
    let mut violations = Vec::new();
    let mut validated = Vec::with_capacity(rows.len());

    for (row_number, row) in (1_u64..).zip(rows) {
        let name = row.name.trim().to_string();
        let raw_address = row.raw_address.trim().to_string();
        let website = row
            .website
            .map(|w| w.trim().to_string())
            .filter(|w| !w.is_empty());

        if name.is_empty() {
            violations.push(violation(row_number, "name", "is required"));
        }
        if raw_address.is_empty() {
            violations.push(violation(row_number, "address", "is required"));
        }
        if let Some(website) = &website {
            if !is_web_url(website) {
                violations.push(violation(
                    row_number,
                    "website",
                    format!("is not a valid URL: {website}"),
                ));
            }
        }

        validated.push(ValidatedRow {
            row_number,
            name,
            website,
            raw_address,
        });
    }

    if violations.is_empty() {
        Ok(validated)
    } else {
        Err(ValidationError { violations })
    }
}

fn violation(row: u64, field: &'static str, message: impl Into<String>) -> RowViolation {
    RowViolation {
        row,
        field,
        message: message.into(),
    }
}

fn is_web_url(value: &str) -> bool {
    reqwest::Url::parse(value)
        .is_ok_and(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
}

/// Counts from one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Rows written as facility/record pairs.
    pub prepared: u64,
    /// Rows that could not be prepared.
    pub failed: u64,
    /// The job was cancelled before it could move on to geocoding.
    pub cancelled: bool,
}

/// Runs the importing phase of a job.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn ImportStore>,
    controller: JobController,
}

impl Ingestor {
    /// Creates an ingestor writing through `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ImportStore>) -> Self {
        let controller = JobController::new(Arc::clone(&store));
        Self { store, controller }
    }

    /// Moves a pending job through `importing` and on to `geocoding`.
    ///
    /// If the row count differs from the job's announced total, the total
    /// is corrected first so `processed + failed == total` holds afterwards.
    /// An empty row set skips the batch write and still moves on.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::InvalidState`] if the job is not pending.
    /// A failed batch commit writes nothing, fails the job with the
    /// underlying error, and returns [`ImportError::Persistence`].
    pub async fn ingest_rows(
        &self,
        job_id: Uuid,
        rows: &[ValidatedRow],
    ) -> Result<IngestSummary, ImportError> {
        if !self
            .controller
            .advance(
                job_id,
                ImportJobStatus::Pending,
                ImportJobStatus::Importing,
                "import",
            )
            .await?
        {
            return Ok(IngestSummary {
                cancelled: true,
                ..IngestSummary::default()
            });
        }

        log::info!("Import job {job_id}: importing {} rows", rows.len());
        let result = self.write_rows(job_id, rows).await;
        self.controller.fail_on_error(job_id, result).await
    }

    async fn write_rows(
        &self,
        job_id: Uuid,
        rows: &[ValidatedRow],
    ) -> Result<IngestSummary, ImportError> {
        let row_count = rows.len() as u64;
        let announced = self.controller.get_job(job_id).await?.stats.total_records;
        if announced != row_count {
            self.controller
                .set_total_records(job_id, announced, row_count)
                .await?;
        }

        let outcomes: Vec<ItemOutcome<(Facility, ImportedRecord)>> = rows
            .iter()
            .map(|row| isolate(format!("Row {}", row.row_number), prepare_row(job_id, row)))
            .collect();
        let (prepared, failed) = tally(&outcomes);

        let writes: Vec<BatchWrite> = outcomes
            .into_iter()
            .filter_map(ItemOutcome::ok)
            .flat_map(|(facility, record)| {
                [
                    BatchWrite::CreateFacility(facility),
                    BatchWrite::CreateRecord(record),
                ]
            })
            .collect();

        if writes.is_empty() {
            log::info!("Import job {job_id}: no rows to write");
        } else {
            self.store.commit_batch(writes).await?;
        }

        self.controller
            .record_stats(
                job_id,
                &JobStatsDelta {
                    processed_records: prepared,
                    failed_records: failed,
                    ..JobStatsDelta::default()
                },
            )
            .await?;

        log::info!("Import job {job_id}: {prepared} rows imported, {failed} failed");

        let advanced = self
            .controller
            .advance(
                job_id,
                ImportJobStatus::Importing,
                ImportJobStatus::Geocoding,
                "finish importing",
            )
            .await?;

        if !advanced {
            // Cancelled while importing: the cancel's own sweep may have run
            // before these records were committed.
            let swept = self.controller.sweep_pending(job_id).await?;
            log::warn!("Import job {job_id}: cancelled during import, {swept} records unresolved");
        }

        Ok(IngestSummary {
            prepared,
            failed,
            cancelled: !advanced,
        })
    }
}

/// Builds the facility and tracking record for one row.
///
/// # Errors
///
/// Returns a [`ValidationError`] if the name yields an empty slug.
fn prepare_row(
    job_id: Uuid,
    row: &ValidatedRow,
) -> Result<(Facility, ImportedRecord), ValidationError> {
    let slug = slugify(&[row.name.as_str()]);
    if slug.is_empty() {
        return Err(ValidationError::single(
            row.row_number,
            "name",
            format!("'{}' has no characters usable in a slug", row.name),
        ));
    }

    let now = Utc::now();
    let facility = Facility {
        id: Uuid::new_v4(),
        name: row.name.clone(),
        website: row.website.clone(),
        slug,
        location: FacilityLocation::placeholder(),
        created_at: now,
        updated_at: now,
    };
    let record = ImportedRecord {
        id: Uuid::new_v4(),
        job_id,
        facility_id: facility.id,
        row_number: row.row_number,
        name: row.name.clone(),
        website: row.website.clone(),
        raw_address: row.raw_address.clone(),
        address_match_quality: AddressMatchQuality::Pending,
        needs_review: false,
        geocoding_error: None,
        processed_at: None,
        created_at: now,
    };
    Ok((facility, record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{CANCELLED_MESSAGE, stats_consistent};
    use crate::test_support::{HookedStore, StoreCall, store};
    use facility_database::RecordQuery;
    use facility_database::memory::MemoryStore;

    fn row(name: &str, website: Option<&str>, address: &str) -> ImportRow {
        ImportRow {
            name: name.to_string(),
            website: website.map(ToString::to_string),
            raw_address: address.to_string(),
        }
    }

    fn valid(rows: Vec<ImportRow>) -> Vec<ValidatedRow> {
        validate_rows(rows).unwrap()
    }

    #[test]
    fn validation_reports_every_violation() {
        let err = validate_rows(vec![
            row("", None, "1 Main St"),
            row("Clinic", Some("https://clinic.example"), "2 Main St"),
            row("Other", Some("not a url"), "  "),
        ])
        .unwrap_err();

        let found: Vec<(u64, &str)> = err.violations.iter().map(|v| (v.row, v.field)).collect();
        assert_eq!(found, vec![(1, "name"), (3, "address"), (3, "website")]);
    }

    #[test]
    fn validation_trims_and_drops_blank_websites() {
        let rows = valid(vec![row("  Clinic ", Some("  "), " 1 Main St ")]);
        assert_eq!(rows[0].name(), "Clinic");
        assert_eq!(rows[0].raw_address(), "1 Main St");
        assert_eq!(rows[0].website(), None);
        assert_eq!(rows[0].row_number(), 1);
    }

    #[test]
    fn only_web_urls_are_accepted() {
        assert!(is_web_url("https://clinic.example/about"));
        assert!(is_web_url("http://clinic.example"));
        assert!(!is_web_url("ftp://clinic.example"));
        assert!(!is_web_url("mailto:front-desk@clinic.example"));
        assert!(!is_web_url("clinic.example"));
    }

    #[tokio::test]
    async fn ingests_pairs_and_moves_to_geocoding() {
        let store = store();
        let controller = JobController::new(store.clone());
        let ingestor = Ingestor::new(store.clone());
        let job_id = controller.create_job("clinics.csv", "u", 2).await.unwrap();

        let rows = valid(vec![
            row("North Clinic", Some("https://north.example"), "1 Main St"),
            row("South Clinic", None, "2 Main St"),
        ]);
        let summary = ingestor.ingest_rows(job_id, &rows).await.unwrap();
        assert_eq!(summary.prepared, 2);
        assert_eq!(summary.failed, 0);
        assert!(!summary.cancelled);

        let job = controller.get_job(job_id).await.unwrap();
        assert_eq!(job.status, ImportJobStatus::Geocoding);
        assert_eq!(job.stats.processed_records, 2);
        assert!(stats_consistent(&job));

        let records = store.query_records(&RecordQuery::for_job(job_id)).await.unwrap();
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.address_match_quality, AddressMatchQuality::Pending);
            assert!(!record.needs_review);

            let facility = store.get_facility(record.facility_id).await.unwrap().unwrap();
            assert_eq!(facility.name, record.name);
            assert_eq!(facility.location, FacilityLocation::placeholder());
        }
        assert_eq!(records[0].website.as_deref(), Some("https://north.example"));
        assert_eq!(store.facility_count().await, 2);
    }

    #[tokio::test]
    async fn unpreparable_row_is_counted_not_fatal() {
        let store = store();
        let controller = JobController::new(store.clone());
        let ingestor = Ingestor::new(store.clone());
        let job_id = controller.create_job("clinics.csv", "u", 3).await.unwrap();

        let rows = valid(vec![
            row("North Clinic", None, "1 Main St"),
            row("!!!", None, "2 Main St"),
            row("South Clinic", None, "3 Main St"),
        ]);
        let summary = ingestor.ingest_rows(job_id, &rows).await.unwrap();
        assert_eq!((summary.prepared, summary.failed), (2, 1));

        let job = controller.get_job(job_id).await.unwrap();
        assert_eq!(job.stats.processed_records, 2);
        assert_eq!(job.stats.failed_records, 1);
        assert!(stats_consistent(&job));
        assert_eq!(job.status, ImportJobStatus::Geocoding);
        assert_eq!(store.record_count().await, 2);
    }

    #[tokio::test]
    async fn commit_failure_writes_nothing_and_fails_job() {
        let store = store();
        let controller = JobController::new(store.clone());
        let ingestor = Ingestor::new(store.clone());
        let job_id = controller.create_job("clinics.csv", "u", 2).await.unwrap();
        store.fail_next_commit("disk full").await;

        let rows = valid(vec![
            row("North Clinic", None, "1 Main St"),
            row("South Clinic", None, "2 Main St"),
        ]);
        let err = ingestor.ingest_rows(job_id, &rows).await.unwrap_err();
        assert!(matches!(err, ImportError::Persistence(_)));

        let job = controller.get_job(job_id).await.unwrap();
        assert_eq!(job.status, ImportJobStatus::Failed);
        assert!(job.error.unwrap().contains("disk full"));
        assert_eq!(job.stats.processed_records, 0);
        assert_eq!(store.facility_count().await, 0);
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn empty_upload_still_reaches_geocoding() {
        let store = store();
        let controller = JobController::new(store.clone());
        let ingestor = Ingestor::new(store);
        let job_id = controller.create_job("empty.csv", "u", 0).await.unwrap();

        let summary = ingestor.ingest_rows(job_id, &[]).await.unwrap();
        assert_eq!(summary, IngestSummary::default());
        let job = controller.get_job(job_id).await.unwrap();
        assert_eq!(job.status, ImportJobStatus::Geocoding);
    }

    #[tokio::test]
    async fn mismatched_total_is_corrected() {
        let store = store();
        let controller = JobController::new(store.clone());
        let ingestor = Ingestor::new(store);
        let job_id = controller.create_job("clinics.csv", "u", 5).await.unwrap();

        let rows = valid(vec![row("North Clinic", None, "1 Main St")]);
        ingestor.ingest_rows(job_id, &rows).await.unwrap();

        let job = controller.get_job(job_id).await.unwrap();
        assert_eq!(job.stats.total_records, 1);
        assert!(stats_consistent(&job));
    }

    async fn assert_cancelled_with_nothing_pending(store: &Arc<MemoryStore>, job_id: Uuid) {
        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, ImportJobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(CANCELLED_MESSAGE));

        let records = store.query_records(&RecordQuery::for_job(job_id)).await.unwrap();
        assert!(!records.is_empty());
        for record in records {
            assert_eq!(record.address_match_quality, AddressMatchQuality::None);
            assert!(record.needs_review);
            assert_eq!(record.geocoding_error.as_deref(), Some(CANCELLED_MESSAGE));
        }
    }

    #[tokio::test]
    async fn cancel_before_commit_still_sweeps_new_records() {
        let inner = store();
        let controller = JobController::new(inner.clone());
        let job_id = controller.create_job("clinics.csv", "u", 2).await.unwrap();
        let hooked = HookedStore::new(inner.clone()).cancel_before(StoreCall::CommitBatch, job_id);

        let rows = valid(vec![
            row("North Clinic", None, "1 Main St"),
            row("South Clinic", None, "2 Main St"),
        ]);
        let summary = Ingestor::new(Arc::new(hooked))
            .ingest_rows(job_id, &rows)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(inner.record_count().await, 2);
        assert_cancelled_with_nothing_pending(&inner, job_id).await;
    }

    #[tokio::test]
    async fn total_correction_does_not_undo_a_cancel() {
        let inner = store();
        let controller = JobController::new(inner.clone());
        let job_id = controller.create_job("clinics.csv", "u", 5).await.unwrap();
        let hooked =
            HookedStore::new(inner.clone()).cancel_before(StoreCall::SetTotalRecords, job_id);

        let rows = valid(vec![row("North Clinic", None, "1 Main St")]);
        let summary = Ingestor::new(Arc::new(hooked))
            .ingest_rows(job_id, &rows)
            .await
            .unwrap();

        assert!(summary.cancelled);
        let job = controller.get_job(job_id).await.unwrap();
        assert_eq!(job.stats.total_records, 1);
        assert_cancelled_with_nothing_pending(&inner, job_id).await;
    }

    #[tokio::test]
    async fn only_pending_jobs_are_ingested() {
        let store = store();
        let controller = JobController::new(store.clone());
        let ingestor = Ingestor::new(store);
        let job_id = controller.create_job("clinics.csv", "u", 0).await.unwrap();
        ingestor.ingest_rows(job_id, &[]).await.unwrap();

        assert!(matches!(
            ingestor.ingest_rows(job_id, &[]).await,
            Err(ImportError::InvalidState {
                status: ImportJobStatus::Geocoding,
                ..
            })
        ));
    }
}
