//! In-process [`ImportStore`].
//!
//! All state lives behind one `RwLock`, so every trait method is atomic
//! with respect to the others. A commit failure can be armed with
//! [`MemoryStore::fail_next_commit`] to exercise the batch-abort path.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use facility_import_models::{
    Facility, FacilityLocation, ImportJob, ImportJobStatus, ImportedRecord, JobStatsDelta,
    RecordResolution,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{BatchWrite, ImportStore, RecordQuery, StoreError, ensure_resolved};

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<Uuid, ImportJob>,
    facilities: BTreeMap<Uuid, Facility>,
    records: BTreeMap<Uuid, ImportedRecord>,
    fail_next_commit: Option<String>,
}

/// Import store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next [`ImportStore::commit_batch`] fail with `message`
    /// without writing anything.
    pub async fn fail_next_commit(&self, message: impl Into<String>) {
        self.state.write().await.fail_next_commit = Some(message.into());
    }

    /// Number of stored facilities.
    pub async fn facility_count(&self) -> usize {
        self.state.read().await.facilities.len()
    }

    /// Number of stored tracking records.
    pub async fn record_count(&self) -> usize {
        self.state.read().await.records.len()
    }
}

fn check_batch(state: &State, writes: &[BatchWrite]) -> Result<(), StoreError> {
    let mut facility_ids = std::collections::BTreeSet::new();
    let mut record_ids = std::collections::BTreeSet::new();

    for write in writes {
        if let BatchWrite::CreateFacility(facility) = write {
            if state.facilities.contains_key(&facility.id) || !facility_ids.insert(facility.id) {
                return Err(StoreError::Conflict {
                    message: format!("duplicate facility id {}", facility.id),
                });
            }
        }
    }

    for write in writes {
        if let BatchWrite::CreateRecord(record) = write {
            if state.records.contains_key(&record.id) || !record_ids.insert(record.id) {
                return Err(StoreError::Conflict {
                    message: format!("duplicate record id {}", record.id),
                });
            }
            if !facility_ids.contains(&record.facility_id)
                && !state.facilities.contains_key(&record.facility_id)
            {
                return Err(StoreError::Conflict {
                    message: format!(
                        "record {} links to unknown facility {}",
                        record.id, record.facility_id
                    ),
                });
            }
        }
    }

    Ok(())
}

#[async_trait]
impl ImportStore for MemoryStore {
    async fn insert_job(&self, job: &ImportJob) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict {
                message: format!("duplicate job id {}", job.id),
            });
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ImportJob>, StoreError> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<ImportJob>, StoreError> {
        let mut jobs: Vec<ImportJob> = self.state.read().await.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn transition_job(
        &self,
        id: Uuid,
        from: ImportJobStatus,
        to: ImportJobStatus,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(StoreError::Missing { entity: "job", id })?;

        if job.status != from {
            log::debug!(
                "Job {id}: {from} -> {to} rejected, job is {}",
                job.status
            );
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
        Ok(true)
    }

    async fn increment_job_stats(
        &self,
        id: Uuid,
        delta: &JobStatsDelta,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(StoreError::Missing { entity: "job", id })?;
        delta.apply_to(&mut job.stats);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn set_total_records(&self, id: Uuid, total_records: u64) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(StoreError::Missing { entity: "job", id })?;
        job.stats.total_records = total_records;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn commit_batch(&self, writes: Vec<BatchWrite>) -> Result<(), StoreError> {
        let mut state = self.state.write().await;

        if let Some(message) = state.fail_next_commit.take() {
            log::warn!("Rejecting batch of {} writes: {message}", writes.len());
            return Err(StoreError::Backend { message });
        }

        check_batch(&state, &writes)?;
        log::debug!("Committing batch of {} writes", writes.len());

        for write in writes {
            match write {
                BatchWrite::CreateFacility(facility) => {
                    state.facilities.insert(facility.id, facility);
                }
                BatchWrite::CreateRecord(record) => {
                    state.records.insert(record.id, record);
                }
            }
        }

        Ok(())
    }

    async fn get_facility(&self, id: Uuid) -> Result<Option<Facility>, StoreError> {
        Ok(self.state.read().await.facilities.get(&id).cloned())
    }

    async fn update_facility_location(
        &self,
        id: Uuid,
        location: &FacilityLocation,
        slug: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let facility = state.facilities.get_mut(&id).ok_or(StoreError::Missing {
            entity: "facility",
            id,
        })?;
        facility.location = location.clone();
        slug.clone_into(&mut facility.slug);
        facility.updated_at = Utc::now();
        Ok(())
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<ImportedRecord>, StoreError> {
        Ok(self.state.read().await.records.get(&id).cloned())
    }

    async fn query_records(&self, query: &RecordQuery) -> Result<Vec<ImportedRecord>, StoreError> {
        let mut records: Vec<ImportedRecord> = self
            .state
            .read()
            .await
            .records
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.row_number.cmp(&b.row_number))
        });
        Ok(records)
    }

    async fn resolve_record(
        &self,
        id: Uuid,
        resolution: &RecordResolution,
    ) -> Result<bool, StoreError> {
        ensure_resolved(resolution)?;
        let mut state = self.state.write().await;
        let record = state.records.get_mut(&id).ok_or(StoreError::Missing {
            entity: "record",
            id,
        })?;

        if record.address_match_quality.is_resolved() {
            return Ok(false);
        }

        record.apply(resolution);
        Ok(true)
    }

    async fn correct_record(
        &self,
        id: Uuid,
        raw_address: &str,
        resolution: &RecordResolution,
    ) -> Result<(), StoreError> {
        ensure_resolved(resolution)?;
        let mut state = self.state.write().await;
        let record = state.records.get_mut(&id).ok_or(StoreError::Missing {
            entity: "record",
            id,
        })?;
        raw_address.clone_into(&mut record.raw_address);
        record.apply(resolution);
        Ok(())
    }
}
