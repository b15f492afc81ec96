//! Fakes shared by the pipeline tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use facility_database::memory::MemoryStore;
use facility_database::{BatchWrite, ImportStore, RecordQuery, StoreError};
use facility_geocoder::address::{ADMIN_AREA_LEVEL_1, LOCALITY};
use facility_geocoder::{AddressComponent, GeocodeCandidate, GeocodeError, GeocodeRequest, Geocoder};
use facility_import_models::{
    AddressMatchQuality, Coordinates, Facility, FacilityLocation, ImportJob, ImportJobStatus,
    ImportedRecord, JobStatsDelta, RecordResolution,
};
use tokio::time::Instant;
use uuid::Uuid;

use crate::controller::JobController;

pub const CUPERTINO: &str = "1 Infinite Loop, Cupertino, CA";
pub const NONSENSE: &str = "asdkfj not a real place";

pub fn store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

/// A facility with placeholder location and its pending tracking record.
pub fn pair(job_id: Uuid, row_number: u64, address: &str) -> (Facility, ImportedRecord) {
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
        raw_address: address.to_string(),
        address_match_quality: AddressMatchQuality::Pending,
        needs_review: false,
        geocoding_error: None,
        processed_at: None,
        created_at: now,
    };
    (facility, record)
}

/// Inserts a job already in `status` with one pending record per address.
pub async fn job_with_addresses<S: AsRef<str>>(
    store: &Arc<MemoryStore>,
    status: ImportJobStatus,
    addresses: &[S],
) -> (Uuid, Vec<ImportedRecord>) {
    let mut job = ImportJob::new("seed.csv", "tester", addresses.len() as u64);
    job.status = status;
    store.insert_job(&job).await.unwrap();

    let mut writes = Vec::new();
    let mut records = Vec::new();
    for (row_number, address) in (1_u64..).zip(addresses) {
        let (facility, record) = pair(job.id, row_number, address.as_ref());
        writes.push(BatchWrite::CreateFacility(facility));
        writes.push(BatchWrite::CreateRecord(record.clone()));
        records.push(record);
    }
    if !writes.is_empty() {
        store.commit_batch(writes).await.unwrap();
    }
    (job.id, records)
}

/// Inserts a job already in `status` with `count` pending records.
pub async fn pending_job(
    store: &Arc<MemoryStore>,
    status: ImportJobStatus,
    count: u64,
) -> (Uuid, Vec<ImportedRecord>) {
    let addresses: Vec<String> = (1..=count)
        .map(|n| format!("{n} Main St, Springfield, IL"))
        .collect();
    job_with_addresses(store, status, &addresses).await
}

/// A scripted reply for one address.
#[derive(Debug, Clone)]
pub enum Reply {
    Exact,
    Partial,
    NotFound,
    Error(String),
}

/// A geocode call as seen by [`ScriptedGeocoder`].
#[derive(Debug, Clone)]
pub struct Call {
    pub address: String,
    pub region: Option<String>,
    pub at: Instant,
}

/// Geocoder answering from a script. Unscripted addresses are exact
/// matches in Springfield, IL.
#[derive(Default)]
pub struct ScriptedGeocoder {
    replies: BTreeMap<String, Reply>,
    calls: Mutex<Vec<Call>>,
    missing_key: bool,
    cancel_on_call: Option<(usize, JobController, Uuid)>,
}

impl ScriptedGeocoder {
    pub fn new() -> Self {
        Self::default()
            .reply(CUPERTINO, Reply::Exact)
            .reply(NONSENSE, Reply::NotFound)
    }

    pub fn reply(mut self, address: &str, reply: Reply) -> Self {
        self.replies.insert(address.to_string(), reply);
        self
    }

    pub fn without_key(mut self) -> Self {
        self.missing_key = true;
        self
    }

    /// Cancels `job_id` from inside the `n`th call (1-based).
    pub fn cancel_on_call(mut self, n: usize, controller: JobController, job_id: Uuid) -> Self {
        self.cancel_on_call = Some((n, controller, job_id));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls issued at each distinct instant, in order.
    pub fn batch_sizes(&self) -> Vec<(Instant, usize)> {
        let mut batches: Vec<(Instant, usize)> = Vec::new();
        for call in self.calls() {
            match batches.last_mut() {
                Some((at, size)) if *at == call.at => *size += 1,
                _ => batches.push((call.at, 1)),
            }
        }
        batches
    }
}

pub fn candidate(formatted: &str, city: &str, state: &str, approximate: bool) -> GeocodeCandidate {
    GeocodeCandidate {
        formatted_address: formatted.to_string(),
        coordinates: Coordinates {
            latitude: 37.331_7,
            longitude: -122.030_2,
        },
        approximate,
        components: vec![
            AddressComponent::new(city, city, &[LOCALITY, "political"]),
            AddressComponent::new("Full State Name", state, &[ADMIN_AREA_LEVEL_1, "political"]),
        ],
    }
}

#[async_trait]
impl Geocoder for ScriptedGeocoder {
    fn name(&self) -> &str {
        "scripted"
    }

    fn check_ready(&self) -> Result<(), GeocodeError> {
        if self.missing_key {
            Err(GeocodeError::MissingCredentials {
                provider: "scripted".to_string(),
            })
        } else {
            Ok(())
        }
    }

    async fn geocode(&self, request: &GeocodeRequest) -> Result<Vec<GeocodeCandidate>, GeocodeError> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                address: request.address.clone(),
                region: request.region.clone(),
                at: Instant::now(),
            });
            calls.len()
        };

        if let Some((n, controller, job_id)) = &self.cancel_on_call {
            if *n == call_number {
                controller.cancel_job(*job_id).await.unwrap();
            }
        }

        match self.replies.get(&request.address) {
            Some(Reply::Exact) if request.address == CUPERTINO => Ok(vec![candidate(
                "1 Infinite Loop, Cupertino, CA 95014, USA",
                "Cupertino",
                "CA",
                false,
            )]),
            Some(Reply::Exact) | None => Ok(vec![candidate(
                &format!("{}, USA", request.address),
                "Springfield",
                "IL",
                false,
            )]),
            Some(Reply::Partial) => Ok(vec![
                candidate("Springfield, IL, USA", "Springfield", "IL", true),
                candidate("Springfield, MO, USA", "Springfield", "MO", false),
            ]),
            Some(Reply::NotFound) => Ok(Vec::new()),
            Some(Reply::Error(message)) => Err(GeocodeError::Provider {
                status: "UNKNOWN_ERROR".to_string(),
                message: message.clone(),
            }),
        }
    }
}

/// Store operations [`HookedStore`] can intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCall {
    CommitBatch,
    SetTotalRecords,
    IncrementStats,
    ResolveRecord,
}

/// Wraps a [`MemoryStore`] and, once per armed hook, cancels a job or
/// fails the call just before it reaches the inner store.
pub struct HookedStore {
    inner: Arc<MemoryStore>,
    cancel_before: Mutex<Option<(StoreCall, Uuid)>>,
    fail_once: Mutex<Option<StoreCall>>,
}

impl HookedStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            cancel_before: Mutex::new(None),
            fail_once: Mutex::new(None),
        }
    }

    /// Cancels `job_id` right before the next `call`.
    pub fn cancel_before(self, call: StoreCall, job_id: Uuid) -> Self {
        *self.cancel_before.lock().unwrap() = Some((call, job_id));
        self
    }

    /// Fails the next `call` with a backend error.
    pub fn fail_once(self, call: StoreCall) -> Self {
        *self.fail_once.lock().unwrap() = Some(call);
        self
    }

    async fn intercept(&self, call: StoreCall) -> Result<(), StoreError> {
        let cancel = {
            let mut armed = self.cancel_before.lock().unwrap();
            if armed.is_some_and(|(c, _)| c == call) {
                armed.take()
            } else {
                None
            }
        };
        if let Some((_, job_id)) = cancel {
            JobController::new(self.inner.clone())
                .cancel_job(job_id)
                .await
                .unwrap();
        }

        let fail = {
            let mut armed = self.fail_once.lock().unwrap();
            if *armed == Some(call) {
                armed.take()
            } else {
                None
            }
        };
        match fail {
            Some(call) => Err(StoreError::Backend {
                message: format!("{call:?} unavailable"),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ImportStore for HookedStore {
    async fn insert_job(&self, job: &ImportJob) -> Result<(), StoreError> {
        self.inner.insert_job(job).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ImportJob>, StoreError> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self) -> Result<Vec<ImportJob>, StoreError> {
        self.inner.list_jobs().await
    }

    async fn transition_job(
        &self,
        id: Uuid,
        from: ImportJobStatus,
        to: ImportJobStatus,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        self.inner.transition_job(id, from, to, error).await
    }

    async fn increment_job_stats(
        &self,
        id: Uuid,
        delta: &JobStatsDelta,
    ) -> Result<(), StoreError> {
        self.intercept(StoreCall::IncrementStats).await?;
        self.inner.increment_job_stats(id, delta).await
    }

    async fn set_total_records(&self, id: Uuid, total_records: u64) -> Result<(), StoreError> {
        self.intercept(StoreCall::SetTotalRecords).await?;
        self.inner.set_total_records(id, total_records).await
    }

    async fn commit_batch(&self, writes: Vec<BatchWrite>) -> Result<(), StoreError> {
        self.intercept(StoreCall::CommitBatch).await?;
        self.inner.commit_batch(writes).await
    }

    async fn get_facility(&self, id: Uuid) -> Result<Option<Facility>, StoreError> {
        self.inner.get_facility(id).await
    }

    async fn update_facility_location(
        &self,
        id: Uuid,
        location: &FacilityLocation,
        slug: &str,
    ) -> Result<(), StoreError> {
        self.inner.update_facility_location(id, location, slug).await
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<ImportedRecord>, StoreError> {
        self.inner.get_record(id).await
    }

    async fn query_records(&self, query: &RecordQuery) -> Result<Vec<ImportedRecord>, StoreError> {
        self.inner.query_records(query).await
    }

    async fn resolve_record(
        &self,
        id: Uuid,
        resolution: &RecordResolution,
    ) -> Result<bool, StoreError> {
        self.intercept(StoreCall::ResolveRecord).await?;
        self.inner.resolve_record(id, resolution).await
    }

    async fn correct_record(
        &self,
        id: Uuid,
        raw_address: &str,
        resolution: &RecordResolution,
    ) -> Result<(), StoreError> {
        self.inner.correct_record(id, raw_address, resolution).await
    }
}
