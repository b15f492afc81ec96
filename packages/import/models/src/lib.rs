#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Import job, tracking record, and facility types for the bulk import
//! pipeline.
//!
//! These types are shared by the persistence layer and the pipeline. They
//! carry no I/O; the only behavior here is the status state machine and the
//! derived review flag, so that every writer agrees on both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Lifecycle state of an [`ImportJob`].
///
/// Transitions are linear and one-way:
/// `Pending -> Importing -> Geocoding -> Completed`, with `Failed`
/// reachable from any non-terminal state.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ImportJobStatus {
    /// Created, nothing written yet.
    Pending,
    /// Facility and tracking records are being created.
    Importing,
    /// Addresses are being resolved.
    Geocoding,
    /// All pending addresses were attempted.
    Completed,
    /// The run stopped on an unrecoverable error or was cancelled.
    Failed,
}

impl ImportJobStatus {
    /// Returns `true` if the job may move from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Importing | Self::Failed)
                | (Self::Importing, Self::Geocoding | Self::Failed)
                | (Self::Geocoding, Self::Completed | Self::Failed)
        )
    }

    /// Returns `true` for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns `true` while one of the two pipeline phases is running.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Importing | Self::Geocoding)
    }
}

/// Classification of a geocoding result for one imported record.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AddressMatchQuality {
    /// Not attempted yet.
    Pending,
    /// The provider returned a confident match.
    Exact,
    /// The provider's best match is approximate.
    Partial,
    /// No usable match (not found, provider error, or cancelled).
    None,
}

impl AddressMatchQuality {
    /// Whether a record with this quality belongs in the review queue.
    #[must_use]
    pub const fn needs_review(self) -> bool {
        matches!(self, Self::Partial | Self::None)
    }

    /// Returns `true` once the record has left `Pending`.
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Aggregate progress counters for an [`ImportJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    /// Number of rows submitted with the upload.
    pub total_records: u64,
    /// Rows turned into facility/tracking record pairs.
    pub processed_records: u64,
    /// Rows that could not be prepared during ingestion.
    pub failed_records: u64,
    /// Addresses resolved to an exact or partial match.
    pub geocoded_addresses: u64,
    /// Subset of `geocoded_addresses` that were approximate.
    pub partial_matches: u64,
    /// Addresses that were not found or hit a provider error.
    pub failed_geocoding: u64,
    /// When the job was submitted.
    pub started_at: DateTime<Utc>,
    /// When the job reached `Completed`.
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobStats {
    /// Zeroed stats for a job of `total_records` rows starting now.
    #[must_use]
    pub fn new(total_records: u64) -> Self {
        Self {
            total_records,
            processed_records: 0,
            failed_records: 0,
            geocoded_addresses: 0,
            partial_matches: 0,
            failed_geocoding: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Additive change to the counters of a [`JobStats`].
///
/// Concurrent workers accumulate into a delta and a single writer applies
/// it, so no increments are lost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatsDelta {
    /// Added to `processed_records`.
    pub processed_records: u64,
    /// Added to `failed_records`.
    pub failed_records: u64,
    /// Added to `geocoded_addresses`.
    pub geocoded_addresses: u64,
    /// Added to `partial_matches`.
    pub partial_matches: u64,
    /// Added to `failed_geocoding`.
    pub failed_geocoding: u64,
}

impl JobStatsDelta {
    /// Returns `true` if applying this delta would change nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.processed_records == 0
            && self.failed_records == 0
            && self.geocoded_addresses == 0
            && self.partial_matches == 0
            && self.failed_geocoding == 0
    }

    /// Adds every counter of `other` to `self`.
    pub const fn merge(&mut self, other: &Self) {
        self.processed_records += other.processed_records;
        self.failed_records += other.failed_records;
        self.geocoded_addresses += other.geocoded_addresses;
        self.partial_matches += other.partial_matches;
        self.failed_geocoding += other.failed_geocoding;
    }

    /// Adds this delta to `stats`.
    pub const fn apply_to(&self, stats: &mut JobStats) {
        stats.processed_records = stats.processed_records.saturating_add(self.processed_records);
        stats.failed_records = stats.failed_records.saturating_add(self.failed_records);
        stats.geocoded_addresses = stats
            .geocoded_addresses
            .saturating_add(self.geocoded_addresses);
        stats.partial_matches = stats.partial_matches.saturating_add(self.partial_matches);
        stats.failed_geocoding = stats.failed_geocoding.saturating_add(self.failed_geocoding);
    }
}

/// One bulk upload and its aggregate progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    /// Opaque job identifier.
    pub id: Uuid,
    /// Name of the uploaded file.
    pub file_name: String,
    /// Current lifecycle state.
    pub status: ImportJobStatus,
    /// Progress counters.
    pub stats: JobStats,
    /// User who submitted the upload.
    pub created_by: String,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Last write to this job.
    pub updated_at: DateTime<Utc>,
    /// Why the job failed, if it did.
    pub error: Option<String>,
}

impl ImportJob {
    /// Creates a `Pending` job with zeroed stats.
    #[must_use]
    pub fn new(file_name: impl Into<String>, created_by: impl Into<String>, total_records: u64) -> Self {
        let stats = JobStats::new(total_records);
        let now = stats.started_at;
        Self {
            id: Uuid::new_v4(),
            file_name: file_name.into(),
            status: ImportJobStatus::Pending,
            stats,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            error: None,
        }
    }
}

/// WGS84 point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

/// The location fields of a [`Facility`], the only part of it the import
/// pipeline writes after creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilityLocation {
    /// Canonical formatted address (empty until geocoded).
    pub address: String,
    /// Locality name.
    pub city: String,
    /// First-level administrative area, short form (e.g. `"CA"`).
    pub state: String,
    /// Resolved point, if any.
    pub coordinates: Option<Coordinates>,
}

impl FacilityLocation {
    /// Empty location written at ingestion time.
    #[must_use]
    pub fn placeholder() -> Self {
        Self::default()
    }

    /// Returns `true` if this location has been resolved to a point.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.coordinates.is_some()
    }
}

/// The facility being imported.
///
/// Only the fields the import pipeline needs are modeled; everything else
/// about a facility belongs to the surrounding application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Facility {
    /// Opaque facility identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Website, if one was supplied.
    pub website: Option<String>,
    /// URL slug derived from the name and formatted address.
    pub slug: String,
    /// Location fields.
    pub location: FacilityLocation,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Per-row tracking entity recording the geocoding outcome for the
/// facility it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedRecord {
    /// Opaque record identifier.
    pub id: Uuid,
    /// Owning job.
    pub job_id: Uuid,
    /// Facility created from this row.
    pub facility_id: Uuid,
    /// 1-based position of the row in the upload.
    pub row_number: u64,
    /// Facility name as uploaded.
    pub name: String,
    /// Website as uploaded.
    pub website: Option<String>,
    /// Free-text address as uploaded (or as corrected during review).
    pub raw_address: String,
    /// Geocoding classification.
    pub address_match_quality: AddressMatchQuality,
    /// `true` iff `address_match_quality` is `Partial` or `None`.
    pub needs_review: bool,
    /// Why geocoding did not produce a match.
    pub geocoding_error: Option<String>,
    /// When the record left `Pending`.
    pub processed_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ImportedRecord {
    /// Applies `resolution` to this record in memory.
    ///
    /// The review flag is derived from the quality, never set directly.
    pub fn apply(&mut self, resolution: &RecordResolution) {
        self.address_match_quality = resolution.quality;
        self.needs_review = resolution.needs_review();
        self.geocoding_error.clone_from(&resolution.error);
        self.processed_at = Some(resolution.processed_at);
    }
}

/// The outcome written onto an [`ImportedRecord`] when it leaves `Pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResolution {
    /// New quality. Never `Pending`.
    pub quality: AddressMatchQuality,
    /// Error message for unresolved records.
    pub error: Option<String>,
    /// When the outcome was decided.
    pub processed_at: DateTime<Utc>,
}

impl RecordResolution {
    /// A confident match.
    #[must_use]
    pub fn exact() -> Self {
        Self {
            quality: AddressMatchQuality::Exact,
            error: None,
            processed_at: Utc::now(),
        }
    }

    /// An approximate match.
    #[must_use]
    pub fn partial() -> Self {
        Self {
            quality: AddressMatchQuality::Partial,
            error: None,
            processed_at: Utc::now(),
        }
    }

    /// No usable match, with the reason.
    #[must_use]
    pub fn unresolved(message: impl Into<String>) -> Self {
        Self {
            quality: AddressMatchQuality::None,
            error: Some(message.into()),
            processed_at: Utc::now(),
        }
    }

    /// Review flag implied by this outcome.
    #[must_use]
    pub const fn needs_review(&self) -> bool {
        self.quality.needs_review()
    }
}

/// One normalized row handed over by the upload parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRow {
    /// Facility name.
    pub name: String,
    /// Optional website URL.
    pub website: Option<String>,
    /// Free-text address.
    #[serde(alias = "address")]
    pub raw_address: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr as _;

    #[test]
    fn status_transitions_are_linear() {
        use ImportJobStatus::{Completed, Failed, Geocoding, Importing, Pending};

        assert!(Pending.can_transition_to(Importing));
        assert!(Importing.can_transition_to(Geocoding));
        assert!(Geocoding.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Importing.can_transition_to(Failed));
        assert!(Geocoding.can_transition_to(Failed));

        assert!(!Geocoding.can_transition_to(Importing));
        assert!(!Importing.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Geocoding));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Geocoding));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn terminal_and_active_states() {
        assert!(ImportJobStatus::Completed.is_terminal());
        assert!(ImportJobStatus::Failed.is_terminal());
        assert!(!ImportJobStatus::Pending.is_active());
        assert!(ImportJobStatus::Importing.is_active());
        assert!(ImportJobStatus::Geocoding.is_active());
    }

    #[test]
    fn status_round_trips_through_strings() {
        assert_eq!(ImportJobStatus::Geocoding.to_string(), "geocoding");
        assert_eq!(
            ImportJobStatus::from_str("completed").unwrap(),
            ImportJobStatus::Completed
        );
        assert_eq!(AddressMatchQuality::None.as_ref(), "none");
    }

    #[test]
    fn review_flag_follows_quality() {
        assert!(!AddressMatchQuality::Pending.needs_review());
        assert!(!AddressMatchQuality::Exact.needs_review());
        assert!(AddressMatchQuality::Partial.needs_review());
        assert!(AddressMatchQuality::None.needs_review());
        assert!(RecordResolution::unresolved("Address not found").needs_review());
        assert!(!RecordResolution::exact().needs_review());
    }

    #[test]
    fn delta_applies_and_merges() {
        let mut stats = JobStats::new(10);
        let mut delta = JobStatsDelta {
            geocoded_addresses: 2,
            partial_matches: 1,
            ..JobStatsDelta::default()
        };
        delta.merge(&JobStatsDelta {
            failed_geocoding: 3,
            ..JobStatsDelta::default()
        });
        delta.apply_to(&mut stats);

        assert_eq!(stats.geocoded_addresses, 2);
        assert_eq!(stats.partial_matches, 1);
        assert_eq!(stats.failed_geocoding, 3);
        assert!(JobStatsDelta::default().is_empty());
        assert!(!delta.is_empty());
    }

    #[test]
    fn job_serializes_with_camel_case_fields() {
        let job = ImportJob::new("clinics.csv", "user-1", 3);
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["stats"]["totalRecords"], 3);
        assert_eq!(json["fileName"], "clinics.csv");
    }
}
