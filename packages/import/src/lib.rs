#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Facility bulk import and address geocoding.
//!
//! An upload runs as one [`models::ImportJob`] through two phases:
//!
//! 1. **Importing** ([`ingest`]): every validated row becomes a facility
//!    with placeholder location fields plus a pending tracking record, all
//!    written in one atomic batch.
//! 2. **Geocoding** ([`processor`]): pending records are resolved in
//!    fixed-size batches of concurrent requests, with a fixed delay between
//!    batches. Each record ends up `exact`, `partial`, or `none`; the last
//!    two land in the [`review`] queue.
//!
//! [`ImportPipeline`] ties the phases together and runs them on a tokio
//! task the caller can await, poll, or cancel. Storage and geocoding are
//! injected as [`ImportStore`] and [`Geocoder`] trait objects.

pub mod config;
pub mod controller;
pub mod ingest;
pub mod outcome;
pub mod pipeline;
pub mod processor;
pub mod progress;
pub mod review;
pub mod slug;

#[cfg(test)]
pub(crate) mod test_support;

pub use facility_database::{ImportStore, StoreError};
pub use facility_geocoder::{GeocodeError, Geocoder};
pub use facility_import_models as models;

pub use config::ProcessorConfig;
pub use controller::JobController;
pub use pipeline::{ImportPipeline, ImportTask};

use facility_import_models::ImportJobStatus;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the import pipeline.
///
/// Per-row and per-address failures never appear here; they are recorded
/// on the affected tracking record and in the job counters.
#[derive(Debug, Error)]
pub enum ImportError {
    /// Uploaded rows failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Unknown job or record id.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind (`"job"`, `"record"`).
        entity: &'static str,
        /// Requested id.
        id: Uuid,
    },

    /// The operation is not allowed in the job's current status.
    #[error("Cannot {operation} job {job_id} while it is {status}")]
    InvalidState {
        /// Job id.
        job_id: Uuid,
        /// Status at the time of the call.
        status: ImportJobStatus,
        /// Attempted operation.
        operation: &'static str,
    },

    /// A review action targeted a record that is not flagged for review.
    #[error("Record {record_id} is not awaiting review")]
    NotInReview {
        /// Record id.
        record_id: Uuid,
    },

    /// The geocoding provider cannot be used.
    #[error("Geocoding service error: {0}")]
    ExternalService(#[from] GeocodeError),

    /// A store write or query failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// A spawned pipeline task panicked or was aborted.
    #[error("Import task failed: {message}")]
    Task {
        /// Join error description.
        message: String,
    },
}

/// One invalid field in an uploaded row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowViolation {
    /// 1-based row number.
    pub row: u64,
    /// Field name.
    pub field: &'static str,
    /// What is wrong with it.
    pub message: String,
}

impl std::fmt::Display for RowViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "row {}: {} {}", self.row, self.field, self.message)
    }
}

/// Every violation found in an upload, reported together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Validation failed: {}", join_violations(.violations))]
pub struct ValidationError {
    /// Violations in row order.
    pub violations: Vec<RowViolation>,
}

impl ValidationError {
    /// A validation error with a single violation.
    #[must_use]
    pub fn single(row: u64, field: &'static str, message: impl Into<String>) -> Self {
        Self {
            violations: vec![RowViolation {
                row,
                field,
                message: message.into(),
            }],
        }
    }
}

fn join_violations(violations: &[RowViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
