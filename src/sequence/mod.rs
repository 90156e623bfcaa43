//! Daily sequence numbering for lab cases.
//!
//! Every case belongs to a partition `(lab, visit_date)`. Inside a partition the
//! `daily_id` values are always exactly `1..=N` once an operation completes.
//! The allocator opens slots, the compactor closes them, and the lifecycle
//! service strings both together behind per-partition locks.

pub mod allocator;
pub mod compactor;
pub mod lifecycle;
pub mod locks;

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

pub use compactor::DensityReport;
pub use lifecycle::{BulkDeleteReport, CaseService, CaseUpdate, Created, NumberNotHonored};
pub use locks::PartitionLocks;

/// Owning lab of a case. Single-lab deployments use [`LabId::SINGLE`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct LabId(pub Uuid);

impl LabId {
    pub const SINGLE: LabId = LabId(Uuid::nil());
}

impl fmt::Display for LabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Scope within which `daily_id` values are dense and unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Partition {
    pub lab_id: LabId,
    pub visit_date: NaiveDate,
}

impl Partition {
    pub fn new(lab_id: LabId, visit_date: NaiveDate) -> Self {
        Self { lab_id, visit_date }
    }

    pub fn single_lab(visit_date: NaiveDate) -> Self {
        Self::new(LabId::SINGLE, visit_date)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.lab_id, self.visit_date)
    }
}

/// Which manually requested numbers are accepted.
///
/// Strict mode only accepts numbers that keep the partition dense:
/// `1..=count+1` on create and `1..=count` when moving inside a partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangePolicy {
    pub allow_gaps: bool,
}

impl RangePolicy {
    pub fn strict() -> Self {
        Self { allow_gaps: false }
    }

    pub fn check(&self, requested: i32, max: i32) -> Result<(), SequenceError> {
        if requested < 1 || (!self.allow_gaps && requested > max) {
            return Err(SequenceError::OutOfRange { requested, max });
        }
        Ok(())
    }
}

/// Writes applied so far by one operation.
#[derive(Debug, Default)]
pub struct Progress {
    applied: u32,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self) {
        self.applied += 1;
    }

    pub fn applied(&self) -> u32 {
        self.applied
    }

    /// Turn a failure into what the caller can act on. On a non-atomic store
    /// earlier writes stay applied, so a store failure after them is partial.
    pub fn classify(&self, err: SequenceError, atomic: bool) -> SequenceError {
        match err {
            SequenceError::StoreUnavailable(source) if !atomic && self.applied > 0 => {
                SequenceError::PartialFailure {
                    applied: self.applied,
                    source,
                }
            }
            other => other,
        }
    }
}

#[derive(Error, Debug)]
pub enum SequenceError {
    #[error("record store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("daily_id {requested} is out of range (1..={max})")]
    OutOfRange { requested: i32, max: i32 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("case not found: {0}")]
    NotFound(Uuid),

    #[error("concurrent change: {0}")]
    Concurrent(String),

    #[error("sequence left inconsistent after {applied} applied writes: {source}")]
    PartialFailure {
        applied: u32,
        #[source]
        source: StoreError,
    },
}

impl From<StoreError> for SequenceError {
    fn from(err: StoreError) -> Self {
        SequenceError::StoreUnavailable(err)
    }
}

pub type SequenceResult<T> = Result<T, SequenceError>;
