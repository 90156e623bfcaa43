//! Record store contract the sequencing core runs against.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{CasePatch, CaseRecord, NewCase};
use crate::sequence::Partition;

pub use memory::MemoryCaseStore;
pub use postgres::PgCaseStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("uniqueness violation: {0}")]
    Conflict(String),

    #[error("record not found: {0}")]
    NotFound(Uuid),

    #[error("session already closed")]
    Closed,
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Filtered read over one partition. Bounds on `daily_id` are inclusive.
#[derive(Debug, Clone)]
pub struct CaseFilter {
    pub partition: Partition,
    pub min: Option<i32>,
    pub max: Option<i32>,
    pub exclude: Option<Uuid>,
    pub order: SortOrder,
}

impl CaseFilter {
    pub fn partition(partition: Partition) -> Self {
        Self {
            partition,
            min: None,
            max: None,
            exclude: None,
            order: SortOrder::Ascending,
        }
    }

    pub fn at_least(mut self, min: i32) -> Self {
        self.min = Some(min);
        self
    }

    pub fn at_most(mut self, max: i32) -> Self {
        self.max = Some(max);
        self
    }

    pub fn excluding(mut self, case_id: Uuid) -> Self {
        self.exclude = Some(case_id);
        self
    }

    pub fn descending(mut self) -> Self {
        self.order = SortOrder::Descending;
        self
    }

    pub fn matches(&self, record: &CaseRecord) -> bool {
        record.partition() == self.partition
            && self.min.is_none_or(|min| record.daily_id >= min)
            && self.max.is_none_or(|max| record.daily_id <= max)
            && self.exclude != Some(record.case_id)
    }
}

/// Single-row reads and writes over the `lab_case` collection.
///
/// Results of `query` are ordered by `daily_id` in the filter's direction,
/// ties broken by `created_at` then `case_id`.
#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn query(&self, filter: &CaseFilter) -> StoreResult<Vec<CaseRecord>>;

    async fn count(&self, partition: &Partition) -> StoreResult<i32>;

    async fn fetch(&self, case_id: Uuid) -> StoreResult<Option<CaseRecord>>;

    async fn fetch_many(&self, case_ids: &[Uuid]) -> StoreResult<Vec<CaseRecord>>;

    async fn insert(&self, new_case: &NewCase) -> StoreResult<CaseRecord>;

    async fn update(&self, case_id: Uuid, patch: &CasePatch) -> StoreResult<()>;

    async fn delete(&self, case_id: Uuid) -> StoreResult<()>;

    async fn delete_many(&self, case_ids: &[Uuid]) -> StoreResult<u64>;

    /// Hold the partition against other writers until the session ends.
    async fn lock_partition(&self, _partition: &Partition) -> StoreResult<()> {
        Ok(())
    }
}

/// A store that hands out write sessions.
///
/// Atomic stores roll back a session that is dropped without `commit`.
/// Non-atomic stores apply each write as it is issued.
#[async_trait]
pub trait TransactionalStore: CaseStore {
    const ATOMIC: bool;

    type Session: CaseStore;

    async fn begin(&self) -> StoreResult<Self::Session>;

    async fn commit(&self, session: Self::Session) -> StoreResult<()>;
}
