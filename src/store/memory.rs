//! In-memory case store.
//!
//! Behaves like the hosted backend the sequencing core was first written
//! against: every write is visible as soon as it returns and nothing is ever
//! rolled back. `(lab_id, visit_date, daily_id)` is unique on every write.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CaseFilter, CaseStore, SortOrder, StoreError, StoreResult, TransactionalStore};
use crate::models::{CaseDetails, CasePatch, CaseRecord, NewCase};
use crate::sequence::Partition;

#[derive(Debug, Default)]
struct Inner {
    rows: RwLock<Vec<CaseRecord>>,
    writes: AtomicU32,
    /// Remaining writes before every write fails. `None` disables injection.
    fail_after: Mutex<Option<u32>>,
    insert_trigger: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCaseStore {
    inner: Arc<Inner>,
}

impl MemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a database trigger that ignores the supplied `daily_id` on
    /// insert and assigns `max + 1` instead.
    pub fn with_insert_trigger() -> Self {
        Self {
            inner: Arc::new(Inner {
                insert_trigger: true,
                ..Inner::default()
            }),
        }
    }

    /// Let `n` more writes succeed, then fail every write.
    pub fn fail_writes_after(&self, n: u32) {
        if let Ok(mut budget) = self.inner.fail_after.lock() {
            *budget = Some(n);
        }
    }

    pub fn heal(&self) {
        if let Ok(mut budget) = self.inner.fail_after.lock() {
            *budget = None;
        }
    }

    /// Successful writes since creation. Seeding is not counted.
    pub fn write_count(&self) -> u32 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Insert rows with exactly these numbers, skipping every check.
    pub async fn seed_numbers(&self, partition: Partition, numbers: &[i32]) -> Vec<CaseRecord> {
        let mut rows = self.inner.rows.write().await;
        let mut seeded = Vec::with_capacity(numbers.len());
        for &daily_id in numbers {
            let record = new_record(
                partition,
                daily_id,
                CaseDetails {
                    patient_name: format!("patient {daily_id}"),
                    ..CaseDetails::default()
                },
            );
            rows.push(record.clone());
            seeded.push(record);
        }
        seeded
    }

    /// Insert `1..=n` into the partition.
    pub async fn seed(&self, partition: Partition, n: i32) -> Vec<CaseRecord> {
        let numbers: Vec<i32> = (1..=n).collect();
        self.seed_numbers(partition, &numbers).await
    }

    /// Rows of a partition in ascending `daily_id` order.
    pub async fn snapshot(&self, partition: Partition) -> Vec<CaseRecord> {
        let rows = self.inner.rows.read().await;
        let mut records: Vec<CaseRecord> = rows
            .iter()
            .filter(|r| r.partition() == partition)
            .cloned()
            .collect();
        sort_records(&mut records, SortOrder::Ascending);
        records
    }

    pub async fn numbers(&self, partition: Partition) -> Vec<i32> {
        self.snapshot(partition)
            .await
            .into_iter()
            .map(|r| r.daily_id)
            .collect()
    }

    fn begin_write(&self) -> StoreResult<()> {
        let mut budget = self
            .inner
            .fail_after
            .lock()
            .map_err(|_| StoreError::Unavailable("fault injector poisoned".into()))?;
        match budget.as_mut() {
            Some(0) => Err(StoreError::Unavailable("injected write failure".into())),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn finish_write(&self) {
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn new_record(partition: Partition, daily_id: i32, details: CaseDetails) -> CaseRecord {
    let now = Utc::now();
    CaseRecord {
        case_id: Uuid::new_v4(),
        lab_id: partition.lab_id,
        visit_date: partition.visit_date,
        daily_id,
        details,
        created_at: now,
        updated_at: now,
    }
}

fn sort_records(records: &mut [CaseRecord], order: SortOrder) {
    records.sort_by(|a, b| {
        let key = a
            .daily_id
            .cmp(&b.daily_id)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.case_id.cmp(&b.case_id));
        match order {
            SortOrder::Ascending => key,
            SortOrder::Descending => key.reverse(),
        }
    });
}

fn ensure_free(rows: &[CaseRecord], candidate: &CaseRecord) -> StoreResult<()> {
    let taken = rows.iter().any(|r| {
        r.case_id != candidate.case_id
            && r.partition() == candidate.partition()
            && r.daily_id == candidate.daily_id
    });
    if taken {
        return Err(StoreError::Conflict(format!(
            "daily_id {} already used in {}",
            candidate.daily_id,
            candidate.partition()
        )));
    }
    Ok(())
}

#[async_trait]
impl CaseStore for MemoryCaseStore {
    async fn query(&self, filter: &CaseFilter) -> StoreResult<Vec<CaseRecord>> {
        let rows = self.inner.rows.read().await;
        let mut records: Vec<CaseRecord> = rows.iter().filter(|r| filter.matches(r)).cloned().collect();
        sort_records(&mut records, filter.order);
        Ok(records)
    }

    async fn count(&self, partition: &Partition) -> StoreResult<i32> {
        let rows = self.inner.rows.read().await;
        let n = rows.iter().filter(|r| r.partition() == *partition).count();
        i32::try_from(n).map_err(|_| StoreError::Unavailable("partition too large".into()))
    }

    async fn fetch(&self, case_id: Uuid) -> StoreResult<Option<CaseRecord>> {
        let rows = self.inner.rows.read().await;
        Ok(rows.iter().find(|r| r.case_id == case_id).cloned())
    }

    async fn fetch_many(&self, case_ids: &[Uuid]) -> StoreResult<Vec<CaseRecord>> {
        let rows = self.inner.rows.read().await;
        Ok(rows
            .iter()
            .filter(|r| case_ids.contains(&r.case_id))
            .cloned()
            .collect())
    }

    async fn insert(&self, new_case: &NewCase) -> StoreResult<CaseRecord> {
        self.begin_write()?;
        let mut rows = self.inner.rows.write().await;

        let daily_id = if self.inner.insert_trigger {
            rows.iter()
                .filter(|r| r.partition() == new_case.partition)
                .map(|r| r.daily_id)
                .max()
                .unwrap_or(0)
                .max(0)
                + 1
        } else {
            new_case.daily_id
        };

        let record = new_record(new_case.partition, daily_id, new_case.details.clone());
        ensure_free(&rows, &record)?;
        rows.push(record.clone());
        self.finish_write();
        Ok(record)
    }

    async fn update(&self, case_id: Uuid, patch: &CasePatch) -> StoreResult<()> {
        self.begin_write()?;
        let mut rows = self.inner.rows.write().await;

        let index = rows
            .iter()
            .position(|r| r.case_id == case_id)
            .ok_or(StoreError::NotFound(case_id))?;

        let mut updated = rows[index].clone();
        patch.apply_to(&mut updated);
        updated.updated_at = Utc::now();
        ensure_free(&rows, &updated)?;

        rows[index] = updated;
        self.finish_write();
        Ok(())
    }

    async fn delete(&self, case_id: Uuid) -> StoreResult<()> {
        self.begin_write()?;
        let mut rows = self.inner.rows.write().await;
        let before = rows.len();
        rows.retain(|r| r.case_id != case_id);
        if rows.len() == before {
            return Err(StoreError::NotFound(case_id));
        }
        self.finish_write();
        Ok(())
    }

    async fn delete_many(&self, case_ids: &[Uuid]) -> StoreResult<u64> {
        self.begin_write()?;
        let mut rows = self.inner.rows.write().await;
        let before = rows.len();
        rows.retain(|r| !case_ids.contains(&r.case_id));
        self.finish_write();
        Ok((before - rows.len()) as u64)
    }
}

#[async_trait]
impl TransactionalStore for MemoryCaseStore {
    const ATOMIC: bool = false;

    type Session = MemoryCaseStore;

    async fn begin(&self) -> StoreResult<Self::Session> {
        Ok(self.clone())
    }

    async fn commit(&self, _session: Self::Session) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn partition() -> Partition {
        Partition::single_lab(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
    }

    #[tokio::test]
    async fn update_rejects_duplicate_number() {
        let store = MemoryCaseStore::new();
        let seeded = store.seed(partition(), 2).await;

        let err = store
            .update(seeded[0].case_id, &CasePatch::number(2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.numbers(partition()).await, vec![1, 2]);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn query_honors_bounds_and_order() {
        let store = MemoryCaseStore::new();
        store.seed(partition(), 5).await;

        let filter = CaseFilter::partition(partition()).at_least(2).at_most(4).descending();
        let numbers: Vec<i32> = store
            .query(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.daily_id)
            .collect();
        assert_eq!(numbers, vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn injected_failure_stops_writes() {
        let store = MemoryCaseStore::new();
        let seeded = store.seed(partition(), 3).await;
        store.fail_writes_after(1);

        store.delete(seeded[0].case_id).await.unwrap();
        let err = store.delete(seeded[1].case_id).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        store.heal();
        store.delete(seeded[1].case_id).await.unwrap();
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn trigger_overrides_supplied_number() {
        let store = MemoryCaseStore::with_insert_trigger();
        store.seed(partition(), 3).await;

        let record = store
            .insert(&NewCase {
                partition: partition(),
                daily_id: 1,
                details: CaseDetails::default(),
            })
            .await
            .unwrap();
        assert_eq!(record.daily_id, 4);
    }
}
