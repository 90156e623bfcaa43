//! Closing gaps after cases leave a partition.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::{Partition, Progress, SequenceResult};
use crate::models::{CasePatch, CaseRecord};
use crate::store::{CaseFilter, CaseStore};

/// Single removal: everything above `removed_number` moves down by one,
/// lowest first.
pub async fn close_gap<S>(
    store: &S,
    partition: &Partition,
    removed_number: i32,
    progress: &mut Progress,
) -> SequenceResult<u32>
where
    S: CaseStore + ?Sized,
{
    let filter = CaseFilter::partition(*partition).at_least(removed_number + 1);
    let to_shift = store.query(&filter).await?;

    let mut shifted = 0;
    for record in &to_shift {
        store
            .update(record.case_id, &CasePatch::number(record.daily_id - 1))
            .await?;
        progress.record();
        shifted += 1;
    }

    debug!(%partition, removed_number, shifted, "closed gap");
    Ok(shifted)
}

/// Renumber survivors to `1..=N` in their current relative order, writing
/// only the rows whose number changes.
///
/// Survivors are ordered by `|daily_id|`, so a case left at a negative
/// placeholder by an interrupted move lands back next to its old slot. Rows
/// that must move up (duplicates, placeholders) are parked below every
/// number in use first, so the ascending placement pass never collides.
pub async fn compact<S>(store: &S, partition: &Partition, progress: &mut Progress) -> SequenceResult<u32>
where
    S: CaseStore + ?Sized,
{
    let mut survivors = store.query(&CaseFilter::partition(*partition)).await?;
    survivors.sort_by(|a, b| {
        a.daily_id
            .abs()
            .cmp(&b.daily_id.abs())
            .then(a.created_at.cmp(&b.created_at))
            .then(a.case_id.cmp(&b.case_id))
    });

    let changes: Vec<(&CaseRecord, i32)> = survivors
        .iter()
        .zip(1..)
        .filter(|(record, target)| record.daily_id != *target)
        .collect();
    if changes.is_empty() {
        return Ok(0);
    }

    let floor = survivors.iter().map(|r| r.daily_id.abs()).max().unwrap_or(0);
    for (record, target) in &changes {
        if record.daily_id > 0 && *target > record.daily_id {
            store
                .update(record.case_id, &CasePatch::number(-(floor + target)))
                .await?;
            progress.record();
        }
    }

    for (record, target) in &changes {
        store
            .update(record.case_id, &CasePatch::number(*target))
            .await?;
        progress.record();
    }

    let renumbered = changes.len() as u32;
    debug!(%partition, renumbered, "compacted partition");
    Ok(renumbered)
}

/// Shape of a partition against the `1..=N` invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DensityReport {
    pub count: usize,
    pub gaps: Vec<i32>,
    pub duplicates: Vec<i32>,
    pub stranded: Vec<Uuid>,
    pub dense: bool,
}

pub fn inspect(records: &[CaseRecord]) -> DensityReport {
    let mut seen: BTreeMap<i32, usize> = BTreeMap::new();
    let mut stranded = Vec::new();
    for record in records {
        if record.daily_id < 1 {
            stranded.push(record.case_id);
        } else {
            *seen.entry(record.daily_id).or_default() += 1;
        }
    }

    let count = records.len();
    let top = seen.keys().next_back().copied().unwrap_or(0).max(count as i32);
    let gaps = (1..=top).filter(|n| !seen.contains_key(n)).collect::<Vec<_>>();
    let duplicates = seen
        .iter()
        .filter(|(_, hits)| **hits > 1)
        .map(|(n, _)| *n)
        .collect::<Vec<_>>();

    let dense = gaps.is_empty() && duplicates.is_empty() && stranded.is_empty();
    DensityReport {
        count,
        gaps,
        duplicates,
        stranded,
        dense,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCaseStore;
    use chrono::NaiveDate;

    fn partition() -> Partition {
        Partition::single_lab(NaiveDate::from_ymd_opt(2024, 7, 2).unwrap())
    }

    #[tokio::test]
    async fn close_gap_pulls_tail_down() {
        let store = MemoryCaseStore::new();
        let seeded = store.seed(partition(), 5).await;
        store.delete(seeded[1].case_id).await.unwrap();
        let mut progress = Progress::new();

        let shifted = close_gap(&store, &partition(), 2, &mut progress).await.unwrap();

        assert_eq!(shifted, 3);
        assert_eq!(store.numbers(partition()).await, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn compact_is_idempotent_on_dense_partition() {
        let store = MemoryCaseStore::new();
        store.seed(partition(), 4).await;
        let mut progress = Progress::new();

        assert_eq!(compact(&store, &partition(), &mut progress).await.unwrap(), 0);
        assert_eq!(compact(&store, &partition(), &mut progress).await.unwrap(), 0);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn compact_repairs_duplicates_without_collisions() {
        let store = MemoryCaseStore::new();
        store.seed_numbers(partition(), &[1, 2, 2, 3, 7]).await;
        let mut progress = Progress::new();

        compact(&store, &partition(), &mut progress).await.unwrap();

        assert_eq!(store.numbers(partition()).await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn compact_restores_stranded_placeholder() {
        let store = MemoryCaseStore::new();
        let seeded = store.seed_numbers(partition(), &[1, -2, 3, 4]).await;
        let mut progress = Progress::new();

        compact(&store, &partition(), &mut progress).await.unwrap();

        let stranded = store.fetch(seeded[1].case_id).await.unwrap().unwrap();
        assert_eq!(stranded.daily_id, 2);
        assert_eq!(store.numbers(partition()).await, vec![1, 2, 3, 4]);
        // Only the stranded row needed a write.
        assert_eq!(progress.applied(), 1);
    }

    #[tokio::test]
    async fn inspect_reports_every_defect() {
        let store = MemoryCaseStore::new();
        let seeded = store.seed_numbers(partition(), &[1, 3, 3, -4]).await;

        let report = inspect(&store.snapshot(partition()).await);

        assert_eq!(report.count, 4);
        assert_eq!(report.gaps, vec![2, 4]);
        assert_eq!(report.duplicates, vec![3]);
        assert_eq!(report.stranded, vec![seeded[3].case_id]);
        assert!(!report.dense);
    }

    #[tokio::test]
    async fn inspect_accepts_dense_partition() {
        let store = MemoryCaseStore::new();
        store.seed(partition(), 3).await;

        let report = inspect(&store.snapshot(partition()).await);
        assert!(report.dense);
        assert!(report.gaps.is_empty());
    }
}
