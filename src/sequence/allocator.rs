//! Opening slots: append, manual insert, and moves inside one partition.
//!
//! Every shift is written one row at a time, in the direction that never asks
//! the store to hold two cases with the same number at once.

use tracing::debug;

use super::{Partition, Progress, RangePolicy, SequenceError, SequenceResult};
use crate::models::{CasePatch, CaseRecord};
use crate::store::{CaseFilter, CaseStore};

/// Placeholder outside the positive range, used to free a slot mid-move.
pub fn vacate_placeholder(daily_id: i32) -> i32 {
    -daily_id.abs()
}

/// Append fast path: the next number after the current last one. No writes.
pub async fn next_number<S>(store: &S, partition: &Partition) -> SequenceResult<i32>
where
    S: CaseStore + ?Sized,
{
    Ok(store.count(partition).await? + 1)
}

/// Shift every case numbered `>= requested` up by one, highest first.
pub async fn open_slot<S>(
    store: &S,
    partition: &Partition,
    requested: i32,
    progress: &mut Progress,
) -> SequenceResult<u32>
where
    S: CaseStore + ?Sized,
{
    let filter = CaseFilter::partition(*partition)
        .at_least(requested)
        .descending();
    let to_shift = store.query(&filter).await?;

    let mut shifted = 0;
    for record in &to_shift {
        store
            .update(record.case_id, &CasePatch::number(record.daily_id + 1))
            .await?;
        progress.record();
        shifted += 1;
    }

    debug!(%partition, requested, shifted, "opened slot");
    Ok(shifted)
}

/// Pick the number a new case in `partition` gets, shifting others when a
/// specific number was requested.
pub async fn allocate<S>(
    store: &S,
    partition: &Partition,
    requested: Option<i32>,
    policy: RangePolicy,
    progress: &mut Progress,
) -> SequenceResult<i32>
where
    S: CaseStore + ?Sized,
{
    let next = next_number(store, partition).await?;
    let Some(requested) = requested else {
        return Ok(next);
    };

    policy.check(requested, next)?;
    if requested < next {
        open_slot(store, partition, requested, progress).await?;
    }
    Ok(requested)
}

/// Move `record` to `new_number` inside its own partition.
///
/// Vacate to a negative placeholder, shift the run between the old and new
/// positions by one, then place. Returns the number of rows shifted.
pub async fn renumber<S>(
    store: &S,
    record: &CaseRecord,
    new_number: i32,
    policy: RangePolicy,
    progress: &mut Progress,
) -> SequenceResult<u32>
where
    S: CaseStore + ?Sized,
{
    let old_number = record.daily_id;
    if new_number == old_number {
        return Ok(0);
    }
    if old_number < 1 {
        return Err(SequenceError::InvalidRequest(format!(
            "case {} holds placeholder {old_number}; recompact {} first",
            record.case_id,
            record.partition()
        )));
    }

    let partition = record.partition();
    let count = store.count(&partition).await?;
    policy.check(new_number, count)?;

    store
        .update(record.case_id, &CasePatch::number(vacate_placeholder(old_number)))
        .await?;
    progress.record();

    let base = CaseFilter::partition(partition).excluding(record.case_id);
    let (to_shift, delta) = if new_number > old_number {
        let filter = base.at_least(old_number + 1).at_most(new_number);
        (store.query(&filter).await?, -1)
    } else {
        let filter = base.at_least(new_number).at_most(old_number - 1).descending();
        (store.query(&filter).await?, 1)
    };

    let mut shifted = 0;
    for neighbor in &to_shift {
        store
            .update(neighbor.case_id, &CasePatch::number(neighbor.daily_id + delta))
            .await?;
        progress.record();
        shifted += 1;
    }

    store
        .update(record.case_id, &CasePatch::number(new_number))
        .await?;
    progress.record();

    debug!(
        %partition,
        case_id = %record.case_id,
        old_number,
        new_number,
        shifted,
        "renumbered case"
    );
    Ok(shifted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCaseStore;
    use chrono::NaiveDate;

    fn partition() -> Partition {
        Partition::single_lab(NaiveDate::from_ymd_opt(2024, 5, 20).unwrap())
    }

    #[tokio::test]
    async fn append_needs_no_writes() {
        let store = MemoryCaseStore::new();
        store.seed(partition(), 4).await;
        let mut progress = Progress::new();

        let n = allocate(&store, &partition(), None, RangePolicy::strict(), &mut progress)
            .await
            .unwrap();

        assert_eq!(n, 5);
        assert_eq!(progress.applied(), 0);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn requesting_next_number_does_not_shift() {
        let store = MemoryCaseStore::new();
        store.seed(partition(), 2).await;
        let mut progress = Progress::new();

        let n = allocate(&store, &partition(), Some(3), RangePolicy::strict(), &mut progress)
            .await
            .unwrap();

        assert_eq!(n, 3);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn manual_request_shifts_tail_up() {
        let store = MemoryCaseStore::new();
        let seeded = store.seed(partition(), 5).await;
        let mut progress = Progress::new();

        let n = allocate(&store, &partition(), Some(3), RangePolicy::strict(), &mut progress)
            .await
            .unwrap();

        assert_eq!(n, 3);
        assert_eq!(progress.applied(), 3);
        assert_eq!(store.numbers(partition()).await, vec![1, 2, 4, 5, 6]);
        let moved = store.fetch(seeded[2].case_id).await.unwrap().unwrap();
        assert_eq!(moved.daily_id, 4);
    }

    #[tokio::test]
    async fn out_of_range_request_is_rejected_before_writes() {
        let store = MemoryCaseStore::new();
        store.seed(partition(), 2).await;
        let mut progress = Progress::new();

        let err = allocate(&store, &partition(), Some(5), RangePolicy::strict(), &mut progress)
            .await
            .unwrap_err();

        assert!(matches!(err, SequenceError::OutOfRange { requested: 5, max: 3 }));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn gap_policy_accepts_far_numbers() {
        let store = MemoryCaseStore::new();
        store.seed(partition(), 2).await;
        let mut progress = Progress::new();

        let policy = RangePolicy { allow_gaps: true };
        let n = allocate(&store, &partition(), Some(9), policy, &mut progress)
            .await
            .unwrap();

        assert_eq!(n, 9);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn renumber_to_same_number_is_a_no_op() {
        let store = MemoryCaseStore::new();
        let seeded = store.seed(partition(), 3).await;
        let mut progress = Progress::new();

        let shifted = renumber(&store, &seeded[1], 2, RangePolicy::strict(), &mut progress)
            .await
            .unwrap();

        assert_eq!(shifted, 0);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn renumber_rejects_number_past_count() {
        let store = MemoryCaseStore::new();
        let seeded = store.seed(partition(), 3).await;
        let mut progress = Progress::new();

        let err = renumber(&store, &seeded[0], 4, RangePolicy::strict(), &mut progress)
            .await
            .unwrap_err();

        assert!(matches!(err, SequenceError::OutOfRange { requested: 4, max: 3 }));
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn placeholder_is_never_positive() {
        assert_eq!(vacate_placeholder(4), -4);
        assert_eq!(vacate_placeholder(-4), -4);
    }
}
