// src/sequence/lifecycle.rs

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::allocator::{allocate, next_number, renumber, vacate_placeholder};
use super::compactor::{self, close_gap, compact, DensityReport};
use super::{
    LabId, Partition, PartitionLocks, Progress, RangePolicy, SequenceError, SequenceResult,
};
use crate::models::{CaseDetails, CaseDetailsPatch, CasePatch, CaseRecord, NewCase};
use crate::store::{CaseFilter, CaseStore, TransactionalStore};

/* ============================================================
   Outcomes
   ============================================================ */

/// The store kept its own number for a new case and the correction failed.
/// The case is saved; only the requested numbering was lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NumberNotHonored {
    pub requested: i32,
    pub assigned: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Created {
    pub record: CaseRecord,
    pub warning: Option<NumberNotHonored>,
}

#[derive(Debug, Clone, Default)]
pub struct CaseUpdate {
    /// Merged onto the stored details after the partition lock is held.
    pub details: Option<CaseDetailsPatch>,
    pub visit_date: Option<NaiveDate>,
    pub daily_id: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionCompaction {
    pub partition: Partition,
    pub renumbered: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkDeleteReport {
    pub deleted: u64,
    pub compacted: Vec<PartitionCompaction>,
}

/* ============================================================
   Service
   ============================================================ */

/// Create, move and delete cases while keeping each partition's `daily_id`
/// values dense.
///
/// Every mutation locks the partitions it touches (in process, and through
/// [`CaseStore::lock_partition`] in the store), runs in one store session and
/// commits only when every step succeeded. On a non-atomic store a failure
/// after some writes is reported as [`SequenceError::PartialFailure`];
/// recover with [`CaseService::compact`].
pub struct CaseService<S> {
    store: S,
    locks: PartitionLocks,
    policy: RangePolicy,
}

async fn lookup<St>(store: &St, lab: LabId, case_id: Uuid) -> SequenceResult<CaseRecord>
where
    St: CaseStore + ?Sized,
{
    match store.fetch(case_id).await? {
        Some(record) if record.lab_id == lab => Ok(record),
        _ => Err(SequenceError::NotFound(case_id)),
    }
}

fn ensure_locked(record: &CaseRecord, locked: &BTreeSet<Partition>) -> SequenceResult<()> {
    if locked.contains(&record.partition()) {
        Ok(())
    } else {
        Err(SequenceError::Concurrent(format!(
            "case {} moved to {} while waiting",
            record.case_id,
            record.partition()
        )))
    }
}

fn ensure_placed(record: &CaseRecord) -> SequenceResult<()> {
    if record.daily_id < 1 {
        return Err(SequenceError::InvalidRequest(format!(
            "case {} holds placeholder {}; recompact {} first",
            record.case_id,
            record.daily_id,
            record.partition()
        )));
    }
    Ok(())
}

async fn lock_all<St>(session: &St, partitions: &BTreeSet<Partition>) -> SequenceResult<()>
where
    St: CaseStore + ?Sized,
{
    for partition in partitions {
        session.lock_partition(partition).await?;
    }
    Ok(())
}

impl<S: TransactionalStore> CaseService<S> {
    pub fn new(store: S, policy: RangePolicy) -> Self {
        Self {
            store,
            locks: PartitionLocks::new(),
            policy,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> RangePolicy {
        self.policy
    }

    async fn finish<T>(
        &self,
        session: S::Session,
        progress: &Progress,
        outcome: SequenceResult<T>,
    ) -> SequenceResult<T> {
        match outcome {
            Ok(value) => {
                self.store.commit(session).await?;
                Ok(value)
            }
            Err(err) => {
                // Atomic stores roll back here.
                drop(session);
                Err(progress.classify(err, S::ATOMIC))
            }
        }
    }

    /* ---------------- reads ---------------- */

    pub async fn get(&self, lab: LabId, case_id: Uuid) -> SequenceResult<CaseRecord> {
        lookup(&self.store, lab, case_id).await
    }

    pub async fn list(&self, partition: Partition) -> SequenceResult<Vec<CaseRecord>> {
        Ok(self.store.query(&CaseFilter::partition(partition)).await?)
    }

    pub async fn inspect(&self, partition: Partition) -> SequenceResult<DensityReport> {
        let records = self.list(partition).await?;
        Ok(compactor::inspect(&records))
    }

    /* ---------------- create ---------------- */

    /// Insert a case, appending by default or at `requested` with the
    /// cases from `requested` upwards shifted by one.
    pub async fn create(
        &self,
        partition: Partition,
        details: CaseDetails,
        requested: Option<i32>,
    ) -> SequenceResult<Created> {
        let _guard = self.locks.acquire_one(partition).await;
        let session = self.store.begin().await?;
        let mut progress = Progress::new();

        let outcome = self
            .create_in(&session, partition, details, requested, &mut progress)
            .await;
        let created = self.finish(session, &progress, outcome).await;

        match &created {
            Ok(c) => info!(
                %partition,
                case_id = %c.record.case_id,
                daily_id = c.record.daily_id,
                applied = progress.applied(),
                "case created"
            ),
            Err(err) => error!(%partition, ?requested, applied = progress.applied(), "create failed: {err}"),
        }
        created
    }

    async fn create_in(
        &self,
        session: &S::Session,
        partition: Partition,
        details: CaseDetails,
        requested: Option<i32>,
        progress: &mut Progress,
    ) -> SequenceResult<Created> {
        session.lock_partition(&partition).await?;

        let daily_id = allocate(session, &partition, requested, self.policy, progress).await?;
        let mut record = session
            .insert(&NewCase {
                partition,
                daily_id,
                details,
            })
            .await?;
        progress.record();

        let Some(requested) = requested else {
            return Ok(Created {
                record,
                warning: None,
            });
        };
        if record.daily_id == requested {
            return Ok(Created {
                record,
                warning: None,
            });
        }

        warn!(
            %partition,
            case_id = %record.case_id,
            requested,
            assigned = record.daily_id,
            "store overrode requested daily_id, correcting"
        );
        match session
            .update(record.case_id, &CasePatch::number(requested))
            .await
        {
            Ok(()) => {
                progress.record();
                record.daily_id = requested;
                Ok(Created {
                    record,
                    warning: None,
                })
            }
            Err(err) if !S::ATOMIC => {
                warn!(
                    %partition,
                    case_id = %record.case_id,
                    "daily_id correction failed, slot {requested} left empty until recompaction: {err}"
                );
                let assigned = record.daily_id;
                Ok(Created {
                    record,
                    warning: Some(NumberNotHonored {
                        requested,
                        assigned,
                    }),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /* ---------------- update / move ---------------- */

    /// Move a case to another number and/or date. `None` keeps the current
    /// value; a new date without a number appends to that date.
    pub async fn move_case(
        &self,
        lab: LabId,
        case_id: Uuid,
        visit_date: Option<NaiveDate>,
        daily_id: Option<i32>,
    ) -> SequenceResult<CaseRecord> {
        self.update(
            lab,
            case_id,
            CaseUpdate {
                details: None,
                visit_date,
                daily_id,
            },
        )
        .await
    }

    /// Patch the details and/or move the case, in one session. The move is
    /// range-checked before anything is written.
    pub async fn update(
        &self,
        lab: LabId,
        case_id: Uuid,
        change: CaseUpdate,
    ) -> SequenceResult<CaseRecord> {
        let current = lookup(&self.store, lab, case_id).await?;
        let source = current.partition();
        let target = Partition::new(lab, change.visit_date.unwrap_or(current.visit_date));
        let partitions = BTreeSet::from([source, target]);

        let _guard = self.locks.acquire(&partitions).await;
        let session = self.store.begin().await?;
        let mut progress = Progress::new();

        let outcome = self
            .update_in(&session, lab, case_id, &partitions, target, change, &mut progress)
            .await;
        let updated = self.finish(session, &progress, outcome).await;

        match &updated {
            Ok(record) => info!(
                %lab,
                %case_id,
                visit_date = %record.visit_date,
                daily_id = record.daily_id,
                applied = progress.applied(),
                "case updated"
            ),
            Err(err) => error!(%lab, %case_id, applied = progress.applied(), "update failed: {err}"),
        }
        updated
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_in(
        &self,
        session: &S::Session,
        lab: LabId,
        case_id: Uuid,
        partitions: &BTreeSet<Partition>,
        target: Partition,
        change: CaseUpdate,
        progress: &mut Progress,
    ) -> SequenceResult<CaseRecord> {
        lock_all(session, partitions).await?;

        let record = lookup(session, lab, case_id).await?;
        ensure_locked(&record, partitions)?;

        let details = change
            .details
            .map(|patch| {
                patch
                    .merge_into(record.details.clone())
                    .normalized()
                    .map_err(SequenceError::InvalidRequest)
            })
            .transpose()?;
        self.check_move(session, &record, target, change.daily_id)
            .await?;

        if let Some(details) = details {
            session.update(case_id, &CasePatch::details(details)).await?;
            progress.record();
        }

        self.move_in(session, &record, target, change.daily_id, progress)
            .await?;

        lookup(session, lab, case_id).await
    }

    /// Reject a move whose number is outside the allowed range. No writes.
    async fn check_move(
        &self,
        session: &S::Session,
        record: &CaseRecord,
        target: Partition,
        new_number: Option<i32>,
    ) -> SequenceResult<()> {
        if target == record.partition() {
            return match new_number {
                Some(n) if n != record.daily_id => {
                    ensure_placed(record)?;
                    let count = session.count(&target).await?;
                    self.policy.check(n, count)
                }
                _ => Ok(()),
            };
        }

        ensure_placed(record)?;
        match new_number {
            Some(n) => self.policy.check(n, next_number(session, &target).await?),
            None => Ok(()),
        }
    }

    async fn move_in(
        &self,
        session: &S::Session,
        record: &CaseRecord,
        target: Partition,
        new_number: Option<i32>,
        progress: &mut Progress,
    ) -> SequenceResult<()> {
        let source = record.partition();

        if target == source {
            if let Some(new_number) = new_number {
                renumber(session, record, new_number, self.policy, progress).await?;
            }
            return Ok(());
        }

        let old_number = record.daily_id;

        // Leave the old date as if deleted, then arrive on the new one.
        session
            .update(record.case_id, &CasePatch::number(vacate_placeholder(old_number)))
            .await?;
        progress.record();
        close_gap(session, &source, old_number, progress).await?;

        let daily_id = allocate(session, &target, new_number, self.policy, progress).await?;
        session
            .update(record.case_id, &CasePatch::relocate(target.visit_date, daily_id))
            .await?;
        progress.record();
        Ok(())
    }

    /* ---------------- delete ---------------- */

    /// Delete one case and pull the cases above it down by one.
    pub async fn delete(&self, lab: LabId, case_id: Uuid) -> SequenceResult<CaseRecord> {
        let current = lookup(&self.store, lab, case_id).await?;
        let partitions = BTreeSet::from([current.partition()]);

        let _guard = self.locks.acquire(&partitions).await;
        let session = self.store.begin().await?;
        let mut progress = Progress::new();

        let outcome = self
            .delete_in(&session, lab, case_id, &partitions, &mut progress)
            .await;
        let deleted = self.finish(session, &progress, outcome).await;

        match &deleted {
            Ok(record) => info!(
                %lab,
                %case_id,
                visit_date = %record.visit_date,
                daily_id = record.daily_id,
                applied = progress.applied(),
                "case deleted"
            ),
            Err(err) => error!(%lab, %case_id, applied = progress.applied(), "delete failed: {err}"),
        }
        deleted
    }

    async fn delete_in(
        &self,
        session: &S::Session,
        lab: LabId,
        case_id: Uuid,
        partitions: &BTreeSet<Partition>,
        progress: &mut Progress,
    ) -> SequenceResult<CaseRecord> {
        lock_all(session, partitions).await?;

        let record = lookup(session, lab, case_id).await?;
        ensure_locked(&record, partitions)?;
        let partition = record.partition();

        session.delete(case_id).await?;
        progress.record();

        if record.daily_id > 0 {
            close_gap(session, &partition, record.daily_id, progress).await?;
        } else {
            // A stranded case says nothing about where the gap is.
            compact(session, &partition, progress).await?;
        }
        Ok(record)
    }

    /// Delete a batch of cases, then compact every date the batch touched.
    pub async fn bulk_delete(&self, lab: LabId, case_ids: &[Uuid]) -> SequenceResult<BulkDeleteReport> {
        let ids: Vec<Uuid> = case_ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Err(SequenceError::InvalidRequest("case_ids must not be empty".into()));
        }

        let found = self.store.fetch_many(&ids).await?;
        let partitions = Self::owned_partitions(lab, &ids, &found)?;

        let _guard = self.locks.acquire(&partitions).await;
        let session = self.store.begin().await?;
        let mut progress = Progress::new();

        let outcome = self
            .bulk_delete_in(&session, lab, &ids, &partitions, &mut progress)
            .await;
        let report = self.finish(session, &progress, outcome).await;

        match &report {
            Ok(r) => info!(
                %lab,
                deleted = r.deleted,
                partitions = r.compacted.len(),
                applied = progress.applied(),
                "cases bulk deleted"
            ),
            Err(err) => error!(%lab, requested = ids.len(), applied = progress.applied(), "bulk delete failed: {err}"),
        }
        report
    }

    fn owned_partitions(
        lab: LabId,
        ids: &[Uuid],
        found: &[CaseRecord],
    ) -> SequenceResult<BTreeSet<Partition>> {
        for id in ids {
            let owned = found.iter().any(|r| r.case_id == *id && r.lab_id == lab);
            if !owned {
                return Err(SequenceError::NotFound(*id));
            }
        }
        Ok(found.iter().map(CaseRecord::partition).collect())
    }

    async fn bulk_delete_in(
        &self,
        session: &S::Session,
        lab: LabId,
        ids: &[Uuid],
        partitions: &BTreeSet<Partition>,
        progress: &mut Progress,
    ) -> SequenceResult<BulkDeleteReport> {
        lock_all(session, partitions).await?;

        let found = session.fetch_many(ids).await?;
        let touched = Self::owned_partitions(lab, ids, &found)?;
        for record in &found {
            ensure_locked(record, partitions)?;
        }

        let deleted = session.delete_many(ids).await?;
        progress.record();

        let mut compacted = Vec::with_capacity(touched.len());
        for partition in touched {
            let renumbered = compact(session, &partition, progress).await?;
            compacted.push(PartitionCompaction {
                partition,
                renumbered,
            });
        }

        Ok(BulkDeleteReport { deleted, compacted })
    }

    /* ---------------- recovery ---------------- */

    /// Re-run compaction on one date. Writes nothing when already dense.
    pub async fn compact(&self, partition: Partition) -> SequenceResult<u32> {
        let _guard = self.locks.acquire_one(partition).await;
        let session = self.store.begin().await?;
        let mut progress = Progress::new();

        let outcome = self.compact_in(&session, partition, &mut progress).await;
        let renumbered = self.finish(session, &progress, outcome).await;

        match &renumbered {
            Ok(n) => info!(%partition, renumbered = *n, "partition recompacted"),
            Err(err) => error!(%partition, applied = progress.applied(), "recompaction failed: {err}"),
        }
        renumbered
    }

    async fn compact_in(
        &self,
        session: &S::Session,
        partition: Partition,
        progress: &mut Progress,
    ) -> SequenceResult<u32> {
        session.lock_partition(&partition).await?;
        compact(session, &partition, progress).await
    }
}
