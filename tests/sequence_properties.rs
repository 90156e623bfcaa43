//! Numbering properties of the case lifecycle, run against the in-memory store.

use chrono::NaiveDate;
use lab_case_server::models::{CaseDetails, CaseRecord};
use lab_case_server::sequence::{CaseService, LabId, Partition, RangePolicy};
use lab_case_server::store::MemoryCaseStore;
use uuid::Uuid;

fn lab() -> LabId {
    LabId(Uuid::from_u128(0x1ab))
}

fn day() -> Partition {
    Partition::new(lab(), NaiveDate::from_ymd_opt(2024, 9, 16).unwrap())
}

fn details(name: &str) -> CaseDetails {
    CaseDetails {
        patient_name: name.to_string(),
        ..CaseDetails::default()
    }
}

fn service(store: &MemoryCaseStore) -> CaseService<MemoryCaseStore> {
    CaseService::new(store.clone(), RangePolicy::strict())
}

async fn number_of(store: &MemoryCaseStore, record: &CaseRecord) -> i32 {
    store
        .snapshot(record.partition())
        .await
        .into_iter()
        .find(|r| r.case_id == record.case_id)
        .map(|r| r.daily_id)
        .expect("record still present")
}

async fn assert_dense(store: &MemoryCaseStore, partition: Partition) {
    let numbers = store.numbers(partition).await;
    let expected: Vec<i32> = (1..=numbers.len() as i32).collect();
    assert_eq!(numbers, expected, "partition {partition} is not dense");
}

#[tokio::test]
async fn append_returns_count_plus_one_without_shifting() {
    let store = MemoryCaseStore::new();
    store.seed(day(), 4).await;
    let svc = service(&store);

    let created = svc.create(day(), details("new"), None).await.unwrap();

    assert_eq!(created.record.daily_id, 5);
    assert!(created.warning.is_none());
    // The insert is the only write.
    assert_eq!(store.write_count(), 1);
}

#[tokio::test]
async fn manual_insert_shifts_following_cases() {
    let store = MemoryCaseStore::new();
    let seeded = store.seed(day(), 5).await;
    let svc = service(&store);

    let created = svc.create(day(), details("new"), Some(3)).await.unwrap();

    assert_eq!(created.record.daily_id, 3);
    assert_eq!(number_of(&store, &seeded[0]).await, 1);
    assert_eq!(number_of(&store, &seeded[1]).await, 2);
    assert_eq!(number_of(&store, &seeded[2]).await, 4);
    assert_eq!(number_of(&store, &seeded[3]).await, 5);
    assert_eq!(number_of(&store, &seeded[4]).await, 6);
    assert_eq!(store.numbers(day()).await, vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn moving_last_case_to_second_slot() {
    let store = MemoryCaseStore::new();
    let seeded = store.seed(day(), 5).await;
    let svc = service(&store);

    let moved = svc
        .move_case(lab(), seeded[4].case_id, None, Some(2))
        .await
        .unwrap();

    assert_eq!(moved.daily_id, 2);
    assert_eq!(number_of(&store, &seeded[0]).await, 1);
    assert_eq!(number_of(&store, &seeded[1]).await, 3);
    assert_eq!(number_of(&store, &seeded[2]).await, 4);
    assert_eq!(number_of(&store, &seeded[3]).await, 5);
    assert_dense(&store, day()).await;
}

#[tokio::test]
async fn moving_second_case_to_last_slot() {
    let store = MemoryCaseStore::new();
    let seeded = store.seed(day(), 5).await;
    let svc = service(&store);

    let moved = svc
        .move_case(lab(), seeded[1].case_id, None, Some(5))
        .await
        .unwrap();

    assert_eq!(moved.daily_id, 5);
    assert_eq!(number_of(&store, &seeded[0]).await, 1);
    assert_eq!(number_of(&store, &seeded[2]).await, 2);
    assert_eq!(number_of(&store, &seeded[3]).await, 3);
    assert_eq!(number_of(&store, &seeded[4]).await, 4);
    assert_dense(&store, day()).await;
}

#[tokio::test]
async fn move_to_current_number_writes_nothing() {
    let store = MemoryCaseStore::new();
    let seeded = store.seed(day(), 5).await;
    let svc = service(&store);

    let moved = svc
        .move_case(lab(), seeded[2].case_id, None, Some(3))
        .await
        .unwrap();

    assert_eq!(moved.daily_id, 3);
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn single_delete_pulls_tail_down() {
    let store = MemoryCaseStore::new();
    let seeded = store.seed(day(), 5).await;
    let svc = service(&store);

    let deleted = svc.delete(lab(), seeded[1].case_id).await.unwrap();

    assert_eq!(deleted.daily_id, 2);
    assert_eq!(number_of(&store, &seeded[2]).await, 2);
    assert_eq!(number_of(&store, &seeded[3]).await, 3);
    assert_eq!(number_of(&store, &seeded[4]).await, 4);
    assert_eq!(store.numbers(day()).await, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn bulk_delete_renumbers_survivors_in_order() {
    let store = MemoryCaseStore::new();
    let seeded = store.seed(day(), 6).await;
    let svc = service(&store);

    let report = svc
        .bulk_delete(lab(), &[seeded[1].case_id, seeded[3].case_id])
        .await
        .unwrap();

    assert_eq!(report.deleted, 2);
    assert_eq!(report.compacted.len(), 1);
    assert_eq!(report.compacted[0].renumbered, 3);
    assert_eq!(number_of(&store, &seeded[0]).await, 1);
    assert_eq!(number_of(&store, &seeded[2]).await, 2);
    assert_eq!(number_of(&store, &seeded[4]).await, 3);
    assert_eq!(number_of(&store, &seeded[5]).await, 4);
}

#[tokio::test]
async fn compaction_twice_is_free() {
    let store = MemoryCaseStore::new();
    store.seed(day(), 5).await;
    let svc = service(&store);

    assert_eq!(svc.compact(day()).await.unwrap(), 0);
    assert_eq!(svc.compact(day()).await.unwrap(), 0);
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn density_holds_across_mixed_operations() {
    let store = MemoryCaseStore::new();
    let svc = service(&store);

    let mut ids = Vec::new();
    for (i, requested) in [None, None, Some(1), None, Some(2), Some(5), None].into_iter().enumerate() {
        let created = svc
            .create(day(), details(&format!("p{i}")), requested)
            .await
            .unwrap();
        ids.push(created.record.case_id);
        assert_dense(&store, day()).await;
    }

    svc.move_case(lab(), ids[0], None, Some(7)).await.unwrap();
    assert_dense(&store, day()).await;
    svc.move_case(lab(), ids[6], None, Some(1)).await.unwrap();
    assert_dense(&store, day()).await;

    svc.delete(lab(), ids[3]).await.unwrap();
    assert_dense(&store, day()).await;

    svc.bulk_delete(lab(), &[ids[1], ids[5]]).await.unwrap();
    assert_dense(&store, day()).await;
    assert_eq!(store.numbers(day()).await.len(), 4);

    let report = svc.inspect(day()).await.unwrap();
    assert!(report.dense);
}
