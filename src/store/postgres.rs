// src/store/postgres.rs

use async_trait::async_trait;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{CaseFilter, CaseStore, SortOrder, StoreError, StoreResult, TransactionalStore};
use crate::models::{CasePatch, CaseRecord, NewCase};
use crate::sequence::Partition;

const CASE_COLUMNS: &str = r#"
    case_id, lab_id, visit_date, daily_id,
    patient_name, patient_age, gender, phone, referring_doctor, notes, categories,
    created_at, updated_at
"#;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Unavailable(format!("db error: {err}")),
        }
    }
}

/// Case store over the `lab_case` table. Reads go straight to the pool,
/// writes go through a [`PgSession`] transaction.
#[derive(Clone)]
pub struct PgCaseStore {
    pool: PgPool,
}

impl PgCaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// One open transaction. Dropping it without commit rolls back.
pub struct PgSession {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

macro_rules! with_tx {
    ($session:expr, |$conn:ident| $body:expr) => {{
        let mut guard = $session.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::Closed)?;
        let $conn = &mut **tx;
        $body
    }};
}

/* ============================================================
   Shared SQL
   ============================================================ */

async fn query_cases<'e, E: PgExecutor<'e>>(
    exec: E,
    filter: &CaseFilter,
) -> StoreResult<Vec<CaseRecord>> {
    let direction = match filter.order {
        SortOrder::Ascending => "ASC",
        SortOrder::Descending => "DESC",
    };
    let sql = format!(
        r#"
        SELECT {CASE_COLUMNS}
        FROM lab_case
        WHERE lab_id = $1
          AND visit_date = $2
          AND ($3::int IS NULL OR daily_id >= $3)
          AND ($4::int IS NULL OR daily_id <= $4)
          AND ($5::uuid IS NULL OR case_id <> $5)
        ORDER BY daily_id {direction}, created_at {direction}, case_id {direction}
        "#
    );

    let rows = sqlx::query_as::<_, CaseRecord>(&sql)
        .bind(filter.partition.lab_id)
        .bind(filter.partition.visit_date)
        .bind(filter.min)
        .bind(filter.max)
        .bind(filter.exclude)
        .fetch_all(exec)
        .await?;
    Ok(rows)
}

async fn count_cases<'e, E: PgExecutor<'e>>(exec: E, partition: &Partition) -> StoreResult<i32> {
    let n: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM lab_case
        WHERE lab_id = $1 AND visit_date = $2
        "#,
    )
    .bind(partition.lab_id)
    .bind(partition.visit_date)
    .fetch_one(exec)
    .await?;

    i32::try_from(n).map_err(|_| StoreError::Unavailable("partition too large".into()))
}

async fn fetch_case<'e, E: PgExecutor<'e>>(exec: E, case_id: Uuid) -> StoreResult<Option<CaseRecord>> {
    let sql = format!("SELECT {CASE_COLUMNS} FROM lab_case WHERE case_id = $1");
    let row = sqlx::query_as::<_, CaseRecord>(&sql)
        .bind(case_id)
        .fetch_optional(exec)
        .await?;
    Ok(row)
}

async fn fetch_cases<'e, E: PgExecutor<'e>>(
    exec: E,
    case_ids: &[Uuid],
) -> StoreResult<Vec<CaseRecord>> {
    let sql = format!("SELECT {CASE_COLUMNS} FROM lab_case WHERE case_id = ANY($1)");
    let rows = sqlx::query_as::<_, CaseRecord>(&sql)
        .bind(case_ids)
        .fetch_all(exec)
        .await?;
    Ok(rows)
}

/* ============================================================
   Store impls
   ============================================================ */

#[async_trait]
impl CaseStore for PgCaseStore {
    async fn query(&self, filter: &CaseFilter) -> StoreResult<Vec<CaseRecord>> {
        query_cases(&self.pool, filter).await
    }

    async fn count(&self, partition: &Partition) -> StoreResult<i32> {
        count_cases(&self.pool, partition).await
    }

    async fn fetch(&self, case_id: Uuid) -> StoreResult<Option<CaseRecord>> {
        fetch_case(&self.pool, case_id).await
    }

    async fn fetch_many(&self, case_ids: &[Uuid]) -> StoreResult<Vec<CaseRecord>> {
        fetch_cases(&self.pool, case_ids).await
    }

    async fn insert(&self, new_case: &NewCase) -> StoreResult<CaseRecord> {
        let session = self.begin().await?;
        let record = session.insert(new_case).await?;
        self.commit(session).await?;
        Ok(record)
    }

    async fn update(&self, case_id: Uuid, patch: &CasePatch) -> StoreResult<()> {
        let session = self.begin().await?;
        session.update(case_id, patch).await?;
        self.commit(session).await
    }

    async fn delete(&self, case_id: Uuid) -> StoreResult<()> {
        let session = self.begin().await?;
        session.delete(case_id).await?;
        self.commit(session).await
    }

    async fn delete_many(&self, case_ids: &[Uuid]) -> StoreResult<u64> {
        let session = self.begin().await?;
        let n = session.delete_many(case_ids).await?;
        self.commit(session).await?;
        Ok(n)
    }
}

#[async_trait]
impl TransactionalStore for PgCaseStore {
    const ATOMIC: bool = true;

    type Session = PgSession;

    async fn begin(&self) -> StoreResult<PgSession> {
        let tx = self.pool.begin().await?;
        Ok(PgSession {
            tx: Mutex::new(Some(tx)),
        })
    }

    async fn commit(&self, session: PgSession) -> StoreResult<()> {
        let tx = session.tx.into_inner().ok_or(StoreError::Closed)?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl CaseStore for PgSession {
    async fn query(&self, filter: &CaseFilter) -> StoreResult<Vec<CaseRecord>> {
        with_tx!(self, |conn| query_cases(conn, filter).await)
    }

    async fn count(&self, partition: &Partition) -> StoreResult<i32> {
        with_tx!(self, |conn| count_cases(conn, partition).await)
    }

    async fn fetch(&self, case_id: Uuid) -> StoreResult<Option<CaseRecord>> {
        with_tx!(self, |conn| fetch_case(conn, case_id).await)
    }

    async fn fetch_many(&self, case_ids: &[Uuid]) -> StoreResult<Vec<CaseRecord>> {
        with_tx!(self, |conn| fetch_cases(conn, case_ids).await)
    }

    async fn insert(&self, new_case: &NewCase) -> StoreResult<CaseRecord> {
        let sql = format!(
            r#"
            INSERT INTO lab_case (
              lab_id, visit_date, daily_id,
              patient_name, patient_age, gender, phone, referring_doctor, notes, categories
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            RETURNING {CASE_COLUMNS}
            "#
        );
        let details = &new_case.details;

        with_tx!(self, |conn| {
            let row = sqlx::query_as::<_, CaseRecord>(&sql)
                .bind(new_case.partition.lab_id)
                .bind(new_case.partition.visit_date)
                .bind(new_case.daily_id)
                .bind(&details.patient_name)
                .bind(details.patient_age)
                .bind(details.gender.as_deref())
                .bind(details.phone.as_deref())
                .bind(details.referring_doctor.as_deref())
                .bind(details.notes.as_deref())
                .bind(&details.categories)
                .fetch_one(conn)
                .await?;
            Ok(row)
        })
    }

    async fn update(&self, case_id: Uuid, patch: &CasePatch) -> StoreResult<()> {
        let result = with_tx!(self, |conn| match &patch.details {
            Some(details) => {
                sqlx::query(
                    r#"
                    UPDATE lab_case
                    SET visit_date = COALESCE($2, visit_date),
                        daily_id = COALESCE($3, daily_id),
                        patient_name = $4,
                        patient_age = $5,
                        gender = $6,
                        phone = $7,
                        referring_doctor = $8,
                        notes = $9,
                        categories = $10,
                        updated_at = now()
                    WHERE case_id = $1
                    "#,
                )
                .bind(case_id)
                .bind(patch.visit_date)
                .bind(patch.daily_id)
                .bind(&details.patient_name)
                .bind(details.patient_age)
                .bind(details.gender.as_deref())
                .bind(details.phone.as_deref())
                .bind(details.referring_doctor.as_deref())
                .bind(details.notes.as_deref())
                .bind(&details.categories)
                .execute(conn)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE lab_case
                    SET visit_date = COALESCE($2, visit_date),
                        daily_id = COALESCE($3, daily_id),
                        updated_at = now()
                    WHERE case_id = $1
                    "#,
                )
                .bind(case_id)
                .bind(patch.visit_date)
                .bind(patch.daily_id)
                .execute(conn)
                .await?
            }
        });

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(case_id));
        }
        Ok(())
    }

    async fn delete(&self, case_id: Uuid) -> StoreResult<()> {
        let result = with_tx!(self, |conn| {
            sqlx::query("DELETE FROM lab_case WHERE case_id = $1")
                .bind(case_id)
                .execute(conn)
                .await?
        });

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(case_id));
        }
        Ok(())
    }

    async fn delete_many(&self, case_ids: &[Uuid]) -> StoreResult<u64> {
        let result = with_tx!(self, |conn| {
            sqlx::query("DELETE FROM lab_case WHERE case_id = ANY($1)")
                .bind(case_ids)
                .execute(conn)
                .await?
        });
        Ok(result.rows_affected())
    }

    async fn lock_partition(&self, partition: &Partition) -> StoreResult<()> {
        // Released automatically at commit or rollback.
        with_tx!(self, |conn| {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(partition.to_string())
                .execute(conn)
                .await?
        });
        Ok(())
    }
}
