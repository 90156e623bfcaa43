// src/routes/case_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, CaseDetails, CaseDetailsPatch, CaseRecord},
    sequence::{BulkDeleteReport, CaseUpdate, DensityReport, NumberNotHonored},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/cases", get(list_cases).post(create_case))
        .route("/cases/bulk_delete", post(bulk_delete_cases))
        .route("/cases/sequence", get(get_sequence_report))
        .route("/cases/sequence/compact", post(compact_sequence))
        .route(
            "/cases/{case_id}",
            get(get_case).patch(update_case).delete(delete_case),
        )
}

fn parse_date(raw: &str, field: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ApiError::validation(format!("{field} must be YYYY-MM-DD")))
}

/* ============================================================
   GET /cases?date=YYYY-MM-DD
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct DateQuery {
    pub date: String,
}

pub async fn list_cases(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<DateQuery>,
) -> Result<Json<ApiOk<Vec<CaseRecord>>>, ApiError> {
    let visit_date = parse_date(&q.date, "date")?;
    let rows = state.cases.list(auth.partition(visit_date)).await?;
    Ok(Json(ApiOk { data: rows }))
}

/* ============================================================
   POST /cases
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateCaseRequest {
    pub visit_date: NaiveDate,
    pub daily_id: Option<i32>, // omit to append at the end of the day
    #[serde(flatten)]
    pub details: CaseDetails,
}

#[derive(Debug, Serialize)]
pub struct WarningObject {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CreateCaseResponse {
    pub data: CaseRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<WarningObject>,
}

/// The requested slot stays empty after a failed correction, so the date
/// is no longer dense until it is recompacted.
fn not_honored_warning(visit_date: NaiveDate, w: &NumberNotHonored) -> WarningObject {
    WarningObject {
        code: "DAILY_ID_NOT_HONORED",
        message: format!(
            "Case saved as #{} instead of the requested #{}; #{} is now empty, \
             recompact {visit_date} (POST /cases/sequence/compact) to restore numbering",
            w.assigned, w.requested, w.requested
        ),
    }
}

#[tracing::instrument(skip_all, fields(user_id = %auth.user_id, session_id = %auth.session_id))]
pub async fn create_case(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateCaseRequest>,
) -> Result<Json<CreateCaseResponse>, ApiError> {
    let details = req.details.normalized().map_err(ApiError::validation)?;

    let created = state
        .cases
        .create(auth.partition(req.visit_date), details, req.daily_id)
        .await?;

    let warning = created
        .warning
        .as_ref()
        .map(|w| not_honored_warning(req.visit_date, w));

    Ok(Json(CreateCaseResponse {
        data: created.record,
        warning,
    }))
}

/* ============================================================
   GET /cases/{id}
   ============================================================ */

pub async fn get_case(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(case_id): Path<Uuid>,
) -> Result<Json<ApiOk<CaseRecord>>, ApiError> {
    let row = state.cases.get(auth.lab_id, case_id).await?;
    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   PATCH /cases/{id}
   ============================================================ */

#[derive(Debug, Default, Deserialize)]
pub struct UpdateCaseRequest {
    pub visit_date: Option<NaiveDate>,
    pub daily_id: Option<i32>,
    #[serde(flatten)]
    pub details: CaseDetailsPatch,
}

#[tracing::instrument(skip_all, fields(user_id = %auth.user_id, session_id = %auth.session_id))]
pub async fn update_case(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(case_id): Path<Uuid>,
    Json(req): Json<UpdateCaseRequest>,
) -> Result<Json<ApiOk<CaseRecord>>, ApiError> {
    let details = (!req.details.is_empty()).then_some(req.details);

    let updated = state
        .cases
        .update(
            auth.lab_id,
            case_id,
            CaseUpdate {
                details,
                visit_date: req.visit_date,
                daily_id: req.daily_id,
            },
        )
        .await?;

    Ok(Json(ApiOk { data: updated }))
}

/* ============================================================
   DELETE /cases/{id}
   ============================================================ */

#[tracing::instrument(skip_all, fields(user_id = %auth.user_id, session_id = %auth.session_id))]
pub async fn delete_case(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(case_id): Path<Uuid>,
) -> Result<Json<ApiOk<CaseRecord>>, ApiError> {
    let deleted = state.cases.delete(auth.lab_id, case_id).await?;
    Ok(Json(ApiOk { data: deleted }))
}

/* ============================================================
   POST /cases/bulk_delete
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct BulkDeleteRequest {
    pub case_ids: Vec<Uuid>,
}

#[tracing::instrument(skip_all, fields(user_id = %auth.user_id, session_id = %auth.session_id))]
pub async fn bulk_delete_cases(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<BulkDeleteRequest>,
) -> Result<Json<ApiOk<BulkDeleteReport>>, ApiError> {
    if req.case_ids.len() > 500 {
        return Err(ApiError::validation("at most 500 case_ids per request"));
    }
    let report = state.cases.bulk_delete(auth.lab_id, &req.case_ids).await?;
    Ok(Json(ApiOk { data: report }))
}

/* ============================================================
   Sequence maintenance
   ============================================================ */

pub async fn get_sequence_report(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<DateQuery>,
) -> Result<Json<ApiOk<DensityReport>>, ApiError> {
    let visit_date = parse_date(&q.date, "date")?;
    let report = state.cases.inspect(auth.partition(visit_date)).await?;
    Ok(Json(ApiOk { data: report }))
}

#[derive(Debug, Deserialize)]
pub struct CompactRequest {
    pub date: NaiveDate,
}

#[derive(Debug, Serialize)]
pub struct CompactData {
    pub visit_date: NaiveDate,
    pub renumbered: u32,
}

#[tracing::instrument(skip_all, fields(user_id = %auth.user_id, session_id = %auth.session_id))]
pub async fn compact_sequence(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CompactRequest>,
) -> Result<Json<ApiOk<CompactData>>, ApiError> {
    let renumbered = state.cases.compact(auth.partition(req.date)).await?;
    Ok(Json(ApiOk {
        data: CompactData {
            visit_date: req.date,
            renumbered,
        },
    }))
}
