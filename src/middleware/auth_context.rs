use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use chrono::NaiveDate;
use headers::{Authorization, authorization::Bearer};
use uuid::Uuid;

use crate::auth::hash_access_token;
use crate::config::Tenancy;
use crate::error::ApiError;
use crate::models::AppState;
use crate::sequence::{LabId, Partition};

/// Caller resolved from a bearer session issued by the auth provider.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub lab_id: LabId,
    pub session_id: Uuid,
}

impl AuthContext {
    /// Partition key for `visit_date` in this caller's lab.
    pub fn partition(&self, visit_date: NaiveDate) -> Partition {
        Partition::new(self.lab_id, visit_date)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SessionLookupRow {
    session_id: Uuid,
    user_id: Uuid,
    lab_id: Uuid,
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            // Extract Authorization: Bearer <token>
            let TypedHeader(authz): TypedHeader<Authorization<Bearer>> =
                TypedHeader::from_request_parts(parts, state)
                    .await
                    .map_err(|_| ApiError::session_expired())?;

            let token_hash = hash_access_token(authz.token());

            let row: SessionLookupRow = sqlx::query_as::<_, SessionLookupRow>(
                r#"
                SELECT session_id, user_id, lab_id
                FROM lab_session
                WHERE session_token_hash = $1
                  AND revoked_at IS NULL
                  AND expires_at > now()
                "#,
            )
            .bind(&token_hash)
            .fetch_optional(&state.db)
            .await
            .map_err(|e| ApiError::Unavailable("STORE_UNAVAILABLE", format!("db error: {e}")))?
            .ok_or_else(ApiError::session_expired)?;

            // Touch last_seen_at (best-effort)
            let _ = sqlx::query(
                r#"
                UPDATE lab_session
                SET last_seen_at = now()
                WHERE session_id = $1
                "#,
            )
            .bind(row.session_id)
            .execute(&state.db)
            .await;

            let lab_id = match state.tenancy {
                Tenancy::Single => LabId::SINGLE,
                Tenancy::Multi => LabId(row.lab_id),
            };

            Ok(AuthContext {
                user_id: row.user_id,
                lab_id,
                session_id: row.session_id,
            })
        }
    }
}
