use crate::models::AppState;
use axum::Router;

pub mod case_routes;
pub mod health_routes;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", case_routes::router())
        .merge(health_routes::router())
        .with_state(state)
}
