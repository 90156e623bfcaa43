use std::sync::Arc;

use lab_case_server::{
    config::Config,
    db,
    models::AppState,
    routes,
    sequence::{CaseService, RangePolicy},
    store::PgCaseStore,
};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg).await?;

    let policy = RangePolicy {
        allow_gaps: cfg.sequence_allow_gaps,
    };
    let state = AppState {
        db: pool.clone(),
        cases: Arc::new(CaseService::new(PgCaseStore::new(pool), policy)),
        tenancy: cfg.tenancy,
    };

    // Browser dashboards call the API cross-origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
        ]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!(tenancy = ?cfg.tenancy, allow_gaps = cfg.sequence_allow_gaps, "Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
