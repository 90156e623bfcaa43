//! Lab case server: per-day case numbering over Postgres, served with axum.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod sequence;
pub mod store;
