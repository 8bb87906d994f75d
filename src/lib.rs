// trackbeam - Multi-Tenant Web Analytics Service
//
// Ingests beacon and POST tracking hits, normalizes and persists them to
// Postgres, memoizes aggregates in Redis, and serves an authenticated API.

pub mod cache;
pub mod classify;
pub mod config;
pub mod error;
pub mod http;
pub mod ident;
pub mod metrics;
pub mod models;
pub mod repo;
pub mod services;
pub mod validators;

// Re-export commonly used types
pub use config::Config;
pub use error::AppError;
pub use metrics::AppMetrics;
pub use models::*;
