// Health Probes
//
// Liveness is unconditional; readiness pings the row store and cache and
// fails closed with a per-service status map.

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::http::AppState;
use crate::repo::Database;

/// A dependency that can answer a cheap liveness ping.
#[async_trait]
pub trait Pingable: Send + Sync {
    fn name(&self) -> &'static str;
    async fn ping(&self) -> anyhow::Result<()>;
}

pub struct DbPing(pub Arc<Database>);

#[async_trait]
impl Pingable for DbPing {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn ping(&self) -> anyhow::Result<()> {
        self.0.ping().await
    }
}

pub struct CachePing(pub Arc<dyn CacheStore>);

#[async_trait]
impl Pingable for CachePing {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn ping(&self) -> anyhow::Result<()> {
        self.0.ping().await
    }
}

pub struct HealthChecker {
    dependencies: Vec<Arc<dyn Pingable>>,
}

impl HealthChecker {
    pub fn new(dependencies: Vec<Arc<dyn Pingable>>) -> Self {
        Self { dependencies }
    }

    /// Ping every dependency; returns overall readiness and a name->state map.
    pub async fn check(&self) -> (bool, BTreeMap<String, String>) {
        let mut services = BTreeMap::new();
        let mut ready = true;
        for dep in &self.dependencies {
            let state = match dep.ping().await {
                Ok(()) => "up",
                Err(_) => {
                    ready = false;
                    "down"
                }
            };
            services.insert(dep.name().to_string(), state.to_string());
        }
        (ready, services)
    }
}

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub services: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<&'static str>,
}

fn body(status: &str, services: BTreeMap<String, String>, with_version: bool) -> HealthBody {
    HealthBody {
        status: status.to_string(),
        timestamp: Utc::now(),
        services,
        version: with_version.then_some(env!("CARGO_PKG_VERSION")),
    }
}

pub async fn livez() -> Json<HealthBody> {
    Json(body("alive", BTreeMap::new(), false))
}

pub async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<HealthBody>) {
    let (ready, services) = state.health.check().await;
    if ready {
        (StatusCode::OK, Json(body("healthy", services, false)))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(body("not_ready", services, false)),
        )
    }
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthBody>) {
    let (ready, services) = state.health.check().await;
    if ready {
        (StatusCode::OK, Json(body("healthy", services, true)))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(body("unhealthy", services, true)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDep {
        name: &'static str,
        healthy: bool,
    }

    #[async_trait]
    impl Pingable for FakeDep {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn ping(&self) -> anyhow::Result<()> {
            if self.healthy {
                Ok(())
            } else {
                Err(anyhow::anyhow!("unreachable"))
            }
        }
    }

    #[tokio::test]
    async fn readiness_fails_when_any_dependency_is_down() {
        let checker = HealthChecker::new(vec![
            Arc::new(FakeDep {
                name: "database",
                healthy: true,
            }),
            Arc::new(FakeDep {
                name: "cache",
                healthy: false,
            }),
        ]);
        let (ready, services) = checker.check().await;
        assert!(!ready);
        assert_eq!(services["database"], "up");
        assert_eq!(services["cache"], "down");
    }

    #[tokio::test]
    async fn readiness_passes_when_all_up() {
        let checker = HealthChecker::new(vec![Arc::new(FakeDep {
            name: "database",
            healthy: true,
        })]);
        let (ready, _) = checker.check().await;
        assert!(ready);
    }
}
