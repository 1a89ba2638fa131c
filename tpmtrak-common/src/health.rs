//! Liveness of the worker loops, served on `/_liveness`.
//!
//! Every loop registers under a name with a deadline, and must report healthy again before
//! that deadline passes. The process is live while each registered loop is within its
//! deadline. A registry nothing has registered with yet is not live.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

type Components = Arc<RwLock<BTreeMap<String, ComponentStatus>>>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, has not reported yet.
    Starting,
    /// Reported healthy, must report again before this instant.
    HealthyUntil(OffsetDateTime),
    /// Missed its deadline.
    Stalled,
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ComponentStatus::Starting => write!(f, "starting"),
            ComponentStatus::HealthyUntil(until) => write!(f, "healthy until {until}"),
            ComponentStatus::Stalled => write!(f, "stalled"),
        }
    }
}

/// A snapshot of the registry, answered as `200 OK` when live and `500` otherwise.
#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: BTreeMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let body: String = self
            .components
            .iter()
            .map(|(name, status)| format!("{name}: {status}\n"))
            .collect();

        (code, body).into_response()
    }
}

/// Handed to a loop so it can report itself healthy.
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Mark the component healthy for another `deadline`.
    pub fn report_healthy(&self) {
        let until = OffsetDateTime::now_utc() + self.deadline;
        match self.components.write() {
            Ok(mut components) => {
                _ = components.insert(
                    self.component.clone(),
                    ComponentStatus::HealthyUntil(until),
                );
            }
            // Reports stop landing: the liveness probe fails and the process gets restarted.
            Err(_) => warn!("failed to report {} healthy: poisoned lock", self.component),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register `component` as `Starting`. It stalls unless the returned handle reports
    /// healthy at least once every `deadline`.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        if let Ok(mut components) = self.components.write() {
            _ = components.insert(component.to_owned(), ComponentStatus::Starting);
        }

        HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        }
    }

    /// Current status of every component. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned lock", self.name);
            return HealthStatus::default();
        };

        let now = OffsetDateTime::now_utc();
        let components: BTreeMap<String, ComponentStatus> = components
            .iter()
            .map(|(name, status)| {
                let status = match status {
                    ComponentStatus::HealthyUntil(until) if *until <= now => {
                        ComponentStatus::Stalled
                    }
                    other => *other,
                };
                (name.clone(), status)
            })
            .collect();

        let healthy = !components.is_empty()
            && components
                .values()
                .all(|status| matches!(status, ComponentStatus::HealthyUntil(_)));

        if healthy {
            info!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, components);
        }

        HealthStatus {
            healthy,
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_not_live() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn worker_is_live_once_it_reports() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker", Duration::seconds(30));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("worker"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn missed_deadline_stalls_the_worker() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker", Duration::seconds(-1));
        handle.report_healthy();

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("worker"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn one_stalled_component_fails_the_check() {
        let registry = HealthRegistry::new("liveness");
        registry
            .register("worker", Duration::seconds(30))
            .report_healthy();
        registry
            .register("server", Duration::seconds(-1))
            .report_healthy();

        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
