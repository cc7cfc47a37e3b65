//! Component health aggregation
//!
//! Every long-lived component registers a health probe; the health endpoint
//! reports the aggregate. A breaker-open database counts as degraded, not
//! unhealthy: the collector itself is still doing its job.

use serde::Serialize;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

impl Health {
    fn rank(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unhealthy => 2,
        }
    }
}

type Probe = Arc<dyn Fn() -> Health + Send + Sync>;

#[derive(Clone)]
struct RegisteredProbe {
    name: String,
    probe: Probe,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: Health,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: Health,
    pub components: Vec<ComponentHealth>,
}

#[derive(Default, Clone)]
pub struct HealthRegistry {
    probes: Arc<RwLock<Vec<RegisteredProbe>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, probe: impl Fn() -> Health + Send + Sync + 'static) {
        self.probes
            .write()
            .expect("health registry poisoned")
            .push(RegisteredProbe { name: name.into(), probe: Arc::new(probe) });
    }

    /// Aggregate report: the worst component status wins
    pub fn report(&self) -> HealthReport {
        let probes = self.probes.read().expect("health registry poisoned");
        let components: Vec<ComponentHealth> = probes
            .iter()
            .map(|p| ComponentHealth { component: p.name.clone(), status: (p.probe)() })
            .collect();

        let status = components
            .iter()
            .map(|c| c.status)
            .max_by_key(|s| s.rank())
            .unwrap_or(Health::Healthy);

        HealthReport { status, components }
    }

    /// Liveness: anything short of unhealthy is alive
    pub fn is_live(&self) -> bool {
        self.report().status != Health::Unhealthy
    }
}
