use serde::{Deserialize, Serialize};

/// Which probe is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthCheckTag {
    Startup,
    Readiness,
    Liveness,
}

/// Ordered worst first, so the aggregate of several checks is their `min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    Unhealthy,
    Degraded,
    Healthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub description: Option<String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            description: None,
        }
    }

    pub fn unhealthy(description: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            description: Some(description.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Worst of both; descriptions are concatenated.
    pub fn combine(self, other: HealthReport) -> HealthReport {
        let description = match (self.description, other.description) {
            (Some(a), Some(b)) => Some(format!("{a}; {b}")),
            (a, b) => a.or(b),
        };
        HealthReport {
            status: self.status.min(other.status),
            description,
        }
    }
}

impl From<HealthStatus> for HealthReport {
    fn from(status: HealthStatus) -> Self {
        Self {
            status,
            description: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_report_is_the_worst() {
        let report = HealthReport::healthy()
            .combine(HealthStatus::Degraded.into())
            .combine(HealthReport::unhealthy("queue down"))
            .combine(HealthReport::unhealthy("store down"));

        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.description.as_deref(), Some("queue down; store down"));
    }
}
