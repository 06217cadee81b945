use serde::Serialize;

/// Overall health verdict (§4.8). `Degraded` does not fail readiness;
/// `Unhealthy` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// HTTP status code `GET /health` should return for this verdict (§6).
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::Healthy | Self::Degraded => 200,
            Self::Unhealthy => 503,
        }
    }
}

/// Thresholds used to turn raw samples into a verdict. Mirrors
/// `ws_resource_guard::GuardConfig`'s CPU thresholds so the two stay
/// consistent without `ws-metrics` depending on that crate.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub cpu_degraded_percent: f64,
    pub cpu_unhealthy_percent: f64,
    pub capacity_degraded_percent: f64,
    pub goroutines_degraded_percent: f64,
    pub slow_client_rate_degraded: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            cpu_degraded_percent: 75.0,
            cpu_unhealthy_percent: 90.0,
            capacity_degraded_percent: 80.0,
            goroutines_degraded_percent: 80.0,
            slow_client_rate_degraded: 0.01,
        }
    }
}

/// Raw samples fed into the aggregation (§4.8: "Kafka presence, capacity %,
/// CPU %, memory %, goroutines %, slow-client rate").
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    pub kafka_connected: bool,
    pub capacity_percent: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub goroutines_percent: f64,
    pub slow_client_rate: f64,
}

/// The `/health` JSON body (§4.8, §6).
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub kafka_connected: bool,
    pub capacity_percent: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub goroutines_percent: f64,
    pub slow_client_rate: f64,
}

impl HealthReport {
    /// Aggregate `inputs` into a verdict using `thresholds` (§4.8).
    #[must_use]
    pub fn aggregate(inputs: HealthInputs, thresholds: HealthThresholds) -> Self {
        let status = if !inputs.kafka_connected
            || inputs.capacity_percent >= 100.0
            || inputs.cpu_percent >= thresholds.cpu_unhealthy_percent
            || inputs.memory_percent >= 100.0
        {
            HealthStatus::Unhealthy
        } else if inputs.cpu_percent >= thresholds.cpu_degraded_percent
            || inputs.capacity_percent >= thresholds.capacity_degraded_percent
            || inputs.goroutines_percent >= thresholds.goroutines_degraded_percent
            || inputs.slow_client_rate >= thresholds.slow_client_rate_degraded
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            kafka_connected: inputs.kafka_connected,
            capacity_percent: inputs.capacity_percent,
            cpu_percent: inputs.cpu_percent,
            memory_percent: inputs.memory_percent,
            goroutines_percent: inputs.goroutines_percent,
            slow_client_rate: inputs.slow_client_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_inputs() -> HealthInputs {
        HealthInputs {
            kafka_connected: true,
            capacity_percent: 10.0,
            cpu_percent: 20.0,
            memory_percent: 30.0,
            goroutines_percent: 10.0,
            slow_client_rate: 0.0,
        }
    }

    #[test]
    fn nominal_load_is_healthy() {
        let report = HealthReport::aggregate(healthy_inputs(), HealthThresholds::default());
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.status.http_status(), 200);
    }

    #[test]
    fn kafka_disconnected_is_unhealthy() {
        let inputs = HealthInputs {
            kafka_connected: false,
            ..healthy_inputs()
        };
        let report = HealthReport::aggregate(inputs, HealthThresholds::default());
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.status.http_status(), 503);
    }

    #[test]
    fn high_cpu_degrades_before_it_fails() {
        let inputs = HealthInputs {
            cpu_percent: 80.0,
            ..healthy_inputs()
        };
        let report = HealthReport::aggregate(inputs, HealthThresholds::default());
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[test]
    fn cpu_at_unhealthy_threshold_fails_readiness() {
        let inputs = HealthInputs {
            cpu_percent: 95.0,
            ..healthy_inputs()
        };
        let report = HealthReport::aggregate(inputs, HealthThresholds::default());
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn elevated_slow_client_rate_degrades() {
        let inputs = HealthInputs {
            slow_client_rate: 0.05,
            ..healthy_inputs()
        };
        let report = HealthReport::aggregate(inputs, HealthThresholds::default());
        assert_eq!(report.status, HealthStatus::Degraded);
    }
}
