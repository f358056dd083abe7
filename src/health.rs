// knhk-registry: Health check support

// ACCEPTABLE: Mutex poisoning .expect() is allowed in this module (unrecoverable state)
#![allow(clippy::expect_used)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Health status of one tracked component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
}

#[derive(Debug, Clone)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub last_check: Instant,
    /// Expected heartbeat cadence. A component that goes this long without a
    /// heartbeat is considered stalled. `None` for components with no known
    /// cadence (reported healthy until explicitly updated).
    pub max_interval: Option<Duration>,
}

impl ComponentHealth {
    pub fn new(name: String, max_interval: Option<Duration>) -> Self {
        Self { name, status: HealthStatus::Healthy, message: "OK".to_string(), last_check: Instant::now(), max_interval }
    }

    pub fn update(&mut self, status: HealthStatus, message: String) {
        self.status = status;
        self.message = message;
        self.last_check = Instant::now();
    }

    /// Flip a stalled component to `Unhealthy`. Leaves a component already
    /// `Unhealthy` for some other reason alone.
    fn refresh_staleness(&mut self) {
        if self.status == HealthStatus::Unhealthy {
            return;
        }
        if let Some(max_interval) = self.max_interval {
            if self.last_check.elapsed() > max_interval {
                self.status = HealthStatus::Unhealthy;
                self.message = format!("no heartbeat in over {max_interval:?}");
            }
        }
    }
}

/// Tracks process liveness plus the health of the two background workers
/// every registry instance runs: the timing-wheel driver and the
/// ack-retransmit scanner. Readiness degrades if either stops reporting in,
/// whether it reports an explicit failure or simply stops ticking.
pub struct HealthChecker {
    components: Arc<Mutex<HashMap<String, ComponentHealth>>>,
    server_start_time: Instant,
}

pub const WHEEL_COMPONENT: &str = "timing_wheel";
pub const ACK_SCANNER_COMPONENT: &str = "ack_scanner";

impl HealthChecker {
    /// `wheel_tick_interval`/`ack_scan_interval` are each worker's expected
    /// heartbeat cadence; a worker silent for longer than its interval is
    /// reported `Unhealthy` (see `ComponentHealth::refresh_staleness`).
    pub fn new(wheel_tick_interval: Duration, ack_scan_interval: Duration) -> Self {
        let checker = Self { components: Arc::new(Mutex::new(HashMap::new())), server_start_time: Instant::now() };
        checker.register_component(WHEEL_COMPONENT.to_string(), Some(wheel_tick_interval));
        checker.register_component(ACK_SCANNER_COMPONENT.to_string(), Some(ack_scan_interval));
        checker
    }

    pub fn register_component(&self, name: String, max_interval: Option<Duration>) {
        let mut components = self.components.lock().expect("health components mutex poisoned");
        components.insert(name.clone(), ComponentHealth::new(name, max_interval));
    }

    pub fn update_component(&self, name: &str, status: HealthStatus, message: String) {
        let mut components = self.components.lock().expect("health components mutex poisoned");
        if let Some(component) = components.get_mut(name) {
            component.update(status, message);
        }
    }

    /// Record that a background worker completed a pass (wheel tick,
    /// ack-scanner sweep): keeps its status healthy and its staleness clock
    /// reset.
    pub fn heartbeat(&self, component: &str) {
        self.update_component(component, HealthStatus::Healthy, "OK".to_string());
    }

    pub fn check_liveness(&self) -> (bool, String) {
        let uptime = self.server_start_time.elapsed();
        (true, format!("registry is running (uptime: {uptime:?})"))
    }

    pub fn check_readiness(&self) -> (bool, String) {
        let status = self.get_health_status();
        match status {
            HealthStatus::Healthy => (true, "ready".to_string()),
            HealthStatus::Degraded => (true, "degraded".to_string()),
            HealthStatus::Unhealthy => (false, "unhealthy: a background worker is not reporting".to_string()),
        }
    }

    pub fn get_health_status(&self) -> HealthStatus {
        let mut components = self.components.lock().expect("health components mutex poisoned");
        let mut has_unhealthy = false;
        let mut has_degraded = false;
        for component in components.values_mut() {
            component.refresh_staleness();
            match component.status {
                HealthStatus::Unhealthy => has_unhealthy = true,
                HealthStatus::Degraded => has_degraded = true,
                HealthStatus::Healthy => {}
            }
        }
        if has_unhealthy {
            HealthStatus::Unhealthy
        } else if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

impl Default for HealthChecker {
    /// Matches `RegistryConfig::default()`'s `wheel.tick_ms`/`ack.scan_interval_ms`.
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_millis(300))
    }
}
