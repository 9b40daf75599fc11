//! Typed events flowing up to the coordinator.

use fc_live::HealthSample;

/// Emitted by the health monitor's scheduler task.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// One full probe pass finished.
    HealthCheckCompleted(Vec<(String, HealthSample)>),
    /// A subject hit its consecutive-failure bound.
    ServerDown(String),
    /// Healthy fraction at or below the degraded line but above critical.
    SystemDegraded { healthy: usize, total: usize },
    /// Healthy fraction at or below the critical line.
    CriticalFailure(String),
}

/// Emitted by supervisors, tagged with the owning server id.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Initialized {
        server_id: String,
        identity_count: usize,
    },
    SessionCreated {
        server_id: String,
        session_name: String,
    },
    SessionError {
        server_id: String,
        reason: String,
    },
    RecoveryFailed {
        server_id: String,
        reason: String,
    },
    Stopped {
        server_id: String,
    },
}
