use crate::tree::props::PropFilter;
use std::time::Duration;

/// Runtime configuration for an arbordb instance.
#[derive(Debug, Clone)]
pub struct ArborConfig {
    /// Default upper bound on waiting for a synchronous command reply.
    pub command_timeout_ms: u64,
    /// Default upper bound on waiting for a query reply.
    pub query_timeout_ms: u64,
    /// How long a `Favor::Compromise` read trusts the last leadership
    /// check before re-verifying.
    pub leader_check_interval_ms: u64,
    /// Capacity of the command ingress queue.
    pub max_inflight_commands: usize,
    /// Priority assigned to async commands that do not pick one. Negative
    /// values yield to synchronous traffic.
    pub async_low_priority: i8,
    /// Properties returned when an operation does not pass
    /// `props_to_return`.
    pub default_props: PropFilter,
}

impl Default for ArborConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 15_000,
            query_timeout_ms: 15_000,
            leader_check_interval_ms: 10_000,
            max_inflight_commands: 128,
            async_low_priority: -8,
            default_props: PropFilter::default(),
        }
    }
}

impl ArborConfig {
    /// Short-deadline profile for tests and local development.
    pub fn development() -> Self {
        Self {
            command_timeout_ms: 2_000,
            query_timeout_ms: 2_000,
            ..Self::default()
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_default_props(mut self, props: PropFilter) -> Self {
        self.default_props = props;
        self
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn leader_check_interval(&self) -> Duration {
        Duration::from_millis(self.leader_check_interval_ms)
    }
}
