use std::time::Duration;

/// Timing for one supervised process.
///
/// The parent pulses every `interval`; the monitored side gives up after
/// `pulse_timeout()`, three missed intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// How long to wait for the child to exit after a forced kill.
    pub kill_timeout: Duration,
    /// How long to wait for each output forwarder to drain.
    pub join_timeout: Duration,
    /// How long `Supervisor::stop` waits for the monitored side to finish.
    pub stop_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            kill_timeout: Duration::from_secs(2),
            join_timeout: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl HeartbeatConfig {
    pub fn pulse_timeout(&self) -> Duration {
        self.interval * 3
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_kill_timeout(mut self, limit: Duration) -> Self {
        self.kill_timeout = limit;
        self
    }

    pub fn with_join_timeout(mut self, limit: Duration) -> Self {
        self.join_timeout = limit;
        self
    }

    pub fn with_stop_timeout(mut self, limit: Duration) -> Self {
        self.stop_timeout = limit;
        self
    }
}
