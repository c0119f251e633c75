//! Messenger configuration

use std::time::Duration;

use envoy_wire::DEFAULT_MAX_FRAME_SIZE;

/// Tunables injected at construction time
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Delay between failed dial attempts to the same address
    pub redial_interval: Duration,
    /// Deadline for a request or publish, retries included
    pub request_timeout: Duration,
    /// Upper bound on how long `join` waits for the mesh to converge
    pub join_timeout: Duration,
    /// Bound on connect plus join exchange for a single link
    pub handshake_timeout: Duration,
    /// Largest frame accepted from a peer
    pub max_frame_size: usize,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            redial_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            join_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
