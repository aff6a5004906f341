// Diagnostic output for readiness checks, injected per connection.
use courier_common::ids::ClientId;
use std::net::SocketAddr;

use crate::counters::Readiness;

pub trait ReadinessLog: Send + Sync {
    fn record(&self, client: ClientId, remote: SocketAddr, state: &Readiness);
}

/// Emits one debug event per readiness check when `verbose` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReadinessLog {
    pub verbose: bool,
}

impl ReadinessLog for TracingReadinessLog {
    fn record(&self, client: ClientId, remote: SocketAddr, state: &Readiness) {
        if !self.verbose {
            return;
        }
        tracing::debug!(
            client_id = %client,
            remote = %remote,
            "state rdy: {:4} lastrdy: {:4} inflt: {:4}",
            state.ready,
            state.last_ready,
            state.in_flight
        );
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoReadinessLog;

impl ReadinessLog for NoReadinessLog {
    fn record(&self, _client: ClientId, _remote: SocketAddr, _state: &Readiness) {}
}
