/// Decides when a full-state synchronization message and the liveness
/// heartbeat are due. State publishes fire on fingerprint change, on
/// request, or after the idle interval; heartbeats fire unconditionally on
/// their own cadence.
#[derive(Debug, Clone)]
pub struct StatePublisher {
    publish_idle_ms: u64,
    heartbeat_ms: u64,
    last_fingerprint: Option<u64>,
    last_publish_ms: Option<u64>,
    last_heartbeat_ms: Option<u64>,
    force_pending: bool,
}

impl StatePublisher {
    pub fn new(publish_idle_ms: u64, heartbeat_ms: u64) -> Self {
        Self {
            publish_idle_ms,
            heartbeat_ms,
            last_fingerprint: None,
            last_publish_ms: None,
            last_heartbeat_ms: None,
            force_pending: false,
        }
    }

    /// Requests an immediate publish on the next decision (used after any
    /// state-mutating event and on reconnect).
    pub fn force(&mut self) {
        self.force_pending = true;
    }

    /// Returns true when a state publish is due now. Consumes the pending
    /// force and records the publish when it returns true.
    pub fn should_publish(&mut self, fingerprint: u64, now_ms: u64) -> bool {
        let changed = self.last_fingerprint != Some(fingerprint);
        let idle_elapsed = match self.last_publish_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.publish_idle_ms,
            None => true,
        };

        if !(self.force_pending || changed || idle_elapsed) {
            return false;
        }

        self.force_pending = false;
        self.last_fingerprint = Some(fingerprint);
        self.last_publish_ms = Some(now_ms);
        true
    }

    /// Returns true when the liveness heartbeat is due now.
    pub fn heartbeat_due(&mut self, now_ms: u64) -> bool {
        let due = match self.last_heartbeat_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.heartbeat_ms,
            None => true,
        };
        if due {
            self.last_heartbeat_ms = Some(now_ms);
        }
        due
    }
}
