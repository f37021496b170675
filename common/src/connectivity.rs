use crate::types::ConnectionState;

/// Side effects owed on entry to a connectivity state, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEffect {
    Resubscribe,
    ForceStatePublish,
    FlushOfflineBuffer,
}

/// Result of one per-tick observation of link and session status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectivityTick {
    /// `(from, to)` when this tick crossed a state boundary.
    pub transition: Option<(ConnectionState, ConnectionState)>,
    pub effects: Vec<SyncEffect>,
    /// One-shot: the node has now been without a session long enough to
    /// call it confirmed offline (diagnostic only).
    pub confirmed_offline: bool,
}

/// Status LED timing pattern; a pure projection of the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedPattern {
    FastBlink,
    SlowBlink,
    Solid,
}

pub const LED_FAST_BLINK_MS: u64 = 200;
pub const LED_SLOW_BLINK_MS: u64 = 900;

impl LedPattern {
    pub fn for_state(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Disconnected => Self::FastBlink,
            ConnectionState::LinkOnly => Self::SlowBlink,
            ConnectionState::FullySynced => Self::Solid,
        }
    }

    /// Whether the LED should be lit at `now_ms`.
    pub fn is_lit(self, now_ms: u64) -> bool {
        match self {
            Self::FastBlink => (now_ms / LED_FAST_BLINK_MS) % 2 == 0,
            Self::SlowBlink => (now_ms / LED_SLOW_BLINK_MS) % 2 == 0,
            Self::Solid => true,
        }
    }
}

/// Tracks link and session status. Transitions come only from direct
/// observation each tick; the sole timer is the confirmed-offline
/// diagnostic.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    state: ConnectionState,
    confirmed_offline_ms: u64,
    no_session_since_ms: Option<u64>,
    confirmed_offline_logged: bool,
}

impl ConnectionTracker {
    pub fn new(confirmed_offline_ms: u64) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            confirmed_offline_ms,
            no_session_since_ms: None,
            confirmed_offline_logged: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn led_pattern(&self) -> LedPattern {
        LedPattern::for_state(self.state)
    }

    pub fn observe(&mut self, link_up: bool, session_up: bool, now_ms: u64) -> ConnectivityTick {
        let mut tick = ConnectivityTick::default();

        let next = match (link_up, session_up) {
            (false, _) => ConnectionState::Disconnected,
            (true, false) => ConnectionState::LinkOnly,
            (true, true) => ConnectionState::FullySynced,
        };

        if next != self.state {
            tick.transition = Some((self.state, next));
            if next == ConnectionState::FullySynced {
                tick.effects = vec![
                    SyncEffect::Resubscribe,
                    SyncEffect::ForceStatePublish,
                    SyncEffect::FlushOfflineBuffer,
                ];
            }
            self.state = next;
        }

        if self.state == ConnectionState::FullySynced {
            self.no_session_since_ms = None;
            self.confirmed_offline_logged = false;
        } else {
            let since = *self.no_session_since_ms.get_or_insert(now_ms);
            if !self.confirmed_offline_logged
                && now_ms.saturating_sub(since) >= self.confirmed_offline_ms
            {
                self.confirmed_offline_logged = true;
                tick.confirmed_offline = true;
            }
        }

        tick
    }
}
