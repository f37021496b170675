use crate::{
    config::{PersistedSwitchState, PersistedSwitchStates, SwitchConfig},
    types::{ChangeOrigin, SwitchChange, SwitchMode, SwitchStateEntry},
};

/// One controlled relay with its debounce bookkeeping.
#[derive(Debug, Clone)]
pub struct SwitchRuntime {
    pub config: SwitchConfig,
    logical_state: bool,
    manual_override: bool,
    triggered_by_motion: bool,

    last_raw_level: bool,
    last_change_ms: u64,
    stable_level: bool,
    last_logical_input: bool,
    seeded: bool,
}

impl SwitchRuntime {
    fn new(config: SwitchConfig, restored: Option<&PersistedSwitchState>) -> Self {
        let logical_state = restored.map(|s| s.state).unwrap_or(config.default_state);
        let manual_override = restored.map(|s| s.manual_override).unwrap_or(false);
        Self {
            config,
            logical_state,
            manual_override,
            triggered_by_motion: false,
            last_raw_level: false,
            last_change_ms: 0,
            stable_level: false,
            last_logical_input: false,
            seeded: false,
        }
    }

    pub fn logical_state(&self) -> bool {
        self.logical_state
    }

    pub fn manual_override(&self) -> bool {
        self.manual_override
    }

    pub fn triggered_by_motion(&self) -> bool {
        self.triggered_by_motion
    }
}

/// Owns the array of switch states. Sole writer of logical state; every
/// mutation is returned as a [`SwitchChange`] so the caller can drive the
/// relay pin, persistence, and publishing in tick order.
#[derive(Debug, Clone)]
pub struct SwitchBank {
    switches: Vec<SwitchRuntime>,
    debounce_ms: u64,
}

impl SwitchBank {
    pub fn new(
        configs: &[SwitchConfig],
        restored: &PersistedSwitchStates,
        debounce_ms: u64,
    ) -> Self {
        let switches = configs
            .iter()
            .map(|config| SwitchRuntime::new(config.clone(), restored.state_for(config.relay_pin)))
            .collect();
        Self {
            switches,
            debounce_ms,
        }
    }

    pub fn switches(&self) -> &[SwitchRuntime] {
        &self.switches
    }

    pub fn len(&self) -> usize {
        self.switches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.switches.is_empty()
    }

    fn by_relay_pin_mut(&mut self, pin: i32) -> Option<&mut SwitchRuntime> {
        self.switches.iter_mut().find(|s| s.config.relay_pin == pin)
    }

    /// Feeds one raw input sample into switch `index`. A transition is only
    /// interpreted once the raw level has held steady for the full debounce
    /// window; flips inside the window reset it.
    pub fn apply_manual_sample(
        &mut self,
        index: usize,
        raw_level: bool,
        now_ms: u64,
    ) -> Option<SwitchChange> {
        let debounce_ms = self.debounce_ms;
        let switch = self.switches.get_mut(index)?;
        if !switch.config.manual_enabled || switch.config.manual_pin < 0 {
            return None;
        }

        if !switch.seeded {
            switch.seeded = true;
            switch.last_raw_level = raw_level;
            switch.stable_level = raw_level;
            switch.last_logical_input = switch.config.polarity.is_active(raw_level);
            switch.last_change_ms = now_ms;
            return None;
        }

        if raw_level != switch.last_raw_level {
            switch.last_raw_level = raw_level;
            switch.last_change_ms = now_ms;
            return None;
        }

        if now_ms.saturating_sub(switch.last_change_ms) < debounce_ms {
            return None;
        }

        if raw_level == switch.stable_level {
            return None;
        }
        switch.stable_level = raw_level;

        let active = switch.config.polarity.is_active(raw_level);
        let was_active = switch.last_logical_input;
        switch.last_logical_input = active;

        let desired = match switch.config.mode {
            SwitchMode::Momentary => {
                if active && !was_active {
                    !switch.logical_state
                } else {
                    return None;
                }
            }
            SwitchMode::Maintained => {
                if active == switch.logical_state {
                    return None;
                }
                active
            }
        };

        let previous = switch.logical_state;
        switch.logical_state = desired;
        switch.manual_override = true;
        switch.triggered_by_motion = false;

        Some(SwitchChange {
            pin: switch.config.relay_pin,
            physical_pin: switch.config.manual_pin,
            previous,
            new_state: desired,
            origin: ChangeOrigin::Manual,
        })
    }

    /// Applies a validated remote command. A remote command is authoritative:
    /// it ends any standing manual override. Returns `None` for pins that do
    /// not map to a configured switch.
    pub fn apply_remote_command(&mut self, pin: i32, state: bool) -> Option<SwitchChange> {
        let switch = self.by_relay_pin_mut(pin)?;
        let previous = switch.logical_state;
        switch.logical_state = state;
        switch.manual_override = false;
        switch.triggered_by_motion = false;

        Some(SwitchChange {
            pin,
            physical_pin: switch.config.manual_pin,
            previous,
            new_state: state,
            origin: ChangeOrigin::Remote,
        })
    }

    /// Applies a motion trigger. No-op for switches that do not respond to
    /// motion or have a standing manual override. Turn-off is further scoped
    /// to switches motion itself turned on, minus auto-off exemptions.
    pub fn apply_motion_trigger(&mut self, pin: i32, state: bool) -> Option<SwitchChange> {
        let switch = self.by_relay_pin_mut(pin)?;
        if !switch.config.responds_to_motion || switch.manual_override {
            return None;
        }

        if state {
            if switch.logical_state {
                return None;
            }
            switch.logical_state = true;
            switch.triggered_by_motion = true;
            Some(SwitchChange {
                pin,
                physical_pin: switch.config.manual_pin,
                previous: false,
                new_state: true,
                origin: ChangeOrigin::Motion,
            })
        } else {
            if !switch.triggered_by_motion || switch.config.exempt_from_auto_off {
                return None;
            }
            switch.triggered_by_motion = false;
            if !switch.logical_state {
                return None;
            }
            switch.logical_state = false;
            Some(SwitchChange {
                pin,
                physical_pin: switch.config.manual_pin,
                previous: true,
                new_state: false,
                origin: ChangeOrigin::Motion,
            })
        }
    }

    /// Relay pins eligible for a motion turn-on this tick.
    pub fn motion_candidates(&self) -> Vec<i32> {
        self.switches
            .iter()
            .filter(|s| s.config.responds_to_motion && !s.manual_override)
            .map(|s| s.config.relay_pin)
            .collect()
    }

    /// Relay pins currently in auto-off scope.
    pub fn auto_off_candidates(&self) -> Vec<i32> {
        self.switches
            .iter()
            .filter(|s| {
                s.triggered_by_motion
                    && !s.config.exempt_from_auto_off
                    && !s.manual_override
                    && s.config.responds_to_motion
            })
            .map(|s| s.config.relay_pin)
            .collect()
    }

    /// Compact summary of `(logical_state, manual_override)` across all
    /// switches; two bits per switch.
    pub fn fingerprint(&self) -> u64 {
        let mut fp = 0_u64;
        for (i, switch) in self.switches.iter().enumerate().take(32) {
            if switch.logical_state {
                fp |= 1 << (2 * i);
            }
            if switch.manual_override {
                fp |= 1 << (2 * i + 1);
            }
        }
        fp
    }

    pub fn state_entries(&self) -> Vec<SwitchStateEntry> {
        self.switches
            .iter()
            .map(|s| SwitchStateEntry {
                pin: s.config.relay_pin,
                state: s.logical_state,
                manual_override: s.manual_override,
            })
            .collect()
    }

    pub fn persisted_states(&self) -> PersistedSwitchStates {
        PersistedSwitchStates {
            states: self
                .switches
                .iter()
                .map(|s| PersistedSwitchState {
                    pin: s.config.relay_pin,
                    state: s.logical_state,
                    manual_override: s.manual_override,
                })
                .collect(),
        }
    }
}
