use thiserror::Error;

use crate::{
    commands::CommandQueue,
    config::{PersistedSwitchStates, RuntimeConfig, SwitchConfig},
    connectivity::{ConnectionTracker, SyncEffect},
    hal::{GpioDriver, HalError, Messenger, PersistentStore, StoreError, Watchdog},
    messages::{
        self, ConfigSwitchUpdate, DropReason, Inbound, MotionSensorUpdate,
    },
    motion::MotionRuntime,
    offline::{OfflineEvent, OfflineEventBuffer},
    publisher::StatePublisher,
    switchbank::SwitchBank,
    topics::{SUBSCRIBE_TOPICS, TOPIC_STATE, TOPIC_TELEMETRY},
    types::{ConnectionState, SwitchChange},
};

pub const KEY_RUNTIME: &str = "runtime_json";
pub const KEY_SWITCH_STATE: &str = "switch_state_json";
pub const KEY_OFFLINE: &str = "offline_json";

#[derive(Debug, Error)]
pub enum TickError {
    #[error(transparent)]
    Hal(#[from] HalError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one tick did, for the runtime to log.
#[derive(Debug, Default)]
pub struct TickReport {
    pub transition: Option<(ConnectionState, ConnectionState)>,
    pub confirmed_offline: bool,
    pub changes: Vec<SwitchChange>,
    pub replayed: usize,
    pub published_state: bool,
    pub heartbeat: bool,
    pub motion_onset: bool,
    pub motion_auto_off: bool,
    pub unknown_command_pins: Vec<i32>,
    pub session_reset: bool,
    pub errors: Vec<TickError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    CommandQueued,
    /// Queue full; command rejected, never blocks.
    CommandRejected,
    ConfigApplied,
    /// Free memory below the low-water mark; processing skipped this cycle.
    SkippedLowMemory,
    Dropped(DropReason),
}

/// Owns every entity collection and applies them in a fixed order each
/// tick. Exactly one execution context mutates this; no locking anywhere.
pub struct DeviceController {
    config: RuntimeConfig,
    bank: SwitchBank,
    queue: CommandQueue,
    offline: OfflineEventBuffer,
    motion: MotionRuntime,
    tracker: ConnectionTracker,
    publisher: StatePublisher,
    low_memory: bool,
    critical_handled: bool,
    config_dirty: bool,
    relays_initialized: bool,
}

impl DeviceController {
    pub fn new(
        config: RuntimeConfig,
        restored: PersistedSwitchStates,
        offline_snapshot: Vec<OfflineEvent>,
    ) -> Self {
        let timing = config.timing.clone();
        let bank = SwitchBank::new(&config.switches, &restored, timing.debounce_ms);
        Self {
            bank,
            queue: CommandQueue::new(timing.command_queue_capacity),
            offline: OfflineEventBuffer::from_snapshot(
                offline_snapshot,
                timing.offline_buffer_capacity,
            ),
            motion: MotionRuntime::default(),
            tracker: ConnectionTracker::new(timing.confirmed_offline_ms),
            publisher: StatePublisher::new(timing.publish_idle_ms, timing.heartbeat_ms),
            low_memory: false,
            critical_handled: false,
            config_dirty: false,
            relays_initialized: false,
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.tracker.state()
    }

    pub fn bank(&self) -> &SwitchBank {
        &self.bank
    }

    pub fn offline_len(&self) -> usize {
        self.offline.len()
    }

    /// Handles one inbound message. Every failure is absorbed here; nothing
    /// propagates to a caller that could retry.
    pub fn ingest(&mut self, topic: &str, payload: &str, now_ms: u64) -> IngestOutcome {
        if self.low_memory {
            return IngestOutcome::SkippedLowMemory;
        }

        match messages::parse_inbound(topic, payload, &self.config.auth, &self.config.switches) {
            Ok(Inbound::Command { pin, desired_state }) => {
                if self.queue.enqueue(pin, desired_state, now_ms) {
                    IngestOutcome::CommandQueued
                } else {
                    IngestOutcome::CommandRejected
                }
            }
            Ok(Inbound::Config { switches, motion }) => {
                self.apply_config_update(switches, motion);
                IngestOutcome::ConfigApplied
            }
            Err(reason) => IngestOutcome::Dropped(reason),
        }
    }

    fn apply_config_update(
        &mut self,
        switches: Option<Vec<ConfigSwitchUpdate>>,
        motion: Option<MotionSensorUpdate>,
    ) {
        if let Some(updates) = switches {
            for update in updates {
                if let Some(existing) = self
                    .config
                    .switches
                    .iter_mut()
                    .find(|s| s.relay_pin == update.pin)
                {
                    existing.manual_pin = update.manual_pin;
                    existing.manual_enabled = update.manual_pin >= 0;
                    existing.responds_to_motion = update.responds_to_motion;
                    existing.exempt_from_auto_off = update.exempt_from_auto_off;
                    existing.mode = update.mode;
                } else {
                    let mut added = SwitchConfig::new(update.pin, update.manual_pin);
                    added.responds_to_motion = update.responds_to_motion;
                    added.exempt_from_auto_off = update.exempt_from_auto_off;
                    added.mode = update.mode;
                    self.config.switches.push(added);
                }
            }
        }

        if let Some(update) = motion {
            self.config.motion.enabled = update.enabled;
            self.config.motion.sensor_kind = update.sensor_kind;
            self.config.motion.auto_off_delay_secs = update.auto_off_delay_secs;
            self.config.motion.fusion_logic = update.fusion_logic;
        }

        self.config.sanitize();
        // Rebuild the bank against the new map, keeping logical states.
        let states = self.bank.persisted_states();
        self.bank = SwitchBank::new(
            &self.config.switches,
            &states,
            self.config.timing.debounce_ms,
        );
        self.relays_initialized = false;
        self.config_dirty = true;
        self.publisher.force();
    }

    fn relay_level(&self, state: bool) -> bool {
        if self.config.relay_active_high {
            state
        } else {
            !state
        }
    }

    fn write_relay<G: GpioDriver>(
        &self,
        gpio: &mut G,
        pin: i32,
        state: bool,
    ) -> Result<(), HalError> {
        gpio.write_output(pin, self.relay_level(state))
    }

    fn manual_pin_for(&self, relay_pin: i32) -> i32 {
        self.config
            .switch_for_relay(relay_pin)
            .map(|s| s.manual_pin)
            .unwrap_or(-1)
    }

    /// One superloop pass. Invariant order: manual sampling, connectivity
    /// evaluation, command dequeue, motion evaluation, publish/heartbeat
    /// decision, status indication, watchdog feed.
    pub fn tick<G, S, M, W>(
        &mut self,
        gpio: &mut G,
        store: &mut S,
        messenger: &mut M,
        watchdog: &mut W,
        now_ms: u64,
        epoch: i64,
    ) -> TickReport
    where
        G: GpioDriver,
        S: PersistentStore,
        M: Messenger,
        W: Watchdog,
    {
        let mut report = TickReport::default();
        let mut state_dirty = false;
        let mut offline_dirty = false;

        // Drive relays to their restored states on the first pass after
        // boot or reconfiguration.
        if !self.relays_initialized {
            self.relays_initialized = true;
            for switch in self.bank.switches() {
                let pin = switch.config.relay_pin;
                let state = switch.logical_state();
                if let Err(err) = self.write_relay(gpio, pin, state) {
                    report.errors.push(err.into());
                }
            }
        }

        // 1. Manual input sampling.
        for index in 0..self.bank.len() {
            let (manual_pin, enabled) = {
                let switch = &self.bank.switches()[index];
                (switch.config.manual_pin, switch.config.manual_enabled)
            };
            if !enabled || manual_pin < 0 {
                continue;
            }
            let raw = match gpio.read_input(manual_pin) {
                Ok(level) => level,
                Err(err) => {
                    report.errors.push(err.into());
                    continue;
                }
            };
            if let Some(change) = self.bank.apply_manual_sample(index, raw, now_ms) {
                if let Err(err) = self.write_relay(gpio, change.pin, change.new_state) {
                    report.errors.push(err.into());
                }
                state_dirty = true;
                self.publisher.force();

                if self.tracker.state() == ConnectionState::FullySynced {
                    let payload = messages::manual_event_payload(&self.config.auth, &change, epoch);
                    self.publish_json(messenger, TOPIC_TELEMETRY, &payload, &mut report);
                } else if self.config.timing.offline_buffering {
                    self.offline.append(OfflineEvent {
                        pin: change.pin,
                        previous_state: change.previous,
                        new_state: change.new_state,
                        timestamp: epoch,
                    });
                    offline_dirty = true;
                }
                report.changes.push(change);
            }
        }

        // 2. Connectivity evaluation and entry effects.
        let conn_tick = self
            .tracker
            .observe(messenger.link_up(), messenger.session_up(), now_ms);
        report.transition = conn_tick.transition;
        report.confirmed_offline = conn_tick.confirmed_offline;
        for effect in conn_tick.effects {
            match effect {
                SyncEffect::Resubscribe => {
                    for topic in SUBSCRIBE_TOPICS {
                        if let Err(err) = messenger.subscribe(topic) {
                            report.errors.push(err.into());
                        }
                    }
                }
                SyncEffect::ForceStatePublish => self.publisher.force(),
                SyncEffect::FlushOfflineBuffer => {
                    let drained = self.offline.drain_in_order();
                    for event in &drained {
                        let payload = messages::replayed_event_payload(
                            &self.config.auth,
                            event.pin,
                            event.new_state,
                            self.manual_pin_for(event.pin),
                            event.timestamp,
                        );
                        self.publish_json(messenger, TOPIC_TELEMETRY, &payload, &mut report);
                    }
                    report.replayed = drained.len();
                    if !drained.is_empty() {
                        offline_dirty = true;
                    }
                }
            }
        }

        // Memory pressure policy.
        if let Some(free) = messenger.free_memory() {
            self.low_memory = free < self.config.timing.low_memory_bytes;
            if free < self.config.timing.critical_memory_bytes {
                if !self.critical_handled {
                    self.critical_handled = true;
                    messenger.reset_session();
                    report.session_reset = true;
                }
            } else {
                self.critical_handled = false;
            }
        } else {
            self.low_memory = false;
        }

        // 3. Rate-limited command dequeue.
        let batch = self
            .queue
            .dequeue_batch(self.config.timing.max_commands_per_tick);
        for command in batch {
            match self
                .bank
                .apply_remote_command(command.pin, command.desired_state)
            {
                Some(change) => {
                    if let Err(err) = self.write_relay(gpio, change.pin, change.new_state) {
                        report.errors.push(err.into());
                    }
                    state_dirty = true;
                    self.publisher.force();
                    report.changes.push(change);
                }
                None => report.unknown_command_pins.push(command.pin),
            }
        }

        // 4. Motion evaluation.
        if self.config.motion.enabled {
            let primary = self.read_sensor(gpio, self.config.motion.primary_pin, &mut report);
            let secondary = if self.config.motion.dual_sensor() {
                self.read_sensor(gpio, self.config.motion.secondary_pin, &mut report)
            } else {
                false
            };
            let motion_tick = self
                .motion
                .evaluate(&self.config.motion, primary, secondary, now_ms);

            if motion_tick.onset {
                report.motion_onset = true;
                for pin in self.bank.motion_candidates() {
                    if let Some(change) = self.bank.apply_motion_trigger(pin, true) {
                        if let Err(err) = self.write_relay(gpio, change.pin, change.new_state) {
                            report.errors.push(err.into());
                        }
                        state_dirty = true;
                        report.changes.push(change);
                    }
                }
                self.publisher.force();
                let payload = messages::motion_event_payload(
                    &self.config.auth,
                    true,
                    self.config.motion.sensor_kind,
                    epoch,
                );
                self.publish_json(messenger, TOPIC_TELEMETRY, &payload, &mut report);
            }

            if motion_tick.auto_off_due {
                report.motion_auto_off = true;
                for pin in self.bank.auto_off_candidates() {
                    if let Some(change) = self.bank.apply_motion_trigger(pin, false) {
                        if let Err(err) = self.write_relay(gpio, change.pin, change.new_state) {
                            report.errors.push(err.into());
                        }
                        state_dirty = true;
                        report.changes.push(change);
                    }
                }
                self.publisher.force();
                let payload = messages::motion_event_payload(
                    &self.config.auth,
                    false,
                    self.config.motion.sensor_kind,
                    epoch,
                );
                self.publish_json(messenger, TOPIC_TELEMETRY, &payload, &mut report);
            }
        }

        // Persist mutations before the publish decision so a crash after a
        // publish never loses acknowledged state.
        if state_dirty {
            self.save_json(store, KEY_SWITCH_STATE, &self.bank.persisted_states(), &mut report);
        }
        if offline_dirty {
            self.save_json(store, KEY_OFFLINE, &self.offline.snapshot().to_vec(), &mut report);
        }
        if self.config_dirty {
            self.config_dirty = false;
            self.save_json(store, KEY_RUNTIME, &self.config, &mut report);
        }

        // 5. Publish and heartbeat decisions. Offline ticks leave the
        // pending force in place for the reconnect publish.
        if self.tracker.state() == ConnectionState::FullySynced {
            if self.publisher.should_publish(self.bank.fingerprint(), now_ms) {
                let payload =
                    messages::state_payload(&self.config.auth, self.bank.state_entries());
                self.publish_json(messenger, TOPIC_STATE, &payload, &mut report);
                report.published_state = true;
            }
            if self.publisher.heartbeat_due(now_ms) {
                let payload =
                    messages::heartbeat_payload(&self.config.auth, messenger.free_memory());
                self.publish_json(messenger, TOPIC_TELEMETRY, &payload, &mut report);
                report.heartbeat = true;
            }
        }

        // 6. Status indication, recomputed every tick from current state.
        if self.config.status_led_pin >= 0 {
            let lit = self.tracker.led_pattern().is_lit(now_ms);
            if let Err(err) = gpio.write_output(self.config.status_led_pin, lit) {
                report.errors.push(err.into());
            }
        }

        // 7. Liveness.
        watchdog.feed();

        report
    }

    fn read_sensor<G: GpioDriver>(
        &self,
        gpio: &mut G,
        pin: i32,
        report: &mut TickReport,
    ) -> bool {
        match gpio.read_input(pin) {
            Ok(level) => level,
            Err(err) => {
                report.errors.push(err.into());
                false
            }
        }
    }

    fn publish_json<M: Messenger, T: serde::Serialize>(
        &self,
        messenger: &mut M,
        topic: &str,
        payload: &T,
        report: &mut TickReport,
    ) {
        match serde_json::to_vec(payload) {
            Ok(body) => {
                if let Err(err) = messenger.publish(topic, &body) {
                    report.errors.push(err.into());
                }
            }
            Err(err) => report.errors.push(
                HalError::Publish {
                    topic: topic.to_string(),
                    reason: err.to_string(),
                }
                .into(),
            ),
        }
    }

    fn save_json<S: PersistentStore, T: serde::Serialize>(
        &self,
        store: &mut S,
        key: &str,
        value: &T,
        report: &mut TickReport,
    ) {
        match serde_json::to_string(value) {
            Ok(raw) => {
                if let Err(err) = store.save(key, &raw) {
                    report.errors.push(err.into());
                }
            }
            Err(err) => report
                .errors
                .push(StoreError::Corrupt(err, key.to_string()).into()),
        }
    }
}

/// Loads the persisted runtime configuration, falling back to factory
/// defaults when absent or corrupt. Corruption is reported through the
/// returned flag so the runtime can log it.
pub fn load_runtime_config<S: PersistentStore>(store: &mut S) -> (RuntimeConfig, bool) {
    match store.load(KEY_RUNTIME) {
        Ok(Some(raw)) => match serde_json::from_str::<RuntimeConfig>(&raw) {
            Ok(mut config) => {
                config.sanitize();
                (config, false)
            }
            Err(_) => (RuntimeConfig::default(), true),
        },
        Ok(None) => (RuntimeConfig::default(), false),
        Err(_) => (RuntimeConfig::default(), true),
    }
}

pub fn load_switch_states<S: PersistentStore>(store: &mut S) -> PersistedSwitchStates {
    match store.load(KEY_SWITCH_STATE) {
        Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
        _ => PersistedSwitchStates::default(),
    }
}

pub fn load_offline_snapshot<S: PersistentStore>(store: &mut S) -> Vec<OfflineEvent> {
    match store.load(KEY_OFFLINE) {
        Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::TOPIC_COMMANDS;
    use crate::types::{ChangeOrigin, HeartbeatPayload, ManualEventPayload, StatePayload};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockGpio {
        inputs: HashMap<i32, bool>,
        outputs: HashMap<i32, bool>,
    }

    impl MockGpio {
        fn set_input(&mut self, pin: i32, level: bool) {
            self.inputs.insert(pin, level);
        }
    }

    impl GpioDriver for MockGpio {
        fn read_input(&mut self, pin: i32) -> Result<bool, HalError> {
            // Unsampled active-low inputs idle high.
            Ok(*self.inputs.get(&pin).unwrap_or(&true))
        }

        fn write_output(&mut self, pin: i32, level: bool) -> Result<(), HalError> {
            self.outputs.insert(pin, level);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockStore {
        map: HashMap<String, String>,
        writes: u64,
    }

    impl PersistentStore for MockStore {
        fn load(&mut self, key: &str) -> Result<Option<String>, StoreError> {
            Ok(self.map.get(key).cloned())
        }

        fn save(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
            self.writes += 1;
            self.map.insert(key.to_string(), value.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockMessenger {
        link: bool,
        session: bool,
        free: Option<u32>,
        published: Vec<(String, Vec<u8>)>,
        subscriptions: Vec<String>,
        resets: u32,
    }

    impl Messenger for MockMessenger {
        fn link_up(&self) -> bool {
            self.link
        }

        fn session_up(&self) -> bool {
            self.session
        }

        fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), HalError> {
            self.published.push((topic.to_string(), payload.to_vec()));
            Ok(())
        }

        fn subscribe(&mut self, topic: &str) -> Result<(), HalError> {
            self.subscriptions.push(topic.to_string());
            Ok(())
        }

        fn reset_session(&mut self) {
            self.resets += 1;
            self.session = false;
        }

        fn free_memory(&self) -> Option<u32> {
            self.free
        }
    }

    #[derive(Default)]
    struct MockWatchdog {
        feeds: u64,
    }

    impl Watchdog for MockWatchdog {
        fn feed(&mut self) {
            self.feeds += 1;
        }
    }

    struct Harness {
        controller: DeviceController,
        gpio: MockGpio,
        store: MockStore,
        messenger: MockMessenger,
        watchdog: MockWatchdog,
    }

    impl Harness {
        fn new() -> Self {
            let mut config = RuntimeConfig::default();
            config.auth.identifier = "node-1".to_string();
            config.auth.secret = "s3cret".to_string();
            Self::with_config(config)
        }

        fn with_config(config: RuntimeConfig) -> Self {
            Self {
                controller: DeviceController::new(
                    config,
                    PersistedSwitchStates::default(),
                    Vec::new(),
                ),
                gpio: MockGpio::default(),
                store: MockStore::default(),
                messenger: MockMessenger::default(),
                watchdog: MockWatchdog::default(),
            }
        }

        fn online(mut self) -> Self {
            self.messenger.link = true;
            self.messenger.session = true;
            self
        }

        fn tick(&mut self, now_ms: u64) -> TickReport {
            self.controller.tick(
                &mut self.gpio,
                &mut self.store,
                &mut self.messenger,
                &mut self.watchdog,
                now_ms,
                1_700_000_000 + now_ms as i64 / 1_000,
            )
        }

        fn run(&mut self, from_ms: u64, to_ms: u64) -> Vec<TickReport> {
            (from_ms..=to_ms)
                .step_by(10)
                .map(|now| self.tick(now))
                .collect()
        }

        fn state_publishes(&self) -> Vec<StatePayload> {
            self.messenger
                .published
                .iter()
                .filter(|(topic, _)| topic == TOPIC_STATE)
                .map(|(_, body)| serde_json::from_slice(body).unwrap())
                .collect()
        }

        fn manual_events(&self) -> Vec<ManualEventPayload> {
            self.messenger
                .published
                .iter()
                .filter(|(topic, _)| topic == TOPIC_TELEMETRY)
                .filter_map(|(_, body)| serde_json::from_slice::<ManualEventPayload>(body).ok())
                .filter(|event| event.event_type == "manual_switch")
                .collect()
        }
    }

    fn command_json(pin: i32, state: bool) -> String {
        format!(
            r#"{{"identifier":"node-1","secret":"s3cret","pin":{pin},"desiredState":{state}}}"#
        )
    }

    #[test]
    fn momentary_press_end_to_end() {
        let mut harness = Harness::new().online();
        harness.tick(0); // seed debounce + settle connectivity

        // Raw input on GPIO 14 (switch 0) held active for 150 ms.
        harness.gpio.set_input(14, false);
        let reports = harness.run(10, 160);
        harness.gpio.set_input(14, true);
        let more = harness.run(170, 400);

        let changes: Vec<&SwitchChange> = reports
            .iter()
            .chain(more.iter())
            .flat_map(|r| r.changes.iter())
            .collect();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].pin, 4);
        assert_eq!(changes[0].new_state, true);
        assert_eq!(changes[0].origin, ChangeOrigin::Manual);

        // Relay is driven (active high) and exactly one manual event left.
        assert_eq!(harness.gpio.outputs.get(&4), Some(&true));
        assert_eq!(harness.manual_events().len(), 1);

        // Two state publishes: the boot baseline and the forced change.
        let publishes: Vec<StatePayload> = harness.state_publishes();
        assert_eq!(publishes.len(), 2);
        let entry = publishes[1].switches.iter().find(|s| s.pin == 4).unwrap();
        assert!(entry.state && entry.manual_override);
    }

    #[test]
    fn offline_toggles_replay_in_order_on_reconnect() {
        let mut harness = Harness::new(); // disconnected
        harness.tick(0);

        // Three presses, 300 ms apart, each held 150 ms.
        for press in 0..3_u64 {
            let start = 1_000 + press * 300;
            harness.gpio.set_input(14, false);
            harness.run(start, start + 150);
            harness.gpio.set_input(14, true);
            harness.run(start + 160, start + 290);
        }

        assert_eq!(harness.controller.offline_len(), 3);
        assert!(harness.messenger.published.is_empty());

        // Reconnect.
        harness.messenger.link = true;
        harness.messenger.session = true;
        let report = harness.tick(5_000);

        assert_eq!(
            report.transition,
            Some((ConnectionState::Disconnected, ConnectionState::FullySynced))
        );
        assert_eq!(report.replayed, 3);
        assert_eq!(harness.controller.offline_len(), 0);

        let events = harness.manual_events();
        assert_eq!(events.len(), 3);
        // Replayed in record order: on, off, on.
        let states: Vec<bool> = events.iter().map(|e| e.state).collect();
        assert_eq!(states, vec![true, false, true]);
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        // One forced full-state publish follows.
        assert_eq!(harness.state_publishes().len(), 1);
        assert!(report.published_state);

        // Buffer persisted as empty.
        let raw = harness.store.map.get(KEY_OFFLINE).unwrap();
        assert_eq!(raw, "[]");
    }

    #[test]
    fn offline_buffering_can_be_disabled() {
        let mut config = RuntimeConfig::default();
        config.auth.identifier = "node-1".to_string();
        config.auth.secret = "s3cret".to_string();
        config.timing.offline_buffering = false;
        let mut harness = Harness::with_config(config);
        harness.tick(0);

        harness.gpio.set_input(14, false);
        harness.run(10, 160);

        // Relay still controlled locally; nothing queued for replay.
        assert_eq!(harness.gpio.outputs.get(&4), Some(&true));
        assert_eq!(harness.controller.offline_len(), 0);

        harness.messenger.link = true;
        harness.messenger.session = true;
        let report = harness.tick(1_000);
        assert_eq!(report.replayed, 0);
        assert!(harness.manual_events().is_empty());
    }

    #[test]
    fn remote_command_applies_and_clears_override() {
        let mut harness = Harness::new().online();
        harness.tick(0);

        // Manual ON first: override stands.
        harness.gpio.set_input(14, false);
        harness.run(10, 160);
        assert!(harness.controller.bank().switches()[0].manual_override());

        let outcome = harness
            .controller
            .ingest(TOPIC_COMMANDS, &command_json(4, false), 200);
        assert_eq!(outcome, IngestOutcome::CommandQueued);

        let report = harness.tick(210);
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.changes[0].origin, ChangeOrigin::Remote);
        assert!(!harness.controller.bank().switches()[0].manual_override());
        assert_eq!(harness.gpio.outputs.get(&4), Some(&false));
    }

    #[test]
    fn command_dequeue_is_rate_limited() {
        let mut harness = Harness::new().online();
        harness.tick(0);

        for i in 0..12 {
            let state = i % 2 == 0;
            harness
                .controller
                .ingest(TOPIC_COMMANDS, &command_json(4, state), 100);
        }

        // Default budget: 5 per tick.
        let report = harness.tick(110);
        assert_eq!(report.changes.len(), 5);
        let report = harness.tick(120);
        assert_eq!(report.changes.len(), 5);
        let report = harness.tick(130);
        assert_eq!(report.changes.len(), 2);
    }

    #[test]
    fn unknown_command_pin_is_silently_dropped() {
        let mut harness = Harness::new().online();
        harness.tick(0);

        harness
            .controller
            .ingest(TOPIC_COMMANDS, &command_json(99, true), 100);
        let report = harness.tick(110);

        assert!(report.changes.is_empty());
        assert_eq!(report.unknown_command_pins, vec![99]);
        assert!(!harness.gpio.outputs.contains_key(&99));
    }

    #[test]
    fn unauthenticated_ingest_mutates_nothing() {
        let mut harness = Harness::new().online();
        harness.tick(0);

        let forged = r#"{"identifier":"node-1","secret":"wrong","pin":4,"desiredState":true}"#;
        let outcome = harness.controller.ingest(TOPIC_COMMANDS, forged, 100);
        assert_eq!(
            outcome,
            IngestOutcome::Dropped(DropReason::SecretMismatch)
        );

        let report = harness.tick(110);
        assert!(report.changes.is_empty());
    }

    #[test]
    fn motion_turns_flagged_switches_on_and_auto_off() {
        let mut config = RuntimeConfig::default();
        config.auth.identifier = "node-1".to_string();
        config.auth.secret = "s3cret".to_string();
        config.switches[0].responds_to_motion = true;
        config.switches[1].responds_to_motion = true;
        config.switches[1].exempt_from_auto_off = true;
        config.motion.enabled = true;
        config.motion.primary_pin = 25;
        config.motion.auto_off_delay_secs = 5;
        let mut harness = Harness::with_config(config).online();
        harness.gpio.set_input(25, false); // PIR idle (active high reading)
        harness.tick(0);

        harness.gpio.set_input(25, true);
        let report = harness.tick(10);
        assert!(report.motion_onset);
        let on_pins: Vec<i32> = report.changes.iter().map(|c| c.pin).collect();
        assert_eq!(on_pins, vec![4, 5]);

        // Motion stops; auto-off after 5 s of quiet.
        harness.gpio.set_input(25, false);
        harness.tick(1_000);
        let report = harness.tick(6_100);
        assert!(report.motion_auto_off);
        let off_pins: Vec<i32> = report.changes.iter().map(|c| c.pin).collect();
        // The exempt switch on GPIO 5 stays on.
        assert_eq!(off_pins, vec![4]);
        assert_eq!(harness.gpio.outputs.get(&5), Some(&true));
    }

    #[test]
    fn manual_on_during_motion_escapes_auto_off() {
        let mut config = RuntimeConfig::default();
        config.auth.identifier = "node-1".to_string();
        config.auth.secret = "s3cret".to_string();
        config.switches[0].responds_to_motion = true;
        config.switches[1].responds_to_motion = true;
        config.motion.enabled = true;
        config.motion.primary_pin = 25;
        config.motion.auto_off_delay_secs = 5;
        let mut harness = Harness::with_config(config).online();
        harness.gpio.set_input(25, false);
        harness.tick(0);

        harness.gpio.set_input(25, true);
        harness.tick(10); // both motion-on

        // Human toggles switch 1 (GPIO 5) off, then back on: override set.
        harness.gpio.set_input(16, false);
        harness.run(20, 170);
        harness.gpio.set_input(16, true);
        harness.run(180, 310);
        harness.gpio.set_input(16, false);
        harness.run(320, 470);
        harness.gpio.set_input(16, true);
        harness.run(480, 610);
        assert!(harness.controller.bank().switches()[1].manual_override());
        assert!(harness.controller.bank().switches()[1].logical_state());

        harness.gpio.set_input(25, false);
        harness.tick(1_000);
        let report = harness.tick(6_200);

        assert!(report.motion_auto_off);
        // Only the untouched motion-triggered switch turns off.
        let off_pins: Vec<i32> = report.changes.iter().map(|c| c.pin).collect();
        assert_eq!(off_pins, vec![4]);
        assert_eq!(harness.gpio.outputs.get(&5), Some(&true));
    }

    #[test]
    fn heartbeat_and_idle_publish_cadence() {
        let mut harness = Harness::new().online();

        let report = harness.tick(0);
        assert!(report.published_state && report.heartbeat);

        // Quiet period inside both windows: nothing.
        let report = harness.tick(2_000);
        assert!(!report.published_state && !report.heartbeat);

        // Idle republish at 5 s.
        let report = harness.tick(5_000);
        assert!(report.published_state && !report.heartbeat);

        // Heartbeat at 30 s.
        let report = harness.tick(30_000);
        assert!(report.heartbeat);

        let heartbeats: Vec<HeartbeatPayload> = harness
            .messenger
            .published
            .iter()
            .filter(|(topic, _)| topic == TOPIC_TELEMETRY)
            .filter_map(|(_, body)| serde_json::from_slice::<HeartbeatPayload>(body).ok())
            .filter(|p| p.status == "heartbeat")
            .collect();
        assert_eq!(heartbeats.len(), 2);
    }

    #[test]
    fn reconnect_resubscribes_command_topics() {
        let mut harness = Harness::new();
        harness.tick(0);

        harness.messenger.link = true;
        harness.messenger.session = true;
        harness.tick(100);

        assert_eq!(
            harness.messenger.subscriptions,
            vec![TOPIC_COMMANDS.to_string(), crate::topics::TOPIC_CONFIG.to_string()]
        );
    }

    #[test]
    fn low_memory_skips_ingest_and_critical_resets_session() {
        let mut harness = Harness::new().online();
        harness.messenger.free = Some(12_000); // below 16 KiB low-water
        harness.tick(0);

        let outcome = harness
            .controller
            .ingest(TOPIC_COMMANDS, &command_json(4, true), 100);
        assert_eq!(outcome, IngestOutcome::SkippedLowMemory);

        harness.messenger.free = Some(4_000); // below critical
        let report = harness.tick(110);
        assert!(report.session_reset);
        assert_eq!(harness.messenger.resets, 1);

        // Still critical next tick: no repeated teardown.
        harness.messenger.session = true;
        let report = harness.tick(120);
        assert!(!report.session_reset);

        // Recovery clears both thresholds.
        harness.messenger.free = Some(40_000);
        harness.tick(130);
        let outcome = harness
            .controller
            .ingest(TOPIC_COMMANDS, &command_json(4, true), 140);
        assert_eq!(outcome, IngestOutcome::CommandQueued);
    }

    #[test]
    fn config_message_reconfigures_and_persists() {
        let mut harness = Harness::new().online();
        harness.tick(0);

        let payload = r#"{
            "identifier": "node-1",
            "secret": "s3cret",
            "switches": [
                {"pin": 4, "manualPin": 14, "respondsToMotion": true, "exemptFromAutoOff": true, "mode": "maintained"}
            ],
            "motionSensor": {"enabled": true, "type": "hybrid", "autoOffDelay": 45, "fusionLogic": "and"}
        }"#;
        let outcome = harness
            .controller
            .ingest(crate::topics::TOPIC_CONFIG, payload, 100);
        assert_eq!(outcome, IngestOutcome::ConfigApplied);

        harness.tick(110);

        let config = harness.controller.config();
        let switch = config.switch_for_relay(4).unwrap();
        assert!(switch.responds_to_motion && switch.exempt_from_auto_off);
        assert_eq!(config.motion.auto_off_delay_secs, 45);
        // Motion stays disabled: no primary pin was provisioned.
        assert!(!config.motion.enabled);
        assert!(harness.store.map.contains_key(KEY_RUNTIME));
    }

    #[test]
    fn watchdog_fed_every_tick_and_boot_restores_relays() {
        let persisted = PersistedSwitchStates {
            states: vec![crate::config::PersistedSwitchState {
                pin: 12,
                state: true,
                manual_override: false,
            }],
        };
        let mut config = RuntimeConfig::default();
        config.auth.identifier = "node-1".to_string();
        config.auth.secret = "s3cret".to_string();
        let mut harness = Harness::with_config(config);
        harness.controller = DeviceController::new(
            harness.controller.config().clone(),
            persisted,
            Vec::new(),
        );

        harness.run(0, 100);
        assert_eq!(harness.watchdog.feeds, 11);
        assert_eq!(harness.gpio.outputs.get(&12), Some(&true));
        assert_eq!(harness.gpio.outputs.get(&4), Some(&false));
    }

    #[test]
    fn status_led_reflects_connection_state() {
        let mut harness = Harness::new();

        // Disconnected: fast blink, period 200 ms.
        harness.tick(0);
        assert_eq!(harness.gpio.outputs.get(&2), Some(&true));
        harness.tick(200);
        assert_eq!(harness.gpio.outputs.get(&2), Some(&false));

        // Fully synced: solid.
        harness.messenger.link = true;
        harness.messenger.session = true;
        harness.tick(300);
        assert_eq!(harness.gpio.outputs.get(&2), Some(&true));
        harness.tick(500);
        assert_eq!(harness.gpio.outputs.get(&2), Some(&true));
    }
}
