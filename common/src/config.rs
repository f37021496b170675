use serde::{Deserialize, Serialize};

use crate::types::{FusionLogic, InputPolarity, SensorKind, SwitchMode};

/// GPIOs that must never carry a relay, input, or sensor: the SPI flash
/// range plus the UART0 console pins.
pub const RESERVED_PINS: &[i32] = &[1, 3, 6, 7, 8, 9, 10, 11];

pub const MAX_SWITCHES: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwitchConfig {
    #[serde(rename = "relayPin")]
    pub relay_pin: i32,
    /// -1 means no physical input is wired to this switch.
    #[serde(rename = "manualPin")]
    pub manual_pin: i32,
    #[serde(rename = "manualEnabled")]
    pub manual_enabled: bool,
    pub mode: SwitchMode,
    pub polarity: InputPolarity,
    #[serde(rename = "respondsToMotion")]
    pub responds_to_motion: bool,
    #[serde(rename = "exemptFromAutoOff")]
    pub exempt_from_auto_off: bool,
    #[serde(rename = "defaultState")]
    pub default_state: bool,
}

impl SwitchConfig {
    pub fn new(relay_pin: i32, manual_pin: i32) -> Self {
        Self {
            relay_pin,
            manual_pin,
            manual_enabled: manual_pin >= 0,
            mode: SwitchMode::Momentary,
            polarity: InputPolarity::ActiveLow,
            responds_to_motion: false,
            exempt_from_auto_off: false,
            default_state: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MotionConfig {
    pub enabled: bool,
    #[serde(rename = "sensorKind")]
    pub sensor_kind: SensorKind,
    #[serde(rename = "primaryPin")]
    pub primary_pin: i32,
    /// -1 when only one sensor is wired.
    #[serde(rename = "secondaryPin")]
    pub secondary_pin: i32,
    #[serde(rename = "autoOffDelaySecs")]
    pub auto_off_delay_secs: u32,
    #[serde(rename = "fusionLogic")]
    pub fusion_logic: FusionLogic,
    #[serde(rename = "primaryWeight")]
    pub primary_weight: u8,
    #[serde(rename = "secondaryWeight")]
    pub secondary_weight: u8,
    #[serde(rename = "detectionThreshold")]
    pub detection_threshold: u8,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sensor_kind: SensorKind::Pir,
            primary_pin: -1,
            secondary_pin: -1,
            auto_off_delay_secs: 120,
            fusion_logic: FusionLogic::Or,
            primary_weight: 60,
            secondary_weight: 40,
            // Primary alone must trip detection; the secondary alone must not.
            detection_threshold: 60,
        }
    }
}

impl MotionConfig {
    pub fn dual_sensor(&self) -> bool {
        self.secondary_pin >= 0
    }

    pub fn sanitize(&mut self) {
        self.auto_off_delay_secs = self.auto_off_delay_secs.clamp(5, 3_600);
        if self.primary_weight == 0 {
            self.primary_weight = 60;
        }
        if self.detection_threshold == 0 {
            self.detection_threshold = self.primary_weight;
        }
        if self.primary_pin < 0 {
            self.enabled = false;
        }
        if RESERVED_PINS.contains(&self.primary_pin)
            || RESERVED_PINS.contains(&self.secondary_pin)
        {
            self.enabled = false;
        }
    }
}

/// Loop and protocol timing. All waiting in the superloop is expressed as
/// not-yet-due checks against these values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    #[serde(rename = "tickIntervalMs")]
    pub tick_interval_ms: u64,
    #[serde(rename = "debounceMs")]
    pub debounce_ms: u64,
    #[serde(rename = "maxCommandsPerTick")]
    pub max_commands_per_tick: usize,
    #[serde(rename = "commandQueueCapacity")]
    pub command_queue_capacity: usize,
    #[serde(rename = "offlineBufferCapacity")]
    pub offline_buffer_capacity: usize,
    /// Buffer manual transitions while not fully synced and replay them on
    /// reconnect. Off reproduces the local-only manual-control variant.
    #[serde(rename = "offlineBuffering")]
    pub offline_buffering: bool,
    #[serde(rename = "publishIdleMs")]
    pub publish_idle_ms: u64,
    #[serde(rename = "heartbeatMs")]
    pub heartbeat_ms: u64,
    #[serde(rename = "confirmedOfflineMs")]
    pub confirmed_offline_ms: u64,
    #[serde(rename = "lowMemoryBytes")]
    pub low_memory_bytes: u32,
    #[serde(rename = "criticalMemoryBytes")]
    pub critical_memory_bytes: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10,
            debounce_ms: 100,
            max_commands_per_tick: 5,
            command_queue_capacity: 16,
            offline_buffer_capacity: 32,
            offline_buffering: true,
            publish_idle_ms: 5_000,
            heartbeat_ms: 30_000,
            confirmed_offline_ms: 30_000,
            low_memory_bytes: 16_384,
            critical_memory_bytes: 8_192,
        }
    }
}

impl TimingConfig {
    pub fn sanitize(&mut self) {
        self.tick_interval_ms = self.tick_interval_ms.clamp(1, 100);
        self.debounce_ms = self.debounce_ms.clamp(10, 1_000);
        self.max_commands_per_tick = self.max_commands_per_tick.clamp(1, 16);
        self.command_queue_capacity = self.command_queue_capacity.clamp(16, 128);
        self.offline_buffer_capacity = self.offline_buffer_capacity.clamp(8, 256);
        self.publish_idle_ms = self.publish_idle_ms.clamp(500, 60_000);
        self.heartbeat_ms = self.heartbeat_ms.clamp(5_000, 300_000);
    }
}

/// Shared-secret device identity. Every inbound message must match both
/// fields; every outbound message carries them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceAuth {
    pub identifier: String,
    pub secret: String,
    /// Accept the credential-less compact command form `"relayN:on"`.
    #[serde(rename = "allowLegacyCommands", default)]
    pub allow_legacy_commands: bool,
}

impl Default for DeviceAuth {
    fn default() -> Self {
        Self {
            identifier: String::new(),
            secret: String::new(),
            allow_legacy_commands: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub switches: Vec<SwitchConfig>,
    pub motion: MotionConfig,
    pub timing: TimingConfig,
    pub auth: DeviceAuth,
    pub network: NetworkConfig,
    #[serde(rename = "statusLedPin")]
    pub status_led_pin: i32,
    #[serde(rename = "relayActiveHigh")]
    pub relay_active_high: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        // Factory map: four relays and four manual inputs on boot-safe GPIOs.
        let relay_pins = [4, 5, 12, 13];
        let manual_pins = [14, 16, 0, 2];
        let switches = relay_pins
            .iter()
            .zip(manual_pins.iter())
            .map(|(&relay, &manual)| SwitchConfig::new(relay, manual))
            .collect();

        Self {
            switches,
            motion: MotionConfig::default(),
            timing: TimingConfig::default(),
            auth: DeviceAuth::default(),
            network: NetworkConfig::default(),
            status_led_pin: 2,
            relay_active_high: true,
        }
    }
}

impl RuntimeConfig {
    /// Clamps ranges and drops switches with invalid or duplicate pin
    /// assignments. First assignment of a pin wins.
    pub fn sanitize(&mut self) {
        self.timing.sanitize();
        self.motion.sanitize();

        let mut seen: Vec<i32> = Vec::new();
        self.switches.retain(|switch| {
            if switch.relay_pin < 0 || RESERVED_PINS.contains(&switch.relay_pin) {
                return false;
            }
            if switch.manual_pin >= 0 && RESERVED_PINS.contains(&switch.manual_pin) {
                return false;
            }
            if seen.contains(&switch.relay_pin) {
                return false;
            }
            if switch.manual_pin >= 0 && seen.contains(&switch.manual_pin) {
                return false;
            }
            seen.push(switch.relay_pin);
            if switch.manual_pin >= 0 {
                seen.push(switch.manual_pin);
            }
            true
        });
        self.switches.truncate(MAX_SWITCHES);
    }

    pub fn switch_for_relay(&self, relay_pin: i32) -> Option<&SwitchConfig> {
        self.switches.iter().find(|s| s.relay_pin == relay_pin)
    }
}

/// Last known logical state per relay pin, persisted after every mutation
/// so a reboot restores the room exactly as it was left.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedSwitchStates {
    pub states: Vec<PersistedSwitchState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedSwitchState {
    pub pin: i32,
    pub state: bool,
    #[serde(rename = "manualOverride")]
    pub manual_override: bool,
}

impl PersistedSwitchStates {
    pub fn state_for(&self, pin: i32) -> Option<&PersistedSwitchState> {
        self.states.iter().find(|s| s.pin == pin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_map_matches_factory_pins() {
        let config = RuntimeConfig::default();
        let relays: Vec<i32> = config.switches.iter().map(|s| s.relay_pin).collect();
        let manuals: Vec<i32> = config.switches.iter().map(|s| s.manual_pin).collect();

        assert_eq!(relays, vec![4, 5, 12, 13]);
        assert_eq!(manuals, vec![14, 16, 0, 2]);
    }

    #[test]
    fn sanitize_drops_reserved_and_duplicate_pins() {
        let mut config = RuntimeConfig::default();
        config.switches.push(SwitchConfig::new(6, -1)); // flash pin
        config.switches.push(SwitchConfig::new(4, -1)); // duplicate relay
        config.switches.push(SwitchConfig::new(15, 14)); // duplicate manual
        config.switches.push(SwitchConfig::new(17, 18));

        config.sanitize();

        let relays: Vec<i32> = config.switches.iter().map(|s| s.relay_pin).collect();
        assert_eq!(relays, vec![4, 5, 12, 13, 17]);
    }

    #[test]
    fn motion_disabled_without_primary_pin() {
        let mut motion = MotionConfig {
            enabled: true,
            ..MotionConfig::default()
        };
        motion.sanitize();
        assert!(!motion.enabled);
    }

    #[test]
    fn runtime_config_round_trips_through_json() {
        let config = RuntimeConfig::default();
        let raw = serde_json::to_string(&config).unwrap();
        let restored: RuntimeConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(restored.switches, config.switches);
        assert_eq!(restored.timing, config.timing);
    }
}
