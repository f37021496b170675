use serde::{Deserialize, Serialize};

/// Link/session status as observed once per tick. Drives the status LED
/// projection and the offline buffering decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    LinkOnly,
    FullySynced,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::LinkOnly => "LINK_ONLY",
            Self::FullySynced => "FULLY_SYNCED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchMode {
    /// Push button: each stable inactive-to-active edge toggles the switch.
    Momentary,
    /// Wall switch: logical state follows the stable input level.
    Maintained,
}

impl SwitchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Momentary => "momentary",
            Self::Maintained => "maintained",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputPolarity {
    /// Input reads low when pressed (pull-up wiring).
    ActiveLow,
    ActiveHigh,
}

impl InputPolarity {
    /// Maps a raw electrical level to logical active/inactive.
    pub fn is_active(self, raw_level: bool) -> bool {
        match self {
            Self::ActiveLow => !raw_level,
            Self::ActiveHigh => raw_level,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionLogic {
    And,
    Or,
    Weighted,
}

impl FusionLogic {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
            Self::Weighted => "weighted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Pir,
    Microwave,
    Hybrid,
}

impl SensorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pir => "pir",
            Self::Microwave => "microwave",
            Self::Hybrid => "hybrid",
        }
    }
}

/// Who last set a switch. Manual and remote both count as human intent for
/// the override flag; motion never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Manual,
    Remote,
    Motion,
}

/// A committed logical-state transition on one switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchChange {
    pub pin: i32,
    pub physical_pin: i32,
    pub previous: bool,
    pub new_state: bool,
    pub origin: ChangeOrigin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwitchStateEntry {
    pub pin: i32,
    pub state: bool,
    #[serde(rename = "manualOverride")]
    pub manual_override: bool,
}

/// Full-state synchronization message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatePayload {
    pub identifier: String,
    pub secret: String,
    pub switches: Vec<SwitchStateEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatPayload {
    pub identifier: String,
    pub status: String,
    #[serde(rename = "freeMemory")]
    pub free_memory: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManualEventPayload {
    pub identifier: String,
    pub secret: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub pin: i32,
    pub state: bool,
    #[serde(rename = "physicalPin")]
    pub physical_pin: i32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MotionEventPayload {
    pub identifier: String,
    pub secret: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub detected: bool,
    #[serde(rename = "sensorKind")]
    pub sensor_kind: String,
    pub timestamp: i64,
}
