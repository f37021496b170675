use serde::Deserialize;

use crate::{
    config::{DeviceAuth, SwitchConfig},
    topics::{TOPIC_COMMANDS, TOPIC_CONFIG},
    types::{
        FusionLogic, HeartbeatPayload, ManualEventPayload, MotionEventPayload, SensorKind,
        StatePayload, SwitchChange, SwitchMode, SwitchStateEntry,
    },
};

/// Why an inbound message was dropped. Never surfaced to the remote; the
/// runtime logs it locally and moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    IdentifierMismatch,
    SecretMismatch,
    LegacyDisabled,
    UnknownTopic,
    UnknownRelay,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed payload",
            Self::IdentifierMismatch => "identifier mismatch",
            Self::SecretMismatch => "secret mismatch",
            Self::LegacyDisabled => "legacy compact command form disabled",
            Self::UnknownTopic => "unknown topic",
            Self::UnknownRelay => "unknown relay name",
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommandMessage {
    identifier: String,
    secret: String,
    pin: i32,
    #[serde(rename = "desiredState")]
    desired_state: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ConfigSwitchUpdate {
    pub pin: i32,
    #[serde(rename = "manualPin")]
    pub manual_pin: i32,
    #[serde(rename = "respondsToMotion")]
    pub responds_to_motion: bool,
    #[serde(rename = "exemptFromAutoOff")]
    pub exempt_from_auto_off: bool,
    pub mode: SwitchMode,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MotionSensorUpdate {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub sensor_kind: SensorKind,
    #[serde(rename = "autoOffDelay")]
    pub auto_off_delay_secs: u32,
    #[serde(rename = "fusionLogic")]
    pub fusion_logic: FusionLogic,
}

#[derive(Debug, Deserialize)]
struct ConfigMessage {
    identifier: String,
    secret: String,
    #[serde(default)]
    switches: Option<Vec<ConfigSwitchUpdate>>,
    #[serde(rename = "motionSensor", default)]
    motion_sensor: Option<MotionSensorUpdate>,
}

/// An authenticated, validated inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Command { pin: i32, desired_state: bool },
    Config {
        switches: Option<Vec<ConfigSwitchUpdate>>,
        motion: Option<MotionSensorUpdate>,
    },
}

fn authenticate(identifier: &str, secret: &str, auth: &DeviceAuth) -> Result<(), DropReason> {
    if identifier != auth.identifier {
        return Err(DropReason::IdentifierMismatch);
    }
    if secret != auth.secret {
        return Err(DropReason::SecretMismatch);
    }
    Ok(())
}

/// Parses `"relay<N>:<on|off>"` against the configured switch list.
/// Relay names are 1-based positions in the switch array.
fn parse_legacy_command(
    payload: &str,
    switches: &[SwitchConfig],
) -> Result<Inbound, DropReason> {
    let (name, state) = payload.split_once(':').ok_or(DropReason::Malformed)?;
    let desired_state = match state.trim().to_ascii_lowercase().as_str() {
        "on" => true,
        "off" => false,
        _ => return Err(DropReason::Malformed),
    };

    let index: usize = name
        .trim()
        .strip_prefix("relay")
        .and_then(|n| n.parse().ok())
        .ok_or(DropReason::Malformed)?;
    let switch = index
        .checked_sub(1)
        .and_then(|i| switches.get(i))
        .ok_or(DropReason::UnknownRelay)?;

    Ok(Inbound::Command {
        pin: switch.relay_pin,
        desired_state,
    })
}

/// Authenticates and parses one inbound message. Any failure means the
/// message is dropped with no state mutation.
pub fn parse_inbound(
    topic: &str,
    payload: &str,
    auth: &DeviceAuth,
    switches: &[SwitchConfig],
) -> Result<Inbound, DropReason> {
    match topic {
        TOPIC_COMMANDS => {
            if let Ok(message) = serde_json::from_str::<CommandMessage>(payload) {
                authenticate(&message.identifier, &message.secret, auth)?;
                return Ok(Inbound::Command {
                    pin: message.pin,
                    desired_state: message.desired_state,
                });
            }
            // The compact form carries no credentials and is opt-in.
            if !auth.allow_legacy_commands {
                return Err(if payload.contains(':') {
                    DropReason::LegacyDisabled
                } else {
                    DropReason::Malformed
                });
            }
            parse_legacy_command(payload, switches)
        }
        TOPIC_CONFIG => {
            let message: ConfigMessage =
                serde_json::from_str(payload).map_err(|_| DropReason::Malformed)?;
            authenticate(&message.identifier, &message.secret, auth)?;
            Ok(Inbound::Config {
                switches: message.switches,
                motion: message.motion_sensor,
            })
        }
        _ => Err(DropReason::UnknownTopic),
    }
}

pub fn state_payload(auth: &DeviceAuth, switches: Vec<SwitchStateEntry>) -> StatePayload {
    StatePayload {
        identifier: auth.identifier.clone(),
        secret: auth.secret.clone(),
        switches,
    }
}

pub fn heartbeat_payload(auth: &DeviceAuth, free_memory: Option<u32>) -> HeartbeatPayload {
    HeartbeatPayload {
        identifier: auth.identifier.clone(),
        status: "heartbeat".to_string(),
        free_memory,
    }
}

pub fn manual_event_payload(
    auth: &DeviceAuth,
    change: &SwitchChange,
    timestamp: i64,
) -> ManualEventPayload {
    ManualEventPayload {
        identifier: auth.identifier.clone(),
        secret: auth.secret.clone(),
        event_type: "manual_switch".to_string(),
        pin: change.pin,
        state: change.new_state,
        physical_pin: change.physical_pin,
        timestamp,
    }
}

pub fn replayed_event_payload(
    auth: &DeviceAuth,
    pin: i32,
    state: bool,
    physical_pin: i32,
    timestamp: i64,
) -> ManualEventPayload {
    ManualEventPayload {
        identifier: auth.identifier.clone(),
        secret: auth.secret.clone(),
        event_type: "manual_switch".to_string(),
        pin,
        state,
        physical_pin,
        timestamp,
    }
}

pub fn motion_event_payload(
    auth: &DeviceAuth,
    detected: bool,
    sensor_kind: SensorKind,
    timestamp: i64,
) -> MotionEventPayload {
    MotionEventPayload {
        identifier: auth.identifier.clone(),
        secret: auth.secret.clone(),
        event_type: "motion".to_string(),
        detected,
        sensor_kind: sensor_kind.as_str().to_string(),
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use pretty_assertions::assert_eq;

    fn auth() -> DeviceAuth {
        DeviceAuth {
            identifier: "esp-classroom-12".to_string(),
            secret: "7a9aa8ccac9793".to_string(),
            allow_legacy_commands: false,
        }
    }

    #[test]
    fn accepts_authenticated_json_command() {
        let config = RuntimeConfig::default();
        let payload = r#"{"identifier":"esp-classroom-12","secret":"7a9aa8ccac9793","pin":5,"desiredState":true}"#;

        let inbound = parse_inbound(TOPIC_COMMANDS, payload, &auth(), &config.switches).unwrap();
        assert_eq!(
            inbound,
            Inbound::Command {
                pin: 5,
                desired_state: true
            }
        );
    }

    #[test]
    fn drops_identifier_and_secret_mismatches() {
        let config = RuntimeConfig::default();
        let wrong_id = r#"{"identifier":"other","secret":"7a9aa8ccac9793","pin":5,"desiredState":true}"#;
        let wrong_secret = r#"{"identifier":"esp-classroom-12","secret":"nope","pin":5,"desiredState":true}"#;

        assert_eq!(
            parse_inbound(TOPIC_COMMANDS, wrong_id, &auth(), &config.switches),
            Err(DropReason::IdentifierMismatch)
        );
        assert_eq!(
            parse_inbound(TOPIC_COMMANDS, wrong_secret, &auth(), &config.switches),
            Err(DropReason::SecretMismatch)
        );
    }

    #[test]
    fn drops_malformed_json() {
        let config = RuntimeConfig::default();
        assert_eq!(
            parse_inbound(TOPIC_COMMANDS, "{not json", &auth(), &config.switches),
            Err(DropReason::Malformed)
        );
    }

    #[test]
    fn legacy_form_requires_opt_in() {
        let config = RuntimeConfig::default();
        assert_eq!(
            parse_inbound(TOPIC_COMMANDS, "relay2:on", &auth(), &config.switches),
            Err(DropReason::LegacyDisabled)
        );

        let mut permissive = auth();
        permissive.allow_legacy_commands = true;
        let inbound =
            parse_inbound(TOPIC_COMMANDS, "relay2:on", &permissive, &config.switches).unwrap();
        // relay2 is the second configured switch: GPIO 5.
        assert_eq!(
            inbound,
            Inbound::Command {
                pin: 5,
                desired_state: true
            }
        );
    }

    #[test]
    fn legacy_form_rejects_unknown_relay_and_bad_state() {
        let config = RuntimeConfig::default();
        let mut permissive = auth();
        permissive.allow_legacy_commands = true;

        assert_eq!(
            parse_inbound(TOPIC_COMMANDS, "relay9:on", &permissive, &config.switches),
            Err(DropReason::UnknownRelay)
        );
        assert_eq!(
            parse_inbound(TOPIC_COMMANDS, "relay1:maybe", &permissive, &config.switches),
            Err(DropReason::Malformed)
        );
    }

    #[test]
    fn parses_config_message() {
        let config = RuntimeConfig::default();
        let payload = r#"{
            "identifier": "esp-classroom-12",
            "secret": "7a9aa8ccac9793",
            "switches": [
                {"pin": 4, "manualPin": 14, "respondsToMotion": true, "exemptFromAutoOff": false, "mode": "momentary"}
            ],
            "motionSensor": {"enabled": true, "type": "pir", "autoOffDelay": 90, "fusionLogic": "or"}
        }"#;

        let inbound = parse_inbound(TOPIC_CONFIG, payload, &auth(), &config.switches).unwrap();
        let Inbound::Config { switches, motion } = inbound else {
            panic!("expected config message");
        };
        let switches = switches.unwrap();
        assert_eq!(switches.len(), 1);
        assert!(switches[0].responds_to_motion);
        let motion = motion.unwrap();
        assert_eq!(motion.auto_off_delay_secs, 90);
        assert_eq!(motion.fusion_logic, FusionLogic::Or);
    }

    #[test]
    fn unknown_topic_is_dropped() {
        let config = RuntimeConfig::default();
        assert_eq!(
            parse_inbound("classroom/other", "{}", &auth(), &config.switches),
            Err(DropReason::UnknownTopic)
        );
    }

    #[test]
    fn outbound_payloads_carry_identity() {
        let auth = auth();
        let heartbeat = heartbeat_payload(&auth, Some(23_456));
        assert_eq!(heartbeat.status, "heartbeat");
        assert_eq!(heartbeat.identifier, "esp-classroom-12");

        let raw = serde_json::to_string(&heartbeat).unwrap();
        assert!(raw.contains("\"freeMemory\":23456"));

        let motion = motion_event_payload(&auth, true, SensorKind::Pir, 1_700_000_000);
        let raw = serde_json::to_string(&motion).unwrap();
        assert!(raw.contains("\"type\":\"motion\""));
        assert!(raw.contains("\"sensorKind\":\"pir\""));
    }
}
