//! Capability traits the control core is written against. Each platform
//! (host simulation, ESP32) provides one concrete adapter per trait.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HalError {
    #[error("gpio {pin} unavailable: {reason}")]
    Gpio { pin: i32, reason: String },
    #[error("publish to `{topic}` failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscribe to `{topic}` failed: {reason}")]
    Subscribe { topic: String, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store read for `{key}` failed: {reason}")]
    Read { key: String, reason: String },
    #[error("store write for `{key}` failed: {reason}")]
    Write { key: String, reason: String },
    #[error("stored value for `{1}` is corrupt: {0}")]
    Corrupt(#[source] serde_json::Error, String),
}

/// Raw digital I/O. Levels are electrical, not logical; polarity mapping
/// happens in the switch bank.
pub trait GpioDriver {
    fn read_input(&mut self, pin: i32) -> Result<bool, HalError>;
    fn write_output(&mut self, pin: i32, level: bool) -> Result<(), HalError>;
}

/// Keyed blob storage surviving reboot (NVS on device, files on host).
pub trait PersistentStore {
    fn load(&mut self, key: &str) -> Result<Option<String>, StoreError>;
    fn save(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Liveness timer. `feed` is called exactly once per completed tick; an
/// expired watchdog resets the device.
pub trait Watchdog {
    fn feed(&mut self);
}

/// Pub/sub transport plus the link/session observations the connectivity
/// state machine is driven by.
pub trait Messenger {
    /// Link layer is up (WiFi association on device).
    fn link_up(&self) -> bool;
    /// Messaging session is established and usable.
    fn session_up(&self) -> bool;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), HalError>;
    fn subscribe(&mut self, topic: &str) -> Result<(), HalError>;
    /// Tear down the session to reclaim buffers under memory pressure.
    fn reset_session(&mut self);
    /// Free heap in bytes, when the platform can report it.
    fn free_memory(&self) -> Option<u32> {
        None
    }
}
