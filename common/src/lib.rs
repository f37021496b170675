pub mod commands;
pub mod config;
pub mod connectivity;
pub mod controller;
pub mod hal;
pub mod messages;
pub mod motion;
pub mod offline;
pub mod publisher;
pub mod switchbank;
pub mod topics;
pub mod types;

pub use commands::{CommandQueue, QueuedCommand};
pub use config::{DeviceAuth, MotionConfig, RuntimeConfig, SwitchConfig, TimingConfig};
pub use connectivity::{ConnectionTracker, LedPattern, SyncEffect};
pub use controller::{DeviceController, IngestOutcome, TickReport};
pub use hal::{GpioDriver, HalError, Messenger, PersistentStore, StoreError, Watchdog};
pub use messages::{DropReason, Inbound};
pub use offline::{OfflineEvent, OfflineEventBuffer};
pub use publisher::StatePublisher;
pub use switchbank::SwitchBank;
pub use topics::*;
pub use types::{ConnectionState, FusionLogic, SensorKind, SwitchChange, SwitchMode};
