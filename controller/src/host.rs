use std::{
    collections::HashMap,
    io::ErrorKind,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use switchnode_common::{
    controller::{load_offline_snapshot, load_runtime_config, load_switch_states},
    hal::{GpioDriver, HalError, Messenger, PersistentStore, StoreError, Watchdog},
    types::InputPolarity,
    DeviceController, IngestOutcome, RuntimeConfig,
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const INBOUND_QUEUE_DEPTH: usize = 64;

/// Simulated pin table. Manual inputs idle at their inactive level; relay
/// and LED writes are recorded and logged on change.
struct SimGpio {
    inputs: HashMap<i32, bool>,
    outputs: HashMap<i32, bool>,
}

impl SimGpio {
    fn new(config: &RuntimeConfig) -> Self {
        let mut inputs = HashMap::new();
        for switch in &config.switches {
            if switch.manual_pin >= 0 {
                let idle = switch.polarity == InputPolarity::ActiveLow;
                inputs.insert(switch.manual_pin, idle);
            }
        }
        if config.motion.primary_pin >= 0 {
            inputs.insert(config.motion.primary_pin, false);
        }
        if config.motion.secondary_pin >= 0 {
            inputs.insert(config.motion.secondary_pin, false);
        }
        Self {
            inputs,
            outputs: HashMap::new(),
        }
    }
}

impl GpioDriver for SimGpio {
    fn read_input(&mut self, pin: i32) -> Result<bool, HalError> {
        Ok(*self.inputs.get(&pin).unwrap_or(&false))
    }

    fn write_output(&mut self, pin: i32, level: bool) -> Result<(), HalError> {
        let previous = self.outputs.insert(pin, level);
        if previous != Some(level) {
            debug!("gpio {pin} -> {}", if level { "high" } else { "low" });
        }
        Ok(())
    }
}

/// Keyed blobs as files under the data directory, mirroring NVS on device.
struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    fn new() -> Self {
        let dir = std::env::var("SWITCHNODE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.switchnode"));
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl PersistentStore for FileStore {
    fn load(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Read {
                key: key.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    fn save(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|err| StoreError::Write {
            key: key.to_string(),
            reason: err.to_string(),
        })?;
        std::fs::write(self.path_for(key), value).map_err(|err| StoreError::Write {
            key: key.to_string(),
            reason: err.to_string(),
        })
    }
}

struct MqttMessenger {
    client: AsyncClient,
    link: Arc<AtomicBool>,
    session: Arc<AtomicBool>,
}

impl Messenger for MqttMessenger {
    fn link_up(&self) -> bool {
        self.link.load(Ordering::Relaxed)
    }

    fn session_up(&self) -> bool {
        self.session.load(Ordering::Relaxed)
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), HalError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|err| HalError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), HalError> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| HalError::Subscribe {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    fn reset_session(&mut self) {
        self.session.store(false, Ordering::Relaxed);
        let _ = self.client.try_disconnect();
    }
}

struct NullWatchdog;

impl Watchdog for NullWatchdog {
    fn feed(&mut self) {}
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut store = FileStore::new();
    let (mut config, corrupt) = load_runtime_config(&mut store);
    if corrupt {
        warn!("stored runtime config unreadable, falling back to factory defaults");
    }

    if let Ok(identifier) = std::env::var("SWITCHNODE_ID") {
        config.auth.identifier = identifier;
    }
    if let Ok(secret) = std::env::var("SWITCHNODE_SECRET") {
        config.auth.secret = secret;
    }

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(config.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("switchnode-controller", mqtt_host, mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(15));
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(config.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(config.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (client, eventloop) = AsyncClient::new(mqtt_options, 64);
    let link = Arc::new(AtomicBool::new(false));
    let session = Arc::new(AtomicBool::new(false));
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<(String, String)>(INBOUND_QUEUE_DEPTH);
    spawn_mqtt_loop(eventloop, link.clone(), session.clone(), inbound_tx);

    let restored = load_switch_states(&mut store);
    let offline = load_offline_snapshot(&mut store);
    let tick_interval_ms = config.timing.tick_interval_ms;

    let mut gpio = SimGpio::new(&config);
    let mut messenger = MqttMessenger {
        client,
        link,
        session,
    };
    let mut watchdog = NullWatchdog;
    let mut controller = DeviceController::new(config, restored, offline);

    info!("switchnode controller running (simulated GPIO)");

    let mut interval = tokio::time::interval(Duration::from_millis(tick_interval_ms));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
            _ = interval.tick() => {}
        }

        let now_ms = monotonic_ms();
        while let Ok((topic, payload)) = inbound_rx.try_recv() {
            match controller.ingest(&topic, &payload, now_ms) {
                IngestOutcome::CommandQueued => debug!("command queued from {topic}"),
                IngestOutcome::CommandRejected => warn!("command queue full, newest rejected"),
                IngestOutcome::ConfigApplied => info!("configuration update applied"),
                IngestOutcome::SkippedLowMemory => {
                    warn!("low memory, inbound message skipped this cycle")
                }
                IngestOutcome::Dropped(reason) => {
                    warn!("dropped message on {topic}: {}", reason.as_str())
                }
            }
        }

        let report = controller.tick(
            &mut gpio,
            &mut store,
            &mut messenger,
            &mut watchdog,
            now_ms,
            Utc::now().timestamp(),
        );
        log_report(&report);
    }
}

fn log_report(report: &switchnode_common::TickReport) {
    if let Some((from, to)) = report.transition {
        info!("connectivity: {} -> {}", from.as_str(), to.as_str());
    }
    if report.confirmed_offline {
        warn!("confirmed offline, continuing in standalone operation");
    }
    if report.replayed > 0 {
        info!("replayed {} buffered offline events", report.replayed);
    }
    for change in &report.changes {
        info!(
            "switch {} -> {} ({:?})",
            change.pin,
            if change.new_state { "on" } else { "off" },
            change.origin
        );
    }
    for pin in &report.unknown_command_pins {
        warn!("command for unconfigured relay pin {pin} dropped");
    }
    if report.session_reset {
        warn!("critical memory pressure, messaging session torn down");
    }
    for err in &report.errors {
        warn!("tick error: {err}");
    }
}

fn spawn_mqtt_loop(
    mut eventloop: rumqttc::EventLoop,
    link: Arc<AtomicBool>,
    session: Arc<AtomicBool>,
    inbound: mpsc::Sender<(String, String)>,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    link.store(true, Ordering::Relaxed);
                    session.store(true, Ordering::Relaxed);
                }
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if message.payload.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {} ({} bytes)",
                            message.topic,
                            message.payload.len()
                        );
                        continue;
                    }
                    let Ok(payload) = String::from_utf8(message.payload.to_vec()) else {
                        warn!("dropping non-utf8 MQTT payload on topic {}", message.topic);
                        continue;
                    };
                    if inbound.try_send((message.topic, payload)).is_err() {
                        warn!("inbound queue full, message dropped");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    link.store(false, Ordering::Relaxed);
                    session.store(false, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
