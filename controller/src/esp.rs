use core::convert::TryInto;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use switchnode_common::{
    config::NetworkConfig,
    controller::{load_offline_snapshot, load_runtime_config, load_switch_states},
    hal::{GpioDriver, HalError, Messenger, PersistentStore, StoreError, Watchdog},
    DeviceController, IngestOutcome, RuntimeConfig, TickReport,
};

const NVS_NAMESPACE: &str = "switchnode";
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const INBOUND_QUEUE_DEPTH: usize = 16;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_RECONNECT_NUDGE_MS: u64 = 30_000;

/// Keyed JSON blobs in the default NVS partition.
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl PersistentStore for NvsStore {
    fn load(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(|err| {
            StoreError::Read {
                key: key.to_string(),
                reason: err.to_string(),
            }
        })?;
        let mut buffer = vec![0_u8; 4096];
        let value = nvs.get_str(key, &mut buffer).map_err(|err| StoreError::Read {
            key: key.to_string(),
            reason: err.to_string(),
        })?;
        Ok(value.map(|s| s.to_string()))
    }

    fn save(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(|err| {
            StoreError::Write {
                key: key.to_string(),
                reason: err.to_string(),
            }
        })?;
        nvs.set_str(key, value).map_err(|err| StoreError::Write {
            key: key.to_string(),
            reason: err.to_string(),
        })
    }
}

/// Pin drivers created on first use and cached. Manual inputs get the
/// internal pull-up (buttons and wall switches short to ground); sensor
/// inputs are pulled down so a disconnected PIR reads quiet.
struct EspGpio {
    inputs: HashMap<i32, PinDriver<'static, AnyIOPin, Input>>,
    outputs: HashMap<i32, PinDriver<'static, AnyOutputPin, Output>>,
    pull_up_pins: Vec<i32>,
}

impl EspGpio {
    fn new(config: &RuntimeConfig) -> Self {
        let pull_up_pins = config
            .switches
            .iter()
            .filter(|s| s.manual_pin >= 0)
            .map(|s| s.manual_pin)
            .collect();
        Self {
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            pull_up_pins,
        }
    }
}

impl GpioDriver for EspGpio {
    fn read_input(&mut self, pin: i32) -> Result<bool, HalError> {
        if !self.inputs.contains_key(&pin) {
            let mut driver = PinDriver::input(unsafe { AnyIOPin::new(pin) }).map_err(|err| {
                HalError::Gpio {
                    pin,
                    reason: err.to_string(),
                }
            })?;
            let pull = if self.pull_up_pins.contains(&pin) {
                Pull::Up
            } else {
                Pull::Down
            };
            driver.set_pull(pull).map_err(|err| HalError::Gpio {
                pin,
                reason: err.to_string(),
            })?;
            self.inputs.insert(pin, driver);
        }
        Ok(self.inputs[&pin].is_high())
    }

    fn write_output(&mut self, pin: i32, level: bool) -> Result<(), HalError> {
        if !self.outputs.contains_key(&pin) {
            let driver =
                PinDriver::output(unsafe { AnyOutputPin::new(pin) }).map_err(|err| {
                    HalError::Gpio {
                        pin,
                        reason: err.to_string(),
                    }
                })?;
            self.outputs.insert(pin, driver);
        }
        let driver = self.outputs.get_mut(&pin).ok_or_else(|| HalError::Gpio {
            pin,
            reason: "driver missing".to_string(),
        })?;
        let result = if level {
            driver.set_high()
        } else {
            driver.set_low()
        };
        result.map_err(|err| HalError::Gpio {
            pin,
            reason: err.to_string(),
        })
    }
}

struct EspMessenger {
    client: Arc<Mutex<EspMqttClient<'static>>>,
    session: Arc<AtomicBool>,
}

impl Messenger for EspMessenger {
    fn link_up(&self) -> bool {
        is_wifi_station_connected()
    }

    fn session_up(&self) -> bool {
        self.session.load(Ordering::Relaxed)
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), HalError> {
        let mut client = self.client.lock().unwrap();
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .map(|_| ())
            .map_err(|err| HalError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), HalError> {
        let mut client = self.client.lock().unwrap();
        client
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| HalError::Subscribe {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    fn reset_session(&mut self) {
        // The IDF client reconnects on its own; flag the session down so
        // publishing pauses until the broker is reachable again.
        warn!("messaging session flagged down for recovery");
        self.session.store(false, Ordering::Relaxed);
    }

    fn free_memory(&self) -> Option<u32> {
        Some(unsafe { esp_idf_svc::sys::esp_get_free_heap_size() })
    }
}

struct TaskWatchdog;

impl Watchdog for TaskWatchdog {
    fn feed(&mut self) {
        let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let reset_reason = unsafe { esp_idf_svc::sys::esp_reset_reason() };
    info!("booting, reset reason code {reset_reason}");

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let (mut config, corrupt) = load_runtime_config(&mut store);
    if corrupt {
        warn!("stored runtime config unreadable, falling back to factory defaults");
    }
    ensure_wifi_defaults(&mut config);

    info!(
        "config loaded: {} switches, motion={}, mqtt=`{}:{}`",
        config.switches.len(),
        config.motion.enabled,
        config.network.mqtt_host,
        config.network.mqtt_port,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let mut wifi = connect_wifi(modem, sys_loop, nvs_partition.clone(), &config.network)
        .context("wifi startup failed")?;
    disable_wifi_power_save();

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register control task with watchdog: {err:#}");
    }

    let session = Arc::new(AtomicBool::new(false));
    let inbound: Arc<Mutex<VecDeque<(String, String)>>> = Arc::new(Mutex::new(VecDeque::new()));
    let (mqtt_client, mqtt_conn) = create_mqtt_client(&config.network)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));
    spawn_mqtt_receiver(mqtt_conn, session.clone(), inbound.clone());

    let restored = load_switch_states(&mut store);
    let offline = load_offline_snapshot(&mut store);
    let tick_interval_ms = config.timing.tick_interval_ms;
    let has_credentials = has_station_credentials(&config.network);

    let mut gpio = EspGpio::new(&config);
    let mut messenger = EspMessenger {
        client: mqtt_client,
        session,
    };
    let mut watchdog = TaskWatchdog;
    let mut controller = DeviceController::new(config, restored, offline);

    info!("switchnode controller running");

    let mut last_wifi_nudge_ms = 0_u64;
    loop {
        let now_ms = monotonic_ms();

        loop {
            let next = inbound.lock().unwrap().pop_front();
            let Some((topic, payload)) = next else {
                break;
            };
            match controller.ingest(&topic, &payload, now_ms) {
                IngestOutcome::CommandQueued => {}
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

        // Keep nudging the station back online; never block the loop.
        if has_credentials
            && !is_wifi_station_connected()
            && now_ms.saturating_sub(last_wifi_nudge_ms) >= WIFI_RECONNECT_NUDGE_MS
        {
            last_wifi_nudge_ms = now_ms;
            if let Err(err) = wifi.connect() {
                warn!("wifi reconnect attempt failed: {err}");
            }
        }

        thread::sleep(Duration::from_millis(tick_interval_ms));
    }
}

fn log_report(report: &TickReport) {
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

fn ensure_wifi_defaults(config: &mut RuntimeConfig) {
    if config.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            config.network.wifi_ssid = ssid.to_string();
        }
    }

    if config.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            config.network.wifi_pass = pass.to_string();
        }
    }
}

fn has_station_credentials(network: &NetworkConfig) -> bool {
    !network.wifi_ssid.trim().is_empty()
}

/// Makes a bounded number of connection attempts and then returns either
/// way; the room keeps working with or without the network.
fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    if !has_station_credentials(network) {
        warn!("wifi credentials missing; continuing in standalone operation");
        return Ok(esp_wifi);
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                return Ok(esp_wifi);
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                if attempt < WIFI_CONNECT_ATTEMPTS {
                    let _ = wifi.disconnect();
                    thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
                }
            }
        }
    }

    warn!("wifi unavailable after {WIFI_CONNECT_ATTEMPTS} attempts; continuing standalone");
    Ok(esp_wifi)
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("switchnode-controller"),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    session: Arc<AtomicBool>,
    inbound: Arc<Mutex<VecDeque<(String, String)>>>,
) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => {
                    session.store(true, Ordering::Relaxed);

                    if let EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } = event.payload()
                    {
                        // We only process full MQTT payloads.
                        if !matches!(details, Details::Complete) {
                            continue;
                        }

                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }

                        let Ok(payload) = core::str::from_utf8(data) else {
                            warn!("dropping non-utf8 MQTT payload on topic {topic}");
                            continue;
                        };

                        let mut queue = inbound.lock().unwrap();
                        if queue.len() >= INBOUND_QUEUE_DEPTH {
                            warn!("inbound queue full, message dropped");
                            continue;
                        }
                        queue.push_back((topic.to_string(), payload.to_string()));
                    }
                }
                Err(err) => {
                    session.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
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
