use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    mqtt::client::QoS,
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::attenuation::DB_11,
    adc::oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
    delay::Ets,
    gpio::{AnyOutputPin, Output, PinDriver, Pull},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver},
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use piconode_common::{
    actuator::{duty_for_step, rgb_css, FADE_STEPS, MAX_DUTY},
    hub::{self, BrightnessState, ServiceCall},
    light::Photocell,
    store::{VersionRecord, VERSION_FILE, WIFI_CONFIG_FILE},
    update::Availability,
    AnimationSlot, ColorSource, ConfigStore, ConnectionState, FadeHandle, FetchError,
    HubConfig, LinkStatus, Marker, MotionAction, MotionGate, MqttConfig, NetworkCredentials,
    NodeConfig, PersistError, PublishClient, PublishError, PublishTransport, RadioError,
    UpdateCoordinator, UpdateFetcher, UpdateOutcome, UpdateStore, WifiDriver, WifiManager,
    TOPIC_NODE_STATUS, TOPIC_SENSOR_CLIMATE,
};

use crate::pages;

const NVS_NAMESPACE: &str = "piconode";
const NVS_FILE_NAMESPACE: &str = "piconode_fs";
const MAX_HTTP_BODY: usize = 4096;
const FETCH_CHUNK_SIZE: usize = 1024;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;

const PIR_PIN: i32 = 27;
const DHT_PIN: i32 = 16;
const STATUS_LED_PIN: i32 = 2;
const LED_BLINK_MS: u64 = 1_000;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    if let Err(err) = run_node() {
        // Never leave the device unreachable: reboot into the boot path,
        // which falls back to the configuration access point when the
        // network is the cause.
        warn!("fatal error in node runtime: {err:#}; restarting");
        thread::sleep(Duration::from_secs(1));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
    Ok(())
}

fn run_node() -> anyhow::Result<()> {
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut config = NodeConfig::default();
    apply_build_overrides(&mut config);
    config.sanitize();
    let config = Arc::new(config);

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;
    let ledc = peripherals.ledc;
    let adc1 = peripherals.adc1;

    let esp_wifi = EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs_partition))?;
    let radio = EspRadio {
        wifi: BlockingWifi::wrap(esp_wifi, sys_loop)?,
        ap_active: false,
    };
    let wifi = Arc::new(Mutex::new(WifiManager::new(
        radio,
        config.wifi,
        config.ap.clone(),
    )));

    let credentials = store.load_credentials();
    let boot_state = wifi.lock().unwrap().connect_or_fallback(credentials.as_ref());
    let connected = Arc::new(AtomicBool::new(matches!(
        boot_state,
        ConnectionState::Connected { .. }
    )));
    info!("network boot state: {boot_state:?}");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let updater = Arc::new(Mutex::new(UpdateCoordinator::new(
        &config.update.repo_url,
        EspFetcher {
            online: connected.clone(),
        },
        store.clone(),
    )));

    // An update requested from the status page runs before anything else.
    if connected.load(Ordering::Relaxed) && store.marker_present(Marker::UpdateRequested) {
        let outcome = updater.lock().unwrap().apply_if_available();
        info!("boot update check: {}", outcome.message());
        if matches!(outcome, UpdateOutcome::Updated(_)) {
            schedule_restart();
        }
    }

    let timer = Arc::new(LedcTimerDriver::new(
        ledc.timer0,
        &TimerConfig::default().frequency(1.kHz().into()),
    )?);
    let pwm = Arc::new(Mutex::new(RgbPwm {
        red: LedcDriver::new(ledc.channel0, timer.clone(), pins.gpio22)?,
        green: LedcDriver::new(ledc.channel1, timer.clone(), pins.gpio21)?,
        blue: LedcDriver::new(ledc.channel2, timer, pins.gpio19)?,
    }));
    let rgb_state = Arc::new(Mutex::new(rgb_css(0, 0, 0)));
    let slot: Arc<Mutex<AnimationSlot<EspFadeHandle>>> = Arc::new(Mutex::new(AnimationSlot::new()));

    let hub = EspHubClient {
        config: config.hub.clone(),
    };

    if store.marker_present(Marker::NoAutoRun) {
        warn!("no_auto_run marker present; background producers suppressed this boot");
        let mut consumer = store.clone();
        if let Err(err) = consumer.clear_marker(Marker::NoAutoRun) {
            warn!("failed to consume no_auto_run marker: {err}");
        }
    } else if connected.load(Ordering::Relaxed) {
        spawn_telemetry_thread(config.mqtt.clone(), config.telemetry.publish_interval_secs, pins.gpio16);
        spawn_motion_thread(
            pins.gpio27,
            slot.clone(),
            pwm.clone(),
            rgb_state.clone(),
            hub.clone(),
            config.clone(),
        );
        spawn_brightness_thread(adc1, pins.gpio34, hub.clone(), config.clone());
    }

    let server = create_http_server(ServerContext {
        config: config.clone(),
        store: store.clone(),
        wifi: wifi.clone(),
        updater,
        slot,
        pwm,
        rgb_state,
    })?;

    // Keep services alive for the program lifetime.
    let _server = server;
    let mut status_led = init_status_led(STATUS_LED_PIN);
    let mut wifi_down_since: Option<u64> = None;

    loop {
        feed_watchdog();
        maintain_wifi_health(&wifi, &connected, &mut wifi_down_since);
        update_status_led(
            &mut status_led,
            connected.load(Ordering::Relaxed),
            monotonic_ms(),
        );
        thread::sleep(Duration::from_secs(1));
    }
}

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

fn init_status_led(pin: i32) -> Option<StatusLed> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

/// Blinks while the station link is down, solid once connected.
fn update_status_led(status_led: &mut Option<StatusLed>, wifi_connected: bool, now_ms: u64) {
    let desired_on = wifi_connected || ((now_ms / LED_BLINK_MS) % 2) == 0;

    let Some(led) = status_led.as_mut() else {
        return;
    };
    if desired_on == led.lit {
        return;
    }

    let result = if desired_on {
        led.pin.set_high()
    } else {
        led.pin.set_low()
    };

    if let Err(err) = result {
        warn!("failed to drive status LED: {err}");
    } else {
        led.lit = desired_on;
    }
}

fn apply_build_overrides(config: &mut NodeConfig) {
    if let Some(host) = option_env!("MQTT_HOST") {
        config.mqtt.host = host.to_string();
    }
    if let Some(user) = option_env!("MQTT_USER") {
        config.mqtt.username = user.to_string();
    }
    if let Some(pass) = option_env!("MQTT_PASS") {
        config.mqtt.password = pass.to_string();
    }
    if let Some(repo) = option_env!("PICONODE_REPO_URL") {
        config.update.repo_url = repo.to_string();
    }
    if let Some(url) = option_env!("PICONODE_HUB_URL") {
        config.hub.base_url = url.to_string();
    }
    if let Some(token) = option_env!("PICONODE_HUB_TOKEN") {
        config.hub.token = token.to_string();
    }
}

/// Restarts when the station link stays down past the grace window. The
/// manager lock is only tried, never awaited, so a long configuration
/// connect attempt cannot starve the watchdog.
fn maintain_wifi_health(
    wifi: &Arc<Mutex<WifiManager<EspRadio>>>,
    connected: &Arc<AtomicBool>,
    down_since: &mut Option<u64>,
) {
    let Ok(mut manager) = wifi.try_lock() else {
        return;
    };

    if matches!(manager.state(), ConnectionState::ApMode) {
        *down_since = None;
        return;
    }

    let link_up = manager.is_connected()
        && matches!(manager.driver_mut().station_link(), LinkStatus::Up(_));
    connected.store(link_up, Ordering::Relaxed);
    drop(manager);

    if link_up {
        *down_since = None;
        return;
    }

    let now = monotonic_ms();
    let since = *down_since.get_or_insert(now);
    if now.saturating_sub(since) >= WIFI_RESTART_GRACE_MS {
        warn!(
            "wifi disconnected for {}s; restarting device for recovery",
            WIFI_RESTART_GRACE_MS / 1000
        );
        thread::sleep(Duration::from_millis(100));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

struct EspRadio {
    wifi: BlockingWifi<EspWifi<'static>>,
    ap_active: bool,
}

impl EspRadio {
    fn driver_error(err: esp_idf_svc::sys::EspError) -> RadioError {
        RadioError::Driver(format!("{err}"))
    }
}

impl WifiDriver for EspRadio {
    fn station_start(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    fn station_connect(&mut self, ssid: &str, password: &str) -> Result<(), RadioError> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| RadioError::Driver("ssid too long".to_string()))?,
                password: password
                    .try_into()
                    .map_err(|_| RadioError::Driver("password too long".to_string()))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(Self::driver_error)?;
        // Reconfiguring the single radio away from AP mode.
        self.ap_active = false;

        self.wifi.start().map_err(Self::driver_error)?;
        self.wifi.connect().map_err(Self::driver_error)?;
        Ok(())
    }

    fn station_link(&mut self) -> LinkStatus {
        match self.wifi.wifi().is_connected() {
            Ok(true) => match self.wifi.wifi().sta_netif().get_ip_info() {
                Ok(ip_info) if !ip_info.ip.is_unspecified() => {
                    LinkStatus::Up(ip_info.ip.to_string())
                }
                Ok(_) => LinkStatus::Joining,
                Err(_) => LinkStatus::Joining,
            },
            Ok(false) => LinkStatus::Down,
            Err(_) => LinkStatus::Down,
        }
    }

    fn station_disconnect(&mut self) {
        let _ = self.wifi.wifi_mut().disconnect();
    }

    fn station_stop(&mut self) {
        let _ = self.wifi.stop();
    }

    fn ap_start(&mut self, ssid: &str, password: &str) -> Result<(), RadioError> {
        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| RadioError::Driver("ap ssid too long".to_string()))?,
                password: password
                    .try_into()
                    .map_err(|_| RadioError::Driver("ap password too long".to_string()))?,
                auth_method: AuthMethod::WPA2Personal,
                channel: 1,
                ..Default::default()
            }))
            .map_err(Self::driver_error)?;

        self.wifi.start().map_err(Self::driver_error)?;
        self.wifi.wait_netif_up().map_err(Self::driver_error)?;
        self.ap_active = true;
        Ok(())
    }

    fn ap_active(&self) -> bool {
        self.ap_active
    }

    fn ap_stop(&mut self) {
        self.ap_active = false;
        let _ = self.wifi.stop();
    }

    fn scan(&mut self) -> Result<Vec<String>, RadioError> {
        if !self.wifi.is_started().unwrap_or(false) {
            self.wifi
                .set_configuration(&Configuration::Client(ClientConfiguration::default()))
                .map_err(Self::driver_error)?;
            self.wifi.start().map_err(Self::driver_error)?;
        }

        let access_points = self.wifi.scan().map_err(Self::driver_error)?;
        Ok(access_points
            .into_iter()
            .map(|ap| ap.ssid.to_string())
            .filter(|ssid| !ssid.is_empty())
            .collect())
    }

    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStore {
    fn read_string(&self, namespace: &str, key: &str) -> Option<String> {
        let _guard = self.lock.lock().unwrap();
        let nvs = match EspNvs::new(self.partition.clone(), namespace, true) {
            Ok(nvs) => nvs,
            Err(err) => {
                warn!("failed to open NVS namespace {namespace}: {err}");
                return None;
            }
        };

        let mut buffer = vec![0_u8; 4096];
        match nvs.get_str(key, &mut buffer) {
            Ok(Some(value)) => Some(value.to_string()),
            Ok(None) => None,
            Err(err) => {
                warn!("failed to read NVS key {key}: {err}");
                None
            }
        }
    }

    fn write_string(&self, namespace: &str, key: &str, value: &str) -> Result<(), PersistError> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), namespace, true)
            .map_err(|err| PersistError::Storage(err.to_string()))?;
        nvs.set_str(key, value)
            .map_err(|err| PersistError::Storage(err.to_string()))
    }

    fn remove_key(&self, namespace: &str, key: &str) -> Result<(), PersistError> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), namespace, true)
            .map_err(|err| PersistError::Storage(err.to_string()))?;
        nvs.remove(key)
            .map(|_| ())
            .map_err(|err| PersistError::Storage(err.to_string()))
    }

    /// NVS keys are limited to 15 characters; record names and manifest
    /// paths are folded into that budget.
    fn nvs_key(name: &str) -> String {
        let mut key: String = name
            .chars()
            .map(|c| if c == '/' || c == '.' { '_' } else { c })
            .collect();
        key.truncate(15);
        key
    }
}

impl ConfigStore for NvsStore {
    fn load_credentials(&self) -> Option<NetworkCredentials> {
        let raw = self.read_string(NVS_NAMESPACE, &Self::nvs_key(WIFI_CONFIG_FILE))?;
        match serde_json::from_str(&raw) {
            Ok(credentials) => Some(credentials),
            Err(err) => {
                warn!("corrupt credentials record: {err}; treating as absent");
                None
            }
        }
    }

    fn save_credentials(&mut self, credentials: &NetworkCredentials) -> Result<(), PersistError> {
        let payload = serde_json::to_string(credentials)
            .map_err(|err| PersistError::Storage(err.to_string()))?;
        self.write_string(NVS_NAMESPACE, &Self::nvs_key(WIFI_CONFIG_FILE), &payload)
    }

    fn marker_present(&self, marker: Marker) -> bool {
        self.read_string(NVS_NAMESPACE, &Self::nvs_key(marker.file_name()))
            .is_some()
    }

    fn set_marker(&mut self, marker: Marker) -> Result<(), PersistError> {
        self.write_string(NVS_NAMESPACE, &Self::nvs_key(marker.file_name()), "1")
    }

    fn clear_marker(&mut self, marker: Marker) -> Result<(), PersistError> {
        self.remove_key(NVS_NAMESPACE, &Self::nvs_key(marker.file_name()))
    }
}

impl UpdateStore for NvsStore {
    fn installed_version(&self) -> Option<piconode_common::FirmwareVersion> {
        let raw = self.read_string(NVS_NAMESPACE, &Self::nvs_key(VERSION_FILE))?;
        match serde_json::from_str::<VersionRecord>(&raw) {
            Ok(record) => Some(record.version),
            Err(err) => {
                warn!("corrupt version record: {err}; treating as absent");
                None
            }
        }
    }

    fn record_version(
        &mut self,
        version: piconode_common::FirmwareVersion,
    ) -> Result<(), PersistError> {
        let payload = serde_json::to_string(&VersionRecord { version })
            .map_err(|err| PersistError::Storage(err.to_string()))?;
        self.write_string(NVS_NAMESPACE, &Self::nvs_key(VERSION_FILE), &payload)
    }

    fn write_update_file(&mut self, path: &str, contents: &str) -> Result<(), PersistError> {
        self.write_string(NVS_FILE_NAMESPACE, &Self::nvs_key(path), contents)
    }

    fn update_requested(&self) -> bool {
        self.marker_present(Marker::UpdateRequested)
    }

    fn clear_update_request(&mut self) -> Result<(), PersistError> {
        self.clear_marker(Marker::UpdateRequested)
    }
}

struct EspFetcher {
    online: Arc<AtomicBool>,
}

impl UpdateFetcher for EspFetcher {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    fn fetch_text(&mut self, url: &str) -> Result<String, FetchError> {
        let connection = EspHttpConnection::new(&HttpClientConfiguration {
            timeout: Some(Duration::from_secs(30)),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        })
        .map_err(|err| FetchError::Transport(err.to_string()))?;
        let mut client = HttpClient::wrap(connection);

        let request = client
            .request(Method::Get, url, &[])
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        let mut response = request
            .submit()
            .map_err(|err| FetchError::Transport(format!("{err:?}")))?;

        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(FetchError::Status(status));
        }

        let mut body = Vec::new();
        let mut chunk = [0_u8; FETCH_CHUNK_SIZE];
        loop {
            let read = response
                .read(&mut chunk)
                .map_err(|err| FetchError::Transport(format!("{err:?}")))?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }

        String::from_utf8(body).map_err(|err| FetchError::Transport(err.to_string()))
    }
}

struct EspMqttLink {
    client: Option<EspMqttClient<'static>>,
    connected: Arc<AtomicBool>,
    config: MqttConfig,
}

impl EspMqttLink {
    fn new(config: MqttConfig) -> Self {
        Self {
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// Recreates the client and its poll thread, the full re-resolve and
    /// re-authenticate path.
    fn establish(&mut self) -> anyhow::Result<()> {
        let url = format!("mqtt://{}:{}", self.config.host, self.config.port);
        let conf = MqttClientConfiguration {
            client_id: Some(&self.config.client_id),
            username: if self.config.username.is_empty() {
                None
            } else {
                Some(&self.config.username)
            },
            password: if self.config.password.is_empty() {
                None
            } else {
                Some(&self.config.password)
            },
            ..Default::default()
        };

        let (client, mut connection) = EspMqttClient::new(&url, &conf)?;
        let connected = self.connected.clone();
        connected.store(false, Ordering::Relaxed);

        thread::Builder::new()
            .name("mqtt-poll".to_string())
            .stack_size(8192)
            .spawn(move || {
                loop {
                    match connection.next() {
                        Ok(_event) => {
                            connected.store(true, Ordering::Relaxed);
                        }
                        Err(err) => {
                            connected.store(false, Ordering::Relaxed);
                            warn!("mqtt poll error: {err:?}");
                            // The thread ends with its connection; a
                            // reconnect spawns a fresh one.
                            break;
                        }
                    }
                }
            })
            .context("failed to spawn mqtt poll thread")?;

        self.client = Some(client);
        Ok(())
    }
}

impl PublishTransport for EspMqttLink {
    fn connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Relaxed)
    }

    fn reconnect(&mut self) -> Result<(), PublishError> {
        self.client = None;
        self.establish()
            .map_err(|err| PublishError::Unreachable(err.to_string()))
    }

    fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let Some(client) = self.client.as_mut() else {
            return Err(PublishError::NotConnected);
        };
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .map(|_| ())
            .map_err(|err| PublishError::Unreachable(err.to_string()))
    }
}

struct RgbPwm {
    red: LedcDriver<'static>,
    green: LedcDriver<'static>,
    blue: LedcDriver<'static>,
}

impl RgbPwm {
    /// Levels arrive on the 16-bit scale and are folded into the LEDC
    /// timer's actual duty range.
    fn set_levels(&mut self, r: u32, g: u32, b: u32) {
        let max = self.red.get_max_duty();
        let _ = self.red.set_duty(r * max / MAX_DUTY);
        let _ = self.green.set_duty(g * max / MAX_DUTY);
        let _ = self.blue.set_duty(b * max / MAX_DUTY);
    }

    fn quiesce(&mut self) {
        self.set_levels(0, 0, 0);
    }
}

struct EspFadeHandle {
    stop: Arc<AtomicBool>,
}

impl FadeHandle for EspFadeHandle {
    /// Cooperative: the fade thread observes the flag at its next step and
    /// quiesces the outputs before terminating.
    fn cancel(self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn spawn_fade_thread(
    pwm: Arc<Mutex<RgbPwm>>,
    rgb_state: Arc<Mutex<String>>,
    fade_secs: u64,
) -> EspFadeHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let handle = EspFadeHandle { stop: stop.clone() };
    let step_delay = Duration::from_millis((fade_secs * 1_000 / u64::from(FADE_STEPS)).max(1));

    thread::Builder::new()
        .name("rgb-fade".to_string())
        .stack_size(4096)
        .spawn(move || {
            let mut colors = ColorSource::new(monotonic_ms() as u32 | 1);

            'fade: loop {
                let (r, g, b) = colors.next_color();
                *rgb_state.lock().unwrap() = rgb_css(r, g, b);

                for step in (0..=FADE_STEPS).chain((0..=FADE_STEPS).rev()) {
                    if stop.load(Ordering::Relaxed) {
                        break 'fade;
                    }
                    pwm.lock().unwrap().set_levels(
                        duty_for_step(r, step, FADE_STEPS),
                        duty_for_step(g, step, FADE_STEPS),
                        duty_for_step(b, step, FADE_STEPS),
                    );
                    thread::sleep(step_delay);
                }
            }

            // Cleanup runs on every exit path.
            pwm.lock().unwrap().quiesce();
            *rgb_state.lock().unwrap() = rgb_css(0, 0, 0);
            info!("RGB task cancelled");
        })
        .expect("failed to spawn rgb fade thread");

    handle
}

#[derive(Clone)]
struct EspHubClient {
    config: HubConfig,
}

impl EspHubClient {
    fn enabled(&self) -> bool {
        !self.config.base_url.is_empty() && !self.config.token.is_empty()
    }

    fn post_json(&self, url: &str, body: &[u8]) -> anyhow::Result<u16> {
        let connection = EspHttpConnection::new(&HttpClientConfiguration {
            timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        })?;
        let mut client = HttpClient::wrap(connection);

        let auth = hub::bearer(&self.config.token);
        let headers = [
            ("Authorization", auth.as_str()),
            ("Content-Type", "application/json"),
        ];
        let mut request = client.post(url, &headers)?;
        request.write_all(body)?;
        let response = request.submit().map_err(|err| anyhow!("{err:?}"))?;
        Ok(response.status())
    }

    fn toggle_entity(&self, domain: &str, entity: &str, action: &str) {
        if !self.enabled() {
            return;
        }
        let url = hub::service_url(&self.config.base_url, domain, action);
        let body = match serde_json::to_vec(&ServiceCall { entity_id: entity }) {
            Ok(body) => body,
            Err(err) => {
                warn!("hub payload serialization failed: {err}");
                return;
            }
        };
        match self.post_json(&url, &body) {
            Ok(status) if (200..300).contains(&status) => info!("{entity} {action} ok"),
            Ok(status) => warn!("hub {action} for {entity} failed: HTTP {status}"),
            Err(err) => warn!("hub connection error: {err:#}"),
        }
    }

    fn update_state(&self, entity: &str, payload: &BrightnessState) {
        if !self.enabled() {
            return;
        }
        let url = hub::state_url(&self.config.base_url, entity);
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(err) => {
                warn!("hub payload serialization failed: {err}");
                return;
            }
        };
        match self.post_json(&url, &body) {
            Ok(status) if (200..300).contains(&status) => {}
            Ok(status) => warn!("hub state update for {entity} failed: HTTP {status}"),
            Err(err) => warn!("hub connection error: {err:#}"),
        }
    }
}

fn spawn_telemetry_thread(
    mqtt: MqttConfig,
    interval_secs: u64,
    dht_pin: esp_idf_hal::gpio::Gpio16,
) {
    thread::Builder::new()
        .name("telemetry".to_string())
        .stack_size(8192)
        .spawn(move || {
            let mut pin = match PinDriver::input_output_od(dht_pin) {
                Ok(pin) => pin,
                Err(err) => {
                    warn!("DHT11 unavailable on GPIO{DHT_PIN}: {err}");
                    return;
                }
            };
            let _ = pin.set_pull(Pull::Up);
            let _ = pin.set_high();
            let mut delay = Ets;

            let mut link = EspMqttLink::new(mqtt);
            if let Err(err) = link.establish() {
                warn!("initial mqtt connect failed: {err:#}");
            }
            let mut publisher = PublishClient::new(link);

            if !publisher.publish(TOPIC_NODE_STATUS, b"online") {
                warn!("failed to publish online status");
            }

            loop {
                match dht_sensor::dht11::blocking::read(&mut delay, &mut pin) {
                    Ok(reading) => {
                        let payload = serde_json::json!({
                            "temperature": reading.temperature,
                            "humidity": reading.relative_humidity,
                        })
                        .to_string();
                        if !publisher.publish(TOPIC_SENSOR_CLIMATE, payload.as_bytes()) {
                            warn!("climate sample dropped this cycle");
                        }
                    }
                    Err(err) => warn!("DHT11 read failed: {err:?}"),
                }

                thread::sleep(Duration::from_secs(interval_secs));
            }
        })
        .expect("failed to spawn telemetry thread");
}

fn spawn_motion_thread(
    pir_pin: esp_idf_hal::gpio::Gpio27,
    slot: Arc<Mutex<AnimationSlot<EspFadeHandle>>>,
    pwm: Arc<Mutex<RgbPwm>>,
    rgb_state: Arc<Mutex<String>>,
    hub: EspHubClient,
    config: Arc<NodeConfig>,
) {
    thread::Builder::new()
        .name("pir-motion".to_string())
        .stack_size(8192)
        .spawn(move || {
            let pir = match PinDriver::input(pir_pin) {
                Ok(pir) => pir,
                Err(err) => {
                    warn!("PIR unavailable on GPIO{PIR_PIN}: {err}");
                    return;
                }
            };

            let mut gate = MotionGate::new();
            let poll = Duration::from_millis(config.telemetry.motion_poll_ms);
            info!("PIR sensor activated");

            loop {
                let pir_high = pir.is_high();

                let action = {
                    let mut slot = slot.lock().unwrap();
                    let action = gate.observe(pir_high, slot.is_running());
                    match action {
                        Some(MotionAction::Activate) => {
                            let pwm = pwm.clone();
                            let rgb_state = rgb_state.clone();
                            let fade_secs = config.telemetry.fade_secs;
                            slot.start_with(|| spawn_fade_thread(pwm, rgb_state, fade_secs));
                        }
                        Some(MotionAction::Deactivate) => {
                            slot.stop();
                        }
                        None => {}
                    }
                    action
                };

                match action {
                    Some(MotionAction::Activate) => {
                        info!("Motion detected!");
                        hub.toggle_entity("input_boolean", &config.hub.motion_entity, "turn_on");
                    }
                    Some(MotionAction::Deactivate) => {
                        info!("No motion");
                        hub.toggle_entity("input_boolean", &config.hub.motion_entity, "turn_off");
                    }
                    None => {}
                }

                thread::sleep(poll);
            }
        })
        .expect("failed to spawn motion thread");
}

fn spawn_brightness_thread(
    adc1: esp_idf_hal::adc::ADC1,
    adc_pin: esp_idf_hal::gpio::Gpio34,
    hub: EspHubClient,
    config: Arc<NodeConfig>,
) {
    thread::Builder::new()
        .name("brightness".to_string())
        .stack_size(8192)
        .spawn(move || {
            let adc = match AdcDriver::new(adc1) {
                Ok(adc) => adc,
                Err(err) => {
                    warn!("ADC unavailable: {err}");
                    return;
                }
            };
            let channel_config = AdcChannelConfig {
                attenuation: DB_11,
                ..Default::default()
            };
            let mut channel = match AdcChannelDriver::new(&adc, adc_pin, &channel_config) {
                Ok(channel) => channel,
                Err(err) => {
                    warn!("photocell channel unavailable: {err}");
                    return;
                }
            };

            let sensor = Photocell::new(10_000.0, 5.0);
            let interval = Duration::from_secs(config.telemetry.brightness_interval_secs);

            loop {
                match adc.read(&mut channel) {
                    Ok(raw) => {
                        // 12-bit sample widened to the 16-bit divider scale.
                        let sample = raw.saturating_mul(16);
                        let lux = sensor.lux_from_adc(sample);
                        info!("current brightness: {lux} lx");
                        hub.update_state(
                            &config.hub.brightness_entity,
                            &BrightnessState::illuminance(lux),
                        );
                    }
                    Err(err) => warn!("photocell read failed: {err}"),
                }

                thread::sleep(interval);
            }
        })
        .expect("failed to spawn brightness thread");
}

#[derive(Clone)]
struct ServerContext {
    config: Arc<NodeConfig>,
    store: NvsStore,
    wifi: Arc<Mutex<WifiManager<EspRadio>>>,
    updater: Arc<Mutex<UpdateCoordinator<EspFetcher, NvsStore>>>,
    slot: Arc<Mutex<AnimationSlot<EspFadeHandle>>>,
    pwm: Arc<Mutex<RgbPwm>>,
    rgb_state: Arc<Mutex<String>>,
}

impl ServerContext {
    fn connected_ip(&self) -> Option<String> {
        let wifi = self.wifi.lock().unwrap();
        wifi.ip().map(String::from)
    }
}

fn create_http_server(ctx: ServerContext) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    {
        let ctx = ctx.clone();
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            if let Some(ip) = ctx.connected_ip() {
                return write_html(req, &pages::success_page(&ip));
            }
            let ssids = { ctx.wifi.lock().unwrap().scan_ssids() };
            write_html(
                req,
                &pages::config_page(
                    "Connect to 'PicoW-Setup' network<br>if you're seeing this page",
                    &ssids,
                ),
            )
        })?;
    }

    {
        let ctx = ctx.clone();
        server.fn_handler::<anyhow::Error, _>("/status", Method::Get, move |req| {
            let Some(ip) = ctx.connected_ip() else {
                return write_status(req, 404, "Not Found");
            };
            let ssid = ctx
                .store
                .load_credentials()
                .map(|credentials| credentials.ssid)
                .unwrap_or_else(|| "Unknown".to_string());
            let version = { ctx.updater.lock().unwrap().installed_version().to_string() };
            write_html(req, &pages::status_page(&ip, &ssid, "Connected", &version))
        })?;
    }

    {
        let ctx = ctx.clone();
        server.fn_handler::<anyhow::Error, _>("/system", Method::Get, move |req| {
            let uri = req.uri().to_string();
            let Some(action) = query_param(&uri, "action") else {
                return write_status(req, 400, "Missing 'action' parameter");
            };

            match action.as_str() {
                "check_update" => {
                    let result = { ctx.updater.lock().unwrap().check_for_update() };
                    let text = match result {
                        Ok(Availability::UpdateAvailable { manifest }) => {
                            format!("Update available: version {}", manifest.version)
                        }
                        Ok(Availability::UpToDate { installed }) => {
                            format!("No new updates available (version {installed})")
                        }
                        Err(err) => format!("Update check failed: {err}"),
                    };
                    write_text(req, &text)
                }
                "to_be_updated" => {
                    let mut store = ctx.store.clone();
                    match store.set_marker(Marker::UpdateRequested) {
                        Ok(()) => write_text(req, "Update scheduled for next reboot"),
                        Err(err) => {
                            warn!("failed to set update marker: {err}");
                            write_status(req, 500, "Failed to schedule update")
                        }
                    }
                }
                "no_auto_run" => {
                    let mut store = ctx.store.clone();
                    match store.set_marker(Marker::NoAutoRun) {
                        Ok(()) => write_text(req, "Auto run disabled for next reboot"),
                        Err(err) => {
                            warn!("failed to set no_auto_run marker: {err}");
                            write_status(req, 500, "Failed to disable auto run")
                        }
                    }
                }
                "reset" => {
                    schedule_restart();
                    write_text(req, "Restarting device...")
                }
                _ => write_status(req, 400, "Unknown action"),
            }
        })?;
    }

    {
        let ctx = ctx.clone();
        server.fn_handler::<anyhow::Error, _>("/control", Method::Get, move |req| {
            let uri = req.uri().to_string();
            if query_param(&uri, "attribute").as_deref() == Some("current_rgb") {
                let current = ctx.rgb_state.lock().unwrap().clone();
                return write_text(req, &current);
            }
            write_html(req, &pages::control_page(""))
        })?;
    }

    {
        let ctx = ctx.clone();
        server.fn_handler::<anyhow::Error, _>("/control", Method::Post, move |req| {
            let outcome = {
                let mut slot = ctx.slot.lock().unwrap();
                let pwm = ctx.pwm.clone();
                let rgb_state = ctx.rgb_state.clone();
                let fade_secs = ctx.config.telemetry.fade_secs;
                slot.toggle_with(|| spawn_fade_thread(pwm, rgb_state, fade_secs))
            };
            write_text(req, outcome.message())
        })?;
    }

    {
        let ctx = ctx.clone();
        server.fn_handler::<anyhow::Error, _>("/config", Method::Get, move |req| {
            let ssids = { ctx.wifi.lock().unwrap().scan_ssids() };
            write_html(
                req,
                &pages::config_page(
                    "Enter new Wi-Fi credentials<div><a href=\"/\" class=\"link\">Back to Home</a></div>",
                    &ssids,
                ),
            )
        })?;
    }

    {
        let ctx = ctx.clone();
        server.fn_handler::<anyhow::Error, _>("/config", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let body = String::from_utf8_lossy(&body).into_owned();
            let ssid = form_field(&body, "ssid").filter(|value| !value.is_empty());
            let password = form_field(&body, "password").filter(|value| !value.is_empty());
            let (Some(ssid), Some(password)) = (ssid, password) else {
                return write_status(req, 400, "Missing ssid or password");
            };

            let credentials = NetworkCredentials { ssid, password };
            {
                let mut store = ctx.store.clone();
                if let Err(err) = store.save_credentials(&credentials) {
                    warn!("failed to persist credentials: {err}");
                }
            }

            let result = {
                let mut wifi = ctx.wifi.lock().unwrap();
                wifi.connect_station(&credentials.ssid, &credentials.password)
            };

            match result {
                Ok(ip) => write_html(req, &pages::success_page(&ip)),
                Err(err) => {
                    warn!("{err}");
                    let ssids = { ctx.wifi.lock().unwrap().scan_ssids() };
                    write_html(
                        req,
                        &pages::config_page(
                            "Failed to connect. Please try again.<br>Connect to 'PicoW-Setup' network",
                            &ssids,
                        ),
                    )
                }
            }
        })?;
    }

    {
        let ctx = ctx.clone();
        server.fn_handler::<anyhow::Error, _>("/success", Method::Get, move |req| {
            if let Some(ip) = ctx.connected_ip() {
                return write_html(req, &pages::success_page(&ip));
            }
            let Some(credentials) = ctx.store.load_credentials() else {
                return write_status(req, 404, "Not Found");
            };
            let result = {
                let mut wifi = ctx.wifi.lock().unwrap();
                wifi.connect_station(&credentials.ssid, &credentials.password)
            };
            match result {
                Ok(ip) => write_html(req, &pages::success_page(&ip)),
                Err(_) => write_status(req, 404, "Not Found"),
            }
        })?;
    }

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_html(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    body: &str,
) -> anyhow::Result<()> {
    req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
        .write_all(body.as_bytes())?;
    Ok(())
}

fn write_text(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    body: &str,
) -> anyhow::Result<()> {
    req.into_response(200, Some("OK"), &[("Content-Type", "text/plain; charset=utf-8")])?
        .write_all(body.as_bytes())?;
    Ok(())
}

fn write_status(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    req.into_response(status_code, None, &[("Content-Type", "text/plain; charset=utf-8")])?
        .write_all(message.as_bytes())?;
    Ok(())
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(value.replace('+', " "));
        }
    }

    None
}

fn form_field(body: &str, key: &str) -> Option<String> {
    for pair in body.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(url_decode(value));
        }
    }

    None
}

fn url_decode(value: &str) -> String {
    let value = value.replace('+', " ");
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(hex) = value.get(i + 1..i + 3) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn schedule_restart() {
    thread::Builder::new()
        .name("restart-request".to_string())
        .spawn(|| {
            thread::sleep(Duration::from_millis(800));
            unsafe { esp_idf_svc::sys::esp_restart() };
        })
        .expect("failed to spawn restart thread");
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

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
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
