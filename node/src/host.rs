use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use axum::{
    extract::{Form, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use piconode_common::{
    actuator::{duty_for_step, rgb_css, FADE_STEPS},
    hub::{self, BrightnessState, ServiceCall},
    light::Photocell,
    store::{VersionRecord, VERSION_FILE, WIFI_CONFIG_FILE},
    update::Availability,
    AnimationSlot, ColorSource, ConfigStore, ConnectionState, FadeHandle, FetchError,
    HubConfig, LinkStatus, Marker, MotionAction, MotionGate, NetworkCredentials, NodeConfig,
    PersistError, PublishClient, PublishError, PublishTransport, RadioError, UpdateCoordinator,
    UpdateFetcher, UpdateOutcome, UpdateStore, WifiDriver, WifiManager, TOPIC_NODE_STATUS,
    TOPIC_SENSOR_CLIMATE,
};

use crate::pages;

const WIFI_GRACE_SECS: u64 = 300;

#[derive(Clone)]
struct AppState {
    config: Arc<NodeConfig>,
    store: FsStore,
    wifi: Arc<Mutex<WifiManager<SimRadio>>>,
    updater: Arc<Mutex<UpdateCoordinator<HostFetcher, FsStore>>>,
    slot: Arc<Mutex<AnimationSlot<HostFadeHandle>>>,
    rgb: SharedRgb,
    wifi_connected: Arc<AtomicBool>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = NodeConfig::default();
    apply_env_overrides(&mut config);
    config.sanitize();
    let config = Arc::new(config);

    let data_dir = std::env::var("PICONODE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.piconode"));
    let store = FsStore::new(data_dir);

    let wifi = Arc::new(Mutex::new(WifiManager::new(
        SimRadio::from_env(),
        config.wifi,
        config.ap.clone(),
    )));
    let wifi_connected = Arc::new(AtomicBool::new(false));

    let credentials = store.load_credentials();
    let boot_state = {
        let wifi = wifi.clone();
        tokio::task::spawn_blocking(move || wifi.lock().unwrap().connect_or_fallback(credentials.as_ref()))
            .await
            .context("wifi boot task panicked")?
    };
    let connected = matches!(boot_state, ConnectionState::Connected { .. });
    wifi_connected.store(connected, Ordering::Relaxed);
    info!("network boot state: {boot_state:?}");

    let updater = Arc::new(Mutex::new(UpdateCoordinator::new(
        &config.update.repo_url,
        HostFetcher {
            online: wifi_connected.clone(),
            client: None,
        },
        store.clone(),
    )));

    // An update requested from the status page runs before anything else.
    if connected && store.marker_present(Marker::UpdateRequested) {
        let updater = updater.clone();
        let outcome =
            tokio::task::spawn_blocking(move || updater.lock().unwrap().apply_if_available())
                .await
                .context("boot update task panicked")?;
        info!("boot update check: {}", outcome.message());
        if let UpdateOutcome::Updated(version) = outcome {
            info!("installed version {version}; restarting");
            schedule_restart();
        }
    }

    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        wifi,
        updater,
        slot: Arc::new(Mutex::new(AnimationSlot::new())),
        rgb: Arc::new(Mutex::new(RgbSnapshot::default())),
        wifi_connected,
    };

    if state.store.marker_present(Marker::NoAutoRun) {
        warn!("no_auto_run marker present; background producers suppressed this boot");
        let mut store = state.store.clone();
        if let Err(err) = store.clear_marker(Marker::NoAutoRun) {
            warn!("failed to consume no_auto_run marker: {err}");
        }
    } else if connected {
        start_background_producers(&state).await;
    }
    spawn_wifi_health_loop(state.clone());

    let app = Router::new()
        .route("/", get(handle_index))
        .route("/status", get(handle_status))
        .route("/system", get(handle_system))
        .route("/control", get(handle_control_page).post(handle_control_toggle))
        .route("/config", get(handle_config_page).post(handle_config_submit))
        .route("/success", get(handle_success))
        .with_state(state);

    let port = std::env::var("PICONODE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind node server at {addr}"))?;

    info!("node listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn apply_env_overrides(config: &mut NodeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        config.mqtt.host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.mqtt.port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        config.mqtt.username = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        config.mqtt.password = pass;
    }
    if let Ok(repo) = std::env::var("PICONODE_REPO_URL") {
        config.update.repo_url = repo;
    }
    if let Ok(url) = std::env::var("PICONODE_HUB_URL") {
        config.hub.base_url = url;
    }
    if let Ok(token) = std::env::var("PICONODE_HUB_TOKEN") {
        config.hub.token = token;
    }
}

/// Development stand-in for the Wi-Fi radio. Associates with any non-empty
/// SSID unless `PICONODE_SIM_JOINABLE` narrows it; delays are compressed so
/// the retry policy stays observable without real-time waits.
struct SimRadio {
    epoch: Instant,
    joinable: Option<String>,
    scan_list: Vec<String>,
    associating: Option<bool>,
    ap_active: bool,
}

impl SimRadio {
    fn from_env() -> Self {
        let scan_list = std::env::var("PICONODE_SIM_SSIDS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_else(|_| vec!["HomeNet".to_string(), "Neighbor-5G".to_string()]);

        Self {
            epoch: Instant::now(),
            joinable: std::env::var("PICONODE_SIM_JOINABLE").ok(),
            scan_list,
            associating: None,
            ap_active: false,
        }
    }

    fn accepts(&self, ssid: &str) -> bool {
        match &self.joinable {
            Some(joinable) => joinable == ssid,
            None => !ssid.trim().is_empty(),
        }
    }
}

impl WifiDriver for SimRadio {
    fn station_start(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    fn station_connect(&mut self, ssid: &str, _password: &str) -> Result<(), RadioError> {
        self.associating = Some(self.accepts(ssid));
        Ok(())
    }

    fn station_link(&mut self) -> LinkStatus {
        if self.associating == Some(true) {
            LinkStatus::Up("192.168.1.64".to_string())
        } else {
            LinkStatus::Down
        }
    }

    fn station_disconnect(&mut self) {
        self.associating = None;
    }

    fn station_stop(&mut self) {}

    fn ap_start(&mut self, _ssid: &str, _password: &str) -> Result<(), RadioError> {
        self.ap_active = true;
        Ok(())
    }

    fn ap_active(&self) -> bool {
        self.ap_active
    }

    fn ap_stop(&mut self) {
        self.ap_active = false;
    }

    fn scan(&mut self) -> Result<Vec<String>, RadioError> {
        let mut names = self.scan_list.clone();
        if let Some(joinable) = &self.joinable {
            names.push(joinable.clone());
        }
        Ok(names)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn sleep_ms(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms.min(25)));
    }
}

#[derive(Clone)]
struct FsStore {
    data_dir: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl FsStore {
    fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir: Arc::new(data_dir),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let _guard = self.lock.lock().unwrap();
        match std::fs::read(self.path_for(name)) {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!("corrupt record {name}: {err}; treating as absent");
                    None
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                warn!("failed to read {name}: {err}");
                None
            }
        }
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), PersistError> {
        let _guard = self.lock.lock().unwrap();
        let path = self.path_for(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(storage_error)?;
        }
        let payload = serde_json::to_vec_pretty(value)
            .map_err(|err| PersistError::Storage(err.to_string()))?;
        std::fs::write(path, payload).map_err(storage_error)
    }

    fn update_file_path(&self, name: &str) -> Result<PathBuf, PersistError> {
        let relative = Path::new(name);
        if relative.is_absolute()
            || relative
                .components()
                .any(|part| matches!(part, Component::ParentDir))
        {
            return Err(PersistError::Storage(format!(
                "refusing update file path {name}"
            )));
        }
        Ok(self.data_dir.join(relative))
    }
}

fn storage_error(err: std::io::Error) -> PersistError {
    PersistError::Storage(err.to_string())
}

impl ConfigStore for FsStore {
    fn load_credentials(&self) -> Option<NetworkCredentials> {
        self.read_json(WIFI_CONFIG_FILE)
    }

    fn save_credentials(&mut self, credentials: &NetworkCredentials) -> Result<(), PersistError> {
        self.write_json(WIFI_CONFIG_FILE, credentials)
    }

    fn marker_present(&self, marker: Marker) -> bool {
        self.path_for(marker.file_name()).exists()
    }

    fn set_marker(&mut self, marker: Marker) -> Result<(), PersistError> {
        let _guard = self.lock.lock().unwrap();
        let path = self.path_for(marker.file_name());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(storage_error)?;
        }
        std::fs::write(path, b"").map_err(storage_error)
    }

    fn clear_marker(&mut self, marker: Marker) -> Result<(), PersistError> {
        match std::fs::remove_file(self.path_for(marker.file_name())) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_error(err)),
        }
    }
}

impl UpdateStore for FsStore {
    fn installed_version(&self) -> Option<piconode_common::FirmwareVersion> {
        self.read_json::<VersionRecord>(VERSION_FILE)
            .map(|record| record.version)
    }

    fn record_version(
        &mut self,
        version: piconode_common::FirmwareVersion,
    ) -> Result<(), PersistError> {
        self.write_json(VERSION_FILE, &VersionRecord { version })
    }

    fn write_update_file(&mut self, path: &str, contents: &str) -> Result<(), PersistError> {
        let target = self.update_file_path(path)?;
        let _guard = self.lock.lock().unwrap();
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(storage_error)?;
        }
        std::fs::write(target, contents).map_err(storage_error)
    }

    fn update_requested(&self) -> bool {
        self.marker_present(Marker::UpdateRequested)
    }

    fn clear_update_request(&mut self) -> Result<(), PersistError> {
        self.clear_marker(Marker::UpdateRequested)
    }
}

struct HostFetcher {
    online: Arc<AtomicBool>,
    client: Option<reqwest::blocking::Client>,
}

impl UpdateFetcher for HostFetcher {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    fn fetch_text(&mut self, url: &str) -> Result<String, FetchError> {
        if self.client.is_none() {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|err| FetchError::Transport(err.to_string()))?;
            self.client = Some(client);
        }
        let Some(client) = self.client.as_ref() else {
            return Err(FetchError::Transport("http client unavailable".to_string()));
        };

        let response = client
            .get(url)
            .send()
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        response
            .text()
            .map_err(|err| FetchError::Transport(err.to_string()))
    }
}

#[derive(Clone)]
struct MqttLink {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl PublishTransport for MqttLink {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn reconnect(&mut self) -> Result<(), PublishError> {
        // The event loop re-establishes the session on its own; the link
        // is usable again once it reports connected.
        if self.connected() {
            Ok(())
        } else {
            Err(PublishError::NotConnected)
        }
    }

    fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|err| PublishError::Unreachable(err.to_string()))
    }
}

fn spawn_mqtt_eventloop(mut eventloop: rumqttc::EventLoop, connected: Arc<AtomicBool>) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    connected.store(true, Ordering::Relaxed);
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    connected.store(false, Ordering::Relaxed);
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

#[derive(Debug)]
struct RgbSnapshot {
    duties: [u32; 3],
    current_rgb: String,
}

impl Default for RgbSnapshot {
    fn default() -> Self {
        Self {
            duties: [0; 3],
            current_rgb: rgb_css(0, 0, 0),
        }
    }
}

type SharedRgb = Arc<Mutex<RgbSnapshot>>;

struct HostFadeHandle {
    stop: Arc<AtomicBool>,
    outputs: SharedRgb,
}

impl FadeHandle for HostFadeHandle {
    fn cancel(self) {
        self.stop.store(true, Ordering::Relaxed);
        // Quiesce immediately; the task also zeroes on its own exit path.
        let mut outputs = self.outputs.lock().unwrap();
        outputs.duties = [0; 3];
        outputs.current_rgb = rgb_css(0, 0, 0);
    }
}

fn spawn_fade(outputs: SharedRgb, fade_secs: u64) -> HostFadeHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let handle = HostFadeHandle {
        stop: stop.clone(),
        outputs: outputs.clone(),
    };
    let step_delay =
        Duration::from_millis((fade_secs * 1_000 / u64::from(FADE_STEPS)).max(1));

    tokio::spawn(async move {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.subsec_nanos())
            .unwrap_or(1);
        let mut colors = ColorSource::new(seed);

        'fade: loop {
            let (r, g, b) = colors.next_color();
            {
                outputs.lock().unwrap().current_rgb = rgb_css(r, g, b);
            }
            for step in (0..=FADE_STEPS).chain((0..=FADE_STEPS).rev()) {
                if stop.load(Ordering::Relaxed) {
                    break 'fade;
                }
                {
                    let mut out = outputs.lock().unwrap();
                    out.duties = [
                        duty_for_step(r, step, FADE_STEPS),
                        duty_for_step(g, step, FADE_STEPS),
                        duty_for_step(b, step, FADE_STEPS),
                    ];
                }
                tokio::time::sleep(step_delay).await;
            }
        }

        // Cleanup runs on every exit path.
        let mut out = outputs.lock().unwrap();
        out.duties = [0; 3];
        out.current_rgb = rgb_css(0, 0, 0);
    });

    handle
}

#[derive(Clone)]
struct HubClient {
    http: reqwest::Client,
    config: HubConfig,
}

impl HubClient {
    fn new(config: HubConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn enabled(&self) -> bool {
        !self.config.base_url.is_empty() && !self.config.token.is_empty()
    }

    async fn toggle_entity(&self, domain: &str, entity: &str, action: &str) {
        if !self.enabled() {
            return;
        }
        let url = hub::service_url(&self.config.base_url, domain, action);
        let result = self
            .http
            .post(&url)
            .header("Authorization", hub::bearer(&self.config.token))
            .json(&ServiceCall { entity_id: entity })
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                info!("{entity} {action} ok");
            }
            Ok(response) => warn!("hub {action} for {entity} failed: HTTP {}", response.status()),
            Err(err) => warn!("hub connection error: {err}"),
        }
    }

    async fn update_state(&self, entity: &str, payload: &BrightnessState) {
        if !self.enabled() {
            return;
        }
        let url = hub::state_url(&self.config.base_url, entity);
        let result = self
            .http
            .post(&url)
            .header("Authorization", hub::bearer(&self.config.token))
            .json(payload)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!("hub state update for {entity} failed: HTTP {}", response.status()),
            Err(err) => warn!("hub connection error: {err}"),
        }
    }
}

async fn start_background_producers(state: &AppState) {
    let mqtt = &state.config.mqtt;
    let mut options = MqttOptions::new(mqtt.client_id.clone(), mqtt.host.clone(), mqtt.port);
    options.set_keep_alive(Duration::from_secs(mqtt.keepalive_secs.into()));
    if !mqtt.username.is_empty() {
        options.set_credentials(mqtt.username.clone(), mqtt.password.clone());
    }

    let (client, eventloop) = AsyncClient::new(options, 64);
    let connected = Arc::new(AtomicBool::new(false));
    spawn_mqtt_eventloop(eventloop, connected.clone());

    if let Err(err) = client
        .publish(TOPIC_NODE_STATUS, QoS::AtLeastOnce, true, "online")
        .await
    {
        warn!("failed to publish online status: {err}");
    }

    let link = MqttLink { client, connected };
    spawn_telemetry_loop(link, state.config.telemetry.publish_interval_secs);

    let hub = HubClient::new(state.config.hub.clone());
    spawn_motion_loop(state.clone(), hub.clone());
    spawn_brightness_loop(state.clone(), hub);
}

fn spawn_telemetry_loop(link: MqttLink, interval_secs: u64) {
    tokio::spawn(async move {
        let mut publisher = PublishClient::new(link);
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        let mut tick: u64 = 0;

        loop {
            interval.tick().await;
            tick = tick.saturating_add(1);

            // Hardware integration point: the ESP build reads a DHT11 here.
            let temperature = 21.0 + ((tick % 8) as f32) * 0.25;
            let humidity = 48.0 + ((tick % 6) as f32) * 0.5;

            let payload = serde_json::json!({
                "temperature": temperature,
                "humidity": humidity,
            })
            .to_string();

            if !publisher.publish(TOPIC_SENSOR_CLIMATE, payload.as_bytes()) {
                warn!("climate sample dropped this cycle");
            }
        }
    });
}

fn spawn_motion_loop(state: AppState, hub: HubClient) {
    tokio::spawn(async move {
        let mut gate = MotionGate::new();
        let mut interval =
            tokio::time::interval(Duration::from_millis(state.config.telemetry.motion_poll_ms));
        let mut tick: u64 = 0;

        loop {
            interval.tick().await;
            tick = tick.saturating_add(1);

            // Simulated PIR: a short motion burst every couple of minutes.
            let pir_high = tick % 240 < 20;

            let action = {
                let mut slot = state.slot.lock().unwrap();
                let action = gate.observe(pir_high, slot.is_running());
                match action {
                    Some(MotionAction::Activate) => {
                        let outputs = state.rgb.clone();
                        let fade_secs = state.config.telemetry.fade_secs;
                        slot.start_with(|| spawn_fade(outputs, fade_secs));
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
                    hub.toggle_entity("input_boolean", &state.config.hub.motion_entity, "turn_on")
                        .await;
                }
                Some(MotionAction::Deactivate) => {
                    info!("No motion");
                    hub.toggle_entity("input_boolean", &state.config.hub.motion_entity, "turn_off")
                        .await;
                }
                None => {}
            }
        }
    });
}

fn spawn_brightness_loop(state: AppState, hub: HubClient) {
    tokio::spawn(async move {
        let sensor = Photocell::new(10_000.0, 5.0);
        let mut interval = tokio::time::interval(Duration::from_secs(
            state.config.telemetry.brightness_interval_secs,
        ));
        let mut tick: u64 = 0;

        loop {
            interval.tick().await;
            tick = tick.saturating_add(1);

            // Simulated ambient sweep over the divider's usable range.
            let adc_value = 12_000_u16.saturating_add(((tick % 16) as u16) * 2_500);
            let lux = sensor.lux_from_adc(adc_value);
            info!("current brightness: {lux} lx");

            hub.update_state(
                &state.config.hub.brightness_entity,
                &BrightnessState::illuminance(lux),
            )
            .await;
        }
    });
}

fn spawn_wifi_health_loop(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        let mut down_since: Option<Instant> = None;

        loop {
            interval.tick().await;

            let (in_ap_mode, link_up) = {
                let mut wifi = state.wifi.lock().unwrap();
                let in_ap_mode = matches!(wifi.state(), ConnectionState::ApMode);
                let link_up = wifi.is_connected()
                    && matches!(wifi.driver_mut().station_link(), LinkStatus::Up(_));
                (in_ap_mode, link_up)
            };
            state.wifi_connected.store(link_up, Ordering::Relaxed);

            if link_up || in_ap_mode {
                down_since = None;
                continue;
            }

            let since = *down_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= Duration::from_secs(WIFI_GRACE_SECS) {
                warn!("station link down past the grace window; entering access point mode");
                let wifi = state.wifi.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    wifi.lock().unwrap().start_access_point()
                })
                .await;
                down_since = None;
            }
        }
    });
}

fn connected_ip(state: &AppState) -> Option<String> {
    let wifi = state.wifi.lock().unwrap();
    wifi.ip().map(String::from)
}

async fn handle_index(State(state): State<AppState>) -> Html<String> {
    if let Some(ip) = connected_ip(&state) {
        return Html(pages::success_page(&ip));
    }

    let ssids = { state.wifi.lock().unwrap().scan_ssids() };
    Html(pages::config_page(
        "Connect to 'PicoW-Setup' network<br>if you're seeing this page",
        &ssids,
    ))
}

async fn handle_status(State(state): State<AppState>) -> Response {
    let Some(ip) = connected_ip(&state) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let ssid = state
        .store
        .load_credentials()
        .map(|credentials| credentials.ssid)
        .unwrap_or_else(|| "Unknown".to_string());
    let version = { state.updater.lock().unwrap().installed_version().to_string() };

    Html(pages::status_page(&ip, &ssid, "Connected", &version)).into_response()
}

async fn handle_system(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(action) = params.get("action") else {
        return (StatusCode::BAD_REQUEST, "Missing 'action' parameter").into_response();
    };

    match action.as_str() {
        "check_update" => {
            let updater = state.updater.clone();
            let result =
                tokio::task::spawn_blocking(move || updater.lock().unwrap().check_for_update())
                    .await;
            let text = match result {
                Ok(Ok(Availability::UpdateAvailable { manifest })) => {
                    format!("Update available: version {}", manifest.version)
                }
                Ok(Ok(Availability::UpToDate { installed })) => {
                    format!("No new updates available (version {installed})")
                }
                Ok(Err(err)) => format!("Update check failed: {err}"),
                Err(_) => "Update check failed".to_string(),
            };
            text.into_response()
        }
        "to_be_updated" => {
            let mut store = state.store.clone();
            match store.set_marker(Marker::UpdateRequested) {
                Ok(()) => "Update scheduled for next reboot".into_response(),
                Err(err) => {
                    warn!("failed to set update marker: {err}");
                    (StatusCode::INTERNAL_SERVER_ERROR, "Failed to schedule update")
                        .into_response()
                }
            }
        }
        "no_auto_run" => {
            let mut store = state.store.clone();
            match store.set_marker(Marker::NoAutoRun) {
                Ok(()) => "Auto run disabled for next reboot".into_response(),
                Err(err) => {
                    warn!("failed to set no_auto_run marker: {err}");
                    (StatusCode::INTERNAL_SERVER_ERROR, "Failed to disable auto run")
                        .into_response()
                }
            }
        }
        "reset" => {
            schedule_restart();
            "Restarting device...".into_response()
        }
        _ => (StatusCode::BAD_REQUEST, "Unknown action").into_response(),
    }
}

async fn handle_control_page(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if params.get("attribute").map(String::as_str) == Some("current_rgb") {
        let current = state.rgb.lock().unwrap().current_rgb.clone();
        return current.into_response();
    }

    Html(pages::control_page("")).into_response()
}

async fn handle_control_toggle(State(state): State<AppState>) -> String {
    let outcome = {
        let mut slot = state.slot.lock().unwrap();
        let outputs = state.rgb.clone();
        let fade_secs = state.config.telemetry.fade_secs;
        slot.toggle_with(|| spawn_fade(outputs, fade_secs))
    };
    outcome.message().to_string()
}

async fn handle_config_page(State(state): State<AppState>) -> Html<String> {
    let ssids = { state.wifi.lock().unwrap().scan_ssids() };
    Html(pages::config_page(
        "Enter new Wi-Fi credentials<div><a href=\"/\" class=\"link\">Back to Home</a></div>",
        &ssids,
    ))
}

#[derive(Debug, Deserialize)]
struct ConfigForm {
    ssid: Option<String>,
    password: Option<String>,
}

async fn handle_config_submit(
    State(state): State<AppState>,
    Form(form): Form<ConfigForm>,
) -> Response {
    let ssid = form.ssid.filter(|value| !value.is_empty());
    let password = form.password.filter(|value| !value.is_empty());
    let (Some(ssid), Some(password)) = (ssid, password) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let credentials = NetworkCredentials { ssid, password };
    {
        let mut store = state.store.clone();
        if let Err(err) = store.save_credentials(&credentials) {
            warn!("failed to persist credentials: {err}");
        }
    }

    let wifi = state.wifi.clone();
    let attempt = credentials.clone();
    let result = tokio::task::spawn_blocking(move || {
        wifi.lock()
            .unwrap()
            .connect_station(&attempt.ssid, &attempt.password)
    })
    .await;

    match result {
        Ok(Ok(ip)) => {
            state.wifi_connected.store(true, Ordering::Relaxed);
            Html(pages::success_page(&ip)).into_response()
        }
        _ => {
            state.wifi_connected.store(false, Ordering::Relaxed);
            let ssids = { state.wifi.lock().unwrap().scan_ssids() };
            Html(pages::config_page(
                "Failed to connect. Please try again.<br>Connect to 'PicoW-Setup' network",
                &ssids,
            ))
            .into_response()
        }
    }
}

async fn handle_success(State(state): State<AppState>) -> Response {
    if let Some(ip) = connected_ip(&state) {
        return Html(pages::success_page(&ip)).into_response();
    }

    let Some(credentials) = state.store.load_credentials() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let wifi = state.wifi.clone();
    let result = tokio::task::spawn_blocking(move || {
        wifi.lock()
            .unwrap()
            .connect_station(&credentials.ssid, &credentials.password)
    })
    .await;

    match result {
        Ok(Ok(ip)) => {
            state.wifi_connected.store(true, Ordering::Relaxed);
            Html(pages::success_page(&ip)).into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Host stand-in for the device's hard reset.
fn schedule_restart() {
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(800)).await;
        std::process::exit(0);
    });
}
