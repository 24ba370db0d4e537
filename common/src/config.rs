use serde::{Deserialize, Serialize};

/// Station credentials, persisted as the `wifi_config.json` record and
/// overwritten by the configuration endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredentials {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub keepalive_secs: u16,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: "piconode".to_string(),
            keepalive_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Repository the update manifest and files are fetched from.
    pub repo_url: String,
}

/// Station association policy: attempt budget, inter-attempt delay, and the
/// link polling window within one attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WifiPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub link_poll_ms: u64,
}

impl Default for WifiPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 2_000,
            connect_timeout_ms: 15_000,
            link_poll_ms: 500,
        }
    }
}

/// Identity of the fallback configuration access point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApConfig {
    pub ssid: String,
    pub password: String,
}

impl Default for ApConfig {
    fn default() -> Self {
        Self {
            ssid: "PicoW-Setup".to_string(),
            password: "picow1234".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Home-automation hub root, e.g. `http://192.168.1.10:8123`.
    pub base_url: String,
    pub token: String,
    pub motion_entity: String,
    pub brightness_entity: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: String::new(),
            motion_entity: "input_boolean.mobile_motion_sensor".to_string(),
            brightness_entity: "sensor.mobile_brightness_detector".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub publish_interval_secs: u64,
    pub brightness_interval_secs: u64,
    pub motion_poll_ms: u64,
    /// One fade-in plus fade-out takes two of these.
    pub fade_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            publish_interval_secs: 30,
            brightness_interval_secs: 10,
            motion_poll_ms: 500,
            fade_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub mqtt: MqttConfig,
    pub update: UpdateConfig,
    pub wifi: WifiPolicy,
    pub ap: ApConfig,
    pub hub: HubConfig,
    pub telemetry: TelemetryConfig,
}

impl NodeConfig {
    pub fn sanitize(&mut self) {
        if self.mqtt.port == 0 {
            self.mqtt.port = 1883;
        }
        if self.mqtt.client_id.trim().is_empty() {
            self.mqtt.client_id = "piconode".to_string();
        }
        self.mqtt.keepalive_secs = self.mqtt.keepalive_secs.max(5);

        self.wifi.max_retries = self.wifi.max_retries.clamp(1, 10);
        self.wifi.retry_delay_ms = self.wifi.retry_delay_ms.max(250);
        self.wifi.connect_timeout_ms = self.wifi.connect_timeout_ms.max(1_000);
        self.wifi.link_poll_ms = self
            .wifi
            .link_poll_ms
            .clamp(100, self.wifi.connect_timeout_ms);

        self.update.repo_url = self.update.repo_url.trim().to_string();
        self.hub.base_url = self.hub.base_url.trim_end_matches('/').to_string();

        self.telemetry.publish_interval_secs = self.telemetry.publish_interval_secs.max(1);
        self.telemetry.brightness_interval_secs = self.telemetry.brightness_interval_secs.max(1);
        self.telemetry.motion_poll_ms = self.telemetry.motion_poll_ms.max(100);
        self.telemetry.fade_secs = self.telemetry.fade_secs.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_boot_constants() {
        let config = NodeConfig::default();

        assert_eq!(config.wifi.max_retries, 3);
        assert_eq!(config.wifi.retry_delay_ms, 2_000);
        assert_eq!(config.wifi.connect_timeout_ms, 15_000);
        assert_eq!(config.wifi.link_poll_ms, 500);
        assert_eq!(config.ap.ssid, "PicoW-Setup");
        assert_eq!(config.ap.password, "picow1234");
    }

    #[test]
    fn sanitize_repairs_out_of_range_values() {
        let mut config = NodeConfig::default();
        config.mqtt.port = 0;
        config.wifi.max_retries = 0;
        config.wifi.link_poll_ms = 0;
        config.hub.base_url = "http://hub.local/".to_string();
        config.telemetry.motion_poll_ms = 0;

        config.sanitize();

        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.wifi.max_retries, 1);
        assert_eq!(config.wifi.link_poll_ms, 100);
        assert_eq!(config.hub.base_url, "http://hub.local");
        assert_eq!(config.telemetry.motion_poll_ms, 100);
    }
}
