use log::{info, warn};
use serde::Serialize;

use crate::{
    config::{ApConfig, NetworkCredentials, WifiPolicy},
    error::{ApError, ConnectError, RadioError},
};

/// Observable radio role. Exactly one variant is active at a time; station
/// and access-point roles are mutually exclusive. Mutated only by
/// [`WifiManager`] methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected { ip: String },
    ApMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Down,
    Joining,
    Up(String),
    Failed,
}

/// Radio primitives the manager drives. The clock and sleep live here too,
/// so the retry/timeout policy runs against a scripted fake in tests and
/// against the real radio's delays on device.
pub trait WifiDriver {
    fn station_start(&mut self) -> Result<(), RadioError>;
    fn station_connect(&mut self, ssid: &str, password: &str) -> Result<(), RadioError>;
    fn station_link(&mut self) -> LinkStatus;
    fn station_disconnect(&mut self);
    /// Powers the station radio down.
    fn station_stop(&mut self);
    fn ap_start(&mut self, ssid: &str, password: &str) -> Result<(), RadioError>;
    fn ap_active(&self) -> bool;
    fn ap_stop(&mut self);
    fn scan(&mut self) -> Result<Vec<String>, RadioError>;
    fn now_ms(&self) -> u64;
    fn sleep_ms(&mut self, ms: u64);
}

pub struct WifiManager<D: WifiDriver> {
    driver: D,
    policy: WifiPolicy,
    ap: ApConfig,
    state: ConnectionState,
}

impl<D: WifiDriver> WifiManager<D> {
    pub fn new(driver: D, policy: WifiPolicy, ap: ApConfig) -> Self {
        Self {
            driver,
            policy,
            ap,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    pub fn ip(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Connected { ip } => Some(ip),
            _ => None,
        }
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Boot path: station connect when credentials exist, access-point
    /// fallback otherwise or on exhaustion. The fallback is the device's
    /// only recovery path when Wi-Fi is misconfigured, so it is never
    /// skipped.
    pub fn connect_or_fallback(&mut self, credentials: Option<&NetworkCredentials>) -> ConnectionState {
        match credentials {
            Some(credentials) => match self.connect_station(&credentials.ssid, &credentials.password) {
                Ok(ip) => {
                    info!("station connected to `{}`, ip {ip}", credentials.ssid);
                    return self.state.clone();
                }
                Err(err) => {
                    warn!("{err}; falling back to access point");
                }
            },
            None => {
                info!("no stored credentials; starting configuration access point");
            }
        }

        if let Err(err) = self.start_access_point() {
            warn!("access point fallback failed: {err}");
        }
        self.state.clone()
    }

    /// Associates as a station, polling the link every `link_poll_ms`
    /// within a `connect_timeout_ms` window, up to `max_retries` attempts
    /// with `retry_delay_ms` between them. Success tears down any active
    /// access point; exhaustion powers the radio down and leaves
    /// `Disconnected`.
    pub fn connect_station(&mut self, ssid: &str, password: &str) -> Result<String, ConnectError> {
        for attempt in 1..=self.policy.max_retries {
            self.state = ConnectionState::Connecting { attempt };
            info!(
                "station connect attempt {attempt}/{} to `{ssid}`",
                self.policy.max_retries
            );

            match self.attempt_association(ssid, password) {
                Ok(Some(ip)) => {
                    self.stop_access_point();
                    self.state = ConnectionState::Connected { ip: ip.clone() };
                    return Ok(ip);
                }
                Ok(None) => warn!("attempt {attempt} timed out waiting for the link"),
                Err(err) => warn!("attempt {attempt} failed: {err}"),
            }

            self.driver.station_disconnect();
            if attempt < self.policy.max_retries {
                self.driver.sleep_ms(self.policy.retry_delay_ms);
            }
        }

        self.driver.station_stop();
        // When the attempt was made from configuration mode the access
        // point stays up, so the UI that triggered it remains reachable.
        self.state = if self.driver.ap_active() {
            ConnectionState::ApMode
        } else {
            ConnectionState::Disconnected
        };
        Err(ConnectError::Exhausted {
            attempts: self.policy.max_retries,
        })
    }

    fn attempt_association(&mut self, ssid: &str, password: &str) -> Result<Option<String>, RadioError> {
        self.driver.station_start()?;
        self.driver.station_connect(ssid, password)?;

        let deadline = self.driver.now_ms().saturating_add(self.policy.connect_timeout_ms);
        loop {
            match self.driver.station_link() {
                LinkStatus::Up(ip) => return Ok(Some(ip)),
                LinkStatus::Failed => return Ok(None),
                LinkStatus::Down | LinkStatus::Joining => {}
            }
            if self.driver.now_ms() >= deadline {
                return Ok(None);
            }
            self.driver.sleep_ms(self.policy.link_poll_ms);
        }
    }

    /// Drops the association and powers the station radio down.
    pub fn disconnect_station(&mut self) {
        self.driver.station_disconnect();
        self.driver.station_stop();
        if !matches!(self.state, ConnectionState::ApMode) {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Forces station disconnect, then brings the access point up with the
    /// fixed configuration identity, retrying on radio-level failures.
    pub fn start_access_point(&mut self) -> Result<(), ApError> {
        self.disconnect_station();

        for attempt in 1..=self.policy.max_retries {
            match self.driver.ap_start(&self.ap.ssid, &self.ap.password) {
                Ok(()) => {
                    info!("access point `{}` started", self.ap.ssid);
                    self.state = ConnectionState::ApMode;
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        "access point start attempt {attempt}/{} failed: {err}",
                        self.policy.max_retries
                    );
                    if attempt < self.policy.max_retries {
                        self.driver.sleep_ms(self.policy.retry_delay_ms);
                    }
                }
            }
        }

        Err(ApError::Exhausted {
            attempts: self.policy.max_retries,
        })
    }

    /// Idempotent: deactivating an inactive access point is a no-op.
    pub fn stop_access_point(&mut self) {
        if self.driver.ap_active() {
            self.driver.ap_stop();
            info!("access point stopped");
        }
        if matches!(self.state, ConnectionState::ApMode) {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Deduplicated, sorted network names. Failures degrade to an empty
    /// list; the radio is powered down afterward when not connected.
    pub fn scan_ssids(&mut self) -> Vec<String> {
        let mut names = match self.driver.scan() {
            Ok(names) => names,
            Err(err) => {
                warn!("ssid scan failed: {err}");
                Vec::new()
            }
        };
        names.sort();
        names.dedup();

        if !self.is_connected() {
            self.driver.station_stop();
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct FakeRadio {
        clock_ms: u64,
        sleeps: Vec<u64>,
        connect_calls: u32,
        /// Attempt number whose link comes up; `None` never links.
        succeed_on_attempt: Option<u32>,
        link_pending: bool,
        station_active: bool,
        station_up: Option<String>,
        station_stops: u32,
        ap_active: bool,
        ap_identity: Option<(String, String)>,
        ap_stop_calls: u32,
        ap_failures_remaining: u32,
        scan_result: Option<Vec<String>>,
    }

    impl WifiDriver for FakeRadio {
        fn station_start(&mut self) -> Result<(), RadioError> {
            self.station_active = true;
            Ok(())
        }

        fn station_connect(&mut self, _ssid: &str, _password: &str) -> Result<(), RadioError> {
            self.connect_calls += 1;
            self.link_pending = self.succeed_on_attempt == Some(self.connect_calls);
            Ok(())
        }

        fn station_link(&mut self) -> LinkStatus {
            if self.link_pending {
                self.station_up = Some("192.168.1.50".to_string());
                LinkStatus::Up("192.168.1.50".to_string())
            } else {
                LinkStatus::Down
            }
        }

        fn station_disconnect(&mut self) {
            self.station_up = None;
        }

        fn station_stop(&mut self) {
            self.station_active = false;
            self.station_stops += 1;
        }

        fn ap_start(&mut self, ssid: &str, password: &str) -> Result<(), RadioError> {
            if self.ap_failures_remaining > 0 {
                self.ap_failures_remaining -= 1;
                return Err(RadioError::Timeout);
            }
            assert!(
                self.station_up.is_none(),
                "access point raised while the station link is up"
            );
            self.ap_active = true;
            self.ap_identity = Some((ssid.to_string(), password.to_string()));
            Ok(())
        }

        fn ap_active(&self) -> bool {
            self.ap_active
        }

        fn ap_stop(&mut self) {
            self.ap_active = false;
            self.ap_stop_calls += 1;
        }

        fn scan(&mut self) -> Result<Vec<String>, RadioError> {
            self.scan_result
                .clone()
                .ok_or(RadioError::Driver("scan unavailable".to_string()))
        }

        fn now_ms(&self) -> u64 {
            self.clock_ms
        }

        fn sleep_ms(&mut self, ms: u64) {
            self.sleeps.push(ms);
            self.clock_ms += ms;
        }
    }

    fn manager(radio: FakeRadio) -> WifiManager<FakeRadio> {
        WifiManager::new(radio, WifiPolicy::default(), ApConfig::default())
    }

    #[test]
    fn connect_succeeds_first_attempt() {
        let mut manager = manager(FakeRadio {
            succeed_on_attempt: Some(1),
            ..FakeRadio::default()
        });

        let ip = manager.connect_station("home", "secret").unwrap();

        assert_eq!(ip, "192.168.1.50");
        assert_eq!(
            manager.state(),
            &ConnectionState::Connected {
                ip: "192.168.1.50".to_string()
            }
        );
    }

    #[test]
    fn connect_retries_then_succeeds() {
        let mut manager = manager(FakeRadio {
            succeed_on_attempt: Some(2),
            ..FakeRadio::default()
        });

        manager.connect_station("home", "secret").unwrap();

        assert_eq!(manager.driver_mut().connect_calls, 2);
        // One inter-attempt delay, at least the configured length.
        let delays: Vec<u64> = manager
            .driver_mut()
            .sleeps
            .iter()
            .copied()
            .filter(|ms| *ms == 2_000)
            .collect();
        assert_eq!(delays.len(), 1);
    }

    #[test]
    fn connect_exhausts_retry_budget() {
        let mut manager = manager(FakeRadio::default());

        let err = manager.connect_station("home", "wrong").unwrap_err();

        assert_eq!(err, ConnectError::Exhausted { attempts: 3 });
        assert_eq!(manager.driver_mut().connect_calls, 3);
        assert_eq!(manager.state(), &ConnectionState::Disconnected);
        // Cleanup powers the radio down.
        assert!(manager.driver_mut().station_stops >= 1);
        assert!(!manager.driver_mut().station_active);
        // Two inter-attempt delays for three attempts.
        let delays = manager
            .driver_mut()
            .sleeps
            .iter()
            .filter(|ms| **ms == 2_000)
            .count();
        assert_eq!(delays, 2);
    }

    #[test]
    fn each_attempt_polls_the_full_window() {
        let mut manager = manager(FakeRadio::default());

        let _ = manager.connect_station("home", "wrong");

        // 15 s window at 500 ms per poll, three attempts, plus two 2 s
        // retry delays.
        let total: u64 = manager.driver_mut().sleeps.iter().sum();
        assert_eq!(total, 3 * 15_000 + 2 * 2_000);
    }

    #[test]
    fn station_success_tears_down_access_point() {
        let mut manager = manager(FakeRadio {
            succeed_on_attempt: Some(1),
            ..FakeRadio::default()
        });
        manager.start_access_point().unwrap();
        assert_eq!(manager.state(), &ConnectionState::ApMode);

        manager.connect_station("home", "secret").unwrap();

        assert!(!manager.driver_mut().ap_active);
        assert!(manager.is_connected());
    }

    #[test]
    fn access_point_forces_station_down_first() {
        let mut manager = manager(FakeRadio {
            succeed_on_attempt: Some(1),
            ..FakeRadio::default()
        });
        manager.connect_station("home", "secret").unwrap();

        manager.start_access_point().unwrap();

        assert_eq!(manager.state(), &ConnectionState::ApMode);
        assert!(manager.driver_mut().station_up.is_none());
    }

    #[test]
    fn access_point_retries_radio_failures() {
        let mut manager = manager(FakeRadio {
            ap_failures_remaining: 2,
            ..FakeRadio::default()
        });

        manager.start_access_point().unwrap();

        assert_eq!(manager.state(), &ConnectionState::ApMode);
        assert_eq!(
            manager
                .driver_mut()
                .sleeps
                .iter()
                .filter(|ms| **ms == 2_000)
                .count(),
            2
        );
    }

    #[test]
    fn access_point_stop_is_idempotent() {
        let mut manager = manager(FakeRadio::default());
        manager.start_access_point().unwrap();

        manager.stop_access_point();
        manager.stop_access_point();

        assert_eq!(manager.driver_mut().ap_stop_calls, 1);
        assert_eq!(manager.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn fresh_boot_without_credentials_enters_ap_mode() {
        let mut manager = manager(FakeRadio::default());

        let state = manager.connect_or_fallback(None);

        assert_eq!(state, ConnectionState::ApMode);
        assert_eq!(
            manager.driver_mut().ap_identity,
            Some(("PicoW-Setup".to_string(), "picow1234".to_string()))
        );
        assert!(manager.driver_mut().station_up.is_none());
        // No station attempt was made.
        assert_eq!(manager.driver_mut().connect_calls, 0);
    }

    #[test]
    fn exhausted_station_falls_back_to_ap_mode() {
        let mut manager = manager(FakeRadio::default());
        let credentials = NetworkCredentials {
            ssid: "home".to_string(),
            password: "wrong".to_string(),
        };

        let state = manager.connect_or_fallback(Some(&credentials));

        assert_eq!(state, ConnectionState::ApMode);
        assert_eq!(manager.driver_mut().connect_calls, 3);
    }

    #[test]
    fn scan_deduplicates_and_sorts() {
        let mut manager = manager(FakeRadio {
            scan_result: Some(vec![
                "zeta".to_string(),
                "alpha".to_string(),
                "zeta".to_string(),
                "mid".to_string(),
            ]),
            ..FakeRadio::default()
        });

        let names = manager.scan_ssids();

        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        // Power-saving: radio dropped when not connected.
        assert!(manager.driver_mut().station_stops >= 1);
    }

    #[test]
    fn scan_failure_degrades_to_empty() {
        let mut manager = manager(FakeRadio::default());

        assert!(manager.scan_ssids().is_empty());
    }
}
