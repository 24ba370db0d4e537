use crate::{config::NetworkCredentials, error::PersistError, update::FirmwareVersion};
use serde::{Deserialize, Serialize};

/// Conventional record names. The host store uses these literally as file
/// names under its data directory; the esp store maps them to NVS keys.
pub const WIFI_CONFIG_FILE: &str = "wifi_config.json";
pub const VERSION_FILE: &str = "version.json";
pub const UPDATE_MARKER_FILE: &str = "to_be_updated.txt";
pub const NO_AUTO_RUN_FILE: &str = "no_auto_run.txt";

/// Presence-only persistent flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Request an update attempt on the next boot.
    UpdateRequested,
    /// Suppress auto-start of the background producers.
    NoAutoRun,
}

impl Marker {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::UpdateRequested => UPDATE_MARKER_FILE,
            Self::NoAutoRun => NO_AUTO_RUN_FILE,
        }
    }
}

/// On-record shape of `version.json`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: FirmwareVersion,
}

pub trait ConfigStore {
    /// Missing or corrupt credentials read as absent, never an error.
    fn load_credentials(&self) -> Option<NetworkCredentials>;
    fn save_credentials(&mut self, credentials: &NetworkCredentials) -> Result<(), PersistError>;
    fn marker_present(&self, marker: Marker) -> bool;
    fn set_marker(&mut self, marker: Marker) -> Result<(), PersistError>;
    /// Clearing an absent marker is a no-op.
    fn clear_marker(&mut self, marker: Marker) -> Result<(), PersistError>;
}

/// Durable state the update coordinator drives. Separate from
/// [`ConfigStore`] so the coordinator depends only on what it touches;
/// concrete stores implement both.
pub trait UpdateStore {
    fn installed_version(&self) -> Option<FirmwareVersion>;
    fn record_version(&mut self, version: FirmwareVersion) -> Result<(), PersistError>;
    /// Creates missing parent directories.
    fn write_update_file(&mut self, path: &str, contents: &str) -> Result<(), PersistError>;
    fn update_requested(&self) -> bool;
    fn clear_update_request(&mut self) -> Result<(), PersistError>;
}
