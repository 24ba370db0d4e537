pub mod actuator;
pub mod config;
pub mod error;
pub mod hub;
pub mod light;
pub mod motion;
pub mod publish;
pub mod store;
pub mod topics;
pub mod update;
pub mod wifi;

pub use actuator::{AnimationSlot, ColorSource, FadeHandle, ToggleOutcome};
pub use config::{ApConfig, HubConfig, MqttConfig, NetworkCredentials, NodeConfig, UpdateConfig, WifiPolicy};
pub use error::{ApError, CheckError, ConnectError, FetchError, InstallError, PersistError, PublishError, RadioError};
pub use motion::{MotionAction, MotionGate};
pub use publish::{PublishClient, PublishTransport};
pub use store::{ConfigStore, Marker, UpdateStore};
pub use topics::*;
pub use update::{Availability, FirmwareVersion, UpdateCoordinator, UpdateFetcher, UpdateManifest, UpdateOutcome};
pub use wifi::{ConnectionState, LinkStatus, WifiDriver, WifiManager};
