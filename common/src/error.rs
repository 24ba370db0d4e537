use thiserror::Error;

/// Driver-level radio failure. The connection manager retries these up to
/// its attempt budget; callers never see them directly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("radio operation timed out")]
    Timeout,
    #[error("association refused")]
    Refused,
    #[error("radio busy")]
    Busy,
    #[error("radio driver error: {0}")]
    Driver(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("station connect failed after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ApError {
    #[error("access point failed to start after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    #[error("station link is down")]
    Offline,
    #[error("manifest fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("malformed manifest: {0}")]
    Manifest(String),
}

/// Local record read/write failure. Missing or corrupt records are treated
/// as absent by the stores themselves; this surfaces only on writes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallError {
    #[error("failed to record installed version: {0}")]
    Version(#[from] PersistError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("not connected to broker")]
    NotConnected,
    #[error("authentication rejected")]
    Auth,
}
