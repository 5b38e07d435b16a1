//! Error type shared by devices, the registry and backends.

use thiserror::Error;

/// Errors surfaced by [`HidDevice`](crate::device::HidDevice),
/// [`HidRegistry`](crate::registry::HidRegistry) and backend implementations.
#[derive(Error, Debug)]
pub enum HidError {
    /// The device was constructed without a path.
    #[error("device has no path")]
    EmptyPath,

    /// The OS refused to open a handle for the path.
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A synchronisation object for overlapped I/O could not be created.
    #[error("failed to create wait event: {0}")]
    Event(#[source] std::io::Error),

    /// Report-descriptor capabilities could not be retrieved.
    #[error("capability query failed: {0}")]
    Capabilities(String),

    /// The device reported a zero vendor or product ID.
    #[error("invalid device (vid=0x{vid:04x} pid=0x{pid:04x})")]
    InvalidDevice { vid: u16, pid: u16 },

    /// The operation needs an open device.
    #[error("device is not open")]
    NotOpen,

    /// A write was issued with an empty report.
    #[error("empty report buffer")]
    EmptyBuffer,

    /// An overlapped transfer completed without moving any bytes.
    #[error("transfer completed with zero bytes")]
    EmptyTransfer,

    /// The device went away while I/O was in flight.
    #[error("device disconnected")]
    Disconnected,

    /// The device was closed while I/O was in flight.
    #[error("device is closing")]
    Closing,

    /// Hot-plug notifications could not be set up.
    #[error("notification setup failed: {0}")]
    Notification(String),

    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// Any other OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HidError {
    /// `true` for failures that end a device's I/O for good (as opposed to a
    /// transfer that can simply be retried).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HidError::Disconnected | HidError::Closing | HidError::NotOpen
        )
    }
}

impl From<toml::de::Error> for HidError {
    fn from(e: toml::de::Error) -> Self {
        HidError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HidError>;
