//! Windows HID backend.
//!
//! - **discovery**: HID interface enumeration via SetupAPI
//! - **transport**: overlapped `ReadFile`/`WriteFile` on a shared handle, plus
//!   `HidD_*`/`HidP_*` metadata queries
//! - **notify**: `WM_DEVICECHANGE` on a message-only window for hot-plug
//!
//! Most users should not interact with these modules directly. Prefer
//! [`HidRegistry::system`](crate::registry::HidRegistry::system).

pub mod discovery;
pub mod notify;
pub mod transport;

use crate::backends::{HidBackend, HidTransport, HotplugSink, HotplugWatch};
use crate::error::Result;
use crate::metadata::DevicePath;

pub use notify::NotificationWindow;
pub use transport::WinHidTransport;

/// The native Windows backend.
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowsBackend;

impl WindowsBackend {
    pub fn new() -> Self {
        Self
    }
}

impl HidBackend for WindowsBackend {
    fn enumerate(&self) -> Result<Vec<DevicePath>> {
        discovery::interface_paths()
    }

    fn open(&self, path: &DevicePath) -> Result<Box<dyn HidTransport>> {
        Ok(Box::new(WinHidTransport::open(path)?))
    }

    fn watch(&self, sink: HotplugSink) -> Result<Box<dyn HotplugWatch>> {
        Ok(Box::new(NotificationWindow::spawn(sink)?))
    }
}
