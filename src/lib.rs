//! Host-side USB HID device management.
//!
//! Opens HID devices for overlapped report I/O, runs background read and
//! write tasks with completion callbacks, and keeps a path-keyed registry of
//! every HID device on the system current through hot-plug notifications.
//!
//! ```no_run
//! # #[cfg(all(feature = "hid", windows))]
//! # fn main() -> hidhost::Result<()> {
//! use hidhost::{HidConfig, HidDevice, HidRegistry};
//! use std::sync::Arc;
//!
//! let registry = HidRegistry::system(HidConfig::default());
//! registry.set_arrival_callback(Some(Arc::new(|dev: &Arc<HidDevice>| {
//!     println!("arrived: {}", dev.info());
//! })));
//!
//! if let Some(pad) = registry.get_hid_device(0x1209, 0x0001) {
//!     pad.open()?;
//!     pad.read()?;
//!     println!("{:02x?}", pad.read_buffer());
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(all(feature = "hid", windows)))]
//! # fn main() {}
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod backends;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod metadata;
pub mod registry;

pub use config::{HidConfig, IoDefaults};
pub use device::{DeviceCallback, HidDevice};
pub use error::{HidError, Result};
pub use event::{DeviceState, HotplugEvent};
pub use metadata::{DeviceInfo, DevicePath};
pub use registry::{HidRegistry, RegistryCallback};
