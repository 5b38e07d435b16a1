//! Platform backends for `hidhost`.
//!
//! A backend is the thin OS layer underneath [`HidDevice`](crate::device::HidDevice)
//! and [`HidRegistry`](crate::registry::HidRegistry). It knows how to list HID
//! interface paths, open one of them for overlapped I/O, and report hot-plug
//! events. Everything stateful (open/close lifecycle, background tasks,
//! callbacks, the path-keyed registry) lives above this seam.
//!
//! # Feature flags
//! - **`hid`**: enables the Windows backend (`CreateFileW` + `HidD_*`/`HidP_*`,
//!   SetupAPI enumeration, `WM_DEVICECHANGE` notifications).
//! - **`virtual`**: enables [`virtual_hid`], an in-memory backend with
//!   scriptable devices, used by the test-suite and by hosts without hardware.

use crate::error::Result;
use crate::event::HotplugEvent;
use crate::metadata::{Attributes, DevicePath, ReportCaps, StringKind};
use std::time::Duration;

#[cfg(all(feature = "hid", target_os = "windows"))]
#[cfg_attr(docsrs, doc(cfg(all(feature = "hid", target_os = "windows"))))]
pub mod windows;

#[cfg(feature = "virtual")]
#[cfg_attr(docsrs, doc(cfg(feature = "virtual")))]
pub mod virtual_hid;

/// Receives hot-plug events from a backend's notification context.
pub type HotplugSink = Box<dyn Fn(HotplugEvent) + Send + Sync>;

/// Outcome of one bounded wait on an overlapped request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Still in flight after the wait interval.
    Pending,
    /// Finished, having transferred this many bytes.
    Done(usize),
}

/// One in-flight overlapped read or write.
///
/// Each request owns its own wait primitive and its own buffer, so a read and
/// a write on the same device never share completion state. Dropping a
/// request that has not completed cancels it and waits for the cancellation
/// to land before the buffer is released.
pub trait PendingIo: Send {
    /// Wait at most `timeout` for the request to finish.
    fn wait(&mut self, timeout: Duration) -> Result<Completion>;

    /// The request's buffer. For reads this holds the report once
    /// [`Completion::Done`] has been returned.
    fn buffer(&self) -> &[u8];
}

/// An opened OS handle to one HID interface.
pub trait HidTransport: Send + Sync {
    /// Size the driver-side input report ring buffer.
    fn set_input_buffers(&self, count: u32) -> Result<()>;

    /// Report lengths and top-level usage from the preparsed descriptor.
    fn caps(&self) -> Result<ReportCaps>;

    /// Vendor ID, product ID and version number.
    fn attributes(&self) -> Result<Attributes>;

    /// Best-effort descriptive string; `None` when the device does not answer.
    fn string(&self, kind: StringKind, max_len: usize) -> Option<String>;

    /// Issue an overlapped read of `len` bytes.
    fn submit_read(&self, len: usize) -> Result<Box<dyn PendingIo>>;

    /// Issue an overlapped write of `report`. The request owns the bytes.
    fn submit_write(&self, report: Vec<u8>) -> Result<Box<dyn PendingIo>>;
}

/// Active hot-plug subscription. Dropping it unsubscribes.
pub trait HotplugWatch: Send {
    fn is_active(&self) -> bool;
}

/// Entry point into a platform.
pub trait HidBackend: Send + Sync {
    /// Paths of every HID interface currently present.
    fn enumerate(&self) -> Result<Vec<DevicePath>>;

    /// Open `path` for shared read/write overlapped I/O.
    fn open(&self, path: &DevicePath) -> Result<Box<dyn HidTransport>>;

    /// Start delivering HID interface arrivals/removals to `sink`.
    fn watch(&self, sink: HotplugSink) -> Result<Box<dyn HotplugWatch>>;
}

/// The backend for the host platform.
#[cfg(all(feature = "hid", target_os = "windows"))]
pub fn system_backend() -> std::sync::Arc<dyn HidBackend> {
    std::sync::Arc::new(windows::WindowsBackend::new())
}
