//! Hot-plug events and the per-device state machine.
//!
//! Backends report interface arrivals and removals as [`HotplugEvent`]s. The
//! path an event carries is a [`DevicePath`], already lowercased on
//! construction, so it compares equal to the registry key for the same
//! interface however the OS cased it.

use crate::metadata::DevicePath;

/// A HID device interface appeared or disappeared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HotplugEvent {
    /// `DBT_DEVICEARRIVAL` for the HID interface class.
    Arrived(DevicePath),
    /// `DBT_DEVICEREMOVECOMPLETE` for the HID interface class.
    Removed(DevicePath),
}

impl HotplugEvent {
    pub fn path(&self) -> &DevicePath {
        match self {
            HotplugEvent::Arrived(p) | HotplugEvent::Removed(p) => p,
        }
    }
}

/// Where a device is in its lifecycle.
///
/// ```text
/// Unopened ──open──▶ OpenIdle ◀──▶ OpenReading / OpenWriting
///                       │
///            close ─────┼───── removed
///                       ▼              ▼
///                    Closed         Removed ──connected──▶ Unopened
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// Never opened, or reconnected after a removal.
    Unopened,
    /// Open with no background task running.
    OpenIdle,
    /// Open with a background read task running.
    OpenReading,
    /// Open with a write in flight (and no background read).
    OpenWriting,
    /// Opened at least once and closed since.
    Closed,
    /// The OS reported the device gone.
    Removed,
}

impl DeviceState {
    pub fn is_open(self) -> bool {
        matches!(
            self,
            DeviceState::OpenIdle | DeviceState::OpenReading | DeviceState::OpenWriting
        )
    }
}
