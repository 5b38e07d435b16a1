//! Device identity and metadata.
//!
//! [`DevicePath`] is the registry key: an opaque, OS-assigned interface path,
//! normalised to lowercase because enumeration and hot-plug notifications do
//! not agree on case.
//!
//! [`DeviceInfo`] is a lightweight, cloneable snapshot of what an open
//! populated on a [`HidDevice`](crate::device::HidDevice), suitable for UI
//! display, logging, and persistence.
//!
//! # Conventions
//! - `vid`/`pid`/`version` come from the HID attributes and are zero until the
//!   device has been opened once.
//! - Strings are empty when the device did not answer the string query.
//! - Report lengths include the report ID byte.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Case-normalised OS device interface path.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct DevicePath(String);

impl DevicePath {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for DevicePath {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for DevicePath {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<DevicePath> for String {
    fn from(path: DevicePath) -> Self {
        path.0
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Top-level collection capabilities from the preparsed report descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportCaps {
    /// Longest input report, in bytes, including the report ID.
    pub input_report_len: usize,
    /// Longest output report, in bytes, including the report ID.
    pub output_report_len: usize,
    /// Top-level collection usage page (e.g. `0x01` Generic Desktop).
    pub usage_page: u16,
    /// Top-level collection usage within the page.
    pub usage: u16,
}

/// HID attributes (`HIDD_ATTRIBUTES`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub vendor_id: u16,
    pub product_id: u16,
    pub version: u16,
}

impl Attributes {
    /// Devices reporting a zero vendor or product ID are not usable.
    pub fn is_valid(&self) -> bool {
        self.vendor_id != 0 && self.product_id != 0
    }
}

/// Which descriptive string to query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StringKind {
    Manufacturer,
    Product,
    SerialNumber,
}

/// Snapshot of metadata describing a single device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub path: DevicePath,
    pub vid: u16,
    pub pid: u16,
    pub version: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    pub input_report_len: usize,
    pub output_report_len: usize,
    pub usage_page: u16,
    pub usage: u16,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.product.is_empty() {
            "Unknown"
        } else {
            &self.product
        };
        write!(f, "{name} [{:04x}:{:04x}]", self.vid, self.pid)
    }
}
