//! Runtime configuration.
//!
//! [`HidConfig`] carries the knobs shared by every device a registry creates:
//! the driver-side input ring size, the liveness re-check interval used by
//! overlapped waits, and the initial I/O modes of new devices.
//!
//! Configuration is plain TOML. Every key is optional:
//!
//! ```toml
//! input_buffers = 64
//! wait_interval_ms = 50
//! max_string_len = 256
//!
//! [defaults]
//! read_blocking = false
//! read_continuous = true
//! write_blocking = true
//! ```

use crate::error::{HidError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Initial I/O modes applied to freshly constructed devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IoDefaults {
    pub read_blocking: bool,
    pub read_continuous: bool,
    pub write_blocking: bool,
}

impl Default for IoDefaults {
    fn default() -> Self {
        Self {
            read_blocking: true,
            read_continuous: false,
            write_blocking: true,
        }
    }
}

/// Device and registry configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HidConfig {
    /// Number of input reports the HID class driver buffers between reads.
    pub input_buffers: u32,
    /// Interval at which blocked reads/writes re-check connection and close state.
    pub wait_interval_ms: u64,
    /// Capacity, in UTF-16 code units, used for manufacturer/product/serial queries.
    pub max_string_len: usize,
    pub defaults: IoDefaults,
}

impl Default for HidConfig {
    fn default() -> Self {
        Self {
            input_buffers: 64,
            wait_interval_ms: 50,
            max_string_len: 256,
            defaults: IoDefaults::default(),
        }
    }
}

impl HidConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: HidConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| HidError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Liveness re-check interval as a [`Duration`], never shorter than 1 ms.
    ///
    /// Configs built in code never pass through [`validate`](Self::validate).
    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms.max(1))
    }

    /// Check the values a parsed config is held to.
    pub fn validate(&self) -> Result<()> {
        if self.wait_interval_ms == 0 {
            return Err(HidError::Config("wait_interval_ms must be non-zero".into()));
        }
        if self.input_buffers < 2 {
            // HidD_SetNumInputBuffers rejects anything below two.
            return Err(HidError::Config("input_buffers must be at least 2".into()));
        }
        Ok(())
    }
}
