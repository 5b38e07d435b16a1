//! The path-keyed device registry and hot-plug dispatch.
//!
//! [`HidRegistry`] owns every [`HidDevice`] it has seen. Devices are registered
//! only after a successful open, then closed again; consumers reopen the ones
//! they care about. OS removal never drops an entry, it marks the device
//! removed so a later arrival of the same path revives the same handle.
//!
//! Hot-plug events arrive from the backend's notification context and are
//! forwarded to a single `hid-dispatch` thread, which applies them in order and
//! runs the callbacks. No registry lock is held while a callback runs.

use crate::backends::{HidBackend, HotplugWatch};
use crate::config::HidConfig;
use crate::device::HidDevice;
use crate::error::Result;
use crate::event::HotplugEvent;
use crate::metadata::DevicePath;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Callback invoked with the device that arrived or was removed.
pub type RegistryCallback = Arc<dyn Fn(&Arc<HidDevice>) + Send + Sync>;

enum Dispatch {
    Event(HotplugEvent),
    Stop,
}

struct RegistryShared {
    backend: Arc<dyn HidBackend>,
    config: HidConfig,
    devices: RwLock<BTreeMap<DevicePath, Arc<HidDevice>>>,
    on_arrival: RwLock<Option<RegistryCallback>>,
    on_removal: RwLock<Option<RegistryCallback>>,
}

/// All HID devices present on the host, kept current by hot-plug events.
pub struct HidRegistry {
    shared: Arc<RegistryShared>,
    watch: Mutex<Option<Box<dyn HotplugWatch>>>,
    events: Mutex<Sender<Dispatch>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl HidRegistry {
    /// Subscribe to hot-plug events, start the dispatcher and enumerate.
    ///
    /// Failures here are logged, not returned: without notifications the
    /// registry still serves whatever enumeration found.
    pub fn new(backend: Arc<dyn HidBackend>, config: HidConfig) -> Self {
        let shared = Arc::new(RegistryShared {
            backend,
            config,
            devices: RwLock::new(BTreeMap::new()),
            on_arrival: RwLock::new(None),
            on_removal: RwLock::new(None),
        });

        let (tx, rx) = mpsc::channel();
        let dispatcher = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("hid-dispatch".into())
                .spawn(move || dispatch_loop(shared, rx))
        };
        let dispatcher = match dispatcher {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "failed to start hot-plug dispatcher");
                None
            }
        };

        let watch = if dispatcher.is_some() {
            let sink_tx = Mutex::new(tx.clone());
            let sink = Box::new(move |event: HotplugEvent| {
                if sink_tx.lock().send(Dispatch::Event(event)).is_err() {
                    debug!("hot-plug event after dispatcher shutdown");
                }
            });
            match shared.backend.watch(sink) {
                Ok(watch) => Some(watch),
                Err(e) => {
                    error!(error = %e, "hot-plug notifications unavailable");
                    None
                }
            }
        } else {
            None
        };

        let registry = Self {
            shared,
            watch: Mutex::new(watch),
            events: Mutex::new(tx),
            dispatcher,
        };
        if let Err(e) = registry.enumerate() {
            error!(error = %e, "initial enumeration failed");
        }
        registry
    }

    /// Registry over the platform backend.
    #[cfg(all(feature = "hid", target_os = "windows"))]
    pub fn system(config: HidConfig) -> Self {
        Self::new(crate::backends::system_backend(), config)
    }

    /// Register every present device not already known.
    ///
    /// Known paths are marked connected. New paths are opened to read their
    /// metadata, registered, and closed; ones that fail to open are skipped.
    /// Returns the number of newly registered devices.
    pub fn enumerate(&self) -> Result<usize> {
        let paths = self.shared.backend.enumerate()?;
        let found = paths.len();
        let mut added = 0;
        for path in paths {
            if let Some(existing) = self.shared.lookup(&path) {
                existing.connected();
                continue;
            }
            if self.shared.admit(path).is_some() {
                added += 1;
            }
        }
        info!(found, added, total = self.len(), "enumerated HID devices");
        Ok(added)
    }

    /// First registered device with this vendor and product ID.
    pub fn get_hid_device(&self, vid: u16, pid: u16) -> Option<Arc<HidDevice>> {
        self.shared
            .devices
            .read()
            .values()
            .find(|d| d.vid() == vid && d.pid() == pid)
            .cloned()
    }

    /// Device registered under `path`, compared case-insensitively.
    pub fn get_hid_device_by_path(&self, path: &str) -> Option<Arc<HidDevice>> {
        self.shared.lookup(&DevicePath::new(path))
    }

    pub fn devices(&self) -> Vec<Arc<HidDevice>> {
        self.shared.devices.read().values().cloned().collect()
    }

    pub fn paths(&self) -> Vec<DevicePath> {
        self.shared.devices.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.devices.read().is_empty()
    }

    pub fn set_arrival_callback(&self, cb: Option<RegistryCallback>) {
        *self.shared.on_arrival.write() = cb;
    }

    pub fn set_removal_callback(&self, cb: Option<RegistryCallback>) {
        *self.shared.on_removal.write() = cb;
    }

    /// Apply one hot-plug event on the calling thread.
    pub fn dispatch(&self, event: HotplugEvent) {
        self.shared.apply(event);
    }

    /// Whether hot-plug notifications are being received.
    pub fn is_watching(&self) -> bool {
        self.dispatcher.is_some()
            && self
                .watch
                .lock()
                .as_ref()
                .is_some_and(|watch| watch.is_active())
    }
}

impl RegistryShared {
    fn lookup(&self, path: &DevicePath) -> Option<Arc<HidDevice>> {
        self.devices.read().get(path).cloned()
    }

    /// Open a new device and register it if the open succeeds.
    fn admit(&self, path: DevicePath) -> Option<Arc<HidDevice>> {
        let device = HidDevice::new(path.clone(), self.backend.clone(), self.config.clone());
        if let Err(e) = device.open() {
            warn!(path = %path, error = %e, "discarding device that failed to open");
            return None;
        }
        let _ = device.close();

        let mut devices = self.devices.write();
        if let Some(existing) = devices.get(&path) {
            // Registered concurrently by enumeration or dispatch.
            return Some(existing.clone());
        }
        devices.insert(path, device.clone());
        Some(device)
    }

    fn apply(&self, event: HotplugEvent) {
        match event {
            HotplugEvent::Arrived(raw) => {
                let path = DevicePath::new(raw.as_str());
                let device = match self.lookup(&path) {
                    Some(existing) => {
                        existing.connected();
                        debug!(path = %path, "known device reconnected");
                        existing
                    }
                    None => match self.admit(path) {
                        Some(device) => device,
                        None => return,
                    },
                };
                info!(device = %device.info(), "HID device arrived");
                let cb = self.on_arrival.read().clone();
                if let Some(cb) = cb {
                    cb(&device);
                }
            }
            HotplugEvent::Removed(raw) => {
                let path = DevicePath::new(raw.as_str());
                let Some(device) = self.lookup(&path) else {
                    debug!(path = %path, "removal of unregistered device ignored");
                    return;
                };
                device.removed();
                info!(device = %device.info(), "HID device removed");
                if let Some(cb) = device.callback_removal() {
                    cb(&device);
                }
                let cb = self.on_removal.read().clone();
                if let Some(cb) = cb {
                    cb(&device);
                }
            }
        }
    }
}

fn dispatch_loop(shared: Arc<RegistryShared>, rx: Receiver<Dispatch>) {
    while let Ok(Dispatch::Event(event)) = rx.recv() {
        shared.apply(event);
    }
    debug!("hot-plug dispatcher stopped");
}

impl std::fmt::Debug for HidRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HidRegistry")
            .field("devices", &self.paths())
            .field("watching", &self.is_watching())
            .finish()
    }
}

impl Drop for HidRegistry {
    fn drop(&mut self) {
        self.watch.get_mut().take();
        let _ = self.events.get_mut().send(Dispatch::Stop);
        if let Some(handle) = self.dispatcher.take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("hot-plug dispatcher panicked");
            }
        }
        let devices = std::mem::take(&mut *self.shared.devices.write());
        for device in devices.into_values() {
            device.removed();
        }
    }
}
