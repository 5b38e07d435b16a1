//! In-memory HID backend.
//!
//! [`VirtualBackend`] hosts scriptable [`VirtualDevice`]s that behave like
//! overlapped HID handles: reads pend until a report is pushed, writes take a
//! configurable amount of time to complete, and unplugging a device fails any
//! in-flight request with [`HidError::Disconnected`]. Hot-plug events are
//! delivered to every active watcher synchronously on the caller's thread.
//!
//! Devices may be added under mixed-case paths; like the OS, the bus treats
//! paths case-insensitively.
//!
//! ```
//! use hidhost::backends::virtual_hid::{VirtualBackend, VirtualDeviceSpec};
//! use hidhost::{HidConfig, HidDevice};
//! use std::sync::Arc;
//!
//! let backend = VirtualBackend::new();
//! let dev = backend.add(VirtualDeviceSpec::new(r"\\?\HID#VID_1209&PID_0001", 0x1209, 0x0001).reports(9, 25));
//! let device = HidDevice::new(r"\\?\HID#VID_1209&PID_0001", Arc::new(backend.clone()), HidConfig::default());
//! device.open().unwrap();
//! dev.push_report(vec![1; 9]);
//! device.read().unwrap();
//! assert_eq!(device.read_buffer().unwrap(), vec![1; 9]);
//! ```

use crate::backends::{
    Completion, HidBackend, HidTransport, HotplugSink, HotplugWatch, PendingIo,
};
use crate::error::{HidError, Result};
use crate::event::HotplugEvent;
use crate::metadata::{Attributes, DevicePath, ReportCaps, StringKind};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Static description of a simulated device.
#[derive(Clone, Debug)]
pub struct VirtualDeviceSpec {
    pub path: String,
    pub attributes: Attributes,
    pub caps: ReportCaps,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    /// Make the capability query fail.
    pub broken_descriptor: bool,
}

impl VirtualDeviceSpec {
    /// A device with 64-byte input and output reports.
    pub fn new(path: impl Into<String>, vid: u16, pid: u16) -> Self {
        Self {
            path: path.into(),
            attributes: Attributes {
                vendor_id: vid,
                product_id: pid,
                version: 0x0100,
            },
            caps: ReportCaps {
                input_report_len: 64,
                output_report_len: 64,
                usage_page: 0xFF00,
                usage: 0x01,
            },
            manufacturer: None,
            product: None,
            serial_number: None,
            broken_descriptor: false,
        }
    }

    pub fn reports(mut self, input_len: usize, output_len: usize) -> Self {
        self.caps.input_report_len = input_len;
        self.caps.output_report_len = output_len;
        self
    }

    pub fn usage(mut self, usage_page: u16, usage: u16) -> Self {
        self.caps.usage_page = usage_page;
        self.caps.usage = usage;
        self
    }

    pub fn version(mut self, version: u16) -> Self {
        self.attributes.version = version;
        self
    }

    pub fn strings(mut self, manufacturer: &str, product: &str, serial: &str) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self.product = Some(product.into());
        self.serial_number = Some(serial.into());
        self
    }

    pub fn broken_descriptor(mut self) -> Self {
        self.broken_descriptor = true;
        self
    }
}

/// A simulated device and its observable I/O history.
pub struct VirtualDevice {
    spec: VirtualDeviceSpec,
    plugged: AtomicBool,
    reports: Mutex<VecDeque<Vec<u8>>>,
    report_ready: Condvar,
    empty_reads: AtomicUsize,
    written: Mutex<Vec<Vec<u8>>>,
    write_latency: Mutex<Duration>,
    open_handles: AtomicUsize,
    input_buffers: AtomicU64,
    reads_submitted: AtomicUsize,
    writes_in_flight: AtomicUsize,
    peak_writes_in_flight: AtomicUsize,
}

impl VirtualDevice {
    fn new(spec: VirtualDeviceSpec) -> Self {
        Self {
            spec,
            plugged: AtomicBool::new(true),
            reports: Mutex::new(VecDeque::new()),
            report_ready: Condvar::new(),
            empty_reads: AtomicUsize::new(0),
            written: Mutex::new(Vec::new()),
            write_latency: Mutex::new(Duration::ZERO),
            open_handles: AtomicUsize::new(0),
            input_buffers: AtomicU64::new(0),
            reads_submitted: AtomicUsize::new(0),
            writes_in_flight: AtomicUsize::new(0),
            peak_writes_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn spec(&self) -> &VirtualDeviceSpec {
        &self.spec
    }

    pub fn path(&self) -> DevicePath {
        DevicePath::new(&self.spec.path)
    }

    pub fn is_plugged(&self) -> bool {
        self.plugged.load(Ordering::SeqCst)
    }

    /// Queue an input report; the oldest pending read receives it.
    pub fn push_report(&self, report: Vec<u8>) {
        self.reports.lock().push_back(report);
        self.report_ready.notify_all();
    }

    /// Make the next `count` completed reads transfer zero bytes.
    pub fn fail_reads(&self, count: usize) {
        self.empty_reads.fetch_add(count, Ordering::SeqCst);
    }

    /// Time each write takes between submission and completion.
    pub fn set_write_latency(&self, latency: Duration) {
        *self.write_latency.lock() = latency;
    }

    /// Reports written so far, in completion order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    /// Handles currently open against this device.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Input ring size requested by the last open.
    pub fn input_buffers(&self) -> u64 {
        self.input_buffers.load(Ordering::SeqCst)
    }

    pub fn reads_submitted(&self) -> usize {
        self.reads_submitted.load(Ordering::SeqCst)
    }

    /// Highest number of writes that were ever in flight at once.
    pub fn peak_writes_in_flight(&self) -> usize {
        self.peak_writes_in_flight.load(Ordering::SeqCst)
    }

    fn set_plugged(&self, plugged: bool) {
        self.plugged.store(plugged, Ordering::SeqCst);
        // Wake pending reads so they notice.
        let _queue = self.reports.lock();
        self.report_ready.notify_all();
    }
}

#[derive(Default)]
struct Shared {
    devices: Mutex<BTreeMap<DevicePath, Arc<VirtualDevice>>>,
    sinks: Mutex<Vec<(u64, Arc<HotplugSink>)>>,
    next_sink: AtomicU64,
    fail_enumeration: AtomicBool,
    fail_watch: AtomicBool,
}

/// In-memory backend. Cloning yields another handle to the same simulated bus.
#[derive(Clone, Default)]
pub struct VirtualBackend {
    shared: Arc<Shared>,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device silently (as if present before anyone listened).
    pub fn add(&self, spec: VirtualDeviceSpec) -> Arc<VirtualDevice> {
        let device = Arc::new(VirtualDevice::new(spec));
        self.shared
            .devices
            .lock()
            .insert(device.path(), device.clone());
        device
    }

    /// Attach a device and announce it with the path exactly as specified.
    pub fn plug(&self, spec: VirtualDeviceSpec) -> Arc<VirtualDevice> {
        let raw = spec.path.clone();
        let device = self.add(spec);
        self.notify(HotplugEvent::Arrived(DevicePath::new(raw)));
        device
    }

    /// Re-attach a previously unplugged device.
    pub fn replug(&self, path: &str) -> Option<Arc<VirtualDevice>> {
        let device = self.device(path)?;
        device.set_plugged(true);
        self.notify(HotplugEvent::Arrived(DevicePath::new(path)));
        Some(device)
    }

    /// Detach a device: in-flight I/O fails and a removal is announced.
    pub fn unplug(&self, path: &str) -> Option<Arc<VirtualDevice>> {
        let device = self.device(path)?;
        device.set_plugged(false);
        self.notify(HotplugEvent::Removed(DevicePath::new(path)));
        Some(device)
    }

    pub fn device(&self, path: &str) -> Option<Arc<VirtualDevice>> {
        self.shared.devices.lock().get(&DevicePath::new(path)).cloned()
    }

    /// Deliver a raw event to every watcher.
    pub fn notify(&self, event: HotplugEvent) {
        let sinks: Vec<_> = self
            .shared
            .sinks
            .lock()
            .iter()
            .map(|(_, s)| s.clone())
            .collect();
        for sink in sinks {
            sink(event.clone());
        }
    }

    pub fn watchers(&self) -> usize {
        self.shared.sinks.lock().len()
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.shared.fail_enumeration.store(fail, Ordering::SeqCst);
    }

    pub fn fail_watch(&self, fail: bool) {
        self.shared.fail_watch.store(fail, Ordering::SeqCst);
    }
}

impl HidBackend for VirtualBackend {
    fn enumerate(&self) -> Result<Vec<DevicePath>> {
        if self.shared.fail_enumeration.load(Ordering::SeqCst) {
            return Err(HidError::Io(std::io::Error::other(
                "device information set unavailable",
            )));
        }
        Ok(self
            .shared
            .devices
            .lock()
            .values()
            .filter(|d| d.is_plugged())
            .map(|d| d.path())
            .collect())
    }

    fn open(&self, path: &DevicePath) -> Result<Box<dyn HidTransport>> {
        let device = self
            .shared
            .devices
            .lock()
            .get(path)
            .filter(|d| d.is_plugged())
            .cloned()
            .ok_or_else(|| HidError::Open {
                path: path.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })?;
        device.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(VirtualTransport { device }))
    }

    fn watch(&self, sink: HotplugSink) -> Result<Box<dyn HotplugWatch>> {
        if self.shared.fail_watch.load(Ordering::SeqCst) {
            return Err(HidError::Notification("virtual bus refused watcher".into()));
        }
        let id = self.shared.next_sink.fetch_add(1, Ordering::SeqCst);
        self.shared.sinks.lock().push((id, Arc::new(sink)));
        Ok(Box::new(VirtualWatch {
            shared: Arc::downgrade(&self.shared),
            id,
        }))
    }
}

struct VirtualWatch {
    shared: Weak<Shared>,
    id: u64,
}

impl HotplugWatch for VirtualWatch {
    fn is_active(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

impl Drop for VirtualWatch {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.sinks.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

struct VirtualTransport {
    device: Arc<VirtualDevice>,
}

impl Drop for VirtualTransport {
    fn drop(&mut self) {
        self.device.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl VirtualTransport {
    fn ensure_plugged(&self) -> Result<()> {
        if self.device.is_plugged() {
            Ok(())
        } else {
            Err(HidError::Disconnected)
        }
    }
}

impl HidTransport for VirtualTransport {
    fn set_input_buffers(&self, count: u32) -> Result<()> {
        self.ensure_plugged()?;
        self.device
            .input_buffers
            .store(u64::from(count), Ordering::SeqCst);
        Ok(())
    }

    fn caps(&self) -> Result<ReportCaps> {
        self.ensure_plugged()?;
        if self.device.spec.broken_descriptor {
            return Err(HidError::Capabilities("preparsed data unavailable".into()));
        }
        Ok(self.device.spec.caps)
    }

    fn attributes(&self) -> Result<Attributes> {
        self.ensure_plugged()?;
        Ok(self.device.spec.attributes)
    }

    fn string(&self, kind: StringKind, max_len: usize) -> Option<String> {
        let spec = &self.device.spec;
        let s = match kind {
            StringKind::Manufacturer => spec.manufacturer.as_ref(),
            StringKind::Product => spec.product.as_ref(),
            StringKind::SerialNumber => spec.serial_number.as_ref(),
        }?;
        // Mirror the OS: the answer is cut to the caller's buffer, NUL included.
        Some(s.chars().take(max_len.saturating_sub(1)).collect())
    }

    fn submit_read(&self, len: usize) -> Result<Box<dyn PendingIo>> {
        self.ensure_plugged()?;
        self.device.reads_submitted.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(VirtualRead {
            device: self.device.clone(),
            buf: vec![0; len],
            done: None,
        }))
    }

    fn submit_write(&self, report: Vec<u8>) -> Result<Box<dyn PendingIo>> {
        self.ensure_plugged()?;
        let in_flight = self.device.writes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.device
            .peak_writes_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        let latency = *self.device.write_latency.lock();
        Ok(Box::new(VirtualWrite {
            device: self.device.clone(),
            report,
            ready_at: Instant::now() + latency,
            done: false,
        }))
    }
}

struct VirtualRead {
    device: Arc<VirtualDevice>,
    buf: Vec<u8>,
    done: Option<usize>,
}

impl PendingIo for VirtualRead {
    fn wait(&mut self, timeout: Duration) -> Result<Completion> {
        if let Some(n) = self.done {
            return Ok(Completion::Done(n));
        }
        let mut queue = self.device.reports.lock();
        if queue.is_empty() && self.device.is_plugged() {
            self.device.report_ready.wait_for(&mut queue, timeout);
        }
        if !self.device.is_plugged() {
            return Err(HidError::Disconnected);
        }
        let Some(report) = queue.pop_front() else {
            return Ok(Completion::Pending);
        };
        drop(queue);

        let empty = self
            .device
            .empty_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let n = if empty {
            0
        } else {
            let n = report.len().min(self.buf.len());
            self.buf[..n].copy_from_slice(&report[..n]);
            n
        };
        self.done = Some(n);
        Ok(Completion::Done(n))
    }

    fn buffer(&self) -> &[u8] {
        &self.buf
    }
}

struct VirtualWrite {
    device: Arc<VirtualDevice>,
    report: Vec<u8>,
    ready_at: Instant,
    done: bool,
}

impl VirtualWrite {
    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            self.device.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl PendingIo for VirtualWrite {
    fn wait(&mut self, timeout: Duration) -> Result<Completion> {
        if self.done {
            return Ok(Completion::Done(self.report.len()));
        }
        let now = Instant::now();
        if now < self.ready_at {
            std::thread::sleep(timeout.min(self.ready_at - now));
        }
        if !self.device.is_plugged() {
            self.finish();
            return Err(HidError::Disconnected);
        }
        if Instant::now() < self.ready_at {
            return Ok(Completion::Pending);
        }
        self.device.written.lock().push(self.report.clone());
        self.finish();
        Ok(Completion::Done(self.report.len()))
    }

    fn buffer(&self) -> &[u8] {
        &self.report
    }
}

impl Drop for VirtualWrite {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_skips_unplugged_devices() {
        let bus = VirtualBackend::new();
        bus.add(VirtualDeviceSpec::new("a", 1, 1));
        bus.add(VirtualDeviceSpec::new("b", 1, 2));
        bus.unplug("b");
        assert_eq!(bus.enumerate().unwrap(), vec![DevicePath::new("a")]);
        assert!(bus.open(&DevicePath::new("b")).is_err());
    }

    #[test]
    fn read_pends_until_a_report_arrives() {
        let bus = VirtualBackend::new();
        let dev = bus.add(VirtualDeviceSpec::new("a", 1, 1).reports(4, 4));
        let transport = bus.open(&DevicePath::new("a")).unwrap();
        let mut read = transport.submit_read(4).unwrap();
        assert_eq!(read.wait(Duration::from_millis(5)).unwrap(), Completion::Pending);
        dev.push_report(vec![1, 2, 3, 4]);
        assert_eq!(read.wait(Duration::from_millis(5)).unwrap(), Completion::Done(4));
        assert_eq!(read.buffer(), &[1, 2, 3, 4]);
    }

    #[test]
    fn unplug_fails_pending_read() {
        let bus = VirtualBackend::new();
        bus.add(VirtualDeviceSpec::new("a", 1, 1));
        let transport = bus.open(&DevicePath::new("a")).unwrap();
        let mut read = transport.submit_read(64).unwrap();
        bus.unplug("a");
        assert!(matches!(
            read.wait(Duration::from_millis(5)),
            Err(HidError::Disconnected)
        ));
    }

    #[test]
    fn handles_are_counted_and_released() {
        let bus = VirtualBackend::new();
        let dev = bus.add(VirtualDeviceSpec::new("a", 1, 1));
        let t1 = bus.open(&DevicePath::new("A")).unwrap();
        let t2 = bus.open(&DevicePath::new("a")).unwrap();
        assert_eq!(dev.open_handles(), 2);
        drop(t1);
        drop(t2);
        assert_eq!(dev.open_handles(), 0);
    }

    #[test]
    fn dropped_watch_stops_delivery() {
        let bus = VirtualBackend::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let watch = bus
            .watch(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        bus.plug(VirtualDeviceSpec::new("a", 1, 1));
        drop(watch);
        bus.unplug("a");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.watchers(), 0);
    }
}
