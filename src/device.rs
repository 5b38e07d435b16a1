//! A single HID device and its overlapped I/O.
//!
//! [`HidDevice`] owns one transport handle, the read buffer sized to the
//! device's input report, and at most one background read task and one
//! background write task. It is always held through an `Arc`; the registry
//! keeps one and hands clones to consumers.
//!
//! # I/O modes
//! - **Blocking read** issues one overlapped read and waits for it on the
//!   caller's thread. The wait wakes every `wait_interval` to re-check whether
//!   the device was closed or removed; it is not a read timeout.
//! - **Non-blocking read** starts a background task and returns at once. With
//!   `read_continuous` set the task keeps reading, firing the read-complete
//!   callback once per report, until the device is closed or removed.
//! - **Blocking write** submits the report and waits like a blocking read.
//! - **Non-blocking write** waits out any previous write task, then hands a
//!   copy of the report to a new task that fires write-complete on success.
//!
//! # Cancellation
//! `close()`, `removed()` and dropping the device are the only ways to stop
//! I/O. Each one moves the device to a new I/O epoch; waits observe the change
//! at their next interval and give up. `close()` returns only once every
//! blocking call and background task has let go of the transport.

use crate::backends::{Completion, HidBackend, HidTransport, PendingIo};
use crate::config::HidConfig;
use crate::error::{HidError, Result};
use crate::event::DeviceState;
use crate::metadata::{DeviceInfo, DevicePath, StringKind};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Callback invoked with the device that raised it.
pub type DeviceCallback = Arc<dyn Fn(&HidDevice) + Send + Sync>;

/// State shared with background write tasks.
#[derive(Default)]
struct WriteGate {
    /// Serialises writes: one overlapped write per device at a time.
    lock: Mutex<()>,
    in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The background read task and the requests made while it runs.
#[derive(Default)]
struct ReadSlot {
    handle: Option<JoinHandle<()>>,
    /// Bumped per spawned task; a task only touches the slot while it matches.
    generation: u64,
    /// Set at spawn, cleared by the task under this lock when it decides to stop.
    active: bool,
    /// A `read()` arrived while the task was active.
    rearm: bool,
}

/// Counts blocking reads and writes so `close()` can wait them out.
#[derive(Default)]
struct BlockingIo {
    active: Mutex<usize>,
    drained: Condvar,
}

impl BlockingIo {
    fn enter(&self) -> BlockingGuard<'_> {
        *self.active.lock() += 1;
        BlockingGuard(self)
    }

    fn wait_drained(&self) {
        let mut active = self.active.lock();
        while *active > 0 {
            self.drained.wait(&mut active);
        }
    }
}

struct BlockingGuard<'a>(&'a BlockingIo);

impl Drop for BlockingGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.0.active.lock();
        *active -= 1;
        if *active == 0 {
            self.0.drained.notify_all();
        }
    }
}

/// Everything a read or write needs, captured atomically with respect to close.
struct IoContext {
    transport: Arc<dyn HidTransport>,
    epoch: u64,
    input_len: usize,
}

#[derive(Default)]
struct Callbacks {
    removal: Option<DeviceCallback>,
    read_complete: Option<DeviceCallback>,
    write_complete: Option<DeviceCallback>,
}

/// One physical HID device.
pub struct HidDevice {
    this: Weak<HidDevice>,
    path: DevicePath,
    backend: Arc<dyn HidBackend>,
    config: HidConfig,

    /// Guards open/close and the capture of an [`IoContext`].
    lifecycle: Mutex<()>,
    transport: RwLock<Option<Arc<dyn HidTransport>>>,
    read_buf: Mutex<Option<Vec<u8>>>,
    info: RwLock<DeviceInfo>,
    epoch: AtomicU64,

    connected: AtomicBool,
    opened_once: AtomicBool,
    read_blocking: AtomicBool,
    read_continuous: AtomicBool,
    write_blocking: AtomicBool,

    read_task: Mutex<ReadSlot>,
    write_task: Mutex<Option<JoinHandle<()>>>,
    write_gate: Arc<WriteGate>,
    blocking_io: BlockingIo,

    callbacks: RwLock<Callbacks>,
}

impl HidDevice {
    /// Create a closed device for `path`.
    ///
    /// An empty path is accepted here and rejected by [`open`](Self::open).
    pub fn new(
        path: impl Into<DevicePath>,
        backend: Arc<dyn HidBackend>,
        config: HidConfig,
    ) -> Arc<Self> {
        let path = path.into();
        let defaults = config.defaults;
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            info: RwLock::new(DeviceInfo {
                path: path.clone(),
                ..Default::default()
            }),
            path,
            backend,
            config,
            lifecycle: Mutex::new(()),
            transport: RwLock::new(None),
            read_buf: Mutex::new(None),
            epoch: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            opened_once: AtomicBool::new(false),
            read_blocking: AtomicBool::new(defaults.read_blocking),
            read_continuous: AtomicBool::new(defaults.read_continuous),
            write_blocking: AtomicBool::new(defaults.write_blocking),
            read_task: Mutex::new(ReadSlot::default()),
            write_task: Mutex::new(None),
            write_gate: Arc::new(WriteGate::default()),
            blocking_io: BlockingIo::default(),
            callbacks: RwLock::new(Callbacks::default()),
        })
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Open the device for overlapped I/O.
    ///
    /// On failure nothing stays acquired: the handle is released before the
    /// error is returned and the read buffer is never installed. Opening an
    /// open device is a no-op.
    pub fn open(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.path.is_empty() {
            return Err(HidError::EmptyPath);
        }
        if !self.is_connected() {
            return Err(HidError::Disconnected);
        }
        if self.transport.read().is_some() {
            return Ok(());
        }

        let transport = self.backend.open(&self.path)?;
        transport.set_input_buffers(self.config.input_buffers)?;
        let caps = transport.caps()?;
        let attributes = transport.attributes()?;
        if !attributes.is_valid() {
            debug!(
                path = %self.path,
                vid = attributes.vendor_id,
                pid = attributes.product_id,
                "rejecting device with zero vendor/product id"
            );
            return Err(HidError::InvalidDevice {
                vid: attributes.vendor_id,
                pid: attributes.product_id,
            });
        }

        let max = self.config.max_string_len;
        let info = DeviceInfo {
            path: self.path.clone(),
            vid: attributes.vendor_id,
            pid: attributes.product_id,
            version: attributes.version,
            manufacturer: transport
                .string(StringKind::Manufacturer, max)
                .unwrap_or_default(),
            product: transport.string(StringKind::Product, max).unwrap_or_default(),
            serial_number: transport
                .string(StringKind::SerialNumber, max)
                .unwrap_or_default(),
            input_report_len: caps.input_report_len,
            output_report_len: caps.output_report_len,
            usage_page: caps.usage_page,
            usage: caps.usage,
        };

        debug!(
            path = %self.path,
            vid = format_args!("0x{:04x}", info.vid),
            pid = format_args!("0x{:04x}", info.pid),
            input_len = info.input_report_len,
            output_len = info.output_report_len,
            "opened device"
        );

        *self.info.write() = info;
        *self.read_buf.lock() = Some(vec![0; caps.input_report_len]);
        *self.transport.write() = Some(Arc::from(transport));
        self.opened_once.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop background I/O, release the handle and free the read buffer.
    ///
    /// Blocks until blocking calls on other threads have given up, which takes
    /// at most one wait interval, and joins the background tasks. The handle
    /// is released when the last of them drops the transport. Callable from
    /// inside a callback: the task running the callback is left to exit on
    /// its own and releases the handle as it does.
    ///
    /// Always returns `Ok`, closing a closed device included. Releasing a
    /// handle cannot be retried, so a failing release is logged by the backend
    /// rather than reported here.
    pub fn close(&self) -> Result<()> {
        let released = {
            let _lifecycle = self.lifecycle.lock();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.read_buf.lock().take();
            self.transport.write().take()
        };

        let reader = {
            let mut slot = self.read_task.lock();
            slot.active = false;
            slot.rearm = false;
            slot.handle.take()
        };
        join_task(reader, "read");
        let writer = self.write_task.lock().take();
        join_task(writer, "write");
        self.blocking_io.wait_drained();

        if released.is_some() {
            debug!(path = %self.path, "closed device");
        }
        Ok(())
    }

    /// The OS reported the device gone: mark it disconnected and close it.
    pub fn removed(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if self.is_open() {
            if let Err(e) = self.close() {
                warn!(path = %self.path, error = %e, "close after removal failed");
            }
        } else {
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// The device re-appeared. It stays closed; reopening is up to the owner.
    pub fn connected(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.opened_once.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.read().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Current position in the device lifecycle.
    pub fn state(&self) -> DeviceState {
        if !self.is_connected() {
            return DeviceState::Removed;
        }
        if self.is_open() {
            if self.read_task.lock().active {
                DeviceState::OpenReading
            } else if self.write_gate.in_flight.load(Ordering::SeqCst) > 0
                || task_running(&self.write_task)
            {
                DeviceState::OpenWriting
            } else {
                DeviceState::OpenIdle
            }
        } else if self.opened_once.load(Ordering::SeqCst) {
            DeviceState::Closed
        } else {
            DeviceState::Unopened
        }
    }

    // ---------------------------------------------------------------------
    // Modes and callbacks
    // ---------------------------------------------------------------------

    pub fn set_read_blocking(&self, blocking: bool) {
        self.read_blocking.store(blocking, Ordering::SeqCst);
    }

    pub fn set_read_continuous(&self, continuous: bool) {
        self.read_continuous.store(continuous, Ordering::SeqCst);
    }

    pub fn set_write_blocking(&self, blocking: bool) {
        self.write_blocking.store(blocking, Ordering::SeqCst);
    }

    pub fn read_blocking(&self) -> bool {
        self.read_blocking.load(Ordering::SeqCst)
    }

    pub fn read_continuous(&self) -> bool {
        self.read_continuous.load(Ordering::SeqCst)
    }

    pub fn write_blocking(&self) -> bool {
        self.write_blocking.load(Ordering::SeqCst)
    }

    /// Called by the registry after this device was marked removed.
    pub fn set_callback_removal(&self, cb: Option<DeviceCallback>) {
        self.callbacks.write().removal = cb;
    }

    /// Called from the read task after each non-blocking read.
    pub fn set_callback_read_complete(&self, cb: Option<DeviceCallback>) {
        self.callbacks.write().read_complete = cb;
    }

    /// Called from the write task after each non-blocking write.
    pub fn set_callback_write_complete(&self, cb: Option<DeviceCallback>) {
        self.callbacks.write().write_complete = cb;
    }

    pub fn callback_removal(&self) -> Option<DeviceCallback> {
        self.callbacks.read().removal.clone()
    }

    // ---------------------------------------------------------------------
    // I/O
    // ---------------------------------------------------------------------

    /// Read one input report into the read buffer.
    ///
    /// In non-blocking mode this only starts the background task. A request
    /// made while a task is active re-arms it: that task reads at least one
    /// more report, and fires read-complete for it, before it stops.
    pub fn read(&self) -> Result<()> {
        if self.read_blocking() {
            return self.read_now();
        }

        let mut slot = self.read_task.lock();
        if slot.active {
            trace!(path = %self.path, "read task active, re-arming");
            slot.rearm = true;
            return Ok(());
        }
        // An inactive task has made its last slot access and is exiting.
        join_task(slot.handle.take(), "read");

        let ctx = self.io_context()?;
        let weak = self.this.clone();
        let interval = self.config.wait_interval();
        let generation = slot.generation + 1;
        let handle = thread::Builder::new()
            .name("hid-read".into())
            .spawn(move || read_loop(weak, ctx, interval, generation))?;
        *slot = ReadSlot {
            handle: Some(handle),
            generation,
            active: true,
            rearm: false,
        };
        Ok(())
    }

    /// Write one output report.
    ///
    /// `report` must be exactly [`output_report_length`](Self::output_report_length)
    /// bytes, report ID first. Release builds pass the length to the OS
    /// unchecked; a mismatch is rejected there and surfaces as an I/O error.
    pub fn write(&self, report: &[u8]) -> Result<()> {
        if report.is_empty() {
            return Err(HidError::EmptyBuffer);
        }
        debug_assert!(
            !self.is_open() || report.len() == self.output_report_length(),
            "report is {} bytes, device expects {}",
            report.len(),
            self.output_report_length()
        );

        if self.write_blocking() {
            // Declared first so the transport is dropped before close() sees the drain.
            let _blocking = self.blocking_io.enter();
            let ctx = self.io_context()?;
            let interval = self.config.wait_interval();
            return write_report(&ctx, &self.write_gate, report.to_vec(), interval, || {
                self.liveness(ctx.epoch)
            });
        }

        // Take the previous task out before joining so its callback may write.
        let previous = self.write_task.lock().take();
        join_task(previous, "write");

        let ctx = self.io_context()?;
        let weak = self.this.clone();
        let gate = self.write_gate.clone();
        let interval = self.config.wait_interval();
        let report = report.to_vec();
        let handle = thread::Builder::new()
            .name("hid-write".into())
            .spawn(move || write_task(weak, ctx, gate, report, interval))?;
        let stale = self.write_task.lock().replace(handle);
        join_task(stale, "write");
        Ok(())
    }

    fn read_now(&self) -> Result<()> {
        let _blocking = self.blocking_io.enter();
        let ctx = self.io_context()?;
        let mut pending = ctx.transport.submit_read(ctx.input_len)?;
        let n = await_io(pending.as_mut(), self.config.wait_interval(), || {
            self.liveness(ctx.epoch)
        })?;
        self.store_report(ctx.epoch, &pending.buffer()[..n]);
        Ok(())
    }

    fn io_context(&self) -> Result<IoContext> {
        let _lifecycle = self.lifecycle.lock();
        if !self.is_connected() {
            return Err(HidError::Disconnected);
        }
        let transport = self.transport.read().clone().ok_or(HidError::NotOpen)?;
        Ok(IoContext {
            transport,
            epoch: self.epoch.load(Ordering::SeqCst),
            input_len: self.input_report_length(),
        })
    }

    fn liveness(&self, epoch: u64) -> Result<()> {
        if !self.is_connected() {
            Err(HidError::Disconnected)
        } else if self.epoch.load(Ordering::SeqCst) != epoch {
            Err(HidError::Closing)
        } else {
            Ok(())
        }
    }

    fn store_report(&self, epoch: u64, data: &[u8]) {
        let mut buf = self.read_buf.lock();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if let Some(buf) = buf.as_mut() {
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            buf[n..].fill(0);
        }
    }

    /// Decide, under the slot lock, whether read task `generation` goes on.
    fn read_task_continues(&self, generation: u64, epoch: u64) -> bool {
        let mut slot = self.read_task.lock();
        if slot.generation != generation {
            return false;
        }
        let rearmed = std::mem::take(&mut slot.rearm);
        let go_on = (self.read_continuous() || rearmed) && self.liveness(epoch).is_ok();
        if !go_on {
            slot.active = false;
        }
        go_on
    }

    fn read_task_stopped(&self, generation: u64) {
        let mut slot = self.read_task.lock();
        if slot.generation == generation {
            slot.active = false;
            slot.rearm = false;
        }
    }

    fn fire(&self, pick: impl Fn(&Callbacks) -> Option<DeviceCallback>) {
        let cb = pick(&self.callbacks.read());
        if let Some(cb) = cb {
            cb(self);
        }
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn path(&self) -> &DevicePath {
        &self.path
    }

    pub fn vid(&self) -> u16 {
        self.info.read().vid
    }

    pub fn pid(&self) -> u16 {
        self.info.read().pid
    }

    pub fn version_number(&self) -> u16 {
        self.info.read().version
    }

    pub fn manufacturer(&self) -> String {
        self.info.read().manufacturer.clone()
    }

    pub fn product(&self) -> String {
        self.info.read().product.clone()
    }

    pub fn serial_number(&self) -> String {
        self.info.read().serial_number.clone()
    }

    pub fn input_report_length(&self) -> usize {
        self.info.read().input_report_len
    }

    pub fn output_report_length(&self) -> usize {
        self.info.read().output_report_len
    }

    pub fn usage_page(&self) -> u16 {
        self.info.read().usage_page
    }

    pub fn usage(&self) -> u16 {
        self.info.read().usage
    }

    /// Copy of the read buffer: the last report read, or `None` when closed.
    pub fn read_buffer(&self) -> Option<Vec<u8>> {
        self.read_buf.lock().clone()
    }

    /// Metadata snapshot.
    pub fn info(&self) -> DeviceInfo {
        self.info.read().clone()
    }
}

impl std::fmt::Debug for HidDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HidDevice")
            .field("path", &self.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for HidDevice {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.transport.get_mut().take();
        self.read_buf.get_mut().take();
        join_task(self.read_task.get_mut().handle.take(), "read");
        join_task(self.write_task.get_mut().take(), "write");
    }
}

/// Wait for `pending` in `interval` slices, checking `live` between slices.
fn await_io(
    pending: &mut dyn PendingIo,
    interval: Duration,
    live: impl Fn() -> Result<()>,
) -> Result<usize> {
    loop {
        match pending.wait(interval)? {
            Completion::Done(0) => return Err(HidError::EmptyTransfer),
            Completion::Done(n) => return Ok(n),
            Completion::Pending => live()?,
        }
    }
}

fn write_report(
    ctx: &IoContext,
    gate: &WriteGate,
    report: Vec<u8>,
    interval: Duration,
    live: impl Fn() -> Result<()>,
) -> Result<()> {
    let _serial = gate.lock.lock();
    let _in_flight = InFlight::enter(&gate.in_flight);
    live()?;
    let mut pending = ctx.transport.submit_write(report)?;
    await_io(pending.as_mut(), interval, live)?;
    Ok(())
}

fn weak_liveness(weak: &Weak<HidDevice>, epoch: u64) -> Result<()> {
    weak.upgrade()
        .map_or(Err(HidError::Closing), |device| device.liveness(epoch))
}

fn read_loop(weak: Weak<HidDevice>, ctx: IoContext, interval: Duration, generation: u64) {
    loop {
        let outcome = match ctx.transport.submit_read(ctx.input_len) {
            Ok(mut pending) => await_io(pending.as_mut(), interval, || {
                weak_liveness(&weak, ctx.epoch)
            })
            .map(|n| pending.buffer()[..n].to_vec()),
            Err(e) => Err(e),
        };

        let Some(device) = weak.upgrade() else {
            break;
        };
        match outcome {
            Ok(report) => {
                device.store_report(ctx.epoch, &report);
                if device.liveness(ctx.epoch).is_ok() {
                    device.fire(|c| c.read_complete.clone());
                }
            }
            Err(e) if e.is_terminal() => {
                trace!(path = %device.path, reason = %e, "read task stopping");
                device.read_task_stopped(generation);
                break;
            }
            Err(e) => {
                debug!(path = %device.path, error = %e, "read failed");
                if !matches!(e, HidError::EmptyTransfer) {
                    // Submission itself failed; don't spin on it.
                    thread::sleep(interval);
                }
            }
        }

        if !device.read_task_continues(generation, ctx.epoch) {
            break;
        }
    }
}

fn write_task(
    weak: Weak<HidDevice>,
    ctx: IoContext,
    gate: Arc<WriteGate>,
    report: Vec<u8>,
    interval: Duration,
) {
    let result = write_report(&ctx, &gate, report, interval, || {
        weak_liveness(&weak, ctx.epoch)
    });
    let Some(device) = weak.upgrade() else {
        return;
    };
    match result {
        Ok(()) => device.fire(|c| c.write_complete.clone()),
        Err(e) => debug!(path = %device.path, error = %e, "background write failed"),
    }
}

fn task_running(slot: &Mutex<Option<JoinHandle<()>>>) -> bool {
    slot.lock().as_ref().is_some_and(|h| !h.is_finished())
}

/// Join a background task unless it is the current thread.
fn join_task(handle: Option<JoinHandle<()>>, what: &str) {
    let Some(handle) = handle else {
        return;
    };
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        warn!("{what} task panicked");
    }
}
