use hidhost::backends::virtual_hid::{VirtualBackend, VirtualDevice, VirtualDeviceSpec};
use hidhost::{DeviceInfo, DeviceState, HidConfig, HidDevice, HidError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const PATH: &str = r"\\?\HID#VID_1209&PID_0001&MI_00#8&2f0c1a5&0&0000#{4d1e55b2-f16f-11cf-88cb-001111000030}";
const PATIENCE: Duration = Duration::from_secs(2);

fn fast_config() -> HidConfig {
    HidConfig {
        wait_interval_ms: 5,
        ..HidConfig::default()
    }
}

fn pedals() -> VirtualDeviceSpec {
    VirtualDeviceSpec::new(PATH, 0x1209, 0x0001)
        .reports(8, 25)
        .usage(0x01, 0x04)
        .strings("Belegrade", "Rudder Pedals", "RP-0042")
}

fn setup(spec: VirtualDeviceSpec) -> (VirtualBackend, Arc<VirtualDevice>, Arc<HidDevice>) {
    let backend = VirtualBackend::new();
    let path = spec.path.clone();
    let sim = backend.add(spec);
    let device = HidDevice::new(path, Arc::new(backend.clone()), fast_config());
    (backend, sim, device)
}

fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn open_populates_metadata() {
    let (_bus, sim, device) = setup(pedals().version(0x0210));
    device.open().unwrap();

    assert!(device.is_open());
    assert_eq!(device.vid(), 0x1209);
    assert_eq!(device.pid(), 0x0001);
    assert_eq!(device.version_number(), 0x0210);
    assert_eq!(device.input_report_length(), 8);
    assert_eq!(device.output_report_length(), 25);
    assert_eq!(device.usage_page(), 0x01);
    assert_eq!(device.usage(), 0x04);
    assert_eq!(device.manufacturer(), "Belegrade");
    assert_eq!(device.product(), "Rudder Pedals");
    assert_eq!(device.serial_number(), "RP-0042");
    assert_eq!(device.path().as_str(), PATH.to_lowercase());
    assert_eq!(device.read_buffer(), Some(vec![0; 8]));
    assert_eq!(sim.input_buffers(), 64);
    assert_eq!(sim.open_handles(), 1);
}

#[test]
fn input_ring_size_follows_config() {
    let backend = VirtualBackend::new();
    let sim = backend.add(pedals());
    let config = HidConfig::from_toml_str("input_buffers = 128").unwrap();
    let device = HidDevice::new(PATH, Arc::new(backend), config);
    device.open().unwrap();
    assert_eq!(sim.input_buffers(), 128);
}

#[test]
fn missing_strings_are_empty() {
    let (_bus, _sim, device) = setup(VirtualDeviceSpec::new(PATH, 0x1209, 0x0001));
    device.open().unwrap();
    assert_eq!(device.product(), "");
    assert_eq!(device.serial_number(), "");
    assert_eq!(device.info().to_string(), "Unknown [1209:0001]");
}

#[test]
fn close_is_idempotent() {
    let (_bus, sim, device) = setup(pedals());
    device.close().unwrap();

    device.open().unwrap();
    device.close().unwrap();
    device.close().unwrap();

    assert!(!device.is_open());
    assert_eq!(device.read_buffer(), None);
    assert_eq!(sim.open_handles(), 0);
}

#[test]
fn opening_twice_keeps_one_handle() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();
    device.open().unwrap();
    assert_eq!(sim.open_handles(), 1);
}

#[test]
fn reopen_reports_the_same_device() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();
    let first = device.info();
    device.close().unwrap();
    assert_eq!(device.state(), DeviceState::Closed);

    device.open().unwrap();
    assert_eq!(device.info(), first);
    assert_eq!(device.read_buffer().map(|b| b.len()), Some(8));
    assert_eq!(sim.open_handles(), 1);
}

#[test]
fn failed_open_holds_nothing() {
    let backend = VirtualBackend::new();
    let zero_vid = backend.add(VirtualDeviceSpec::new("zero-vid", 0, 0x0001));
    let broken = backend.add(VirtualDeviceSpec::new("broken", 0x1209, 0x0002).broken_descriptor());
    let backend: Arc<VirtualBackend> = Arc::new(backend);

    let device = HidDevice::new("zero-vid", backend.clone(), fast_config());
    assert!(matches!(
        device.open(),
        Err(HidError::InvalidDevice { vid: 0, pid: 1 })
    ));
    assert!(!device.is_open());
    assert_eq!(device.read_buffer(), None);
    assert_eq!(device.state(), DeviceState::Unopened);
    assert_eq!(zero_vid.open_handles(), 0);

    let device = HidDevice::new("broken", backend.clone(), fast_config());
    assert!(matches!(device.open(), Err(HidError::Capabilities(_))));
    assert_eq!(broken.open_handles(), 0);

    let device = HidDevice::new("nowhere", backend.clone(), fast_config());
    assert!(matches!(device.open(), Err(HidError::Open { .. })));

    let device = HidDevice::new("", backend, fast_config());
    assert!(matches!(device.open(), Err(HidError::EmptyPath)));
}

#[test]
fn io_requires_an_open_device() {
    let (_bus, _sim, device) = setup(pedals());
    assert!(matches!(device.read(), Err(HidError::NotOpen)));
    assert!(matches!(device.write(&[0; 25]), Err(HidError::NotOpen)));
}

#[test]
fn blocking_read_fills_the_buffer() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    device.set_callback_read_complete(Some(Arc::new(move |_: &HidDevice| {
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    sim.push_report(vec![0x01, 0x7f, 0x80, 0, 0, 0, 0, 0]);
    device.read().unwrap();
    assert_eq!(device.read_buffer().unwrap(), vec![0x01, 0x7f, 0x80, 0, 0, 0, 0, 0]);
    // Blocking reads report through the return value only.
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn zero_byte_read_fails_without_retry() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();
    sim.fail_reads(1);
    sim.push_report(vec![1; 8]);
    assert!(matches!(device.read(), Err(HidError::EmptyTransfer)));
    assert_eq!(sim.reads_submitted(), 1);
}

#[test]
fn blocking_read_unblocks_on_close() {
    let (_bus, _sim, device) = setup(pedals());
    device.open().unwrap();

    let closer = {
        let device = device.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            device.close().unwrap();
        })
    };
    assert!(matches!(device.read(), Err(HidError::Closing)));
    closer.join().unwrap();
}

#[test]
fn close_waits_for_a_blocked_reader_to_release_the_handle() {
    let backend = VirtualBackend::new();
    let sim = backend.add(pedals());
    let config = HidConfig {
        wait_interval_ms: 200,
        ..HidConfig::default()
    };
    let device = HidDevice::new(PATH, Arc::new(backend.clone()), config);
    device.open().unwrap();

    let reader = {
        let device = device.clone();
        thread::spawn(move || device.read())
    };
    assert!(wait_until(|| sim.reads_submitted() == 1));

    device.close().unwrap();
    assert_eq!(sim.open_handles(), 0);
    assert!(matches!(reader.join().unwrap(), Err(HidError::Closing)));

    device.open().unwrap();
    assert_eq!(sim.open_handles(), 1);
}

#[test]
fn blocking_read_unblocks_on_removal() {
    let (_bus, _sim, device) = setup(pedals());
    device.open().unwrap();

    let remover = {
        let device = device.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            device.removed();
        })
    };
    assert!(matches!(device.read(), Err(HidError::Disconnected)));
    remover.join().unwrap();
    assert_eq!(device.state(), DeviceState::Removed);
}

#[test]
fn continuous_read_fires_once_per_report_in_order() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();
    device.set_read_blocking(false);
    device.set_read_continuous(true);

    let (tx, rx) = mpsc::channel();
    device.set_callback_read_complete(Some(Arc::new(move |d: &HidDevice| {
        let report = d.read_buffer().unwrap_or_default();
        let _ = tx.send(report[0]);
    })));

    device.read().unwrap();
    assert!(wait_until(|| device.state() == DeviceState::OpenReading));
    for i in 1..=5u8 {
        sim.push_report(vec![i; 8]);
    }

    let seen: Vec<u8> = (0..5).map(|_| rx.recv_timeout(PATIENCE).unwrap()).collect();
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    device.close().unwrap();
    assert_eq!(device.state(), DeviceState::Closed);
}

#[test]
fn second_read_request_rearms_the_running_task() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();
    device.set_read_blocking(false);
    device.set_read_continuous(true);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    device.set_callback_read_complete(Some(Arc::new(move |_: &HidDevice| {
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    device.read().unwrap();
    device.read().unwrap();
    sim.push_report(vec![9; 8]);

    assert!(wait_until(|| fired.load(Ordering::SeqCst) == 1));
    thread::sleep(Duration::from_millis(30));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn single_background_read_stops_after_one_report() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();
    device.set_read_blocking(false);

    let (tx, rx) = mpsc::channel();
    device.set_callback_read_complete(Some(Arc::new(move |d: &HidDevice| {
        let _ = tx.send(d.read_buffer().unwrap_or_default());
    })));

    device.read().unwrap();
    sim.push_report(vec![3; 8]);
    sim.push_report(vec![4; 8]);
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), vec![3; 8]);
    assert!(wait_until(|| device.state() == DeviceState::OpenIdle));
    assert!(rx.recv_timeout(Duration::from_millis(30)).is_err());

    // A fresh request picks up the report still queued.
    device.read().unwrap();
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), vec![4; 8]);
}

#[test]
fn read_requested_from_the_callback_reads_again() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();
    device.set_read_blocking(false);

    let (tx, rx) = mpsc::channel();
    device.set_callback_read_complete(Some(Arc::new(move |d: &HidDevice| {
        let _ = tx.send(d.read_buffer().unwrap_or_default()[0]);
        d.read().unwrap();
    })));

    sim.push_report(vec![1; 8]);
    sim.push_report(vec![2; 8]);
    device.read().unwrap();
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), 1);
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), 2);

    device.close().unwrap();
    assert_eq!(device.state(), DeviceState::Closed);
}

#[test]
fn read_requested_while_the_task_winds_down_is_kept() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();
    device.set_read_blocking(false);

    let (tx, rx) = mpsc::channel();
    device.set_callback_read_complete(Some(Arc::new(move |d: &HidDevice| {
        let _ = tx.send(d.read_buffer().unwrap_or_default()[0]);
        // Keep the task alive past the point where it decides to stop.
        thread::sleep(Duration::from_millis(50));
    })));

    sim.push_report(vec![1; 8]);
    device.read().unwrap();
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), 1);

    device.read().unwrap();
    sim.push_report(vec![2; 8]);
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), 2);
    assert!(wait_until(|| device.state() == DeviceState::OpenIdle));
    assert!(rx.recv_timeout(Duration::from_millis(30)).is_err());
    assert_eq!(sim.reads_submitted(), 2);
}

#[test]
fn continuous_read_retries_empty_transfers() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();
    device.set_read_blocking(false);
    device.set_read_continuous(true);

    let (tx, rx) = mpsc::channel();
    device.set_callback_read_complete(Some(Arc::new(move |d: &HidDevice| {
        let _ = tx.send(d.read_buffer().unwrap_or_default()[0]);
    })));

    sim.fail_reads(2);
    device.read().unwrap();
    for i in 1..=3u8 {
        sim.push_report(vec![i; 8]);
    }
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), 3);
    assert!(rx.recv_timeout(Duration::from_millis(30)).is_err());
    assert!(device.is_open());
}

#[test]
fn read_task_ends_when_the_device_disappears() {
    let (bus, sim, device) = setup(pedals());
    device.open().unwrap();
    device.set_read_blocking(false);
    device.set_read_continuous(true);
    device.read().unwrap();
    assert!(wait_until(|| sim.reads_submitted() >= 1));

    bus.unplug(PATH);
    assert!(wait_until(|| device.state() == DeviceState::OpenIdle));

    device.removed();
    assert_eq!(device.state(), DeviceState::Removed);
    assert!(!device.is_open());
    assert_eq!(sim.open_handles(), 0);
}

#[test]
fn continuous_reads_then_unplug_stop_cleanly() {
    let (bus, sim, device) = setup(pedals());
    device.open().unwrap();
    device.set_read_blocking(false);
    device.set_read_continuous(true);

    let (tx, rx) = mpsc::channel();
    device.set_callback_read_complete(Some(Arc::new(move |d: &HidDevice| {
        let _ = tx.send(d.read_buffer().unwrap_or_default()[0]);
    })));

    device.read().unwrap();
    for i in 1..=4u8 {
        sim.push_report(vec![i; 8]);
    }
    let seen: Vec<u8> = (0..4).map(|_| rx.recv_timeout(PATIENCE).unwrap()).collect();
    assert_eq!(seen, vec![1, 2, 3, 4]);

    bus.unplug(PATH);
    assert!(wait_until(|| device.state() == DeviceState::OpenIdle));
    let submitted = sim.reads_submitted();
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(sim.reads_submitted(), submitted);

    device.removed();
    assert_eq!(device.state(), DeviceState::Removed);
    assert_eq!(sim.open_handles(), 0);
}

#[test]
fn close_from_read_callback_does_not_deadlock() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();
    device.set_read_blocking(false);
    device.set_read_continuous(true);

    let (tx, rx) = mpsc::channel();
    device.set_callback_read_complete(Some(Arc::new(move |d: &HidDevice| {
        d.close().unwrap();
        let _ = tx.send(());
    })));

    device.read().unwrap();
    sim.push_report(vec![1; 8]);
    rx.recv_timeout(PATIENCE).unwrap();
    assert!(wait_until(|| device.state() == DeviceState::Closed));
    assert_eq!(sim.open_handles(), 0);
}

#[test]
fn blocking_write_sends_the_report() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();

    let mut report = [0u8; 25];
    report[0] = 0x02;
    report[1] = 0xff;
    device.write(&report).unwrap();
    assert_eq!(sim.written(), vec![report.to_vec()]);
}

#[test]
fn empty_write_fails_fast() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();
    assert!(matches!(device.write(&[]), Err(HidError::EmptyBuffer)));
    assert!(sim.written().is_empty());
}

#[test]
fn background_writes_are_serialised() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();
    device.set_write_blocking(false);
    sim.set_write_latency(Duration::from_millis(20));

    let (tx, rx) = mpsc::channel();
    device.set_callback_write_complete(Some(Arc::new(move |_: &HidDevice| {
        let _ = tx.send(());
    })));

    let first = vec![0xA1; 25];
    let second = vec![0xB2; 25];
    device.write(&first).unwrap();
    device.write(&second).unwrap();

    rx.recv_timeout(PATIENCE).unwrap();
    rx.recv_timeout(PATIENCE).unwrap();
    assert_eq!(sim.written(), vec![first, second]);
    assert_eq!(sim.peak_writes_in_flight(), 1);
}

#[test]
fn blocking_write_waits_for_background_write() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();
    sim.set_write_latency(Duration::from_millis(20));

    device.set_write_blocking(false);
    device.write(&[0x01; 25]).unwrap();
    device.set_write_blocking(true);
    device.write(&[0x02; 25]).unwrap();

    assert!(wait_until(|| sim.written().len() == 2));
    assert_eq!(sim.peak_writes_in_flight(), 1);
}

#[test]
fn background_write_copies_the_report() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();
    device.set_write_blocking(false);
    sim.set_write_latency(Duration::from_millis(10));

    let mut report = vec![0x07; 25];
    device.write(&report).unwrap();
    report.fill(0);

    assert!(wait_until(|| sim.written().len() == 1));
    assert_eq!(sim.written()[0], vec![0x07; 25]);
}

#[test]
fn lifecycle_states() {
    let (_bus, sim, device) = setup(pedals());
    assert_eq!(device.state(), DeviceState::Unopened);

    device.open().unwrap();
    assert_eq!(device.state(), DeviceState::OpenIdle);
    assert!(device.state().is_open());

    device.set_write_blocking(false);
    sim.set_write_latency(Duration::from_millis(100));
    device.write(&[0; 25]).unwrap();
    assert!(wait_until(|| device.state() == DeviceState::OpenWriting));
    assert!(wait_until(|| device.state() == DeviceState::OpenIdle));

    device.close().unwrap();
    assert_eq!(device.state(), DeviceState::Closed);

    device.removed();
    assert_eq!(device.state(), DeviceState::Removed);
    assert!(matches!(device.open(), Err(HidError::Disconnected)));

    device.connected();
    assert_eq!(device.state(), DeviceState::Unopened);
    device.open().unwrap();
    assert_eq!(device.state(), DeviceState::OpenIdle);
}

#[test]
fn dropping_an_open_device_releases_everything() {
    let (_bus, sim, device) = setup(pedals());
    device.open().unwrap();
    device.set_read_blocking(false);
    device.set_read_continuous(true);
    device.read().unwrap();
    assert!(wait_until(|| sim.reads_submitted() >= 1));

    drop(device);
    assert!(wait_until(|| sim.open_handles() == 0));
}

#[test]
fn info_snapshot_serialises() {
    let (_bus, _sim, device) = setup(pedals());
    device.open().unwrap();
    let info = device.info();

    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["vid"], 0x1209);
    assert_eq!(json["product"], "Rudder Pedals");
    assert_eq!(json["path"], PATH.to_lowercase());

    let back: DeviceInfo = serde_json::from_value(json).unwrap();
    assert_eq!(back, info);
}
