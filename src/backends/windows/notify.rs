//! `WM_DEVICECHANGE` notifications on a message-only window.
//!
//! A dedicated `hid-notify` thread creates a message-only window, registers
//! it for HID interface arrivals and removals, and pumps messages until it is
//! told to quit. Each notification is turned into a [`HotplugEvent`] and handed
//! to the sink on that thread.

use crate::backends::{HotplugSink, HotplugWatch};
use crate::error::{HidError, Result};
use crate::event::HotplugEvent;
use crate::metadata::DevicePath;
use core::ffi::c_void;
use std::cell::RefCell;
use std::io;
use std::ptr::{null, null_mut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};
use windows_sys::core::GUID;
use windows_sys::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
use windows_sys::Win32::System::Threading::GetCurrentThreadId;
use windows_sys::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetMessageW,
    PostThreadMessageW, RegisterClassW, RegisterDeviceNotificationW, TranslateMessage,
    UnregisterClassW, UnregisterDeviceNotification, HWND_MESSAGE, MSG, WM_QUIT, WNDCLASSW,
};

use super::discovery::hid_class_guid;

// Local constants (avoid relying on module exports that vary by windows-sys version)
const WM_DEVICECHANGE: u32 = 0x0219;
const DBT_DEVICEARRIVAL: usize = 0x8000;
const DBT_DEVICEREMOVECOMPLETE: usize = 0x8004;
const DBT_DEVTYP_DEVICEINTERFACE: u32 = 0x0005;
const DEVICE_NOTIFY_WINDOW_HANDLE: u32 = 0x0000;

#[allow(dead_code)]
#[repr(C)]
struct DevBroadcastHdr {
    size: u32,
    device_type: u32,
    reserved: u32,
}

#[allow(dead_code)]
#[repr(C)]
struct DevBroadcastDeviceInterface {
    size: u32,
    device_type: u32,
    reserved: u32,
    class_guid: GUID,
    name: [u16; 1],
}

thread_local! {
    static SINK: RefCell<Option<HotplugSink>> = const { RefCell::new(None) };
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Running notification thread. Dropping it stops the pump and joins.
pub struct NotificationWindow {
    thread_id: u32,
    active: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl NotificationWindow {
    /// Start the notification thread and wait until it is registered.
    pub fn spawn(sink: HotplugSink) -> Result<Self> {
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<u32, String>>();
        let active = Arc::new(AtomicBool::new(false));
        let flag = active.clone();

        let thread = thread::Builder::new()
            .name("hid-notify".into())
            .spawn(move || run(sink, ready_tx, flag))?;

        match ready_rx.recv() {
            Ok(Ok(thread_id)) => Ok(Self {
                thread_id,
                active,
                thread: Some(thread),
            }),
            Ok(Err(reason)) => {
                let _ = thread.join();
                Err(HidError::Notification(reason))
            }
            Err(_) => {
                let _ = thread.join();
                Err(HidError::Notification("notification thread exited".into()))
            }
        }
    }
}

impl HotplugWatch for NotificationWindow {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for NotificationWindow {
    fn drop(&mut self) {
        unsafe {
            PostThreadMessageW(self.thread_id, WM_QUIT, 0, 0);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("notification thread panicked");
            }
        }
    }
}

fn run(
    sink: HotplugSink,
    ready: mpsc::Sender<std::result::Result<u32, String>>,
    active: Arc<AtomicBool>,
) {
    let class_name = wide("hidhost-notify");
    let instance = unsafe { GetModuleHandleW(null()) };

    let mut class: WNDCLASSW = unsafe { core::mem::zeroed() };
    class.lpfnWndProc = Some(window_proc);
    class.hInstance = instance;
    class.lpszClassName = class_name.as_ptr();
    // Registration fails harmlessly if a previous watcher left the class behind.
    unsafe { RegisterClassW(&class) };

    let hwnd = unsafe {
        CreateWindowExW(
            0,
            class_name.as_ptr(),
            class_name.as_ptr(),
            0,
            0,
            0,
            0,
            0,
            HWND_MESSAGE,
            null_mut(),
            instance,
            null(),
        )
    };
    if hwnd.is_null() {
        let _ = ready.send(Err(format!(
            "CreateWindowExW failed: {}",
            io::Error::last_os_error()
        )));
        return;
    }

    let mut filter: DevBroadcastDeviceInterface = unsafe { core::mem::zeroed() };
    filter.size = core::mem::size_of::<DevBroadcastDeviceInterface>() as u32;
    filter.device_type = DBT_DEVTYP_DEVICEINTERFACE;
    filter.class_guid = hid_class_guid();

    let registration = unsafe {
        RegisterDeviceNotificationW(
            hwnd,
            &filter as *const _ as *const c_void,
            DEVICE_NOTIFY_WINDOW_HANDLE,
        )
    };
    if registration.is_null() {
        let reason = format!(
            "RegisterDeviceNotificationW failed: {}",
            io::Error::last_os_error()
        );
        unsafe { DestroyWindow(hwnd) };
        let _ = ready.send(Err(reason));
        return;
    }

    SINK.with(|slot| *slot.borrow_mut() = Some(sink));
    active.store(true, Ordering::SeqCst);
    let _ = ready.send(Ok(unsafe { GetCurrentThreadId() }));
    debug!("listening for HID interface changes");

    let mut msg: MSG = unsafe { core::mem::zeroed() };
    loop {
        let got = unsafe { GetMessageW(&mut msg, null_mut(), 0, 0) };
        if got <= 0 {
            break;
        }
        unsafe {
            TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    }

    active.store(false, Ordering::SeqCst);
    SINK.with(|slot| slot.borrow_mut().take());
    unsafe {
        UnregisterDeviceNotification(registration);
        DestroyWindow(hwnd);
        UnregisterClassW(class_name.as_ptr(), instance);
    }
    debug!("stopped listening for HID interface changes");
}

unsafe extern "system" fn window_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    if msg == WM_DEVICECHANGE && lparam != 0 {
        if let Some(event) = unsafe { decode(wparam, lparam) } {
            SINK.with(|slot| {
                if let Some(sink) = slot.borrow().as_ref() {
                    sink(event);
                }
            });
        }
        return 1;
    }
    unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) }
}

/// Decode a `WM_DEVICECHANGE` broadcast for a device interface.
///
/// # Safety
/// `lparam` must point at the `DEV_BROADCAST_HDR` delivered with the message.
unsafe fn decode(wparam: WPARAM, lparam: LPARAM) -> Option<HotplugEvent> {
    if wparam != DBT_DEVICEARRIVAL && wparam != DBT_DEVICEREMOVECOMPLETE {
        return None;
    }
    let hdr = unsafe { &*(lparam as *const DevBroadcastHdr) };
    if hdr.device_type != DBT_DEVTYP_DEVICEINTERFACE {
        return None;
    }

    let name_offset = core::mem::offset_of!(DevBroadcastDeviceInterface, name);
    let max_chars = (hdr.size as usize).saturating_sub(name_offset) / 2;
    let name = unsafe {
        let start = (lparam as *const u8).add(name_offset) as *const u16;
        std::slice::from_raw_parts(start, max_chars)
    };
    let end = name.iter().position(|&c| c == 0).unwrap_or(name.len());
    let path = DevicePath::new(String::from_utf16_lossy(&name[..end]));
    trace!(%path, arrival = wparam == DBT_DEVICEARRIVAL, "device interface change");

    Some(if wparam == DBT_DEVICEARRIVAL {
        HotplugEvent::Arrived(path)
    } else {
        HotplugEvent::Removed(path)
    })
}
