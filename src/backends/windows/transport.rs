//! Overlapped HID transport (`CreateFileW` + `HidD_*`/`HidP_*`).
//!
//! Every read or write gets its own manual-reset event and heap-pinned
//! `OVERLAPPED`, so completions never cross between requests. A request that
//! is dropped while still in flight is cancelled with `CancelIoEx` and waited
//! for before its buffer is freed.

use crate::backends::{Completion, HidTransport, PendingIo};
use crate::error::{HidError, Result};
use crate::metadata::{Attributes, DevicePath, ReportCaps, StringKind};
use core::ffi::c_void;
use std::ffi::OsStr;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::ptr::{null, null_mut};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};
use windows_sys::Win32::Devices::HumanInterfaceDevice::{
    HidD_FreePreparsedData, HidD_GetAttributes, HidD_GetManufacturerString,
    HidD_GetPreparsedData, HidD_GetProductString, HidD_GetSerialNumberString,
    HidD_SetNumInputBuffers, HidP_GetCaps, HIDD_ATTRIBUTES, HIDP_CAPS, HIDP_STATUS_SUCCESS,
    PHIDP_PREPARSED_DATA,
};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_DEVICE_NOT_CONNECTED, ERROR_DEV_NOT_EXIST, ERROR_IO_PENDING,
    ERROR_OPERATION_ABORTED, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
    WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_OVERLAPPED,
    FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{CreateEventW, WaitForSingleObject};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

fn raw(handle: &impl AsRawHandle) -> HANDLE {
    handle.as_raw_handle() as HANDLE
}

/// The interface handle, closed when the transport and every request on it
/// are gone. A failing `CloseHandle` is logged.
struct DeviceHandle {
    raw: HANDLE,
    path: DevicePath,
}

// A kernel handle is not tied to the thread that opened it.
unsafe impl Send for DeviceHandle {}
unsafe impl Sync for DeviceHandle {}

impl AsRawHandle for DeviceHandle {
    fn as_raw_handle(&self) -> RawHandle {
        self.raw as RawHandle
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if unsafe { CloseHandle(self.raw) } == 0 {
            warn!(
                path = %self.path,
                error = %io::Error::last_os_error(),
                "closing device handle failed"
            );
        } else {
            trace!(path = %self.path, "handle released");
        }
    }
}

fn last_error() -> u32 {
    unsafe { GetLastError() }
}

/// Map a Win32 error from a transfer onto the device error taxonomy.
fn transfer_error(code: u32) -> HidError {
    match code {
        ERROR_DEVICE_NOT_CONNECTED | ERROR_DEV_NOT_EXIST => HidError::Disconnected,
        ERROR_OPERATION_ABORTED => HidError::Closing,
        _ => HidError::Io(io::Error::from_raw_os_error(code as i32)),
    }
}

/// An open HID interface handle.
pub struct WinHidTransport {
    path: DevicePath,
    handle: Arc<DeviceHandle>,
}

impl WinHidTransport {
    /// Open `path` shared for read and write, flagged for overlapped I/O.
    ///
    /// Interfaces the system holds exclusively for writing (keyboards, mice)
    /// are retried read-only.
    pub fn open(path: &DevicePath) -> Result<Self> {
        let wide: Vec<u16> = OsStr::new(path.as_str())
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        let try_open = |access: u32| unsafe {
            CreateFileW(
                wide.as_ptr(),
                access,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                null(),
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL | FILE_FLAG_OVERLAPPED,
                null_mut(),
            )
        };

        let mut handle = try_open(GENERIC_READ | GENERIC_WRITE);
        if handle == INVALID_HANDLE_VALUE {
            handle = try_open(GENERIC_READ);
        }
        if handle == INVALID_HANDLE_VALUE {
            return Err(HidError::Open {
                path: path.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        trace!(path = %path, "handle acquired");
        Ok(Self {
            path: path.clone(),
            handle: Arc::new(DeviceHandle {
                raw: handle,
                path: path.clone(),
            }),
        })
    }

    fn query_string(&self, kind: StringKind, max_len: usize) -> Option<String> {
        let mut wide = vec![0u16; max_len.max(1)];
        let bytes = (wide.len() * 2) as u32;
        let handle = raw(&*self.handle);
        let buf = wide.as_mut_ptr() as *mut c_void;
        let ok = unsafe {
            match kind {
                StringKind::Manufacturer => HidD_GetManufacturerString(handle, buf, bytes),
                StringKind::Product => HidD_GetProductString(handle, buf, bytes),
                StringKind::SerialNumber => HidD_GetSerialNumberString(handle, buf, bytes),
            }
        };
        if ok == 0 {
            trace!(path = %self.path, ?kind, "string query failed");
            return None;
        }
        let end = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
        Some(String::from_utf16_lossy(&wide[..end]))
    }
}

/// `HidD_GetPreparsedData` result, freed on drop.
struct PreparsedData(PHIDP_PREPARSED_DATA);

impl Drop for PreparsedData {
    fn drop(&mut self) {
        unsafe {
            HidD_FreePreparsedData(self.0);
        }
    }
}

impl HidTransport for WinHidTransport {
    fn set_input_buffers(&self, count: u32) -> Result<()> {
        if unsafe { HidD_SetNumInputBuffers(raw(&*self.handle), count) } == 0 {
            return Err(HidError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn caps(&self) -> Result<ReportCaps> {
        let mut ppd: PHIDP_PREPARSED_DATA = 0;
        if unsafe { HidD_GetPreparsedData(raw(&*self.handle), &mut ppd) } == 0 || ppd == 0 {
            return Err(HidError::Capabilities(format!(
                "no preparsed data: {}",
                io::Error::last_os_error()
            )));
        }
        let ppd = PreparsedData(ppd);

        let mut caps: HIDP_CAPS = unsafe { core::mem::zeroed() };
        let status = unsafe { HidP_GetCaps(ppd.0, &mut caps) };
        if status != HIDP_STATUS_SUCCESS {
            return Err(HidError::Capabilities(format!(
                "HidP_GetCaps status 0x{status:08x}"
            )));
        }
        Ok(ReportCaps {
            input_report_len: caps.InputReportByteLength as usize,
            output_report_len: caps.OutputReportByteLength as usize,
            usage_page: caps.UsagePage,
            usage: caps.Usage,
        })
    }

    fn attributes(&self) -> Result<Attributes> {
        let mut attrs: HIDD_ATTRIBUTES = unsafe { core::mem::zeroed() };
        attrs.Size = core::mem::size_of::<HIDD_ATTRIBUTES>() as u32;
        if unsafe { HidD_GetAttributes(raw(&*self.handle), &mut attrs) } == 0 {
            return Err(HidError::Io(io::Error::last_os_error()));
        }
        Ok(Attributes {
            vendor_id: attrs.VendorID,
            product_id: attrs.ProductID,
            version: attrs.VersionNumber,
        })
    }

    fn string(&self, kind: StringKind, max_len: usize) -> Option<String> {
        self.query_string(kind, max_len)
    }

    fn submit_read(&self, len: usize) -> Result<Box<dyn PendingIo>> {
        let op = OverlappedOp::submit(self.handle.clone(), vec![0; len], Direction::Read)?;
        Ok(Box::new(op))
    }

    fn submit_write(&self, report: Vec<u8>) -> Result<Box<dyn PendingIo>> {
        let op = OverlappedOp::submit(self.handle.clone(), report, Direction::Write)?;
        Ok(Box::new(op))
    }
}

#[derive(Clone, Copy, Debug)]
enum Direction {
    Read,
    Write,
}

/// One overlapped request. `ov` and `buf` must not move or be freed while
/// `in_flight` is set.
struct OverlappedOp {
    handle: Arc<DeviceHandle>,
    ov: Box<OVERLAPPED>,
    _event: OwnedHandle,
    buf: Vec<u8>,
    in_flight: bool,
    done: Option<usize>,
}

// The raw event handle inside `ov` is owned by `_event`; the request is only
// ever driven from one thread at a time.
unsafe impl Send for OverlappedOp {}

impl OverlappedOp {
    fn submit(handle: Arc<DeviceHandle>, mut buf: Vec<u8>, dir: Direction) -> Result<Self> {
        let event = unsafe { CreateEventW(null(), 1, 0, null()) };
        if event.is_null() {
            return Err(HidError::Event(io::Error::last_os_error()));
        }
        let event = unsafe { OwnedHandle::from_raw_handle(event as _) };

        let mut ov: Box<OVERLAPPED> = Box::new(unsafe { core::mem::zeroed() });
        ov.hEvent = raw(&event);

        let len = buf.len() as u32;
        let ok = unsafe {
            match dir {
                Direction::Read => {
                    ReadFile(raw(&*handle), buf.as_mut_ptr(), len, null_mut(), &mut *ov)
                }
                Direction::Write => {
                    WriteFile(raw(&*handle), buf.as_ptr(), len, null_mut(), &mut *ov)
                }
            }
        };
        if ok == 0 {
            let code = last_error();
            if code != ERROR_IO_PENDING {
                trace!(?dir, code, "overlapped submit failed");
                return Err(transfer_error(code));
            }
        }

        Ok(Self {
            handle,
            ov,
            _event: event,
            buf,
            in_flight: true,
            done: None,
        })
    }
}

impl PendingIo for OverlappedOp {
    fn wait(&mut self, timeout: Duration) -> Result<Completion> {
        if let Some(n) = self.done {
            return Ok(Completion::Done(n));
        }
        let millis = timeout.as_millis().min(u128::from(u32::MAX - 1)) as u32;
        match unsafe { WaitForSingleObject(self.ov.hEvent, millis) } {
            WAIT_OBJECT_0 => {
                let mut transferred = 0u32;
                let ok = unsafe {
                    GetOverlappedResult(raw(&*self.handle), &*self.ov, &mut transferred, 0)
                };
                self.in_flight = false;
                if ok == 0 {
                    return Err(transfer_error(last_error()));
                }
                let n = transferred as usize;
                self.done = Some(n);
                Ok(Completion::Done(n))
            }
            WAIT_TIMEOUT => Ok(Completion::Pending),
            _ => Err(HidError::Io(io::Error::last_os_error())),
        }
    }

    fn buffer(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for OverlappedOp {
    fn drop(&mut self) {
        if !self.in_flight {
            return;
        }
        let mut transferred = 0u32;
        unsafe {
            CancelIoEx(raw(&*self.handle), &*self.ov);
            // Block until the kernel has let go of `ov` and `buf`.
            GetOverlappedResult(raw(&*self.handle), &*self.ov, &mut transferred, 1);
        }
    }
}
