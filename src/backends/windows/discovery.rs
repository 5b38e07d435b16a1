//! HID interface enumeration via SetupAPI.
//!
//! Lists every present device interface of the HID class and returns its
//! interface path. Nothing is opened here; filtering on attributes happens
//! when the registry opens each path.

use crate::error::{HidError, Result};
use crate::metadata::DevicePath;
use std::io;
use std::ptr::{null, null_mut};
use tracing::{debug, trace};
use windows_sys::core::GUID;
use windows_sys::Win32::Devices::DeviceAndDriverInstallation::{
    SetupDiDestroyDeviceInfoList, SetupDiEnumDeviceInterfaces, SetupDiGetClassDevsW,
    SetupDiGetDeviceInterfaceDetailW, DIGCF_DEVICEINTERFACE, DIGCF_PRESENT, HDEVINFO,
    SP_DEVICE_INTERFACE_DATA, SP_DEVICE_INTERFACE_DETAIL_DATA_W,
};
use windows_sys::Win32::Devices::HumanInterfaceDevice::HidD_GetHidGuid;
use windows_sys::Win32::Foundation::{GetLastError, ERROR_NO_MORE_ITEMS};

/// The HID device interface class GUID.
pub(crate) fn hid_class_guid() -> GUID {
    let mut guid: GUID = unsafe { core::mem::zeroed() };
    unsafe { HidD_GetHidGuid(&mut guid) };
    guid
}

/// Device information set, destroyed on drop.
struct InfoSet(HDEVINFO);

impl Drop for InfoSet {
    fn drop(&mut self) {
        unsafe {
            SetupDiDestroyDeviceInfoList(self.0);
        }
    }
}

/// Interface paths of every HID device currently present.
pub fn interface_paths() -> Result<Vec<DevicePath>> {
    let guid = hid_class_guid();
    let set = unsafe {
        SetupDiGetClassDevsW(
            &guid,
            null(),
            null_mut(),
            DIGCF_PRESENT | DIGCF_DEVICEINTERFACE,
        )
    };
    if set as isize == -1 {
        return Err(HidError::Io(io::Error::last_os_error()));
    }
    let set = InfoSet(set);

    let mut paths = Vec::new();
    for index in 0u32.. {
        let mut iface: SP_DEVICE_INTERFACE_DATA = unsafe { core::mem::zeroed() };
        iface.cbSize = core::mem::size_of::<SP_DEVICE_INTERFACE_DATA>() as u32;
        let ok = unsafe { SetupDiEnumDeviceInterfaces(set.0, null(), &guid, index, &mut iface) };
        if ok == 0 {
            let code = unsafe { GetLastError() };
            if code != ERROR_NO_MORE_ITEMS {
                debug!(index, code, "interface enumeration stopped early");
            }
            break;
        }
        match interface_path(&set, &iface) {
            Some(path) => paths.push(path),
            None => trace!(index, "interface without a readable path"),
        }
    }
    Ok(paths)
}

fn interface_path(set: &InfoSet, iface: &SP_DEVICE_INTERFACE_DATA) -> Option<DevicePath> {
    let mut required = 0u32;
    unsafe {
        SetupDiGetDeviceInterfaceDetailW(set.0, iface, null_mut(), 0, &mut required, null_mut());
    }
    if (required as usize) < core::mem::size_of::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>() {
        return None;
    }

    // u32 storage keeps the detail struct aligned.
    let mut storage = vec![0u32; (required as usize).div_ceil(4)];
    let detail = storage.as_mut_ptr() as *mut SP_DEVICE_INTERFACE_DETAIL_DATA_W;
    unsafe {
        (*detail).cbSize = core::mem::size_of::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>() as u32;
    }
    let ok = unsafe {
        SetupDiGetDeviceInterfaceDetailW(set.0, iface, detail, required, null_mut(), null_mut())
    };
    if ok == 0 {
        return None;
    }

    let name_offset = core::mem::offset_of!(SP_DEVICE_INTERFACE_DETAIL_DATA_W, DevicePath);
    let max_chars = (required as usize).saturating_sub(name_offset) / 2;
    let name = unsafe {
        let start = (storage.as_ptr() as *const u8).add(name_offset) as *const u16;
        std::slice::from_raw_parts(start, max_chars)
    };
    let end = name.iter().position(|&c| c == 0).unwrap_or(name.len());
    if end == 0 {
        return None;
    }
    Some(DevicePath::new(String::from_utf16_lossy(&name[..end])))
}
