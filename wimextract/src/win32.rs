use std::ffi::{OsStr, OsString, c_void};
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use windows::Win32::Foundation::ERROR_SUCCESS;
use windows::Win32::System::Registry::{HKEY, RRF_RT_REG_SZ, RegGetValueW};
use windows::core::PCWSTR;

/// Convert a string to null-terminated UTF-16.
pub(crate) fn to_wide(s: impl AsRef<OsStr>) -> Vec<u16> {
    s.as_ref().encode_wide().chain(std::iter::once(0)).collect()
}

/// Read a `REG_SZ` value, or `None` if the key or value is missing.
pub(crate) fn registry_string(hive: HKEY, subkey: &str, value: &str) -> Option<PathBuf> {
    let subkey = to_wide(subkey);
    let value = to_wide(value);
    let mut size: u32 = 0;

    unsafe {
        let status = RegGetValueW(
            hive,
            PCWSTR(subkey.as_ptr()),
            PCWSTR(value.as_ptr()),
            RRF_RT_REG_SZ,
            None,
            None,
            Some(&mut size as *mut u32),
        );
        if status != ERROR_SUCCESS || size == 0 {
            return None;
        }

        let mut buf = vec![0u16; (size as usize).div_ceil(2)];
        let status = RegGetValueW(
            hive,
            PCWSTR(subkey.as_ptr()),
            PCWSTR(value.as_ptr()),
            RRF_RT_REG_SZ,
            None,
            Some(buf.as_mut_ptr() as *mut c_void),
            Some(&mut size as *mut u32),
        );
        if status != ERROR_SUCCESS {
            return None;
        }

        let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
        Some(PathBuf::from(OsString::from_wide(&buf[..len])))
    }
}
