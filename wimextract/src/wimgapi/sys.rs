use std::cell::OnceCell;
use std::ffi::c_void;
use std::io;
use std::path::Path;

use tracing::debug;
use windows::Win32::Foundation::{FreeLibrary, HMODULE};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};
use windows::core::{s, w};

use super::{WimApi, WimHandle};
use crate::win32::to_wide;

const WIM_GENERIC_READ: u32 = 0x8000_0000;
const WIM_OPEN_EXISTING: u32 = 3;

type WimCreateFileFn =
    unsafe extern "system" fn(*const u16, u32, u32, u32, u32, *mut u32) -> *mut c_void;
type WimSetTemporaryPathFn = unsafe extern "system" fn(*mut c_void, *const u16) -> i32;
type WimLoadImageFn = unsafe extern "system" fn(*mut c_void, u32) -> *mut c_void;
type WimExtractImagePathFn =
    unsafe extern "system" fn(*mut c_void, *const u16, *const u16, u32) -> i32;
type WimCloseHandleFn = unsafe extern "system" fn(*mut c_void) -> i32;

struct EntryPoints {
    module: HMODULE,
    create_file: WimCreateFileFn,
    set_temporary_path: WimSetTemporaryPathFn,
    load_image: WimLoadImageFn,
    extract_image_path: WimExtractImagePathFn,
    close_handle: WimCloseHandleFn,
}

impl EntryPoints {
    /// Loads `wimgapi.dll` and resolves every entry point, or none at all.
    unsafe fn load() -> Option<Self> {
        unsafe {
            let module = LoadLibraryW(w!("wimgapi.dll")).ok()?;

            let create_file = GetProcAddress(module, s!("WIMCreateFile"));
            let set_temporary_path = GetProcAddress(module, s!("WIMSetTemporaryPath"));
            let load_image = GetProcAddress(module, s!("WIMLoadImage"));
            let extract_image_path = GetProcAddress(module, s!("WIMExtractImagePath"));
            let close_handle = GetProcAddress(module, s!("WIMCloseHandle"));

            match (
                create_file,
                set_temporary_path,
                load_image,
                extract_image_path,
                close_handle,
            ) {
                (Some(create), Some(temp), Some(load), Some(extract), Some(close)) => Some(Self {
                    module,
                    create_file: std::mem::transmute::<_, WimCreateFileFn>(create),
                    set_temporary_path: std::mem::transmute::<_, WimSetTemporaryPathFn>(temp),
                    load_image: std::mem::transmute::<_, WimLoadImageFn>(load),
                    extract_image_path: std::mem::transmute::<_, WimExtractImagePathFn>(extract),
                    close_handle: std::mem::transmute::<_, WimCloseHandleFn>(close),
                }),
                _ => {
                    debug!("wimgapi.dll is missing an entry point");
                    let _ = FreeLibrary(module);
                    None
                }
            }
        }
    }
}

impl Drop for EntryPoints {
    fn drop(&mut self) {
        unsafe {
            let _ = FreeLibrary(self.module);
        }
    }
}

/// `wimgapi.dll`, resolved on first use.
#[derive(Default)]
pub struct Wimgapi {
    entry_points: OnceCell<Option<EntryPoints>>,
}

impl Wimgapi {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_points(&self) -> io::Result<&EntryPoints> {
        self.entry_points
            .get_or_init(|| unsafe { EntryPoints::load() })
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "wimgapi.dll is not usable"))
    }
}

fn check(ok: i32) -> io::Result<()> {
    if ok != 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn handle(raw: *mut c_void) -> io::Result<WimHandle> {
    if raw.is_null() {
        Err(io::Error::last_os_error())
    } else {
        Ok(WimHandle(raw as usize))
    }
}

impl WimApi for Wimgapi {
    fn is_available(&self) -> bool {
        self.entry_points().is_ok()
    }

    fn create_file(&self, path: &Path) -> io::Result<WimHandle> {
        let api = self.entry_points()?;
        let path = to_wide(path);
        let mut creation_result = 0u32;
        handle(unsafe {
            (api.create_file)(
                path.as_ptr(),
                WIM_GENERIC_READ,
                WIM_OPEN_EXISTING,
                0,
                0,
                &mut creation_result,
            )
        })
    }

    fn set_temporary_path(&self, wim: WimHandle, path: &Path) -> io::Result<()> {
        let api = self.entry_points()?;
        let path = to_wide(path);
        check(unsafe { (api.set_temporary_path)(wim.0 as *mut c_void, path.as_ptr()) })
    }

    fn load_image(&self, wim: WimHandle, index: u32) -> io::Result<WimHandle> {
        let api = self.entry_points()?;
        handle(unsafe { (api.load_image)(wim.0 as *mut c_void, index) })
    }

    fn extract_image_path(&self, image: WimHandle, src: &str, dst: &Path) -> io::Result<()> {
        let api = self.entry_points()?;
        let src = to_wide(src);
        let dst = to_wide(dst);
        check(unsafe {
            (api.extract_image_path)(image.0 as *mut c_void, src.as_ptr(), dst.as_ptr(), 0)
        })
    }

    fn close_handle(&self, handle: WimHandle) -> io::Result<()> {
        let api = self.entry_points()?;
        check(unsafe { (api.close_handle)(handle.0 as *mut c_void) })
    }
}
