//! Extraction through the Windows imaging API (`wimgapi.dll`, Windows 7 or later).

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::backend::{Backend, ExtractRequest};
use crate::{ExtractError, Result};

#[cfg(windows)]
mod sys;

#[cfg(windows)]
pub use self::sys::Wimgapi;

/// Opaque handle returned by the imaging API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WimHandle(pub usize);

/// The five imaging API entry points the host backend needs.
///
/// An implementation is either complete or unavailable; there is no partial mode.
pub trait WimApi {
    fn is_available(&self) -> bool;

    /// `WIMCreateFile`, opening an existing WIM for reading
    fn create_file(&self, path: &Path) -> io::Result<WimHandle>;

    /// `WIMSetTemporaryPath`
    fn set_temporary_path(&self, wim: WimHandle, path: &Path) -> io::Result<()>;

    /// `WIMLoadImage`
    fn load_image(&self, wim: WimHandle, index: u32) -> io::Result<WimHandle>;

    /// `WIMExtractImagePath`
    fn extract_image_path(&self, image: WimHandle, src: &str, dst: &Path) -> io::Result<()>;

    /// `WIMCloseHandle`
    fn close_handle(&self, handle: WimHandle) -> io::Result<()>;
}

/// Stand-in for hosts without `wimgapi.dll`.
#[cfg(not(windows))]
#[derive(Debug, Default)]
pub struct Wimgapi;

#[cfg(not(windows))]
impl Wimgapi {
    pub fn new() -> Self {
        Self
    }

    fn unsupported<T>() -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "wimgapi.dll is only available on Windows",
        ))
    }
}

#[cfg(not(windows))]
impl WimApi for Wimgapi {
    fn is_available(&self) -> bool {
        false
    }

    fn create_file(&self, _path: &Path) -> io::Result<WimHandle> {
        Self::unsupported()
    }

    fn set_temporary_path(&self, _wim: WimHandle, _path: &Path) -> io::Result<()> {
        Self::unsupported()
    }

    fn load_image(&self, _wim: WimHandle, _index: u32) -> io::Result<WimHandle> {
        Self::unsupported()
    }

    fn extract_image_path(&self, _image: WimHandle, _src: &str, _dst: &Path) -> io::Result<()> {
        Self::unsupported()
    }

    fn close_handle(&self, _handle: WimHandle) -> io::Result<()> {
        Self::unsupported()
    }
}

/// Imaging API handle that is closed when dropped.
struct HandleGuard<'a, A: WimApi + ?Sized> {
    api: &'a A,
    handle: WimHandle,
    label: String,
    /// Report the close at info level rather than debug
    announce: bool,
}

impl<'a, A: WimApi + ?Sized> HandleGuard<'a, A> {
    fn new(api: &'a A, handle: WimHandle, label: String) -> Self {
        Self {
            api,
            handle,
            label,
            announce: false,
        }
    }

    fn announced(api: &'a A, handle: WimHandle, label: String) -> Self {
        let mut guard = Self::new(api, handle, label);
        guard.announce = true;
        guard
    }
}

impl<A: WimApi + ?Sized> Drop for HandleGuard<'_, A> {
    fn drop(&mut self) {
        if self.announce {
            info!("Closing: {}", self.label);
        } else {
            debug!("Closing: {}", self.label);
        }
        if let Err(e) = self.api.close_handle(self.handle) {
            warn!("Could not close {}: {e}", self.label);
        }
    }
}

fn host_error(call: &'static str) -> impl FnOnce(io::Error) -> ExtractError {
    move |source| ExtractError::Host { call, source }
}

pub struct HostApi<A = Wimgapi> {
    api: A,
    temp_dir: PathBuf,
}

impl<A: WimApi> HostApi<A> {
    pub fn new(api: A) -> Self {
        Self::with_temp_dir(api, std::env::temp_dir())
    }

    pub fn with_temp_dir(api: A, temp_dir: PathBuf) -> Self {
        Self { api, temp_dir }
    }
}

impl<A: WimApi> Backend for HostApi<A> {
    fn name(&self) -> &'static str {
        "wimgapi.dll"
    }

    fn probe(&self) -> bool {
        self.api.is_available()
    }

    fn extract(&self, request: &ExtractRequest<'_>) -> Result<()> {
        if !self.api.is_available() {
            return Err(ExtractError::Unavailable(self.name()));
        }

        info!(
            "Opening: {}:[{}] (API)",
            request.image.display(),
            request.index
        );

        // Guards drop in reverse order: the image before the WIM it came from.
        let wim = HandleGuard::announced(
            &self.api,
            self.api
                .create_file(request.image)
                .map_err(host_error("WIMCreateFile"))?,
            request.image.display().to_string(),
        );

        self.api
            .set_temporary_path(wim.handle, &self.temp_dir)
            .map_err(host_error("WIMSetTemporaryPath"))?;

        let image = HandleGuard::new(
            &self.api,
            self.api
                .load_image(wim.handle, request.index)
                .map_err(host_error("WIMLoadImage"))?,
            format!("{}:[{}]", request.image.display(), request.index),
        );

        info!(
            "Extracting: {} (From {})",
            request.dst.display(),
            request.src
        );
        self.api
            .extract_image_path(image.handle, request.src, request.dst)
            .map_err(host_error("WIMExtractImagePath"))?;

        Ok(())
    }
}
