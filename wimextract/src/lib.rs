//! Pull a single file out of a WIM image, using whichever extraction method the host has.
//!
//! Two backends are tried in order: an installed 7-Zip ([`SevenZip`]), which is the
//! faster of the two, then the Windows imaging API ([`HostApi`]). What the host
//! supports is probed once, on first use, and kept for the life of the [`Extractor`].

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

pub mod backend;
pub mod config;
pub mod sevenzip;
#[cfg(windows)]
mod win32;
pub mod wimgapi;

pub use backend::{Backend, ExtractRequest};
pub use config::{Config, ExpectedOutput};
pub use sevenzip::{ArchiverLocator, HostArchiverLocator, SevenZip};
pub use wimgapi::{HostApi, WimApi, WimHandle, Wimgapi};

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Invalid extraction request: {0}")]
    InvalidRequest(&'static str),
    #[error("{0} is not available on this host")]
    Unavailable(&'static str),
    #[error("{call} failed: {source}")]
    Host {
        call: &'static str,
        source: std::io::Error,
    },
    #[error("Could not launch {}: {source}", .exe.display())]
    Launch {
        exe: PathBuf,
        source: std::io::Error,
    },
    #[error("{} exited with {status}: {stderr}", .exe.display())]
    ArchiverExit {
        exe: PathBuf,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("Could not remove previous output {}: {source}", .path.display())]
    StaleOutput {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Archiver did not extract {}", .0.display())]
    MissingOutput(PathBuf),
    #[error("Could not rename {} to {}: {source}", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[error("No WIM extraction method is available")]
    NoBackend,
    #[error("Every WIM extraction method failed")]
    AllBackendsFailed,
}

pub type Result<T> = std::result::Result<T, ExtractError>;

/// Which backends passed their probe, in preference order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    backends: Vec<(&'static str, bool)>,
}

impl Capabilities {
    fn probe(backends: &[Box<dyn Backend>]) -> Self {
        let capabilities = Self {
            backends: backends
                .iter()
                .map(|backend| (backend.name(), backend.probe()))
                .collect(),
        };
        info!("WIM extraction method(s) supported: {capabilities}");
        capabilities
    }

    pub fn any(&self) -> bool {
        self.backends.iter().any(|(_, usable)| *usable)
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.backends
            .iter()
            .any(|(backend, usable)| *usable && *backend == name)
    }

    pub fn available(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.backends
            .iter()
            .filter(|(_, usable)| *usable)
            .map(|(name, _)| *name)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.any() {
            return f.write_str("NONE");
        }
        for (i, name) in self.available().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(name)?;
        }
        Ok(())
    }
}

pub struct Extractor {
    backends: Vec<Box<dyn Backend>>,
    capabilities: Option<Capabilities>,
    on_complete: Option<Box<dyn FnMut()>>,
}

impl Extractor {
    /// Backends are tried in the order given.
    pub fn new(backends: Vec<Box<dyn Backend>>) -> Self {
        Self {
            backends,
            capabilities: None,
            on_complete: None,
        }
    }

    /// 7-Zip first, then the Windows imaging API.
    pub fn with_config(config: &Config) -> Self {
        let backends: Vec<Box<dyn Backend>> = vec![
            Box::new(SevenZip::new(
                HostArchiverLocator::new(config.archiver.clone()),
                config.expected_output.clone(),
            )),
            Box::new(HostApi::new(Wimgapi::new())),
        ];
        Self::new(backends)
    }

    /// Called once after every successful extraction.
    pub fn on_complete(mut self, hook: impl FnMut() + 'static) -> Self {
        self.on_complete = Some(Box::new(hook));
        self
    }

    /// What this host supports, probed on first call.
    pub fn capabilities(&mut self) -> &Capabilities {
        self.capabilities
            .get_or_insert_with(|| Capabilities::probe(&self.backends))
    }

    /// Probes the host again, replacing the cached capabilities.
    pub fn reprobe(&mut self) -> &Capabilities {
        self.capabilities.insert(Capabilities::probe(&self.backends))
    }

    /// Extracts `src` from image `index` of the WIM at `image` to `dst`.
    ///
    /// Each available backend is tried in turn until one succeeds. Backend errors are
    /// logged; the caller only learns that nothing worked.
    pub fn extract(&mut self, image: &Path, index: u32, src: &str, dst: &Path) -> Result<()> {
        let request = ExtractRequest {
            image,
            index,
            src,
            dst,
        };
        request.validate()?;

        if !self.capabilities().any() {
            return Err(ExtractError::NoBackend);
        }

        let capabilities = self
            .capabilities
            .as_ref()
            .ok_or(ExtractError::NoBackend)?;
        for (backend, (_, usable)) in self.backends.iter().zip(&capabilities.backends) {
            if !usable {
                continue;
            }
            match backend.extract(&request) {
                Ok(()) => {
                    if let Some(hook) = self.on_complete.as_mut() {
                        hook();
                    }
                    return Ok(());
                }
                Err(e) => warn!("{} extraction failed: {e}", backend.name()),
            }
        }

        Err(ExtractError::AllBackendsFailed)
    }
}
