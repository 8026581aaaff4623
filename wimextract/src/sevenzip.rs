//! Extraction through an installed 7-Zip, which is faster than the Windows imaging API.

use std::cell::OnceCell;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info, warn};

use crate::backend::{Backend, ExtractRequest};
use crate::config::ExpectedOutput;
use crate::{ExtractError, Result};

/// Finds the archiver executable on this host.
pub trait ArchiverLocator {
    fn locate(&self) -> Option<PathBuf>;
}

impl<F: Fn() -> Option<PathBuf>> ArchiverLocator for F {
    fn locate(&self) -> Option<PathBuf> {
        self()
    }
}

/// Looks for 7-Zip where it gets installed: the install path recorded in the
/// registry on Windows, `PATH` elsewhere. An explicit path wins over both.
#[derive(Debug, Clone, Default)]
pub struct HostArchiverLocator {
    explicit: Option<PathBuf>,
}

impl HostArchiverLocator {
    pub fn new(explicit: Option<PathBuf>) -> Self {
        Self { explicit }
    }
}

impl ArchiverLocator for HostArchiverLocator {
    fn locate(&self) -> Option<PathBuf> {
        if let Some(path) = &self.explicit {
            if path.is_file() {
                return Some(path.clone());
            }
            warn!("Configured archiver {} does not exist", path.display());
        }

        let found = host_candidates().into_iter().find(|path| path.is_file());
        debug!("7-Zip executable: {found:?}");
        found
    }
}

#[cfg(windows)]
fn host_candidates() -> Vec<PathBuf> {
    use windows::Win32::System::Registry::{HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE};

    [HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE]
        .into_iter()
        .filter_map(|hive| crate::win32::registry_string(hive, r"Software\7-Zip", "Path"))
        .map(|dir| dir.join("7z.exe"))
        .collect()
}

#[cfg(not(windows))]
fn host_candidates() -> Vec<PathBuf> {
    let Some(search_path) = std::env::var_os("PATH") else {
        return Vec::new();
    };
    let dirs: Vec<PathBuf> = std::env::split_paths(&search_path).collect();
    ["7z", "7za"]
        .into_iter()
        .flat_map(|name| dirs.iter().map(move |dir| dir.join(name)))
        .collect()
}

pub struct SevenZip<L = HostArchiverLocator> {
    locator: L,
    expected_output: ExpectedOutput,
    executable: OnceCell<Option<PathBuf>>,
}

impl<L: ArchiverLocator> SevenZip<L> {
    pub fn new(locator: L, expected_output: ExpectedOutput) -> Self {
        Self {
            locator,
            expected_output,
            executable: OnceCell::new(),
        }
    }

    /// The archiver executable, looked up once.
    pub fn executable(&self) -> Option<&Path> {
        self.executable
            .get_or_init(|| self.locator.locate())
            .as_deref()
    }

    fn command(exe: &Path, request: &ExtractRequest<'_>) -> Command {
        // The archiver runs inside the destination directory
        let image = std::path::absolute(request.image)
            .unwrap_or_else(|_| request.image.to_path_buf());

        let mut command = Command::new(exe);
        command
            .args(["-y", "e"])
            .arg(image)
            .arg(format!("{}\\{}", request.index, request.src))
            .current_dir(request.destination_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        command
    }
}

impl<L: ArchiverLocator> Backend for SevenZip<L> {
    fn name(&self) -> &'static str {
        "7z"
    }

    fn probe(&self) -> bool {
        self.executable().is_some()
    }

    fn extract(&self, request: &ExtractRequest<'_>) -> Result<()> {
        let exe = self
            .executable()
            .ok_or(ExtractError::Unavailable(self.name()))?;

        info!(
            "Opening: {}:[{}] (7-Zip)",
            request.image.display(),
            request.index
        );
        info!(
            "Extracting: {} (From {})",
            request.dst.display(),
            request.src
        );

        // Only output written by this run counts
        let extracted = request
            .destination_dir()
            .join(self.expected_output.file_name(request));
        match std::fs::remove_file(&extracted) {
            Ok(()) => debug!("Removed previous {}", extracted.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ExtractError::StaleOutput {
                    path: extracted,
                    source,
                });
            }
        }

        let output = Self::command(exe, request)
            .output()
            .map_err(|source| ExtractError::Launch {
                exe: exe.to_path_buf(),
                source,
            })?;
        if !output.status.success() {
            return Err(ExtractError::ArchiverExit {
                exe: exe.to_path_buf(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        if !extracted.is_file() {
            return Err(ExtractError::MissingOutput(extracted));
        }

        std::fs::rename(&extracted, request.dst).map_err(|source| ExtractError::Rename {
            from: extracted.clone(),
            to: request.dst.to_path_buf(),
            source,
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlocated_archiver_is_unavailable() {
        let backend = SevenZip::new(|| None::<PathBuf>, ExpectedOutput::SourceName);
        assert!(!backend.probe());

        let request = ExtractRequest {
            image: Path::new("boot.wim"),
            index: 1,
            src: "bootmgfw.efi",
            dst: Path::new("bootx64.efi"),
        };
        assert!(matches!(
            backend.extract(&request),
            Err(ExtractError::Unavailable("7z"))
        ));
    }

    #[test]
    fn locator_runs_once() {
        let calls = std::cell::Cell::new(0);
        let backend = SevenZip::new(
            || {
                calls.set(calls.get() + 1);
                Some(PathBuf::from("/opt/7z"))
            },
            ExpectedOutput::SourceName,
        );
        assert!(backend.probe());
        assert!(backend.probe());
        assert_eq!(backend.executable(), Some(Path::new("/opt/7z")));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn missing_explicit_archiver_falls_through() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope").join("7z");
        let located = HostArchiverLocator::new(Some(missing.clone())).locate();
        assert_ne!(located, Some(missing));
    }

    /// Stand-in archiver: writes the last component of its final argument into the
    /// working directory, unless that name starts with `missing`.
    #[cfg(unix)]
    fn fake_archiver(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake7z");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             [ \"$1\" = \"-y\" ] && [ \"$2\" = \"e\" ] || exit 7\n\
             name=$(printf '%s' \"$4\" | sed 's/.*\\\\//')\n\
             case \"$name\" in missing*) exit 2 ;; esac\n\
             printf '%s' \"$3\" > \"$name\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[test]
    fn extracts_with_external_archiver() {
        let dir = tempfile::TempDir::new().unwrap();
        let exe = fake_archiver(dir.path());
        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();

        let backend = SevenZip::new(HostArchiverLocator::new(Some(exe)), ExpectedOutput::SourceName);
        assert!(backend.probe());

        let dst = out.join("bootx64.efi");
        let request = ExtractRequest {
            image: Path::new("sources/boot.wim"),
            index: 2,
            src: r"Windows\Boot\EFI\bootmgfw.efi",
            dst: &dst,
        };
        backend.extract(&request).unwrap();
        let image = std::fs::read_to_string(&dst).unwrap();
        assert!(Path::new(&image).is_absolute());
        assert!(image.ends_with("sources/boot.wim"));
        assert!(!out.join("bootmgfw.efi").exists());

        let request = ExtractRequest {
            src: r"Windows\missing.efi",
            ..request
        };
        assert!(matches!(
            backend.extract(&request),
            Err(ExtractError::ArchiverExit { status, .. }) if status.code() == Some(2)
        ));

        // The legacy check looks for bootmgfw.efi whatever was asked for
        let legacy = SevenZip::new(
            HostArchiverLocator::new(Some(dir.path().join("fake7z"))),
            ExpectedOutput::legacy(),
        );
        std::fs::write(out.join("bootmgfw.efi"), "stale").unwrap();
        let request = ExtractRequest {
            src: r"Windows\Boot\EFI\bootmgr.efi",
            ..request
        };
        assert!(matches!(
            legacy.extract(&request),
            Err(ExtractError::MissingOutput(path)) if path == out.join("bootmgfw.efi")
        ));
    }

    #[cfg(unix)]
    #[test]
    fn failed_run_does_not_reuse_previous_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let exe = fake_archiver(dir.path());
        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let stale = out.join("missing.efi");
        std::fs::write(&stale, "left over from an earlier run").unwrap();

        let backend = SevenZip::new(HostArchiverLocator::new(Some(exe)), ExpectedOutput::SourceName);
        let dst = out.join("bootx64.efi");
        let request = ExtractRequest {
            image: Path::new("sources/boot.wim"),
            index: 1,
            src: r"Windows\Boot\EFI\missing.efi",
            dst: &dst,
        };

        assert!(backend.extract(&request).is_err());
        assert!(!dst.exists());
        assert!(!stale.exists());
    }
}
