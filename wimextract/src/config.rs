use std::path::PathBuf;

use crate::backend::ExtractRequest;

/// Environment variable naming the archiver executable to use, ahead of any host lookup.
pub const ARCHIVER_ENV: &str = "WIMEXTRACT_7Z";

/// Extraction settings. The archiver checks for the requested file name by default,
/// not the fixed `bootmgfw.efi` of older releases (see [`ExpectedOutput`]).
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Archiver executable, used instead of looking one up on the host
    pub archiver: Option<PathBuf>,
    pub expected_output: ExpectedOutput,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            archiver: std::env::var_os(ARCHIVER_ENV)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
            ..Default::default()
        }
    }
}

/// Name of the file the archiver is expected to leave in the destination directory.
///
/// The default checks for the file that was actually requested. Older releases always
/// looked for `bootmgfw.efi` whatever was asked for; [`ExpectedOutput::legacy`] restores that.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExpectedOutput {
    /// The last component of the requested source path
    #[default]
    SourceName,
    /// Always this name, whatever was requested
    Fixed(String),
}

impl ExpectedOutput {
    /// The file name older releases always looked for.
    pub fn legacy() -> Self {
        ExpectedOutput::Fixed("bootmgfw.efi".to_owned())
    }

    pub fn file_name<'a>(&'a self, request: &ExtractRequest<'a>) -> &'a str {
        match self {
            ExpectedOutput::SourceName => request.source_name(),
            ExpectedOutput::Fixed(name) => name.as_str(),
        }
    }
}
