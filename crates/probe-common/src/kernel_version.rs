//! Kernel version detection, used to pick load-time constants for the
//! kernel-side programs.

use std::{fmt, fs, io};

use thiserror::Error;

const OSRELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelVersion {
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
}

#[derive(Error, Debug)]
pub enum KernelVersionError {
    #[error("reading {OSRELEASE_PATH}")]
    ReadRelease(#[from] io::Error),
    #[error("unexpected kernel release format `{0}`")]
    Format(String),
}

impl KernelVersion {
    pub fn autodetect() -> Result<Self, KernelVersionError> {
        let release = fs::read_to_string(OSRELEASE_PATH)?;
        Self::parse(release.trim())
    }

    /// Parse a kernel release string like `6.1.0-13-amd64`.
    /// Distribution suffixes after `-` or `+` are ignored.
    pub fn parse(release: &str) -> Result<Self, KernelVersionError> {
        let version = release.split(['-', '+']).next().unwrap_or(release);
        let mut parts = version.split('.').map(|part| part.parse::<i32>().ok());
        match (parts.next().flatten(), parts.next().flatten(), parts.next()) {
            (Some(major), Some(minor), patch) => Ok(Self {
                major,
                minor,
                patch: patch.flatten().unwrap_or(0),
            }),
            _ => Err(KernelVersionError::Format(release.to_string())),
        }
    }

    pub fn as_i32(&self) -> i32 {
        self.major * 65536 + self.minor * 256 + self.patch.min(255)
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
