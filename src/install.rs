//! Install layout and the file copy step shared by every installable node.

use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::engine::TaskGroup;
use crate::error::{ConfigError, Result};
use crate::fs;

/// Which artifact classes get installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    /// Executables and shared libraries.
    #[default]
    User,
    /// Also static libraries, import libraries and headers.
    Dev,
    /// Like `User`, plus the shared libraries needed at runtime.
    Portable,
}

impl fmt::Display for InstallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstallMode::User => "user",
            InstallMode::Dev => "dev",
            InstallMode::Portable => "portable",
        })
    }
}

impl FromStr for InstallMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(InstallMode::User),
            "dev" => Ok(InstallMode::Dev),
            "portable" => Ok(InstallMode::Portable),
            other => Err(ConfigError::InvalidOptionValue {
                option: "install.mode".into(),
                value: other.into(),
                reason: "expected one of user, dev, portable".into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallSettings {
    pub destination: Utf8PathBuf,
    pub bin: Utf8PathBuf,
    pub lib: Utf8PathBuf,
    pub include: Utf8PathBuf,
    pub share: Utf8PathBuf,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            destination: Utf8PathBuf::from("install"),
            bin: "bin".into(),
            lib: "lib".into(),
            include: "include".into(),
            share: "share".into(),
        }
    }
}

impl InstallSettings {
    pub fn new(destination: impl Into<Utf8PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn bin_dir(&self) -> Utf8PathBuf {
        self.destination.join(&self.bin)
    }

    pub fn lib_dir(&self) -> Utf8PathBuf {
        self.destination.join(&self.lib)
    }

    pub fn include_dir(&self) -> Utf8PathBuf {
        self.destination.join(&self.include)
    }

    pub fn share_dir(&self) -> Utf8PathBuf {
        self.destination.join(&self.share)
    }
}

/// A pending copy of `source` to `destination`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCopy {
    pub source: Utf8PathBuf,
    pub destination: Utf8PathBuf,
}

impl FileCopy {
    pub fn new(source: impl Into<Utf8PathBuf>, destination: impl Into<Utf8PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// Copies `source` into the directory `dir`, keeping its file name.
    pub fn into_dir(source: &Utf8Path, dir: &Utf8Path) -> Self {
        let name = source.file_name().unwrap_or(source.as_str());
        Self::new(source, dir.join(name))
    }
}

async fn is_installed(copy: &FileCopy) -> Result<bool> {
    let (Some(src), Some(dest)) = (
        fs::mtime(&copy.source).await?,
        fs::mtime(&copy.destination).await?,
    ) else {
        return Ok(false);
    };
    Ok(dest >= src)
}

/// Performs every copy concurrently, skipping destinations that are already
/// up to date. Returns every destination path, copied or not.
pub async fn copy_all(copies: Vec<FileCopy>) -> Result<Vec<Utf8PathBuf>> {
    let mut group = TaskGroup::new("install");

    for copy in copies {
        group.spawn(async move {
            if is_installed(&copy).await? {
                tracing::debug!("{} is up-to-date", copy.destination);
            } else {
                tracing::info!("installing {}", copy.destination);
                fs::copy(&copy.source, &copy.destination).await?;
            }
            Ok(copy.destination)
        });
    }

    let mut installed = group.join().await?;
    installed.sort();
    installed.dedup();
    Ok(installed)
}
