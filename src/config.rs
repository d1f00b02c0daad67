//! Persisted build directory configuration.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::install::InstallSettings;
use crate::toolchain::{BuildType, RuntimeType, ToolchainSettings};

/// File name of the settings document inside a build directory.
pub const SETTINGS_FILE: &str = "kiln.config.json";

/// File name of the toolchain registry inside a build directory.
pub const TOOLCHAINS_FILE: &str = "toolchains.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub source_path: Utf8PathBuf,
    pub build_path: Utf8PathBuf,
    /// Registry name of the toolchain, the registry default when unset.
    pub toolchain: Option<String>,
    pub build_type: BuildType,
    pub runtime: RuntimeType,
    /// Cap on concurrently running external processes.
    pub jobs: usize,
    pub install: InstallSettings,
    pub target: ToolchainSettings,
    /// Root of the local package store, `<build>/pkgs` when unset.
    pub packages_path: Option<Utf8PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            source_path: Utf8PathBuf::from("."),
            build_path: Utf8PathBuf::from("build"),
            toolchain: None,
            build_type: BuildType::default(),
            runtime: RuntimeType::default(),
            jobs: default_jobs(),
            install: InstallSettings::default(),
            target: ToolchainSettings::default(),
            packages_path: None,
        }
    }
}

/// Parses a settings document, reporting unknown enum values as
/// configuration errors rather than generic decoding failures.
fn parse_settings(text: &str) -> Result<Settings> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if let Some(name) = value.get("build_type").and_then(serde_json::Value::as_str) {
        name.parse::<BuildType>()?;
    }
    if let Some(name) = value.get("runtime").and_then(serde_json::Value::as_str) {
        name.parse::<RuntimeType>()?;
    }
    Ok(serde_json::from_value(value)?)
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

impl Settings {
    pub fn new(source_path: impl Into<Utf8PathBuf>, build_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            build_path: build_path.into(),
            ..Default::default()
        }
    }

    /// Loads `<build_path>/kiln.config.json`, falling back to defaults for
    /// a fresh build directory.
    pub fn load(build_path: &Utf8Path) -> Result<Self> {
        let path = build_path.join(SETTINGS_FILE);
        let mut settings: Settings = match std::fs::read_to_string(&path) {
            Ok(text) => parse_settings(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no settings at {path}, using defaults");
                Settings::default()
            }
            Err(e) => return Err(e.into()),
        };
        settings.build_path = build_path.to_owned();
        Ok(settings)
    }

    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.build_path)?;
        let path = self.build_path.join(SETTINGS_FILE);
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn packages_path(&self) -> Utf8PathBuf {
        self.packages_path
            .clone()
            .unwrap_or_else(|| self.build_path.join("pkgs"))
    }

    pub fn toolchains_path(&self) -> Utf8PathBuf {
        self.build_path.join(TOOLCHAINS_FILE)
    }

    /// Target flags with the build type and runtime of these settings.
    pub fn toolchain_settings(&self) -> ToolchainSettings {
        ToolchainSettings {
            build_type: self.build_type,
            runtime: self.runtime,
            ..self.target.clone()
        }
    }

    pub fn jobs(&self) -> usize {
        self.jobs.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testutil::utf8_tempdir;

    #[test]
    fn test_roundtrip_through_build_dir() {
        let (_dir, root) = utf8_tempdir();
        let mut settings = Settings::new(root.join("src"), root.join("build"));
        settings.build_type = BuildType::Release;
        settings.target.compile_flags = vec!["-Wall".into()];
        settings.save().unwrap();

        let loaded = Settings::load(&root.join("build")).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.packages_path(), root.join("build/pkgs"));

        let target = loaded.toolchain_settings();
        assert_eq!(target.build_type, BuildType::Release);
        assert_eq!(target.compile_flags, ["-Wall"]);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let (_dir, root) = utf8_tempdir();
        let settings = Settings::load(&root).unwrap();
        assert_eq!(settings.build_path, root);
        assert!(settings.jobs() >= 1);
    }

    #[test]
    fn test_invalid_build_type_is_rejected() {
        let (_dir, root) = utf8_tempdir();
        std::fs::write(root.join(SETTINGS_FILE), r#"{"build_type": "fastest"}"#).unwrap();
        let err = Settings::load(&root).unwrap_err();
        assert!(
            matches!(&err, Error::Config(ConfigError::InvalidBuildType(name)) if name == "fastest"),
            "{err:?}"
        );
    }

    #[test]
    fn test_invalid_runtime_is_rejected() {
        let (_dir, root) = utf8_tempdir();
        std::fs::write(root.join(SETTINGS_FILE), r#"{"runtime": "shared"}"#).unwrap();
        let err = Settings::load(&root).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::InvalidRuntime(_))), "{err:?}");
    }

    #[test]
    fn test_malformed_document_is_a_decoding_error() {
        let (_dir, root) = utf8_tempdir();
        std::fs::write(root.join(SETTINGS_FILE), "{ not json").unwrap();
        assert!(matches!(Settings::load(&root), Err(Error::Json(_))));
    }
}
