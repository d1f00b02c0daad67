//! Compiler family abstraction.
//!
//! A [`Toolchain`] turns abstract compile, link and archive requests into
//! vendor-specific command lines and knows how to read the compiler's
//! dependency sidecar files and diagnostics. The [`Invoker`] runs those
//! command lines and turns failures into structured errors.

pub mod detect;
pub mod diagnostics;
mod invoker;
mod msvc;
mod unix;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::version::Version;

pub use self::diagnostics::{Diagnostic, Severity};
pub use self::invoker::{CompileCommand, CompileOutcome, Invoker};
pub use self::msvc::MsvcToolchain;
pub use self::unix::UnixToolchain;

/// A full argument vector, program first.
pub type CommandLine = Vec<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildType {
    #[default]
    Debug,
    Release,
    ReleaseMinSize,
    ReleaseDebugInfos,
}

impl BuildType {
    pub fn is_debug_mode(self) -> bool {
        matches!(self, BuildType::Debug)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildType::Debug => "debug",
            BuildType::Release => "release",
            BuildType::ReleaseMinSize => "release_min_size",
            BuildType::ReleaseDebugInfos => "release_debug_infos",
        }
    }
}

impl fmt::Display for BuildType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(BuildType::Debug),
            "release" => Ok(BuildType::Release),
            "release_min_size" => Ok(BuildType::ReleaseMinSize),
            "release_debug_infos" => Ok(BuildType::ReleaseDebugInfos),
            other => Err(ConfigError::InvalidBuildType(other.to_string())),
        }
    }
}

/// How the language runtime is linked into produced binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    Static,
    #[default]
    Dynamic,
}

impl FromStr for RuntimeType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(RuntimeType::Static),
            "dynamic" => Ok(RuntimeType::Dynamic),
            other => Err(ConfigError::InvalidRuntime(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolchainKind {
    Unix,
    Msvc,
}

impl FromStr for ToolchainKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unix" | "gcc" | "clang" => Ok(ToolchainKind::Unix),
            "msvc" => Ok(ToolchainKind::Msvc),
            other => Err(ConfigError::UnknownToolchainType(other.to_string())),
        }
    }
}

impl fmt::Display for ToolchainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ToolchainKind::Unix => "unix",
            ToolchainKind::Msvc => "msvc",
        })
    }
}

/// Build-wide flags layered on top of every command a toolchain generates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainSettings {
    pub build_type: BuildType,
    pub runtime: RuntimeType,
    pub compile_flags: Vec<String>,
    pub cxx_flags: Vec<String>,
    pub link_flags: Vec<String>,
    pub position_independent_code: bool,
}

/// A persisted toolchain description, one entry of the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolchainData {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub system: String,
    pub tools: BTreeMap<String, Utf8PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Named map of known toolchains with one designated default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolchainRegistry {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub toolchains: BTreeMap<String, ToolchainData>,
}

impl ToolchainRegistry {
    /// Loads the registry, an absent file yields an empty registry.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Registers `data` under `name`. The first toolchain added becomes the
    /// default.
    pub fn add(&mut self, name: impl Into<String>, data: ToolchainData) {
        let name = name.into();
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.toolchains.insert(name, data);
    }

    /// Looks up `name`, or the default toolchain when `name` is `None`.
    pub fn get(&self, name: Option<&str>) -> Result<(&str, &ToolchainData), ConfigError> {
        let name = match name.or(self.default.as_deref()) {
            Some(name) => name,
            None => return Err(ConfigError::NoToolchain),
        };

        self.toolchains
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| ConfigError::UnknownToolchain(name.to_string()))
    }

    /// Instantiates the toolchain `name` (or the default one).
    pub fn create(
        &self,
        name: Option<&str>,
        settings: &ToolchainSettings,
    ) -> Result<Arc<dyn Toolchain>, ConfigError> {
        let (name, data) = self.get(name)?;
        create(name, data, settings)
    }
}

/// Resolved, immutable description of a toolchain.
#[derive(Debug, Clone)]
pub struct ToolchainInfo {
    pub name: String,
    pub kind: ToolchainKind,
    pub vendor: String,
    pub version: Option<Version>,
    pub arch: String,
    pub system: String,
    pub tools: BTreeMap<String, Utf8PathBuf>,
    pub env: BTreeMap<String, String>,
    pub settings: ToolchainSettings,
}

impl ToolchainInfo {
    pub fn build_type(&self) -> BuildType {
        self.settings.build_type
    }

    pub fn tool(&self, name: &str) -> Option<&Utf8Path> {
        self.tools.get(name).map(Utf8PathBuf::as_path)
    }

    fn require(&self, name: &str) -> Result<Utf8PathBuf, ConfigError> {
        self.tool(name)
            .map(Utf8Path::to_owned)
            .ok_or_else(|| ConfigError::MissingTool {
                toolchain: self.name.clone(),
                tool: name.to_string(),
            })
    }
}

/// Instantiates the strategy matching `data.kind`.
pub fn create(
    name: &str,
    data: &ToolchainData,
    settings: &ToolchainSettings,
) -> Result<Arc<dyn Toolchain>, ConfigError> {
    let kind = data.kind.parse::<ToolchainKind>()?;
    let info = ToolchainInfo {
        name: name.to_string(),
        kind,
        vendor: data.vendor.clone(),
        version: Version::parse(&data.version).ok(),
        arch: data.arch.clone(),
        system: data.system.clone(),
        tools: data.tools.clone(),
        env: data.env.clone(),
        settings: settings.clone(),
    };

    Ok(match kind {
        ToolchainKind::Unix => Arc::new(UnixToolchain::new(info)?),
        ToolchainKind::Msvc => Arc::new(MsvcToolchain::new(info)?),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    C,
    Cxx,
}

impl Language {
    pub fn from_path(path: &Utf8Path) -> Self {
        match path.extension() {
            Some("c") => Language::C,
            _ => Language::Cxx,
        }
    }
}

/// Something a binary links against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkLibrary {
    /// A concrete artifact, passed to the linker as-is.
    Path(Utf8PathBuf),
    /// A library looked up by the linker, optionally in `dir`.
    Name {
        name: String,
        #[serde(default)]
        dir: Option<Utf8PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Object,
    StaticLibrary,
    SharedLibrary,
    /// Library dependents link against when using a shared library.
    ImportLibrary,
    Executable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    pub source: Utf8PathBuf,
    pub object: Utf8PathBuf,
    pub language: Language,
    pub includes: Vec<Utf8PathBuf>,
    pub definitions: Vec<String>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    pub objects: Vec<Utf8PathBuf>,
    pub output: Utf8PathBuf,
    pub libraries: Vec<LinkLibrary>,
    pub options: Vec<String>,
}

/// Per compiler family command synthesis.
pub trait Toolchain: Send + Sync + fmt::Debug {
    fn info(&self) -> &ToolchainInfo;

    /// File name of an artifact called `name`.
    fn artifact_name(&self, kind: ArtifactKind, name: &str) -> String;

    fn compile_command(&self, request: &CompileRequest) -> CommandLine;

    fn link_commands(&self, request: &LinkRequest) -> Vec<CommandLine>;

    fn static_lib_commands(&self, objects: &[Utf8PathBuf], output: &Utf8Path) -> Vec<CommandLine>;

    fn shared_lib_commands(&self, request: &LinkRequest) -> Vec<CommandLine>;

    /// Sidecar file the compiler writes the header closure of `object` to.
    fn dependency_file(&self, object: &Utf8Path) -> Utf8PathBuf;

    /// Extracts the header closure from the sidecar file contents. The
    /// object and the source itself are not part of the result.
    fn parse_dependencies(
        &self,
        object: &Utf8Path,
        source: &Utf8Path,
        contents: &str,
    ) -> Vec<Utf8PathBuf>;

    fn parse_compile_output(&self, output: &str) -> Vec<Diagnostic>;

    /// Diagnostics and undefined symbols from linker output.
    fn parse_link_output(&self, output: &str) -> (Vec<Diagnostic>, Vec<String>);

    /// Preprocessor definitions toggled around a shared library: the first is
    /// set while building it, the second is exported to its consumers.
    fn export_definitions(&self, _name: &str) -> Option<(String, String)> {
        None
    }

    /// Library dependents link against for a shared library at `output`.
    fn import_library(&self, output: &Utf8Path) -> Utf8PathBuf {
        output.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ToolchainRegistry {
        let mut registry = ToolchainRegistry::default();
        registry.add(
            "gcc",
            ToolchainData {
                kind: "gcc".into(),
                tools: [("cc".to_string(), "/usr/bin/gcc".into()), ("ar".to_string(), "/usr/bin/ar".into())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
        );
        registry.add(
            "weird",
            ToolchainData {
                kind: "borland".into(),
                ..Default::default()
            },
        );
        registry
    }

    #[test]
    fn test_registry_default() {
        let registry = registry();
        let (name, data) = registry.get(None).unwrap();
        assert_eq!(name, "gcc");
        assert_eq!(data.kind, "gcc");
        assert!(matches!(
            registry.get(Some("nope")),
            Err(ConfigError::UnknownToolchain(_))
        ));
        assert!(matches!(
            ToolchainRegistry::default().get(None),
            Err(ConfigError::NoToolchain)
        ));
    }

    #[test]
    fn test_unknown_toolchain_type() {
        let err = registry()
            .create(Some("weird"), &ToolchainSettings::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownToolchainType(t) if t == "borland"));
    }

    #[test]
    fn test_registry_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("toolchains.json")).unwrap();

        registry().save(&path).unwrap();
        let loaded = ToolchainRegistry::load(&path).unwrap();
        assert_eq!(loaded.default.as_deref(), Some("gcc"));
        assert_eq!(loaded.toolchains.len(), 2);

        let missing = ToolchainRegistry::load(&path.with_file_name("absent.json")).unwrap();
        assert!(missing.toolchains.is_empty());
    }

    #[test]
    fn test_build_type_parse() {
        assert_eq!("release_min_size".parse::<BuildType>().unwrap(), BuildType::ReleaseMinSize);
        assert!(matches!(
            "fast".parse::<BuildType>(),
            Err(ConfigError::InvalidBuildType(_))
        ));
        assert!(BuildType::Debug.is_debug_mode());
    }
}
