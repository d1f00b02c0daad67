use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use super::flags::{CxxFlags, CxxProvider, link_closure, push_unique};
use super::install::{install_headers, install_runtime};
use super::{
    absolutize, artifact_base, create_units, declare_flag_options, link_command_matches,
    option_flags, store_link_command,
};
use crate::core::BoxFuture;
use crate::error::{ConfigError, Result};
use crate::install::{FileCopy, InstallMode, InstallSettings, copy_all};
use crate::node::{Node, NodeKind};
use crate::options::Options;
use crate::toolchain::{ArtifactKind, CommandLine, LinkLibrary, LinkRequest, Toolchain, ToolchainKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryType {
    /// `Interface` without sources, `Static` otherwise.
    #[default]
    Auto,
    Static,
    Shared,
    /// Headers and usage requirements only, no artifact.
    Interface,
}

impl fmt::Display for LibraryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LibraryType::Auto => "auto",
            LibraryType::Static => "static",
            LibraryType::Shared => "shared",
            LibraryType::Interface => "interface",
        })
    }
}

impl FromStr for LibraryType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(LibraryType::Auto),
            "static" => Ok(LibraryType::Static),
            "shared" => Ok(LibraryType::Shared),
            "interface" | "header_only" => Ok(LibraryType::Interface),
            other => Err(ConfigError::InvalidOptionValue {
                option: "type".into(),
                value: other.into(),
                reason: "expected one of auto, static, shared, interface".into(),
            }),
        }
    }
}

#[derive(Default)]
struct Resolved {
    kind: Option<LibraryType>,
    objects: Vec<Utf8PathBuf>,
}

/// A static, shared or interface library.
///
/// Flags are split in public ones, exported to every consumer, and private
/// ones, used for the library's own sources only. The type can be
/// overridden with the `type` option.
#[derive(Default)]
pub struct Library {
    sources: Vec<String>,
    public: CxxFlags,
    private: CxxFlags,
    output_name: Option<String>,
    library_type: LibraryType,
    resolved: Mutex<Resolved>,
}

impl Library {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds source glob patterns, relative to the scope's source directory.
    pub fn sources<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn library_type(mut self, library_type: LibraryType) -> Self {
        self.library_type = library_type;
        self
    }

    pub fn output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = Some(name.into());
        self
    }

    pub fn include(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.public.includes.push(dir.into());
        self
    }

    pub fn private_include(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.private.includes.push(dir.into());
        self
    }

    pub fn define(mut self, definition: impl Into<String>) -> Self {
        self.public.definitions.push(definition.into());
        self
    }

    pub fn private_define(mut self, definition: impl Into<String>) -> Self {
        self.private.definitions.push(definition.into());
        self
    }

    pub fn compile_option(mut self, option: impl Into<String>) -> Self {
        self.private.compile_options.push(option.into());
        self
    }

    pub fn link_library(mut self, library: LinkLibrary) -> Self {
        self.public.link_libraries.push(library);
        self
    }

    pub fn private_link_library(mut self, library: LinkLibrary) -> Self {
        self.private.link_libraries.push(library);
        self
    }

    pub fn link_option(mut self, option: impl Into<String>) -> Self {
        self.private.link_options.push(option.into());
        self
    }

    fn resolved(&self) -> std::sync::MutexGuard<'_, Resolved> {
        self.resolved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The effective type, known once the node is initialized.
    pub fn kind_of(&self) -> Option<LibraryType> {
        self.resolved().kind
    }

    fn configured_type(&self, node: &Node) -> Result<LibraryType> {
        match node.options().get("type").as_ref().and_then(|v| v.as_str()) {
            Some(text) => Ok(text.parse()?),
            None => Ok(self.library_type),
        }
    }

    fn is_windows(toolchain: &dyn Toolchain) -> bool {
        toolchain.info().kind == ToolchainKind::Msvc || toolchain.info().system == "windows"
    }

    fn export_macros(&self, node: &Node) -> Option<(String, String)> {
        if self.kind_of() != Some(LibraryType::Shared) {
            return None;
        }
        let toolchain = node.session().toolchain().ok()?;
        toolchain.export_definitions(node.name())
    }

    fn link_request(&self, node: &Arc<Node>, output: Utf8PathBuf) -> LinkRequest {
        let own = self.own_flags(node);
        let mut libraries = link_closure(node);
        push_unique(&mut libraries, &own.link_libraries);
        LinkRequest {
            objects: self.resolved().objects.clone(),
            output,
            libraries,
            options: own.link_options,
        }
    }

    fn commands(&self, node: &Arc<Node>) -> Result<Vec<CommandLine>> {
        let toolchain = node.session().toolchain()?;
        let Some(output) = node.output() else {
            return Ok(Vec::new());
        };
        Ok(match self.kind_of() {
            Some(LibraryType::Static) => {
                toolchain.static_lib_commands(&self.resolved().objects, &output)
            }
            Some(LibraryType::Shared) => toolchain.shared_lib_commands(&self.link_request(node, output)),
            _ => Vec::new(),
        })
    }
}

impl CxxProvider for Library {
    fn usage(&self, node: &Node) -> CxxFlags {
        let mut flags = self.public.clone();
        if self.kind_of() == Some(LibraryType::Static) {
            // Archives do not record what they link against.
            push_unique(&mut flags.link_libraries, &self.private.link_libraries);
        }
        if let Some((_, import)) = self.export_macros(node) {
            flags.definitions.push(import);
        }
        absolutize(node, flags)
    }

    fn own_flags(&self, node: &Node) -> CxxFlags {
        let mut flags = self.public.clone();
        flags.merge(&self.private);
        flags.merge(&option_flags(node));
        if let Some((export, _)) = self.export_macros(node) {
            flags.definitions.push(export);
        }
        if self.kind_of() == Some(LibraryType::Shared)
            && let Ok(toolchain) = node.session().toolchain()
            && !Self::is_windows(toolchain.as_ref())
        {
            push_unique(&mut flags.compile_options, &["-fPIC".to_string()]);
        }
        absolutize(node, flags)
    }

    fn link_artifact(&self, node: &Node) -> Option<LinkLibrary> {
        let output = node.output()?;
        match self.kind_of()? {
            LibraryType::Static => Some(LinkLibrary::Path(output)),
            LibraryType::Shared => {
                let toolchain = node.session().toolchain().ok()?;
                Some(LinkLibrary::Path(toolchain.import_library(&output)))
            }
            LibraryType::Auto | LibraryType::Interface => None,
        }
    }

    fn is_shared(&self, _node: &Node) -> bool {
        self.kind_of() == Some(LibraryType::Shared)
    }

    fn runtime_files(&self, node: &Node) -> Vec<Utf8PathBuf> {
        match self.kind_of() {
            Some(LibraryType::Shared) => node.output().into_iter().collect(),
            _ => Vec::new(),
        }
    }
}

impl NodeKind for Library {
    fn kind(&self) -> &'static str {
        "library"
    }

    fn declare_options(&self, options: &Options) {
        options.add("type", self.library_type.to_string().as_str(), "auto, static, shared or interface");
        declare_flag_options(options);
    }

    fn installable(&self) -> bool {
        true
    }

    fn initialize<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let toolchain = node.session().toolchain()?.clone();
            let configured = self.configured_type(node)?;
            let base = artifact_base(node, self.output_name.as_deref())?;

            let objects = create_units(node, &self.sources).await?;
            let kind = match configured {
                LibraryType::Auto if objects.is_empty() => LibraryType::Interface,
                LibraryType::Auto => LibraryType::Static,
                other => other,
            };
            if kind == LibraryType::Interface && !objects.is_empty() {
                tracing::warn!("sources of interface library {} are not compiled", node.fullname());
            }

            let output = match kind {
                LibraryType::Static => Some(toolchain.artifact_name(ArtifactKind::StaticLibrary, &base)),
                LibraryType::Shared => Some(toolchain.artifact_name(ArtifactKind::SharedLibrary, &base)),
                LibraryType::Auto | LibraryType::Interface => None,
            };
            node.set_output(output.map(|name| node.build_dir().join(name)));
            if kind == LibraryType::Shared
                && let Some(output) = node.output()
            {
                let import = toolchain.import_library(&output);
                if import != output {
                    node.add_generated(import);
                }
            }

            let mut resolved = self.resolved();
            resolved.kind = Some(kind);
            resolved.objects = objects;
            tracing::debug!("{} is a {kind} library", node.fullname());
            Ok(())
        })
    }

    fn is_up_to_date_extra<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(link_command_matches(node, &self.commands(node)?)) })
    }

    fn build<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let invoker = node.session().invoker()?;
            let cwd = node.build_dir();

            let diagnostics = match (self.kind_of(), node.output()) {
                (Some(LibraryType::Static), Some(output)) => {
                    let objects = self.resolved().objects.clone();
                    invoker.static_lib(&objects, &output, cwd).await?
                }
                (Some(LibraryType::Shared), Some(output)) => {
                    invoker.shared_lib(&self.link_request(node, output), cwd).await?
                }
                _ => Vec::new(),
            };
            for diagnostic in diagnostics {
                tracing::warn!("{diagnostic}");
            }

            store_link_command(node, &self.commands(node)?)
        })
    }

    fn install<'a>(
        &'a self,
        node: &'a Arc<Node>,
        settings: &'a InstallSettings,
        mode: InstallMode,
    ) -> BoxFuture<'a, Result<Vec<Utf8PathBuf>>> {
        Box::pin(async move {
            let toolchain = node.session().toolchain()?.clone();
            let windows = Self::is_windows(toolchain.as_ref());
            let mut copies = Vec::new();

            match (self.kind_of(), node.output()) {
                (Some(LibraryType::Shared), Some(output)) => {
                    let dir = if windows { settings.bin_dir() } else { settings.lib_dir() };
                    copies.push(FileCopy::into_dir(&output, &dir));
                    let import = toolchain.import_library(&output);
                    if mode == InstallMode::Dev && import != output {
                        copies.push(FileCopy::into_dir(&import, &settings.lib_dir()));
                    }
                }
                (Some(LibraryType::Static), Some(output)) if mode == InstallMode::Dev => {
                    copies.push(FileCopy::into_dir(&output, &settings.lib_dir()));
                }
                _ => {}
            }

            if mode == InstallMode::Dev {
                let includes = absolutize(node, self.public.clone()).includes;
                copies.extend(install_headers(&includes, &settings.include_dir()).await?);
            }
            if mode == InstallMode::Portable {
                copies.extend(install_runtime(node, settings, windows).await?);
            }

            copy_all(copies).await
        })
    }

    fn as_cxx(&self) -> Option<&dyn CxxProvider> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
