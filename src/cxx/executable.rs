use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8PathBuf;

use super::flags::{CxxFlags, CxxProvider, link_closure, push_unique};
use super::install::install_runtime;
use super::{
    absolutize, artifact_base, create_units, declare_flag_options, link_command_matches,
    option_flags, store_link_command,
};
use crate::core::BoxFuture;
use crate::error::Result;
use crate::install::{FileCopy, InstallMode, InstallSettings, copy_all};
use crate::node::{Node, NodeKind};
use crate::options::Options;
use crate::toolchain::{ArtifactKind, CommandLine, LinkLibrary, LinkRequest, ToolchainKind};

/// A linked program.
#[derive(Default)]
pub struct Executable {
    sources: Vec<String>,
    flags: CxxFlags,
    output_name: Option<String>,
    objects: Mutex<Vec<Utf8PathBuf>>,
}

impl Executable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sources<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = Some(name.into());
        self
    }

    pub fn include(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.flags.includes.push(dir.into());
        self
    }

    pub fn define(mut self, definition: impl Into<String>) -> Self {
        self.flags.definitions.push(definition.into());
        self
    }

    pub fn compile_option(mut self, option: impl Into<String>) -> Self {
        self.flags.compile_options.push(option.into());
        self
    }

    pub fn link_library(mut self, library: LinkLibrary) -> Self {
        self.flags.link_libraries.push(library);
        self
    }

    pub fn link_option(mut self, option: impl Into<String>) -> Self {
        self.flags.link_options.push(option.into());
        self
    }

    fn objects(&self) -> Vec<Utf8PathBuf> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn link_request(&self, node: &Arc<Node>) -> Option<LinkRequest> {
        let output = node.output()?;
        let own = self.own_flags(node);
        let mut libraries = link_closure(node);
        push_unique(&mut libraries, &own.link_libraries);
        Some(LinkRequest {
            objects: self.objects(),
            output,
            libraries,
            options: own.link_options,
        })
    }

    fn commands(&self, node: &Arc<Node>) -> Result<Vec<CommandLine>> {
        let toolchain = node.session().toolchain()?;
        Ok(self
            .link_request(node)
            .map(|request| toolchain.link_commands(&request))
            .unwrap_or_default())
    }
}

impl CxxProvider for Executable {
    /// Programs export nothing to their dependents.
    fn usage(&self, _node: &Node) -> CxxFlags {
        CxxFlags::default()
    }

    fn own_flags(&self, node: &Node) -> CxxFlags {
        let mut flags = self.flags.clone();
        flags.merge(&option_flags(node));
        absolutize(node, flags)
    }
}

impl NodeKind for Executable {
    fn kind(&self) -> &'static str {
        "executable"
    }

    fn declare_options(&self, options: &Options) {
        declare_flag_options(options);
    }

    fn installable(&self) -> bool {
        true
    }

    fn initialize<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let toolchain = node.session().toolchain()?.clone();
            let base = artifact_base(node, self.output_name.as_deref())?;
            let objects = create_units(node, &self.sources).await?;

            let name = toolchain.artifact_name(ArtifactKind::Executable, &base);
            node.set_output(Some(node.build_dir().join(name)));
            if toolchain.info().kind == ToolchainKind::Msvc
                && let Some(output) = node.output()
            {
                node.add_generated(output.with_extension("pdb"));
            }

            *self.objects.lock().unwrap_or_else(PoisonError::into_inner) = objects;
            Ok(())
        })
    }

    fn is_up_to_date_extra<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(link_command_matches(node, &self.commands(node)?)) })
    }

    fn build<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let invoker = node.session().invoker()?;
            let Some(request) = self.link_request(node) else {
                return Ok(());
            };
            for diagnostic in invoker.link(&request, node.build_dir()).await? {
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
            let mut copies = Vec::new();
            if let Some(output) = node.output() {
                copies.push(FileCopy::into_dir(&output, &settings.bin_dir()));
            }
            if mode == InstallMode::Portable {
                let toolchain = node.session().toolchain()?;
                let windows = toolchain.info().kind == ToolchainKind::Msvc
                    || toolchain.info().system == "windows";
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
