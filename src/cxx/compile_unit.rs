use std::any::Any;
use std::sync::{Arc, Weak};

use camino::{Utf8Path, Utf8PathBuf};

use super::flags::compile_flags;
use crate::core::BoxFuture;
use crate::error::{Error, Result};
use crate::fs;
use crate::node::{Node, NodeKind};
use crate::toolchain::{CommandLine, CompileRequest, Language, Severity};

const COMMAND_KEY: &str = "command";
const DEPS_KEY: &str = "deps";

/// One source file compiled to one object file on behalf of a library or an
/// executable. The flags come from the owner at the time of the build.
pub struct CompileUnit {
    owner: Weak<Node>,
    source: Utf8PathBuf,
    object: Utf8PathBuf,
    language: Language,
}

impl CompileUnit {
    pub fn new(owner: &Arc<Node>, source: Utf8PathBuf, object: Utf8PathBuf) -> Self {
        Self {
            owner: Arc::downgrade(owner),
            language: Language::from_path(&source),
            source,
            object,
        }
    }

    pub fn source(&self) -> &Utf8Path {
        &self.source
    }

    pub fn object(&self) -> &Utf8Path {
        &self.object
    }

    fn owner(&self, node: &Node) -> Result<Arc<Node>> {
        self.owner
            .upgrade()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("owner of {} is gone", node.fullname())))
    }

    pub fn request(&self, node: &Node) -> Result<CompileRequest> {
        let flags = compile_flags(&self.owner(node)?);
        Ok(CompileRequest {
            source: self.source.clone(),
            object: self.object.clone(),
            language: self.language,
            includes: flags.includes,
            definitions: flags.definitions,
            options: flags.compile_options,
        })
    }

    fn command(&self, node: &Node) -> Result<CommandLine> {
        let toolchain = node.session().toolchain()?;
        Ok(toolchain.compile_command(&self.request(node)?))
    }
}

impl NodeKind for CompileUnit {
    fn kind(&self) -> &'static str {
        "compile_unit"
    }

    fn initialize<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            node.set_output(Some(self.object.clone()));
            let depfile = node.session().toolchain()?.dependency_file(&self.object);
            node.add_generated(depfile);
            Ok(())
        })
    }

    fn is_up_to_date_extra<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let command = self.command(node)?;
            if node.cached::<CommandLine>(COMMAND_KEY).as_ref() != Some(&command) {
                tracing::debug!("command line changed");
                return Ok(false);
            }

            let Some(object) = fs::mtime(&self.object).await? else {
                return Ok(false);
            };
            let headers: Vec<Utf8PathBuf> = node.cached(DEPS_KEY).unwrap_or_default();
            for header in headers {
                match fs::mtime(&header).await? {
                    Some(mtime) if mtime <= object => {}
                    Some(_) => {
                        tracing::debug!("{header} is newer");
                        return Ok(false);
                    }
                    None => {
                        tracing::debug!("{header} vanished");
                        return Ok(false);
                    }
                }
            }
            Ok(true)
        })
    }

    fn build<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let invoker = node.session().invoker()?;
            let request = self.request(node)?;
            let command = invoker.toolchain().compile_command(&request);

            let outcome = invoker.compile(&request, node.build_dir()).await?;
            for diagnostic in &outcome.diagnostics {
                if diagnostic.severity == Severity::Warning {
                    tracing::warn!("{diagnostic}");
                }
            }

            node.set_cached(COMMAND_KEY, &command)?;
            node.set_cached(DEPS_KEY, &outcome.dependencies)
        })
    }

    fn clean<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            node.remove_cached(COMMAND_KEY);
            node.remove_cached(DEPS_KEY);
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
