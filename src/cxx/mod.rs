//! C and C++ build units: compile units, libraries and executables.

mod compile_unit;
mod executable;
mod flags;
mod install;
mod library;

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{ConfigError, Result};
use crate::fs;
use crate::node::{FileDependency, Node, Visibility};
use crate::options::Options;
use crate::toolchain::{ArtifactKind, CommandLine, LinkLibrary};

pub use self::compile_unit::CompileUnit;
pub use self::executable::Executable;
pub use self::flags::{
    CxxFlags, CxxProvider, compile_flags, link_closure, runtime_closure, usage_requirements,
};
pub use self::install::{find_shared_library, runtime_dependencies};
pub use self::library::{Library, LibraryType};

const LINK_KEY: &str = "link_command";

fn declare_flag_options(options: &Options) {
    options.add("definitions", Vec::<String>::new(), "extra preprocessor definitions");
    options.add("compile_options", Vec::<String>::new(), "extra compiler options");
    options.add("link_options", Vec::<String>::new(), "extra linker options");
}

fn list_option(node: &Node, name: &str) -> Vec<String> {
    node.options()
        .get(name)
        .and_then(|value| value.as_list().map(<[String]>::to_vec))
        .unwrap_or_default()
}

/// Flags set through the node's options.
fn option_flags(node: &Node) -> CxxFlags {
    CxxFlags {
        definitions: list_option(node, "definitions"),
        compile_options: list_option(node, "compile_options"),
        link_options: list_option(node, "link_options"),
        ..Default::default()
    }
}

/// Resolves relative include directories and library paths against the
/// node's source directory.
fn absolutize(node: &Node, mut flags: CxxFlags) -> CxxFlags {
    let base = node.scope().source_path();
    let resolve = |path: &Utf8Path| {
        if path.is_absolute() {
            path.to_owned()
        } else {
            base.join(path)
        }
    };

    flags.includes = flags.includes.iter().map(|p| resolve(p)).collect();
    flags.link_libraries = flags
        .link_libraries
        .into_iter()
        .map(|lib| match lib {
            LinkLibrary::Path(path) => LinkLibrary::Path(resolve(&path)),
            LinkLibrary::Name { name, dir } => LinkLibrary::Name {
                name,
                dir: dir.map(|d| resolve(&d)),
            },
        })
        .collect();
    flags
}

/// Base name of the node's artifact, checked for path separators.
fn artifact_base(node: &Node, output_name: Option<&str>) -> Result<String> {
    let name = output_name.unwrap_or(node.name());
    if name.is_empty() || name.contains(['/', '\\']) {
        return Err(ConfigError::InvalidOutput {
            node: node.fullname().to_string(),
            output: name.to_string(),
        }
        .into());
    }
    Ok(name.to_string())
}

/// Expands `patterns` and declares one compile unit per source as a private
/// dependency of `node`. Returns the object files, in source order.
async fn create_units(node: &Arc<Node>, patterns: &[String]) -> Result<Vec<Utf8PathBuf>> {
    let toolchain = node.session().toolchain()?.clone();
    let source_dir = node.scope().source_path().to_owned();
    let object_dir = node.build_dir().join(format!("{}.dir", node.fullname()));

    let sources = fs::glob(&source_dir, patterns).await?;
    if sources.is_empty() && !patterns.is_empty() {
        tracing::warn!("{}: no source matches {}", node.fullname(), patterns.join(", "));
    }

    let mut objects = Vec::with_capacity(sources.len());
    for source in sources {
        let relative = source
            .strip_prefix(&source_dir)
            .map(Utf8Path::to_owned)
            .unwrap_or_else(|_| Utf8PathBuf::from(source.file_name().unwrap_or(source.as_str())));
        let stem = relative.with_extension("");
        let object = object_dir.join(toolchain.artifact_name(ArtifactKind::Object, stem.as_str()));

        let unit = node.child(
            relative.as_str(),
            CompileUnit::new(node, source.clone(), object.clone()),
        )?;
        unit.set_output(Some(object.clone()));
        unit.depends_on(FileDependency::new(source), Visibility::Private);
        node.depends_on(&unit, Visibility::Private);
        objects.push(object);
    }
    Ok(objects)
}

fn link_command_matches(node: &Node, commands: &[CommandLine]) -> bool {
    let cached: Option<Vec<CommandLine>> = node.cached(LINK_KEY);
    if cached.as_deref() == Some(commands) {
        true
    } else {
        tracing::debug!("link command changed");
        false
    }
}

fn store_link_command(node: &Node, commands: &[CommandLine]) -> Result<()> {
    node.set_cached(LINK_KEY, &commands)
}

#[cfg(test)]
mod tests;
