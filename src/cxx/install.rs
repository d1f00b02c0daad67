//! Runtime dependency discovery for portable installs.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use super::flags::{compile_flags, link_closure, push_unique, runtime_closure};
use crate::error::Result;
use crate::fs;
use crate::install::{FileCopy, InstallSettings};
use crate::node::Node;
use crate::toolchain::{ArtifactKind, LinkLibrary};

const SYSTEM_DIRS: &[&str] = &[
    "/lib",
    "/lib64",
    "/usr/lib",
    "/usr/lib64",
    "/usr/local/lib",
    "/System",
    "C:/Windows",
    "C:\\Windows",
];

fn is_system_dir(dir: &Utf8Path) -> bool {
    SYSTEM_DIRS.iter().any(|system| dir.starts_with(system))
}

/// Looks for a file called `file_name` in `dirs`, skipping system
/// directories.
pub async fn find_shared_library(file_name: &str, dirs: &[Utf8PathBuf]) -> Option<Utf8PathBuf> {
    for dir in dirs.iter().filter(|dir| !is_system_dir(dir)) {
        let candidate = dir.join(file_name);
        if fs::is_file(&candidate).await {
            return Some(candidate);
        }
    }
    None
}

fn env_dirs(variable: &str) -> Vec<Utf8PathBuf> {
    std::env::var_os(variable)
        .map(|value| {
            std::env::split_paths(&value)
                .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Shared libraries `node` needs at runtime: those built in the graph, and
/// those linked by name that live outside of the system directories.
pub async fn runtime_dependencies(node: &Arc<Node>) -> Result<Vec<Utf8PathBuf>> {
    let mut files = runtime_closure(node);

    let toolchain = node.session().toolchain()?;
    let flags = compile_flags(node);
    let mut libraries = link_closure(node);
    push_unique(&mut libraries, &flags.link_libraries);

    let mut search: Vec<Utf8PathBuf> = flags
        .link_options
        .iter()
        .filter_map(|option| option.strip_prefix("-L").or_else(|| option.strip_prefix("/LIBPATH:")))
        .map(Utf8PathBuf::from)
        .collect();
    search.extend(env_dirs("LD_LIBRARY_PATH"));
    search.extend(env_dirs("PATH"));

    for library in libraries {
        let LinkLibrary::Name { name, dir } = library else {
            continue;
        };
        let file_name = toolchain.artifact_name(ArtifactKind::SharedLibrary, &name);
        let dirs: Vec<Utf8PathBuf> = dir.into_iter().chain(search.iter().cloned()).collect();
        match find_shared_library(&file_name, &dirs).await {
            Some(found) => push_unique(&mut files, &[found]),
            None => tracing::debug!("{file_name} not found, assumed to be a system library"),
        }
    }
    Ok(files)
}

/// Copies of the runtime dependencies of `node` next to its binaries.
pub(super) async fn install_runtime(
    node: &Arc<Node>,
    settings: &InstallSettings,
    windows: bool,
) -> Result<Vec<FileCopy>> {
    let dir = if windows { settings.bin_dir() } else { settings.lib_dir() };
    let mut copies = Vec::new();
    for file in runtime_dependencies(node).await? {
        if fs::exists(&file).await {
            copies.push(FileCopy::into_dir(&file, &dir));
        } else {
            tracing::warn!("runtime dependency {file} is missing");
        }
    }
    Ok(copies)
}

/// Copies of every file below the public include directories, keeping their
/// layout relative to the directory they were found in.
pub(super) async fn install_headers(includes: &[Utf8PathBuf], dest: &Utf8Path) -> Result<Vec<FileCopy>> {
    let mut copies = Vec::new();
    for include in includes {
        for file in fs::walk(include).await? {
            if let Ok(relative) = file.strip_prefix(include) {
                copies.push(FileCopy::new(file.clone(), dest.join(relative)));
            }
        }
    }
    Ok(copies)
}
