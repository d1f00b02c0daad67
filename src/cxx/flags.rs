//! Usage requirements and their propagation along edges.
//!
//! A node's usage requirements are what its consumers need to compile and
//! link against it. Public edges re-export the usage requirements of the
//! dependency, private edges keep them to the dependent.

use std::collections::HashSet;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::node::Node;
use crate::toolchain::LinkLibrary;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CxxFlags {
    pub includes: Vec<Utf8PathBuf>,
    pub compile_options: Vec<String>,
    pub definitions: Vec<String>,
    pub link_libraries: Vec<LinkLibrary>,
    pub link_options: Vec<String>,
}

impl CxxFlags {
    /// Appends the entries of `other` not already present.
    pub fn merge(&mut self, other: &CxxFlags) {
        push_unique(&mut self.includes, &other.includes);
        push_unique(&mut self.compile_options, &other.compile_options);
        push_unique(&mut self.definitions, &other.definitions);
        push_unique(&mut self.link_libraries, &other.link_libraries);
        push_unique(&mut self.link_options, &other.link_options);
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty()
            && self.compile_options.is_empty()
            && self.definitions.is_empty()
            && self.link_libraries.is_empty()
            && self.link_options.is_empty()
    }
}

pub(crate) fn push_unique<T: PartialEq + Clone>(dest: &mut Vec<T>, items: &[T]) {
    for item in items {
        if !dest.contains(item) {
            dest.push(item.clone());
        }
    }
}

/// Implemented by node kinds taking part in C and C++ compilation.
pub trait CxxProvider: Send + Sync {
    /// Flags exported to direct consumers.
    fn usage(&self, node: &Node) -> CxxFlags;

    /// Flags the node's own sources compile and link with, without the
    /// contributions of dependencies.
    fn own_flags(&self, node: &Node) -> CxxFlags {
        self.usage(node)
    }

    /// Artifact consumers link against.
    fn link_artifact(&self, _node: &Node) -> Option<LinkLibrary> {
        None
    }

    /// Shared libraries already carry their private dependencies.
    fn is_shared(&self, _node: &Node) -> bool {
        false
    }

    /// Files that must ship next to a consumer for it to run.
    fn runtime_files(&self, _node: &Node) -> Vec<Utf8PathBuf> {
        Vec::new()
    }
}

/// Usage requirements of `node` as seen by a direct dependent: its own usage
/// and, recursively, the usage requirements of its public dependencies.
pub fn usage_requirements(node: &Arc<Node>) -> CxxFlags {
    let mut flags = CxxFlags::default();
    collect_usage(node, &mut flags, &mut HashSet::new());
    flags
}

fn collect_usage(node: &Arc<Node>, flags: &mut CxxFlags, seen: &mut HashSet<String>) {
    if !seen.insert(node.fullname().to_string()) {
        return;
    }
    if let Some(cxx) = node.kind().as_cxx() {
        flags.merge(&cxx.usage(node));
    }
    for dep in node.public_dependency_nodes() {
        collect_usage(&dep, flags, seen);
    }
}

/// Flags `node` compiles with: its own, then the usage requirements of
/// every direct dependency.
pub fn compile_flags(node: &Arc<Node>) -> CxxFlags {
    let mut flags = node
        .kind()
        .as_cxx()
        .map(|cxx| cxx.own_flags(node))
        .unwrap_or_default();
    for dep in node.dependency_nodes() {
        flags.merge(&usage_requirements(&dep));
    }
    flags
}

/// Post-order walk of the link graph below `node`. Shared libraries only
/// expose their public dependencies.
fn link_order(node: &Arc<Node>, through_shared: bool) -> Vec<Arc<Node>> {
    fn visit(node: &Arc<Node>, through_shared: bool, seen: &mut HashSet<String>, order: &mut Vec<Arc<Node>>) {
        if !seen.insert(node.fullname().to_string()) {
            return;
        }
        let shared = node.kind().as_cxx().is_some_and(|cxx| cxx.is_shared(node));
        let deps = if shared && !through_shared {
            node.public_dependency_nodes()
        } else {
            node.dependency_nodes()
        };
        for dep in &deps {
            visit(dep, through_shared, seen, order);
        }
        order.push(node.clone());
    }

    let mut seen = HashSet::from([node.fullname().to_string()]);
    let mut order = Vec::new();
    for dep in node.dependency_nodes() {
        visit(&dep, through_shared, &mut seen, &mut order);
    }
    order.reverse();
    order
}

/// Libraries to link `node` with, every library before the libraries it
/// depends on.
pub fn link_closure(node: &Arc<Node>) -> Vec<LinkLibrary> {
    let mut libraries = Vec::new();
    for dep in link_order(node, false) {
        if let Some(cxx) = dep.kind().as_cxx() {
            push_unique(&mut libraries, cxx.link_artifact(&dep).as_slice());
            push_unique(&mut libraries, &cxx.usage(&dep).link_libraries);
        }
    }
    libraries
}

/// Files every shared library `node` loads at runtime, transitively.
pub fn runtime_closure(node: &Arc<Node>) -> Vec<Utf8PathBuf> {
    let mut files = Vec::new();
    for dep in link_order(node, true) {
        if let Some(cxx) = dep.kind().as_cxx() {
            push_unique(&mut files, &cxx.runtime_files(&dep));
        }
    }
    files
}
