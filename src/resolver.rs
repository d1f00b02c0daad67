//! Turns requirements into nodes.
//!
//! Candidates are tried in order, the first match wins:
//!
//! 1. a node of the project answering to the requirement's name,
//! 2. a package installed in the local store,
//! 3. a node of the requester scope's requirements graph,
//! 4. a recipe from one of the session's repositories, built and installed
//!    into the store on the spot.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::graph::ScopeRole;
use crate::node::{Node, RequiredPackage};
use crate::package;

pub async fn resolve(requester: &Arc<Node>, req: &RequiredPackage) -> Result<Arc<Node>> {
    let session = requester.session();

    if let Some(node) = find_local(requester, req) {
        tracing::debug!("{req}: project node {}", node.fullname());
        return Ok(node);
    }

    if session.has_toolchain()
        && let Some((prefix, manifest)) = package::find_installed(session, req).await?
    {
        tracing::debug!("{req}: installed package {} {}", manifest.name, manifest.version);
        return package::installed_node(session, prefix, manifest);
    }

    if let Some(node) = requester
        .scope()
        .requirements_graph()
        .and_then(|graph| graph.find_provider(req))
    {
        tracing::debug!("{req}: requirement {}", node.fullname());
        return Ok(node);
    }

    if session.has_toolchain() {
        for repository in session.repositories() {
            if req.repository.as_deref().is_some_and(|name| name != repository.name()) {
                continue;
            }
            let Some(recipe) = repository.find(req).await? else {
                continue;
            };
            tracing::info!("{req}: building {} {} from {}", recipe.name(), recipe.version(), repository.name());
            let node = package::build_node(session, recipe)?;
            // Dependents compile against the installed manifest.
            node.build().await?;
            return Ok(node);
        }
    }

    Err(Error::PackageNotFound(req.to_string()))
}

/// A live project node providing `req`, other than the requester and nodes
/// that already depend on it.
fn find_local(requester: &Arc<Node>, req: &RequiredPackage) -> Option<Arc<Node>> {
    requester.session().nodes().into_iter().find(|node| {
        node.scope().role() == ScopeRole::Project
            && !node.is_external()
            && node.kind().kind() != "compile_unit"
            && !Arc::ptr_eq(node, requester)
            && node.answers_to(&req.name)
            && req.accepts(node.version().as_ref())
            && !reaches(node, requester)
    })
}

/// Whether `to` is reachable from `from` through resolved edges.
fn reaches(from: &Arc<Node>, to: &Arc<Node>) -> bool {
    let mut seen = HashSet::new();
    let mut stack = from.dependency_nodes();
    while let Some(node) = stack.pop() {
        if Arc::ptr_eq(&node, to) {
            tracing::debug!("{} depends on {}, not a candidate", from.fullname(), to.fullname());
            return true;
        }
        if seen.insert(node.fullname().to_string()) {
            stack.extend(node.dependency_nodes());
        }
    }
    false
}
