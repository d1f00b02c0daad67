#![forbid(unsafe_code)]
//! Incremental build orchestration for C and C++ projects.
//!
//! A build is described as a [`Graph`] of [`Node`]s living in a [`Scope`]
//! of a [`Session`]. Every node goes through three memoized phases,
//! preload, initialize and build, each at most once per session, and is
//! only rebuilt when its inputs, options or command lines changed since
//! the last successful build recorded in the session cache.
//!
//! Requirements such as `"fmt >= 10"` are resolved against the project
//! first, then the local package store, then the package repositories
//! registered on the session.

mod cache;
pub mod config;
mod core;
pub mod cxx;
pub mod engine;
mod error;
pub mod fs;
mod graph;
mod install;
mod lock;
#[cfg(feature = "logging")]
pub mod logging;
mod node;
mod options;
pub mod package;
pub mod process;
mod resolver;
pub mod testing;
pub mod toolchain;
mod version;

#[cfg(test)]
mod testutil;

pub use crate::cache::{Cache, CacheScope};
pub use crate::config::Settings;
pub use crate::core::{BoxFuture, Fingerprint, Hash32};
pub use crate::error::*;
pub use crate::graph::{
    BuildReport, Graph, NodeReport, NodeStatus, Scope, ScopeRole, Session, SessionBuilder,
};
pub use crate::install::{FileCopy, InstallMode, InstallSettings, copy_all};
pub use crate::lock::{FileLock, LockError};
pub use crate::node::{
    Action, BuildStatus, Dependency, FileDependency, Node, NodeKind, Phase, RequiredPackage,
    Visibility,
};
pub use crate::options::{AssignOp, OptionValue, Options};
pub use crate::resolver::resolve;
pub use crate::version::{Operator, Version, VersionSpec};
