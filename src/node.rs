//! Graph vertices and their phased lifecycle.
//!
//! A [`Node`] goes through `preload`, `initialize` and `build`, each run at
//! most once per session and shared by every caller through a [`Memo`].
//! `install` is memoized per destination and mode, `clean` resets the build
//! state so that a later `build` in the same session runs again.
//!
//! What a node actually does is supplied by its [`NodeKind`]; the node takes
//! care of ordering, concurrency, the up-to-date decision and bookkeeping.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::Instrument;

use crate::core::{BoxFuture, Fingerprint, Hash32};
use crate::cxx::CxxProvider;
use crate::engine::{Memo, MemoMap, TaskGroup};
use crate::error::{ConfigError, Error, Result};
use crate::fs;
use crate::graph::{Scope, Session};
use crate::install::{InstallMode, InstallSettings};
use crate::options::Options;
use crate::resolver;
use crate::version::{Version, VersionSpec};

/// Cache key of the option fingerprint recorded after a successful build.
const FINGERPRINT_KEY: &str = "fingerprint";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    New,
    Preloading,
    Preloaded,
    Initializing,
    Initialized,
    Building,
    Built,
    Failed,
    Installing,
    Installed,
    Cleaning,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Phase::New => "new",
            Phase::Preloading => "preloading",
            Phase::Preloaded => "preloaded",
            Phase::Initializing => "initializing",
            Phase::Initialized => "initialized",
            Phase::Building => "building",
            Phase::Built => "built",
            Phase::Failed => "failed",
            Phase::Installing => "installing",
            Phase::Installed => "installed",
            Phase::Cleaning => "cleaning",
        };
        f.write_str(text)
    }
}

/// Whether a dependency's usage requirements are re-exported to dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    Public,
    Private,
}

/// Outcome of a successful `build`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    UpToDate,
    Built,
}

/// A plain file standing in as a leaf dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDependency {
    path: Utf8PathBuf,
}

impl FileDependency {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub async fn is_up_to_date(&self) -> bool {
        fs::exists(&self.path).await
    }

    pub async fn mtime(&self) -> Result<Option<SystemTime>> {
        fs::mtime(&self.path).await
    }
}

/// A named, optionally versioned reference to a package that has not been
/// resolved to a node yet.
///
/// The textual form is `[<package>:]<name>[@<repository>] [<op> <version>]`,
/// for instance `boost:filesystem@conan >= 1.80`.
#[derive(Debug, Clone, PartialEq)]
pub struct RequiredPackage {
    pub name: String,
    pub package: Option<String>,
    pub repository: Option<String>,
    pub spec: Option<VersionSpec>,
}

impl RequiredPackage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            package: None,
            repository: None,
            spec: None,
        }
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let text = text.trim();
        let invalid = || ConfigError::InvalidRequirement(text.to_string());

        let split = text
            .find(|c: char| c.is_whitespace() || matches!(c, '=' | '<' | '>'))
            .unwrap_or(text.len());
        let (ident, constraint) = text.split_at(split);

        let spec = match constraint.trim() {
            "" => None,
            constraint => Some(VersionSpec::parse(constraint)?),
        };

        let (ident, repository) = match ident.split_once('@') {
            Some((ident, repo)) if !repo.is_empty() => (ident, Some(repo.to_string())),
            Some(_) => return Err(invalid()),
            None => (ident, None),
        };
        let (package, name) = match ident.split_once(':') {
            Some((package, name)) if !package.is_empty() => (Some(package.to_string()), name),
            Some(_) => return Err(invalid()),
            None => (None, ident),
        };
        if name.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            name: name.to_string(),
            package,
            repository,
            spec,
        })
    }

    /// Name of the package providing the requirement.
    pub fn package_name(&self) -> &str {
        self.package.as_deref().unwrap_or(&self.name)
    }

    /// Unversioned candidates satisfy any constraint.
    pub fn accepts(&self, version: Option<&Version>) -> bool {
        match (&self.spec, version) {
            (Some(spec), Some(version)) => spec.matches(version),
            _ => true,
        }
    }
}

impl fmt::Display for RequiredPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(package) = &self.package {
            write!(f, "{package}:")?;
        }
        f.write_str(&self.name)?;
        if let Some(repository) = &self.repository {
            write!(f, "@{repository}")?;
        }
        if let Some(spec) = &self.spec {
            write!(f, " {spec}")?;
        }
        Ok(())
    }
}

/// An edge target. Requirements are replaced by the node they resolve to
/// during `preload`, so no unresolved edge ever reaches `build`.
#[derive(Clone)]
pub enum Dependency {
    Node(Arc<Node>),
    File(FileDependency),
    Required(RequiredPackage),
}

impl Dependency {
    pub fn as_node(&self) -> Option<&Arc<Node>> {
        match self {
            Dependency::Node(node) => Some(node),
            _ => None,
        }
    }

    fn skipped(&self, call: &str) {
        if let Dependency::Required(req) = self {
            tracing::debug!("call to {call} on {req} skipped (unresolved)");
        }
    }

    pub async fn is_up_to_date(&self) -> Result<bool> {
        match self {
            Dependency::Node(node) => node.is_up_to_date().await,
            Dependency::File(file) => Ok(file.is_up_to_date().await),
            Dependency::Required(_) => {
                self.skipped("is_up_to_date");
                Ok(false)
            }
        }
    }

    pub async fn mtime(&self) -> Result<Option<SystemTime>> {
        match self {
            Dependency::Node(node) => node.mtime().await,
            Dependency::File(file) => file.mtime().await,
            Dependency::Required(_) => {
                self.skipped("mtime");
                Ok(None)
            }
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Node(node) => f.write_str(node.fullname()),
            Dependency::File(file) => write!(f, "{}", file.path),
            Dependency::Required(req) => write!(f, "{req} (unresolved)"),
        }
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dependency({self})")
    }
}

impl From<Arc<Node>> for Dependency {
    fn from(node: Arc<Node>) -> Self {
        Dependency::Node(node)
    }
}

impl From<&Arc<Node>> for Dependency {
    fn from(node: &Arc<Node>) -> Self {
        Dependency::Node(node.clone())
    }
}

impl From<FileDependency> for Dependency {
    fn from(file: FileDependency) -> Self {
        Dependency::File(file)
    }
}

impl From<RequiredPackage> for Dependency {
    fn from(req: RequiredPackage) -> Self {
        Dependency::Required(req)
    }
}

/// Behavior plugged into a [`Node`].
///
/// Every hook receives the node it is attached to. Only `build` is
/// mandatory, the other hooks default to doing nothing.
pub trait NodeKind: Send + Sync + 'static {
    /// Short, human readable kind name.
    fn kind(&self) -> &'static str;

    /// Declares the node's options, called once on creation.
    fn declare_options(&self, _options: &Options) {}

    /// Whether the node takes part in `install` by default.
    fn installable(&self) -> bool {
        false
    }

    fn preload<'a>(&'a self, _node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Node specific setup, may add dependencies.
    fn initialize<'a>(&'a self, _node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Extra up-to-date conditions beyond outputs, mtimes and options.
    fn is_up_to_date_extra<'a>(&'a self, _node: &'a Arc<Node>) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async { Ok(true) })
    }

    fn build<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>>;

    /// Copies the node's artifacts into the install layout. Returns the
    /// installed paths.
    fn install<'a>(
        &'a self,
        _node: &'a Arc<Node>,
        _settings: &'a InstallSettings,
        _mode: InstallMode,
    ) -> BoxFuture<'a, Result<Vec<Utf8PathBuf>>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    /// Removes anything the build produced besides the output.
    fn clean<'a>(&'a self, _node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn as_cxx(&self) -> Option<&dyn CxxProvider> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

#[derive(Default)]
struct State {
    output: Option<Utf8PathBuf>,
    default: bool,
    installed: bool,
    external: bool,
    provides: BTreeSet<String>,
    version: Option<Version>,
    edges: Vec<(Dependency, Visibility)>,
    preload: Vec<Dependency>,
    generated: Vec<Utf8PathBuf>,
    phase: Phase,
    elapsed: Option<Duration>,
}

pub struct Node {
    name: String,
    fullname: String,
    scope: Arc<Scope>,
    kind: Box<dyn NodeKind>,
    options: Options,
    state: Mutex<State>,
    preload_memo: Memo<()>,
    initialize_memo: Memo<()>,
    build_memo: Memo<BuildStatus>,
    install_memo: MemoMap<(Utf8PathBuf, InstallMode), Vec<Utf8PathBuf>>,
    clean_memo: Memo<()>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("fullname", &self.fullname)
            .field("kind", &self.kind.kind())
            .field("phase", &self.phase())
            .finish()
    }
}

impl Node {
    /// Creates a node and registers it with the session of `scope`.
    pub(crate) fn create(
        scope: Arc<Scope>,
        name: &str,
        fullname: String,
        kind: Box<dyn NodeKind>,
    ) -> Result<Arc<Self>> {
        let options = Options::new(fullname.clone(), scope.cache().clone());
        kind.declare_options(&options);

        let state = State {
            installed: kind.installable(),
            ..Default::default()
        };

        let node = Arc::new(Self {
            name: name.to_string(),
            fullname,
            scope,
            kind,
            options,
            state: Mutex::new(state),
            preload_memo: Memo::new(),
            initialize_memo: Memo::new(),
            build_memo: Memo::new(),
            install_memo: MemoMap::new(),
            clean_memo: Memo::new(),
        });

        node.session().register(&node)?;
        Ok(node)
    }

    /// Creates a node owned by this one, named `<fullname>.<name>`. Children
    /// are not default targets and are not installed.
    pub fn child(self: &Arc<Self>, name: &str, kind: impl NodeKind) -> Result<Arc<Node>> {
        let fullname = format!("{}.{name}", self.fullname);
        let child = Node::create(self.scope.clone(), name, fullname, Box::new(kind))?;
        child.set_installed(false);
        Ok(child)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub fn session(&self) -> &Arc<Session> {
        self.scope.session()
    }

    pub fn kind(&self) -> &dyn NodeKind {
        self.kind.as_ref()
    }

    /// The node's kind as a concrete type.
    pub fn kind_as<K: NodeKind>(&self) -> Option<&K> {
        self.kind.as_any().downcast_ref()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn output(&self) -> Option<Utf8PathBuf> {
        self.state().output.clone()
    }

    /// Sets the artifact path. Relative paths are taken relative to the
    /// scope's build directory.
    pub fn set_output(&self, output: Option<Utf8PathBuf>) {
        let output = output.map(|path| {
            if path.is_absolute() {
                path
            } else {
                self.scope.build_path().join(path)
            }
        });
        self.state().output = output;
    }

    /// Sentinel file standing in for the output of nodes without one.
    pub fn stamp_path(&self) -> Utf8PathBuf {
        self.scope
            .build_path()
            .join(format!("{}.stamp", self.fullname))
    }

    /// The output, or the stamp for phantom nodes.
    pub fn target_path(&self) -> Utf8PathBuf {
        self.output().unwrap_or_else(|| self.stamp_path())
    }

    pub fn build_dir(&self) -> &Utf8Path {
        self.scope.build_path()
    }

    pub fn is_default(&self) -> bool {
        self.state().default
    }

    pub fn set_default(&self, default: bool) {
        self.state().default = default;
    }

    pub fn is_installed(&self) -> bool {
        self.state().installed
    }

    pub fn set_installed(&self, installed: bool) {
        self.state().installed = installed;
    }

    /// Whether the node stands for a package living outside of the project.
    pub fn is_external(&self) -> bool {
        self.state().external
    }

    pub fn set_external(&self, external: bool) {
        self.state().external = external;
    }

    pub fn provides(&self) -> BTreeSet<String> {
        self.state().provides.clone()
    }

    pub fn add_provides(&self, alias: impl Into<String>) {
        self.state().provides.insert(alias.into());
    }

    /// Whether `name` designates this node, by name or alias.
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.state().provides.contains(name)
    }

    pub fn version(&self) -> Option<Version> {
        self.state().version.clone()
    }

    pub fn set_version(&self, version: Version) {
        self.state().version = Some(version);
    }

    pub fn depends_on(&self, dependency: impl Into<Dependency>, visibility: Visibility) {
        self.state().edges.push((dependency.into(), visibility));
    }

    /// Adds a requirement in its textual form, resolved during `preload`.
    pub fn requires(&self, requirement: &str, visibility: Visibility) -> Result<()> {
        let req = RequiredPackage::parse(requirement)?;
        self.depends_on(req, visibility);
        Ok(())
    }

    /// Adds a dependency built before this node resolves its requirements.
    /// It is not part of the build or link graph of this node.
    pub fn add_preload_dependency(&self, dependency: impl Into<Dependency>) {
        self.state().preload.push(dependency.into());
    }

    pub fn dependencies(&self) -> Vec<(Dependency, Visibility)> {
        self.state().edges.clone()
    }

    pub fn preload_dependencies(&self) -> Vec<Dependency> {
        self.state().preload.clone()
    }

    /// Resolved node dependencies, in declaration order.
    pub fn dependency_nodes(&self) -> Vec<Arc<Node>> {
        self.state()
            .edges
            .iter()
            .filter_map(|(dep, _)| dep.as_node().cloned())
            .collect()
    }

    pub fn public_dependency_nodes(&self) -> Vec<Arc<Node>> {
        self.state()
            .edges
            .iter()
            .filter(|(_, visibility)| *visibility == Visibility::Public)
            .filter_map(|(dep, _)| dep.as_node().cloned())
            .collect()
    }

    /// Registers a side file removed by `clean`.
    pub fn add_generated(&self, path: impl Into<Utf8PathBuf>) {
        self.state().generated.push(path.into());
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    fn set_phase(&self, phase: Phase) {
        self.state().phase = phase;
    }

    /// Duration of the last executed build action.
    pub fn elapsed(&self) -> Option<Duration> {
        self.state().elapsed
    }

    /// Reads a value from this node's cache section.
    pub fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.scope.cache().get(&self.fullname, key)
    }

    pub fn set_cached<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.scope.cache().set(&self.fullname, key, value)
    }

    pub fn remove_cached(&self, key: &str) {
        self.scope.cache().remove(&self.fullname, key)
    }

    pub async fn mtime(&self) -> Result<Option<SystemTime>> {
        fs::mtime(&self.target_path()).await
    }

    /// Hash of the node's options and of the options of its scope.
    pub fn fingerprint(&self) -> Hash32 {
        let mut fp = Fingerprint::new();
        fp.push("kind", &self.kind.kind());
        self.options.extend_fingerprint("node.", &mut fp);
        self.scope.options().extend_fingerprint("scope.", &mut fp);
        fp.finish()
    }

    fn log_status(&self, status: &str) {
        if self.is_default() {
            tracing::info!("{status}");
        } else {
            tracing::debug!("{status}");
        }
    }

    /// Forgets the results of `build`, `install` and `clean`, so the next
    /// call runs them again. Identity and resolved edges are kept.
    pub fn reset(&self) {
        self.build_memo.reset();
        self.install_memo.reset();
        self.clean_memo.reset();
        self.state().elapsed = None;
    }

    pub fn preload(self: &Arc<Self>) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            let node = this.clone();
            this.preload_memo.get_or_run(|| node.run_preload()).await?;
            Ok(())
        })
    }

    pub fn initialize(self: &Arc<Self>) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            let node = this.clone();
            this.initialize_memo
                .get_or_run(|| node.run_initialize())
                .await?;
            Ok(())
        })
    }

    pub fn build(self: &Arc<Self>) -> BoxFuture<'static, Result<BuildStatus>> {
        let this = self.clone();
        Box::pin(async move {
            let node = this.clone();
            Ok(this.build_memo.get_or_run(|| node.run_build()).await?)
        })
    }

    pub fn install(
        self: &Arc<Self>,
        settings: &InstallSettings,
        mode: InstallMode,
    ) -> BoxFuture<'static, Result<Vec<Utf8PathBuf>>> {
        let this = self.clone();
        let settings = settings.clone();
        Box::pin(async move {
            let key = (settings.destination.clone(), mode);
            let node = this.clone();
            Ok(this
                .install_memo
                .get_or_run(key, || node.run_install(settings, mode))
                .await?)
        })
    }

    pub fn clean(self: &Arc<Self>) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            let node = this.clone();
            this.clean_memo.get_or_run(|| node.run_clean()).await?;
            Ok(())
        })
    }

    /// Full up-to-date predicate, checking every dependency recursively.
    pub fn is_up_to_date(self: &Arc<Self>) -> BoxFuture<'static, Result<bool>> {
        let this = self.clone();
        Box::pin(async move {
            this.initialize().await?;
            this.check_up_to_date(true).await
        })
    }

    async fn run_preload(self: Arc<Self>) -> Result<()> {
        let span = tracing::debug_span!("preload", node = %self.fullname);
        let this = self.clone();
        async move {
            this.set_phase(Phase::Preloading);
            tracing::debug!("preloading...");

            let preload = this.resolve_preload_dependencies().await?;
            let mut group = TaskGroup::new(format!("{}: preload dependencies", this.fullname));
            for node in preload {
                group.spawn(async move { node.build().await.map(drop) });
            }
            group.join().await?;

            this.resolve_requirements().await?;
            this.kind.preload(&this).await?;

            let mut group = TaskGroup::new(format!("{}: preload", this.fullname));
            for node in this.dependency_nodes() {
                group.spawn(async move { node.preload().await });
            }
            group.join().await?;

            this.set_phase(Phase::Preloaded);
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn resolve_preload_dependencies(self: &Arc<Self>) -> Result<Vec<Arc<Node>>> {
        let mut resolved = Vec::new();
        for dep in self.preload_dependencies() {
            match dep {
                Dependency::Node(node) => resolved.push(node),
                Dependency::File(_) => {}
                Dependency::Required(req) => resolved.push(resolver::resolve(self, &req).await?),
            }
        }
        self.state().preload = resolved.iter().cloned().map(Dependency::Node).collect();
        Ok(resolved)
    }

    /// Replaces every requirement edge by the node it resolves to.
    async fn resolve_requirements(self: &Arc<Self>) -> Result<()> {
        let pending: Vec<(usize, RequiredPackage)> = self
            .state()
            .edges
            .iter()
            .enumerate()
            .filter_map(|(i, (dep, _))| match dep {
                Dependency::Required(req) => Some((i, req.clone())),
                _ => None,
            })
            .collect();

        for (index, req) in pending {
            let node = resolver::resolve(self, &req).await?;
            tracing::debug!("{req} resolved to {}", node.fullname);
            self.state().edges[index].0 = Dependency::Node(node);
        }
        Ok(())
    }

    async fn run_initialize(self: Arc<Self>) -> Result<()> {
        self.preload().await?;

        let span = tracing::debug_span!("initialize", node = %self.fullname);
        let this = self.clone();
        async move {
            this.set_phase(Phase::Initializing);
            tracing::debug!("initializing...");

            this.initialize_dependencies().await?;
            this.kind.initialize(&this).await?;
            // Kinds may have discovered new dependencies, such as compile
            // units. Already initialized nodes return immediately.
            this.initialize_dependencies().await?;

            this.set_phase(Phase::Initialized);
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn initialize_dependencies(&self) -> Result<()> {
        let mut group = TaskGroup::new(format!("{}: initialize", self.fullname));
        for node in self.dependency_nodes() {
            group.spawn(async move { node.initialize().await });
        }
        group.join().await?;
        Ok(())
    }

    async fn run_build(self: Arc<Self>) -> Result<BuildStatus> {
        self.initialize().await?;

        let span = tracing::info_span!("build", node = %self.fullname);
        let this = self.clone();
        async move {
            this.set_phase(Phase::Building);
            // A later clean has something to remove again.
            this.clean_memo.reset();

            let mut group = TaskGroup::new(format!("{}: dependencies", this.fullname));
            for (dep, _) in this.dependencies() {
                match dep {
                    Dependency::Node(node) => group.spawn(async move { node.build().await.map(drop) }),
                    Dependency::File(_) => {}
                    Dependency::Required(req) => {
                        this.set_phase(Phase::Failed);
                        return Err(Error::Unresolved(req.to_string(), "build"));
                    }
                }
            }
            if let Err(err) = group.join().await {
                this.set_phase(Phase::Failed);
                return Err(err);
            }

            match this.check_up_to_date(false).await {
                Ok(true) => {
                    this.log_status("up to date !");
                    this.set_phase(Phase::Built);
                    return Ok(BuildStatus::UpToDate);
                }
                Ok(false) => {}
                Err(err) => {
                    this.set_phase(Phase::Failed);
                    return Err(err);
                }
            }
            this.log_status("outdated !");

            tracing::info!("building...");
            let start = Instant::now();
            let result = match this.kind.build(&this).await {
                Ok(()) => this.commit().await,
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => {
                    let mut state = this.state();
                    state.elapsed = Some(start.elapsed());
                    state.phase = Phase::Built;
                    Ok(BuildStatus::Built)
                }
                Err(err) => {
                    tracing::error!("build failed: {err}");
                    this.set_phase(Phase::Failed);
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Post-success bookkeeping: the stamp of phantom nodes and the option
    /// fingerprint.
    async fn commit(&self) -> Result<()> {
        if self.output().is_none() {
            fs::touch(&self.stamp_path()).await?;
        }
        self.set_cached(FINGERPRINT_KEY, &self.fingerprint().to_hex())
    }

    /// Evaluates the up-to-date predicate. Inside `build` the dependencies
    /// were just built successfully, only their mtimes are compared.
    async fn check_up_to_date(self: &Arc<Self>, recurse: bool) -> Result<bool> {
        let target = self.target_path();
        let Some(own) = fs::mtime(&target).await? else {
            tracing::debug!("{target} does not exist");
            return Ok(false);
        };

        for (dep, _) in self.dependencies() {
            if recurse && !dep.is_up_to_date().await? {
                tracing::debug!("{dep} is outdated");
                return Ok(false);
            }
            match dep.mtime().await? {
                Some(mtime) if mtime > own => {
                    tracing::debug!("{dep} is newer than {target}");
                    return Ok(false);
                }
                Some(_) => {}
                None => {
                    tracing::debug!("{dep} is missing");
                    return Ok(false);
                }
            }
        }

        let current = self.fingerprint().to_hex();
        if self.cached::<String>(FINGERPRINT_KEY).as_deref() != Some(current.as_str()) {
            tracing::debug!("options changed");
            return Ok(false);
        }

        self.kind.is_up_to_date_extra(self).await
    }

    async fn run_install(self: Arc<Self>, settings: InstallSettings, mode: InstallMode) -> Result<Vec<Utf8PathBuf>> {
        self.build().await?;

        let span = tracing::info_span!("install", node = %self.fullname, %mode);
        let this = self.clone();
        async move {
            this.set_phase(Phase::Installing);

            let mut group = TaskGroup::new(format!("{}: install", this.fullname));
            for node in this.dependency_nodes() {
                if node.is_installed() && !node.is_external() {
                    let future = node.install(&settings, mode);
                    group.spawn(future);
                }
            }
            let mut files: Vec<Utf8PathBuf> = group.join().await?.into_iter().flatten().collect();
            files.extend(this.kind.install(&this, &settings, mode).await?);
            files.sort();
            files.dedup();

            this.set_phase(Phase::Installed);
            Ok(files)
        }
        .instrument(span)
        .await
    }

    async fn run_clean(self: Arc<Self>) -> Result<()> {
        self.initialize().await?;

        let mut group = TaskGroup::new(format!("{}: clean", self.fullname));
        for node in self.dependency_nodes() {
            if !node.is_external() {
                group.spawn(async move { node.clean().await });
            }
        }
        group.join().await?;

        let span = tracing::info_span!("clean", node = %self.fullname);
        let this = self.clone();
        async move {
            this.set_phase(Phase::Cleaning);
            tracing::debug!("cleaning...");

            this.kind.clean(&this).await?;

            let generated = this.state().generated.clone();
            let paths = this.output().into_iter().chain([this.stamp_path()]).chain(generated);
            for path in paths {
                if fs::remove(&path).await? {
                    tracing::debug!("removed {path}");
                }
            }
            this.remove_cached(FINGERPRINT_KEY);

            this.build_memo.reset();
            this.install_memo.reset();
            this.set_phase(Phase::Initialized);
            Ok(())
        }
        .instrument(span)
        .await
    }
}

type ActionFn = dyn Fn(Arc<Node>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// A node kind running an arbitrary asynchronous closure as its build
/// action. The node is phantom unless an output is set.
pub struct Action {
    action: Box<ActionFn>,
}

impl Action {
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: Fn(Arc<Node>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            action: Box::new(move |node| Box::pin(action(node))),
        }
    }
}

impl NodeKind for Action {
    fn kind(&self) -> &'static str {
        "action"
    }

    fn build<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { (self.action)(node.clone()).await.map_err(Error::Other) })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
