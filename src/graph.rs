//! Sessions, scopes and graphs of nodes.
//!
//! A [`Session`] is one build invocation: settings, the cache registry, the
//! toolchain and the registry of every live node by fullname. A [`Scope`] is
//! a namespace with its own source and build directories, cache document
//! and options. A [`Graph`] is the set of nodes declared in a scope, and the
//! entry point for building, installing and cleaning a selection of them.
//!
//! Ownership flows one way: nodes own their scope, scopes own the session.
//! The session only keeps weak references to nodes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::cache::{Cache, CacheScope};
use crate::config::Settings;
use crate::engine::TaskGroup;
use crate::error::{ConfigError, Error, Result};
use crate::install::{InstallMode, InstallSettings};
use crate::node::{Node, NodeKind, Phase, RequiredPackage};
use crate::options::{AssignOp, OptionValue, Options};
use crate::package::PackageRepository;
use crate::process::{CommandRunner, ProcessRunner};
use crate::toolchain::{Invoker, Toolchain, ToolchainRegistry};

/// File name of the per-scope cache document.
pub const CACHE_FILE: &str = "kiln.cache.json";

pub struct SessionBuilder {
    settings: Settings,
    runner: Option<Arc<dyn CommandRunner>>,
    toolchain: Option<Arc<dyn Toolchain>>,
    repositories: Vec<Arc<dyn PackageRepository>>,
}

impl SessionBuilder {
    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn toolchain(mut self, toolchain: Arc<dyn Toolchain>) -> Self {
        self.toolchain = Some(toolchain);
        self
    }

    /// Instantiates the toolchain named by the settings from `registry`.
    pub fn registry(mut self, registry: &ToolchainRegistry) -> Result<Self> {
        let toolchain = registry.create(
            self.settings.toolchain.as_deref(),
            &self.settings.toolchain_settings(),
        )?;
        self.toolchain = Some(toolchain);
        Ok(self)
    }

    pub fn repository(mut self, repository: Arc<dyn PackageRepository>) -> Self {
        self.repositories.push(repository);
        self
    }

    pub fn build(self) -> Arc<Session> {
        let runner = self
            .runner
            .unwrap_or_else(|| -> Arc<dyn CommandRunner> {
                Arc::new(ProcessRunner::new(self.settings.jobs()))
            });

        let invoker = self.toolchain.map(|toolchain| {
            let roots = [
                self.settings.source_path.clone(),
                self.settings.build_path.clone(),
            ];
            Arc::new(Invoker::new(toolchain, runner.clone()).with_roots(roots))
        });

        Arc::new(Session {
            settings: self.settings,
            cache: Cache::new(),
            runner,
            invoker,
            repositories: self.repositories,
            nodes: Mutex::new(BTreeMap::new()),
            packages: Mutex::new(HashMap::new()),
        })
    }
}

pub struct Session {
    settings: Settings,
    cache: Cache,
    runner: Arc<dyn CommandRunner>,
    invoker: Option<Arc<Invoker>>,
    repositories: Vec<Arc<dyn PackageRepository>>,
    nodes: Mutex<BTreeMap<String, Weak<Node>>>,
    packages: Mutex<HashMap<String, Weak<Node>>>,
}

impl Session {
    pub fn builder(settings: Settings) -> SessionBuilder {
        SessionBuilder {
            settings,
            runner: None,
            toolchain: None,
            repositories: Vec::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn invoker(&self) -> Result<&Arc<Invoker>, ConfigError> {
        self.invoker.as_ref().ok_or(ConfigError::NoToolchain)
    }

    pub fn toolchain(&self) -> Result<&Arc<dyn Toolchain>, ConfigError> {
        Ok(self.invoker()?.toolchain())
    }

    pub fn has_toolchain(&self) -> bool {
        self.invoker.is_some()
    }

    pub fn repositories(&self) -> &[Arc<dyn PackageRepository>] {
        &self.repositories
    }

    pub(crate) fn register(&self, node: &Arc<Node>) -> Result<()> {
        let mut nodes = lock(&self.nodes);
        if nodes.get(node.fullname()).and_then(Weak::upgrade).is_some() {
            return Err(Error::DuplicateNode(node.fullname().to_string()));
        }
        nodes.insert(node.fullname().to_string(), Arc::downgrade(node));
        Ok(())
    }

    pub fn find(&self, fullname: &str) -> Option<Arc<Node>> {
        lock(&self.nodes).get(fullname).and_then(Weak::upgrade)
    }

    /// Every live node, sorted by fullname.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        lock(&self.nodes).values().filter_map(Weak::upgrade).collect()
    }

    /// Returns the package node registered under `id`, creating it with
    /// `create` on first request. One node per identity per session.
    pub(crate) fn package_node(
        &self,
        id: &str,
        create: impl FnOnce() -> Result<Arc<Node>>,
    ) -> Result<Arc<Node>> {
        let mut packages = lock(&self.packages);
        if let Some(node) = packages.get(id).and_then(Weak::upgrade) {
            return Ok(node);
        }
        let node = create()?;
        packages.insert(id.to_string(), Arc::downgrade(&node));
        Ok(node)
    }

    /// Forgets the build, install and clean results of every node.
    pub fn reset(&self) {
        for node in self.nodes() {
            node.reset();
        }
    }

    /// Writes every changed cache document.
    pub async fn save(&self) -> Result<usize> {
        self.cache.save_all_dirty().await
    }

    /// Runs `future` to completion on a fresh single-threaded runtime. The
    /// blocking pool used for filesystem work is capped by the job count.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .max_blocking_threads(self.settings.jobs())
            .build()?;
        Ok(runtime.block_on(future))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeRole {
    Project,
    /// Holds the nodes consulted by the resolver before fetching packages.
    Requirements,
    /// Holds a package build or an installed package.
    Package,
}

pub struct Scope {
    name: String,
    fullname: String,
    role: ScopeRole,
    source_path: Utf8PathBuf,
    build_path: Utf8PathBuf,
    session: Arc<Session>,
    cache: Arc<CacheScope>,
    options: Options,
    requirements: Mutex<Option<Arc<Graph>>>,
}

impl Scope {
    fn create(
        session: &Arc<Session>,
        name: &str,
        fullname: String,
        role: ScopeRole,
        source_path: Utf8PathBuf,
        build_path: Utf8PathBuf,
    ) -> Arc<Self> {
        let cache = session.cache().scope(build_path.join(CACHE_FILE));
        let options = Options::new(format!("scope:{fullname}"), cache.clone());
        Arc::new(Self {
            name: name.to_string(),
            fullname,
            role,
            source_path,
            build_path,
            session: session.clone(),
            cache,
            options,
            requirements: Mutex::new(None),
        })
    }

    /// The project's top-level scope, rooted at the session's directories.
    pub fn root(session: &Arc<Session>) -> Arc<Self> {
        let settings = session.settings();
        Self::create(
            session,
            "",
            String::new(),
            ScopeRole::Project,
            settings.source_path.clone(),
            settings.build_path.clone(),
        )
    }

    /// A nested project scope, `subdir` relative to both directories.
    pub fn subscope(self: &Arc<Self>, name: &str, subdir: &Utf8Path) -> Arc<Self> {
        Self::create(
            &self.session,
            name,
            self.qualify(name),
            self.role,
            self.source_path.join(subdir),
            self.build_path.join(subdir),
        )
    }

    pub(crate) fn package(
        session: &Arc<Session>,
        name: &str,
        source_path: Utf8PathBuf,
        build_path: Utf8PathBuf,
    ) -> Arc<Self> {
        Self::create(
            session,
            name,
            format!("packages.{name}"),
            ScopeRole::Package,
            source_path,
            build_path,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    pub fn role(&self) -> ScopeRole {
        self.role
    }

    pub fn source_path(&self) -> &Utf8Path {
        &self.source_path
    }

    pub fn build_path(&self) -> &Utf8Path {
        &self.build_path
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn cache(&self) -> &Arc<CacheScope> {
        &self.cache
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Fullname of a node called `name` declared in this scope.
    pub fn qualify(&self, name: &str) -> String {
        if self.fullname.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.fullname)
        }
    }

    /// The requirements graph of this scope, created on first access.
    pub fn requirements(self: &Arc<Self>) -> Arc<Graph> {
        let mut slot = lock(&self.requirements);
        if let Some(graph) = slot.as_ref() {
            return graph.clone();
        }

        let scope = Self::create(
            &self.session,
            "requirements",
            self.qualify("requirements"),
            ScopeRole::Requirements,
            self.source_path.clone(),
            self.build_path.join("requirements"),
        );
        let graph = Arc::new(Graph::new(scope));
        *slot = Some(graph.clone());
        graph
    }

    /// The requirements graph, if one was declared.
    pub fn requirements_graph(&self) -> Option<Arc<Graph>> {
        lock(&self.requirements).clone()
    }
}

/// The nodes declared in one scope.
pub struct Graph {
    scope: Arc<Scope>,
    nodes: Mutex<Vec<Arc<Node>>>,
}

impl Graph {
    pub fn new(scope: Arc<Scope>) -> Self {
        Self {
            scope,
            nodes: Mutex::new(Vec::new()),
        }
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub fn session(&self) -> &Arc<Session> {
        self.scope.session()
    }

    /// Declares a default node called `name`.
    pub fn add(&self, name: &str, kind: impl NodeKind) -> Result<Arc<Node>> {
        let fullname = self.scope.qualify(name);
        let node = Node::create(self.scope.clone(), name, fullname, Box::new(kind))?;
        node.set_default(true);
        lock(&self.nodes).push(node.clone());
        Ok(node)
    }

    /// Declared nodes, in declaration order.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        lock(&self.nodes).clone()
    }

    /// Declared nodes and everything they reach, sorted by fullname.
    pub fn all_nodes(&self) -> Vec<Arc<Node>> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let mut stack = self.nodes();

        while let Some(node) = stack.pop() {
            if !seen.insert(node.fullname().to_string()) {
                continue;
            }
            stack.extend(node.dependency_nodes());
            stack.extend(
                node.preload_dependencies()
                    .iter()
                    .filter_map(|dep| dep.as_node().cloned()),
            );
            found.push(node);
        }

        found.sort_by(|a, b| a.fullname().cmp(b.fullname()));
        found
    }

    pub fn find(&self, fullname: &str) -> Option<Arc<Node>> {
        self.all_nodes()
            .into_iter()
            .find(|node| node.fullname() == fullname)
    }

    /// A declared node answering to the requirement's name in an acceptable
    /// version.
    pub fn find_provider(&self, req: &RequiredPackage) -> Option<Arc<Node>> {
        self.nodes()
            .into_iter()
            .find(|node| node.answers_to(&req.name) && req.accepts(node.version().as_ref()))
    }

    /// Nodes whose fullname matches one of the glob `patterns`. A pattern
    /// without wildcard matches as a substring. Without patterns, the default
    /// nodes are selected.
    pub fn select(&self, patterns: &[&str]) -> Result<Vec<Arc<Node>>> {
        if patterns.is_empty() {
            return Ok(self.nodes().into_iter().filter(|n| n.is_default()).collect());
        }

        let candidates = self.all_nodes();
        let mut selected: Vec<Arc<Node>> = Vec::new();
        for pattern in patterns {
            let glob = if pattern.contains(['*', '?', '[']) {
                glob::Pattern::new(pattern)?
            } else {
                glob::Pattern::new(&format!("*{}*", glob::Pattern::escape(pattern)))?
            };

            let before = selected.len();
            for node in &candidates {
                if glob.matches(node.fullname())
                    && !selected.iter().any(|n| Arc::ptr_eq(n, node))
                {
                    selected.push(node.clone());
                }
            }
            if selected.len() == before {
                return Err(ConfigError::UnknownNode(pattern.to_string()).into());
            }
        }
        Ok(selected)
    }

    /// Fails with the first node found on a dependency cycle.
    pub fn check_cycles(&self) -> Result<()> {
        let nodes = self.all_nodes();
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut index: HashMap<String, NodeIndex> = HashMap::new();

        for node in &nodes {
            let id = graph.add_node(node.fullname().to_string());
            index.insert(node.fullname().to_string(), id);
        }
        for node in &nodes {
            let from = index[node.fullname()];
            for dep in node.dependency_nodes() {
                if let Some(&to) = index.get(dep.fullname()) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        petgraph::algo::toposort(&graph, None)
            .map(drop)
            .map_err(|cycle| Error::Cycle(graph[cycle.node_id()].clone()))
    }

    async fn initialize(&self, nodes: &[Arc<Node>]) -> Result<()> {
        self.check_cycles()?;
        let mut group = TaskGroup::new("initialize");
        for node in nodes {
            let node = node.clone();
            group.spawn(async move { node.initialize().await });
        }
        group.join().await?;
        // Resolution and initialization add edges.
        self.check_cycles()
    }

    /// Builds the selected nodes. The cache is saved whatever the outcome,
    /// so the fingerprints of everything that did build are kept.
    pub async fn build(&self, patterns: &[&str]) -> Result<BuildReport> {
        let targets = self.select(patterns)?;
        self.build_nodes(&targets).await
    }

    /// Builds `targets`, saving the cache whatever the outcome.
    pub async fn build_nodes(&self, targets: &[Arc<Node>]) -> Result<BuildReport> {
        let result = self.build_targets(targets).await;

        let saved = self.session().save().await;
        let exported = self.export_compile_commands().await;
        result?;
        saved?;
        exported?;
        Ok(self.report())
    }

    async fn build_targets(&self, targets: &[Arc<Node>]) -> Result<()> {
        self.initialize(targets).await?;

        let mut group = TaskGroup::new("build");
        for node in targets {
            let node = node.clone();
            group.spawn(async move { node.build().await.map(drop) });
        }
        group.join().await?;
        Ok(())
    }

    /// Merges this session's compile commands into
    /// `<build>/compile_commands.json`.
    async fn export_compile_commands(&self) -> Result<()> {
        let Ok(invoker) = self.session().invoker() else {
            return Ok(());
        };
        if invoker.compile_commands().is_empty() {
            return Ok(());
        }
        let path = self.scope.build_path().join("compile_commands.json");
        let count = invoker.write_compile_commands(&path).await?;
        tracing::debug!("{count} compile commands written to {path}");
        Ok(())
    }

    /// Builds then installs the selected nodes flagged for installation.
    pub async fn install(
        &self,
        patterns: &[&str],
        settings: &InstallSettings,
        mode: InstallMode,
    ) -> Result<Vec<Utf8PathBuf>> {
        let targets: Vec<Arc<Node>> = self
            .select(patterns)?
            .into_iter()
            .filter(|node| node.is_installed())
            .collect();

        let result = async {
            self.initialize(&targets).await?;
            let mut group = TaskGroup::new("install");
            for node in &targets {
                group.spawn(node.install(settings, mode));
            }
            group.join().await
        }
        .await;

        self.session().save().await?;
        let mut files: Vec<Utf8PathBuf> = result?.into_iter().flatten().collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    pub async fn clean(&self, patterns: &[&str]) -> Result<()> {
        let targets = self.select(patterns)?;
        let result = async {
            self.initialize(&targets).await?;
            let mut group = TaskGroup::new("clean");
            for node in &targets {
                group.spawn(node.clean());
            }
            group.join().await
        }
        .await;

        self.session().save().await?;
        result.map(drop)
    }

    /// Applies `<target>.<option> <op> <value>`. The target is a node
    /// fullname, or the scope itself when it names no node.
    pub fn apply_option(&self, path: &str, op: AssignOp, value: &str) -> Result<OptionValue> {
        let Some((target, option)) = path.rsplit_once('.') else {
            return self.scope.options().apply(path, op, value);
        };

        if let Some(node) = self.find(target).or_else(|| self.session().find(target)) {
            node.options().apply(option, op, value)
        } else if target == self.scope.fullname() || target == "scope" {
            self.scope.options().apply(option, op, value)
        } else {
            Err(ConfigError::UnknownNode(target.to_string()).into())
        }
    }

    /// Applies an assignment such as `app.defines+=FOO,BAR`.
    pub fn assign(&self, expr: &str) -> Result<OptionValue> {
        let (path, op, value) = AssignOp::split(expr)?;
        self.apply_option(path.trim(), op, value.trim())
    }

    pub fn report(&self) -> BuildReport {
        let nodes = self
            .all_nodes()
            .into_iter()
            .map(|node| NodeReport::of(&node))
            .collect();
        BuildReport { nodes }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    UpToDate,
    Built,
    Failed,
}

#[derive(Debug, Clone)]
pub struct NodeReport {
    pub fullname: String,
    pub kind: &'static str,
    pub status: NodeStatus,
    pub elapsed: Option<Duration>,
    pub dependencies: Vec<String>,
}

impl NodeReport {
    fn of(node: &Node) -> Self {
        let elapsed = node.elapsed();
        let status = match node.phase() {
            Phase::Failed => NodeStatus::Failed,
            Phase::Built | Phase::Installing | Phase::Installed if elapsed.is_some() => {
                NodeStatus::Built
            }
            Phase::Built | Phase::Installing | Phase::Installed => NodeStatus::UpToDate,
            _ => NodeStatus::Pending,
        };
        Self {
            fullname: node.fullname().to_string(),
            kind: node.kind().kind(),
            status,
            elapsed,
            dependencies: node
                .dependency_nodes()
                .iter()
                .map(|dep| dep.fullname().to_string())
                .collect(),
        }
    }
}

/// Per-node outcome of a build, sorted by fullname.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub nodes: Vec<NodeReport>,
}

impl BuildReport {
    pub fn with_status(&self, status: NodeStatus) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.status == status)
            .map(|n| n.fullname.as_str())
            .collect()
    }

    pub fn total(&self) -> Duration {
        self.nodes.iter().filter_map(|n| n.elapsed).sum()
    }

    /// Renders the graph as a Mermaid flowchart. Executed nodes are colored
    /// from green to red by duration, skipped ones are light blue.
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times: Vec<f64> = self
            .nodes
            .iter()
            .filter_map(|n| n.elapsed)
            .map(|d| d.as_secs_f64())
            .collect();
        let min_time = times.iter().copied().fold(f64::MAX, f64::min);
        let mut max_time = times.iter().copied().fold(f64::MIN, f64::max);
        let min_time = if times.is_empty() { 0.0 } else { min_time };
        if times.is_empty() || (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        let index: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.fullname.as_str(), i))
            .collect();

        for (i, node) in self.nodes.iter().enumerate() {
            let name = node.fullname.replace('"', "\\\"");

            let (label, color) = match (node.status, node.elapsed) {
                (NodeStatus::Failed, _) => ("failed".to_string(), "#FF6B6B".to_string()),
                (_, Some(elapsed)) => {
                    let t = (elapsed.as_secs_f64() - min_time) / (max_time - min_time);
                    let (r, g) = if t < 0.5 {
                        ((255.0 * t * 2.0) as u8, 255)
                    } else {
                        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
                    };
                    (format!("{elapsed:.2?}"), format!("#{r:02X}{g:02X}00"))
                }
                (NodeStatus::UpToDate, None) => ("up to date".to_string(), "#ADD8E6".to_string()),
                _ => ("pending".to_string(), "#D3D3D3".to_string()),
            };

            let _ = writeln!(f, "    {i}[\"{name}\\n{label}\"]");
            let _ = writeln!(f, "    style {i} fill:{color}");
            for dep in &node.dependencies {
                if let Some(j) = index.get(dep.as_str()) {
                    let _ = writeln!(f, "    {i} --> {j}");
                }
            }
        }

        f
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::node::{Action, Visibility};
    use crate::testutil::{counting_action, failing_action, session, utf8_tempdir};

    fn noop() -> Action {
        Action::new(|_| async { Ok(()) })
    }

    #[tokio::test]
    async fn test_build_report_and_selection() {
        let (_dir, root) = utf8_tempdir();
        let calls = Arc::new(AtomicUsize::new(0));
        let session = session(&root);
        let graph = Graph::new(Scope::root(&session));

        let core = graph.add("core", counting_action(&calls)).unwrap();
        let app = graph.add("app", noop()).unwrap();
        let tool = graph.add("tool", noop()).unwrap();
        tool.set_default(false);
        app.depends_on(&core, Visibility::Private);

        let report = graph.build(&[]).await.unwrap();
        assert_eq!(report.with_status(NodeStatus::Built), ["app", "core"]);
        assert_eq!(report.with_status(NodeStatus::Pending), ["tool"]);
        assert!(report.render_mermaid().contains("    0 --> 1"));

        assert_eq!(graph.select(&["to"]).unwrap().len(), 1);
        assert_eq!(graph.select(&["*o*"]).unwrap().len(), 2);
        assert!(graph.select(&["missing"]).is_err());

        session.reset();
        let report = graph.build(&["app"]).await.unwrap();
        assert_eq!(report.with_status(NodeStatus::UpToDate), ["app", "core"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cycle_is_reported() {
        let (_dir, root) = utf8_tempdir();
        let session = session(&root);
        let graph = Graph::new(Scope::root(&session));
        let a = graph.add("a", noop()).unwrap();
        let b = graph.add("b", noop()).unwrap();
        a.depends_on(&b, Visibility::Private);
        b.depends_on(&a, Visibility::Private);

        let err = graph.build(&[]).await.unwrap_err();
        assert!(matches!(err, Error::Cycle(_)));
    }

    #[tokio::test]
    async fn test_fail_fast_saves_successful_fingerprints() {
        let (_dir, root) = utf8_tempdir();
        let calls = Arc::new(AtomicUsize::new(0));
        let session = session(&root);
        let graph = Graph::new(Scope::root(&session));

        let _ok = graph.add("ok", counting_action(&calls)).unwrap();
        let bad = graph.add("bad", failing_action("bad recipe")).unwrap();
        let top = graph.add("top", noop()).unwrap();
        top.depends_on(&bad, Visibility::Private);

        graph.build(&["ok"]).await.unwrap();
        let err = graph.build(&["top"]).await.unwrap_err();
        assert!(err.to_string().contains("bad recipe"));
        assert_eq!(bad.phase(), Phase::Failed);
        assert_eq!(top.phase(), Phase::Failed);

        // The cache written despite the failure keeps `ok` up to date.
        let session = crate::testutil::session(&root);
        let graph = Graph::new(Scope::root(&session));
        let ok_again = graph.add("ok", counting_action(&calls)).unwrap();
        assert!(ok_again.is_up_to_date().await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_apply_option_by_path() {
        let (_dir, root) = utf8_tempdir();
        let session = session(&root);
        let scope = Scope::root(&session);
        scope.options().add("warnings", true, "enable warnings");
        let graph = Graph::new(scope);

        let node = graph.add("app", noop()).unwrap();
        node.options().add("defines", Vec::<String>::new(), "");

        graph.assign("app.defines+=A,B").unwrap();
        graph.apply_option("app.defines", AssignOp::Remove, "A").unwrap();
        assert_eq!(
            node.options().get("defines").unwrap().as_list().unwrap(),
            ["B".to_string()]
        );

        graph.apply_option("warnings", AssignOp::Set, "false").unwrap();
        assert_eq!(graph.scope().options().get("warnings"), Some(OptionValue::Bool(false)));
        assert!(graph.apply_option("nope.x", AssignOp::Set, "1").is_err());
    }

    #[tokio::test]
    async fn test_requirements_graph_is_shared() {
        let (_dir, root) = utf8_tempdir();
        let session = session(&root);
        let scope = Scope::root(&session);
        assert!(scope.requirements_graph().is_none());

        let reqs = scope.requirements();
        let node = reqs.add("zlib", noop()).unwrap();
        assert_eq!(node.fullname(), "requirements.zlib");
        assert!(Arc::ptr_eq(&reqs, &scope.requirements()));
        assert_eq!(reqs.scope().role(), ScopeRole::Requirements);
        assert_eq!(reqs.scope().build_path(), root.join("build/requirements"));
    }
}
