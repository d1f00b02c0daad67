//! Local package store, installed packages and on-demand package builds.
//!
//! Packages live in a store partitioned by target system, architecture and
//! build type. Every installed package has a prefix
//! `<store>/<name>/<version>` holding the usual `include`/`lib` layout and a
//! `kiln-package.json` manifest describing how to compile and link against
//! it.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::BoxFuture;
use crate::cxx::{CxxFlags, CxxProvider, usage_requirements};
use crate::error::{Error, Result};
use crate::fs;
use crate::graph::{Graph, Scope, Session};
use crate::install::{InstallMode, InstallSettings};
use crate::lock::FileLock;
use crate::node::{Node, NodeKind, RequiredPackage};
use crate::toolchain::LinkLibrary;
use crate::version::Version;

pub const MANIFEST_FILE: &str = "kiln-package.json";

/// Describes an installed package. Paths are relative to the package prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub includes: Vec<Utf8PathBuf>,
    /// Artifacts to link against.
    #[serde(default)]
    pub libraries: Vec<Utf8PathBuf>,
    /// Extra libraries, typically system ones linked by name.
    #[serde(default)]
    pub link_libraries: Vec<LinkLibrary>,
    #[serde(default)]
    pub definitions: Vec<String>,
}

impl PackageManifest {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            includes: Vec::new(),
            libraries: Vec::new(),
            link_libraries: Vec::new(),
            definitions: Vec::new(),
        }
    }

    /// Reads `<prefix>/kiln-package.json`, `None` if there is none.
    pub async fn load(prefix: &Utf8Path) -> Result<Option<Self>> {
        let path = prefix.join(MANIFEST_FILE);
        if !fs::exists(&path).await {
            return Ok(None);
        }
        let text = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    pub async fn save(&self, prefix: &Utf8Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(&prefix.join(MANIFEST_FILE), text).await
    }

    /// Flags a consumer compiles and links with.
    pub fn flags(&self, prefix: &Utf8Path) -> CxxFlags {
        let mut link_libraries: Vec<LinkLibrary> = self
            .libraries
            .iter()
            .map(|lib| LinkLibrary::Path(prefix.join(lib)))
            .collect();
        link_libraries.extend(self.link_libraries.iter().cloned());

        CxxFlags {
            includes: self.includes.iter().map(|dir| prefix.join(dir)).collect(),
            definitions: self.definitions.clone(),
            link_libraries,
            ..Default::default()
        }
    }
}

/// Root of the package store matching the session's toolchain.
pub fn store_root(session: &Session) -> Result<Utf8PathBuf> {
    let info = session.toolchain()?.info();
    Ok(session
        .settings()
        .packages_path()
        .join(&info.system)
        .join(&info.arch)
        .join(info.build_type().as_str()))
}

/// Identity of a package version, unique in a session.
pub fn package_id(name: &str, version: &Version) -> String {
    format!("{name}-{version}")
}

/// The newest installed version of the package `req` belongs to that it
/// accepts. Returns the prefix and the manifest.
pub async fn find_installed(
    session: &Session,
    req: &RequiredPackage,
) -> Result<Option<(Utf8PathBuf, PackageManifest)>> {
    let dir = store_root(session)?.join(req.package_name());
    let pattern = format!("*/{MANIFEST_FILE}");

    let mut best: Option<(Utf8PathBuf, PackageManifest)> = None;
    for path in fs::glob(&dir, &[pattern]).await? {
        let Some(prefix) = path.parent() else {
            continue;
        };
        let Some(manifest) = PackageManifest::load(prefix).await? else {
            continue;
        };
        if !req.accepts(Some(&manifest.version)) {
            continue;
        }
        let newer = best
            .as_ref()
            .is_none_or(|(_, current)| manifest.version.newest_cmp(&current.version).is_gt());
        if newer {
            best = Some((prefix.to_owned(), manifest));
        }
    }
    Ok(best)
}

/// Something able to produce build recipes for requirements, such as a
/// remote index. Fetching sources is the recipe's business.
pub trait PackageRepository: Send + Sync {
    fn name(&self) -> &str;

    fn find<'a>(
        &'a self,
        req: &'a RequiredPackage,
    ) -> BoxFuture<'a, Result<Option<Arc<dyn PackageRecipe>>>>;
}

/// How to build one version of a package.
pub trait PackageRecipe: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> Version;

    /// Declares the package's nodes in `graph`. Default nodes are installed
    /// into the store. Sources are expected in the scope's source directory,
    /// fetched by a preload dependency when needed.
    fn declare<'a>(&'a self, graph: &'a Graph) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// A repository serving a fixed set of recipes.
#[derive(Default)]
pub struct RecipeRepository {
    name: String,
    recipes: Vec<Arc<dyn PackageRecipe>>,
}

impl RecipeRepository {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            recipes: Vec::new(),
        }
    }

    pub fn with(mut self, recipe: impl PackageRecipe + 'static) -> Self {
        self.recipes.push(Arc::new(recipe));
        self
    }
}

impl PackageRepository for RecipeRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn find<'a>(
        &'a self,
        req: &'a RequiredPackage,
    ) -> BoxFuture<'a, Result<Option<Arc<dyn PackageRecipe>>>> {
        Box::pin(async move {
            let best = self
                .recipes
                .iter()
                .filter(|recipe| recipe.name() == req.package_name())
                .filter(|recipe| req.accepts(Some(&recipe.version())))
                .max_by(|a, b| a.version().newest_cmp(&b.version()));
            Ok(best.cloned())
        })
    }
}

/// Creates the node standing for an already installed package, once per
/// session.
pub(crate) fn installed_node(
    session: &Arc<Session>,
    prefix: Utf8PathBuf,
    manifest: PackageManifest,
) -> Result<Arc<Node>> {
    let id = package_id(&manifest.name, &manifest.version);
    let build = session.settings().packages_path().join("build").join(&id);
    session.package_node(&id, || {
        let scope = Scope::package(session, &id, prefix.clone(), build);
        let version = manifest.version.clone();
        let name = manifest.name.clone();
        let node = Node::create(
            scope.clone(),
            &id,
            scope.fullname().to_string(),
            Box::new(InstalledPackage { prefix, manifest }),
        )?;
        node.set_external(true);
        node.set_installed(false);
        node.add_provides(name);
        node.set_version(version);
        Ok(node)
    })
}

/// Creates the node building `recipe` into the store, once per session.
pub(crate) fn build_node(session: &Arc<Session>, recipe: Arc<dyn PackageRecipe>) -> Result<Arc<Node>> {
    let version = recipe.version();
    let id = package_id(recipe.name(), &version);
    let store = store_root(session)?;
    let packages = session.settings().packages_path();

    session.package_node(&id, || {
        let scope = Scope::package(
            session,
            &id,
            packages.join("src").join(&id),
            packages.join("build").join(&id),
        );
        let name = recipe.name().to_string();
        let node = Node::create(
            scope.clone(),
            &id,
            scope.fullname().to_string(),
            Box::new(PackageBuild {
                prefix: store.join(&name).join(version.as_str()),
                store,
                id: id.clone(),
                recipe,
                graph: Mutex::new(None),
                manifest: Mutex::new(None),
            }),
        )?;
        node.set_external(true);
        node.set_installed(false);
        node.add_provides(name);
        node.set_version(version);
        Ok(node)
    })
}

/// A package found in the store.
pub struct InstalledPackage {
    prefix: Utf8PathBuf,
    manifest: PackageManifest,
}

impl InstalledPackage {
    pub fn prefix(&self) -> &Utf8Path {
        &self.prefix
    }

    pub fn manifest(&self) -> &PackageManifest {
        &self.manifest
    }
}

impl CxxProvider for InstalledPackage {
    fn usage(&self, _node: &Node) -> CxxFlags {
        self.manifest.flags(&self.prefix)
    }
}

impl NodeKind for InstalledPackage {
    fn kind(&self) -> &'static str {
        "installed_package"
    }

    fn initialize<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            node.set_output(Some(self.prefix.join(MANIFEST_FILE)));
            Ok(())
        })
    }

    fn build<'a>(&'a self, _node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn as_cxx(&self) -> Option<&dyn CxxProvider> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Builds a recipe's graph and installs it into the store.
pub struct PackageBuild {
    id: String,
    store: Utf8PathBuf,
    prefix: Utf8PathBuf,
    recipe: Arc<dyn PackageRecipe>,
    graph: Mutex<Option<Arc<Graph>>>,
    manifest: Mutex<Option<PackageManifest>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PackageBuild {
    pub fn prefix(&self) -> &Utf8Path {
        &self.prefix
    }

    pub fn manifest(&self) -> Option<PackageManifest> {
        lock(&self.manifest).clone()
    }

    fn graph(&self) -> Result<Arc<Graph>> {
        lock(&self.graph)
            .clone()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("package {} was not preloaded", self.id)))
    }

    /// Manifest of what the installation of `graph` put under the prefix.
    async fn describe(&self, graph: &Graph, installed: &[Utf8PathBuf]) -> Result<PackageManifest> {
        let settings = InstallSettings::new(&self.prefix);
        let mut manifest = PackageManifest::new(self.recipe.name(), self.recipe.version());

        if fs::exists(&settings.include_dir()).await {
            manifest.includes.push(settings.include.clone());
        }
        for file in installed {
            if file.parent() == Some(settings.lib_dir().as_path())
                && let Ok(relative) = file.strip_prefix(&self.prefix)
            {
                manifest.libraries.push(relative.to_owned());
            }
        }

        for node in graph.nodes().iter().filter(|node| node.is_installed()) {
            let usage = usage_requirements(node);
            for definition in usage.definitions {
                if !manifest.definitions.contains(&definition) {
                    manifest.definitions.push(definition);
                }
            }
            for library in usage.link_libraries {
                if matches!(library, LinkLibrary::Name { .. })
                    && !manifest.link_libraries.contains(&library)
                {
                    manifest.link_libraries.push(library);
                }
            }
        }
        Ok(manifest)
    }
}

impl CxxProvider for PackageBuild {
    fn usage(&self, _node: &Node) -> CxxFlags {
        lock(&self.manifest)
            .as_ref()
            .map(|manifest| manifest.flags(&self.prefix))
            .unwrap_or_default()
    }
}

impl NodeKind for PackageBuild {
    fn kind(&self) -> &'static str {
        "package"
    }

    fn preload<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let graph = Arc::new(Graph::new(node.scope().clone()));
            self.recipe.declare(&graph).await.map_err(Error::Other)?;
            tracing::debug!("{} declares {} node(s)", self.id, graph.nodes().len());
            *lock(&self.graph) = Some(graph);
            Ok(())
        })
    }

    fn initialize<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            node.set_output(Some(self.prefix.join(MANIFEST_FILE)));
            if let Some(manifest) = PackageManifest::load(&self.prefix).await? {
                *lock(&self.manifest) = Some(manifest);
            }
            Ok(())
        })
    }

    fn build<'a>(&'a self, _node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let _lock = FileLock::acquire(&self.store, &self.id, None).await?;
            // Another build may have installed it while we were waiting.
            if let Some(manifest) = PackageManifest::load(&self.prefix).await? {
                tracing::info!("{} installed by another build", self.id);
                *lock(&self.manifest) = Some(manifest);
                return Ok(());
            }

            let graph = self.graph()?;
            graph.build(&[]).await?;
            let settings = InstallSettings::new(&self.prefix);
            let installed = graph.install(&[], &settings, InstallMode::Dev).await?;

            let manifest = self.describe(&graph, &installed).await?;
            manifest.save(&self.prefix).await?;
            tracing::info!("{} installed in {}", self.id, self.prefix);
            *lock(&self.manifest) = Some(manifest);
            Ok(())
        })
    }

    fn as_cxx(&self) -> Option<&dyn CxxProvider> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeRunner, cxx_session, utf8_tempdir};

    #[tokio::test]
    async fn test_find_installed_picks_newest_accepted() {
        let (_dir, root) = utf8_tempdir();
        let runner = Arc::new(FakeRunner::new());
        let session = cxx_session(&root, &runner);
        let store = store_root(&session).unwrap();
        assert_eq!(store, root.join("build/pkgs/linux/x64/debug"));

        for version in ["1.2", "1.10", "2.0"] {
            let prefix = store.join("zlib").join(version);
            let mut manifest = PackageManifest::new("zlib", Version::parse(version).unwrap());
            manifest.libraries.push("lib/libz.a".into());
            manifest.save(&prefix).await.unwrap();
        }

        let req = RequiredPackage::parse("zlib < 2").unwrap();
        let (prefix, manifest) = find_installed(&session, &req).await.unwrap().unwrap();
        assert_eq!(prefix, store.join("zlib/1.10"));
        assert_eq!(manifest.version.as_str(), "1.10");
        assert_eq!(
            manifest.flags(&prefix).link_libraries,
            [LinkLibrary::Path(store.join("zlib/1.10/lib/libz.a"))]
        );

        let req = RequiredPackage::parse("zlib > 3").unwrap();
        assert!(find_installed(&session, &req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_installed_node_is_deduplicated() {
        let (_dir, root) = utf8_tempdir();
        let runner = Arc::new(FakeRunner::new());
        let session = cxx_session(&root, &runner);
        let manifest = PackageManifest::new("fmt", Version::parse("10.2").unwrap());
        let prefix = root.join("store/fmt/10.2");

        let a = installed_node(&session, prefix.clone(), manifest.clone()).unwrap();
        let b = installed_node(&session, prefix, manifest).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_external());
        assert!(a.answers_to("fmt"));
        assert_eq!(a.fullname(), "packages.fmt-10.2");
    }
}
