use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use super::{CommandLine, CompileRequest, Diagnostic, LinkRequest, Toolchain};
use crate::error::{CompilationFailure, LinkageFailure, Result};
use crate::fs;
use crate::process::{Command, CommandRunner, Output, run_checked};

/// One entry of a `compile_commands.json` database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileCommand {
    pub directory: Utf8PathBuf,
    pub file: Utf8PathBuf,
    pub output: Utf8PathBuf,
    pub arguments: Vec<String>,
}

/// Result of a successful compilation.
#[derive(Debug, Clone, Default)]
pub struct CompileOutcome {
    /// Header closure of the source, restricted to the project roots.
    pub dependencies: Vec<Utf8PathBuf>,
    /// Warnings and notes emitted by the compiler.
    pub diagnostics: Vec<Diagnostic>,
}

/// Runs the command lines a [`Toolchain`] produces.
pub struct Invoker {
    toolchain: Arc<dyn Toolchain>,
    runner: Arc<dyn CommandRunner>,
    roots: Vec<Utf8PathBuf>,
    database: Mutex<BTreeMap<Utf8PathBuf, CompileCommand>>,
}

impl Invoker {
    pub fn new(toolchain: Arc<dyn Toolchain>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            toolchain,
            runner,
            roots: Vec::new(),
            database: Mutex::new(BTreeMap::new()),
        }
    }

    /// Restricts scanned header dependencies to files below `roots`. Without
    /// roots every discovered header is kept.
    pub fn with_roots(mut self, roots: impl IntoIterator<Item = Utf8PathBuf>) -> Self {
        self.roots = roots.into_iter().collect();
        self
    }

    pub fn toolchain(&self) -> &Arc<dyn Toolchain> {
        &self.toolchain
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    fn command(&self, argv: &CommandLine, cwd: &Utf8Path) -> Command {
        Command::from_argv(argv)
            .cwd(cwd)
            .envs(&self.toolchain.info().env)
    }

    /// Compiles one source file and scans its header dependencies.
    pub async fn compile(&self, request: &CompileRequest, cwd: &Utf8Path) -> Result<CompileOutcome> {
        let argv = self.toolchain.compile_command(request);
        if let Some(parent) = request.object.parent() {
            fs::create_dir_all(parent).await?;
        }

        self.record(request, &argv, cwd);
        let output = self.runner.run(&self.command(&argv, cwd)).await?;
        let diagnostics = self.toolchain.parse_compile_output(&combined(&output));

        if !output.success() {
            return Err(CompilationFailure {
                file: request.source.clone(),
                command: argv,
                stdout: output.stdout,
                stderr: output.stderr,
                diagnostics,
            }
            .into());
        }

        let dependencies = self.scan_dependencies(request, cwd).await?;
        Ok(CompileOutcome {
            dependencies,
            diagnostics,
        })
    }

    /// Reads the dependency sidecar written by the last compilation of
    /// `request`. A missing sidecar yields no dependencies.
    pub async fn scan_dependencies(
        &self,
        request: &CompileRequest,
        cwd: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>> {
        let depfile = self.toolchain.dependency_file(&request.object);
        if !fs::exists(&depfile).await {
            tracing::debug!("no dependency file for {}", request.object);
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&depfile).await?;
        let mut deps: Vec<Utf8PathBuf> = self
            .toolchain
            .parse_dependencies(&request.object, &request.source, &contents)
            .into_iter()
            .map(|dep| if dep.is_absolute() { dep } else { cwd.join(dep) })
            .filter(|dep| self.is_project_file(dep))
            .collect();
        deps.sort();
        deps.dedup();
        Ok(deps)
    }

    fn is_project_file(&self, path: &Utf8Path) -> bool {
        self.roots.is_empty() || self.roots.iter().any(|root| path.starts_with(root))
    }

    pub async fn link(&self, request: &LinkRequest, cwd: &Utf8Path) -> Result<Vec<Diagnostic>> {
        let commands = self.toolchain.link_commands(request);
        self.run_link(&request.output, commands, cwd).await
    }

    pub async fn shared_lib(&self, request: &LinkRequest, cwd: &Utf8Path) -> Result<Vec<Diagnostic>> {
        let commands = self.toolchain.shared_lib_commands(request);
        self.run_link(&request.output, commands, cwd).await
    }

    /// Archives `objects` into a fresh static library at `output`.
    pub async fn static_lib(
        &self,
        objects: &[Utf8PathBuf],
        output: &Utf8Path,
        cwd: &Utf8Path,
    ) -> Result<Vec<Diagnostic>> {
        // Archivers update in place, stale members would survive otherwise.
        fs::remove(output).await?;
        let commands = self.toolchain.static_lib_commands(objects, output);
        self.run_link(output, commands, cwd).await
    }

    /// The first command produces `output` and fails with a
    /// [`LinkageFailure`]; any following post-processing step fails with a
    /// plain command error.
    async fn run_link(
        &self,
        output: &Utf8Path,
        commands: Vec<CommandLine>,
        cwd: &Utf8Path,
    ) -> Result<Vec<Diagnostic>> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut commands = commands.into_iter();
        let Some(main) = commands.next() else {
            return Ok(Vec::new());
        };

        let result = self.runner.run(&self.command(&main, cwd)).await?;
        let (diagnostics, undefined_symbols) = self.toolchain.parse_link_output(&combined(&result));

        if !result.success() {
            return Err(LinkageFailure {
                output: output.to_owned(),
                command: main,
                stdout: result.stdout,
                stderr: result.stderr,
                diagnostics,
                undefined_symbols,
            }
            .into());
        }

        for argv in commands {
            run_checked(self.runner.as_ref(), &self.command(&argv, cwd)).await?;
        }
        Ok(diagnostics)
    }

    fn record(&self, request: &CompileRequest, argv: &CommandLine, cwd: &Utf8Path) {
        let entry = CompileCommand {
            directory: cwd.to_owned(),
            file: request.source.clone(),
            output: request.object.clone(),
            arguments: argv.clone(),
        };
        self.database
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.object.clone(), entry);
    }

    /// Every compile command issued so far, ordered by object path.
    pub fn compile_commands(&self) -> Vec<CompileCommand> {
        self.database
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Merges the recorded commands into the database at `path`, keeping
    /// entries of objects not compiled during this session.
    pub async fn write_compile_commands(&self, path: &Utf8Path) -> Result<usize> {
        let mut merged: BTreeMap<Utf8PathBuf, CompileCommand> = BTreeMap::new();
        if fs::exists(path).await {
            let text = fs::read_to_string(path).await?;
            if let Ok(previous) = serde_json::from_str::<Vec<CompileCommand>>(&text) {
                merged.extend(previous.into_iter().map(|c| (c.output.clone(), c)));
            }
        }
        merged.extend(self.compile_commands().into_iter().map(|c| (c.output.clone(), c)));

        let entries: Vec<CompileCommand> = merged.into_values().collect();
        fs::write(path, serde_json::to_string_pretty(&entries)?).await?;
        Ok(entries.len())
    }
}

fn combined(output: &Output) -> String {
    let mut text = output.stdout.clone();
    text.push_str(&output.stderr);
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testutil::{FakeRunner, unix_toolchain, utf8_tempdir};
    use crate::toolchain::{Language, LinkLibrary};

    fn request(root: &Utf8Path, name: &str) -> CompileRequest {
        CompileRequest {
            source: root.join(format!("src/{name}.c")),
            object: root.join(format!("build/{name}.o")),
            language: Language::C,
            includes: vec![],
            definitions: vec![],
            options: vec![],
        }
    }

    #[tokio::test]
    async fn test_compile_scans_project_headers() {
        let (_dir, root) = utf8_tempdir();
        let runner = Arc::new(FakeRunner::new());
        runner.set_headers(vec![root.join("src/a.h"), "/usr/include/stdio.h".into()]);

        let invoker = Invoker::new(unix_toolchain(), runner.clone()).with_roots([root.clone()]);
        let outcome = invoker.compile(&request(&root, "a"), &root).await.unwrap();

        assert_eq!(outcome.dependencies, vec![root.join("src/a.h")]);
        assert!(root.join("build/a.o").exists());
        assert_eq!(runner.invocations(), 1);
        assert_eq!(invoker.compile_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_compile_failure_carries_diagnostics() {
        let (_dir, root) = utf8_tempdir();
        let runner = Arc::new(FakeRunner::new());
        runner.fail_on("bad.c");

        let invoker = Invoker::new(unix_toolchain(), runner);
        let err = invoker.compile(&request(&root, "bad"), &root).await.unwrap_err();

        let Error::Compilation(failure) = err else {
            panic!("expected a compilation failure, got {err}");
        };
        assert_eq!(failure.file, root.join("src/bad.c"));
        assert_eq!(failure.diagnostics.len(), 1);
        assert_eq!(failure.diagnostics[0].line, Some(1));
        assert!(failure.command.iter().any(|arg| arg == "-c"));
    }

    #[tokio::test]
    async fn test_link_failure_lists_undefined_symbols() {
        let (_dir, root) = utf8_tempdir();
        let runner = Arc::new(FakeRunner::new());
        runner.fail_on("app");

        let invoker = Invoker::new(unix_toolchain(), runner);
        let err = invoker
            .link(
                &LinkRequest {
                    objects: vec![root.join("main.o")],
                    output: root.join("app"),
                    libraries: vec![LinkLibrary::Name {
                        name: "m".into(),
                        dir: None,
                    }],
                    options: vec![],
                },
                &root,
            )
            .await
            .unwrap_err();

        let Error::Linkage(failure) = err else {
            panic!("expected a linkage failure, got {err}");
        };
        assert_eq!(failure.undefined_symbols, vec!["missing_symbol"]);
    }

    #[tokio::test]
    async fn test_write_compile_commands_merges() {
        let (_dir, root) = utf8_tempdir();
        let runner = Arc::new(FakeRunner::new());
        let db = root.join("compile_commands.json");

        let first = Invoker::new(unix_toolchain(), runner.clone());
        first.compile(&request(&root, "a"), &root).await.unwrap();
        assert_eq!(first.write_compile_commands(&db).await.unwrap(), 1);

        let second = Invoker::new(unix_toolchain(), runner);
        second.compile(&request(&root, "b"), &root).await.unwrap();
        assert_eq!(second.write_compile_commands(&db).await.unwrap(), 2);
    }
}
