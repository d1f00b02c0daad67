//! Test cases run against built executables.

use std::any::Any;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::core::BoxFuture;
use crate::engine::TaskGroup;
use crate::error::{Error, Result};
use crate::fs;
use crate::graph::{BuildReport, Graph};
use crate::node::{Node, NodeKind, Visibility};
use crate::process::{Command, CommandRunner};

const CASES_KEY: &str = "cases";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub args: Vec<String>,
    pub expected_result: i32,
    /// Compared with the standard output when set.
    pub expected_output: Option<String>,
    /// Trim surrounding whitespace before comparing outputs.
    pub strip_output: bool,
    /// Turn `\r\n` into `\n` before comparing outputs.
    pub normalize_newlines: bool,
}

impl TestCase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            expected_result: 0,
            expected_output: None,
            strip_output: true,
            normalize_newlines: true,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn expect_result(mut self, status: i32) -> Self {
        self.expected_result = status;
        self
    }

    pub fn expect_output(mut self, output: impl Into<String>) -> Self {
        self.expected_output = Some(output.into());
        self
    }

    pub fn strip_output(mut self, strip: bool) -> Self {
        self.strip_output = strip;
        self
    }

    pub fn normalize_newlines(mut self, normalize: bool) -> Self {
        self.normalize_newlines = normalize;
        self
    }

    fn normalize(&self, text: &str) -> String {
        let text = if self.normalize_newlines {
            text.replace("\r\n", "\n")
        } else {
            text.to_string()
        };
        if self.strip_output {
            text.trim().to_string()
        } else {
            text
        }
    }

    async fn run(
        &self,
        runner: Arc<dyn CommandRunner>,
        executable: &Utf8PathBuf,
        dir: &Utf8PathBuf,
    ) -> Result<Option<String>> {
        let command = Command::new(executable.as_str()).args(self.args.iter().cloned()).cwd(dir);
        let output = runner.run(&command).await?;

        fs::write(&dir.join(format!("{}.stdout", self.name)), &output.stdout).await?;
        fs::write(&dir.join(format!("{}.stderr", self.name)), &output.stderr).await?;

        if output.status != self.expected_result {
            return Ok(Some(format!(
                "test {} exited with {} instead of {}",
                self.name, output.status, self.expected_result
            )));
        }
        if let Some(expected) = &self.expected_output
            && self.normalize(expected) != self.normalize(&output.stdout)
        {
            return Ok(Some(format!(
                "test {}: unexpected output, see {dir}/{}.stdout",
                self.name, self.name
            )));
        }
        tracing::info!("test {} passed", self.name);
        Ok(None)
    }
}

/// Runs its cases against the executable it depends on. Passing is recorded
/// like a build, so unchanged tests of an unchanged executable do not run
/// again.
#[derive(Default)]
pub struct Test {
    cases: Vec<TestCase>,
}

impl Test {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn case(mut self, case: TestCase) -> Self {
        self.cases.push(case);
        self
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    fn executable(&self, node: &Node) -> Result<(Utf8PathBuf, Utf8PathBuf)> {
        node.dependency_nodes()
            .into_iter()
            .find(|dep| dep.kind().kind() == "executable")
            .and_then(|exe| Some((exe.output()?, exe.build_dir().to_owned())))
            .ok_or_else(|| {
                Error::Other(anyhow::anyhow!("test {} has no executable", node.fullname()))
            })
    }
}

impl NodeKind for Test {
    fn kind(&self) -> &'static str {
        "test"
    }

    fn initialize<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let (_, dir) = self.executable(node)?;
            for case in &self.cases {
                node.add_generated(dir.join(format!("{}.stdout", case.name)));
                node.add_generated(dir.join(format!("{}.stderr", case.name)));
            }
            Ok(())
        })
    }

    fn is_up_to_date_extra<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            Ok(node.cached::<Vec<TestCase>>(CASES_KEY).as_deref() == Some(self.cases.as_slice()))
        })
    }

    fn build<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let (executable, dir) = self.executable(node)?;
            let runner = node.session().runner().clone();

            let mut group = TaskGroup::new(format!("{}: cases", node.fullname()));
            for case in self.cases.iter().cloned() {
                let runner = runner.clone();
                let executable = executable.clone();
                let dir = dir.clone();
                group.spawn(async move { case.run(runner, &executable, &dir).await });
            }
            // A failing case does not cancel the others.
            let mut failures: Vec<String> = group.join().await?.into_iter().flatten().collect();
            if !failures.is_empty() {
                failures.sort();
                for failure in &failures {
                    tracing::error!("{failure}");
                }
                return Err(Error::Other(anyhow::anyhow!(
                    "{} test case(s) failed:\n  {}",
                    failures.len(),
                    failures.join("\n  ")
                )));
            }

            node.set_cached(CASES_KEY, &self.cases)
        })
    }

    fn clean<'a>(&'a self, node: &'a Arc<Node>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            node.remove_cached(CASES_KEY);
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Declares a test of `executable`. Tests are not default targets, they run
/// through [`run`].
pub fn add_test(graph: &Graph, name: &str, executable: &Arc<Node>, test: Test) -> Result<Arc<Node>> {
    let node = graph.add(name, test)?;
    node.set_default(false);
    node.depends_on(executable, Visibility::Private);
    Ok(node)
}

/// Runs the tests of `graph` matching `patterns`, or every test.
pub async fn run(graph: &Graph, patterns: &[&str]) -> Result<BuildReport> {
    let candidates = if patterns.is_empty() {
        graph.all_nodes()
    } else {
        graph.select(patterns)?
    };
    let tests: Vec<Arc<Node>> = candidates
        .into_iter()
        .filter(|node| node.kind_as::<Test>().is_some())
        .collect();
    graph.build_nodes(&tests).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cxx::Executable;
    use crate::graph::{NodeStatus, Scope};
    use crate::testutil::{FakeRunner, cxx_session, utf8_tempdir};

    fn declare(graph: &Graph, cases: &[TestCase]) -> Arc<Node> {
        let exe = graph.add("hello", Executable::new().sources(["hello.c"])).unwrap();
        let test = cases.iter().cloned().fold(Test::new(), Test::case);
        add_test(graph, "hello_test", &exe, test).unwrap()
    }

    #[tokio::test]
    async fn test_cases_run_once() {
        let (_dir, root) = utf8_tempdir();
        std::fs::write(root.join("hello.c"), "").unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.set_stdout("hello\r\n");
        let cases = [
            TestCase::new("plain").expect_output("hello"),
            TestCase::new("args").args(["--loud"]),
        ];

        let session = cxx_session(&root, &runner);
        let graph = Graph::new(Scope::root(&session));
        declare(&graph, &cases);
        let report = graph.build(&[]).await.unwrap();
        assert_eq!(report.with_status(NodeStatus::Pending), ["hello_test"]);

        runner.clear();
        let report = run(&graph, &[]).await.unwrap();
        assert!(report.with_status(NodeStatus::Built).contains(&"hello_test"));
        assert_eq!(runner.invocations(), 2);
        assert!(runner.commands().contains(&vec![root.join("build/hello").to_string(), "--loud".to_string()]));
        assert_eq!(std::fs::read_to_string(root.join("build/plain.stdout")).unwrap(), "hello\r\n");

        runner.clear();
        let session = cxx_session(&root, &runner);
        let graph = Graph::new(Scope::root(&session));
        declare(&graph, &cases);
        run(&graph, &["hello_test"]).await.unwrap();
        assert_eq!(runner.invocations(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_aggregated() {
        let (_dir, root) = utf8_tempdir();
        std::fs::write(root.join("hello.c"), "").unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.set_stdout("bye");
        let cases = [
            TestCase::new("output").expect_output("hello"),
            TestCase::new("status").expect_result(3),
            TestCase::new("ok"),
        ];

        let session = cxx_session(&root, &runner);
        let graph = Graph::new(Scope::root(&session));
        let test = declare(&graph, &cases);
        let err = run(&graph, &[]).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("2 test case(s) failed"), "{message}");
        assert!(message.contains("test output: unexpected output"), "{message}");
        assert!(message.contains("test status exited with 0 instead of 3"), "{message}");
        assert!(test.cached::<Vec<TestCase>>(CASES_KEY).is_none());
    }
}
