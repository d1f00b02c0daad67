//! Shared fixtures for unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::config::Settings;
use crate::core::BoxFuture;
use crate::error::Result;
use crate::graph::Session;
use crate::node::Action;
use crate::process::{Command, CommandRunner, Output};
use crate::toolchain::{self, Toolchain, ToolchainData, ToolchainSettings};

pub fn utf8_tempdir() -> (TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().canonicalize().unwrap();
    (dir, Utf8PathBuf::from_path_buf(path).unwrap())
}

pub fn set_mtime(path: &Utf8Path, time: SystemTime) {
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(time)
        .unwrap();
}

/// Sets the mtime of every file under `dir`. Tests use it to age build
/// outputs, so a later touch of a source is newer whatever the filesystem's
/// timestamp granularity.
pub fn backdate(dir: &Utf8Path, time: SystemTime) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = Utf8PathBuf::from_path_buf(entry.unwrap().path()).unwrap();
        if path.is_dir() {
            backdate(&path, time);
        } else {
            set_mtime(&path, time);
        }
    }
}

pub fn past(secs: u64) -> SystemTime {
    SystemTime::now() - Duration::from_secs(secs)
}

pub fn future(secs: u64) -> SystemTime {
    SystemTime::now() + Duration::from_secs(secs)
}

fn unix_data() -> ToolchainData {
    ToolchainData {
        kind: "gcc".into(),
        vendor: "gcc".into(),
        version: "13.2".into(),
        arch: "x64".into(),
        system: "linux".into(),
        tools: [("cc", "/usr/bin/cc"), ("ar", "/usr/bin/ar")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.into()))
            .collect(),
        env: BTreeMap::new(),
    }
}

pub fn unix_toolchain() -> Arc<dyn Toolchain> {
    unix_toolchain_with(&ToolchainSettings::default())
}

pub fn unix_toolchain_with(settings: &ToolchainSettings) -> Arc<dyn Toolchain> {
    toolchain::create("gcc", &unix_data(), settings).unwrap()
}

/// Session rooted at `root`, sources in `root`, build files in `root/build`,
/// without a toolchain.
pub fn session(root: &Utf8Path) -> Arc<Session> {
    Session::builder(Settings::new(root, root.join("build")))
        .runner(Arc::new(FakeRunner::new()))
        .build()
}

/// Session with the fake unix toolchain driven by `runner`.
pub fn cxx_session(root: &Utf8Path, runner: &Arc<FakeRunner>) -> Arc<Session> {
    cxx_session_with(Settings::new(root, root.join("build")), runner)
}

pub fn cxx_session_with(settings: Settings, runner: &Arc<FakeRunner>) -> Arc<Session> {
    let toolchain = unix_toolchain_with(&settings.toolchain_settings());
    Session::builder(settings)
        .runner(runner.clone())
        .toolchain(toolchain)
        .build()
}

pub fn counting_action(calls: &Arc<AtomicUsize>) -> Action {
    let calls = calls.clone();
    Action::new(move |_| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

pub fn failing_action(message: &'static str) -> Action {
    Action::new(move |_| async move { Err(anyhow::anyhow!(message)) })
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Vec<String>>,
    failing: Vec<String>,
    headers: Vec<Utf8PathBuf>,
    stdout: String,
}

/// Records commands instead of running them and creates the files a real
/// compiler, archiver or linker would have written.
#[derive(Default)]
pub struct FakeRunner {
    state: Mutex<FakeState>,
    count: AtomicUsize,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Forgets recorded commands and resets the counter.
    pub fn clear(&self) {
        self.state.lock().unwrap().calls.clear();
        self.count.store(0, Ordering::SeqCst);
    }

    /// Makes every command mentioning a file named `file_name` fail.
    pub fn fail_on(&self, file_name: &str) {
        self.state.lock().unwrap().failing.push(file_name.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    /// Headers reported as included by every compiled source.
    pub fn set_headers(&self, headers: Vec<Utf8PathBuf>) {
        self.state.lock().unwrap().headers = headers;
    }

    pub fn set_stdout(&self, stdout: &str) {
        self.state.lock().unwrap().stdout = stdout.to_string();
    }

    fn execute(&self, command: &Command) -> std::io::Result<Output> {
        let argv = command.argv();
        let cwd = command.cwd.clone().unwrap_or_else(|| Utf8PathBuf::from("."));
        let resolve = |arg: &str| {
            let path = Utf8Path::new(arg);
            if path.is_absolute() { path.to_owned() } else { cwd.join(path) }
        };

        self.count.fetch_add(1, Ordering::SeqCst);
        let (failing, headers, stdout) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(argv.clone());
            (state.failing.clone(), state.headers.clone(), state.stdout.clone())
        };

        let is_compile = argv.iter().any(|a| a == "-c" || a == "/c");
        let failed = argv.iter().find(|arg| {
            let name = Utf8Path::new(arg.as_str()).file_name().unwrap_or(arg.as_str());
            failing.iter().any(|f| f == name)
        });
        if let Some(arg) = failed {
            let stderr = if is_compile {
                format!("{arg}:1:1: error: forced failure\n")
            } else {
                "main.o: in function `main':\n\
                 main.c:(.text+0x9): undefined reference to `missing_symbol'\n\
                 collect2: error: ld returned 1 exit status\n"
                    .to_string()
            };
            return Ok(Output {
                status: 1,
                stdout: String::new(),
                stderr,
            });
        }

        let contents = argv.join(" ");
        let mut outputs = Vec::new();
        let mut args = argv.iter().enumerate().peekable();
        while let Some((i, arg)) = args.next() {
            if arg == "-o" || (arg == "rcs" && i == 1) {
                if let Some((_, next)) = args.peek() {
                    outputs.push(resolve(next.as_str()));
                }
            } else if let Some(out) = arg.strip_prefix("/OUT:").or_else(|| arg.strip_prefix("/Fo")) {
                outputs.push(resolve(out));
            } else if arg == "-MF" {
                if let Some((_, depfile)) = args.peek() {
                    let object = argv.iter().skip_while(|a| *a != "-MT").nth(1).cloned().unwrap_or_default();
                    let source = argv.last().cloned().unwrap_or_default();
                    let mut rule = format!("{object}: {source}");
                    for header in &headers {
                        rule.push_str(&format!(" \\\n {header}"));
                    }
                    write_file(&resolve(depfile.as_str()), &rule)?;
                }
            } else if arg == "/sourceDependencies" {
                if let Some((_, depfile)) = args.peek() {
                    let json = serde_json::json!({
                        "Version": "1.1",
                        "Data": { "Includes": headers },
                    });
                    write_file(&resolve(depfile.as_str()), &json.to_string())?;
                }
            }
        }
        for output in outputs {
            write_file(&output, &contents)?;
        }

        Ok(Output {
            status: 0,
            stdout,
            stderr: String::new(),
        })
    }
}

fn write_file(path: &Utf8Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)
}

impl CommandRunner for FakeRunner {
    fn run<'a>(&'a self, command: &'a Command) -> BoxFuture<'a, Result<Output>> {
        Box::pin(async move { Ok(self.execute(command)?) })
    }
}
