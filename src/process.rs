//! External process execution.

use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Semaphore;

use crate::core::BoxFuture;
use crate::error::{CommandError, Result};

/// A command line to execute, with its working directory and extra
/// environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<Utf8PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Builds a command from a full argument vector, program first.
    pub fn from_argv(argv: &[String]) -> Self {
        let mut cmd = Command::new(argv.first().cloned().unwrap_or_default());
        cmd.args = argv.iter().skip(1).cloned().collect();
        cmd
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Utf8Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_owned());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv().join(" "))
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct Output {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Executes external commands. Implementations must not fail on a nonzero
/// exit status, see [`run_checked`] for that.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, command: &'a Command) -> BoxFuture<'a, Result<Output>>;
}

/// Runs `command` and turns a nonzero exit status into a [`CommandError`].
pub async fn run_checked(runner: &dyn CommandRunner, command: &Command) -> Result<Output> {
    let output = runner.run(command).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(CommandError {
            command: command.argv(),
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        }
        .into())
    }
}

/// Runs commands as child processes.
///
/// The number of processes alive at the same time is capped by a semaphore,
/// independent of how many graph nodes are building concurrently. Output is
/// forwarded line by line to the `debug` log while also being captured.
/// Dropping the returned future kills the child.
pub struct ProcessRunner {
    jobs: Arc<Semaphore>,
}

impl ProcessRunner {
    pub fn new(jobs: usize) -> Self {
        Self {
            jobs: Arc::new(Semaphore::new(jobs.max(1))),
        }
    }

    async fn execute(&self, command: &Command) -> Result<Output> {
        let _permit = self
            .jobs
            .acquire()
            .await
            .map_err(std::io::Error::other)?;

        tracing::debug!("executing: {command}");

        let mut child = tokio::process::Command::new(&command.program);
        child
            .args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            child.current_dir(cwd);
        }

        let mut child = child.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (stdout, stderr, status) =
            tokio::try_join!(collect(stdout), collect(stderr), child.wait())?;

        Ok(Output {
            // Killed by a signal: no code, reported as failure.
            status: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
        )
    }
}

impl CommandRunner for ProcessRunner {
    fn run<'a>(&'a self, command: &'a Command) -> BoxFuture<'a, Result<Output>> {
        Box::pin(self.execute(command))
    }
}

async fn collect<R>(stream: Option<R>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return Ok(String::new());
    };

    let mut buffer = String::new();
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        tracing::debug!("{line}");
        buffer.push_str(&line);
        buffer.push('\n');
    }
    Ok(buffer)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_output() {
        let runner = ProcessRunner::new(2);
        let cmd = Command::new("sh").args(["-c", "echo out; echo err 1>&2"]);
        let output = runner.run(&cmd).await.unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_run_checked_reports_status() {
        let runner = ProcessRunner::new(1);
        let cmd = Command::new("sh").args(["-c", "echo nope 1>&2; exit 3"]);

        let err = run_checked(&runner, &cmd).await.unwrap_err();
        let crate::Error::Command(err) = err else {
            panic!("expected command error");
        };
        assert_eq!(err.status, 3);
        assert_eq!(err.stderr, "nope\n");
    }

    #[tokio::test]
    async fn test_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Utf8PathBuf::from_path_buf(dir.path().canonicalize().unwrap()).unwrap();
        let runner = ProcessRunner::new(1);

        let output = runner
            .run(&Command::new("pwd").cwd(&cwd))
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), cwd.as_str());
    }

    #[test]
    fn test_from_argv() {
        let argv = vec!["cc".to_string(), "-c".into(), "a.c".into()];
        let cmd = Command::from_argv(&argv);
        assert_eq!(cmd.program, "cc");
        assert_eq!(cmd.argv(), argv);
        assert_eq!(cmd.to_string(), "cc -c a.c");
    }
}
