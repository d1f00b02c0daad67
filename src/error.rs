use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::lock::LockError;
use crate::toolchain::diagnostics::Diagnostic;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Cloneable handle to an [`Error`], handed out by memoized lifecycle
/// phases to every caller awaiting the same result.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct SharedError(#[from] pub(crate) Arc<Error>);

impl SharedError {
    pub fn new(err: impl Into<Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    pub fn inner(&self) -> &Error {
        &self.0
    }
}

impl From<Error> for SharedError {
    fn from(e: Error) -> Self {
        SharedError(Arc::new(e))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("package not found: {0}")]
    PackageNotFound(String),

    #[error("requirement '{0}' is unresolved, cannot {1}")]
    Unresolved(String, &'static str),

    #[error("node '{0}' is already defined")]
    DuplicateNode(String),

    #[error("dependency cycle detected at node '{0}'")]
    Cycle(String),

    #[error(transparent)]
    Compilation(#[from] CompilationFailure),

    #[error(transparent)]
    Linkage(#[from] LinkageFailure),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Group(#[from] GroupError),

    #[error(transparent)]
    Shared(#[from] SharedError),

    #[error("task panicked: {0}")]
    Panic(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Collects every toolchain diagnostic carried by this error, descending
    /// into aggregated group failures. Identical diagnostics reported through
    /// several dependents are listed once.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        let mut acc = Vec::new();
        self.collect_diagnostics(&mut acc);
        acc
    }

    fn collect_diagnostics(&self, acc: &mut Vec<Diagnostic>) {
        let found: &[Diagnostic] = match self {
            Error::Compilation(e) => &e.diagnostics,
            Error::Linkage(e) => &e.diagnostics,
            Error::Group(group) => {
                for err in &group.errors {
                    err.collect_diagnostics(acc);
                }
                return;
            }
            Error::Shared(shared) => return shared.inner().collect_diagnostics(acc),
            _ => return,
        };

        for diag in found {
            if !acc.contains(diag) {
                acc.push(diag.clone());
            }
        }
    }

    /// Whether this error, or any error it aggregates, is a resolution
    /// failure.
    pub fn is_package_not_found(&self) -> bool {
        match self {
            Error::PackageNotFound(_) => true,
            Error::Group(group) => group.errors.iter().any(Error::is_package_not_found),
            Error::Shared(shared) => shared.inner().is_package_not_found(),
            _ => false,
        }
    }
}

/// Every non-cancellation failure collected from one task group.
#[derive(Debug)]
pub struct GroupError {
    pub name: String,
    pub errors: Vec<Error>,
    /// Number of sibling tasks aborted after the first failure.
    pub cancelled: usize,
}

impl fmt::Display for GroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} task(s) failed", self.name, self.errors.len())?;
        if self.cancelled > 0 {
            write!(f, ", {} cancelled", self.cancelled)?;
        }
        for err in &self.errors {
            for line in err.to_string().lines() {
                write!(f, "\n  {line}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for GroupError {}

#[derive(Debug, Error)]
#[error("failed to compile {file}")]
pub struct CompilationFailure {
    pub file: Utf8PathBuf,
    pub command: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Error)]
#[error("failed to link {output}{}", undefined_suffix(.undefined_symbols))]
pub struct LinkageFailure {
    pub output: Utf8PathBuf,
    pub command: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub diagnostics: Vec<Diagnostic>,
    pub undefined_symbols: Vec<String>,
}

fn undefined_suffix(symbols: &[String]) -> String {
    if symbols.is_empty() {
        String::new()
    } else {
        format!(" (undefined: {})", symbols.join(", "))
    }
}

#[derive(Debug, Error)]
#[error("command `{}` exited with status {status}{}", .command.join(" "), stderr_suffix(.stderr))]
pub struct CommandError {
    pub command: Vec<String>,
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

fn stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(":\n{stderr}")
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown toolchain type '{0}'")]
    UnknownToolchainType(String),

    #[error("unknown toolchain '{0}'")]
    UnknownToolchain(String),

    #[error("no toolchain configured")]
    NoToolchain,

    #[error("toolchain '{toolchain}' has no '{tool}' tool")]
    MissingTool { toolchain: String, tool: String },

    #[error("invalid build type '{0}'")]
    InvalidBuildType(String),

    #[error("invalid runtime type '{0}'")]
    InvalidRuntime(String),

    #[error("invalid value '{value}' for option '{option}': {reason}")]
    InvalidOptionValue {
        option: String,
        value: String,
        reason: String,
    },

    #[error("unknown option '{0}'")]
    UnknownOption(String),

    #[error("invalid option operator '{0}'")]
    InvalidOperator(String),

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("invalid requirement '{0}'")]
    InvalidRequirement(String),

    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    #[error("invalid output '{output}' for node '{node}'")]
    InvalidOutput { node: String, output: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolchain::diagnostics::Severity;

    fn diag(message: &str) -> Diagnostic {
        Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            file: Some("a.c".into()),
            line: Some(3),
            column: None,
            code: None,
            notes: vec![],
        }
    }

    fn compile_failure(message: &str) -> Error {
        Error::Compilation(CompilationFailure {
            file: "a.c".into(),
            command: vec!["cc".into()],
            stdout: String::new(),
            stderr: String::new(),
            diagnostics: vec![diag(message)],
        })
    }

    #[test]
    fn test_diagnostics_nested_groups() {
        let shared = SharedError::new(compile_failure("boom"));
        let inner = GroupError {
            name: "inner".into(),
            errors: vec![Error::Shared(shared.clone()), compile_failure("bang")],
            cancelled: 0,
        };
        let outer = Error::Group(GroupError {
            name: "outer".into(),
            errors: vec![Error::Group(inner), Error::Shared(shared)],
            cancelled: 1,
        });

        let diags = outer.diagnostics();
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].message, "boom");
        assert_eq!(diags[1].message, "bang");
    }

    #[test]
    fn test_group_display() {
        let err = GroupError {
            name: "build".into(),
            errors: vec![Error::PackageNotFound("zlib".into())],
            cancelled: 2,
        };
        let text = err.to_string();
        assert!(text.starts_with("build: 1 task(s) failed, 2 cancelled"));
        assert!(text.contains("package not found: zlib"));
    }

    #[test]
    fn test_package_not_found_is_found_through_shared() {
        let err = Error::Shared(SharedError::new(Error::PackageNotFound("fmt".into())));
        assert!(err.is_package_not_found());
        assert!(!compile_failure("x").is_package_not_found());
    }
}
