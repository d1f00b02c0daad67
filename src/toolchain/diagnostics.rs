//! Parsing of compiler and linker output into structured diagnostics.

use std::fmt;
use std::sync::LazyLock;

use camino::Utf8PathBuf;
use regex_lite::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl Severity {
    fn parse(text: &str) -> Self {
        match text {
            "error" => Severity::Error,
            "warning" => Severity::Warning,
            _ => Severity::Note,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Note => "note",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub file: Option<Utf8PathBuf>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub code: Option<String>,
    /// Follow-up notes the compiler attached to this diagnostic.
    pub notes: Vec<Diagnostic>,
}

impl Diagnostic {
    fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            file: None,
            line: None,
            column: None,
            code: None,
            notes: Vec::new(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{file}:")?;
            if let Some(line) = self.line {
                write!(f, "{line}:")?;
                if let Some(column) = self.column {
                    write!(f, "{column}:")?;
                }
            }
            f.write_str(" ")?;
        }
        write!(f, "{}", self.severity)?;
        if let Some(code) = &self.code {
            write!(f, " {code}")?;
        }
        write!(f, ": {}", self.message)?;
        for note in &self.notes {
            write!(f, "\n  {note}")?;
        }
        Ok(())
    }
}

static GCC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?):(\d+):(?:(\d+):)?\s(?:fatal )?(error|warning|note):\s(.+)$")
        .expect("valid regex")
});

static LD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:.+?: )?(.+?):(\d+): (undefined reference to.+)$").expect("valid regex")
});

static UNDEFINED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"undefined (?:reference to|symbol:?) [`'"]?([^`'"\s]+)"#).expect("valid regex")
});

static MSVC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?)\((\d+)(?:,(\d+))?\)\s*:\s*(?:fatal )?(error|warning|note)\s*([A-Z]+\d+)?\s*:\s*(.+)$")
        .expect("valid regex")
});

static MSVC_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?) : (?:fatal )?(error|warning) (LNK\d+): (.+)$").expect("valid regex")
});

static UNRESOLVED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"unresolved external symbol (\S+)").expect("valid regex")
});

/// Parses GCC/Clang style `file:line:col: severity: message` lines. Notes
/// are attached to the diagnostic they follow.
pub fn parse_gcc(output: &str) -> Vec<Diagnostic> {
    let mut diagnostics: Vec<Diagnostic> = Vec::new();

    for line in output.lines() {
        let Some(caps) = GCC.captures(line) else {
            continue;
        };

        let mut diag = Diagnostic::new(Severity::parse(&caps[4]), &caps[5]);
        diag.file = Some(caps[1].into());
        diag.line = caps[2].parse().ok();
        diag.column = caps.get(3).and_then(|m| m.as_str().parse().ok());

        match (diag.severity, diagnostics.last_mut()) {
            (Severity::Note, Some(previous)) => previous.notes.push(diag),
            _ => diagnostics.push(diag),
        }
    }

    diagnostics
}

/// Parses the GNU linker output. Returns the diagnostics and the list of
/// undefined symbols.
pub fn parse_ld(output: &str) -> (Vec<Diagnostic>, Vec<String>) {
    let mut diagnostics = parse_gcc(output);
    let mut symbols = Vec::new();

    for line in output.lines() {
        if let Some(caps) = LD.captures(line) {
            let mut diag = Diagnostic::new(Severity::Error, &caps[3]);
            diag.file = Some(caps[1].into());
            diag.line = caps[2].parse().ok();
            diagnostics.push(diag);
        } else if line.contains("undefined") && !GCC.is_match(line) {
            diagnostics.push(Diagnostic::new(Severity::Error, line.trim()));
        }

        if let Some(caps) = UNDEFINED.captures(line) {
            let symbol = caps[1].to_string();
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
    }

    (diagnostics, symbols)
}

/// Parses `cl.exe` output: `file(line[,col]): severity CODE: message`.
pub fn parse_msvc(output: &str) -> Vec<Diagnostic> {
    output
        .lines()
        .filter_map(|line| MSVC.captures(line.trim()))
        .map(|caps| {
            let mut diag = Diagnostic::new(Severity::parse(&caps[4]), &caps[6]);
            diag.file = Some(caps[1].into());
            diag.line = caps[2].parse().ok();
            diag.column = caps.get(3).and_then(|m| m.as_str().parse().ok());
            diag.code = caps.get(5).map(|m| m.as_str().to_string());
            diag
        })
        .collect()
}

/// Parses `link.exe`/`lib.exe` output. Returns the diagnostics and the list
/// of unresolved external symbols.
pub fn parse_msvc_link(output: &str) -> (Vec<Diagnostic>, Vec<String>) {
    let mut diagnostics = Vec::new();
    let mut symbols = Vec::new();

    for line in output.lines().map(str::trim) {
        if let Some(caps) = MSVC_LINK.captures(line) {
            let mut diag = Diagnostic::new(Severity::parse(&caps[2]), &caps[4]);
            diag.file = Some(caps[1].into());
            diag.code = Some(caps[3].to_string());
            diagnostics.push(diag);
        }
        if let Some(caps) = UNRESOLVED.captures(line) {
            let symbol = caps[1].to_string();
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
    }

    (diagnostics, symbols)
}
