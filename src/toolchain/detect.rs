//! Compiler identification.
//!
//! The compiler is asked to preprocess an empty translation unit while
//! dumping its predefined macros. Vendor, version, target architecture and
//! target system are read from well known macros. Sibling tools (archiver,
//! linker, strip) are looked up next to the compiler using its own naming
//! pattern, so `aarch64-linux-gnu-gcc-12` finds `aarch64-linux-gnu-ar`.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use super::{ToolchainData, ToolchainKind};
use crate::cache::CacheScope;
use crate::error::{ConfigError, Result};
use crate::fs;
use crate::process::{Command, CommandRunner, run_checked};

static DEFINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*#define\s+(\w+)(?:\s+(.*?))?\s*$").expect("valid regex"));

static COMPILER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?-)?(clang-cl|clang\+\+|clang|g\+\+|gcc|c\+\+|cc|cl)(-[0-9.]+)?(\.exe)?$")
        .expect("valid regex")
});

/// Macro table produced by the preprocessor.
pub type Defines = BTreeMap<String, String>;

/// What the predefined macros say about a compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub kind: ToolchainKind,
    pub vendor: String,
    pub version: String,
    pub arch: String,
    pub system: String,
}

/// Arguments making `compiler` dump its predefined macros for `source`.
pub fn dump_macros_args(kind: ToolchainKind, source: &Utf8Path) -> Vec<String> {
    let flags: &[&str] = match kind {
        ToolchainKind::Unix => &["-dM", "-E", "-x", "c"],
        ToolchainKind::Msvc => &["/nologo", "/EP", "/Zc:preprocessor", "/PD", "/TC"],
    };
    flags
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(source.to_string()))
        .collect()
}

/// Parses a `#define NAME VALUE` stream. Macros without a value map to an
/// empty string.
pub fn parse_defines(output: &str) -> Defines {
    output
        .lines()
        .filter_map(|line| DEFINE.captures(line))
        .map(|caps| {
            let value = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            (caps[1].to_string(), value.to_string())
        })
        .collect()
}

fn dotted(defines: &Defines, names: &[&str]) -> String {
    names
        .iter()
        .map(|name| defines.get(*name).map(String::as_str).unwrap_or("0"))
        .collect::<Vec<_>>()
        .join(".")
}

/// Derives vendor, version and target from a macro table. `kind` decides
/// between clang and clang-cl, which define the same vendor macros.
pub fn identify(kind: ToolchainKind, defines: &Defines) -> Identity {
    let has = |name: &str| defines.contains_key(name);

    let (vendor, version) = if has("__clang__") {
        let vendor = if has("__apple_build_version__") {
            "apple"
        } else {
            "clang"
        };
        (
            vendor,
            dotted(defines, &["__clang_major__", "__clang_minor__", "__clang_patchlevel__"]),
        )
    } else if let Some(msc) = defines.get("_MSC_VER").and_then(|v| v.parse::<u32>().ok()) {
        ("msvc", format!("{}.{}", msc / 100, msc % 100))
    } else if has("__GNUC__") {
        (
            "gcc",
            dotted(defines, &["__GNUC__", "__GNUC_MINOR__", "__GNUC_PATCHLEVEL__"]),
        )
    } else {
        ("unknown", String::new())
    };

    let arch = if has("__x86_64__") || has("__amd64__") || has("_M_X64") || has("_M_AMD64") {
        "x64"
    } else if has("__i386__") || has("_M_IX86") {
        "x86"
    } else if has("__aarch64__") || has("_M_ARM64") {
        "arm64"
    } else if has("__arm__") || has("_M_ARM") {
        "arm"
    } else if has("__riscv") {
        match defines.get("__riscv_xlen").map(String::as_str) {
            Some("32") => "riscv32",
            _ => "riscv64",
        }
    } else if has("__wasm32__") {
        "wasm32"
    } else {
        "unknown"
    };

    let system = if has("__EMSCRIPTEN__") {
        "emscripten"
    } else if has("_WIN32") {
        "windows"
    } else if has("__APPLE__") {
        "macos"
    } else if has("__ANDROID__") {
        "android"
    } else if has("__linux__") {
        "linux"
    } else if has("__FreeBSD__") {
        "freebsd"
    } else {
        "unknown"
    };

    Identity {
        kind,
        vendor: vendor.to_string(),
        version,
        arch: arch.to_string(),
        system: system.to_string(),
    }
}

/// Decomposition of a compiler file name: `<prefix><base><suffix><ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CompilerName<'a> {
    prefix: &'a str,
    base: &'a str,
    suffix: &'a str,
    ext: &'a str,
}

fn split_name(file_name: &str) -> Option<CompilerName<'_>> {
    let caps = COMPILER_NAME.captures(file_name)?;
    let part = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();
    Some(CompilerName {
        prefix: part(1),
        base: part(2),
        suffix: part(3),
        ext: part(4),
    })
}

/// Kind of toolchain a compiler file name belongs to.
pub fn kind_of(compiler: &Utf8Path) -> Result<ToolchainKind, ConfigError> {
    let name = compiler.file_name().unwrap_or_default();
    match split_name(name) {
        Some(CompilerName { base: "cl" | "clang-cl", .. }) => Ok(ToolchainKind::Msvc),
        Some(_) => Ok(ToolchainKind::Unix),
        None => Err(ConfigError::UnknownToolchainType(name.to_string())),
    }
}

/// Candidate file names per tool, most specific first.
fn tool_candidates(kind: ToolchainKind, name: &CompilerName<'_>) -> Vec<(&'static str, Vec<String>)> {
    let CompilerName {
        prefix,
        base,
        suffix,
        ext,
    } = name;
    let versioned = |tool: &str| format!("{prefix}{tool}{suffix}{ext}");
    let plain = |tool: &str| format!("{prefix}{tool}{ext}");

    match kind {
        ToolchainKind::Msvc => vec![
            ("link", vec![plain("link"), plain("lld-link")]),
            ("lib", vec![plain("lib"), plain("llvm-lib")]),
        ],
        ToolchainKind::Unix => {
            let is_clang = base.starts_with("clang");
            let (cc, cxx) = if is_clang {
                ("clang", "clang++")
            } else if base.starts_with('g') {
                ("gcc", "g++")
            } else {
                ("cc", "c++")
            };
            let (ar, debugger) = if is_clang {
                ("llvm-ar", "lldb")
            } else {
                ("gcc-ar", "gdb")
            };

            vec![
                ("cc", vec![versioned(cc)]),
                ("cxx", vec![versioned(cxx)]),
                ("ar", vec![versioned(ar), plain(ar), versioned("ar"), plain("ar")]),
                (
                    "objcopy",
                    vec![versioned("llvm-objcopy"), plain("objcopy"), versioned("objcopy")],
                ),
                ("strip", vec![versioned("strip"), plain("strip")]),
                ("debugger", vec![versioned(debugger), plain(debugger)]),
            ]
        }
    }
}

/// Finds the sibling tools of `compiler` that exist in its directory. The
/// compiler itself is registered as `cc` (or `cxx` for C++ drivers) when no
/// better match exists.
pub async fn sibling_tools(compiler: &Utf8Path) -> Result<BTreeMap<String, Utf8PathBuf>> {
    let kind = kind_of(compiler)?;
    let file_name = compiler.file_name().unwrap_or_default();
    let dir = compiler.parent().unwrap_or(Utf8Path::new("."));
    let Some(name) = split_name(file_name) else {
        return Err(ConfigError::UnknownToolchainType(file_name.to_string()).into());
    };

    let mut tools = BTreeMap::new();
    let own_role = match (kind, name.base) {
        (ToolchainKind::Msvc, _) => "cc",
        (_, "g++" | "clang++" | "c++") => "cxx",
        _ => "cc",
    };
    tools.insert(own_role.to_string(), compiler.to_owned());

    for (tool, candidates) in tool_candidates(kind, &name) {
        if tools.contains_key(tool) {
            continue;
        }
        for candidate in candidates {
            let path = dir.join(&candidate);
            if fs::exists(&path).await {
                tracing::debug!("found {tool}: {path}");
                tools.insert(tool.to_string(), path);
                break;
            }
        }
    }

    Ok(tools)
}

#[derive(Serialize, Deserialize)]
struct Probe {
    args: Vec<String>,
    defines: Defines,
}

/// Dumps the predefined macros of `compiler` under `flags`.
///
/// The result is cached in `cache` under the compiler path and reused as
/// long as the flags are the same.
pub async fn probe(
    runner: &dyn CommandRunner,
    cache: &CacheScope,
    work_dir: &Utf8Path,
    compiler: &Utf8Path,
    flags: &[String],
) -> Result<Defines> {
    let kind = kind_of(compiler)?;
    let source = work_dir.join("kiln-probe.c");
    let mut args = flags.to_vec();
    args.extend(dump_macros_args(kind, &source));

    let section = format!("toolchain:{compiler}");
    if let Some(cached) = cache.get::<Probe>(&section, "probe")
        && cached.args == args
    {
        tracing::debug!("using cached probe of {compiler}");
        return Ok(cached.defines);
    }

    fs::write(&source, "").await?;
    let command = Command::new(compiler.as_str()).args(args.iter().cloned()).cwd(work_dir);
    let output = run_checked(runner, &command).await?;
    let defines = parse_defines(&output.stdout);

    cache.set(&section, "probe", &Probe {
        args,
        defines: defines.clone(),
    })?;
    Ok(defines)
}

/// Builds a registry entry describing `compiler`.
pub async fn detect(
    runner: &dyn CommandRunner,
    cache: &CacheScope,
    work_dir: &Utf8Path,
    compiler: &Utf8Path,
    flags: &[String],
) -> Result<ToolchainData> {
    let defines = probe(runner, cache, work_dir, compiler, flags).await?;
    let identity = identify(kind_of(compiler)?, &defines);
    let tools = sibling_tools(compiler).await?;

    tracing::info!(
        "detected {} {} for {}-{} at {compiler}",
        identity.vendor,
        identity.version,
        identity.arch,
        identity.system
    );

    Ok(ToolchainData {
        kind: identity.kind.to_string(),
        vendor: identity.vendor,
        version: identity.version,
        arch: identity.arch,
        system: identity.system,
        tools,
        env: BTreeMap::new(),
    })
}
