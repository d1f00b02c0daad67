use camino::{Utf8Path, Utf8PathBuf};

use super::diagnostics::{self, Diagnostic};
use super::{
    ArtifactKind, BuildType, CommandLine, CompileRequest, Language, LinkLibrary, LinkRequest,
    RuntimeType, Toolchain, ToolchainInfo,
};
use crate::error::ConfigError;

/// GCC and Clang family toolchains.
#[derive(Debug)]
pub struct UnixToolchain {
    info: ToolchainInfo,
    cc: Option<Utf8PathBuf>,
    cxx: Option<Utf8PathBuf>,
    ar: Utf8PathBuf,
    objcopy: Option<Utf8PathBuf>,
}

impl UnixToolchain {
    pub fn new(info: ToolchainInfo) -> Result<Self, ConfigError> {
        let cc = info.tool("cc").map(Utf8Path::to_owned);
        let cxx = info.tool("cxx").map(Utf8Path::to_owned);
        if cc.is_none() && cxx.is_none() {
            return Err(ConfigError::MissingTool {
                toolchain: info.name.clone(),
                tool: "cc".into(),
            });
        }

        Ok(Self {
            ar: info.require("ar")?,
            objcopy: info.tool("objcopy").map(Utf8Path::to_owned),
            cc,
            cxx,
            info,
        })
    }

    fn compiler(&self, language: Language) -> &Utf8Path {
        let preferred = match language {
            Language::C => self.cc.as_ref().or(self.cxx.as_ref()),
            Language::Cxx => self.cxx.as_ref().or(self.cc.as_ref()),
        };
        // At least one of them exists, checked in `new`.
        preferred.map(Utf8PathBuf::as_path).unwrap_or(Utf8Path::new("cc"))
    }

    fn optimization_flags(&self) -> &'static [&'static str] {
        match self.info.settings.build_type {
            BuildType::Debug => &["-g"],
            BuildType::Release => &["-O3", "-DNDEBUG"],
            BuildType::ReleaseMinSize => &["-Os", "-DNDEBUG"],
            BuildType::ReleaseDebugInfos => &["-O2", "-g", "-DNDEBUG"],
        }
    }

    fn is_windows(&self) -> bool {
        self.info.system == "windows"
    }

    fn is_macos(&self) -> bool {
        self.info.system == "macos"
    }

    fn link_args(&self, request: &LinkRequest, args: &mut CommandLine) {
        args.extend(request.objects.iter().map(ToString::to_string));
        args.push("-o".into());
        args.push(request.output.to_string());
        args.extend(self.info.settings.link_flags.iter().cloned());
        args.extend(request.options.iter().cloned());

        if self.info.settings.runtime == RuntimeType::Static {
            args.push("-static-libgcc".into());
            if self.cxx.is_some() {
                args.push("-static-libstdc++".into());
            }
        }

        let mut rpaths: Vec<&Utf8Path> = Vec::new();
        for library in &request.libraries {
            match library {
                LinkLibrary::Path(path) => {
                    args.push(path.to_string());
                    if is_shared_object(path)
                        && let Some(dir) = path.parent()
                        && !rpaths.contains(&dir)
                    {
                        rpaths.push(dir);
                    }
                }
                LinkLibrary::Name { name, dir } => {
                    if let Some(dir) = dir {
                        args.push(format!("-L{dir}"));
                        if !rpaths.contains(&dir.as_path()) {
                            rpaths.push(dir.as_path());
                        }
                    }
                    args.push(format!("-l{name}"));
                }
            }
        }

        if !self.is_windows() {
            for dir in rpaths {
                args.push(format!("-Wl,-rpath,{dir}"));
            }
        }
    }

    fn strip_commands(&self, output: &Utf8Path) -> Vec<CommandLine> {
        match (&self.objcopy, self.info.settings.build_type) {
            (Some(objcopy), BuildType::Release | BuildType::ReleaseMinSize) => {
                vec![vec![objcopy.to_string(), "-S".into(), output.to_string()]]
            }
            _ => Vec::new(),
        }
    }
}

fn is_shared_object(path: &Utf8Path) -> bool {
    matches!(path.extension(), Some("so" | "dylib" | "dll"))
        || path.file_name().is_some_and(|n| n.contains(".so."))
}

impl Toolchain for UnixToolchain {
    fn info(&self) -> &ToolchainInfo {
        &self.info
    }

    fn artifact_name(&self, kind: ArtifactKind, name: &str) -> String {
        match kind {
            ArtifactKind::Object => format!("{name}.o"),
            ArtifactKind::StaticLibrary => format!("lib{name}.a"),
            ArtifactKind::SharedLibrary if self.is_windows() => format!("lib{name}.dll"),
            ArtifactKind::SharedLibrary if self.is_macos() => format!("lib{name}.dylib"),
            ArtifactKind::SharedLibrary => format!("lib{name}.so"),
            ArtifactKind::ImportLibrary if self.is_windows() => format!("lib{name}.dll.a"),
            ArtifactKind::ImportLibrary => self.artifact_name(ArtifactKind::SharedLibrary, name),
            ArtifactKind::Executable if self.is_windows() => format!("{name}.exe"),
            ArtifactKind::Executable => name.to_string(),
        }
    }

    fn compile_command(&self, request: &CompileRequest) -> CommandLine {
        let settings = &self.info.settings;
        let mut args = vec![self.compiler(request.language).to_string()];

        args.extend(self.optimization_flags().iter().map(|s| s.to_string()));
        args.extend(settings.compile_flags.iter().cloned());
        if request.language == Language::Cxx {
            args.extend(settings.cxx_flags.iter().cloned());
        }
        if settings.position_independent_code && !self.is_windows() {
            args.push("-fPIC".into());
        }
        args.extend(request.options.iter().cloned());
        args.extend(request.definitions.iter().map(|d| format!("-D{d}")));
        args.extend(request.includes.iter().map(|i| format!("-I{i}")));

        let object = request.object.to_string();
        args.extend([
            "-MD".into(),
            "-MT".into(),
            object.clone(),
            "-MF".into(),
            self.dependency_file(&request.object).to_string(),
            "-o".into(),
            object,
            "-c".into(),
            request.source.to_string(),
        ]);
        args
    }

    fn link_commands(&self, request: &LinkRequest) -> Vec<CommandLine> {
        let mut args = vec![self.compiler(Language::Cxx).to_string()];
        self.link_args(request, &mut args);

        let mut commands = vec![args];
        commands.extend(self.strip_commands(&request.output));
        commands
    }

    fn static_lib_commands(&self, objects: &[Utf8PathBuf], output: &Utf8Path) -> Vec<CommandLine> {
        let mut args = vec![self.ar.to_string(), "rcs".into(), output.to_string()];
        args.extend(objects.iter().map(ToString::to_string));
        vec![args]
    }

    fn shared_lib_commands(&self, request: &LinkRequest) -> Vec<CommandLine> {
        let mut args = vec![self.compiler(Language::Cxx).to_string(), "-shared".into()];
        if self.is_windows() {
            let import = self.import_library(&request.output);
            args.push(format!("-Wl,--out-implib,{import}"));
        }
        self.link_args(request, &mut args);

        let mut commands = vec![args];
        commands.extend(self.strip_commands(&request.output));
        commands
    }

    fn dependency_file(&self, object: &Utf8Path) -> Utf8PathBuf {
        object.with_extension("d")
    }

    fn parse_dependencies(
        &self,
        object: &Utf8Path,
        source: &Utf8Path,
        contents: &str,
    ) -> Vec<Utf8PathBuf> {
        parse_makefile_deps(contents)
            .into_iter()
            .filter(|dep| dep != object && dep != source)
            .collect()
    }

    fn parse_compile_output(&self, output: &str) -> Vec<Diagnostic> {
        diagnostics::parse_gcc(output)
    }

    fn parse_link_output(&self, output: &str) -> (Vec<Diagnostic>, Vec<String>) {
        diagnostics::parse_ld(output)
    }

    fn import_library(&self, output: &Utf8Path) -> Utf8PathBuf {
        if self.is_windows() {
            let mut name = output.file_name().unwrap_or_default().to_string();
            name.push_str(".a");
            output.with_file_name(name)
        } else {
            output.to_owned()
        }
    }
}

/// Parses a `-MD` style make rule into its prerequisites.
fn parse_makefile_deps(contents: &str) -> Vec<Utf8PathBuf> {
    let joined = contents.replace("\\\r\n", " ").replace("\\\n", " ");
    let mut deps = Vec::new();

    for rule in joined.lines() {
        // The target ends at the first colon followed by whitespace, which
        // keeps drive letters such as `C:\` intact.
        let Some(split) = rule.find(": ").or_else(|| rule.strip_suffix(':').map(str::len)) else {
            continue;
        };

        let mut current = String::new();
        let mut chars = rule[split + 1..].chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' if chars.peek() == Some(&' ') => {
                    current.push(' ');
                    chars.next();
                }
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        deps.push(Utf8PathBuf::from(std::mem::take(&mut current)));
                    }
                }
                c => current.push(c),
            }
        }
        if !current.is_empty() {
            deps.push(Utf8PathBuf::from(current));
        }
    }

    deps.dedup();
    deps
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::toolchain::{ToolchainKind, ToolchainSettings};

    fn toolchain(build_type: BuildType) -> UnixToolchain {
        let tools: BTreeMap<String, Utf8PathBuf> = [
            ("cc", "/usr/bin/gcc"),
            ("cxx", "/usr/bin/g++"),
            ("ar", "/usr/bin/ar"),
            ("objcopy", "/usr/bin/objcopy"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.into()))
        .collect();

        UnixToolchain::new(ToolchainInfo {
            name: "gcc".into(),
            kind: ToolchainKind::Unix,
            vendor: "gcc".into(),
            version: None,
            arch: "x64".into(),
            system: "linux".into(),
            tools,
            env: BTreeMap::new(),
            settings: ToolchainSettings {
                build_type,
                position_independent_code: true,
                ..Default::default()
            },
        })
        .unwrap()
    }

    #[test]
    fn test_compile_command() {
        let tc = toolchain(BuildType::Release);
        let argv = tc.compile_command(&CompileRequest {
            source: "/src/a.c".into(),
            object: "/build/a.o".into(),
            language: Language::C,
            includes: vec!["/src/include".into()],
            definitions: vec!["FOO=1".into()],
            options: vec!["-Wall".into()],
        });

        assert_eq!(
            argv,
            [
                "/usr/bin/gcc", "-O3", "-DNDEBUG", "-fPIC", "-Wall", "-DFOO=1",
                "-I/src/include", "-MD", "-MT", "/build/a.o", "-MF", "/build/a.d", "-o",
                "/build/a.o", "-c", "/src/a.c",
            ]
        );
    }

    #[test]
    fn test_link_with_libraries_and_strip() {
        let tc = toolchain(BuildType::Release);
        let commands = tc.link_commands(&LinkRequest {
            objects: vec!["/b/main.o".into()],
            output: "/b/app".into(),
            libraries: vec![
                LinkLibrary::Path("/b/libcore.a".into()),
                LinkLibrary::Path("/b/libshared.so".into()),
                LinkLibrary::Name {
                    name: "z".into(),
                    dir: Some("/opt/z/lib".into()),
                },
                LinkLibrary::Name {
                    name: "m".into(),
                    dir: None,
                },
            ],
            options: vec![],
        });

        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[0],
            [
                "/usr/bin/g++", "/b/main.o", "-o", "/b/app", "/b/libcore.a", "/b/libshared.so",
                "-L/opt/z/lib", "-lz", "-lm", "-Wl,-rpath,/b", "-Wl,-rpath,/opt/z/lib",
            ]
        );
        assert_eq!(commands[1], ["/usr/bin/objcopy", "-S", "/b/app"]);
    }

    #[test]
    fn test_debug_link_has_no_strip() {
        let tc = toolchain(BuildType::Debug);
        let commands = tc.link_commands(&LinkRequest {
            objects: vec!["m.o".into()],
            output: "app".into(),
            libraries: vec![],
            options: vec![],
        });
        assert_eq!(commands.len(), 1);
    }

    #[test]
    fn test_archive_is_single_command() {
        let tc = toolchain(BuildType::Debug);
        let commands = tc.static_lib_commands(
            &[Utf8PathBuf::from("a.o"), Utf8PathBuf::from("b.o")],
            Utf8Path::new("libx.a"),
        );
        assert_eq!(commands, vec![vec!["/usr/bin/ar", "rcs", "libx.a", "a.o", "b.o"]]);
    }

    #[test]
    fn test_artifact_names() {
        let tc = toolchain(BuildType::Debug);
        assert_eq!(tc.artifact_name(ArtifactKind::StaticLibrary, "L"), "libL.a");
        assert_eq!(tc.artifact_name(ArtifactKind::SharedLibrary, "L"), "libL.so");
        assert_eq!(tc.artifact_name(ArtifactKind::Executable, "E"), "E");
        assert_eq!(tc.artifact_name(ArtifactKind::Object, "a"), "a.o");
    }

    #[test]
    fn test_parse_dependencies() {
        let tc = toolchain(BuildType::Debug);
        let contents = "/build/a.o: /src/a.c /src/include/a.h \\\n  /usr/include/stdio.h /src/my\\ dir/b.h\n";
        let deps = tc.parse_dependencies(Utf8Path::new("/build/a.o"), Utf8Path::new("/src/a.c"), contents);
        assert_eq!(
            deps,
            vec![
                Utf8PathBuf::from("/src/include/a.h"),
                "/usr/include/stdio.h".into(),
                "/src/my dir/b.h".into(),
            ]
        );
    }

    #[test]
    fn test_missing_archiver() {
        let mut tc = toolchain(BuildType::Debug).info;
        tc.tools.remove("ar");
        assert!(matches!(
            UnixToolchain::new(tc),
            Err(ConfigError::MissingTool { tool, .. }) if tool == "ar"
        ));
    }
}
