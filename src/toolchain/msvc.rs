use camino::{Utf8Path, Utf8PathBuf};

use super::diagnostics::{self, Diagnostic};
use super::{
    ArtifactKind, BuildType, CommandLine, CompileRequest, Language, LinkLibrary, LinkRequest,
    RuntimeType, Toolchain, ToolchainInfo,
};
use crate::error::ConfigError;

/// Microsoft Visual C++ toolchain (`cl`, `link`, `lib`).
#[derive(Debug)]
pub struct MsvcToolchain {
    info: ToolchainInfo,
    cl: Utf8PathBuf,
    link: Utf8PathBuf,
    lib: Utf8PathBuf,
}

impl MsvcToolchain {
    pub fn new(info: ToolchainInfo) -> Result<Self, ConfigError> {
        Ok(Self {
            cl: info.require("cc").or_else(|_| info.require("cl"))?,
            link: info.require("link")?,
            lib: info.require("lib")?,
            info,
        })
    }

    fn runtime_flag(&self) -> &'static str {
        let debug = self.info.settings.build_type.is_debug_mode();
        match (self.info.settings.runtime, debug) {
            (RuntimeType::Dynamic, false) => "/MD",
            (RuntimeType::Dynamic, true) => "/MDd",
            (RuntimeType::Static, false) => "/MT",
            (RuntimeType::Static, true) => "/MTd",
        }
    }

    fn optimization_flags(&self) -> &'static [&'static str] {
        match self.info.settings.build_type {
            BuildType::Debug => &["/Od", "/Zi", "/FS"],
            BuildType::Release => &["/O2", "/DNDEBUG"],
            BuildType::ReleaseMinSize => &["/Os", "/DNDEBUG"],
            BuildType::ReleaseDebugInfos => &["/O2", "/Zi", "/FS", "/DNDEBUG"],
        }
    }

    fn has_debug_infos(&self) -> bool {
        matches!(
            self.info.settings.build_type,
            BuildType::Debug | BuildType::ReleaseDebugInfos
        )
    }

    fn link_args(&self, request: &LinkRequest, args: &mut CommandLine) {
        args.push("/nologo".into());
        if self.has_debug_infos() {
            args.push("/DEBUG".into());
        }
        args.extend(request.objects.iter().map(ToString::to_string));

        for library in &request.libraries {
            match library {
                LinkLibrary::Path(path) => args.push(path.to_string()),
                LinkLibrary::Name { name, dir } => {
                    if let Some(dir) = dir {
                        args.push(format!("/LIBPATH:{dir}"));
                    }
                    args.push(format!("{name}.lib"));
                }
            }
        }

        args.extend(self.info.settings.link_flags.iter().cloned());
        args.extend(request.options.iter().cloned());
    }
}

impl Toolchain for MsvcToolchain {
    fn info(&self) -> &ToolchainInfo {
        &self.info
    }

    fn artifact_name(&self, kind: ArtifactKind, name: &str) -> String {
        match kind {
            ArtifactKind::Object => format!("{name}.obj"),
            ArtifactKind::StaticLibrary | ArtifactKind::ImportLibrary => format!("{name}.lib"),
            ArtifactKind::SharedLibrary => format!("{name}.dll"),
            ArtifactKind::Executable => format!("{name}.exe"),
        }
    }

    fn compile_command(&self, request: &CompileRequest) -> CommandLine {
        let settings = &self.info.settings;
        let mut args = vec![self.cl.to_string(), "/nologo".into()];

        args.extend(self.optimization_flags().iter().map(|s| s.to_string()));
        args.push(self.runtime_flag().into());
        if request.language == Language::Cxx {
            args.push("/EHsc".into());
            args.extend(settings.cxx_flags.iter().cloned());
        }
        args.extend(settings.compile_flags.iter().cloned());
        args.extend(request.options.iter().cloned());
        args.extend(request.definitions.iter().map(|d| format!("/D{d}")));
        args.extend(request.includes.iter().map(|i| format!("/I{i}")));

        args.push("/sourceDependencies".into());
        args.push(self.dependency_file(&request.object).to_string());
        args.push(format!("/Fo{}", request.object));
        if self.has_debug_infos() {
            args.push(format!("/Fd{}", request.object.with_extension("pdb")));
        }
        args.push("/c".into());
        args.push(match request.language {
            Language::C => format!("/Tc{}", request.source),
            Language::Cxx => format!("/Tp{}", request.source),
        });
        args
    }

    fn link_commands(&self, request: &LinkRequest) -> Vec<CommandLine> {
        let mut args = vec![self.link.to_string()];
        self.link_args(request, &mut args);
        args.push(format!("/OUT:{}", request.output));
        vec![args]
    }

    fn static_lib_commands(&self, objects: &[Utf8PathBuf], output: &Utf8Path) -> Vec<CommandLine> {
        let mut args = vec![self.lib.to_string(), "/nologo".into()];
        args.extend(objects.iter().map(ToString::to_string));
        args.push(format!("/OUT:{output}"));
        vec![args]
    }

    fn shared_lib_commands(&self, request: &LinkRequest) -> Vec<CommandLine> {
        let mut args = vec![self.link.to_string(), "/DLL".into()];
        self.link_args(request, &mut args);
        args.push(format!("/IMPLIB:{}", self.import_library(&request.output)));
        args.push(format!("/OUT:{}", request.output));
        vec![args]
    }

    fn dependency_file(&self, object: &Utf8Path) -> Utf8PathBuf {
        object.with_extension("json")
    }

    fn parse_dependencies(
        &self,
        object: &Utf8Path,
        source: &Utf8Path,
        contents: &str,
    ) -> Vec<Utf8PathBuf> {
        let Ok(json) = serde_json::from_str::<serde_json::Value>(contents) else {
            tracing::warn!("unreadable dependency file for {object}");
            return Vec::new();
        };

        json.pointer("/Data/Includes")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|v| v.as_str())
            .map(Utf8PathBuf::from)
            .filter(|p| p != source && p != object)
            .collect()
    }

    fn parse_compile_output(&self, output: &str) -> Vec<Diagnostic> {
        diagnostics::parse_msvc(output)
    }

    fn parse_link_output(&self, output: &str) -> (Vec<Diagnostic>, Vec<String>) {
        diagnostics::parse_msvc_link(output)
    }

    fn export_definitions(&self, name: &str) -> Option<(String, String)> {
        let macro_name: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        Some((
            format!("{macro_name}_EXPORT=1"),
            format!("{macro_name}_IMPORT=1"),
        ))
    }

    fn import_library(&self, output: &Utf8Path) -> Utf8PathBuf {
        output.with_extension("lib")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::toolchain::{ToolchainKind, ToolchainSettings};

    fn toolchain(build_type: BuildType) -> MsvcToolchain {
        let tools: BTreeMap<String, Utf8PathBuf> =
            [("cc", "cl.exe"), ("link", "link.exe"), ("lib", "lib.exe")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.into()))
                .collect();

        MsvcToolchain::new(ToolchainInfo {
            name: "msvc".into(),
            kind: ToolchainKind::Msvc,
            vendor: "msvc".into(),
            version: None,
            arch: "x64".into(),
            system: "windows".into(),
            tools,
            env: BTreeMap::new(),
            settings: ToolchainSettings {
                build_type,
                ..Default::default()
            },
        })
        .unwrap()
    }

    #[test]
    fn test_compile_command_debug() {
        let tc = toolchain(BuildType::Debug);
        let argv = tc.compile_command(&CompileRequest {
            source: "src/a.cpp".into(),
            object: "build/a.obj".into(),
            language: Language::Cxx,
            includes: vec!["inc".into()],
            definitions: vec!["X".into()],
            options: vec![],
        });

        assert_eq!(
            argv,
            [
                "cl.exe", "/nologo", "/Od", "/Zi", "/FS", "/MDd", "/EHsc", "/DX", "/Iinc",
                "/sourceDependencies", "build/a.json", "/Fobuild/a.obj", "/Fdbuild/a.pdb", "/c",
                "/Tpsrc/a.cpp",
            ]
        );
    }

    #[test]
    fn test_shared_library_commands() {
        let tc = toolchain(BuildType::Release);
        let commands = tc.shared_lib_commands(&LinkRequest {
            objects: vec!["a.obj".into()],
            output: "out/core.dll".into(),
            libraries: vec![LinkLibrary::Name {
                name: "zlib".into(),
                dir: Some("C:/z/lib".into()),
            }],
            options: vec![],
        });

        assert_eq!(
            commands[0],
            [
                "link.exe", "/DLL", "/nologo", "a.obj", "/LIBPATH:C:/z/lib", "zlib.lib",
                "/IMPLIB:out/core.lib", "/OUT:out/core.dll",
            ]
        );
    }

    #[test]
    fn test_source_dependencies_json() {
        let tc = toolchain(BuildType::Debug);
        let contents = r#"{"Version":"1.1","Data":{"Source":"c:/src/a.cpp","Includes":["c:/src/a.h","c:/sdk/windows.h"]}}"#;
        let deps = tc.parse_dependencies(
            Utf8Path::new("a.obj"),
            Utf8Path::new("c:/src/a.cpp"),
            contents,
        );
        assert_eq!(deps, vec![Utf8PathBuf::from("c:/src/a.h"), "c:/sdk/windows.h".into()]);
        assert!(tc.parse_dependencies(Utf8Path::new("a.obj"), Utf8Path::new("a.cpp"), "garbage").is_empty());
    }

    #[test]
    fn test_export_definitions() {
        let tc = toolchain(BuildType::Debug);
        assert_eq!(
            tc.export_definitions("my-lib"),
            Some(("MY_LIB_EXPORT=1".into(), "MY_LIB_IMPORT=1".into()))
        );
    }
}
