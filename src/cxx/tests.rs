use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use super::*;
use crate::graph::{Graph, Scope, Session};
use crate::install::{InstallMode, InstallSettings};
use crate::node::Phase;
use crate::testutil::{FakeRunner, backdate, cxx_session, past, set_mtime, utf8_tempdir};

fn write(root: &Utf8Path, path: &str, contents: &str) -> Utf8PathBuf {
    let path = root.join(path);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, contents).unwrap();
    set_mtime(&path, past(100));
    path
}

fn project(root: &Utf8Path) {
    write(root, "l/a.c", "int a() { return 1; }");
    write(root, "l/b.c", "int b() { return 2; }");
    write(root, "l/include/l.h", "int a(); int b();");
    write(root, "main.c", "int main() { return a() + b(); }");
}

/// Static library `l` from two sources, executable `e` linking it.
fn declare(session: &Arc<Session>) -> Graph {
    let graph = Graph::new(Scope::root(session));
    let l = graph
        .add("l", Library::new().sources(["l/*.c"]).include("l/include"))
        .unwrap();
    let e = graph
        .add("e", Executable::new().sources(["main.c"]))
        .unwrap();
    e.depends_on(&l, Visibility::Private);
    graph
}

fn compiled(runner: &FakeRunner) -> Vec<String> {
    runner
        .commands()
        .iter()
        .filter(|argv| argv.iter().any(|a| a == "-c"))
        .filter_map(|argv| argv.last().cloned())
        .collect()
}

#[tokio::test]
async fn test_incremental_rebuilds() {
    let (_dir, root) = utf8_tempdir();
    project(&root);
    let runner = Arc::new(FakeRunner::new());

    let graph = declare(&cxx_session(&root, &runner));
    graph.build(&[]).await.unwrap();
    // Three compiles, one archive, one link.
    assert_eq!(runner.invocations(), 5);
    assert!(root.join("build/libl.a").exists());
    assert!(root.join("build/e").exists());
    assert!(root.join("build/compile_commands.json").exists());

    runner.clear();
    let graph = declare(&cxx_session(&root, &runner));
    graph.build(&[]).await.unwrap();
    assert_eq!(runner.invocations(), 0);

    // A link-only option relinks without recompiling.
    runner.clear();
    let graph = declare(&cxx_session(&root, &runner));
    graph.assign("e.link_options+=-s").unwrap();
    graph.build(&[]).await.unwrap();
    assert_eq!(runner.invocations(), 1);
    assert!(runner.commands()[0].contains(&"-s".to_string()));

    // One touched source: one compile, the archive and the link.
    backdate(&root.join("build"), past(60));
    set_mtime(&root.join("l/a.c"), past(30));
    runner.clear();
    let graph = declare(&cxx_session(&root, &runner));
    graph.build(&[]).await.unwrap();
    assert_eq!(runner.invocations(), 3);
    assert_eq!(compiled(&runner), [root.join("l/a.c").to_string()]);

    runner.clear();
    let graph = declare(&cxx_session(&root, &runner));
    graph.build(&[]).await.unwrap();
    assert_eq!(runner.invocations(), 0);
}

#[tokio::test]
async fn test_command_line_change_recompiles() {
    let (_dir, root) = utf8_tempdir();
    project(&root);
    let runner = Arc::new(FakeRunner::new());

    declare(&cxx_session(&root, &runner)).build(&[]).await.unwrap();

    runner.clear();
    let session = cxx_session(&root, &runner);
    let graph = Graph::new(Scope::root(&session));
    let l = graph
        .add("l", Library::new().sources(["l/*.c"]).include("l/include"))
        .unwrap();
    let e = graph
        .add("e", Executable::new().sources(["main.c"]).define("VERBOSE"))
        .unwrap();
    e.depends_on(&l, Visibility::Private);
    graph.build(&[]).await.unwrap();

    assert_eq!(compiled(&runner), [root.join("main.c").to_string()]);
    assert_eq!(runner.invocations(), 2);
}

#[tokio::test]
async fn test_header_change_recompiles_includers() {
    let (_dir, root) = utf8_tempdir();
    write(&root, "main.c", "#include \"config.h\"");
    let header = write(&root, "config.h", "#define N 1");
    let runner = Arc::new(FakeRunner::new());
    runner.set_headers(vec![header.clone()]);

    let session = cxx_session(&root, &runner);
    let graph = Graph::new(Scope::root(&session));
    graph.add("app", Executable::new().sources(["*.c"])).unwrap();
    graph.build(&[]).await.unwrap();
    assert_eq!(runner.invocations(), 2);

    let unit = session.find("app.main.c").unwrap();
    assert_eq!(unit.cached::<Vec<Utf8PathBuf>>("deps"), Some(vec![header.clone()]));

    backdate(&root.join("build"), past(60));
    set_mtime(&header, past(30));
    runner.clear();
    let session = cxx_session(&root, &runner);
    let graph = Graph::new(Scope::root(&session));
    graph.add("app", Executable::new().sources(["*.c"])).unwrap();
    graph.build(&[]).await.unwrap();
    assert_eq!(runner.invocations(), 2);
}

#[tokio::test]
async fn test_compile_error_stops_the_link() {
    let (_dir, root) = utf8_tempdir();
    project(&root);
    let runner = Arc::new(FakeRunner::new());
    runner.fail_on("b.c");

    let session = cxx_session(&root, &runner);
    let graph = declare(&session);
    let err = graph.build(&[]).await.unwrap_err();

    let diagnostics = err.diagnostics();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].message, "forced failure");
    assert_eq!(session.find("l").unwrap().phase(), Phase::Failed);
    assert!(!root.join("build/e").exists());
    assert!(runner.commands().iter().all(|argv| !argv[0].ends_with("ar")));

    runner.clear_failures();
    runner.clear();
    declare(&cxx_session(&root, &runner)).build(&[]).await.unwrap();
    assert!(compiled(&runner).contains(&root.join("l/b.c").to_string()));
    assert!(root.join("build/e").exists());
}

#[tokio::test]
async fn test_link_error_reports_undefined_symbols() {
    let (_dir, root) = utf8_tempdir();
    write(&root, "main.c", "int main() { return missing_symbol(); }");
    let runner = Arc::new(FakeRunner::new());
    runner.fail_on("app");

    let session = cxx_session(&root, &runner);
    let graph = Graph::new(Scope::root(&session));
    graph.add("app", Executable::new().sources(["main.c"])).unwrap();
    let err = graph.build(&[]).await.unwrap_err();
    assert!(err.to_string().contains("missing_symbol"), "{err}");
}

#[tokio::test]
async fn test_usage_requirements_follow_visibility() {
    let (_dir, root) = utf8_tempdir();
    write(&root, "core/core.c", "");
    write(&root, "util/util.c", "");
    write(&root, "main.c", "");
    let runner = Arc::new(FakeRunner::new());

    let session = cxx_session(&root, &runner);
    let graph = Graph::new(Scope::root(&session));
    let core = graph
        .add(
            "core",
            Library::new()
                .sources(["core/*.c"])
                .include("core/include")
                .define("CORE_API")
                .private_define("CORE_BUILD"),
        )
        .unwrap();
    let util = graph
        .add("util", Library::new().sources(["util/*.c"]).define("UTIL_API"))
        .unwrap();
    let app = graph.add("app", Executable::new().sources(["main.c"])).unwrap();
    util.depends_on(&core, Visibility::Public);
    app.depends_on(&util, Visibility::Private);
    app.initialize().await.unwrap();

    let request = |name: &str| {
        let unit = session.find(name).unwrap();
        unit.kind_as::<CompileUnit>().unwrap().request(&unit).unwrap()
    };

    let core_unit = request("core.core/core.c");
    assert!(core_unit.definitions.contains(&"CORE_API".to_string()));
    assert!(core_unit.definitions.contains(&"CORE_BUILD".to_string()));

    let app_unit = request("app.main.c");
    assert_eq!(app_unit.definitions, ["UTIL_API", "CORE_API"]);
    assert_eq!(app_unit.includes, [root.join("core/include")]);

    // Dependents come before their dependencies on the link line.
    assert_eq!(
        link_closure(&app),
        [
            LinkLibrary::Path(root.join("build/libutil.a")),
            LinkLibrary::Path(root.join("build/libcore.a")),
        ]
    );
}

#[tokio::test]
async fn test_shared_library_hides_private_dependencies() {
    let (_dir, root) = utf8_tempdir();
    write(&root, "impl/impl.c", "");
    write(&root, "api/api.c", "");
    write(&root, "main.c", "");
    let runner = Arc::new(FakeRunner::new());

    let session = cxx_session(&root, &runner);
    let graph = Graph::new(Scope::root(&session));
    let imp = graph
        .add(
            "impl",
            Library::new()
                .sources(["impl/*.c"])
                .private_link_library(LinkLibrary::Name { name: "m".into(), dir: None }),
        )
        .unwrap();
    let api = graph
        .add("api", Library::new().sources(["api/*.c"]).library_type(LibraryType::Shared))
        .unwrap();
    let app = graph.add("app", Executable::new().sources(["main.c"])).unwrap();
    api.depends_on(&imp, Visibility::Private);
    app.depends_on(&api, Visibility::Private);
    graph.build(&[]).await.unwrap();

    let shared = root.join("build/libapi.so");
    assert_eq!(link_closure(&app), [LinkLibrary::Path(shared.clone())]);
    assert_eq!(runtime_closure(&app), [shared.clone()]);

    // The static archive and its own link libraries end up in the shared
    // library, built position independent.
    let commands = runner.commands();
    let link = commands.iter().find(|argv| argv.contains(&"-shared".to_string())).unwrap();
    assert!(link.contains(&root.join("build/libimpl.a").to_string()));
    assert!(link.contains(&"-lm".to_string()));
    let compile = commands
        .iter()
        .find(|argv| argv.last() == Some(&root.join("api/api.c").to_string()))
        .unwrap();
    assert!(compile.contains(&"-fPIC".to_string()));
}

#[tokio::test]
async fn test_interface_library_has_no_artifact() {
    let (_dir, root) = utf8_tempdir();
    write(&root, "main.c", "");
    let runner = Arc::new(FakeRunner::new());

    let session = cxx_session(&root, &runner);
    let graph = Graph::new(Scope::root(&session));
    let headers = graph
        .add("headers", Library::new().include("include").define("HEADERS_ONLY"))
        .unwrap();
    let app = graph.add("app", Executable::new().sources(["main.c"])).unwrap();
    app.depends_on(&headers, Visibility::Private);
    graph.build(&[]).await.unwrap();

    assert_eq!(headers.kind_as::<Library>().unwrap().kind_of(), Some(LibraryType::Interface));
    assert_eq!(headers.output(), None);
    assert!(headers.stamp_path().exists());
    assert!(link_closure(&app).is_empty());
}

#[tokio::test]
async fn test_type_option_overrides_declaration() {
    let (_dir, root) = utf8_tempdir();
    write(&root, "x.c", "");
    let runner = Arc::new(FakeRunner::new());

    let session = cxx_session(&root, &runner);
    let graph = Graph::new(Scope::root(&session));
    let lib = graph.add("x", Library::new().sources(["x.c"])).unwrap();
    graph.assign("x.type=shared").unwrap();
    graph.build(&[]).await.unwrap();

    assert_eq!(lib.output(), Some(root.join("build/libx.so")));
    graph.assign("x.type=dynamic").unwrap();
    session.save().await.unwrap();
    let session = cxx_session(&root, &runner);
    let graph = Graph::new(Scope::root(&session));
    graph.add("x", Library::new().sources(["x.c"])).unwrap();
    assert!(graph.build(&[]).await.is_err());
}

#[tokio::test]
async fn test_invalid_output_name() {
    let (_dir, root) = utf8_tempdir();
    let runner = Arc::new(FakeRunner::new());
    let session = cxx_session(&root, &runner);
    let graph = Graph::new(Scope::root(&session));
    graph
        .add("app", Executable::new().output_name("bin/app"))
        .unwrap();
    let err = graph.build(&[]).await.unwrap_err();
    assert!(err.to_string().contains("invalid output 'bin/app'"), "{err}");
}

#[tokio::test]
async fn test_install_modes() {
    let (_dir, root) = utf8_tempdir();
    project(&root);
    let runner = Arc::new(FakeRunner::new());
    let settings = InstallSettings::new(root.join("dist"));

    let session = cxx_session(&root, &runner);
    let graph = declare(&session);
    let files = graph.install(&[], &settings, InstallMode::User).await.unwrap();
    assert_eq!(files, [root.join("dist/bin/e")]);

    let dev = InstallSettings::new(root.join("dev"));
    let files = graph.install(&[], &dev, InstallMode::Dev).await.unwrap();
    assert_eq!(
        files,
        [
            root.join("dev/bin/e"),
            root.join("dev/include/l.h"),
            root.join("dev/lib/libl.a"),
        ]
    );
}

#[tokio::test]
async fn test_portable_install_ships_shared_libraries() {
    let (_dir, root) = utf8_tempdir();
    write(&root, "s.c", "");
    write(&root, "main.c", "");
    let runner = Arc::new(FakeRunner::new());

    let session = cxx_session(&root, &runner);
    let graph = Graph::new(Scope::root(&session));
    let lib = graph
        .add("s", Library::new().sources(["s.c"]).library_type(LibraryType::Shared))
        .unwrap();
    lib.set_installed(false);
    let app = graph.add("app", Executable::new().sources(["main.c"])).unwrap();
    app.depends_on(&lib, Visibility::Private);

    let settings = InstallSettings::new(root.join("dist"));
    let files = graph.install(&["app"], &settings, InstallMode::Portable).await.unwrap();
    assert_eq!(files, [root.join("dist/bin/app"), root.join("dist/lib/libs.so")]);
    assert_eq!(runtime_dependencies(&app).await.unwrap(), [root.join("build/libs.so")]);
}
