#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Project policy checks on the manifest and source tree.
//!
//! Synchronous filesystem reads only.

use std::path::{Path, PathBuf};

fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

fn read_project_file(relative_path: &str) -> String {
    let path = project_root().join(relative_path);
    std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read '{}': {e}", path.display()))
}

fn rust_files(dir: &Path, out: &mut Vec<PathBuf>) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            rust_files(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}

/// Source text before the first `#[cfg(test)]`.
fn non_test_source(path: &Path) -> String {
    let text = std::fs::read_to_string(path).unwrap();
    match text.find("#[cfg(test)]") {
        Some(at) => text[..at].to_string(),
        None => text,
    }
}

mod panic_policy {
    use super::*;

    const REQUIRED_DENY_LINTS: &[&str] = &[
        "unwrap_used",
        "expect_used",
        "panic",
        "todo",
        "unimplemented",
        "indexing_slicing",
    ];

    #[test]
    fn cargo_toml_denies_panic_prone_lints() {
        let cargo = read_project_file("Cargo.toml");
        assert!(cargo.contains("[lints.clippy]"), "missing [lints.clippy]");
        for lint in REQUIRED_DENY_LINTS {
            let pattern = format!("{lint} = \"deny\"");
            assert!(
                cargo.contains(&pattern),
                "Cargo.toml is missing `{pattern}` in [lints.clippy]"
            );
        }
    }

    #[test]
    fn library_code_has_no_unwrap_or_expect() {
        let mut files = Vec::new();
        rust_files(&project_root().join("src"), &mut files);
        assert!(!files.is_empty());
        for file in files {
            let source = non_test_source(&file);
            for needle in [".unwrap()", ".expect("] {
                assert!(
                    !source.contains(needle),
                    "{} calls `{needle}` outside its test module",
                    file.display()
                );
            }
        }
    }
}

mod manifest_policy {
    use super::*;

    #[test]
    fn websocket_transports_are_on_by_default() {
        let cargo = read_project_file("Cargo.toml");
        assert!(cargo.contains(r#"default = ["transport-websocket"]"#));
    }

    #[test]
    fn declared_demos_exist() {
        let cargo = read_project_file("Cargo.toml");
        for line in cargo.lines().filter(|l| l.starts_with("path = \"demos/")) {
            let path = line
                .trim_start_matches("path = \"")
                .trim_end_matches('"');
            assert!(
                project_root().join(path).is_file(),
                "demo '{path}' is declared in Cargo.toml but missing"
            );
        }
    }

    #[test]
    fn fuzz_crate_points_at_this_package() {
        let fuzz = read_project_file("fuzz/Cargo.toml");
        assert!(fuzz.contains("[dependencies.tabsync]"));
        assert!(fuzz.contains("path = \"..\""));
    }
}
