//! Layering rules, checked against the `use crate::...` paths in `src/`.

use std::fs;
use std::path::{Path, PathBuf};

fn sources(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            files.extend(sources(&path));
        } else if path.extension().is_some_and(|e| e == "rs") {
            files.push(path);
        }
    }
    files
}

/// Crate-local modules imported by the non-test code of `path`.
fn crate_imports(path: &Path) -> Vec<String> {
    let contents = fs::read_to_string(path).unwrap();
    let code = contents.split("#[cfg(test)]").next().unwrap_or_default();
    code.lines()
        .filter_map(|line| line.trim().strip_prefix("use crate::"))
        .filter_map(|rest| {
            rest.split(|c: char| c == ':' || c == ';' || c == '{')
                .next()
                .map(str::to_string)
        })
        .collect()
}

fn assert_no_imports(module: &str, forbidden: &[&str]) {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
    let dir = root.join(module);
    let files = if dir.is_dir() {
        sources(&dir)
    } else {
        vec![root.join(format!("{module}.rs"))]
    };
    assert!(!files.is_empty(), "no sources found for {module}");

    for file in files {
        for import in crate_imports(&file) {
            assert!(
                !forbidden.contains(&import.as_str()),
                "{} imports crate::{import}, which {module} must not depend on",
                file.display()
            );
        }
    }
}

#[test]
fn ui_layer_isolation() {
    assert_no_imports("ui", &["app", "pump", "worker", "bootstrap", "sim"]);
}

#[test]
fn net_module_independence() {
    assert_no_imports("net", &["session", "pump", "worker", "bootstrap", "app", "ui", "sim"]);
}

#[test]
fn session_core_does_not_reach_up() {
    assert_no_imports("session", &["app", "ui", "bootstrap", "worker", "sim"]);
    assert_no_imports("tree", &["session", "app", "ui", "sim"]);
}
