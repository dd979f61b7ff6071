//! Package source scanning and path helpers for resolution passes.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tracing::debug;

use crate::config::ResolverConfig;

const LANGUAGE_BY_EXTENSION: &[(&str, &str)] = &[
    (".ts", "typescript"),
    (".tsx", "typescript"),
    (".mts", "typescript"),
    (".cts", "typescript"),
    (".js", "javascript"),
    (".jsx", "javascript"),
    (".mjs", "javascript"),
    (".cjs", "javascript"),
    (".py", "python"),
];

const TEST_DIRS: &[&str] = &["__tests__", "__mocks__", "__fixtures__"];

/// Extra ignore file honored next to `.gitignore`.
const IGNORE_FILE: &str = ".devacignore";

pub fn detect_language(path: &str) -> Option<&'static str> {
    let lower = path.to_lowercase();
    LANGUAGE_BY_EXTENSION
        .iter()
        .filter(|(ext, _)| lower.ends_with(ext))
        .map(|(_, lang)| *lang)
        .next()
}

/// Declaration-only and test files never contribute exports.
pub fn is_excluded_file(rel_path: &str) -> bool {
    let lower = rel_path.to_lowercase();
    let name = lower.rsplit('/').next().unwrap_or(&lower);
    if lower.ends_with(".d.ts") || lower.ends_with(".d.mts") || lower.ends_with(".d.cts") {
        return true;
    }
    if name.contains(".test.") || name.contains(".spec.") || name.contains(".stories.") {
        return true;
    }
    if name.ends_with(".py") && (name.starts_with("test_") || name.ends_with("_test.py")) {
        return true;
    }
    lower.split('/').any(|seg| TEST_DIRS.contains(&seg))
}

/// Source files under `package_root` that an extractor may read, as
/// package-relative POSIX paths. Dependency and build directories from
/// `config.excluded_dirs`, `.gitignore` and `.devacignore` rules apply.
pub fn iter_package_files(package_root: &Path, config: &ResolverConfig) -> Vec<String> {
    let excluded = config.excluded_dirs.clone();
    let walker = WalkBuilder::new(package_root)
        .hidden(false)
        .git_ignore(true)
        .git_exclude(false)
        .git_global(false)
        .require_git(false)
        .add_custom_ignore_filename(IGNORE_FILE)
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir || entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !excluded.iter().any(|d| d == name.as_ref())
        })
        .build();

    let mut files = Vec::new();
    for entry in walker.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let Some(rel) = relative_posix(package_root, entry.path()) else {
            continue;
        };
        if detect_language(&rel).is_none() || is_excluded_file(&rel) {
            continue;
        }
        files.push(rel);
    }
    files.sort();
    debug!(package = %package_root.display(), files = files.len(), "scanned package sources");
    files
}

pub fn relative_posix(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(rel.to_string_lossy().replace('\\', "/"))
}

/// Collapse `.` and `..` segments. `None` when the path climbs above its
/// root.
pub fn normalize_posix_path(path: &str) -> Option<String> {
    let mut stack: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                stack.pop()?;
            }
            _ => stack.push(part),
        }
    }
    Some(stack.join("/"))
}

/// Directory portion of a package-relative POSIX path.
pub fn parent_dir(rel_path: &str) -> &str {
    rel_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

pub fn join_posix(dir: &str, rel: &str) -> String {
    if dir.is_empty() {
        rel.to_string()
    } else {
        format!("{dir}/{rel}")
    }
}

/// File basename without extension; `__init__.py` and `index.*` name their
/// directory.
pub fn module_name(rel_path: &str) -> String {
    let file = rel_path.rsplit('/').next().unwrap_or(rel_path);
    let stem = file.split('.').next().unwrap_or(file);
    if stem == "__init__" || stem == "index" {
        let mut parts = rel_path.rsplit('/');
        parts.next();
        if let Some(dir) = parts.next() {
            return dir.to_string();
        }
    }
    stem.to_string()
}

pub fn absolute(package_root: &Path, rel_path: &str) -> PathBuf {
    package_root.join(rel_path)
}
