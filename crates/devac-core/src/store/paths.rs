//! On-disk layout of a package's seeds.
//!
//! ```text
//! {packageRoot}/.devac/seed/.lock
//! {packageRoot}/.devac/seed/{branch}/{table}.db
//! ```

use std::path::{Path, PathBuf};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::errors::{DevacError, DevacResult};
use crate::store::schema::SeedTable;

pub const DEVAC_DIR: &str = ".devac";
pub const SEED_DIR: &str = "seed";
const LOCK_FILE: &str = ".lock";
const TEMP_MARKER: &str = ".tmp-";

/// Bytes escaped in branch directory names. `%` is escaped so decoding is
/// exact and distinct branches never share a directory.
const BRANCH_DIR: &AsciiSet = &CONTROLS
    .add(b'%')
    .add(b'/')
    .add(b'\\')
    .add(b':')
    .add(b'*')
    .add(b'?')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'|');

pub fn seed_root(package_root: &Path) -> PathBuf {
    package_root.join(DEVAC_DIR).join(SEED_DIR)
}

pub fn lock_path(package_root: &Path) -> PathBuf {
    seed_root(package_root).join(LOCK_FILE)
}

/// Directory name for a branch: path separators and other unsafe bytes are
/// percent-encoded, so `feature/login` lives in `feature%2Flogin`.
pub fn branch_dir_name(branch: &str) -> DevacResult<String> {
    let trimmed = branch.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." || trimmed.starts_with('.') {
        return Err(DevacError::InvalidParams(format!(
            "invalid branch name {branch:?}"
        )));
    }
    Ok(utf8_percent_encode(trimmed, BRANCH_DIR).to_string())
}

/// Branch name stored in a directory made by [`branch_dir_name`].
pub fn branch_from_dir_name(dir_name: &str) -> String {
    percent_decode_str(dir_name).decode_utf8_lossy().into_owned()
}

pub fn branch_dir(package_root: &Path, branch: &str) -> DevacResult<PathBuf> {
    Ok(seed_root(package_root).join(branch_dir_name(branch)?))
}

pub fn table_path(package_root: &Path, branch: &str, table: SeedTable) -> DevacResult<PathBuf> {
    Ok(branch_dir(package_root, branch)?.join(table.file_name()))
}

/// Hidden sibling used while a table file is being staged.
pub fn temp_path_for(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    final_path.with_file_name(format!(
        ".{name}{TEMP_MARKER}{}-{nanos}",
        std::process::id()
    ))
}

pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .map(|n| {
            let n = n.to_string_lossy();
            n.starts_with('.') && n.contains(TEMP_MARKER)
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_convention() {
        let root = Path::new("/repo/packages/core");
        assert_eq!(
            table_path(root, "base", SeedTable::Nodes).unwrap(),
            PathBuf::from("/repo/packages/core/.devac/seed/base/nodes.db")
        );
        assert_eq!(
            branch_dir(root, "feature/login").unwrap(),
            PathBuf::from("/repo/packages/core/.devac/seed/feature%2Flogin")
        );
    }

    #[test]
    fn branch_dirs_are_distinct_and_reversible() {
        let slash = branch_dir_name("a/b").unwrap();
        let underscores = branch_dir_name("a__b").unwrap();
        let literal = branch_dir_name("a%2Fb").unwrap();
        assert_ne!(slash, underscores);
        assert_ne!(slash, literal);
        assert_eq!(underscores, "a__b");
        for branch in ["a/b", "a__b", "a%2Fb", "release/v1.2:rc", "base"] {
            let dir = branch_dir_name(branch).unwrap();
            assert!(!dir.contains('/'));
            assert_eq!(branch_from_dir_name(&dir), branch);
        }
    }

    #[test]
    fn rejects_hidden_or_empty_branches() {
        assert!(branch_dir_name("").is_err());
        assert!(branch_dir_name("..").is_err());
        assert!(branch_dir_name(".lock").is_err());
    }

    #[test]
    fn temp_files_are_recognised() {
        let tmp = temp_path_for(Path::new("/x/seed/base/edges.db"));
        assert!(is_temp_file(&tmp));
        assert!(!is_temp_file(Path::new("/x/seed/base/edges.db")));
    }
}
