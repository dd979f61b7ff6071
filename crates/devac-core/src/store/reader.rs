//! Seed reads: raw per-branch tables and the base + delta overlay.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::DevacResult;
use crate::models::{Edge, Effect, ExternalRef, Node, BASE_BRANCH};
use crate::store::paths::{self, is_temp_file};
use crate::store::schema::{select_all, SeedRow, SeedTable};

/// Per-table row counts for one branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedStats {
    pub branch: String,
    pub nodes: usize,
    pub edges: usize,
    pub external_refs: usize,
    pub effects: usize,
    pub tombstones: usize,
    pub files: usize,
}

/// Open a committed table file read-only. A missing file reads as empty.
pub fn read_table_file<R: SeedRow>(path: &Path) -> DevacResult<Vec<R>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    select_all(&conn)
}

/// Overlay `delta` onto `base` by overlay key. Later rows win; tombstoned
/// keys are dropped from the result.
pub fn overlay<R: SeedRow>(base: Vec<R>, delta: Vec<R>) -> Vec<R> {
    let mut merged: IndexMap<String, R> = IndexMap::with_capacity(base.len() + delta.len());
    for row in base.into_iter().chain(delta) {
        merged.insert(row.overlay_key(), row);
    }
    merged.into_values().filter(|r| !r.is_deleted()).collect()
}

#[derive(Debug, Clone)]
pub struct SeedReader {
    package_root: PathBuf,
}

impl SeedReader {
    pub fn new(package_root: impl Into<PathBuf>) -> Self {
        Self {
            package_root: package_root.into(),
        }
    }

    pub fn package_root(&self) -> &Path {
        &self.package_root
    }

    pub fn table_path(&self, branch: &str, table: SeedTable) -> DevacResult<PathBuf> {
        paths::table_path(&self.package_root, branch, table)
    }

    /// Raw rows of one branch: the snapshot for `base`, the delta (tombstones
    /// included) for any other branch.
    pub fn read_table<R: SeedRow>(&self, branch: &str) -> DevacResult<Vec<R>> {
        read_table_file(&self.table_path(branch, R::TABLE)?)
    }

    /// Logical view of `branch`: base rows overlaid with the branch delta.
    pub fn read_merged<R: SeedRow>(&self, branch: &str) -> DevacResult<Vec<R>> {
        let base: Vec<R> = self.read_table(BASE_BRANCH)?;
        if branch == BASE_BRANCH {
            return Ok(base.into_iter().filter(|r| !r.is_deleted()).collect());
        }
        let delta: Vec<R> = self.read_table(branch)?;
        debug!(
            table = R::TABLE.name(),
            branch,
            base = base.len(),
            delta = delta.len(),
            "overlaying branch delta"
        );
        Ok(overlay(base, delta))
    }

    /// Live rows of `file_path` in the logical view of `branch`.
    pub fn read_file_rows<R: SeedRow>(&self, branch: &str, file_path: &str) -> DevacResult<Vec<R>> {
        Ok(self
            .read_merged::<R>(branch)?
            .into_iter()
            .filter(|r| r.source_file() == file_path)
            .collect())
    }

    pub fn read_nodes(&self, branch: &str) -> DevacResult<Vec<Node>> {
        self.read_table(branch)
    }

    pub fn read_edges(&self, branch: &str) -> DevacResult<Vec<Edge>> {
        self.read_table(branch)
    }

    pub fn read_external_refs(&self, branch: &str) -> DevacResult<Vec<ExternalRef>> {
        self.read_table(branch)
    }

    pub fn read_effects(&self, branch: &str) -> DevacResult<Vec<Effect>> {
        self.read_table(branch)
    }

    pub fn read_nodes_merged(&self, branch: &str) -> DevacResult<Vec<Node>> {
        self.read_merged(branch)
    }

    pub fn read_edges_merged(&self, branch: &str) -> DevacResult<Vec<Edge>> {
        self.read_merged(branch)
    }

    pub fn read_external_refs_merged(&self, branch: &str) -> DevacResult<Vec<ExternalRef>> {
        self.read_merged(branch)
    }

    pub fn read_effects_merged(&self, branch: &str) -> DevacResult<Vec<Effect>> {
        self.read_merged(branch)
    }

    /// Whether any committed table file exists for `branch`.
    pub fn has_seed(&self, branch: &str) -> DevacResult<bool> {
        for table in SeedTable::ALL {
            if self.table_path(branch, table)?.is_file() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Branch directories that hold at least one committed table file.
    pub fn branches(&self) -> DevacResult<Vec<String>> {
        let root = paths::seed_root(&self.package_root);
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let path = entry?.path();
            if !path.is_dir() || is_temp_file(&path) {
                continue;
            }
            let has_table = SeedTable::ALL
                .iter()
                .any(|t| path.join(t.file_name()).is_file());
            if has_table {
                if let Some(name) = path.file_name() {
                    out.push(paths::branch_from_dir_name(&name.to_string_lossy()));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Raw row counts for `branch`; `files` counts distinct node files.
    pub fn stats(&self, branch: &str) -> DevacResult<SeedStats> {
        let nodes = self.read_nodes(branch)?;
        let edges = self.read_edges(branch)?;
        let refs = self.read_external_refs(branch)?;
        let effects = self.read_effects(branch)?;

        let tombstones = nodes.iter().filter(|r| r.is_deleted).count()
            + edges.iter().filter(|r| r.is_deleted).count()
            + refs.iter().filter(|r| r.is_deleted).count()
            + effects.iter().filter(|r| r.is_deleted).count();
        let mut files: Vec<&str> = nodes.iter().map(|n| n.file_path.as_str()).collect();
        files.sort_unstable();
        files.dedup();

        Ok(SeedStats {
            branch: branch.to_string(),
            nodes: nodes.len(),
            edges: edges.len(),
            external_refs: refs.len(),
            effects: effects.len(),
            tombstones,
            files: files.len(),
        })
    }
}
