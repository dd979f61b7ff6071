//! Atomic seed writes.
//!
//! Every operation follows the same sequence under the seed root lock:
//!
//! 1. load the committed table file into a pooled in-memory engine,
//! 2. delete and insert the affected rows inside a transaction,
//! 3. `VACUUM INTO` a hidden temp file beside the target,
//! 4. once every touched table is staged, rename each over its target and
//!    fsync the directory.
//!
//! A failure before step 4 drops the staged files, leaving the committed
//! seed byte-identical. `base` deletes compact (rows removed, empty files
//! unlinked); other branches only append tombstones.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rusqlite::backup::Progress;
use rusqlite::{params, Connection, DatabaseName};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::errors::{DevacError, DevacResult};
use crate::models::{
    now_rfc3339, Edge, EdgeType, Effect, ExternalRef, Node, ParseResult, ResolvedRef, BASE_BRANCH,
};
use crate::store::atomic::{clean_temp_files, fsync_dir, remove_durably, StagedFile};
use crate::store::lock::{DirLock, DEFAULT_LOCK_TIMEOUT};
use crate::store::paths;
use crate::store::pool::{reset_engine, EnginePool};
use crate::store::reader::SeedReader;
use crate::store::schema::{ensure_schema, SeedRow, SeedTable};

/// Outcome of one seed write. Failures are reported here, not raised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    pub success: bool,
    pub files_processed: usize,
    pub nodes_written: usize,
    pub edges_written: usize,
    pub external_refs_written: usize,
    pub effects_written: usize,
    pub tombstones_written: usize,
    /// Files left alone because their source hash was unchanged.
    pub files_skipped: usize,
    pub time_ms: u64,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Table staging
// ---------------------------------------------------------------------------

enum TableOutcome {
    Unchanged,
    Stage(StagedFile),
    Remove(PathBuf),
}

/// Rows to replace or append in one table.
struct TablePlan<R> {
    /// Files whose existing rows are deleted before inserting.
    replace_files: Vec<String>,
    rows: Vec<R>,
    tombstones: Vec<R>,
}

impl<R: SeedRow> TablePlan<R> {
    fn empty() -> Self {
        Self {
            replace_files: Vec::new(),
            rows: Vec::new(),
            tombstones: Vec::new(),
        }
    }

    fn is_noop(&self) -> bool {
        self.replace_files.is_empty() && self.rows.is_empty() && self.tombstones.is_empty()
    }

    fn apply(&self, conn: &Connection) -> DevacResult<bool> {
        let mut changed = false;
        if !self.replace_files.is_empty() {
            let mut stmt = conn.prepare_cached(&format!(
                "DELETE FROM {} WHERE {} = ?1;",
                R::TABLE.name(),
                R::FILE_COLUMN
            ))?;
            for file in &self.replace_files {
                changed |= stmt.execute(params![file])? > 0;
            }
        }
        for row in self.rows.iter().chain(&self.tombstones) {
            row.insert(conn)?;
            changed = true;
        }
        Ok(changed)
    }
}

/// Load the committed `path` into `conn`, run `edit`, and stage the result.
fn stage_table<F>(
    conn: &mut Connection,
    path: &Path,
    table: SeedTable,
    edit: F,
) -> DevacResult<TableOutcome>
where
    F: FnOnce(&Connection) -> DevacResult<bool>,
{
    reset_engine(conn)?;
    let existed = path.is_file();
    if existed {
        conn.restore(DatabaseName::Main, path, None::<fn(Progress)>)?;
    }
    ensure_schema(conn, table)?;

    let tx = conn.transaction()?;
    let changed = edit(&tx)?;
    tx.commit()?;
    if !changed {
        return Ok(TableOutcome::Unchanged);
    }

    let remaining: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {};", table.name()),
        [],
        |row| row.get(0),
    )?;
    if remaining == 0 {
        return Ok(if existed {
            TableOutcome::Remove(path.to_path_buf())
        } else {
            TableOutcome::Unchanged
        });
    }

    let staged = StagedFile::new(path);
    let temp = staged.temp_path().to_string_lossy().into_owned();
    conn.execute("VACUUM INTO ?1;", params![temp])?;
    Ok(TableOutcome::Stage(staged))
}

fn stage_plan<R: SeedRow>(
    conn: &mut Connection,
    dir: &Path,
    plan: &TablePlan<R>,
) -> DevacResult<TableOutcome> {
    if plan.is_noop() {
        return Ok(TableOutcome::Unchanged);
    }
    let path = dir.join(R::TABLE.file_name());
    stage_table(conn, &path, R::TABLE, |tx| plan.apply(tx))
}

/// Rename every staged table into place; only runs once all staging
/// succeeded.
fn commit_outcomes(outcomes: Vec<TableOutcome>) -> DevacResult<()> {
    for outcome in outcomes {
        match outcome {
            TableOutcome::Unchanged => {}
            TableOutcome::Stage(staged) => staged.commit()?,
            TableOutcome::Remove(path) => {
                remove_durably(&path)?;
                debug!(path = %path.display(), "removed emptied seed table");
            }
        }
    }
    Ok(())
}

fn stamp_all<R: SeedRow>(rows: &[R], branch: &str, deleted: bool, now: &str) -> Vec<R> {
    rows.iter()
        .cloned()
        .map(|mut r| {
            r.stamp(branch, deleted, now);
            r
        })
        .collect()
}

/// Base rows of `files` that the new parse no longer produces.
fn vanished<R: SeedRow>(base: &[R], files: &HashSet<&str>, fresh: &[R], branch: &str, now: &str) -> Vec<R> {
    let kept: HashSet<String> = fresh.iter().map(|r| r.overlay_key()).collect();
    let gone: Vec<R> = base
        .iter()
        .filter(|r| files.contains(r.source_file()) && !kept.contains(&r.overlay_key()))
        .cloned()
        .collect();
    stamp_all(&gone, branch, true, now)
}

fn fill_hash(hash: &mut String, source: &str) {
    if hash.is_empty() {
        *hash = source.to_string();
    }
}

// ---------------------------------------------------------------------------
// SeedWriter
// ---------------------------------------------------------------------------

/// Writer for one package's seed directory.
#[derive(Debug, Clone)]
pub struct SeedWriter {
    package_root: PathBuf,
    pool: EnginePool,
    lock_timeout: Duration,
}

impl SeedWriter {
    pub fn new(package_root: impl Into<PathBuf>, pool: EnginePool) -> Self {
        Self {
            package_root: package_root.into(),
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn package_root(&self) -> &Path {
        &self.package_root
    }

    fn reader(&self) -> SeedReader {
        SeedReader::new(&self.package_root)
    }

    /// Lock the seed root, sweep crash leftovers in the branch directory and
    /// run `op`. Errors become a failed [`WriteResult`].
    fn locked<F>(&self, op_name: &str, branch: &str, op: F) -> WriteResult
    where
        F: FnOnce(&Path, &mut WriteResult) -> DevacResult<()>,
    {
        let start = Instant::now();
        let mut result = WriteResult::default();
        let outcome = (|| -> DevacResult<()> {
            let dir = paths::branch_dir(&self.package_root, branch)?;
            let _lock = DirLock::acquire(&paths::lock_path(&self.package_root), self.lock_timeout)?;
            fs::create_dir_all(&dir)?;
            clean_temp_files(&dir)?;
            op(&dir, &mut result)
        })();
        result.time_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                result.success = true;
                debug!(
                    op = op_name,
                    branch,
                    package = %self.package_root.display(),
                    nodes = result.nodes_written,
                    tombstones = result.tombstones_written,
                    elapsed_ms = result.time_ms,
                    "seed write committed"
                );
            }
            Err(e) => {
                warn!(
                    "Failed to {} for package={} branch={}: {}",
                    op_name,
                    self.package_root.display(),
                    branch,
                    e
                );
                result = WriteResult {
                    success: false,
                    time_ms: result.time_ms,
                    error: Some(e.to_string()),
                    ..WriteResult::default()
                };
            }
        }
        result
    }

    /// Upsert one parsed file (delete-then-insert keyed by file path).
    pub fn write_file(&self, branch: &str, parsed: &ParseResult) -> WriteResult {
        self.write_files(branch, std::slice::from_ref(parsed))
    }

    /// Upsert a batch of parsed files in one atomic directory write. On a
    /// non-base branch, base rows of these files missing from the new parse
    /// are tombstoned.
    pub fn write_files(&self, branch: &str, parsed: &[ParseResult]) -> WriteResult {
        self.locked("write seed files", branch, |dir, result| {
            self.write_parsed(dir, branch, parsed, result)
        })
    }

    /// Like [`write_file`](Self::write_file), but a no-op when the file's
    /// live nodes already carry `parsed.source_file_hash`.
    pub fn update_file(&self, branch: &str, parsed: &ParseResult) -> WriteResult {
        self.locked("update seed file", branch, |dir, result| {
            if !parsed.source_file_hash.is_empty() {
                let live: Vec<Node> = self.reader().read_file_rows(branch, &parsed.file_path)?;
                let unchanged = !live.is_empty()
                    && live
                        .iter()
                        .all(|n| n.source_file_hash == parsed.source_file_hash);
                if unchanged {
                    result.files_skipped = 1;
                    return Ok(());
                }
            }
            self.write_parsed(dir, branch, std::slice::from_ref(parsed), result)
        })
    }

    fn write_parsed(
        &self,
        dir: &Path,
        branch: &str,
        parsed: &[ParseResult],
        result: &mut WriteResult,
    ) -> DevacResult<()> {
        let now = now_rfc3339();
        let files: Vec<String> = parsed.iter().map(|p| p.file_path.clone()).collect();
        let file_set: HashSet<&str> = files.iter().map(String::as_str).collect();

        let mut nodes = TablePlan::<Node>::empty();
        let mut edges = TablePlan::<Edge>::empty();
        let mut refs = TablePlan::<ExternalRef>::empty();
        let mut effects = TablePlan::<Effect>::empty();
        nodes.replace_files = files.clone();
        edges.replace_files = files.clone();
        refs.replace_files = files.clone();
        effects.replace_files = files.clone();

        for p in parsed {
            for n in &p.nodes {
                let mut n = n.clone();
                fill_hash(&mut n.source_file_hash, &p.source_file_hash);
                n.stamp(branch, false, &now);
                nodes.rows.push(n);
            }
            for e in &p.edges {
                let mut e = e.clone();
                fill_hash(&mut e.source_file_hash, &p.source_file_hash);
                e.stamp(branch, false, &now);
                edges.rows.push(e);
            }
            for r in &p.external_refs {
                let mut r = r.clone();
                fill_hash(&mut r.source_file_hash, &p.source_file_hash);
                r.stamp(branch, false, &now);
                refs.rows.push(r);
            }
            for fx in &p.effects {
                let mut fx = fx.clone();
                fill_hash(&mut fx.source_file_hash, &p.source_file_hash);
                fx.stamp(branch, false, &now);
                effects.rows.push(fx);
            }
        }

        if branch != BASE_BRANCH {
            let reader = self.reader();
            nodes.tombstones = vanished(&reader.read_nodes(BASE_BRANCH)?, &file_set, &nodes.rows, branch, &now);
            edges.tombstones = vanished(&reader.read_edges(BASE_BRANCH)?, &file_set, &edges.rows, branch, &now);
            refs.tombstones = vanished(&reader.read_external_refs(BASE_BRANCH)?, &file_set, &refs.rows, branch, &now);
            effects.tombstones = vanished(&reader.read_effects(BASE_BRANCH)?, &file_set, &effects.rows, branch, &now);
        }

        let outcomes = self.pool.with_engine(|conn| {
            Ok(vec![
                stage_plan(conn, dir, &nodes)?,
                stage_plan(conn, dir, &edges)?,
                stage_plan(conn, dir, &refs)?,
                stage_plan(conn, dir, &effects)?,
            ])
        })?;
        commit_outcomes(outcomes)?;

        result.files_processed = parsed.len();
        result.nodes_written = nodes.rows.len();
        result.edges_written = edges.rows.len();
        result.external_refs_written = refs.rows.len();
        result.effects_written = effects.rows.len();
        result.tombstones_written = nodes.tombstones.len()
            + edges.tombstones.len()
            + refs.tombstones.len()
            + effects.tombstones.len();
        Ok(())
    }

    pub fn delete_file(&self, branch: &str, file_path: &str) -> WriteResult {
        self.delete_files(branch, &[file_path.to_string()])
    }

    /// Remove files from `branch`. Base compacts; other branches append a
    /// tombstone for every live row of each file.
    pub fn delete_files(&self, branch: &str, file_paths: &[String]) -> WriteResult {
        self.locked("delete seed files", branch, |dir, result| {
            let mut nodes = TablePlan::<Node>::empty();
            let mut edges = TablePlan::<Edge>::empty();
            let mut refs = TablePlan::<ExternalRef>::empty();
            let mut effects = TablePlan::<Effect>::empty();

            if branch == BASE_BRANCH {
                nodes.replace_files = file_paths.to_vec();
                edges.replace_files = file_paths.to_vec();
                refs.replace_files = file_paths.to_vec();
                effects.replace_files = file_paths.to_vec();
            } else {
                let now = now_rfc3339();
                let files: HashSet<&str> = file_paths.iter().map(String::as_str).collect();
                let reader = self.reader();
                nodes.tombstones = live_tombstones(reader.read_merged(branch)?, &files, branch, &now);
                edges.tombstones = live_tombstones(reader.read_merged(branch)?, &files, branch, &now);
                refs.tombstones = live_tombstones(reader.read_merged(branch)?, &files, branch, &now);
                effects.tombstones = live_tombstones(reader.read_merged(branch)?, &files, branch, &now);
            }

            let outcomes = self.pool.with_engine(|conn| {
                Ok(vec![
                    stage_plan(conn, dir, &nodes)?,
                    stage_plan(conn, dir, &edges)?,
                    stage_plan(conn, dir, &refs)?,
                    stage_plan(conn, dir, &effects)?,
                ])
            })?;
            commit_outcomes(outcomes)?;

            result.files_processed = file_paths.len();
            result.tombstones_written = nodes.tombstones.len()
                + edges.tombstones.len()
                + refs.tombstones.len()
                + effects.tombstones.len();
            Ok(())
        })
    }

    /// Replace the effects recorded for one file.
    pub fn write_effects(&self, branch: &str, file_path: &str, effects: &[Effect]) -> WriteResult {
        self.locked("write effects", branch, |dir, result| {
            let now = now_rfc3339();
            let mut plan = TablePlan::<Effect>::empty();
            plan.replace_files = vec![file_path.to_string()];
            plan.rows = stamp_all(effects, branch, false, &now);
            if branch != BASE_BRANCH {
                let files: HashSet<&str> = [file_path].into_iter().collect();
                let base = self.reader().read_effects(BASE_BRANCH)?;
                plan.tombstones = vanished(&base, &files, &plan.rows, branch, &now);
            }

            let outcome = self.pool.with_engine(|conn| stage_plan(conn, dir, &plan))?;
            commit_outcomes(vec![outcome])?;

            result.files_processed = 1;
            result.effects_written = plan.rows.len();
            result.tombstones_written = plan.tombstones.len();
            Ok(())
        })
    }

    /// Mark external refs resolved and append the `IMPORTS` edges the
    /// resolver discovered.
    pub fn write_resolved_refs(&self, branch: &str, resolved: &[ResolvedRef]) -> WriteResult {
        self.locked("write resolved refs", branch, |dir, result| {
            if resolved.is_empty() {
                return Ok(());
            }
            let now = now_rfc3339();
            let base_refs: Vec<ExternalRef> = if branch == BASE_BRANCH {
                Vec::new()
            } else {
                self.reader().read_merged(branch)?
            };

            let new_edges: Vec<Edge> = resolved
                .iter()
                .map(|r| Edge {
                    source_entity_id: r.source_entity_id.clone(),
                    target_entity_id: r.target_entity_id.clone(),
                    edge_type: EdgeType::Imports,
                    source_file_path: r.source_file_path.clone(),
                    source_line: 0,
                    source_column: 0,
                    properties: json!({
                        "moduleSpecifier": r.module_specifier,
                        "importedSymbol": r.imported_symbol,
                        "targetFile": r.target_file,
                        "resolvedBy": "semantic",
                    }),
                    source_file_hash: String::new(),
                    branch: branch.to_string(),
                    is_deleted: false,
                    updated_at: now.clone(),
                })
                .collect();

            let refs_path = dir.join(SeedTable::ExternalRefs.file_name());
            let edges_path = dir.join(SeedTable::Edges.file_name());
            let mut marked = 0usize;

            let outcomes = self.pool.with_engine(|conn| {
                marked = 0;
                let refs_outcome = stage_table(conn, &refs_path, SeedTable::ExternalRefs, |tx| {
                    let mut update = tx.prepare_cached(
                        "UPDATE external_refs SET is_resolved = 1, target_entity_id = ?1, \
                         updated_at = ?2 \
                         WHERE source_entity_id = ?3 AND module_specifier = ?4 \
                         AND imported_symbol = ?5 AND is_deleted = 0;",
                    )?;
                    for r in resolved {
                        let n = update.execute(params![
                            r.target_entity_id,
                            now,
                            r.source_entity_id,
                            r.module_specifier,
                            r.imported_symbol
                        ])?;
                        if n == 0 {
                            // Branch deltas copy the base row forward.
                            if let Some(base) = base_refs.iter().find(|b| {
                                b.source_entity_id == r.source_entity_id
                                    && b.module_specifier == r.module_specifier
                                    && b.imported_symbol == r.imported_symbol
                            }) {
                                let mut row = base.clone();
                                row.is_resolved = true;
                                row.target_entity_id = Some(r.target_entity_id.clone());
                                row.stamp(branch, false, &now);
                                row.insert(tx)?;
                                marked += 1;
                            }
                        } else {
                            marked += n;
                        }
                    }
                    Ok(marked > 0)
                })?;

                let edges_outcome = stage_table(conn, &edges_path, SeedTable::Edges, |tx| {
                    let mut clear = tx.prepare_cached(
                        "DELETE FROM edges WHERE source_entity_id = ?1 \
                         AND target_entity_id = ?2 AND edge_type = ?3;",
                    )?;
                    for e in &new_edges {
                        clear.execute(params![
                            e.source_entity_id,
                            e.target_entity_id,
                            e.edge_type.as_str()
                        ])?;
                        e.insert(tx)?;
                    }
                    Ok(!new_edges.is_empty())
                })?;
                Ok(vec![refs_outcome, edges_outcome])
            })?;
            commit_outcomes(outcomes)?;

            result.external_refs_written = marked;
            result.edges_written = new_edges.len();
            Ok(())
        })
    }

    /// Drop a non-base branch delta entirely.
    pub fn clean_branch(&self, branch: &str) -> WriteResult {
        if branch == BASE_BRANCH {
            return WriteResult {
                success: false,
                error: Some(
                    DevacError::InvalidParams("the base branch cannot be cleaned".into()).to_string(),
                ),
                ..WriteResult::default()
            };
        }
        self.locked("clean branch", branch, |dir, _| {
            fs::remove_dir_all(dir)?;
            fsync_dir(&paths::seed_root(&self.package_root))?;
            info!(branch, package = %self.package_root.display(), "removed branch delta");
            Ok(())
        })
    }
}

fn live_tombstones<R: SeedRow>(live: Vec<R>, files: &HashSet<&str>, branch: &str, now: &str) -> Vec<R> {
    let doomed: Vec<R> = live
        .into_iter()
        .filter(|r| files.contains(r.source_file()))
        .collect();
    stamp_all(&doomed, branch, true, now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(file: &str, names: &[&str]) -> ParseResult {
        let nodes: Vec<Node> = names
            .iter()
            .map(|name| {
                serde_json::from_value(json!({
                    "entity_id": format!("app:pkg:function:{name}"),
                    "name": name,
                    "kind": "function",
                    "file_path": file,
                }))
                .unwrap()
            })
            .collect();
        ParseResult {
            nodes,
            source_file_hash: format!("hash-{}", names.join("-")),
            file_path: file.to_string(),
            ..ParseResult::default()
        }
    }

    fn writer(dir: &Path) -> SeedWriter {
        SeedWriter::new(dir, EnginePool::with_defaults().unwrap())
    }

    #[test]
    fn write_then_read_round_trips_counts() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        let res = w.write_file(BASE_BRANCH, &parsed("src/a.ts", &["alpha", "beta"]));
        assert!(res.success, "{:?}", res.error);
        assert_eq!(res.nodes_written, 2);
        assert_eq!(w.reader().read_nodes(BASE_BRANCH).unwrap().len(), 2);
    }

    #[test]
    fn rewrite_replaces_rows_for_file_only() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        w.write_files(
            BASE_BRANCH,
            &[parsed("src/a.ts", &["alpha"]), parsed("src/b.ts", &["beta"])],
        );
        w.write_file(BASE_BRANCH, &parsed("src/a.ts", &["gamma", "delta"]));

        let mut names: Vec<String> = w
            .reader()
            .read_nodes(BASE_BRANCH)
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["beta", "delta", "gamma"]);
    }

    #[test]
    fn unchanged_hash_skips_update() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        let file = parsed("src/a.ts", &["alpha"]);
        w.write_file(BASE_BRANCH, &file);
        let res = w.update_file(BASE_BRANCH, &file);
        assert!(res.success);
        assert_eq!(res.files_skipped, 1);
        assert_eq!(res.nodes_written, 0);
    }

    #[test]
    fn clean_branch_refuses_base() {
        let dir = tempfile::tempdir().unwrap();
        let res = writer(dir.path()).clean_branch(BASE_BRANCH);
        assert!(!res.success);
        assert!(res.error.unwrap().contains("base"));
    }
}
