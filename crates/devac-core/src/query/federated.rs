//! Query federation across package seeds.
//!
//! Each surviving package's logical view of the requested branch is loaded
//! into a pooled engine as `{table}__{i}`; `{table}` views union them with a
//! `package_path` column. The caller's SQL then runs against those views
//! after `table@package` expansion.

use std::path::{Path, PathBuf};
use std::time::Instant;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::{DevacError, DevacResult};
use crate::models::{Edge, Effect, ExternalRef, Node, BASE_BRANCH};
use crate::query::guards::{
    clamp_limit, normalize_sql, DEFAULT_FEDERATED_ROWS, MAX_FEDERATED_ROWS, MAX_PACKAGES_PER_QUERY,
    MAX_SQL_LENGTH,
};
use crate::query::preprocess::{display_label, package_table, preprocess, PackageLabels};
use crate::store::paths::{seed_root, DEVAC_DIR, SEED_DIR};
use crate::store::pool::reset_engine;
use crate::store::{EnginePool, SeedReader, SeedRow, SeedTable};

/// Marker for the repo-root hazard in warnings.
pub const REPO_ROOT_WARNING: &str = "seeds at repo root";

fn default_branch() -> String {
    BASE_BRANCH.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub packages: Vec<PathBuf>,
    pub sql: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Row cap; defaults to `DEFAULT_FEDERATED_ROWS`.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl QueryRequest {
    pub fn new(packages: Vec<PathBuf>, sql: impl Into<String>) -> Self {
        Self {
            packages,
            sql: sql.into(),
            branch: default_branch(),
            limit: None,
        }
    }

    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub rows: Vec<Map<String, Value>>,
    pub columns: Vec<String>,
    pub packages_queried: Vec<String>,
    pub views_created: Vec<String>,
    pub warnings: Vec<String>,
    pub truncated: bool,
    pub time_ms: u64,
}

/// A package's merged rows for one branch; `None` where no table file exists.
#[derive(Debug, Default)]
struct PackageSeed {
    nodes: Option<Vec<Node>>,
    edges: Option<Vec<Edge>>,
    external_refs: Option<Vec<ExternalRef>>,
    effects: Option<Vec<Effect>>,
}

impl PackageSeed {
    fn has(&self, table: SeedTable) -> bool {
        match table {
            SeedTable::Nodes => self.nodes.is_some(),
            SeedTable::Edges => self.edges.is_some(),
            SeedTable::ExternalRefs => self.external_refs.is_some(),
            SeedTable::Effects => self.effects.is_some(),
        }
    }
}

fn load_table<R: SeedRow>(reader: &SeedReader, branch: &str) -> DevacResult<Option<Vec<R>>> {
    let present = reader.table_path(BASE_BRANCH, R::TABLE)?.is_file()
        || (branch != BASE_BRANCH && reader.table_path(branch, R::TABLE)?.is_file());
    if !present {
        return Ok(None);
    }
    Ok(Some(reader.read_merged(branch)?))
}

fn load_package(path: &Path, branch: &str) -> DevacResult<PackageSeed> {
    let reader = SeedReader::new(path);
    Ok(PackageSeed {
        nodes: load_table(&reader, branch)?,
        edges: load_table(&reader, branch)?,
        external_refs: load_table(&reader, branch)?,
        effects: load_table(&reader, branch)?,
    })
}

/// A directory with version control metadata is a repository root.
pub fn is_repo_root(path: &Path) -> bool {
    path.join(".git").exists()
}

/// Directories under `root` holding a `base` seed, sorted. Dependency and
/// hidden directories are not descended into.
pub fn discover_packages(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| {
        if e.depth() == 0 || !e.file_type().is_dir() {
            return true;
        }
        let name = e.file_name().to_string_lossy();
        name == DEVAC_DIR || !(name.starts_with('.') || name == "node_modules" || name == "dist")
    });
    for entry in walker.flatten() {
        if !entry.file_type().is_dir() || entry.file_name() != DEVAC_DIR {
            continue;
        }
        if entry.path().join(SEED_DIR).join(BASE_BRANCH).is_dir() {
            if let Some(pkg) = entry.path().parent() {
                found.push(pkg.to_path_buf());
            }
        }
    }
    found.sort();
    found.dedup();
    found
}

fn copy_rows<R: SeedRow>(conn: &Connection, rows: &[R], index: usize) -> DevacResult<()> {
    let table = R::TABLE;
    // Only the CREATE TABLE statement; index names would collide across copies.
    if let Some(create) = table.ddl().first() {
        conn.execute_batch(create)?;
    }
    let tx = conn.unchecked_transaction()?;
    for row in rows {
        row.insert(&tx)?;
    }
    tx.commit()?;
    conn.execute_batch(&format!(
        "ALTER TABLE {} RENAME TO {};",
        table.name(),
        package_table(table, index)
    ))?;
    Ok(())
}

fn load_into_engine(conn: &Connection, seeds: &[(PathBuf, PackageSeed)], table: SeedTable) -> DevacResult<()> {
    if seeds.is_empty() {
        if let Some(create) = table.ddl().first() {
            conn.execute_batch(create)?;
        }
        conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN package_path TEXT;",
            table.name()
        ))?;
        return Ok(());
    }
    for (i, (_, seed)) in seeds.iter().enumerate() {
        match table {
            SeedTable::Nodes => copy_rows(conn, seed.nodes.as_deref().unwrap_or(&[]), i)?,
            SeedTable::Edges => copy_rows(conn, seed.edges.as_deref().unwrap_or(&[]), i)?,
            SeedTable::ExternalRefs => copy_rows(conn, seed.external_refs.as_deref().unwrap_or(&[]), i)?,
            SeedTable::Effects => copy_rows(conn, seed.effects.as_deref().unwrap_or(&[]), i)?,
        }
    }
    let parts: Vec<String> = seeds
        .iter()
        .enumerate()
        .map(|(i, (path, _))| {
            format!(
                "SELECT *, '{}' AS package_path FROM {}",
                path.to_string_lossy().replace('\'', "''"),
                package_table(table, i)
            )
        })
        .collect();
    conn.execute_batch(&format!(
        "CREATE VIEW {} AS {};",
        table.name(),
        parts.join(" UNION ALL ")
    ))?;
    Ok(())
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(b.iter().map(|byte| format!("{byte:02x}")).collect()),
    }
}

fn execute(conn: &Connection, sql: &str, limit: usize) -> DevacResult<(Vec<String>, Vec<Map<String, Value>>, bool)> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| DevacError::QueryExecution(e.to_string()))?;
    if !stmt.readonly() {
        return Err(DevacError::QueryExecution(
            "only read-only statements may run against federated views".to_string(),
        ));
    }
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt
        .query([])
        .map_err(|e| DevacError::QueryExecution(e.to_string()))?;
    let mut out = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next().map_err(|e| DevacError::QueryExecution(e.to_string()))? {
        if out.len() >= limit {
            truncated = true;
            break;
        }
        let mut obj = Map::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            let value = row
                .get_ref(i)
                .map_err(|e| DevacError::QueryExecution(e.to_string()))?;
            obj.insert(name.clone(), value_to_json(value));
        }
        out.push(obj);
    }
    Ok((columns, out, truncated))
}

/// Run `request.sql` over the seeds of `request.packages`.
///
/// Repository roots holding seed data and packages without a seed for the
/// branch are skipped with a warning. Preprocessing failures surface as
/// `QueryPreprocess`, engine failures as `QueryExecution`.
pub fn query(pool: &EnginePool, request: &QueryRequest) -> DevacResult<QueryResult> {
    let start = Instant::now();
    let sql = normalize_sql(&request.sql);
    if sql.is_empty() {
        return Err(DevacError::InvalidParams("sql must not be empty".to_string()));
    }
    if sql.len() > MAX_SQL_LENGTH {
        return Err(DevacError::InvalidParams(format!(
            "sql exceeds {MAX_SQL_LENGTH} bytes"
        )));
    }
    if request.packages.len() > MAX_PACKAGES_PER_QUERY {
        return Err(DevacError::InvalidParams(format!(
            "at most {MAX_PACKAGES_PER_QUERY} packages per query"
        )));
    }

    let mut warnings = Vec::new();
    let mut seeds: Vec<(PathBuf, PackageSeed)> = Vec::new();
    for pkg in &request.packages {
        let reader = SeedReader::new(pkg);
        if is_repo_root(pkg) && seed_root(pkg).is_dir() {
            warn!(package = %pkg.display(), "skipping package: {}", REPO_ROOT_WARNING);
            warnings.push(format!(
                "{}: {REPO_ROOT_WARNING}; query its packages instead",
                pkg.display()
            ));
            continue;
        }
        let has_seed = reader.has_seed(BASE_BRANCH)? || reader.has_seed(&request.branch)?;
        if !has_seed {
            warnings.push(format!(
                "{}: no seed for branch '{}'",
                pkg.display(),
                request.branch
            ));
            continue;
        }
        match load_package(pkg, &request.branch) {
            Ok(seed) => seeds.push((pkg.clone(), seed)),
            Err(e) => {
                warn!("Failed to load seed for package={}: {}", pkg.display(), e);
                warnings.push(format!("{}: {e}", pkg.display()));
            }
        }
    }

    let paths: Vec<PathBuf> = seeds.iter().map(|(p, _)| p.clone()).collect();
    let labels = PackageLabels::new(&paths);
    // With every package skipped, the views still exist and read as empty.
    let available: Vec<SeedTable> = SeedTable::ALL
        .into_iter()
        .filter(|t| seeds.is_empty() || seeds.iter().any(|(_, s)| s.has(*t)))
        .collect();
    let expanded = preprocess(sql, &labels, |t| available.contains(&t))?;
    let limit = clamp_limit(request.limit, DEFAULT_FEDERATED_ROWS, MAX_FEDERATED_ROWS);

    let (columns, rows, truncated) = pool.with_engine(|conn| {
        reset_engine(conn)?;
        for table in &available {
            load_into_engine(conn, &seeds, *table)?;
        }
        let out = execute(conn, &expanded.sql, limit);
        reset_engine(conn)?;
        out
    })?;

    if truncated {
        warnings.push(format!("result truncated to {limit} rows"));
    }
    let result = QueryResult {
        rows,
        columns,
        packages_queried: paths.iter().map(|p| display_label(p)).collect(),
        views_created: available.iter().map(|t| t.name().to_string()).collect(),
        warnings,
        truncated,
        time_ms: start.elapsed().as_millis() as u64,
    };
    info!(
        packages = result.packages_queried.len(),
        views = result.views_created.len(),
        rows = result.rows.len(),
        elapsed_ms = result.time_ms,
        "federated query finished"
    );
    debug!(sql = %expanded.sql, "expanded federated sql");
    Ok(result)
}
