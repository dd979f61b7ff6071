//! Central hub registry over `{hub_dir}/central.db`.
//!
//! Tracks registered repositories and the seeded packages inside them,
//! directed cross-repo edges, a TTL query cache and pushed diagnostics. One
//! process owns the read-write handle; `open_read_only` handles refuse every
//! mutation.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{EngineConfig, HubConfig};
use crate::errors::{DevacError, DevacResult};
use crate::models::{now_rfc3339, BASE_BRANCH};
use crate::query::guards::{
    clamp_limit, MAX_CROSS_REPO_EDGES_PER_CALL, MAX_DIAGNOSTICS_PER_PUSH, MAX_DIAGNOSTICS_RESULTS,
};
use crate::query::{discover_packages, query, QueryRequest, QueryResult};
use crate::store::paths::seed_root;
use crate::store::EnginePool;

pub const HUB_DB_NAME: &str = "central.db";

// ---------------------------------------------------------------------------
// Schema constants
// ---------------------------------------------------------------------------

const HUB_SCHEMA_VERSION: i64 = 1;

const HUB_SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS hub_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS repo_registry (
        repo_id TEXT PRIMARY KEY,
        local_path TEXT NOT NULL,
        name TEXT NOT NULL,
        packages TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL DEFAULT 'active',
        content_hash TEXT NOT NULL DEFAULT '',
        last_synced TEXT,
        registered_at TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS cross_repo_edges (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_repo TEXT NOT NULL,
        source_entity_id TEXT NOT NULL,
        target_repo TEXT NOT NULL,
        target_entity_id TEXT NOT NULL,
        edge_type TEXT NOT NULL,
        metadata TEXT,
        created_at TEXT NOT NULL,
        UNIQUE(source_entity_id, target_entity_id, edge_type)
    );",
    "CREATE TABLE IF NOT EXISTS query_cache (
        query_hash TEXT PRIMARY KEY,
        result TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL,
        expires_at_ms INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS diagnostics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repo_id TEXT NOT NULL,
        source TEXT NOT NULL,
        file_path TEXT,
        line INTEGER,
        column INTEGER,
        severity TEXT NOT NULL,
        code TEXT,
        message TEXT NOT NULL,
        metadata TEXT,
        created_at TEXT NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_cross_edges_source ON cross_repo_edges(source_repo);",
    "CREATE INDEX IF NOT EXISTS idx_cross_edges_target ON cross_repo_edges(target_entity_id);",
    "CREATE INDEX IF NOT EXISTS idx_cross_edges_target_repo ON cross_repo_edges(target_repo);",
    "CREATE INDEX IF NOT EXISTS idx_diagnostics_repo ON diagnostics(repo_id, source);",
    "CREATE INDEX IF NOT EXISTS idx_query_cache_created ON query_cache(created_at_ms);",
];

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoStatus {
    Active,
    Missing,
}

impl RepoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoStatus::Active => "active",
            RepoStatus::Missing => "missing",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "missing" {
            RepoStatus::Missing
        } else {
            RepoStatus::Active
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoInfo {
    pub repo_id: String,
    pub local_path: PathBuf,
    pub name: String,
    /// Absolute paths of seeded packages inside the repo.
    pub packages: Vec<PathBuf>,
    pub status: RepoStatus,
    pub content_hash: String,
    pub last_synced: Option<String>,
    pub registered_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossRepoEdge {
    pub source_repo: String,
    pub source_entity_id: String,
    pub target_repo: String,
    pub target_entity_id: String,
    pub edge_type: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
    Hint,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Hint => "hint",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "error" => Severity::Error,
            "warning" => Severity::Warning,
            "hint" => Severity::Hint,
            _ => Severity::Info,
        }
    }
}

/// One validation or diagnostic record pushed by an external tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    #[serde(default)]
    pub repo_id: String,
    /// Producing tool: `tsc`, `eslint`, `test`, `coverage`, an issue feed.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub line: Option<i64>,
    #[serde(default)]
    pub column: Option<i64>,
    pub severity: Severity,
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiagnosticsFilter {
    pub repo_id: Option<String>,
    pub source: Option<String>,
    pub severity: Option<Severity>,
    pub file_path: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSummary {
    pub total: usize,
    pub by_source: IndexMap<String, usize>,
    pub by_severity: IndexMap<String, usize>,
}

// ---------------------------------------------------------------------------
// Repo identity
// ---------------------------------------------------------------------------

/// Normalize a git remote URL to `host/owner/name`.
pub fn normalize_remote_url(url: &str) -> Option<String> {
    let mut rest = url.trim();
    for scheme in ["https://", "http://", "ssh://", "git://", "git+ssh://"] {
        if let Some(stripped) = rest.strip_prefix(scheme) {
            rest = stripped;
            break;
        }
    }
    if let Some((_, after_user)) = rest.split_once('@') {
        rest = after_user;
    }
    let rest = rest.trim_end_matches('/');
    let rest = rest.strip_suffix(".git").unwrap_or(rest);
    // scp-like `host:owner/name`
    let normalized = match rest.split_once(':') {
        Some((host, path)) => {
            let first = path.split('/').next().unwrap_or("");
            if !first.is_empty() && first.chars().all(|c| c.is_ascii_digit()) {
                // `host:port/path` keeps the host only.
                let path = path.split_once('/').map(|(_, p)| p).unwrap_or("");
                format!("{host}/{path}")
            } else {
                format!("{host}/{}", path.trim_start_matches('/'))
            }
        }
        None => rest.to_string(),
    };
    let normalized = normalized.trim_matches('/').to_lowercase();
    if normalized.split('/').filter(|s| !s.is_empty()).count() < 2 {
        return None;
    }
    Some(normalized)
}

fn origin_url(git_config: &str) -> Option<String> {
    let mut in_origin = false;
    for line in git_config.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_origin = line == "[remote \"origin\"]";
            continue;
        }
        if in_origin {
            if let Some((key, value)) = line.split_once('=') {
                if key.trim() == "url" {
                    return Some(value.trim().to_string());
                }
            }
        }
    }
    None
}

/// `host/owner/name` from the origin remote, else the directory name.
pub fn derive_repo_id(repo_path: &Path) -> String {
    let from_remote = std::fs::read_to_string(repo_path.join(".git").join("config"))
        .ok()
        .and_then(|cfg| origin_url(&cfg))
        .and_then(|url| normalize_remote_url(&url));
    match from_remote {
        Some(id) => id,
        None => repo_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| repo_path.to_string_lossy().into_owned()),
    }
}

/// SHA-256 over seed file names, sizes and mtimes of `packages`.
pub fn compute_seed_hash(packages: &[PathBuf]) -> String {
    let mut entries: Vec<String> = Vec::new();
    for pkg in packages {
        let root = seed_root(pkg);
        for entry in WalkDir::new(&root).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            entries.push(format!("{}\0{}\0{}", entry.path().display(), meta.len(), mtime));
        }
    }
    entries.sort();
    let mut hasher = Sha256::new();
    for e in &entries {
        hasher.update(e.as_bytes());
        hasher.update([b'\n']);
    }
    format!("{:x}", hasher.finalize())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn json_text(value: &Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_json_text(raw: Option<String>) -> Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// CentralHub
// ---------------------------------------------------------------------------

pub struct CentralHub {
    db_path: PathBuf,
    conn: Mutex<Connection>,
    read_only: bool,
    pool: EnginePool,
    cache_ttl: Duration,
    cache_max_entries: usize,
}

impl std::fmt::Debug for CentralHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralHub")
            .field("db_path", &self.db_path)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl CentralHub {
    /// Open (creating if needed) the hub database read-write.
    pub fn open(hub: &HubConfig, engine: &EngineConfig) -> DevacResult<Self> {
        let dir = hub.hub_dir();
        std::fs::create_dir_all(&dir)?;
        let db_path = dir.join(HUB_DB_NAME);
        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        for stmt in HUB_SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        Self::migrate_schema(&conn)?;
        info!(path = %db_path.display(), "opened central hub");
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
            read_only: false,
            pool: EnginePool::new(engine)?,
            cache_ttl: hub.cache_ttl(),
            cache_max_entries: hub.cache_max_entries.max(1),
        })
    }

    /// Open an existing hub database for queries only.
    pub fn open_read_only(hub: &HubConfig, engine: &EngineConfig) -> DevacResult<Self> {
        let db_path = hub.hub_dir().join(HUB_DB_NAME);
        if !db_path.is_file() {
            return Err(DevacError::Hub(format!(
                "no hub database at {}",
                db_path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
            read_only: true,
            pool: EnginePool::new(engine)?,
            cache_ttl: hub.cache_ttl(),
            cache_max_entries: hub.cache_max_entries.max(1),
        })
    }

    fn get_schema_version(conn: &Connection) -> i64 {
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM hub_meta WHERE key = 'schema_version';",
            [],
            |row| row.get(0),
        );
        match result {
            Ok(v) => v.parse::<i64>().unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn migrate_schema(conn: &Connection) -> DevacResult<()> {
        let current = Self::get_schema_version(conn);
        if current > HUB_SCHEMA_VERSION {
            return Err(DevacError::Hub(format!(
                "hub schema version {current} is newer than supported {HUB_SCHEMA_VERSION}"
            )));
        }
        if current < HUB_SCHEMA_VERSION {
            conn.execute(
                "INSERT INTO hub_meta(key, value) VALUES('schema_version', ?1) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
                params![HUB_SCHEMA_VERSION.to_string()],
            )?;
        }
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn ensure_writable(&self, op: &str) -> DevacResult<()> {
        if self.read_only {
            Err(DevacError::HubReadOnly(op.to_string()))
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Repo registry
    // -----------------------------------------------------------------------

    fn row_to_repo(row: &Row<'_>) -> rusqlite::Result<RepoInfo> {
        let packages: String = row.get("packages")?;
        let local_path: String = row.get("local_path")?;
        let status: String = row.get("status")?;
        Ok(RepoInfo {
            repo_id: row.get("repo_id")?,
            local_path: PathBuf::from(local_path),
            name: row.get("name")?,
            packages: serde_json::from_str::<Vec<PathBuf>>(&packages).unwrap_or_default(),
            status: RepoStatus::parse(&status),
            content_hash: row.get("content_hash")?,
            last_synced: row.get("last_synced")?,
            registered_at: row.get("registered_at")?,
        })
    }

    /// Register (or re-register) the repository at `path`.
    pub fn register_repo(&self, path: &Path) -> DevacResult<RepoInfo> {
        self.ensure_writable("register")?;
        let path = path.canonicalize().map_err(|e| {
            DevacError::InvalidParams(format!("cannot register {}: {e}", path.display()))
        })?;
        if !path.is_dir() {
            return Err(DevacError::InvalidParams(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        let repo_id = derive_repo_id(&path);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| repo_id.clone());
        let packages = discover_packages(&path);
        let content_hash = compute_seed_hash(&packages);
        let now = now_rfc3339();
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO repo_registry(repo_id, local_path, name, packages, status, \
                     content_hash, last_synced, registered_at) \
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?6) \
                 ON CONFLICT(repo_id) DO UPDATE SET \
                     local_path = excluded.local_path, name = excluded.name, \
                     packages = excluded.packages, status = 'active', \
                     content_hash = excluded.content_hash, last_synced = excluded.last_synced;",
                params![
                    repo_id,
                    path.to_string_lossy().into_owned(),
                    name,
                    serde_json::to_string(&packages)?,
                    content_hash,
                    now,
                ],
            )?;
        }
        self.cache_clear()?;
        info!(repo_id = %repo_id, packages = packages.len(), "registered repo");
        self.get_repo(&repo_id)?
            .ok_or_else(|| DevacError::Hub(format!("repo {repo_id} vanished after register")))
    }

    /// Drop a repo, its outgoing cross-repo edges and the query cache.
    pub fn unregister_repo(&self, repo_id: &str) -> DevacResult<bool> {
        self.ensure_writable("unregister")?;
        let removed = {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM repo_registry WHERE repo_id = ?1;", params![repo_id])?
        };
        let edges = self.remove_cross_repo_edges(repo_id)?;
        self.cache_clear()?;
        info!(repo_id, edges_removed = edges, "unregistered repo");
        Ok(removed > 0)
    }

    /// Rediscover packages and recompute the seed hash. A repo whose path no
    /// longer exists is marked `missing`.
    pub fn refresh_repo(&self, repo_id: &str) -> DevacResult<RepoInfo> {
        self.ensure_writable("refresh")?;
        let repo = self
            .get_repo(repo_id)?
            .ok_or_else(|| DevacError::InvalidParams(format!("unknown repo '{repo_id}'")))?;
        let now = now_rfc3339();
        if !repo.local_path.is_dir() {
            warn!(
                "Failed to refresh repo={} path={}: path missing",
                repo_id,
                repo.local_path.display()
            );
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE repo_registry SET status = 'missing', last_synced = ?2 WHERE repo_id = ?1;",
                params![repo_id, now],
            )?;
        } else {
            let packages = discover_packages(&repo.local_path);
            let content_hash = compute_seed_hash(&packages);
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE repo_registry SET packages = ?2, content_hash = ?3, status = 'active', \
                     last_synced = ?4 WHERE repo_id = ?1;",
                params![repo_id, serde_json::to_string(&packages)?, content_hash, now],
            )?;
        }
        self.get_repo(repo_id)?
            .ok_or_else(|| DevacError::Hub(format!("repo {repo_id} vanished during refresh")))
    }

    pub fn refresh_all(&self) -> DevacResult<Vec<RepoInfo>> {
        let ids: Vec<String> = self.list_repos()?.into_iter().map(|r| r.repo_id).collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.refresh_repo(&id)?);
        }
        Ok(out)
    }

    pub fn list_repos(&self) -> DevacResult<Vec<RepoInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM repo_registry ORDER BY repo_id ASC;")?;
        let rows = stmt.query_map([], Self::row_to_repo)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn get_repo(&self, repo_id: &str) -> DevacResult<Option<RepoInfo>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT * FROM repo_registry WHERE repo_id = ?1 LIMIT 1;",
                params![repo_id],
                Self::row_to_repo,
            )
            .optional()?)
    }

    // -----------------------------------------------------------------------
    // Cross-repo edges
    // -----------------------------------------------------------------------

    /// Upsert edges keyed by (source entity, target entity, type).
    pub fn add_cross_repo_edges(&self, edges: &[CrossRepoEdge]) -> DevacResult<usize> {
        self.ensure_writable("addCrossRepoEdges")?;
        if edges.len() > MAX_CROSS_REPO_EDGES_PER_CALL {
            return Err(DevacError::InvalidParams(format!(
                "at most {MAX_CROSS_REPO_EDGES_PER_CALL} edges per call"
            )));
        }
        let now = now_rfc3339();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO cross_repo_edges(source_repo, source_entity_id, \
                     target_repo, target_entity_id, edge_type, metadata, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
            )?;
            for e in edges {
                stmt.execute(params![
                    e.source_repo,
                    e.source_entity_id,
                    e.target_repo,
                    e.target_entity_id,
                    e.edge_type,
                    json_text(&e.metadata),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = edges.len(), "upserted cross-repo edges");
        Ok(edges.len())
    }

    /// Edges pointing at `target`, matched as an entity ID or a repo ID.
    pub fn get_cross_repo_dependents(&self, target: &str) -> DevacResult<Vec<CrossRepoEdge>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT source_repo, source_entity_id, target_repo, target_entity_id, edge_type, metadata \
             FROM cross_repo_edges \
             WHERE target_entity_id = ?1 OR target_repo = ?1 \
             ORDER BY id ASC;",
        )?;
        let rows = stmt.query_map(params![target], |row| {
            Ok(CrossRepoEdge {
                source_repo: row.get(0)?,
                source_entity_id: row.get(1)?,
                target_repo: row.get(2)?,
                target_entity_id: row.get(3)?,
                edge_type: row.get(4)?,
                metadata: parse_json_text(row.get(5)?),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Purge every edge sourced from `repo_id`.
    pub fn remove_cross_repo_edges(&self, repo_id: &str) -> DevacResult<usize> {
        self.ensure_writable("removeCrossRepoEdges")?;
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM cross_repo_edges WHERE source_repo = ?1;",
            params![repo_id],
        )?)
    }

    // -----------------------------------------------------------------------
    // Query cache
    // -----------------------------------------------------------------------

    /// Cached JSON for `hash`; expired entries read as misses.
    pub fn cache_get(&self, hash: &str) -> DevacResult<Option<Value>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT result FROM query_cache WHERE query_hash = ?1 AND expires_at_ms > ?2;",
                params![hash, now_ms()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    pub fn cache_put(&self, hash: &str, value: &Value) -> DevacResult<()> {
        self.cache_put_with_ttl(hash, value, self.cache_ttl)
    }

    /// Store `value`, then evict the oldest entries above the size cap.
    pub fn cache_put_with_ttl(&self, hash: &str, value: &Value, ttl: Duration) -> DevacResult<()> {
        self.ensure_writable("cachePut")?;
        let now = now_ms();
        let expires = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        let keep = i64::try_from(self.cache_max_entries).unwrap_or(i64::MAX);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO query_cache(query_hash, result, created_at_ms, expires_at_ms) \
             VALUES (?1, ?2, ?3, ?4);",
            params![hash, value.to_string(), now, expires],
        )?;
        let evicted = conn.execute(
            "DELETE FROM query_cache WHERE query_hash NOT IN (\
                 SELECT query_hash FROM query_cache \
                 ORDER BY created_at_ms DESC, rowid DESC LIMIT ?1);",
            params![keep],
        )?;
        if evicted > 0 {
            debug!(evicted, "evicted query cache entries");
        }
        Ok(())
    }

    pub fn cache_purge_expired(&self) -> DevacResult<usize> {
        self.ensure_writable("cachePurge")?;
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM query_cache WHERE expires_at_ms <= ?1;",
            params![now_ms()],
        )?)
    }

    pub fn cache_clear(&self) -> DevacResult<usize> {
        self.ensure_writable("cacheClear")?;
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM query_cache;", [])?)
    }

    pub fn cache_len(&self) -> DevacResult<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM query_cache;", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    // -----------------------------------------------------------------------
    // Federated query
    // -----------------------------------------------------------------------

    /// Run `sql` over every package of every active repo. Results are cached
    /// under the SQL, branch, limit and each repo's seed hash, so a refresh
    /// that changes seeds misses naturally.
    pub fn federated_query(&self, sql: &str, branch: Option<&str>, limit: Option<usize>) -> DevacResult<QueryResult> {
        let start = Instant::now();
        let branch = branch.unwrap_or(BASE_BRANCH);
        let repos: Vec<RepoInfo> = self
            .list_repos()?
            .into_iter()
            .filter(|r| r.status == RepoStatus::Active)
            .collect();

        let mut hasher = Sha256::new();
        hasher.update(sql.as_bytes());
        hasher.update([0u8]);
        hasher.update(branch.as_bytes());
        hasher.update([0u8]);
        hasher.update(limit.unwrap_or(0).to_string().as_bytes());
        for r in &repos {
            hasher.update([0u8]);
            hasher.update(r.repo_id.as_bytes());
            hasher.update(b":");
            hasher.update(r.content_hash.as_bytes());
        }
        let key = format!("{:x}", hasher.finalize());

        if let Some(hit) = self.cache_get(&key)? {
            if let Ok(mut cached) = serde_json::from_value::<QueryResult>(hit) {
                debug!(key = %key, "federated query cache hit");
                cached.time_ms = start.elapsed().as_millis() as u64;
                return Ok(cached);
            }
        }

        let packages: Vec<PathBuf> = repos.iter().flat_map(|r| r.packages.iter().cloned()).collect();
        let request = QueryRequest {
            packages,
            sql: sql.to_string(),
            branch: branch.to_string(),
            limit,
        };
        let result = query(&self.pool, &request)?;
        if !self.read_only {
            self.cache_put(&key, &serde_json::to_value(&result)?)?;
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Replace the records `source` reported for `repo_id`.
    pub fn push_diagnostics(&self, repo_id: &str, source: &str, records: &[Diagnostic]) -> DevacResult<usize> {
        self.ensure_writable("pushDiagnostics")?;
        if records.len() > MAX_DIAGNOSTICS_PER_PUSH {
            return Err(DevacError::InvalidParams(format!(
                "at most {MAX_DIAGNOSTICS_PER_PUSH} diagnostics per push"
            )));
        }
        let now = now_rfc3339();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM diagnostics WHERE repo_id = ?1 AND source = ?2;",
            params![repo_id, source],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO diagnostics(repo_id, source, file_path, line, column, severity, \
                     code, message, metadata, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            )?;
            for d in records {
                stmt.execute(params![
                    repo_id,
                    source,
                    d.file_path,
                    d.line,
                    d.column,
                    d.severity.as_str(),
                    d.code,
                    d.message,
                    json_text(&d.metadata),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        debug!(repo_id, source, count = records.len(), "stored diagnostics");
        Ok(records.len())
    }

    pub fn query_diagnostics(&self, filter: &DiagnosticsFilter) -> DevacResult<Vec<Diagnostic>> {
        let limit = clamp_limit(filter.limit, MAX_DIAGNOSTICS_RESULTS, MAX_DIAGNOSTICS_RESULTS);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT repo_id, source, file_path, line, column, severity, code, message, metadata \
             FROM diagnostics \
             WHERE (?1 IS NULL OR repo_id = ?1) \
               AND (?2 IS NULL OR source = ?2) \
               AND (?3 IS NULL OR severity = ?3) \
               AND (?4 IS NULL OR file_path = ?4) \
             ORDER BY id ASC LIMIT ?5;",
        )?;
        let rows = stmt.query_map(
            params![
                filter.repo_id,
                filter.source,
                filter.severity.map(|s| s.as_str()),
                filter.file_path,
                limit as i64,
            ],
            |row| {
                let severity: String = row.get(5)?;
                Ok(Diagnostic {
                    repo_id: row.get(0)?,
                    source: row.get(1)?,
                    file_path: row.get(2)?,
                    line: row.get(3)?,
                    column: row.get(4)?,
                    severity: Severity::parse(&severity),
                    code: row.get(6)?,
                    message: row.get(7)?,
                    metadata: parse_json_text(row.get(8)?),
                })
            },
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn clear_diagnostics(&self, repo_id: Option<&str>, source: Option<&str>) -> DevacResult<usize> {
        self.ensure_writable("clearDiagnostics")?;
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM diagnostics WHERE (?1 IS NULL OR repo_id = ?1) AND (?2 IS NULL OR source = ?2);",
            params![repo_id, source],
        )?)
    }

    pub fn diagnostics_summary(&self, repo_id: Option<&str>) -> DevacResult<DiagnosticsSummary> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT source, severity, COUNT(*) FROM diagnostics \
             WHERE (?1 IS NULL OR repo_id = ?1) \
             GROUP BY source, severity ORDER BY source, severity;",
        )?;
        let rows = stmt.query_map(params![repo_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?;
        let mut summary = DiagnosticsSummary::default();
        for row in rows {
            let (source, severity, count) = row?;
            let count = count as usize;
            summary.total += count;
            *summary.by_source.entry(source).or_default() += count;
            *summary.by_severity.entry(severity).or_default() += count;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hub(dir: &Path) -> CentralHub {
        let config = HubConfig {
            hub_dir: dir.to_string_lossy().into_owned(),
            ..HubConfig::default()
        };
        CentralHub::open(&config, &EngineConfig::default()).unwrap()
    }

    fn edge(source_repo: &str, source: &str, target: &str) -> CrossRepoEdge {
        CrossRepoEdge {
            source_repo: source_repo.into(),
            source_entity_id: source.into(),
            target_repo: "lib".into(),
            target_entity_id: target.into(),
            edge_type: "IMPORTS".into(),
            metadata: json!({"via": "npm"}),
        }
    }

    #[test]
    fn remote_urls_normalize() {
        assert_eq!(
            normalize_remote_url("git@github.com:Acme/Widgets.git").as_deref(),
            Some("github.com/acme/widgets")
        );
        assert_eq!(
            normalize_remote_url("https://github.com/acme/widgets/").as_deref(),
            Some("github.com/acme/widgets")
        );
        assert_eq!(
            normalize_remote_url("ssh://git@gitlab.example.com:2222/team/tool.git").as_deref(),
            Some("gitlab.example.com/team/tool")
        );
        assert_eq!(normalize_remote_url("widgets"), None);
    }

    #[test]
    fn repo_id_from_origin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(
            dir.path().join(".git/config"),
            "[core]\n\tbare = false\n[remote \"origin\"]\n\turl = git@github.com:acme/app.git\n",
        )
        .unwrap();
        assert_eq!(derive_repo_id(dir.path()), "github.com/acme/app");
    }

    #[test]
    fn removing_edges_keeps_other_repos() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path());
        hub.add_cross_repo_edges(&[
            edge("repoA", "repoA:.:function:11111111", "lib:.:class:aaaaaaaa"),
            edge("repoB", "repoB:.:function:22222222", "lib:.:class:aaaaaaaa"),
        ])
        .unwrap();
        assert_eq!(hub.get_cross_repo_dependents("lib:.:class:aaaaaaaa").unwrap().len(), 2);

        assert_eq!(hub.remove_cross_repo_edges("repoA").unwrap(), 1);
        let left = hub.get_cross_repo_dependents("lib:.:class:aaaaaaaa").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].source_repo, "repoB");
        assert_eq!(left[0].metadata, json!({"via": "npm"}));
        assert_eq!(hub.get_cross_repo_dependents("lib").unwrap().len(), 1);
    }

    #[test]
    fn expired_cache_entries_miss() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path());
        hub.cache_put("live", &json!({"rows": [1]})).unwrap();
        hub.cache_put_with_ttl("dead", &json!({"rows": [2]}), Duration::ZERO)
            .unwrap();
        assert_eq!(hub.cache_get("live").unwrap(), Some(json!({"rows": [1]})));
        assert_eq!(hub.cache_get("dead").unwrap(), None);
        assert_eq!(hub.cache_purge_expired().unwrap(), 1);
    }

    #[test]
    fn oversized_ttl_saturates_instead_of_expiring() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path());
        hub.cache_put_with_ttl("forever", &json!(1), Duration::MAX).unwrap();
        hub.cache_put_with_ttl("long", &json!(2), Duration::from_secs(u64::MAX / 2)).unwrap();
        assert_eq!(hub.cache_get("forever").unwrap(), Some(json!(1)));
        assert_eq!(hub.cache_get("long").unwrap(), Some(json!(2)));
        assert_eq!(hub.cache_purge_expired().unwrap(), 0);

        let expires: i64 = hub
            .conn
            .lock()
            .query_row(
                "SELECT expires_at_ms FROM query_cache WHERE query_hash = 'forever';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(expires, i64::MAX);
    }

    #[test]
    fn cache_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let config = HubConfig {
            hub_dir: dir.path().to_string_lossy().into_owned(),
            cache_max_entries: 2,
            ..HubConfig::default()
        };
        let hub = CentralHub::open(&config, &EngineConfig::default()).unwrap();
        for key in ["a", "b", "c"] {
            hub.cache_put(key, &json!(key)).unwrap();
        }
        assert_eq!(hub.cache_len().unwrap(), 2);
        assert_eq!(hub.cache_get("a").unwrap(), None);
        assert_eq!(hub.cache_get("c").unwrap(), Some(json!("c")));
    }

    #[test]
    fn diagnostics_replace_per_source() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path());
        let diag = |sev: Severity, msg: &str| Diagnostic {
            repo_id: String::new(),
            source: String::new(),
            file_path: Some("src/a.ts".into()),
            line: Some(3),
            column: None,
            severity: sev,
            code: Some("TS2304".into()),
            message: msg.into(),
            metadata: Value::Null,
        };
        hub.push_diagnostics("app", "tsc", &[diag(Severity::Error, "x"), diag(Severity::Warning, "y")])
            .unwrap();
        hub.push_diagnostics("app", "eslint", &[diag(Severity::Warning, "z")])
            .unwrap();
        hub.push_diagnostics("app", "tsc", &[diag(Severity::Error, "only")])
            .unwrap();

        let summary = hub.diagnostics_summary(Some("app")).unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.by_source.get("tsc"), Some(&1));
        assert_eq!(summary.by_severity.get("warning"), Some(&1));

        let errors = hub
            .query_diagnostics(&DiagnosticsFilter {
                severity: Some(Severity::Error),
                ..DiagnosticsFilter::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "only");
        assert_eq!(errors[0].source, "tsc");

        assert_eq!(hub.clear_diagnostics(Some("app"), None).unwrap(), 2);
    }

    #[test]
    fn read_only_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let config = HubConfig {
            hub_dir: dir.path().to_string_lossy().into_owned(),
            ..HubConfig::default()
        };
        drop(CentralHub::open(&config, &EngineConfig::default()).unwrap());
        let ro = CentralHub::open_read_only(&config, &EngineConfig::default()).unwrap();
        assert!(ro.list_repos().unwrap().is_empty());
        assert!(matches!(
            ro.register_repo(dir.path()),
            Err(DevacError::HubReadOnly(_))
        ));
    }
}
