//! Seed table DDL and row mapping.
//!
//! Every seed table lives in its own single-table SQLite file so a package's
//! nodes, edges, external refs and effects can be replaced independently.
//! Each file also carries a `seed_meta` key/value table holding the schema
//! version. Rows share the delta columns `branch`, `is_deleted` and
//! `updated_at`; `seq` preserves insertion order for last-write-wins overlay.

use rusqlite::{params, Connection, Row};
use serde_json::Value;

use crate::errors::{DevacError, DevacResult};
use crate::models::{Edge, EdgeType, Effect, EffectType, ExternalRef, Node, NodeKind};

/// Current seed file schema version.
pub const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeedTable {
    Nodes,
    Edges,
    ExternalRefs,
    Effects,
}

impl SeedTable {
    pub const ALL: [SeedTable; 4] = [
        SeedTable::Nodes,
        SeedTable::Edges,
        SeedTable::ExternalRefs,
        SeedTable::Effects,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SeedTable::Nodes => "nodes",
            SeedTable::Edges => "edges",
            SeedTable::ExternalRefs => "external_refs",
            SeedTable::Effects => "effects",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.db", self.name())
    }

    pub fn from_name(name: &str) -> Option<SeedTable> {
        SeedTable::ALL.iter().copied().find(|t| t.name() == name)
    }

    pub fn ddl(&self) -> &'static [&'static str] {
        match self {
            SeedTable::Nodes => NODES_DDL,
            SeedTable::Edges => EDGES_DDL,
            SeedTable::ExternalRefs => EXTERNAL_REFS_DDL,
            SeedTable::Effects => EFFECTS_DDL,
        }
    }
}

const META_DDL: &str = "CREATE TABLE IF NOT EXISTS seed_meta (
    key TEXT PRIMARY KEY,
    value TEXT
);";

const NODES_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS nodes (
        seq INTEGER PRIMARY KEY,
        entity_id TEXT NOT NULL,
        name TEXT NOT NULL,
        qualified_name TEXT NOT NULL,
        kind TEXT NOT NULL,
        file_path TEXT NOT NULL,
        start_line INTEGER NOT NULL DEFAULT 0,
        end_line INTEGER NOT NULL DEFAULT 0,
        start_column INTEGER NOT NULL DEFAULT 0,
        end_column INTEGER NOT NULL DEFAULT 0,
        is_exported INTEGER NOT NULL DEFAULT 0,
        is_default_export INTEGER NOT NULL DEFAULT 0,
        visibility TEXT NOT NULL DEFAULT 'public',
        is_async INTEGER NOT NULL DEFAULT 0,
        is_generator INTEGER NOT NULL DEFAULT 0,
        is_static INTEGER NOT NULL DEFAULT 0,
        is_abstract INTEGER NOT NULL DEFAULT 0,
        type_signature TEXT,
        documentation TEXT,
        properties TEXT,
        source_file_hash TEXT NOT NULL DEFAULT '',
        branch TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_nodes_file ON nodes(file_path);",
    "CREATE INDEX IF NOT EXISTS idx_nodes_entity ON nodes(entity_id);",
];

const EDGES_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS edges (
        seq INTEGER PRIMARY KEY,
        source_entity_id TEXT NOT NULL,
        target_entity_id TEXT NOT NULL,
        edge_type TEXT NOT NULL,
        source_file_path TEXT NOT NULL,
        source_line INTEGER NOT NULL DEFAULT 0,
        source_column INTEGER NOT NULL DEFAULT 0,
        properties TEXT,
        source_file_hash TEXT NOT NULL DEFAULT '',
        branch TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_edges_file ON edges(source_file_path);",
    "CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_entity_id);",
    "CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_entity_id);",
];

const EXTERNAL_REFS_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS external_refs (
        seq INTEGER PRIMARY KEY,
        source_entity_id TEXT NOT NULL,
        source_file_path TEXT NOT NULL,
        module_specifier TEXT NOT NULL,
        imported_symbol TEXT NOT NULL,
        local_alias TEXT,
        import_style TEXT NOT NULL DEFAULT 'named',
        is_type_only INTEGER NOT NULL DEFAULT 0,
        source_line INTEGER NOT NULL DEFAULT 0,
        source_column INTEGER NOT NULL DEFAULT 0,
        is_resolved INTEGER NOT NULL DEFAULT 0,
        is_reexport INTEGER NOT NULL DEFAULT 0,
        export_alias TEXT,
        target_entity_id TEXT,
        source_file_hash TEXT NOT NULL DEFAULT '',
        branch TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_external_refs_file ON external_refs(source_file_path);",
    "CREATE INDEX IF NOT EXISTS idx_external_refs_module ON external_refs(module_specifier);",
];

const EFFECTS_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS effects (
        seq INTEGER PRIMARY KEY,
        effect_id TEXT NOT NULL,
        effect_type TEXT NOT NULL,
        timestamp TEXT NOT NULL DEFAULT '',
        source_entity_id TEXT NOT NULL,
        source_file_path TEXT NOT NULL,
        source_line INTEGER NOT NULL DEFAULT 0,
        source_column INTEGER NOT NULL DEFAULT 0,
        target_entity_id TEXT,
        callee_name TEXT,
        is_external INTEGER NOT NULL DEFAULT 0,
        is_async INTEGER NOT NULL DEFAULT 0,
        properties TEXT,
        source_file_hash TEXT NOT NULL DEFAULT '',
        branch TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_effects_file ON effects(source_file_path);",
    "CREATE INDEX IF NOT EXISTS idx_effects_entity ON effects(source_entity_id);",
];

/// Create the table (and `seed_meta`) if missing and check the version stamp.
pub fn ensure_schema(conn: &Connection, table: SeedTable) -> DevacResult<()> {
    conn.execute_batch(META_DDL)?;
    for stmt in table.ddl() {
        conn.execute_batch(stmt)?;
    }
    let stored: Option<i32> = conn
        .query_row(
            "SELECT value FROM seed_meta WHERE key = 'schema_version';",
            [],
            |row| row.get::<_, String>(0),
        )
        .ok()
        .and_then(|v| v.parse().ok());
    match stored {
        Some(v) if v > SCHEMA_VERSION => Err(DevacError::Storage(format!(
            "{} seed has schema version {v}, newer than supported {SCHEMA_VERSION}",
            table.name()
        ))),
        Some(_) => Ok(()),
        None => {
            conn.execute(
                "INSERT INTO seed_meta(key, value) VALUES('schema_version', ?1) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
                params![SCHEMA_VERSION.to_string()],
            )?;
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn json_text(value: &Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(value.to_string())
    }
}

fn json_column(row: &Row<'_>, name: &str) -> rusqlite::Result<Value> {
    let raw: Option<String> = row.get(name)?;
    Ok(raw
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null))
}

/// A row type persisted in one seed table.
pub trait SeedRow: Clone + Send + Sync + Sized {
    const TABLE: SeedTable;

    /// Column holding the source file; used to replace or tombstone a file.
    const FILE_COLUMN: &'static str;

    /// Identity used when overlaying branch rows onto base rows.
    fn overlay_key(&self) -> String;

    fn source_file(&self) -> &str;

    fn is_deleted(&self) -> bool;

    fn stamp(&mut self, branch: &str, is_deleted: bool, updated_at: &str);

    fn insert(&self, conn: &Connection) -> rusqlite::Result<()>;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

impl SeedRow for Node {
    const TABLE: SeedTable = SeedTable::Nodes;
    const FILE_COLUMN: &'static str = "file_path";

    fn overlay_key(&self) -> String {
        self.entity_id.clone()
    }

    fn source_file(&self) -> &str {
        &self.file_path
    }

    fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    fn stamp(&mut self, branch: &str, is_deleted: bool, updated_at: &str) {
        self.branch = branch.to_string();
        self.is_deleted = is_deleted;
        self.updated_at = updated_at.to_string();
    }

    fn insert(&self, conn: &Connection) -> rusqlite::Result<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO nodes(entity_id, name, qualified_name, kind, file_path, \
             start_line, end_line, start_column, end_column, is_exported, is_default_export, \
             visibility, is_async, is_generator, is_static, is_abstract, type_signature, \
             documentation, properties, source_file_hash, branch, is_deleted, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
             ?17, ?18, ?19, ?20, ?21, ?22, ?23);",
        )?;
        stmt.execute(params![
            self.entity_id,
            self.name,
            self.qualified_name,
            self.kind.as_str(),
            self.file_path,
            self.start_line,
            self.end_line,
            self.start_column,
            self.end_column,
            self.is_exported,
            self.is_default_export,
            self.visibility,
            self.is_async,
            self.is_generator,
            self.is_static,
            self.is_abstract,
            self.type_signature,
            self.documentation,
            json_text(&self.properties),
            self.source_file_hash,
            self.branch,
            self.is_deleted,
            self.updated_at,
        ])?;
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let kind: String = row.get("kind")?;
        Ok(Node {
            entity_id: row.get("entity_id")?,
            name: row.get("name")?,
            qualified_name: row.get("qualified_name")?,
            kind: NodeKind::parse_lossy(&kind),
            file_path: row.get("file_path")?,
            start_line: row.get("start_line")?,
            end_line: row.get("end_line")?,
            start_column: row.get("start_column")?,
            end_column: row.get("end_column")?,
            is_exported: row.get("is_exported")?,
            is_default_export: row.get("is_default_export")?,
            visibility: row.get("visibility")?,
            is_async: row.get("is_async")?,
            is_generator: row.get("is_generator")?,
            is_static: row.get("is_static")?,
            is_abstract: row.get("is_abstract")?,
            type_signature: row.get("type_signature")?,
            documentation: row.get("documentation")?,
            properties: json_column(row, "properties")?,
            source_file_hash: row.get("source_file_hash")?,
            branch: row.get("branch")?,
            is_deleted: row.get("is_deleted")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl SeedRow for Edge {
    const TABLE: SeedTable = SeedTable::Edges;
    const FILE_COLUMN: &'static str = "source_file_path";

    fn overlay_key(&self) -> String {
        format!(
            "{}\0{}\0{}",
            self.source_entity_id,
            self.target_entity_id,
            self.edge_type.as_str()
        )
    }

    fn source_file(&self) -> &str {
        &self.source_file_path
    }

    fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    fn stamp(&mut self, branch: &str, is_deleted: bool, updated_at: &str) {
        self.branch = branch.to_string();
        self.is_deleted = is_deleted;
        self.updated_at = updated_at.to_string();
    }

    fn insert(&self, conn: &Connection) -> rusqlite::Result<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO edges(source_entity_id, target_entity_id, edge_type, \
             source_file_path, source_line, source_column, properties, source_file_hash, \
             branch, is_deleted, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11);",
        )?;
        stmt.execute(params![
            self.source_entity_id,
            self.target_entity_id,
            self.edge_type.as_str(),
            self.source_file_path,
            self.source_line,
            self.source_column,
            json_text(&self.properties),
            self.source_file_hash,
            self.branch,
            self.is_deleted,
            self.updated_at,
        ])?;
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let edge_type: String = row.get("edge_type")?;
        Ok(Edge {
            source_entity_id: row.get("source_entity_id")?,
            target_entity_id: row.get("target_entity_id")?,
            edge_type: EdgeType::parse_lossy(&edge_type),
            source_file_path: row.get("source_file_path")?,
            source_line: row.get("source_line")?,
            source_column: row.get("source_column")?,
            properties: json_column(row, "properties")?,
            source_file_hash: row.get("source_file_hash")?,
            branch: row.get("branch")?,
            is_deleted: row.get("is_deleted")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl SeedRow for ExternalRef {
    const TABLE: SeedTable = SeedTable::ExternalRefs;
    const FILE_COLUMN: &'static str = "source_file_path";

    fn overlay_key(&self) -> String {
        format!(
            "{}\0{}\0{}",
            self.source_entity_id, self.module_specifier, self.imported_symbol
        )
    }

    fn source_file(&self) -> &str {
        &self.source_file_path
    }

    fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    fn stamp(&mut self, branch: &str, is_deleted: bool, updated_at: &str) {
        self.branch = branch.to_string();
        self.is_deleted = is_deleted;
        self.updated_at = updated_at.to_string();
    }

    fn insert(&self, conn: &Connection) -> rusqlite::Result<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO external_refs(source_entity_id, source_file_path, module_specifier, \
             imported_symbol, local_alias, import_style, is_type_only, source_line, \
             source_column, is_resolved, is_reexport, export_alias, target_entity_id, \
             source_file_hash, branch, is_deleted, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17);",
        )?;
        stmt.execute(params![
            self.source_entity_id,
            self.source_file_path,
            self.module_specifier,
            self.imported_symbol,
            self.local_alias,
            self.import_style,
            self.is_type_only,
            self.source_line,
            self.source_column,
            self.is_resolved,
            self.is_reexport,
            self.export_alias,
            self.target_entity_id,
            self.source_file_hash,
            self.branch,
            self.is_deleted,
            self.updated_at,
        ])?;
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ExternalRef {
            source_entity_id: row.get("source_entity_id")?,
            source_file_path: row.get("source_file_path")?,
            module_specifier: row.get("module_specifier")?,
            imported_symbol: row.get("imported_symbol")?,
            local_alias: row.get("local_alias")?,
            import_style: row.get("import_style")?,
            is_type_only: row.get("is_type_only")?,
            source_line: row.get("source_line")?,
            source_column: row.get("source_column")?,
            is_resolved: row.get("is_resolved")?,
            is_reexport: row.get("is_reexport")?,
            export_alias: row.get("export_alias")?,
            target_entity_id: row.get("target_entity_id")?,
            source_file_hash: row.get("source_file_hash")?,
            branch: row.get("branch")?,
            is_deleted: row.get("is_deleted")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl SeedRow for Effect {
    const TABLE: SeedTable = SeedTable::Effects;
    const FILE_COLUMN: &'static str = "source_file_path";

    fn overlay_key(&self) -> String {
        self.effect_id.clone()
    }

    fn source_file(&self) -> &str {
        &self.source_file_path
    }

    fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    fn stamp(&mut self, branch: &str, is_deleted: bool, updated_at: &str) {
        self.branch = branch.to_string();
        self.is_deleted = is_deleted;
        self.updated_at = updated_at.to_string();
    }

    fn insert(&self, conn: &Connection) -> rusqlite::Result<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO effects(effect_id, effect_type, timestamp, source_entity_id, \
             source_file_path, source_line, source_column, target_entity_id, callee_name, \
             is_external, is_async, properties, source_file_hash, branch, is_deleted, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16);",
        )?;
        stmt.execute(params![
            self.effect_id,
            self.effect_type.as_str(),
            self.timestamp,
            self.source_entity_id,
            self.source_file_path,
            self.source_line,
            self.source_column,
            self.target_entity_id,
            self.callee_name,
            self.is_external,
            self.is_async,
            json_text(&self.properties),
            self.source_file_hash,
            self.branch,
            self.is_deleted,
            self.updated_at,
        ])?;
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let effect_type: String = row.get("effect_type")?;
        let effect_type = effect_type.parse::<EffectType>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
            )
        })?;
        Ok(Effect {
            effect_id: row.get("effect_id")?,
            effect_type,
            timestamp: row.get("timestamp")?,
            source_entity_id: row.get("source_entity_id")?,
            source_file_path: row.get("source_file_path")?,
            source_line: row.get("source_line")?,
            source_column: row.get("source_column")?,
            target_entity_id: row.get("target_entity_id")?,
            callee_name: row.get("callee_name")?,
            is_external: row.get("is_external")?,
            is_async: row.get("is_async")?,
            properties: json_column(row, "properties")?,
            source_file_hash: row.get("source_file_hash")?,
            branch: row.get("branch")?,
            is_deleted: row.get("is_deleted")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Load every row of `R::TABLE` in insertion order.
pub fn select_all<R: SeedRow>(conn: &Connection) -> DevacResult<Vec<R>> {
    let sql = format!("SELECT * FROM {} ORDER BY seq;", R::TABLE.name());
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| R::from_row(row))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BASE_BRANCH;

    fn node(id: &str, file: &str) -> Node {
        serde_json::from_value(serde_json::json!({
            "entity_id": id,
            "name": "helper",
            "kind": "function",
            "file_path": file,
            "properties": {"decorators": ["cached"]}
        }))
        .unwrap()
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        for table in SeedTable::ALL {
            ensure_schema(&conn, table).unwrap();
            ensure_schema(&conn, table).unwrap();
        }
        let version: String = conn
            .query_row("SELECT value FROM seed_meta WHERE key='schema_version'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[test]
    fn newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn, SeedTable::Nodes).unwrap();
        conn.execute("UPDATE seed_meta SET value = '99' WHERE key = 'schema_version'", [])
            .unwrap();
        assert!(matches!(
            ensure_schema(&conn, SeedTable::Nodes),
            Err(DevacError::Storage(_))
        ));
    }

    #[test]
    fn node_rows_survive_sqlite() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn, SeedTable::Nodes).unwrap();
        let mut n = node("app:pkg:function:aaaa1111", "src/a.ts");
        n.stamp(BASE_BRANCH, false, "2026-01-01T00:00:00Z");
        n.insert(&conn).unwrap();

        let rows: Vec<Node> = select_all(&conn).unwrap();
        assert_eq!(rows, vec![n]);
    }

    #[test]
    fn table_names_resolve() {
        assert_eq!(SeedTable::from_name("external_refs"), Some(SeedTable::ExternalRefs));
        assert_eq!(SeedTable::from_name("symbols"), None);
        assert_eq!(SeedTable::Effects.file_name(), "effects.db");
    }
}
