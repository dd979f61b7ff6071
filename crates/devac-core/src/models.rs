//! Shared typed models used across addressing, storage, resolution and the hub.
//!
//! Rows mirror what the structural parsers emit per file (`ParseResult`) and
//! what the seed store persists per table. Kind/type fields are closed enums
//! that round-trip through their wire strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::errors::DevacError;

/// Branch holding the authoritative full snapshot.
pub const BASE_BRANCH: &str = "base";

/// RFC 3339 timestamp used for `updated_at` columns.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ---------------------------------------------------------------------------
// String-backed enums
// ---------------------------------------------------------------------------

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = DevacError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(DevacError::InvalidParams(format!(
                        "unknown {} {:?}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_enum! {
    /// Structural symbol kind.
    pub enum NodeKind {
        Function => "function",
        Class => "class",
        Method => "method",
        Property => "property",
        Variable => "variable",
        Constant => "constant",
        Interface => "interface",
        Type => "type",
        Enum => "enum",
        EnumMember => "enum_member",
        Namespace => "namespace",
        Module => "module",
        Parameter => "parameter",
        Decorator => "decorator",
        JsxComponent => "jsx_component",
        Hook => "hook",
        Unknown => "unknown",
    }
}

string_enum! {
    /// Directed relationship between two entities.
    pub enum EdgeType {
        Contains => "CONTAINS",
        Calls => "CALLS",
        Imports => "IMPORTS",
        Extends => "EXTENDS",
        Implements => "IMPLEMENTS",
        Returns => "RETURNS",
        ParameterOf => "PARAMETER_OF",
        TypeOf => "TYPE_OF",
        Decorates => "DECORATES",
        Overrides => "OVERRIDES",
        References => "REFERENCES",
        Exports => "EXPORTS",
        ReExports => "RE_EXPORTS",
        Instantiates => "INSTANTIATES",
        UsesType => "USES_TYPE",
        Accesses => "ACCESSES",
        Throws => "THROWS",
        Awaits => "AWAITS",
        Yields => "YIELDS",
        Unknown => "UNKNOWN",
    }
}

string_enum! {
    /// Runtime effect observed in a function body.
    pub enum EffectType {
        FunctionCall => "FunctionCall",
        Store => "Store",
        Retrieve => "Retrieve",
        Send => "Send",
        Request => "Request",
        Response => "Response",
        Condition => "Condition",
        Loop => "Loop",
        Group => "Group",
    }
}

impl NodeKind {
    /// Parse leniently; unknown kinds from newer parsers map to `Unknown`.
    pub fn parse_lossy(s: &str) -> Self {
        s.parse().unwrap_or(NodeKind::Unknown)
    }
}

impl EdgeType {
    pub fn parse_lossy(s: &str) -> Self {
        s.parse().unwrap_or(EdgeType::Unknown)
    }
}

// ---------------------------------------------------------------------------
// Seed rows
// ---------------------------------------------------------------------------

fn default_visibility() -> String {
    "public".to_string()
}

fn default_branch() -> String {
    BASE_BRANCH.to_string()
}

fn default_import_style() -> String {
    "named".to_string()
}

/// One structural symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub entity_id: String,
    pub name: String,
    #[serde(default)]
    pub qualified_name: String,
    pub kind: NodeKind,
    pub file_path: String,
    #[serde(default)]
    pub start_line: i64,
    #[serde(default)]
    pub end_line: i64,
    #[serde(default)]
    pub start_column: i64,
    #[serde(default)]
    pub end_column: i64,
    #[serde(default)]
    pub is_exported: bool,
    #[serde(default)]
    pub is_default_export: bool,
    #[serde(default = "default_visibility")]
    pub visibility: String,
    #[serde(default)]
    pub is_async: bool,
    #[serde(default)]
    pub is_generator: bool,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub type_signature: Option<String>,
    #[serde(default)]
    pub documentation: Option<String>,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub source_file_hash: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub updated_at: String,
}

/// Directed relationship between two entity IDs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub edge_type: EdgeType,
    #[serde(default)]
    pub source_file_path: String,
    #[serde(default)]
    pub source_line: i64,
    #[serde(default)]
    pub source_column: i64,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub source_file_hash: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub updated_at: String,
}

/// An import whose target may or may not be resolvable in the known graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRef {
    pub source_entity_id: String,
    pub source_file_path: String,
    pub module_specifier: String,
    pub imported_symbol: String,
    #[serde(default, alias = "local_name")]
    pub local_alias: Option<String>,
    #[serde(default = "default_import_style")]
    pub import_style: String,
    #[serde(default)]
    pub is_type_only: bool,
    #[serde(default)]
    pub source_line: i64,
    #[serde(default)]
    pub source_column: i64,
    #[serde(default)]
    pub is_resolved: bool,
    #[serde(default)]
    pub is_reexport: bool,
    #[serde(default)]
    pub export_alias: Option<String>,
    #[serde(default)]
    pub target_entity_id: Option<String>,
    #[serde(default)]
    pub source_file_hash: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub updated_at: String,
}

impl ExternalRef {
    /// Whether the specifier is relative (`./`, `../`, or a Python leading dot).
    pub fn is_relative(&self) -> bool {
        self.module_specifier.starts_with('.')
    }
}

/// Runtime effect extracted from a function body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    pub effect_id: String,
    pub effect_type: EffectType,
    #[serde(default)]
    pub timestamp: String,
    pub source_entity_id: String,
    pub source_file_path: String,
    #[serde(default)]
    pub source_line: i64,
    #[serde(default)]
    pub source_column: i64,
    #[serde(default)]
    pub target_entity_id: Option<String>,
    #[serde(default)]
    pub callee_name: Option<String>,
    #[serde(default)]
    pub is_external: bool,
    #[serde(default)]
    pub is_async: bool,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub source_file_hash: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Parser contract and resolver output
// ---------------------------------------------------------------------------

/// Per-file output of a structural parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseResult {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub external_refs: Vec<ExternalRef>,
    #[serde(default)]
    pub effects: Vec<Effect>,
    pub source_file_hash: String,
    pub file_path: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// A relative import that the semantic resolver bound to an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRef {
    pub source_entity_id: String,
    pub source_file_path: String,
    pub module_specifier: String,
    pub imported_symbol: String,
    pub target_entity_id: String,
    pub target_file: String,
    pub target_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_round_trip_through_strings() {
        for kind in NodeKind::ALL {
            assert_eq!(kind.as_str().parse::<NodeKind>().unwrap(), *kind);
        }
        for edge in EdgeType::ALL {
            assert_eq!(edge.as_str().parse::<EdgeType>().unwrap(), *edge);
        }
        assert!("Teleport".parse::<EffectType>().is_err());
        assert_eq!(NodeKind::parse_lossy("widget"), NodeKind::Unknown);
    }

    #[test]
    fn parse_result_accepts_parser_json() {
        let raw = r#"{
            "nodes": [{
                "entity_id": "app:pkg:function:abcd1234",
                "kind": "function",
                "name": "helper",
                "qualified_name": "helper",
                "file_path": "src/utils.py",
                "start_line": 3,
                "end_line": 5,
                "start_column": 0,
                "end_column": 10,
                "language": "python",
                "is_exported": true
            }],
            "edges": [{
                "edge_id": "CONTAINS:a:b",
                "edge_type": "CONTAINS",
                "source_entity_id": "a",
                "target_entity_id": "b",
                "source_file_path": "src/utils.py"
            }],
            "externalRefs": [{
                "source_entity_id": "a",
                "source_file_path": "src/utils.py",
                "module_specifier": ".models",
                "imported_symbol": "User",
                "local_name": "U"
            }],
            "sourceFileHash": "f00d",
            "filePath": "src/utils.py",
            "parseTimeMs": 3
        }"#;
        let parsed: ParseResult = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.nodes[0].kind, NodeKind::Function);
        assert_eq!(parsed.nodes[0].visibility, "public");
        assert_eq!(parsed.edges[0].edge_type, EdgeType::Contains);
        assert_eq!(parsed.external_refs[0].local_alias.as_deref(), Some("U"));
        assert!(parsed.external_refs[0].is_relative());
        assert_eq!(parsed.nodes[0].branch, BASE_BRANCH);
    }
}
