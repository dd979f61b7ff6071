//! Pattern-based export extraction, one strategy per language.
//!
//! Extractors only see source text and never follow imports; turning
//! re-export specifiers into files is the index's job.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::NodeKind;

// ---------------------------------------------------------------------------
// Extraction output
// ---------------------------------------------------------------------------

/// A symbol a file exports under `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedExport {
    /// Public name; `default` for anonymous default exports.
    pub name: String,
    /// Declared name inside the file, used for entity ID hashing.
    pub local_name: String,
    pub kind: NodeKind,
    pub is_default: bool,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReExportName {
    pub imported: String,
    pub exported: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReExportKind {
    /// `export * from "./x"`: a barrel.
    All,
    /// `export * as ns from "./x"`.
    Namespace(String),
    /// `export { a, b as c } from "./x"`.
    Named(Vec<ReExportName>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReExport {
    pub specifier: String,
    pub kind: ReExportKind,
    pub line: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExports {
    pub exports: Vec<ExtractedExport>,
    pub reexports: Vec<ReExport>,
}

/// Per-language export extraction strategy.
pub trait ExportExtractor: Send + Sync {
    fn languages(&self) -> &'static [&'static str];

    /// File extensions (with leading dot) this extractor understands.
    fn extensions(&self) -> &'static [&'static str];

    fn extract(&self, file_path: &str, source: &str) -> FileExports;

    fn handles(&self, file_path: &str) -> bool {
        let lower = file_path.to_lowercase();
        if lower.ends_with(".d.ts") || lower.ends_with(".d.mts") || lower.ends_with(".d.cts") {
            return false;
        }
        self.extensions().iter().any(|ext| lower.ends_with(ext))
    }
}

pub fn default_extractors() -> Vec<Box<dyn ExportExtractor>> {
    vec![Box::new(TypeScriptExtractor), Box::new(PythonExtractor)]
}

fn line_at(source: &str, offset: usize) -> usize {
    source[..offset].matches('\n').count() + 1
}

fn is_upper_snake(name: &str) -> bool {
    name.chars().any(|c| c.is_ascii_alphabetic())
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

// ---------------------------------------------------------------------------
// TypeScript / JavaScript
// ---------------------------------------------------------------------------

static BLOCK_COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());

static LINE_COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*//.*$").unwrap());

static TS_DECL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*export[ \t]+(default[ \t]+)?(?:declare[ \t]+)?(?:async[ \t]+)?(function\*?|abstract[ \t]+class|class|interface|type|const[ \t]+enum|enum|namespace|const|let|var)(?:[ \t]+|[ \t]*\*[ \t]*)([A-Za-z_$][\w$]*)",
    )
    .unwrap()
});

static TS_LOCAL_DECL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*(?:declare[ \t]+)?(?:async[ \t]+)?(function\*?|abstract[ \t]+class|class|interface|type|const[ \t]+enum|enum|namespace|const|let|var)(?:[ \t]+|[ \t]*\*[ \t]*)([A-Za-z_$][\w$]*)",
    )
    .unwrap()
});

static TS_DEFAULT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*export[ \t]+default[ \t]+([^\n]*)$").unwrap());

static TS_NAMED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^[ \t]*export[ \t]+(?:type[ \t]*)?\{([^}]*)\}(?:[ \t]*from[ \t]*['"]([^'"]+)['"])?"#,
    )
    .unwrap()
});

static TS_STAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^[ \t]*export[ \t]+(?:type[ \t]+)?\*(?:[ \t]+as[ \t]+([A-Za-z_$][\w$]*))?[ \t]*from[ \t]*['"]([^'"]+)['"]"#,
    )
    .unwrap()
});

static TS_ARROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[ \t]*(?::[^=]+)?=[ \t]*(?:async[ \t]+)?(?:function\b|\([^)]*\)[ \t]*(?::[^=]+)?=>|[A-Za-z_$][\w$]*[ \t]*=>)",
    )
    .unwrap()
});

static TS_DECLARATOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_$][\w$]*)[ \t]*(?:[=:,;!\r\n]|$)").unwrap()
});

static TS_IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_$][\w$]*)[ \t]*;?[ \t]*$").unwrap());

/// Blank out comments while keeping line numbers stable.
fn strip_ts_comments(source: &str) -> String {
    let without_blocks = BLOCK_COMMENT_RE.replace_all(source, |caps: &regex::Captures| {
        "\n".repeat(caps[0].matches('\n').count())
    });
    LINE_COMMENT_RE.replace_all(&without_blocks, "").into_owned()
}

fn ts_kind(keyword: &str, name: &str, rest_of_line: &str) -> NodeKind {
    let keyword = keyword.split_whitespace().last().unwrap_or(keyword);
    match keyword.trim_end_matches('*') {
        "function" => NodeKind::Function,
        "class" => NodeKind::Class,
        "interface" => NodeKind::Interface,
        "type" => NodeKind::Type,
        "enum" => NodeKind::Enum,
        "namespace" => NodeKind::Namespace,
        _ if TS_ARROW_RE.is_match(rest_of_line) => NodeKind::Function,
        _ if is_upper_snake(name) => NodeKind::Constant,
        _ => NodeKind::Variable,
    }
}

/// Names declared after the first one in `const a = 1, b = 2`. `from` is the
/// offset just past the first declarator's name. Commas nested in brackets
/// or string literals do not start a declarator.
fn trailing_declarators(source: &str, from: usize) -> Vec<(String, usize)> {
    let bytes = source.as_bytes();
    let mut names = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut last = 0u8;
    let mut i = from;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' | b'`' => quote = Some(b),
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            b';' if depth == 0 => break,
            b'\n' if depth == 0 && !matches!(last, b',' | b'=') => break,
            b',' if depth == 0 => {
                if let Some(name) = TS_DECLARATOR_RE.captures(&source[i + 1..]).and_then(|c| c.get(1)) {
                    names.push((name.as_str().to_string(), i + 1 + name.start()));
                }
            }
            _ => {}
        }
        if !b.is_ascii_whitespace() {
            last = b;
        }
        i += 1;
    }
    names
}

fn rest_of_line(source: &str, from: usize) -> &str {
    let tail = &source[from..];
    tail.split('\n').next().unwrap_or("")
}

fn parse_specifier_list(list: &str) -> Vec<ReExportName> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|item| {
            let item = item.strip_prefix("type ").unwrap_or(item).trim();
            let mut parts = item.split_whitespace();
            let imported = parts.next()?.to_string();
            let exported = match (parts.next(), parts.next()) {
                (Some("as"), Some(alias)) => alias.to_string(),
                _ => imported.clone(),
            };
            Some(ReExportName { imported, exported })
        })
        .collect()
}

/// Regex extractor for TypeScript and JavaScript modules.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeScriptExtractor;

impl TypeScriptExtractor {
    fn local_kinds(source: &str) -> HashMap<String, NodeKind> {
        let mut kinds = HashMap::new();
        for caps in TS_LOCAL_DECL_RE.captures_iter(source) {
            let name = caps[2].to_string();
            let end = caps.get(0).map(|m| m.end()).unwrap_or(0);
            let kind = ts_kind(&caps[1], &name, rest_of_line(source, end));
            kinds.entry(name).or_insert(kind);
        }
        kinds
    }
}

impl ExportExtractor for TypeScriptExtractor {
    fn languages(&self) -> &'static [&'static str] {
        &["typescript", "javascript"]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[".ts", ".tsx", ".js", ".jsx", ".mts", ".cts", ".mjs", ".cjs"]
    }

    fn extract(&self, _file_path: &str, source: &str) -> FileExports {
        let source = strip_ts_comments(source);
        let mut out = FileExports::default();
        let mut seen: HashSet<String> = HashSet::new();
        let local_kinds = Self::local_kinds(&source);

        for caps in TS_DECL_RE.captures_iter(&source) {
            let Some(whole) = caps.get(0) else { continue };
            let is_default = caps.get(1).is_some();
            let declared = caps[3].to_string();
            let kind = ts_kind(&caps[2], &declared, rest_of_line(&source, whole.end()));
            // `export default class extends Base {}` has no name.
            let anonymous = declared == "extends" || declared == "implements";
            let local_name = if anonymous { "default".to_string() } else { declared };
            let name = if is_default && anonymous {
                "default".to_string()
            } else {
                local_name.clone()
            };
            if seen.insert(name.clone()) {
                out.exports.push(ExtractedExport {
                    name,
                    local_name,
                    kind,
                    is_default,
                    line: line_at(&source, whole.start()),
                });
            }
            if !is_default && matches!(&caps[2], "const" | "let" | "var") {
                for (extra, at) in trailing_declarators(&source, whole.end()) {
                    let kind = ts_kind(&caps[2], &extra, rest_of_line(&source, at + extra.len()));
                    if seen.insert(extra.clone()) {
                        out.exports.push(ExtractedExport {
                            name: extra.clone(),
                            local_name: extra,
                            kind,
                            is_default: false,
                            line: line_at(&source, at),
                        });
                    }
                }
            }
        }

        for caps in TS_DEFAULT_RE.captures_iter(&source) {
            let Some(whole) = caps.get(0) else { continue };
            let rest = caps[1].trim();
            let line = line_at(&source, whole.start());
            if out.exports.iter().any(|e| e.is_default && e.line == line) {
                continue;
            }
            let (local_name, kind) = if rest.starts_with("function") || rest.starts_with("async") {
                ("default".to_string(), NodeKind::Function)
            } else if rest.starts_with("class") {
                ("default".to_string(), NodeKind::Class)
            } else if let Some(ident) = TS_IDENT_RE.captures(rest) {
                let ident = ident[1].to_string();
                let kind = local_kinds.get(&ident).copied().unwrap_or(NodeKind::Variable);
                (ident, kind)
            } else {
                ("default".to_string(), NodeKind::Variable)
            };
            out.exports.retain(|e| !e.is_default);
            out.exports.push(ExtractedExport {
                name: if local_name == "default" {
                    "default".to_string()
                } else {
                    local_name.clone()
                },
                local_name,
                kind,
                is_default: true,
                line,
            });
        }

        for caps in TS_NAMED_RE.captures_iter(&source) {
            let Some(whole) = caps.get(0) else { continue };
            let line = line_at(&source, whole.start());
            let names = parse_specifier_list(&caps[1]);
            match caps.get(2) {
                Some(from) => out.reexports.push(ReExport {
                    specifier: from.as_str().to_string(),
                    kind: ReExportKind::Named(names),
                    line,
                }),
                None => {
                    for n in names {
                        let is_default = n.exported == "default";
                        let kind = local_kinds.get(&n.imported).copied().unwrap_or(NodeKind::Variable);
                        let name = if is_default { n.imported.clone() } else { n.exported.clone() };
                        if !seen.insert(name.clone()) && !is_default {
                            continue;
                        }
                        out.exports.push(ExtractedExport {
                            name,
                            local_name: n.imported,
                            kind,
                            is_default,
                            line,
                        });
                    }
                }
            }
        }

        for caps in TS_STAR_RE.captures_iter(&source) {
            let Some(whole) = caps.get(0) else { continue };
            let kind = match caps.get(1) {
                Some(ns) => ReExportKind::Namespace(ns.as_str().to_string()),
                None => ReExportKind::All,
            };
            out.reexports.push(ReExport {
                specifier: caps[2].to_string(),
                kind,
                line: line_at(&source, whole.start()),
            });
        }

        out
    }
}

// ---------------------------------------------------------------------------
// Python
// ---------------------------------------------------------------------------

static PY_DEF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(?:async[ \t]+)?def[ \t]+([A-Za-z_]\w*)").unwrap());

static PY_CLASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^class[ \t]+([A-Za-z_]\w*)").unwrap());

static PY_ASSIGN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([A-Za-z_]\w*)[ \t]*(?::[^=\n]+)?=[^=]").unwrap());

static PY_ALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^__all__[ \t]*(?::[^=\n]+)?(?:=|\+=)[ \t]*[\[\(](.*?)[\]\)]").unwrap()
});

static PY_QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"['"]([A-Za-z_]\w*)['"]"#).unwrap());

static PY_FROM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^from[ \t]+(\.+[\w.]*)[ \t]+import[ \t]+(\([^)]*\)|[^\n]+)").unwrap()
});

/// Module-level definitions of Python files. Honors `__all__` when present;
/// otherwise every public (non-underscore) name is exported.
#[derive(Debug, Clone, Copy, Default)]
pub struct PythonExtractor;

impl ExportExtractor for PythonExtractor {
    fn languages(&self) -> &'static [&'static str] {
        &["python"]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[".py"]
    }

    fn extract(&self, file_path: &str, source: &str) -> FileExports {
        let mut declared: Vec<ExtractedExport> = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |name: &str, kind: NodeKind, offset: usize| {
            if name == "__all__" || !seen.insert(name.to_string()) {
                return;
            }
            declared.push(ExtractedExport {
                name: name.to_string(),
                local_name: name.to_string(),
                kind,
                is_default: false,
                line: line_at(source, offset),
            });
        };
        for caps in PY_DEF_RE.captures_iter(source) {
            push(&caps[1], NodeKind::Function, caps.get(0).map_or(0, |m| m.start()));
        }
        for caps in PY_CLASS_RE.captures_iter(source) {
            push(&caps[1], NodeKind::Class, caps.get(0).map_or(0, |m| m.start()));
        }
        for caps in PY_ASSIGN_RE.captures_iter(source) {
            let name = &caps[1];
            let kind = if is_upper_snake(name) {
                NodeKind::Constant
            } else {
                NodeKind::Variable
            };
            push(name, kind, caps.get(0).map_or(0, |m| m.start()));
        }

        let dunder_all: Option<HashSet<String>> = PY_ALL_RE.captures(source).map(|caps| {
            PY_QUOTED_RE
                .captures_iter(&caps[1])
                .map(|c| c[1].to_string())
                .collect()
        });

        let is_package_init = Path::new(file_path)
            .file_name()
            .map(|n| n == "__init__.py")
            .unwrap_or(false);
        let mut reexports = Vec::new();
        for caps in PY_FROM_RE.captures_iter(source) {
            let line = line_at(source, caps.get(0).map_or(0, |m| m.start()));
            let list = caps[2].trim().trim_start_matches('(').trim_end_matches(')');
            let list = list.split('#').next().unwrap_or("");
            if list.trim() == "*" {
                if is_package_init || dunder_all.is_some() {
                    reexports.push(ReExport {
                        specifier: caps[1].to_string(),
                        kind: ReExportKind::All,
                        line,
                    });
                }
                continue;
            }
            let names: Vec<ReExportName> = parse_specifier_list(list)
                .into_iter()
                .filter(|n| match &dunder_all {
                    Some(all) => all.contains(&n.exported),
                    None => is_package_init && !n.exported.starts_with('_'),
                })
                .collect();
            if !names.is_empty() {
                reexports.push(ReExport {
                    specifier: caps[1].to_string(),
                    kind: ReExportKind::Named(names),
                    line,
                });
            }
        }

        let exports = declared
            .into_iter()
            .filter(|e| match &dunder_all {
                Some(all) => all.contains(&e.name),
                None => !e.name.starts_with('_'),
            })
            .collect();

        FileExports { exports, reexports }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(out: &FileExports) -> Vec<&str> {
        out.exports.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn typescript_declarations() {
        let src = r#"
/** docs mentioning export function ghost() */
export function helper(a: string) {}
export async function load() {}
export abstract class Base {}
export interface Shape { x: number }
export type Id = string;
export const enum Color { Red }
export const handler = async (req) => req;
export const MAX_RETRIES = 3;
export let counter = 0;
// export function commented() {}
function internal() {}
"#;
        let out = TypeScriptExtractor.extract("src/a.ts", src);
        assert_eq!(
            names(&out),
            vec!["helper", "load", "Base", "Shape", "Id", "Color", "handler", "MAX_RETRIES", "counter"]
        );
        let kinds: Vec<NodeKind> = out.exports.iter().map(|e| e.kind).collect();
        assert_eq!(kinds[0], NodeKind::Function);
        assert_eq!(kinds[2], NodeKind::Class);
        assert_eq!(kinds[3], NodeKind::Interface);
        assert_eq!(kinds[4], NodeKind::Type);
        assert_eq!(kinds[5], NodeKind::Enum);
        assert_eq!(kinds[6], NodeKind::Function);
        assert_eq!(kinds[7], NodeKind::Constant);
        assert_eq!(kinds[8], NodeKind::Variable);
        assert_eq!(out.exports[0].line, 3);
    }

    #[test]
    fn typescript_declarator_lists() {
        let src = r#"
export const a = 1, b = 2;
export let first = f(1, 2), second = [3, 4], THIRD = "x, y";
export const table: Map<string, number> = new Map(), handler = (x) => x;
export var left = 0,
    right = 1;
export const done = 1
const after = 2, notExported = 3;
"#;
        let out = TypeScriptExtractor.extract("src/a.ts", src);
        assert_eq!(
            names(&out),
            vec!["a", "b", "first", "second", "THIRD", "table", "handler", "left", "right", "done"]
        );
        let by_name = |n: &str| out.exports.iter().find(|e| e.name == n).unwrap();
        assert_eq!(by_name("THIRD").kind, NodeKind::Constant);
        assert_eq!(by_name("handler").kind, NodeKind::Function);
        assert_eq!(by_name("right").line, 6);
        assert!(!by_name("b").is_default);
    }

    #[test]
    fn typescript_defaults() {
        let out = TypeScriptExtractor.extract("a.ts", "export default function App() {}\n");
        assert_eq!(out.exports.len(), 1);
        assert!(out.exports[0].is_default);
        assert_eq!(out.exports[0].name, "App");

        let out = TypeScriptExtractor.extract("b.ts", "export default class extends Base {}\n");
        assert_eq!(out.exports[0].name, "default");
        assert_eq!(out.exports[0].kind, NodeKind::Class);

        let out = TypeScriptExtractor.extract("c.ts", "class Store {}\nexport default Store;\n");
        assert_eq!(out.exports[0].local_name, "Store");
        assert_eq!(out.exports[0].kind, NodeKind::Class);
        assert!(out.exports[0].is_default);
    }

    #[test]
    fn typescript_named_and_reexports() {
        let src = r#"
function a() {}
const b = 1;
export { a, b as bee };
export { x as y, z } from "./other";
export type { T } from './types';
export * from "./barrel";
export * as ns from "./ns";
"#;
        let out = TypeScriptExtractor.extract("index.ts", src);
        assert_eq!(names(&out), vec!["a", "bee"]);
        assert_eq!(out.exports[1].local_name, "b");
        assert_eq!(out.exports[0].kind, NodeKind::Function);
        assert_eq!(out.reexports.len(), 4);
        assert_eq!(
            out.reexports[0].kind,
            ReExportKind::Named(vec![
                ReExportName { imported: "x".into(), exported: "y".into() },
                ReExportName { imported: "z".into(), exported: "z".into() },
            ])
        );
        assert_eq!(out.reexports[2].kind, ReExportKind::All);
        assert_eq!(out.reexports[3].kind, ReExportKind::Namespace("ns".into()));
    }

    #[test]
    fn declaration_files_are_not_handled() {
        assert!(TypeScriptExtractor.handles("src/a.tsx"));
        assert!(!TypeScriptExtractor.handles("src/a.d.ts"));
        assert!(PythonExtractor.handles("pkg/mod.py"));
    }

    #[test]
    fn python_public_names() {
        let src = "import os\n\nMAX = 3\n_private = 1\n\ndef helper():\n    inner = 2\n\nclass Model:\n    field = 1\n";
        let out = PythonExtractor.extract("pkg/mod.py", src);
        let mut got = names(&out);
        got.sort();
        assert_eq!(got, vec!["MAX", "Model", "helper"]);
        assert_eq!(
            out.exports.iter().find(|e| e.name == "MAX").unwrap().kind,
            NodeKind::Constant
        );
    }

    #[test]
    fn python_dunder_all_and_package_reexports() {
        let src = "from .models import User, Group as G\nfrom .util import *\n__all__ = ['User', 'helper']\n\ndef helper(): ...\ndef other(): ...\n";
        let out = PythonExtractor.extract("pkg/__init__.py", src);
        assert_eq!(names(&out), vec!["helper"]);
        assert_eq!(out.reexports.len(), 2);
        assert_eq!(
            out.reexports[0].kind,
            ReExportKind::Named(vec![ReExportName {
                imported: "User".into(),
                exported: "User".into()
            }])
        );
    }
}
