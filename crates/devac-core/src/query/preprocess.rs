//! `table@package` expansion.
//!
//! `nodes@core` becomes a subquery over the per-package copy of the `nodes`
//! table; `nodes@*` becomes the union over every package in the query.
//! Labels are the package directory name and the package path relative to
//! the common root of all queried packages.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use indexmap::{IndexMap, IndexSet};
use regex::{Captures, Regex};

use crate::errors::{DevacError, DevacResult};
use crate::store::SeedTable;

static PACKAGE_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(nodes|edges|external_refs|effects)@(\*|[A-Za-z0-9_.\-/]*[A-Za-z0-9_\-])").unwrap()
});

/// Name of the engine table holding `table` rows for package `index`.
pub fn package_table(table: SeedTable, index: usize) -> String {
    format!("{}__{}", table.name(), index)
}

/// Label → package index lookup for one query.
#[derive(Debug, Clone, Default)]
pub struct PackageLabels {
    labels: IndexMap<String, IndexSet<usize>>,
    count: usize,
}

impl PackageLabels {
    pub fn new(packages: &[PathBuf]) -> Self {
        let root = common_root(packages);
        let mut labels: IndexMap<String, IndexSet<usize>> = IndexMap::new();
        for (i, pkg) in packages.iter().enumerate() {
            if let Some(name) = pkg.file_name() {
                labels
                    .entry(name.to_string_lossy().into_owned())
                    .or_default()
                    .insert(i);
            }
            if let Some(rel) = root.as_ref().and_then(|r| pkg.strip_prefix(r).ok()) {
                let rel = rel.to_string_lossy().replace('\\', "/");
                if !rel.is_empty() {
                    labels.entry(rel).or_default().insert(i);
                }
            }
            labels
                .entry(pkg.to_string_lossy().replace('\\', "/"))
                .or_default()
                .insert(i);
        }
        Self {
            labels,
            count: packages.len(),
        }
    }

    pub fn resolve(&self, label: &str) -> DevacResult<usize> {
        let label = label.trim_end_matches('/');
        match self.labels.get(label) {
            None => Err(DevacError::QueryPreprocess(format!(
                "unknown package '{label}'"
            ))),
            Some(hits) if hits.len() > 1 => Err(DevacError::QueryPreprocess(format!(
                "package label '{label}' is ambiguous; use a longer path"
            ))),
            Some(hits) => hits
                .first()
                .copied()
                .ok_or_else(|| DevacError::QueryPreprocess(format!("unknown package '{label}'"))),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

fn common_root(packages: &[PathBuf]) -> Option<PathBuf> {
    let mut iter = packages.iter();
    let first: Vec<Component<'_>> = iter.next()?.components().collect();
    let mut len = first.len();
    for pkg in iter {
        len = first
            .iter()
            .zip(pkg.components())
            .take(len)
            .take_while(|(a, b)| *a == b)
            .count();
    }
    if packages.len() == 1 {
        // A lone package labels itself by name only.
        len = len.saturating_sub(1);
    }
    Some(first[..len].iter().collect::<PathBuf>())
}

/// Result of expanding one SQL string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preprocessed {
    pub sql: String,
    /// Package indexes referenced through `@` syntax.
    pub referenced: IndexSet<usize>,
}

/// Split `sql` into spans; `true` marks code outside string literals,
/// quoted identifiers and comments. Unterminated spans run to the end.
fn sql_spans(sql: &str) -> Vec<(&str, bool)> {
    let bytes = sql.as_bytes();
    let mut spans = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let end = match bytes[i] {
            q @ (b'\'' | b'"' | b'`') => Some(
                sql[i + 1..]
                    .find(char::from(q))
                    .map(|p| i + 1 + p + 1)
                    .unwrap_or(bytes.len()),
            ),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                Some(sql[i..].find('\n').map(|p| i + p).unwrap_or(bytes.len()))
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                Some(sql[i + 2..].find("*/").map(|p| i + 2 + p + 2).unwrap_or(bytes.len()))
            }
            _ => None,
        };
        match end {
            Some(end) => {
                if start < i {
                    spans.push((&sql[start..i], true));
                }
                spans.push((&sql[i..end], false));
                start = end;
                i = end;
            }
            None => i += 1,
        }
    }
    if start < bytes.len() {
        spans.push((&sql[start..], true));
    }
    spans
}

/// Expand every `table@package` reference in `sql`. `available` reports
/// whether a table was loaded for the query at all. Text inside string
/// literals, quoted identifiers and comments is left as written.
pub fn preprocess(
    sql: &str,
    labels: &PackageLabels,
    available: impl Fn(SeedTable) -> bool,
) -> DevacResult<Preprocessed> {
    let mut referenced = IndexSet::new();
    let mut failure: Option<DevacError> = None;

    let mut expand = |caps: &Captures<'_>| {
        if failure.is_some() {
            return String::new();
        }
        let table_name = caps[1].to_lowercase();
        let Some(table) = SeedTable::from_name(&table_name) else {
            failure = Some(DevacError::QueryPreprocess(format!("unknown table '{table_name}'")));
            return String::new();
        };
        if !available(table) {
            failure = Some(DevacError::QueryPreprocess(format!(
                "table '{table_name}' has no seed data in the queried packages"
            )));
            return String::new();
        }
        let target = &caps[2];
        if target == "*" {
            if labels.is_empty() {
                failure = Some(DevacError::QueryPreprocess(
                    "no packages available for '@*'".to_string(),
                ));
                return String::new();
            }
            let parts: Vec<String> = (0..labels.len())
                .map(|i| {
                    referenced.insert(i);
                    format!("SELECT * FROM {}", package_table(table, i))
                })
                .collect();
            return format!("({})", parts.join(" UNION ALL "));
        }
        match labels.resolve(target) {
            Ok(i) => {
                referenced.insert(i);
                format!("(SELECT * FROM {})", package_table(table, i))
            }
            Err(e) => {
                failure = Some(e);
                String::new()
            }
        }
    };

    let mut expanded = String::with_capacity(sql.len());
    for (span, is_code) in sql_spans(sql) {
        if is_code {
            expanded.push_str(&PACKAGE_REF_RE.replace_all(span, &mut expand));
        } else {
            expanded.push_str(span);
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }
    Ok(Preprocessed {
        sql: expanded,
        referenced,
    })
}

/// Package label used in result diagnostics.
pub fn display_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
