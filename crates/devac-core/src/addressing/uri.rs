//! Canonical URI grammar for addressing any repo, package, file or symbol.
//!
//! ```text
//! devac://{repo}[/{packagePath}][/{filePath}][#{symbolPath}][?{queryParams}]
//! ```
//!
//! A `.` segment marks the boundary between package path and file path; a
//! leading `.` is the root package. Without a marker the boundary is the
//! first source-root directory (`src`, `lib`, `test`, ...) or, failing that,
//! a trailing file name carrying an extension. The formatter writes the
//! marker whenever that guess would split the path differently, so
//! formatting then parsing is lossless.
//!
//! Symbol paths chain type segments (`#Name`) and term segments (`.name`,
//! `.name()`, `.name(string,number)`). Inside a URI the fragment delimiter
//! doubles as the leading `#` of a type segment, so
//! `auth.ts#AuthService.login()` and `utils.ts#.helper()` are both canonical.

use std::fmt;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};

use crate::addressing::entity_id::ROOT_PACKAGE;
use crate::errors::{DevacError, DevacResult};

pub const SCHEME: &str = "devac://";

/// Directories that start the file portion of a URI path.
const SOURCE_ROOTS: &[&str] = &[
    "src", "lib", "test", "tests", "__tests__", "spec", "bin", "scripts", "internal", "cmd",
];

const QUERY_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'/')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?');

// ---------------------------------------------------------------------------
// Symbol paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "segment", rename_all = "camelCase")]
pub enum SymbolSegment {
    /// `#Name`: a class, interface, type or namespace.
    Type { name: String },
    /// `.name`, or `.name(...)` when callable; `params` disambiguates overloads.
    Term {
        name: String,
        callable: bool,
        params: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolPath {
    pub segments: Vec<SymbolSegment>,
}

impl SymbolPath {
    pub fn parse(raw: &str) -> DevacResult<Self> {
        let chars: Vec<char> = raw.chars().collect();
        match chars.first() {
            Some('#') | Some('.') => {}
            _ => {
                return Err(DevacError::UriParse(format!(
                    "symbol path must start with '#' or '.': {raw:?}"
                )))
            }
        }

        let mut segments = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            let marker = chars[i];
            i += 1;
            let start = i;
            while i < chars.len() && !matches!(chars[i], '#' | '.' | '(') {
                i += 1;
            }
            let name: String = chars[start..i].iter().collect();
            if name.trim().is_empty() {
                return Err(DevacError::UriParse(format!(
                    "empty symbol segment at offset {start} in {raw:?}"
                )));
            }

            if marker == '#' {
                if i < chars.len() && chars[i] == '(' {
                    return Err(DevacError::UriParse(format!(
                        "type segment #{name} cannot take a parameter list"
                    )));
                }
                segments.push(SymbolSegment::Type { name });
                continue;
            }

            let mut callable = false;
            let mut params = Vec::new();
            if i < chars.len() && chars[i] == '(' {
                let close = matching_paren(&chars, i).ok_or_else(|| {
                    DevacError::UriParse(format!("unbalanced parameter list in {raw:?}"))
                })?;
                let inner: String = chars[i + 1..close].iter().collect();
                params = split_params(&inner);
                callable = true;
                i = close + 1;
                if i < chars.len() && !matches!(chars[i], '#' | '.') {
                    return Err(DevacError::UriParse(format!(
                        "unexpected {:?} after parameter list in {raw:?}",
                        chars[i]
                    )));
                }
            }
            segments.push(SymbolSegment::Term {
                name,
                callable,
                params,
            });
        }
        Ok(Self { segments })
    }

    pub fn format(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                SymbolSegment::Type { name } => {
                    out.push('#');
                    out.push_str(name);
                }
                SymbolSegment::Term {
                    name,
                    callable,
                    params,
                } => {
                    out.push('.');
                    out.push_str(name);
                    if *callable {
                        out.push('(');
                        out.push_str(&params.join(","));
                        out.push(')');
                    }
                }
            }
        }
        out
    }

    /// Dotted scoped name (`AuthService.login`) as used for entity hashing.
    pub fn scoped_name(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                SymbolSegment::Type { name } | SymbolSegment::Term { name, .. } => name.as_str(),
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

fn matching_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, c) in chars.iter().enumerate().skip(open) {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on top-level commas; generic arguments like `Map<K,V>` stay whole.
fn split_params(inner: &str) -> Vec<String> {
    let mut params = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in inner.chars() {
        match c {
            '<' | '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            '>' | ')' | ']' | '}' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                params.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() || !params.is_empty() {
        params.push(current.trim().to_string());
    }
    params
}

// ---------------------------------------------------------------------------
// Query params
// ---------------------------------------------------------------------------

/// Ordered `{version, line, col, endLine, endCol}` set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    pub version: Option<String>,
    pub line: Option<u32>,
    pub col: Option<u32>,
    pub end_line: Option<u32>,
    pub end_col: Option<u32>,
}

impl QueryParams {
    pub fn is_empty(&self) -> bool {
        self.version.is_none()
            && self.line.is_none()
            && self.col.is_none()
            && self.end_line.is_none()
            && self.end_col.is_none()
    }

    fn parse(raw: &str) -> DevacResult<Self> {
        let mut params = QueryParams::default();
        for pair in raw.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                DevacError::UriParse(format!("query parameter without value: {pair:?}"))
            })?;
            let decoded = percent_decode_str(value)
                .decode_utf8()
                .map_err(|e| DevacError::UriParse(format!("bad percent-encoding in {key}: {e}")))?
                .into_owned();
            match key {
                "version" => params.version = Some(decoded),
                "line" => params.line = Some(parse_position(key, &decoded)?),
                "col" => params.col = Some(parse_position(key, &decoded)?),
                "endLine" => params.end_line = Some(parse_position(key, &decoded)?),
                "endCol" => params.end_col = Some(parse_position(key, &decoded)?),
                other => {
                    return Err(DevacError::UriParse(format!(
                        "unknown query parameter {other:?}"
                    )))
                }
            }
        }
        Ok(params)
    }

    fn format(&self) -> String {
        let mut pairs: Vec<String> = Vec::new();
        if let Some(v) = &self.version {
            pairs.push(format!("version={}", utf8_percent_encode(v, QUERY_VALUE)));
        }
        let numeric = [
            ("line", self.line),
            ("col", self.col),
            ("endLine", self.end_line),
            ("endCol", self.end_col),
        ];
        for (key, value) in numeric {
            if let Some(v) = value {
                pairs.push(format!("{key}={v}"));
            }
        }
        pairs.join("&")
    }
}

fn parse_position(key: &str, value: &str) -> DevacResult<u32> {
    value
        .parse::<u32>()
        .map_err(|_| DevacError::UriParse(format!("{key} must be a non-negative integer, got {value:?}")))
}

// ---------------------------------------------------------------------------
// Canonical URIs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalUri {
    pub repo: String,
    pub package_path: Option<String>,
    pub file_path: Option<String>,
    pub symbol: Option<SymbolPath>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedUri {
    pub uri: CanonicalUri,
    pub params: QueryParams,
}

impl CanonicalUri {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            package_path: None,
            file_path: None,
            symbol: None,
        }
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package_path = Some(package.into());
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file_path = Some(file.into());
        self
    }

    pub fn with_symbol(mut self, symbol: SymbolPath) -> Self {
        self.symbol = Some(symbol);
        self
    }
}

impl fmt::Display for CanonicalUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_canonical_uri(self, None))
    }
}

pub fn parse_canonical_uri(raw: &str) -> DevacResult<ParsedUri> {
    let rest = match raw.strip_prefix(SCHEME) {
        Some(rest) => rest,
        None => {
            let scheme = raw.split_once("://").map(|(s, _)| s).unwrap_or("");
            return Err(DevacError::UriParse(format!(
                "unknown scheme {scheme:?}; expected devac://"
            )));
        }
    };

    let (before_query, query) = match rest.split_once('?') {
        Some((b, q)) => (b, Some(q)),
        None => (rest, None),
    };
    let (path_part, fragment) = match before_query.split_once('#') {
        Some((p, f)) => (p, Some(f)),
        None => (before_query, None),
    };

    let mut segments = path_part.split('/').filter(|s| !s.is_empty());
    let repo = segments
        .next()
        .ok_or_else(|| DevacError::UriParse(format!("missing repository in {raw:?}")))?
        .to_string();
    let segments: Vec<&str> = segments.collect();
    let (package_path, file_path) = split_package_and_file(&segments);

    let symbol = match fragment {
        None => None,
        Some("") => {
            return Err(DevacError::UriParse(format!("empty symbol fragment in {raw:?}")))
        }
        Some(f) if f.starts_with('.') => Some(SymbolPath::parse(f)?),
        Some(f) => Some(SymbolPath::parse(&format!("#{f}"))?),
    };

    let params = match query {
        Some(q) => QueryParams::parse(q)?,
        None => QueryParams::default(),
    };

    Ok(ParsedUri {
        uri: CanonicalUri {
            repo,
            package_path,
            file_path,
            symbol,
        },
        params,
    })
}

fn join_segments(parts: &[&str]) -> Option<String> {
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn split_package_and_file(segments: &[&str]) -> (Option<String>, Option<String>) {
    if let Some(marker) = segments.iter().position(|s| *s == ROOT_PACKAGE) {
        let package = join_segments(&segments[..marker]).unwrap_or_else(|| ROOT_PACKAGE.to_string());
        return (Some(package), join_segments(&segments[marker + 1..]));
    }
    guess_package_and_file(segments)
}

/// Boundary guess for paths without an explicit `.` marker.
fn guess_package_and_file(segments: &[&str]) -> (Option<String>, Option<String>) {
    if segments.is_empty() {
        return (None, None);
    }
    let last = segments.len() - 1;
    let boundary = segments.iter().enumerate().position(|(idx, seg)| {
        SOURCE_ROOTS.contains(seg) || (idx == last && looks_like_file(seg))
    });
    match boundary {
        Some(0) => (Some(ROOT_PACKAGE.to_string()), join_segments(segments)),
        Some(idx) => (join_segments(&segments[..idx]), join_segments(&segments[idx..])),
        None => (join_segments(segments), None),
    }
}

/// Whether `package` + `file` written without a marker parse back unchanged.
fn boundary_is_implicit(package: &str, file: Option<&str>) -> bool {
    let mut segments: Vec<&str> = package.split('/').filter(|s| !s.is_empty()).collect();
    if let Some(file) = file {
        segments.extend(file.split('/').filter(|s| !s.is_empty()));
    }
    guess_package_and_file(&segments) == (Some(package.to_string()), file.map(str::to_string))
}

fn looks_like_file(segment: &str) -> bool {
    match segment.rfind('.') {
        Some(dot) => dot > 0 && dot + 1 < segment.len(),
        None => false,
    }
}

pub fn format_canonical_uri(uri: &CanonicalUri, params: Option<&QueryParams>) -> String {
    let mut out = String::from(SCHEME);
    out.push_str(&uri.repo);
    match (&uri.package_path, &uri.file_path) {
        (Some(pkg), file) if pkg.as_str() == ROOT_PACKAGE => {
            out.push('/');
            out.push_str(ROOT_PACKAGE);
            if let Some(file) = file {
                out.push('/');
                out.push_str(file);
            }
        }
        (Some(pkg), file) => {
            out.push('/');
            out.push_str(pkg);
            if !boundary_is_implicit(pkg, file.as_deref()) {
                out.push('/');
                out.push_str(ROOT_PACKAGE);
            }
            if let Some(file) = file {
                out.push('/');
                out.push_str(file);
            }
        }
        (None, Some(file)) => {
            out.push('/');
            out.push_str(ROOT_PACKAGE);
            out.push('/');
            out.push_str(file);
        }
        (None, None) => {}
    }
    if let Some(symbol) = &uri.symbol {
        let path = symbol.format();
        if path.starts_with('.') {
            out.push('#');
        }
        out.push_str(&path);
    }
    if let Some(params) = params {
        if !params.is_empty() {
            out.push('?');
            out.push_str(&params.format());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// References and specificity
// ---------------------------------------------------------------------------

/// Any string a tool may hand us as a symbol reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Canonical(ParsedUri),
    Symbol(SymbolPath),
    Unrecognized(String),
}

impl Reference {
    /// Full canonical URI (2) > symbol-only path (1) > unrecognized (0).
    pub fn specificity(&self) -> u8 {
        match self {
            Reference::Canonical(_) => 2,
            Reference::Symbol(_) => 1,
            Reference::Unrecognized(_) => 0,
        }
    }
}

pub fn parse_reference(raw: &str) -> Reference {
    let trimmed = raw.trim();
    if trimmed.starts_with(SCHEME) {
        if let Ok(parsed) = parse_canonical_uri(trimmed) {
            return Reference::Canonical(parsed);
        }
    } else if let Ok(path) = SymbolPath::parse(trimmed) {
        return Reference::Symbol(path);
    }
    Reference::Unrecognized(trimmed.to_string())
}

pub fn specificity(raw: &str) -> u8 {
    parse_reference(raw).specificity()
}

/// File in which a relative reference is interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefContext {
    pub repo: String,
    pub package: String,
    pub file: String,
}

/// Resolve a same-file symbol reference (`#Foo.bar()`, `.helper()`) against
/// `ctx`. References that name another file through relative path syntax are
/// rejected; cross-file references must be full canonical URIs.
pub fn resolve_relative_ref(reference: &str, ctx: &RefContext) -> DevacResult<CanonicalUri> {
    let trimmed = reference.trim();
    if trimmed.starts_with(SCHEME) {
        return Ok(parse_canonical_uri(trimmed)?.uri);
    }
    if trimmed.starts_with("./") || trimmed.starts_with("../") || trimmed.contains('/') {
        return Err(DevacError::UriParse(format!(
            "cross-file reference {trimmed:?} must use a full canonical URI"
        )));
    }
    let symbol = SymbolPath::parse(trimmed)?;
    Ok(CanonicalUri {
        repo: ctx.repo.clone(),
        package_path: Some(ctx.package.clone()),
        file_path: Some(ctx.file.clone()),
        symbol: Some(symbol),
    })
}
