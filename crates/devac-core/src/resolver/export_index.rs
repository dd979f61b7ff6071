//! Package-wide export index.
//!
//! An `ExportIndex` is a value: updates clone it and return the new index,
//! leaving readers of the old one unaffected. Declared exports and raw
//! re-export specs are stored per file; the derived `by_file`/`by_name`
//! views are rebuilt after every change so barrel chains always reflect the
//! current declared state.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::addressing::generate_entity_id;
use crate::models::NodeKind;
use crate::resolver::extractor::{ReExport, ReExportKind};
use crate::resolver::filesystem::{join_posix, module_name, normalize_posix_path, parent_dir};

/// Entity ID of the module node for a package file.
pub fn module_entity_id(repo: &str, package_path: &str, rel_path: &str) -> String {
    generate_entity_id(
        repo,
        package_path,
        NodeKind::Module.as_str(),
        rel_path,
        &module_name(rel_path),
    )
}

/// One name a file makes importable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedSymbol {
    pub name: String,
    pub kind: NodeKind,
    /// File declaring the symbol.
    pub file_path: String,
    pub entity_id: String,
    pub is_default: bool,
    /// Barrel or re-exporting file this entry was copied into, if any.
    pub exported_via: Option<String>,
    pub line: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportIndex {
    files: IndexSet<String>,
    declared: IndexMap<String, Vec<ExportedSymbol>>,
    reexports: IndexMap<String, Vec<ReExport>>,
    by_file: IndexMap<String, Vec<ExportedSymbol>>,
    by_name: IndexMap<String, Vec<ExportedSymbol>>,
    extensions: Vec<String>,
    repo: String,
    package_path: String,
}

impl ExportIndex {
    pub fn new(extensions: Vec<String>) -> Self {
        Self {
            extensions,
            ..Self::default()
        }
    }

    /// An index whose namespace re-exports point at module entities of
    /// `package_path` in `repo`.
    pub fn for_package(repo: &str, package_path: &str, extensions: Vec<String>) -> Self {
        Self {
            extensions,
            repo: repo.to_string(),
            package_path: package_path.to_string(),
            ..Self::default()
        }
    }

    // -- read side ----------------------------------------------------------

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(String::as_str)
    }

    pub fn contains_file(&self, rel_path: &str) -> bool {
        self.files.contains(rel_path)
    }

    /// Every export visible from `file`, re-exports included.
    pub fn exports_for_file(&self, file: &str) -> &[ExportedSymbol] {
        self.by_file.get(file).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Declared exports named `name` across the package.
    pub fn lookup(&self, name: &str) -> &[ExportedSymbol] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn has_file_export(&self, file: &str, name: &str) -> bool {
        self.exports_for_file(file).iter().any(|s| s.name == name)
    }

    pub fn default_export(&self, file: &str) -> Option<&ExportedSymbol> {
        self.exports_for_file(file).iter().find(|s| s.is_default)
    }

    pub fn symbol_count(&self) -> usize {
        self.by_name.values().map(Vec::len).sum()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    // -- module resolution --------------------------------------------------

    /// Map a relative specifier used in `from_file` to an indexed file.
    /// `Err` when the specifier climbs above the package root.
    pub fn resolve_module(&self, from_file: &str, specifier: &str) -> Result<Option<String>, String> {
        if from_file.ends_with(".py") {
            return self.resolve_python_module(from_file, specifier);
        }
        if !(specifier.starts_with("./") || specifier.starts_with("../") || specifier == "." || specifier == "..") {
            return Ok(None);
        }
        let joined = join_posix(parent_dir(from_file), specifier);
        let base = normalize_posix_path(&joined)
            .ok_or_else(|| format!("{specifier:?} from {from_file} escapes the package root"))?;

        let mut candidates = vec![base.clone()];
        // `./x.js` written against a `x.ts` source
        for js in [".js", ".jsx", ".mjs", ".cjs"] {
            if let Some(stem) = base.strip_suffix(js) {
                for ext in &self.extensions {
                    candidates.push(format!("{stem}{ext}"));
                }
            }
        }
        for ext in &self.extensions {
            candidates.push(format!("{base}{ext}"));
        }
        for ext in &self.extensions {
            candidates.push(join_posix(&base, &format!("index{ext}")));
        }
        Ok(candidates.into_iter().find(|c| self.files.contains(c)))
    }

    fn resolve_python_module(&self, from_file: &str, specifier: &str) -> Result<Option<String>, String> {
        if !specifier.starts_with('.') {
            return Ok(None);
        }
        let levels = specifier.chars().take_while(|&c| c == '.').count();
        let suffix = &specifier[levels..];
        let mut dir = parent_dir(from_file).to_string();
        for _ in 0..levels.saturating_sub(1) {
            if dir.is_empty() {
                return Err(format!("{specifier:?} from {from_file} escapes the package root"));
            }
            dir = parent_dir(&dir).to_string();
        }
        let base = if suffix.is_empty() {
            dir
        } else {
            join_posix(&dir, &suffix.replace('.', "/"))
        };
        let candidates = [format!("{base}.py"), join_posix(&base, "__init__.py")];
        Ok(candidates.into_iter().find(|c| self.files.contains(c)))
    }

    // -- write side (crate-internal; callers clone first) -------------------

    pub(crate) fn add_file(&mut self, rel_path: &str) {
        self.files.insert(rel_path.to_string());
    }

    pub(crate) fn set_file_exports(
        &mut self,
        rel_path: &str,
        exports: Vec<ExportedSymbol>,
        reexports: Vec<ReExport>,
    ) {
        self.files.insert(rel_path.to_string());
        if exports.is_empty() {
            self.declared.shift_remove(rel_path);
        } else {
            self.declared.insert(rel_path.to_string(), exports);
        }
        if reexports.is_empty() {
            self.reexports.shift_remove(rel_path);
        } else {
            self.reexports.insert(rel_path.to_string(), reexports);
        }
    }

    /// Strip everything attributed to `rel_path`.
    pub(crate) fn remove_file(&mut self, rel_path: &str) {
        self.files.shift_remove(rel_path);
        self.declared.shift_remove(rel_path);
        self.reexports.shift_remove(rel_path);
    }

    /// Recompute derived views, expanding re-exports until nothing changes.
    /// Each pass can only add entries, and no pass adds a name twice to the
    /// same file, so cycles settle; passes are also capped at the number of
    /// re-export specs plus one.
    pub(crate) fn rebuild(&mut self) {
        let mut by_file: IndexMap<String, Vec<ExportedSymbol>> = self.declared.clone();

        let mut by_name: IndexMap<String, Vec<ExportedSymbol>> = IndexMap::new();
        for symbols in self.declared.values() {
            for s in symbols {
                by_name.entry(s.name.clone()).or_default().push(s.clone());
            }
        }

        let mut edges: Vec<(String, String, &ReExport)> = Vec::new();
        for (file, specs) in &self.reexports {
            for spec in specs {
                match self.resolve_module(file, &spec.specifier) {
                    Ok(Some(target)) => edges.push((file.clone(), target, spec)),
                    Ok(None) => {}
                    Err(e) => debug!(file = %file, "skipping re-export: {}", e),
                }
            }
        }

        let max_passes = edges.len() + 1;
        let mut passes = 0;
        loop {
            passes += 1;
            let mut changed = false;
            for (barrel, target, spec) in &edges {
                if barrel == target {
                    continue;
                }
                let source: Vec<ExportedSymbol> = by_file.get(target).cloned().unwrap_or_default();
                let additions: Vec<ExportedSymbol> = match &spec.kind {
                    ReExportKind::All => source
                        .into_iter()
                        .filter(|s| !s.is_default)
                        .map(|s| via(s, barrel, None))
                        .collect(),
                    ReExportKind::Named(names) => names
                        .iter()
                        .filter_map(|n| {
                            let found = if n.imported == "default" {
                                source.iter().find(|s| s.is_default)
                            } else {
                                source.iter().find(|s| s.name == n.imported)
                            }?;
                            Some(via(found.clone(), barrel, Some(&n.exported)))
                        })
                        .collect(),
                    ReExportKind::Namespace(ns) => vec![ExportedSymbol {
                        name: ns.clone(),
                        kind: NodeKind::Module,
                        file_path: target.clone(),
                        entity_id: module_entity_id(&self.repo, &self.package_path, target),
                        is_default: false,
                        exported_via: Some(barrel.clone()),
                        line: spec.line,
                    }],
                };
                let entry = by_file.entry(barrel.clone()).or_default();
                for add in additions {
                    if !entry.iter().any(|s| s.name == add.name) {
                        entry.push(add);
                        changed = true;
                    }
                }
            }
            if !changed || passes >= max_passes {
                break;
            }
        }
        debug!(
            files = self.files.len(),
            reexports = edges.len(),
            passes,
            "rebuilt export index"
        );

        self.by_file = by_file;
        self.by_name = by_name;
    }
}

fn via(mut symbol: ExportedSymbol, barrel: &str, alias: Option<&str>) -> ExportedSymbol {
    if let Some(alias) = alias {
        symbol.is_default = alias == "default";
        symbol.name = alias.to_string();
    }
    symbol.exported_via = Some(barrel.to_string());
    symbol
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::extractor::ReExportName;

    fn sym(name: &str, file: &str) -> ExportedSymbol {
        ExportedSymbol {
            name: name.into(),
            kind: NodeKind::Function,
            file_path: file.into(),
            entity_id: format!("app:pkg:function:{name}"),
            is_default: false,
            exported_via: None,
            line: 1,
        }
    }

    fn star(spec: &str) -> ReExport {
        ReExport {
            specifier: spec.into(),
            kind: ReExportKind::All,
            line: 1,
        }
    }

    fn index() -> ExportIndex {
        ExportIndex::new(vec![".ts".into(), ".tsx".into(), ".js".into()])
    }

    #[test]
    fn nested_barrels_resolve_regardless_of_order() {
        let mut idx = index();
        // Outer barrel is inserted first so a single pass would miss `deep`.
        idx.set_file_exports("index.ts", vec![], vec![star("./mid")]);
        idx.set_file_exports("mid.ts", vec![], vec![star("./leaf")]);
        idx.set_file_exports("leaf.ts", vec![sym("deep", "leaf.ts")], vec![]);
        idx.rebuild();

        let top = idx.exports_for_file("index.ts");
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].file_path, "leaf.ts");
        assert_eq!(top[0].exported_via.as_deref(), Some("index.ts"));
    }

    #[test]
    fn barrel_cycles_terminate() {
        let mut idx = index();
        idx.set_file_exports("a.ts", vec![sym("fromA", "a.ts")], vec![star("./b")]);
        idx.set_file_exports("b.ts", vec![sym("fromB", "b.ts")], vec![star("./a")]);
        idx.rebuild();
        assert!(idx.has_file_export("a.ts", "fromB"));
        assert!(idx.has_file_export("b.ts", "fromA"));
        assert_eq!(idx.exports_for_file("a.ts").len(), 2);
    }

    #[test]
    fn named_reexports_rename() {
        let mut idx = index();
        idx.set_file_exports("impl.ts", vec![sym("inner", "impl.ts")], vec![]);
        idx.set_file_exports(
            "api.ts",
            vec![],
            vec![ReExport {
                specifier: "./impl".into(),
                kind: ReExportKind::Named(vec![ReExportName {
                    imported: "inner".into(),
                    exported: "outer".into(),
                }]),
                line: 1,
            }],
        );
        idx.rebuild();
        assert!(idx.has_file_export("api.ts", "outer"));
        assert!(!idx.has_file_export("api.ts", "inner"));
        assert!(idx.has_export("inner"));
    }

    #[test]
    fn module_resolution_tries_extensions_and_index() {
        let mut idx = index();
        for f in ["src/utils.ts", "src/components/index.tsx", "src/legacy.ts"] {
            idx.add_file(f);
        }
        assert_eq!(idx.resolve_module("src/a.ts", "./utils").unwrap().as_deref(), Some("src/utils.ts"));
        assert_eq!(
            idx.resolve_module("src/a.ts", "./components").unwrap().as_deref(),
            Some("src/components/index.tsx")
        );
        assert_eq!(idx.resolve_module("src/a.ts", "./legacy.js").unwrap().as_deref(), Some("src/legacy.ts"));
        assert_eq!(idx.resolve_module("src/a.ts", "react").unwrap(), None);
        assert!(idx.resolve_module("src/a.ts", "../../outside").is_err());
    }

    #[test]
    fn python_relative_modules() {
        let mut idx = index();
        for f in ["pkg/models.py", "pkg/sub/__init__.py", "pkg/sub/views.py"] {
            idx.add_file(f);
        }
        assert_eq!(
            idx.resolve_module("pkg/sub/views.py", "..models").unwrap().as_deref(),
            Some("pkg/models.py")
        );
        assert_eq!(
            idx.resolve_module("pkg/views.py", ".sub").unwrap().as_deref(),
            Some("pkg/sub/__init__.py")
        );
        assert_eq!(idx.resolve_module("pkg/views.py", "os").unwrap(), None);
    }

    #[test]
    fn namespace_reexport_points_at_target_module() {
        let mut idx = ExportIndex::for_package("app", "packages/core", vec![".ts".into()]);
        idx.set_file_exports("src/math.ts", vec![sym("add", "src/math.ts")], vec![]);
        idx.set_file_exports(
            "src/index.ts",
            vec![],
            vec![ReExport {
                specifier: "./math".into(),
                kind: ReExportKind::Namespace("math".into()),
                line: 3,
            }],
        );
        idx.set_file_exports("src/root.ts", vec![], vec![star("./index")]);
        idx.rebuild();

        let ns = idx
            .exports_for_file("src/index.ts")
            .iter()
            .find(|s| s.name == "math")
            .expect("namespace export");
        assert_eq!(ns.kind, NodeKind::Module);
        assert_eq!(ns.file_path, "src/math.ts");
        assert_eq!(ns.entity_id, module_entity_id("app", "packages/core", "src/math.ts"));
        assert_eq!(ns.exported_via.as_deref(), Some("src/index.ts"));
        assert_eq!(ns.line, 3);
        // Members stay behind the namespace.
        assert!(!idx.has_file_export("src/index.ts", "add"));
        // Outer barrels pass the namespace along.
        assert!(idx.has_file_export("src/root.ts", "math"));
    }
}
