//! Semantic import resolution over a package export index.
//!
//! Resolution is a read of already-built index state: it never re-parses or
//! recurses into imported files, so circular import graphs cannot hang it.

use std::path::PathBuf;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::addressing::generate_entity_id;
use crate::config::ResolverConfig;
use crate::errors::{DevacError, DevacResult};
use crate::models::{ExternalRef, ResolvedRef};
use crate::resolver::export_index::{module_entity_id, ExportIndex, ExportedSymbol};
use crate::resolver::extractor::{default_extractors, ExportExtractor, FileExports};
use crate::resolver::filesystem::{absolute, detect_language, is_excluded_file, iter_package_files, module_name};
use crate::store::{SeedReader, SeedWriter};


/// Inputs for the entity IDs the resolver produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverContext {
    pub repo: String,
    pub package_path: String,
    pub package_root: PathBuf,
}

/// A reference whose resolution failed, as opposed to one with no target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionFailure {
    pub reference: ExternalRef,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageResolution {
    pub total: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub errors: Vec<ResolutionFailure>,
    pub resolved_refs: Vec<ResolvedRef>,
    /// Files that could not be read while building the index.
    pub warnings: Vec<String>,
    pub time_ms: u64,
}

pub struct SemanticResolver {
    ctx: ResolverContext,
    config: ResolverConfig,
    extractors: Vec<Box<dyn ExportExtractor>>,
}

impl SemanticResolver {
    pub fn new(ctx: ResolverContext, config: ResolverConfig) -> Self {
        Self {
            ctx,
            config,
            extractors: default_extractors(),
        }
    }

    /// Register an additional extractor. Later extractors take precedence
    /// for files more than one of them handles.
    pub fn with_extractor(mut self, extractor: Box<dyn ExportExtractor>) -> Self {
        self.extractors.insert(0, extractor);
        self
    }

    pub fn context(&self) -> &ResolverContext {
        &self.ctx
    }

    fn extractor_for(&self, rel_path: &str) -> Option<&dyn ExportExtractor> {
        self.extractors
            .iter()
            .find(|e| e.handles(rel_path))
            .map(|e| e.as_ref())
    }

    fn extract_file(&self, rel_path: &str) -> DevacResult<Option<FileExports>> {
        let Some(extractor) = self.extractor_for(rel_path) else {
            return Ok(None);
        };
        let source = std::fs::read_to_string(absolute(&self.ctx.package_root, rel_path))?;
        Ok(Some(extractor.extract(rel_path, &source)))
    }

    fn to_symbols(&self, rel_path: &str, exports: &FileExports) -> Vec<ExportedSymbol> {
        exports
            .exports
            .iter()
            .map(|e| ExportedSymbol {
                name: e.name.clone(),
                kind: e.kind,
                file_path: rel_path.to_string(),
                entity_id: generate_entity_id(
                    &self.ctx.repo,
                    &self.ctx.package_path,
                    e.kind.as_str(),
                    rel_path,
                    &e.local_name,
                ),
                is_default: e.is_default,
                exported_via: None,
                line: e.line,
            })
            .collect()
    }

    /// Scan the package and index every exported symbol. Unreadable files
    /// are logged and skipped.
    pub fn build_export_index(&self) -> ExportIndex {
        self.build_export_index_with_warnings().0
    }

    fn build_export_index_with_warnings(&self) -> (ExportIndex, Vec<String>) {
        let start = Instant::now();
        let files = iter_package_files(&self.ctx.package_root, &self.config);

        let extracted: Vec<(String, DevacResult<Option<FileExports>>)> = files
            .par_iter()
            .map(|rel| (rel.clone(), self.extract_file(rel)))
            .collect();

        let mut index = ExportIndex::for_package(
            &self.ctx.repo,
            &self.ctx.package_path,
            self.config.extensions.clone(),
        );
        let mut warnings = Vec::new();
        for (rel, outcome) in extracted {
            match outcome {
                Ok(Some(exports)) => {
                    let symbols = self.to_symbols(&rel, &exports);
                    index.set_file_exports(&rel, symbols, exports.reexports);
                }
                Ok(None) => index.add_file(&rel),
                Err(e) => {
                    warn!(
                        "Failed to extract exports for package={} file={}: {}",
                        self.ctx.package_path, rel, e
                    );
                    warnings.push(format!("{rel}: {e}"));
                    index.add_file(&rel);
                }
            }
        }
        index.rebuild();
        info!(
            package = %self.ctx.package_path,
            files = index.file_count(),
            symbols = index.symbol_count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "built export index"
        );
        (index, warnings)
    }

    /// Resolve one import. `Ok(None)` for external packages and for
    /// relative imports with no matching export.
    pub fn resolve_ref(&self, reference: &ExternalRef, index: &ExportIndex) -> DevacResult<Option<ResolvedRef>> {
        if !reference.is_relative() {
            return Ok(None);
        }
        let from = reference.source_file_path.as_str();
        let specifier = reference.module_specifier.as_str();
        let symbol = reference.imported_symbol.as_str();

        let target_file = index
            .resolve_module(from, specifier)
            .map_err(DevacError::Resolution)?;

        let Some(target_file) = target_file else {
            // `from . import sub` names a submodule rather than an export.
            if from.ends_with(".py") && !symbol.is_empty() && symbol != "*" {
                if let Some(module_file) = index
                    .resolve_module(from, &python_submodule(specifier, symbol))
                    .map_err(DevacError::Resolution)?
                {
                    return Ok(Some(self.module_ref(reference, &module_file, symbol)));
                }
            }
            return Ok(None);
        };

        if symbol.is_empty() || symbol == "*" {
            let name = module_name(&target_file);
            return Ok(Some(self.module_ref(reference, &target_file, &name)));
        }

        let found = if symbol == "default" {
            index.default_export(&target_file)
        } else {
            index
                .exports_for_file(&target_file)
                .iter()
                .find(|s| s.name == symbol)
        };
        if let Some(hit) = found {
            return Ok(Some(resolved(reference, hit, symbol)));
        }

        if from.ends_with(".py") {
            if let Some(module_file) = index
                    .resolve_module(from, &python_submodule(specifier, symbol))
                    .map_err(DevacError::Resolution)?
                {
                return Ok(Some(self.module_ref(reference, &module_file, symbol)));
            }
        }

        // Re-export chains the index could not attribute to the file.
        if symbol != "default" {
            if let Some(hit) = index.lookup(symbol).first() {
                debug!(
                    file = from,
                    specifier,
                    symbol,
                    target = %hit.file_path,
                    "resolved via global name lookup"
                );
                return Ok(Some(resolved(reference, hit, symbol)));
            }
        }
        Ok(None)
    }

    fn module_ref(&self, reference: &ExternalRef, target_file: &str, name: &str) -> ResolvedRef {
        ResolvedRef {
            source_entity_id: reference.source_entity_id.clone(),
            source_file_path: reference.source_file_path.clone(),
            module_specifier: reference.module_specifier.clone(),
            imported_symbol: reference.imported_symbol.clone(),
            target_entity_id: module_entity_id(&self.ctx.repo, &self.ctx.package_path, target_file),
            target_file: target_file.to_string(),
            target_name: name.to_string(),
        }
    }

    /// Resolve a batch against an existing index.
    pub fn resolve_refs(&self, refs: &[ExternalRef], index: &ExportIndex) -> PackageResolution {
        let start = Instant::now();
        let mut out = PackageResolution {
            total: refs.len(),
            ..PackageResolution::default()
        };
        for reference in refs {
            match self.resolve_ref(reference, index) {
                Ok(Some(hit)) => {
                    out.resolved += 1;
                    out.resolved_refs.push(hit);
                }
                Ok(None) => out.unresolved += 1,
                Err(e) => {
                    out.unresolved += 1;
                    out.errors.push(ResolutionFailure {
                        reference: reference.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        out.time_ms = start.elapsed().as_millis() as u64;
        out
    }

    /// Build the index and resolve every reference of the package.
    pub fn resolve_package(&self, refs: &[ExternalRef]) -> PackageResolution {
        let start = Instant::now();
        let (index, warnings) = self.build_export_index_with_warnings();
        let mut out = self.resolve_refs(refs, &index);
        out.warnings = warnings;
        out.time_ms = start.elapsed().as_millis() as u64;
        info!(
            package = %self.ctx.package_path,
            total = out.total,
            resolved = out.resolved,
            unresolved = out.unresolved,
            errors = out.errors.len(),
            "resolved package imports"
        );
        out
    }

    /// Re-index one file into a copy of `index`. The file's previous exports
    /// are dropped first; a deleted or no longer indexable file stays out.
    pub fn update_for_file_change(&self, rel_path: &str, index: &ExportIndex) -> DevacResult<ExportIndex> {
        let mut next = index.clone();
        next.remove_file(rel_path);

        let path = absolute(&self.ctx.package_root, rel_path);
        let indexable = detect_language(rel_path).is_some() && !is_excluded_file(rel_path);
        if path.is_file() && indexable {
            match self.extract_file(rel_path)? {
                Some(exports) => {
                    let symbols = self.to_symbols(rel_path, &exports);
                    next.set_file_exports(rel_path, symbols, exports.reexports);
                }
                None => next.add_file(rel_path),
            }
        }
        next.rebuild();
        debug!(
            package = %self.ctx.package_path,
            file = rel_path,
            exports = next.exports_for_file(rel_path).len(),
            "updated export index for file change"
        );
        Ok(next)
    }

    /// Resolve the unresolved refs stored for `branch` and write the results
    /// back through `writer`.
    pub fn resolve_and_persist(
        &self,
        reader: &SeedReader,
        writer: &SeedWriter,
        branch: &str,
    ) -> DevacResult<PackageResolution> {
        let refs: Vec<ExternalRef> = reader
            .read_external_refs_merged(branch)?
            .into_iter()
            .filter(|r| !r.is_resolved)
            .collect();
        let resolution = self.resolve_package(&refs);
        let written = writer.write_resolved_refs(branch, &resolution.resolved_refs);
        if !written.success {
            return Err(DevacError::Storage(
                written.error.unwrap_or_else(|| "resolved ref write failed".to_string()),
            ));
        }
        Ok(resolution)
    }
}

fn resolved(reference: &ExternalRef, hit: &ExportedSymbol, symbol: &str) -> ResolvedRef {
    ResolvedRef {
        source_entity_id: reference.source_entity_id.clone(),
        source_file_path: reference.source_file_path.clone(),
        module_specifier: reference.module_specifier.clone(),
        imported_symbol: symbol.to_string(),
        target_entity_id: hit.entity_id.clone(),
        target_file: hit.file_path.clone(),
        target_name: hit.name.clone(),
    }
}

fn python_submodule(specifier: &str, symbol: &str) -> String {
    if specifier.chars().all(|c| c == '.') {
        format!("{specifier}{symbol}")
    } else {
        format!("{specifier}.{symbol}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &std::path::Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn import(file: &str, spec: &str, symbol: &str) -> ExternalRef {
        serde_json::from_value(serde_json::json!({
            "source_entity_id": "app:core:module:00000000",
            "source_file_path": file,
            "module_specifier": spec,
            "imported_symbol": symbol,
        }))
        .unwrap()
    }

    fn resolver(root: &std::path::Path) -> SemanticResolver {
        SemanticResolver::new(
            ResolverContext {
                repo: "app".into(),
                package_path: "packages/core".into(),
                package_root: root.to_path_buf(),
            },
            ResolverConfig::default(),
        )
    }

    #[test]
    fn resolves_named_import_to_function_entity() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/utils.ts", "export function helper() {}\n");
        write(dir.path(), "src/main.ts", "import { helper } from './utils';\n");
        let r = resolver(dir.path());
        let index = r.build_export_index();

        let hit = r
            .resolve_ref(&import("src/main.ts", "./utils", "helper"), &index)
            .unwrap()
            .unwrap();
        let re = regex::Regex::new(r"^app:.+:function:[a-f0-9]{8}$").unwrap();
        assert!(re.is_match(&hit.target_entity_id), "{}", hit.target_entity_id);
        assert_eq!(hit.target_file, "src/utils.ts");

        assert!(r
            .resolve_ref(&import("src/main.ts", "react", "useState"), &index)
            .unwrap()
            .is_none());
    }

    #[test]
    fn escaping_specifier_is_an_error_not_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.ts", "export const x = 1;\n");
        let r = resolver(dir.path());
        let index = r.build_export_index();
        let out = r.resolve_refs(
            &[import("a.ts", "../../elsewhere", "x"), import("a.ts", "./missing", "x")],
            &index,
        );
        assert_eq!(out.total, 2);
        assert_eq!(out.resolved, 0);
        assert_eq!(out.unresolved, 2);
        assert_eq!(out.errors.len(), 1);
    }

    #[test]
    fn default_and_namespace_imports() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/widget.tsx", "export default function Widget() {}\n");
        let r = resolver(dir.path());
        let index = r.build_export_index();

        let def = r
            .resolve_ref(&import("src/app.ts", "./widget", "default"), &index)
            .unwrap()
            .unwrap();
        assert_eq!(def.target_file, "src/widget.tsx");

        let ns = r
            .resolve_ref(&import("src/app.ts", "./widget", "*"), &index)
            .unwrap()
            .unwrap();
        assert!(ns.target_entity_id.contains(":module:"));
        assert_eq!(ns.target_name, "widget");
    }

    #[test]
    fn file_change_swaps_export_names() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.ts", "export function oldName() {}\n");
        let r = resolver(dir.path());
        let index = r.build_export_index();
        assert!(index.has_export("oldName"));

        write(dir.path(), "src/a.ts", "export class NewName {}\n");
        let next = r.update_for_file_change("src/a.ts", &index).unwrap();
        assert!(!next.has_export("oldName"));
        assert!(next.has_export("NewName"));
        // The original index is untouched.
        assert!(index.has_export("oldName"));

        fs::remove_file(dir.path().join("src/a.ts")).unwrap();
        let gone = r.update_for_file_change("src/a.ts", &next).unwrap();
        assert!(!gone.has_export("NewName"));
        assert!(!gone.contains_file("src/a.ts"));
    }

    #[test]
    fn python_submodule_import() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "pkg/__init__.py", "");
        write(dir.path(), "pkg/models.py", "class User:\n    pass\n");
        write(dir.path(), "pkg/views.py", "from . import models\n");
        let r = resolver(dir.path());
        let index = r.build_export_index();

        let hit = r
            .resolve_ref(&import("pkg/views.py", ".", "models"), &index)
            .unwrap()
            .unwrap();
        assert_eq!(hit.target_file, "pkg/models.py");

        let user = r
            .resolve_ref(&import("pkg/views.py", ".models", "User"), &index)
            .unwrap()
            .unwrap();
        assert!(user.target_entity_id.contains(":class:"));
    }
}
