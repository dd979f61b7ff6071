//! Semantic resolution: map relative imports to the entity IDs they name.

pub mod export_index;
pub mod extractor;
pub mod filesystem;
pub mod semantic;

pub use export_index::{ExportIndex, ExportedSymbol};
pub use extractor::{default_extractors, ExportExtractor, PythonExtractor, TypeScriptExtractor};
pub use semantic::{PackageResolution, ResolutionFailure, ResolverContext, SemanticResolver};
