//! Entity IDs and canonical URIs.

pub mod entity_id;
pub mod uri;

pub use entity_id::{
    entity_hash, format_entity_id, generate_entity_id, normalize_package_path, parse_entity_id,
    EntityId, ROOT_PACKAGE,
};
pub use uri::{
    format_canonical_uri, parse_canonical_uri, parse_reference, resolve_relative_ref, specificity,
    CanonicalUri, ParsedUri, QueryParams, RefContext, Reference, SymbolPath, SymbolSegment,
};
