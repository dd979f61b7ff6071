//! Content-derived entity identifiers: `{repo}:{packagePath}:{kind}:{hash8}`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::errors::{DevacError, DevacResult};

/// Package path sentinel for the repository root.
pub const ROOT_PACKAGE: &str = ".";

const HASH_LEN: usize = 8;

/// Parsed form of an entity ID string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub repo: String,
    pub package: String,
    pub kind: String,
    pub hash: String,
}

fn normalize(part: &str) -> String {
    part.trim().nfc().collect()
}

/// First eight hex chars of SHA-256 over `filePath \0 scopedName \0 kind`,
/// each part NFC-normalized and trimmed.
pub fn entity_hash(file_path: &str, scoped_name: &str, kind: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(file_path).as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize(scoped_name).as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize(kind).as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..HASH_LEN].to_string()
}

/// Deterministic entity ID for a symbol. Identical inputs always produce the
/// same ID; the hash depends on content, never on position.
pub fn generate_entity_id(
    repo: &str,
    package_path: &str,
    kind: &str,
    file_path: &str,
    scoped_name: &str,
) -> String {
    let package = normalize_package_path(package_path);
    format!(
        "{}:{}:{}:{}",
        repo.trim(),
        package,
        kind.trim(),
        entity_hash(file_path, scoped_name, kind)
    )
}

/// Empty and `./`-style package paths collapse to the root sentinel.
pub fn normalize_package_path(package_path: &str) -> String {
    let trimmed = package_path.trim().trim_start_matches("./").trim_end_matches('/');
    if trimmed.is_empty() {
        ROOT_PACKAGE.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn parse_entity_id(raw: &str) -> DevacResult<EntityId> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 4 {
        return Err(DevacError::UriParse(format!(
            "entity ID must have exactly 4 colon-delimited fields, got {}: {raw:?}",
            parts.len()
        )));
    }
    if let Some(idx) = parts.iter().position(|p| p.is_empty()) {
        return Err(DevacError::UriParse(format!(
            "entity ID field {idx} is empty: {raw:?}"
        )));
    }
    Ok(EntityId {
        repo: parts[0].to_string(),
        package: parts[1].to_string(),
        kind: parts[2].to_string(),
        hash: parts[3].to_string(),
    })
}

pub fn format_entity_id(id: &EntityId) -> String {
    format!("{}:{}:{}:{}", id.repo, id.package, id.kind, id.hash)
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_entity_id(self))
    }
}

impl FromStr for EntityId {
    type Err = DevacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_entity_id(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_deterministic() {
        let a = generate_entity_id("app", "packages/core", "function", "src/a.ts", "helper");
        let b = generate_entity_id("app", "packages/core", "function", "src/a.ts", "helper");
        assert_eq!(a, b);
        assert!(a.starts_with("app:packages/core:function:"));
        assert_eq!(a.rsplit(':').next().unwrap().len(), 8);
    }

    #[test]
    fn distinct_symbols_get_distinct_ids() {
        let a = generate_entity_id("app", "pkg", "function", "src/a.ts", "helper");
        let b = generate_entity_id("app", "pkg", "function", "src/b.ts", "helper");
        let c = generate_entity_id("app", "pkg", "method", "src/a.ts", "helper");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn hash_ignores_whitespace_and_normalization_form() {
        // "é" precomposed vs combining sequence
        let nfc = entity_hash("src/caf\u{e9}.ts", "x", "function");
        let nfd = entity_hash(" src/cafe\u{301}.ts ", "x", "function");
        assert_eq!(nfc, nfd);
    }

    #[test]
    fn empty_package_uses_root_sentinel() {
        let id = generate_entity_id("app", "", "class", "index.ts", "App");
        assert!(id.starts_with("app:.:class:"));
    }

    #[test]
    fn parse_and_format_round_trip() {
        let parsed = parse_entity_id("app:packages/core:class:a1b2c3d4").unwrap();
        assert_eq!(parsed.repo, "app");
        assert_eq!(parsed.package, "packages/core");
        assert_eq!(parsed.kind, "class");
        assert_eq!(parsed.hash, "a1b2c3d4");
        assert_eq!(format_entity_id(&parsed), "app:packages/core:class:a1b2c3d4");
    }

    #[test]
    fn malformed_ids_fail() {
        assert!(parse_entity_id("app:core:class").is_err());
        assert!(parse_entity_id("a:b:c:d:e").is_err());
        assert!(matches!(
            parse_entity_id("app::class:a1b2c3d4"),
            Err(DevacError::UriParse(_))
        ));
    }
}
