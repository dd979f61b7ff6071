use std::fs;
use std::path::Path;

use devac_core::errors::DevacError;
use devac_core::models::{ParseResult, BASE_BRANCH};
use devac_core::query::{discover_packages, query, QueryRequest, REPO_ROOT_WARNING};
use devac_core::store::{EnginePool, SeedWriter};
use serde_json::{json, Value};

fn seed(pool: &EnginePool, root: &Path, names: &[&str]) {
    let nodes = names
        .iter()
        .map(|name| {
            serde_json::from_value(json!({
                "entity_id": format!("app:pkg:class:{name}"),
                "name": name,
                "kind": "class",
                "file_path": "src/index.ts",
            }))
            .unwrap()
        })
        .collect();
    let parsed = ParseResult {
        nodes,
        source_file_hash: names.join(","),
        file_path: "src/index.ts".to_string(),
        ..ParseResult::default()
    };
    let result = SeedWriter::new(root, pool.clone()).write_file(BASE_BRANCH, &parsed);
    assert!(result.success, "{:?}", result.error);
}

fn names(rows: &[serde_json::Map<String, Value>]) -> Vec<String> {
    rows.iter()
        .map(|r| r["name"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn union_of_two_packages() {
    let dir = tempfile::tempdir().unwrap();
    let pool = EnginePool::with_defaults().unwrap();
    let a = dir.path().join("packages/pkg-a");
    let b = dir.path().join("packages/pkg-b");
    seed(&pool, &a, &["Alpha", "Apex"]);
    seed(&pool, &b, &["Beta"]);

    let packages = discover_packages(dir.path());
    assert_eq!(packages, vec![a.clone(), b.clone()]);

    let result = query(
        &pool,
        &QueryRequest::new(packages.clone(), "SELECT name, package_path FROM nodes ORDER BY name"),
    )
    .unwrap();
    assert_eq!(names(&result.rows), vec!["Alpha", "Apex", "Beta"]);
    assert_eq!(result.columns, vec!["name", "package_path"]);
    assert_eq!(result.rows[2]["package_path"], json!(b.to_string_lossy()));
    assert!(result.views_created.contains(&"nodes".to_string()));
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    assert!(!result.truncated);

    let only_b = query(&pool, &QueryRequest::new(packages.clone(), "SELECT name FROM nodes@pkg-b")).unwrap();
    assert_eq!(names(&only_b.rows), vec!["Beta"]);

    let all = query(
        &pool,
        &QueryRequest::new(packages.clone(), "SELECT COUNT(*) AS n FROM nodes@*"),
    )
    .unwrap();
    assert_eq!(all.rows[0]["n"], json!(3));

    let err = query(&pool, &QueryRequest::new(packages, "SELECT * FROM nodes@nowhere")).unwrap_err();
    assert!(matches!(err, DevacError::QueryPreprocess(_)));
}

#[test]
fn repo_root_with_seeds_is_skipped_with_warning() {
    let dir = tempfile::tempdir().unwrap();
    let pool = EnginePool::with_defaults().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join(".git")).unwrap();
    seed(&pool, root, &["RootLevel"]);
    let pkg = root.join("packages/core");
    seed(&pool, &pkg, &["Core"]);

    let alone = query(&pool, &QueryRequest::new(vec![root.to_path_buf()], "SELECT * FROM nodes")).unwrap();
    assert!(alone.rows.is_empty());
    assert!(alone.warnings.iter().any(|w| w.contains(REPO_ROOT_WARNING)));

    let mixed = query(
        &pool,
        &QueryRequest::new(vec![root.to_path_buf(), pkg], "SELECT name FROM nodes"),
    )
    .unwrap();
    assert_eq!(names(&mixed.rows), vec!["Core"]);
    assert_eq!(mixed.packages_queried, vec!["core".to_string()]);
    assert!(mixed.warnings.iter().any(|w| w.contains(REPO_ROOT_WARNING)));
}

#[test]
fn unseeded_packages_warn_and_limits_truncate() {
    let dir = tempfile::tempdir().unwrap();
    let pool = EnginePool::with_defaults().unwrap();
    let seeded = dir.path().join("a");
    let empty = dir.path().join("b");
    fs::create_dir_all(&empty).unwrap();
    seed(&pool, &seeded, &["One", "Two", "Three"]);

    let mut request = QueryRequest::new(vec![seeded, empty], "SELECT name FROM nodes");
    request.limit = Some(2);
    let result = query(&pool, &request).unwrap();
    assert_eq!(result.rows.len(), 2);
    assert!(result.truncated);
    assert!(result.warnings.iter().any(|w| w.contains("no seed for branch 'base'")));
}
