//! Criterion benchmarks for devac-core.
//!
//! ## Benchmark groups
//!
//! 1. **addressing**: Entity ID hashing and canonical URI parsing.
//! 2. **guards**: Limit clamping and SQL normalization.
//! 3. **preprocess**: `table@package` expansion.
//! 4. **seed_write**: Atomic seed writes at several batch sizes.
//! 5. **federation**: Federated queries over seeded packages.
//! 6. **export_index**: Export index build over a synthetic package.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/devac-core/Cargo.toml
//! # Run only the federation group:
//! cargo bench --manifest-path crates/devac-core/Cargo.toml -- federation
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

use devac_core::addressing::{generate_entity_id, parse_canonical_uri, parse_entity_id};
use devac_core::config::ResolverConfig;
use devac_core::models::{Node, ParseResult, BASE_BRANCH};
use devac_core::query::guards::{clamp_limit, normalize_sql};
use devac_core::query::{preprocess, query, PackageLabels, QueryRequest};
use devac_core::resolver::{ResolverContext, SemanticResolver};
use devac_core::store::{EnginePool, SeedWriter};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A parsed file with `n` function nodes.
fn synthetic_file(file: &str, n: usize) -> ParseResult {
    let nodes: Vec<Node> = (0..n)
        .map(|i| {
            let name = format!("func_{i}");
            serde_json::from_value(json!({
                "entity_id": generate_entity_id("bench", "packages/core", "function", file, &name),
                "name": name,
                "kind": "function",
                "file_path": file,
                "start_line": i * 10,
                "end_line": i * 10 + 5,
                "is_exported": true,
            }))
            .unwrap()
        })
        .collect();
    ParseResult {
        nodes,
        source_file_hash: format!("{file}:{n}"),
        file_path: file.to_string(),
        ..ParseResult::default()
    }
}

fn seeded_packages(root: &Path, pool: &EnginePool, packages: usize, files: usize) -> Vec<PathBuf> {
    (0..packages)
        .map(|p| {
            let pkg = root.join(format!("packages/pkg{p}"));
            let parsed: Vec<ParseResult> = (0..files)
                .map(|f| synthetic_file(&format!("src/file{f}.ts"), 20))
                .collect();
            let result = SeedWriter::new(&pkg, pool.clone()).write_files(BASE_BRANCH, &parsed);
            assert!(result.success, "{:?}", result.error);
            pkg
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

fn bench_addressing(c: &mut Criterion) {
    let mut group = c.benchmark_group("addressing");

    group.bench_function("generate_entity_id", |b| {
        b.iter(|| {
            generate_entity_id(
                black_box("app"),
                black_box("packages/core"),
                black_box("method"),
                black_box("src/services/user.ts"),
                black_box("UserService.findById"),
            )
        });
    });

    group.bench_function("parse_entity_id", |b| {
        b.iter(|| parse_entity_id(black_box("app:packages/core:function:a1b2c3d4")));
    });

    group.bench_function("parse_canonical_uri", |b| {
        b.iter(|| {
            parse_canonical_uri(black_box(
                "devac://app/packages/core/src/user.ts#UserService.findById()?version=main&line=42",
            ))
        });
    });

    group.finish();
}

fn bench_guards(c: &mut Criterion) {
    let mut group = c.benchmark_group("guards");

    group.bench_function("clamp_limit", |b| {
        b.iter(|| clamp_limit(black_box(Some(50_000)), black_box(1_000), black_box(10_000)));
    });

    group.bench_function("normalize_sql", |b| {
        let sql = format!("  SELECT name FROM nodes WHERE kind = 'class' {} ;;  ", " ".repeat(64));
        b.iter(|| normalize_sql(black_box(&sql)));
    });

    group.finish();
}

fn bench_preprocess(c: &mut Criterion) {
    let mut group = c.benchmark_group("preprocess");
    let packages: Vec<PathBuf> = (0..32)
        .map(|i| PathBuf::from(format!("/repo/packages/pkg{i}")))
        .collect();
    let labels = PackageLabels::new(&packages);

    group.bench_function("single_package", |b| {
        b.iter(|| preprocess(black_box("SELECT * FROM nodes@pkg7 WHERE kind = 'class'"), &labels, |_| true));
    });

    group.bench_function("all_packages", |b| {
        b.iter(|| preprocess(black_box("SELECT COUNT(*) FROM edges@*"), &labels, |_| true));
    });

    group.finish();
}

fn bench_seed_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("seed_write");
    group.sample_size(20);
    let pool = EnginePool::with_defaults().unwrap();

    for files in [1usize, 10, 50] {
        let parsed: Vec<ParseResult> = (0..files)
            .map(|f| synthetic_file(&format!("src/file{f}.ts"), 25))
            .collect();
        group.bench_with_input(BenchmarkId::new("write_files", files), &parsed, |b, parsed| {
            let dir = tempfile::tempdir().unwrap();
            let writer = SeedWriter::new(dir.path(), pool.clone());
            b.iter(|| writer.write_files(BASE_BRANCH, black_box(parsed)));
        });
    }

    group.finish();
}

fn bench_federation(c: &mut Criterion) {
    let mut group = c.benchmark_group("federation");
    group.sample_size(20);
    let pool = EnginePool::with_defaults().unwrap();

    for packages in [1usize, 4, 16] {
        let dir = tempfile::tempdir().unwrap();
        let paths = seeded_packages(dir.path(), &pool, packages, 5);
        let request = QueryRequest::new(
            paths,
            "SELECT package_path, COUNT(*) AS n FROM nodes GROUP BY package_path",
        );
        group.bench_with_input(BenchmarkId::new("count_by_package", packages), &request, |b, req| {
            b.iter(|| query(&pool, black_box(req)).unwrap());
        });
    }

    group.finish();
}

fn bench_export_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("export_index");
    group.sample_size(20);

    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir_all(&src).unwrap();
    let mut barrel = String::new();
    for i in 0..100 {
        fs::write(
            src.join(format!("mod{i}.ts")),
            format!("export function fn{i}() {{}}\nexport class Cls{i} {{}}\n"),
        )
        .unwrap();
        barrel.push_str(&format!("export * from './mod{i}';\n"));
    }
    fs::write(src.join("index.ts"), barrel).unwrap();

    let resolver = SemanticResolver::new(
        ResolverContext {
            repo: "bench".into(),
            package_path: "packages/core".into(),
            package_root: dir.path().to_path_buf(),
        },
        ResolverConfig::default(),
    );

    group.bench_function("build_100_files_with_barrel", |b| {
        b.iter(|| resolver.build_export_index());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_addressing,
    bench_guards,
    bench_preprocess,
    bench_seed_write,
    bench_federation,
    bench_export_index,
);
criterion_main!(benches);
