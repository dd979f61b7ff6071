//! Shared guardrails for query payload bounds.

// Federated query guards
pub const MAX_SQL_LENGTH: usize = 64 * 1024;
pub const MAX_PACKAGES_PER_QUERY: usize = 256;
pub const MAX_FEDERATED_ROWS: usize = 10_000;
pub const DEFAULT_FEDERATED_ROWS: usize = 1_000;

// Hub payload guards
pub const MAX_CROSS_REPO_EDGES_PER_CALL: usize = 50_000;
pub const MAX_DIAGNOSTICS_PER_PUSH: usize = 100_000;
pub const MAX_DIAGNOSTICS_RESULTS: usize = 5_000;
pub const MAX_IPC_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Row cap for a request: `None` and zero fall back to the default.
pub fn clamp_limit(value: Option<usize>, default: usize, maximum: usize) -> usize {
    match value {
        Some(0) | None => default,
        Some(v) => v.min(maximum),
    }
}

/// Trim surrounding whitespace and trailing statement terminators.
pub fn normalize_sql(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}
