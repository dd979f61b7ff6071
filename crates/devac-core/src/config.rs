//! Runtime configuration: TOML file with `DEVAC_*` environment overrides.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{DevacError, DevacResult};

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DevacConfig {
    pub hub: HubConfig,
    pub engine: EngineConfig,
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Directory holding `central.db`, the socket and the hub lock.
    pub hub_dir: String,
    pub socket_name: String,
    pub probe_timeout_ms: u64,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hub_dir: "~/.devac".to_string(),
            socket_name: "mcp.sock".to_string(),
            probe_timeout_ms: 500,
            cache_ttl_secs: 300,
            cache_max_entries: 1000,
        }
    }
}

impl HubConfig {
    pub fn hub_dir(&self) -> PathBuf {
        expand_tilde(&self.hub_dir)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.hub_dir().join(&self.socket_name)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Analytic engine pool sizing and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool_size: u32,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Extension probe order for extensionless relative imports.
    pub extensions: Vec<String>,
    pub excluded_dirs: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            extensions: [".ts", ".tsx", ".js", ".jsx", ".mts", ".cts", ".mjs", ".cjs"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            excluded_dirs: [
                "node_modules",
                "dist",
                "build",
                "out",
                "coverage",
                ".git",
                ".devac",
                ".next",
                "__pycache__",
                ".venv",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl DevacConfig {
    /// Load from the first existing location, then apply env overrides.
    pub fn load(explicit: Option<&Path>) -> DevacResult<Self> {
        Self::load_with(explicit, |key| std::env::var(key).ok())
    }

    fn load_with(explicit: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> DevacResult<Self> {
        let mut config = match explicit {
            Some(path) => Self::load_from_path(path)?,
            None => {
                let mut found = None;
                for path in Self::config_locations(&env) {
                    if path.is_file() {
                        found = Some(Self::load_from_path(&path)?);
                        break;
                    }
                }
                found.unwrap_or_default()
            }
        };
        config.apply_overrides(&env)?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> DevacResult<Self> {
        debug!(path = %path.display(), "loading config");
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Candidate config files in lookup order. The hub-level file follows
    /// `DEVAC_HUB_DIR` when it is set.
    fn config_locations(env: impl Fn(&str) -> Option<String>) -> Vec<PathBuf> {
        let hub_dir = env_text(&env, "DEVAC_HUB_DIR")
            .map(|dir| expand_tilde(&dir))
            .unwrap_or_else(|| HubConfig::default().hub_dir());
        vec![PathBuf::from(".devac/config.toml"), hub_dir.join("config.toml")]
    }

    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) -> DevacResult<()> {
        if let Some(dir) = env_text(&env, "DEVAC_HUB_DIR") {
            self.hub.hub_dir = dir;
        }
        if let Some(v) = env_number::<u32>(&env, "DEVAC_POOL_SIZE")? {
            self.engine.pool_size = v;
        }
        if let Some(v) = env_number::<u64>(&env, "DEVAC_CACHE_TTL_SECS")? {
            self.hub.cache_ttl_secs = v;
        }
        if let Some(v) = env_number::<u64>(&env, "DEVAC_PROBE_TIMEOUT_MS")? {
            self.hub.probe_timeout_ms = v;
        }
        Ok(())
    }
}

fn env_text(env: impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    env(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_number<T: FromStr>(env: impl Fn(&str) -> Option<String>, key: &str) -> DevacResult<Option<T>> {
    match env_text(env, key) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            DevacError::Config(format!(
                "{key} must be a non-negative integer of at most {} bits, got {raw:?}",
                std::mem::size_of::<T>() * 8
            ))
        }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parses_partial_toml() {
        let config: DevacConfig = toml::from_str(
            "[hub]\ncache_ttl_secs = 5\n\n[engine]\npool_size = 2\n",
        )
        .unwrap();
        assert_eq!(config.hub.cache_ttl_secs, 5);
        assert_eq!(config.hub.socket_name, "mcp.sock");
        assert_eq!(config.engine.pool_size, 2);
        assert_eq!(config.engine.max_retries, 3);
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_apply_and_reject_overflow() {
        let mut config = DevacConfig::default();
        config
            .apply_overrides(vars(&[
                ("DEVAC_HUB_DIR", " /tmp/hub "),
                ("DEVAC_POOL_SIZE", "8"),
                ("DEVAC_CACHE_TTL_SECS", "30"),
            ]))
            .unwrap();
        assert_eq!(config.hub.hub_dir, "/tmp/hub");
        assert_eq!(config.engine.pool_size, 8);
        assert_eq!(config.hub.cache_ttl_secs, 30);

        let too_big = (u64::from(u32::MAX) + 1).to_string();
        let err = config
            .apply_overrides(vars(&[("DEVAC_POOL_SIZE", too_big.as_str())]))
            .unwrap_err();
        assert!(matches!(err, DevacError::Config(_)), "{err:?}");
        assert_eq!(config.engine.pool_size, 8);
        assert!(config.apply_overrides(vars(&[("DEVAC_POOL_SIZE", "-1")])).is_err());
    }

    #[test]
    fn hub_config_file_follows_hub_dir_override() {
        let locations = DevacConfig::config_locations(vars(&[("DEVAC_HUB_DIR", "/srv/devac")]));
        assert_eq!(locations[1], PathBuf::from("/srv/devac/config.toml"));

        let defaults = DevacConfig::config_locations(vars(&[]));
        assert_eq!(defaults[1], HubConfig::default().hub_dir().join("config.toml"));
    }

    #[test]
    fn load_reads_config_from_overridden_hub_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[engine]\npool_size = 3\n").unwrap();
        let hub_dir = dir.path().to_string_lossy().into_owned();
        let config = DevacConfig::load_with(None, vars(&[("DEVAC_HUB_DIR", hub_dir.as_str())])).unwrap();
        assert_eq!(config.engine.pool_size, 3);
        assert_eq!(config.hub.hub_dir(), dir.path());
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expand_tilde("~/x"), PathBuf::from(home).join("x"));
        }
        assert_eq!(expand_tilde("/abs"), PathBuf::from("/abs"));
    }

    #[test]
    fn default_excludes_dependency_dirs() {
        let cfg = ResolverConfig::default();
        assert!(cfg.excluded_dirs.iter().any(|d| d == "node_modules"));
        assert_eq!(cfg.extensions[0], ".ts");
    }
}
