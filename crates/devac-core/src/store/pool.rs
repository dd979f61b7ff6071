//! Bounded pool of in-memory analytic engines.
//!
//! Seed writes and federated queries each borrow a private in-memory SQLite
//! engine, load or attach seed files into it, and return it when done.
//! [`EnginePool::with_engine`] is the recovery wrapper: recoverable
//! contention errors are retried on a fresh connection, everything else
//! propagates.

use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::errors::{DevacError, DevacResult};

pub type Engine = PooledConnection<SqliteConnectionManager>;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct EngineInitializer;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for EngineInitializer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA busy_timeout=5000;
             PRAGMA temp_store=MEMORY;
             PRAGMA cache_size=-32000;",
        )?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct EnginePool {
    pool: Pool<SqliteConnectionManager>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl std::fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePool")
            .field("max_size", &self.pool.max_size())
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl EnginePool {
    pub fn new(config: &EngineConfig) -> DevacResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .min_idle(Some(0))
            .connection_timeout(ACQUIRE_TIMEOUT)
            .connection_customizer(Box::new(EngineInitializer))
            .build(manager)
            .map_err(|e| DevacError::Storage(format!("Failed to create engine pool: {e}")))?;
        Ok(Self {
            pool,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    pub fn with_defaults() -> DevacResult<Self> {
        Self::new(&EngineConfig::default())
    }

    pub fn max_size(&self) -> u32 {
        self.pool.max_size()
    }

    pub fn get(&self) -> DevacResult<Engine> {
        Ok(self.pool.get()?)
    }

    /// Run `op` on a pooled engine. On a recoverable error the engine goes
    /// back to the pool and `op` reruns on a newly acquired one, up to
    /// `max_retries` times with linear backoff. `op` must reset any engine
    /// state it relies on.
    pub fn with_engine<T, F>(&self, mut op: F) -> DevacResult<T>
    where
        F: FnMut(&mut Connection) -> DevacResult<T>,
    {
        let mut attempt = 0u32;
        loop {
            let result = self.get().and_then(|mut engine| op(&mut engine));
            match result {
                Err(e) if e.is_recoverable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "retrying on a fresh engine");
                    std::thread::sleep(self.retry_backoff * attempt);
                }
                other => {
                    if attempt > 0 {
                        debug!(attempt, "engine operation finished after retry");
                    }
                    return other;
                }
            }
        }
    }
}

/// Drop every attached database, table and view so a pooled engine starts
/// clean for the next borrower.
pub fn reset_engine(conn: &Connection) -> DevacResult<()> {
    let attached: Vec<String> = {
        let mut stmt = conn.prepare("PRAGMA database_list;")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
        rows.collect::<Result<_, _>>()?
    };
    for name in attached.iter().filter(|n| *n != "main" && *n != "temp") {
        conn.execute_batch(&format!("DETACH DATABASE \"{name}\";"))?;
    }

    let objects: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT type, name FROM sqlite_master \
             WHERE type IN ('view', 'table') AND name NOT LIKE 'sqlite_%';",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<_, _>>()?
    };
    for (kind, name) in objects.iter().filter(|(k, _)| k == "view") {
        conn.execute_batch(&format!("DROP {} IF EXISTS \"{name}\";", kind.to_uppercase()))?;
    }
    for (_, name) in objects.iter().filter(|(k, _)| k == "table") {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{name}\";"))?;
    }
    Ok(())
}
