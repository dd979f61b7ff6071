//! Seed storage: per-package, per-branch table files with atomic replace.

pub mod atomic;
pub mod lock;
pub mod paths;
pub mod pool;
pub mod reader;
pub mod schema;
pub mod writer;

pub use lock::DirLock;
pub use pool::EnginePool;
pub use reader::{SeedReader, SeedStats};
pub use schema::{SeedRow, SeedTable};
pub use writer::{SeedWriter, WriteResult};
