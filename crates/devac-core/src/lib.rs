//! DevAC core: content-addressed code graph storage and federation.
//!
//! - [`addressing`]: stable entity IDs and `devac://` canonical URIs.
//! - [`store`]: per-package seed tables with atomic, crash-safe writes and a
//!   base + branch-delta model.
//! - [`resolver`]: export indexing and semantic import resolution.
//! - [`query`]: SQL federation over many packages' seeds.
//! - [`hub`]: the single-writer central registry and its socket protocol.

pub mod addressing;
pub mod config;
pub mod errors;
pub mod hub;
pub mod models;
pub mod query;
pub mod resolver;
pub mod store;

pub use errors::{DevacError, DevacResult};
