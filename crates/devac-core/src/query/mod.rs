//! Federated SQL over package seeds.

pub mod federated;
pub mod guards;
pub mod preprocess;

pub use federated::{discover_packages, is_repo_root, query, QueryRequest, QueryResult, REPO_ROOT_WARNING};
pub use preprocess::{preprocess, PackageLabels, Preprocessed};
