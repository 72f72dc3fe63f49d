//! QuotaGuard Shared Types and Utilities
//!
//! This crate contains the closed tier/feature enumerations, the tier catalog,
//! and database helpers shared across the QuotaGuard crates.

pub mod catalog;
pub mod db;
pub mod error;
pub mod types;

pub use catalog::{TierCatalog, CATALOG_VERSION};
pub use db::*;
pub use error::*;
pub use types::*;
