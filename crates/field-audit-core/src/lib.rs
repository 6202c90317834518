//! # field-audit core
//!
//! Runtime-free logic shared by the field-audit engine: the folder tree,
//! content fingerprints, the verdict policy, and the local store
//! abstraction.
//!
//! This crate has no tokio, sqlx, or network dependencies.

pub mod fingerprint;
pub mod models;
pub mod policy;
pub mod store;
pub mod tree;
