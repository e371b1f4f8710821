//! Adapters that live inside the domain crate for convenience.
//!
//! The in-memory repository backs unit tests and local runs. Real storage
//! engines (SQLite, DynamoDB) live in separate crates.

pub mod memory_repo;
