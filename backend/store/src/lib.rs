//! Storage gateway backends.
pub mod memory;
pub mod sqlite;

#[cfg(test)]
mod conformance;

pub use memory::MemoryGateway;
pub use sqlite::SqliteGateway;
