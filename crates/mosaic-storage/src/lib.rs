// Persistence layer: tasks and submissions in a relational store, with a
// PostgreSQL implementation for deployments and an in-memory one for tests
// and embedded use.

pub mod memory;
pub mod postgres;
pub mod rows;
pub mod store;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use store::{StoreError, Submission, TaskStore};
