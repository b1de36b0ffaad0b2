//! Storage collaborators behind the auth crate's `PrincipalStore` / `SessionStore` traits.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
