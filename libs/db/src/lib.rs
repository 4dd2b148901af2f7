//! Persistence Gateway: the single component allowed to touch the
//! database, exposed to the rest of the core as the [`repo::PersistenceGateway`]
//! trait with [`repo::pg::PgGateway`] as its only Postgres-backed implementation.

pub mod pagination;
pub mod pool;
pub mod repo;

pub use pagination::*;
pub use pool::*;
pub use repo::*;
