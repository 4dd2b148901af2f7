//! Repository module: the gateway trait, its errors, and the Postgres
//! implementation.

pub mod errors;
pub mod pg;
pub mod traits;

pub use errors::*;
pub use pg::PgGateway;
pub use traits::*;
