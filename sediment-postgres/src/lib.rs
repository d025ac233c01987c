//! # PostgreSQL Sediment Backend Library
mod backend;
mod error;
mod migrator;

pub use crate::backend::PgBackend;
pub use crate::error::Error;
pub use crate::migrator::Migrator;
