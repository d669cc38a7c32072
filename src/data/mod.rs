//! Data layer: SQLite store and domain models.

mod database;
mod models;

pub use database::Database;
pub use models::*;
