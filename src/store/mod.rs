//! SQLite-backed log store shared by the staging area and activity recorder.

mod log_store;
mod schema;

pub use log_store::{LogStore, StoreResult};
pub(crate) use log_store::table_exists_on;
pub use schema::{ACTIVITY_TABLE, DB_FILE, STAGING_TABLE, TableSpec, activity_table, staging_table};
