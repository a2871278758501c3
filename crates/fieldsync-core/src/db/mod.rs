//! libSQL database layer backing [`crate::storage::LibSqlStore`]

mod connection;
mod migrations;

pub use connection::Database;
