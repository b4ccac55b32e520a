//! Database layer for objsync

mod connection;
mod migrations;

pub use connection::Database;
pub(crate) use connection::begin_write;
