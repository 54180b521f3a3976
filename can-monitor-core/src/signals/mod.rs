//! Message database and DBC loader
//!
//! This module contains the DBC parser and the in-memory message database
//! it produces.

pub mod dbc;
pub mod database;

// Re-export key types for convenience
pub use database::{
    BitNumbering, ByteOrder, Database, DatabaseStats, MessageDefinition, MultiplexerInfo,
    SignalDefinition, ValueType,
};
pub use dbc::{load_dbc_file, load_dbc_str, LoadedDatabase};
