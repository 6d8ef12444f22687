//! MongoDB adapters (connection bootstrap).

pub mod connection;

pub use connection::{apply_settings, connect, ConnectError};
