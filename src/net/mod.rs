//! TCP line transport

pub mod connection;
pub mod protocol;

pub use connection::serve;
