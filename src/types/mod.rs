//! Shared types for the RPC client transport

pub mod error;

pub use error::{Result, TransportError};
