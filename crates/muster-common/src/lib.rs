//! Muster common - shared types for the Muster cluster discovery service
//!
//! This crate provides:
//! - `Error`: the discovery error taxonomy shared by all backends
//! - `Node`: the `host:port` address model cluster members are described with

pub mod error;
pub mod node;

pub use error::{Error, Result};
pub use node::Node;
