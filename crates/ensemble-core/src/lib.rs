//! ensemble-core: shared types, wire format, configuration and cryptographic
//! primitives. All other Ensemble crates depend on this one.

pub mod config;
pub mod crypto;
pub mod message;
pub mod wire;

pub use message::{Arg, Message};
