//! Core value types for the Tessera peer-to-peer runtime.
//!
//! This crate defines the data structures shared by every transport and by
//! the router: addresses, node identities, and network configuration. It
//! contains no networking code.

pub mod address;
pub mod config;
pub mod error;
pub mod identity;

pub use address::{Address, ConnType};
pub use config::NetworkConfig;
pub use error::{TypesError, TypesResult};
pub use identity::{IdentityId, LocalIdentity, PublicKey, ServerIdentity, ServiceIdentity};
