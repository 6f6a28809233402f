//! CDS Core Library
//!
//! Client-side private contact discovery: incremental, quota-aware lookups
//! against an attested directory service, and reconciliation of the
//! results into the local recipient store.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(unsafe_code)]

pub mod config;
pub mod discovery;
pub mod recipient;

pub use config::DiscoveryConfig;
pub use discovery::{DiscoveryError, DiscoveryManager, DiscoveryMode};
