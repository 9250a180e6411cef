//! Common utilities and types shared across tokenvault crates.
//!
//! This module provides the identifiers and the sealed record payload that
//! every storage connector and the replication layer agree on, together
//! with the shared error type.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Metadata, ProviderId, SealedRecord, TokenId};
