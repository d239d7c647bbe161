//! # tidings-shared
//!
//! Vocabulary shared by every tidings crate: identifiers and enums that
//! describe accounts, connections and channels, the payloads carried over
//! the transport boundary, error types and crate-wide constants.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;
