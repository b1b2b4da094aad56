//! Domain layer - Core call session model
//!
//! This layer contains:
//! - Value Objects: registration and call states, DTMF digits, status snapshots
//! - Domain Events: lifecycle notifications published by the session engine
//! - Shared error and result types

pub mod call;
pub mod shared;

// Re-export commonly used types
pub use shared::{Result, SessionError};
