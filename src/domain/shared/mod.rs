//! Shared kernel - types used across the engine

pub mod error;
pub mod events;
pub mod result;

pub use error::SessionError;
pub use events::{DomainEvent, EventMetadata};
pub use result::Result;
