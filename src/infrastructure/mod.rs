//! Infrastructure layer - Technical implementations
//!
//! This layer contains the SIP stack: codec, transactions, dialogs,
//! transports and the session engine that drives them.

pub mod protocols;
