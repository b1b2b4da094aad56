//! Wire protocol implementations

pub mod sip;
