//! sipdialer - An outbound SIP call session engine built with Rust
//!
//! Registers with a SIP trunk over UDP, places a single outbound call,
//! sends DTMF digits over SIP INFO and hangs up. Progress is reported as
//! [`SessionEvent`]s on a broadcast channel.
//!
//! ```no_run
//! # async fn demo() -> sipdialer::Result<()> {
//! let config = sipdialer::Config::load(None).map_err(|e| {
//!     sipdialer::SessionError::Configuration(e.to_string())
//! })?;
//! let session = sipdialer::SipSession::start_udp(config).await?;
//! let mut events = session.subscribe();
//! session.register().await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{}", event.kind);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use config::Config;
pub use domain::call::{
    CallHandle, CallInitiator, CallState, DtmfDigit, RegistrationState, SessionEvent,
    SessionEventKind, SessionStatus,
};
pub use domain::shared::error::SessionError;
pub use domain::shared::result::Result;
pub use infrastructure::protocols::sip::SipSession;
