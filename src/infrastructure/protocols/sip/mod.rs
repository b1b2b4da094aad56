//! SIP user agent stack
//!
//! A small RFC 3261 client: enough to register with a trunk, place one call,
//! send DTMF over INFO and tear the call down again.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │     Session Engine      │
//! │  (register, call, DTMF) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │    Dialog Layer         │
//! │   (tags, route set)     │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │ (retransmit, timeouts)  │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │    (UDP, in-memory)     │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod dialog;
pub mod dtmf;
pub mod message;
pub mod sdp;
pub mod session;
pub mod transaction;
pub mod transport;

pub use auth::{AuthChallenge, ChallengeKind, DigestAlgorithm, DigestCredentials};
pub use builder::{RequestBuilder, ResponseBuilder};
pub use dialog::{Dialog, DialogId};
pub use dtmf::DtmfRelay;
pub use message::{make_header, SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use sdp::SdpSession;
pub use session::SipSession;
pub use transaction::{
    ClientState, ResponseMatch, SipTimers, TimerOutcome, TransactionId, TransactionKey,
    TransactionTracker,
};
pub use transport::{
    memory_pair, InboundDatagram, MemoryPeer, MemoryTransport, OutgoingMessage, Transport,
    UdpTransport,
};
