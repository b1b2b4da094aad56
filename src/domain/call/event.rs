//! Session events published to subscribers

use crate::domain::call::value_object::CallInitiator;
use crate::domain::shared::events::{DomainEvent, EventMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened. Every registration or call state transition produces
/// exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEventKind {
    /// REGISTER sent
    Registering,
    /// Registration accepted by the trunk
    Connected { expires: u32 },
    RegistrationFailed { reason: String },
    CallInitiated { call_id: String, destination: String },
    CallRinging { call_id: String, destination: String },
    CallEstablished { call_id: String, destination: String },
    CallFailed { call_id: String, destination: String, reason: String },
    DigitSent { call_id: String, digit: char },
    CallTerminating { call_id: String, destination: String },
    CallEnded { call_id: String, destination: String, initiator: CallInitiator },
    /// Result of an OPTIONS connection test; `status` is absent on timeout
    ConnectionTested { reachable: bool, status: Option<u16> },
    Disconnected,
}

impl SessionEventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEventKind::Registering => "registration.registering",
            SessionEventKind::Connected { .. } => "registration.connected",
            SessionEventKind::RegistrationFailed { .. } => "registration.failed",
            SessionEventKind::CallInitiated { .. } => "call.initiated",
            SessionEventKind::CallRinging { .. } => "call.ringing",
            SessionEventKind::CallEstablished { .. } => "call.established",
            SessionEventKind::CallFailed { .. } => "call.failed",
            SessionEventKind::DigitSent { .. } => "call.digit_sent",
            SessionEventKind::CallTerminating { .. } => "call.terminating",
            SessionEventKind::CallEnded { .. } => "call.ended",
            SessionEventKind::ConnectionTested { .. } => "connection.tested",
            SessionEventKind::Disconnected => "session.disconnected",
        }
    }
}

impl fmt::Display for SessionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEventKind::Registering => write!(f, "registering"),
            SessionEventKind::Connected { expires } => {
                write!(f, "registered (expires in {}s)", expires)
            }
            SessionEventKind::RegistrationFailed { reason } => {
                write!(f, "registration failed: {}", reason)
            }
            SessionEventKind::CallInitiated { destination, .. } => {
                write!(f, "calling {}", destination)
            }
            SessionEventKind::CallRinging { destination, .. } => {
                write!(f, "{} is ringing", destination)
            }
            SessionEventKind::CallEstablished { destination, .. } => {
                write!(f, "call to {} answered", destination)
            }
            SessionEventKind::CallFailed {
                destination, reason, ..
            } => write!(f, "call to {} failed: {}", destination, reason),
            SessionEventKind::DigitSent { digit, .. } => write!(f, "sent DTMF {}", digit),
            SessionEventKind::CallTerminating { destination, .. } => {
                write!(f, "hanging up {}", destination)
            }
            SessionEventKind::CallEnded {
                destination,
                initiator,
                ..
            } => match initiator {
                CallInitiator::Local => write!(f, "call to {} ended", destination),
                CallInitiator::Remote => write!(f, "{} hung up", destination),
            },
            SessionEventKind::ConnectionTested {
                reachable: true,
                status: Some(code),
            } => write!(f, "trunk reachable ({})", code),
            SessionEventKind::ConnectionTested { reachable, .. } => {
                if *reachable {
                    write!(f, "trunk reachable")
                } else {
                    write!(f, "trunk unreachable")
                }
            }
            SessionEventKind::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub metadata: EventMetadata,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

impl SessionEvent {
    pub fn new(kind: SessionEventKind) -> Self {
        Self {
            metadata: EventMetadata::new(kind.event_type().to_string()),
            kind,
        }
    }
}

impl DomainEvent for SessionEvent {
    fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata.occurred_at
    }
}
