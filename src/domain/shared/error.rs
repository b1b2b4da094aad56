//! Session errors
//!
//! Contract violations (calling an operation in the wrong state) are returned
//! before any network traffic happens. Network outcomes are reported as
//! events instead.

use crate::domain::call::value_object::{CallState, RegistrationState};
use crate::infrastructure::protocols::sip::SipError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A transaction ran out of retransmissions
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Final non-2xx answer from the trunk, rendered as its status line
    #[error("{code} {reason}")]
    Rejected { code: u16, reason: String },

    #[error("Not registered (registration is {0})")]
    NotRegistered(RegistrationState),

    #[error("No established call (call is {0})")]
    NoEstablishedCall(CallState),

    #[error("A call is already in progress ({0})")]
    CallInProgress(CallState),

    #[error("Invalid DTMF digit: {0:?}")]
    InvalidDigit(char),

    #[error("Invalid destination: {0:?}")]
    InvalidDestination(String),

    #[error("Session engine stopped")]
    Stopped,
}

impl SessionError {
    /// True for errors raised by state checks before any I/O
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            SessionError::NotRegistered(_)
                | SessionError::NoEstablishedCall(_)
                | SessionError::CallInProgress(_)
                | SessionError::InvalidDigit(_)
                | SessionError::InvalidDestination(_)
        )
    }
}

impl From<SipError> for SessionError {
    fn from(err: SipError) -> Self {
        match err {
            SipError::TransportError(msg) => SessionError::Transport(msg),
            SipError::Authentication(msg) => SessionError::Authentication(msg),
            other => SessionError::Protocol(other.to_string()),
        }
    }
}
