//! Call bounded context - registration and call lifecycle types

pub mod event;
pub mod value_object;

pub use event::{SessionEvent, SessionEventKind};
pub use value_object::{
    CallHandle, CallInitiator, CallState, DtmfDigit, RegistrationState, SessionStatus,
};
