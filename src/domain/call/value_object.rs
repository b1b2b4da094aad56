//! Call value objects

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Registration state of the trunk account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
}

impl RegistrationState {
    pub fn name(&self) -> &'static str {
        match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Registering => "registering",
            RegistrationState::Registered => "registered",
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Call state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// No call has been placed
    Idle,
    /// INVITE sent, waiting for the far end
    Inviting,
    /// Callee is being alerted
    Ringing,
    /// Answered and acknowledged
    Established,
    /// BYE sent, waiting for its response
    Terminating,
    /// Call ended normally
    Terminated,
    /// Call could not be set up
    Failed,
}

impl CallState {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, new_state: CallState) -> bool {
        use CallState::*;

        match (self, new_state) {
            // A new call may start from any resting state
            (Idle | Terminated | Failed, Inviting) => true,

            (Inviting, Ringing | Established | Failed) => true,
            (Ringing, Established | Failed) => true,

            (Established, Terminating | Terminated) => true,
            (Terminating, Terminated) => true,

            _ => false,
        }
    }

    /// A call occupies the engine in any of these states
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CallState::Inviting | CallState::Ringing | CallState::Established | CallState::Terminating
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Inviting => "inviting",
            CallState::Ringing => "ringing",
            CallState::Established => "established",
            CallState::Terminating => "terminating",
            CallState::Terminated => "terminated",
            CallState::Failed => "failed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side ended an established call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallInitiator {
    Local,
    Remote,
}

/// DTMF digit representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtmfDigit {
    Zero,
    One,
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    Star,
    Pound,
    A,
    B,
    C,
    D,
}

impl DtmfDigit {
    /// Convert to character representation
    pub fn to_char(&self) -> char {
        match self {
            DtmfDigit::Zero => '0',
            DtmfDigit::One => '1',
            DtmfDigit::Two => '2',
            DtmfDigit::Three => '3',
            DtmfDigit::Four => '4',
            DtmfDigit::Five => '5',
            DtmfDigit::Six => '6',
            DtmfDigit::Seven => '7',
            DtmfDigit::Eight => '8',
            DtmfDigit::Nine => '9',
            DtmfDigit::Star => '*',
            DtmfDigit::Pound => '#',
            DtmfDigit::A => 'A',
            DtmfDigit::B => 'B',
            DtmfDigit::C => 'C',
            DtmfDigit::D => 'D',
        }
    }

    /// Parse from character; letters are accepted in either case
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            '0' => Some(DtmfDigit::Zero),
            '1' => Some(DtmfDigit::One),
            '2' => Some(DtmfDigit::Two),
            '3' => Some(DtmfDigit::Three),
            '4' => Some(DtmfDigit::Four),
            '5' => Some(DtmfDigit::Five),
            '6' => Some(DtmfDigit::Six),
            '7' => Some(DtmfDigit::Seven),
            '8' => Some(DtmfDigit::Eight),
            '9' => Some(DtmfDigit::Nine),
            '*' => Some(DtmfDigit::Star),
            '#' => Some(DtmfDigit::Pound),
            'A' => Some(DtmfDigit::A),
            'B' => Some(DtmfDigit::B),
            'C' => Some(DtmfDigit::C),
            'D' => Some(DtmfDigit::D),
            _ => None,
        }
    }
}

impl fmt::Display for DtmfDigit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_char())
    }
}

/// Returned by `place_call`; describes the call that was just initiated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHandle {
    pub call_id: String,
    pub destination: String,
    pub state: CallState,
}

/// Snapshot of the engine for status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub registration: RegistrationState,
    pub call_state: CallState,
    pub call_id: Option<String>,
    pub destination: Option<String>,
    /// Time since the call was answered, while established
    pub call_duration: Option<Duration>,
    /// Expiry granted by the registrar
    pub registration_expires: Option<u32>,
    pub local_addr: SocketAddr,
    /// Contact address advertised to the trunk
    pub contact: String,
}
