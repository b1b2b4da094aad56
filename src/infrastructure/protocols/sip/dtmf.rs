//! DTMF relay over SIP INFO (application/dtmf-relay)
use crate::domain::call::DtmfDigit;
use std::time::Duration;

pub const DTMF_RELAY_CONTENT_TYPE: &str = "application/dtmf-relay";

/// Tone duration used when a body omits it
pub const DEFAULT_DURATION: Duration = Duration::from_millis(100);

/// A single key press carried in an INFO body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfRelay {
    pub digit: DtmfDigit,
    pub duration: Duration,
}

impl DtmfRelay {
    pub fn new(digit: DtmfDigit, duration: Duration) -> Self {
        Self { digit, duration }
    }

    /// `Signal=<digit>\r\nDuration=<ms>\r\n`
    pub fn to_body(&self) -> String {
        format!(
            "Signal={}\r\nDuration={}\r\n",
            self.digit.to_char(),
            self.duration.as_millis()
        )
    }

    /// Parse an INFO body
    pub fn parse(body: &str) -> Option<Self> {
        let mut signal: Option<char> = None;
        let mut duration = DEFAULT_DURATION;

        for line in body.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();

            match key.trim() {
                k if k.eq_ignore_ascii_case("Signal") => signal = value.chars().next(),
                k if k.eq_ignore_ascii_case("Duration") => {
                    if let Ok(ms) = value.parse::<u64>() {
                        duration = Duration::from_millis(ms);
                    }
                }
                _ => {}
            }
        }

        let digit = DtmfDigit::from_char(signal?)?;
        Some(Self { digit, duration })
    }
}
