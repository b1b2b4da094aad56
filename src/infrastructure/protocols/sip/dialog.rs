//! SIP dialog state for the outbound (UAC) side of a call

use super::builder::RequestBuilder;
use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use rsip::Header;

/// Call-ID plus both tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

/// Dialog created by a 2xx to our INVITE
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    /// From header value as we sent it (with our tag)
    pub local_party: String,
    /// To header value as answered (with the remote tag)
    pub remote_party: String,
    /// Where in-dialog requests go: the remote Contact
    pub remote_target: String,
    /// Route set learned from Record-Route, in request order
    pub route_set: Vec<String>,
    /// CSeq of the INVITE that created the dialog
    pub invite_seq: u32,
    local_seq: u32,
}

impl Dialog {
    /// Build the dialog from the INVITE we sent and the 2xx that answered it
    pub fn from_invite_response(invite: &SipRequest, response: &SipResponse) -> Result<Self, SipError> {
        let call_id = response
            .call_id()
            .ok_or_else(|| SipError::InvalidMessage("2xx without Call-ID".to_string()))?;
        let local_tag = response
            .from_tag()
            .or_else(|| invite.from_tag())
            .ok_or_else(|| SipError::InvalidMessage("2xx without From tag".to_string()))?;
        let remote_tag = response
            .to_tag()
            .ok_or_else(|| SipError::InvalidMessage("2xx without To tag".to_string()))?;
        let (invite_seq, _) = response
            .cseq()
            .ok_or_else(|| SipError::InvalidMessage("2xx without CSeq".to_string()))?;

        let local_party = invite
            .header("From")
            .ok_or_else(|| SipError::InvalidMessage("INVITE without From".to_string()))?;
        let remote_party = response
            .header("To")
            .ok_or_else(|| SipError::InvalidMessage("2xx without To".to_string()))?;

        let remote_target = response
            .headers()
            .iter()
            .find_map(|h| match h {
                Header::Contact(contact) => contact.uri().ok(),
                _ => None,
            })
            .unwrap_or_else(|| invite.uri().clone())
            .to_string();

        // UAC route set is the Record-Route list reversed
        let mut route_set: Vec<String> = response
            .header_values("Record-Route")
            .iter()
            .flat_map(|v| split_list(v))
            .collect();
        route_set.reverse();

        Ok(Self {
            id: DialogId {
                call_id: call_id.to_string(),
                local_tag: local_tag.to_string(),
                remote_tag: remote_tag.to_string(),
            },
            local_party,
            remote_party,
            remote_target,
            route_set,
            invite_seq,
            local_seq: invite_seq,
        })
    }

    pub fn call_id(&self) -> &str {
        &self.id.call_id
    }

    /// Current local CSeq
    pub fn local_seq(&self) -> u32 {
        self.local_seq
    }

    /// Allocate the CSeq for the next in-dialog request
    pub fn next_seq(&mut self) -> u32 {
        self.local_seq += 1;
        self.local_seq
    }

    /// Whether an inbound request belongs to this dialog
    pub fn matches_request(&self, request: &SipRequest) -> bool {
        if request.call_id() != Some(self.id.call_id.as_str()) {
            return false;
        }
        // Remote requests carry our tag in To and theirs in From
        let to_ok = request
            .to_tag()
            .map_or(true, |tag| tag == self.id.local_tag);
        let from_ok = request
            .from_tag()
            .map_or(true, |tag| tag == self.id.remote_tag);
        to_ok && from_ok
    }

    /// Builder for a new in-dialog request with the next CSeq
    pub fn request(&mut self, method: SipMethod) -> RequestBuilder {
        let seq = self.next_seq();
        self.builder(method, seq)
    }

    /// ACK for the 2xx; reuses the INVITE's CSeq number with a fresh branch
    pub fn ack(&self) -> RequestBuilder {
        self.builder(SipMethod::Ack, self.invite_seq)
    }

    fn builder(&self, method: SipMethod, seq: u32) -> RequestBuilder {
        let mut builder = RequestBuilder::new(method, self.remote_target.clone())
            .from(self.local_party.clone())
            .to(self.remote_party.clone())
            .call_id(self.id.call_id.clone())
            .cseq(seq);
        for route in &self.route_set {
            builder = builder.header("Route", route.clone());
        }
        builder
    }
}

/// Split a comma-separated header value, ignoring commas inside quoted
/// strings and angle brackets
fn split_list(value: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;
    let mut depth = 0u32;

    for ch in value.chars() {
        if quoted {
            current.push(ch);
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => quoted = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => quoted = true,
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                entries.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    entries.push(current);

    entries
        .into_iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect()
}
