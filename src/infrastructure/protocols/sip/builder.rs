//! SIP message builder utilities

use super::message::{make_header, standard_reason, SipError, SipMethod, SipRequest, SipResponse};
use super::transaction::TransactionId;
use rand::Rng;
use rsip::prelude::*;
use rsip::{Header, Headers, Request, Response, StatusCode, Uri, Version};

/// Format a Via value for UDP with rport requested
pub fn via_value(sent_by: &str, branch: &str) -> String {
    format!("SIP/2.0/UDP {};branch={};rport", sent_by, branch)
}

/// Format a name-addr (`"Display" <uri>;tag=x`)
pub fn name_addr(display: Option<&str>, uri: &str, tag: Option<&str>) -> String {
    let mut value = match display.filter(|d| !d.is_empty()) {
        Some(display) => format!("\"{}\" <{}>", display.replace('"', ""), uri),
        None => format!("<{}>", uri),
    };
    if let Some(tag) = tag {
        value.push_str(";tag=");
        value.push_str(tag);
    }
    value
}

/// Random tag for From/To headers
pub fn generate_tag() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

/// Random Call-ID scoped to the advertised host
pub fn generate_call_id(host: &str) -> String {
    let id: u64 = rand::thread_rng().gen();
    format!("{:016x}@{}", id, host)
}

/// Builds outbound requests.
///
/// Mandatory headers are rendered in a fixed order (Via, Max-Forwards, From,
/// To, Call-ID, CSeq, Contact) followed by extra headers in insertion order.
/// Output is deterministic for identical inputs, except that a fresh branch is
/// generated when none was supplied.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: SipMethod,
    uri: String,
    sent_by: Option<String>,
    branch: Option<String>,
    via: Option<String>,
    from: Option<String>,
    to: Option<String>,
    call_id: Option<String>,
    cseq: Option<u32>,
    contact: Option<String>,
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    body: Vec<u8>,
}

const MAX_FORWARDS: u8 = 70;

impl RequestBuilder {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            sent_by: None,
            branch: None,
            via: None,
            from: None,
            to: None,
            call_id: None,
            cseq: None,
            contact: None,
            headers: Vec::new(),
            content_type: None,
            body: Vec::new(),
        }
    }

    /// Via sent-by (`host:port`); the branch is generated unless set
    pub fn via(mut self, sent_by: impl Into<String>) -> Self {
        self.sent_by = Some(sent_by.into());
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Use a complete Via value verbatim (ACK for a non-2xx final)
    pub fn raw_via(mut self, via: impl Into<String>) -> Self {
        self.via = Some(via.into());
        self
    }

    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn cseq(mut self, seq: u32) -> Self {
        self.cseq = Some(seq);
        self
    }

    pub fn contact(mut self, uri: impl Into<String>) -> Self {
        self.contact = Some(uri.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.content_type = Some(content_type.into());
        self.body = body.into();
        self
    }

    pub fn build(self) -> Result<SipRequest, SipError> {
        let uri = Uri::try_from(self.uri.as_str())?;
        let via = match (self.via, self.sent_by) {
            (Some(via), _) => via,
            (None, Some(sent_by)) => {
                let branch = self
                    .branch
                    .unwrap_or_else(|| TransactionId::generate().0);
                via_value(&sent_by, &branch)
            }
            (None, None) => return Err(missing("Via")),
        };
        let from = self.from.ok_or_else(|| missing("From"))?;
        let to = self.to.ok_or_else(|| missing("To"))?;
        let call_id = self.call_id.ok_or_else(|| missing("Call-ID"))?;
        let cseq = self.cseq.ok_or_else(|| missing("CSeq"))?;

        let mut headers = Headers::default();
        headers.push(Header::Via(via.into()));
        headers.push(Header::MaxForwards(MAX_FORWARDS.to_string().into()));
        headers.push(Header::From(from.into()));
        headers.push(Header::To(to.into()));
        headers.push(Header::CallId(call_id.into()));
        headers.push(Header::CSeq(format!("{} {}", cseq, self.method).into()));
        if let Some(contact) = self.contact {
            headers.push(Header::Contact(format!("<{}>", contact).into()));
        }
        for (name, value) in self.headers {
            headers.push(make_header(&name, value));
        }
        if let Some(content_type) = self.content_type {
            headers.push(Header::ContentType(content_type.into()));
        }

        Ok(SipRequest::new(Request {
            method: self.method.to_rsip(),
            uri,
            version: Version::V2,
            headers,
            body: self.body,
        }))
    }
}

fn missing(header: &str) -> SipError {
    SipError::InvalidMessage(format!("Missing mandatory header: {}", header))
}

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    to_tag: Option<String>,
    headers: Vec<(String, String)>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            to_tag: None,
            headers: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    /// Tag added to To when the request carried none
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> SipResponse {
        let mut headers = Headers::default();

        // Copy essential headers from request
        let request_to_tag = request.to_tag();
        for header in request.headers().iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    headers.push(header.clone());
                }
                Header::To(to) => match (&self.to_tag, &request_to_tag) {
                    (Some(tag), None) => {
                        headers.push(Header::To(format!("{};tag={}", to.value(), tag).into()))
                    }
                    _ => headers.push(header.clone()),
                },
                _ => {}
            }
        }
        for (name, value) in self.headers {
            headers.push(make_header(&name, value));
        }

        let reason = standard_reason(self.status_code).unwrap_or("Unknown");
        SipResponse::new(Response {
            status_code: StatusCode::Other(self.status_code, reason.to_string()),
            version: Version::V2,
            headers,
            body: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::{header_parts, SipMessage};

    fn options_builder() -> RequestBuilder {
        RequestBuilder::new(SipMethod::Options, "sip:trunk.example.net:5060")
            .via("10.0.0.5:5070")
            .branch("z9hG4bKfixed")
            .from(name_addr(None, "sip:1001@trunk.example.net", Some("abc")))
            .to(name_addr(None, "sip:trunk.example.net", None))
            .call_id("opt-1")
            .cseq(1)
            .contact("sip:1001@10.0.0.5:5070")
    }

    #[test]
    fn test_build_request_header_order() {
        let req = options_builder()
            .header("User-Agent", "sipdialer")
            .build()
            .unwrap();
        let text = String::from_utf8(req.to_bytes().to_vec()).unwrap();
        let expected = "OPTIONS sip:trunk.example.net:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.5:5070;branch=z9hG4bKfixed;rport\r\n\
Max-Forwards: 70\r\n\
From: <sip:1001@trunk.example.net>;tag=abc\r\n\
To: <sip:trunk.example.net>\r\n\
Call-ID: opt-1\r\n\
CSeq: 1 OPTIONS\r\n\
Contact: <sip:1001@10.0.0.5:5070>\r\n\
User-Agent: sipdialer\r\n\
Content-Length: 0\r\n\r\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_build_is_deterministic_with_fixed_branch() {
        let a = options_builder().build().unwrap().to_bytes();
        let b = options_builder().build().unwrap().to_bytes();
        assert_eq!(a, b);
    }

    #[test]
    fn test_generated_branch_has_magic_cookie() {
        let req = RequestBuilder::new(SipMethod::Bye, "sip:x@y")
            .via("10.0.0.5:5070")
            .from("<sip:a@b>;tag=1")
            .to("<sip:x@y>;tag=2")
            .call_id("c")
            .cseq(2)
            .build()
            .unwrap();
        assert!(req.branch().unwrap().starts_with("z9hG4bK"));
        assert_eq!(req.header("Max-Forwards").as_deref(), Some("70"));
    }

    #[test]
    fn test_missing_mandatory_header() {
        let result = RequestBuilder::new(SipMethod::Bye, "sip:x@y")
            .via("10.0.0.5:5070")
            .call_id("c")
            .cseq(2)
            .build();
        assert!(matches!(result, Err(SipError::InvalidMessage(_))));
    }

    #[test]
    fn test_body_round_trips_through_parser() {
        let req = options_builder()
            .body("application/dtmf-relay", "Signal=1\r\nDuration=100\r\n")
            .build()
            .unwrap();
        let parsed = SipMessage::parse(&req.to_bytes()).unwrap();
        let parsed = parsed.as_request().unwrap();
        assert_eq!(
            parsed.header("Content-Type").as_deref(),
            Some("application/dtmf-relay")
        );
        assert_eq!(parsed.header("Content-Length").as_deref(), Some("24"));
        assert_eq!(parsed.body_str(), "Signal=1\r\nDuration=100\r\n");
    }

    #[test]
    fn test_invite_survives_render_and_parse() {
        let sdp = "v=0\r\n\
o=sipdialer 1 1 IN IP4 10.0.0.5\r\n\
s=sipdialer\r\n\
c=IN IP4 10.0.0.5\r\n\
t=0 0\r\n\
m=audio 8000 RTP/AVP 0 8 101\r\n";
        let invite = RequestBuilder::new(SipMethod::Invite, "sip:15551234567@trunk.example.net")
            .via("10.0.0.5:5070")
            .branch("z9hG4bKinv1")
            .from(name_addr(
                Some("Front Desk"),
                "sip:1001@trunk.example.net",
                Some("f1"),
            ))
            .to(name_addr(None, "sip:15551234567@trunk.example.net", None))
            .call_id("inv-1@10.0.0.5")
            .cseq(2)
            .contact("sip:1001@10.0.0.5:5070")
            .header(
                "Authorization",
                r#"Digest username="1001", realm="magnus", nonce="n1", uri="sip:15551234567@trunk.example.net", response="0123456789abcdef0123456789abcdef", algorithm=MD5"#,
            )
            .header("User-Agent", "sipdialer")
            .body("application/sdp", sdp)
            .build()
            .unwrap();

        let parsed = SipRequest::parse(&invite.to_bytes()).unwrap();
        assert_eq!(parsed.method(), SipMethod::Invite);
        assert_eq!(parsed.uri(), invite.uri());

        let lowered = |req: &SipRequest| {
            req.headers()
                .iter()
                .map(header_parts)
                .map(|(name, value)| (name.to_ascii_lowercase(), value))
                .collect::<Vec<_>>()
        };
        let mut expected = lowered(&invite);
        expected.push(("content-length".to_string(), sdp.len().to_string()));
        assert_eq!(lowered(&parsed), expected);
        assert_eq!(parsed.body(), sdp.as_bytes());
    }

    #[test]
    fn test_response_copies_dialog_headers_and_adds_tag() {
        let req = options_builder().build().unwrap();
        let resp = ResponseBuilder::ok()
            .to_tag("srv")
            .header("Allow", "INVITE, ACK, BYE")
            .build_for_request(&req);
        assert_eq!(resp.reason(), "OK");
        assert_eq!(resp.call_id(), Some("opt-1"));
        assert_eq!(resp.cseq(), Some((1, SipMethod::Options)));
        assert_eq!(resp.to_tag().as_deref(), Some("srv"));
        assert_eq!(
            resp.header("Via").as_deref(),
            Some("SIP/2.0/UDP 10.0.0.5:5070;branch=z9hG4bKfixed;rport")
        );
        assert!(resp.to_bytes().starts_with(b"SIP/2.0 200 OK\r\n"));
    }

    #[test]
    fn test_response_reason_for_unlisted_code() {
        let req = options_builder().build().unwrap();
        let resp = ResponseBuilder::new(499).build_for_request(&req);
        assert_eq!(resp.status_code(), 499);
        assert_eq!(resp.reason(), "Unknown");
    }

    #[test]
    fn test_name_addr() {
        assert_eq!(
            name_addr(Some("Front Desk"), "sip:1001@h", Some("t1")),
            "\"Front Desk\" <sip:1001@h>;tag=t1"
        );
        assert_eq!(name_addr(Some(""), "sip:1001@h", None), "<sip:1001@h>");
    }
}
