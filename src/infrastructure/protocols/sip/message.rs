//! SIP message types and parsing

use bytes::{BufMut, Bytes, BytesMut};
use rsip::prelude::*;
use rsip::{Header, Headers, Method, Param, Request, Response, StatusCode, Uri};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
        }
    }

    pub fn from_rsip(method: &Method) -> Self {
        match method {
            Method::Register => SipMethod::Register,
            Method::Invite => SipMethod::Invite,
            Method::Ack => SipMethod::Ack,
            Method::Cancel => SipMethod::Cancel,
            Method::Bye => SipMethod::Bye,
            Method::Options => SipMethod::Options,
            Method::Info => SipMethod::Info,
            Method::Update => SipMethod::Update,
            Method::PRack => SipMethod::Prack,
            Method::Subscribe => SipMethod::Subscribe,
            Method::Notify => SipMethod::Notify,
            Method::Refer => SipMethod::Refer,
            Method::Message => SipMethod::Message,
            Method::Publish => SipMethod::Publish,
        }
    }

    pub fn to_rsip(&self) -> Method {
        match self {
            SipMethod::Register => Method::Register,
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Bye => Method::Bye,
            SipMethod::Options => Method::Options,
            SipMethod::Info => Method::Info,
            SipMethod::Update => Method::Update,
            SipMethod::Prack => Method::PRack,
            SipMethod::Subscribe => Method::Subscribe,
            SipMethod::Notify => Method::Notify,
            SipMethod::Refer => Method::Refer,
            SipMethod::Message => Method::Message,
            SipMethod::Publish => Method::Publish,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Headers that may legitimately appear more than once. Every other header
/// keeps its first occurrence only.
const REPEATABLE_HEADERS: &[&str] = &[
    "via",
    "route",
    "record-route",
    "contact",
    "www-authenticate",
    "proxy-authenticate",
    "authorization",
    "proxy-authorization",
    "allow",
    "supported",
    "accept",
];

fn expand_compact(name: &str) -> &str {
    match name {
        "i" | "I" => "Call-ID",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "v" | "V" => "Via",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "k" | "K" => "Supported",
        "s" | "S" => "Subject",
        _ => name,
    }
}

/// Build an rsip header from a name and a raw value.
///
/// Compact forms are expanded; names rsip has no variant for end up in
/// `Header::Other` with the name as given.
pub fn make_header(name: &str, value: impl Into<String>) -> Header {
    let value = value.into();
    let name = expand_compact(name);
    match name.to_ascii_lowercase().as_str() {
        "via" => Header::Via(value.into()),
        "max-forwards" => Header::MaxForwards(value.into()),
        "from" => Header::From(value.into()),
        "to" => Header::To(value.into()),
        "call-id" => Header::CallId(value.into()),
        "cseq" => Header::CSeq(value.into()),
        "contact" => Header::Contact(value.into()),
        "route" => Header::Route(value.into()),
        "record-route" => Header::RecordRoute(value.into()),
        "expires" => Header::Expires(value.into()),
        "allow" => Header::Allow(value.into()),
        "supported" => Header::Supported(value.into()),
        "accept" => Header::Accept(value.into()),
        "authorization" => Header::Authorization(value.into()),
        "proxy-authorization" => Header::ProxyAuthorization(value.into()),
        "www-authenticate" => Header::WwwAuthenticate(value.into()),
        "proxy-authenticate" => Header::ProxyAuthenticate(value.into()),
        "content-type" => Header::ContentType(value.into()),
        "content-length" => Header::ContentLength(value.into()),
        "user-agent" => Header::UserAgent(value.into()),
        "server" => Header::Server(value.into()),
        "subject" => Header::Subject(value.into()),
        _ => Header::Other(name.to_string(), value),
    }
}

/// Name and value of a header as they appear on the wire
pub fn header_parts(header: &Header) -> (String, String) {
    match header {
        Header::Other(name, value) => (name.clone(), value.trim().to_string()),
        typed => {
            let line = typed.to_string();
            match line.split_once(':') {
                Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
                None => (line, String::new()),
            }
        }
    }
}

fn values_named(headers: &Headers, name: &str) -> Vec<String> {
    headers
        .iter()
        .map(header_parts)
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
        .collect()
}

fn cseq_of(headers: &Headers) -> Option<(u32, SipMethod)> {
    headers.iter().find_map(|h| match h {
        Header::CSeq(cseq) => {
            let seq = cseq.seq().ok()?;
            let method = cseq.method().ok()?;
            Some((seq, SipMethod::from_rsip(&method)))
        }
        _ => None,
    })
}

fn call_id_of(headers: &Headers) -> Option<&str> {
    headers.iter().find_map(|h| match h {
        Header::CallId(call_id) => Some(call_id.value()),
        _ => None,
    })
}

fn from_tag_of(headers: &Headers) -> Option<String> {
    headers.iter().find_map(|h| match h {
        Header::From(from) => from.tag().ok().flatten().map(|t| t.to_string()),
        _ => None,
    })
}

fn to_tag_of(headers: &Headers) -> Option<String> {
    headers.iter().find_map(|h| match h {
        Header::To(to) => to.tag().ok().flatten().map(|t| t.to_string()),
        _ => None,
    })
}

fn top_via_params(headers: &Headers) -> Vec<Param> {
    headers
        .iter()
        .find_map(|h| match h {
            Header::Via(via) => Some(via.params().unwrap_or_default()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Serialize head and body; Content-Length always reflects the actual body
fn render(start_line: String, headers: &Headers, body: &[u8]) -> Bytes {
    let mut headers = headers.clone();
    headers.unique_push(Header::ContentLength(body.len().to_string().into()));

    let head = format!("{}\r\n{}\r\n", start_line, headers);
    let mut buf = BytesMut::with_capacity(head.len() + body.len());
    buf.put_slice(head.as_bytes());
    buf.put_slice(body);
    buf.freeze()
}

/// SIP Request wrapper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        match SipMessage::parse(data)? {
            SipMessage::Request(request) => Ok(request),
            SipMessage::Response(_) => Err(SipError::ParseError(
                "Expected a request, got a response".to_string(),
            )),
        }
    }

    pub fn method(&self) -> SipMethod {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    /// First value for `name`, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<String> {
        values_named(&self.inner.headers, name).into_iter().next()
    }

    pub fn header_values(&self, name: &str) -> Vec<String> {
        values_named(&self.inner.headers, name)
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.inner.body).unwrap_or("")
    }

    pub fn call_id(&self) -> Option<&str> {
        call_id_of(&self.inner.headers)
    }

    pub fn cseq(&self) -> Option<(u32, SipMethod)> {
        cseq_of(&self.inner.headers)
    }

    pub fn from_tag(&self) -> Option<String> {
        from_tag_of(&self.inner.headers)
    }

    pub fn to_tag(&self) -> Option<String> {
        to_tag_of(&self.inner.headers)
    }

    /// Branch parameter of the topmost Via
    pub fn branch(&self) -> Option<String> {
        top_via_params(&self.inner.headers)
            .into_iter()
            .find_map(|p| match p {
                Param::Branch(branch) => Some(branch.to_string()),
                _ => None,
            })
    }

    pub fn to_bytes(&self) -> Bytes {
        let start_line = format!(
            "{} {} {}",
            self.inner.method, self.inner.uri, self.inner.version
        );
        render(start_line, &self.inner.headers, &self.inner.body)
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// Standard reason phrase for a status code, when it has one we know
pub fn standard_reason(status_code: u16) -> Option<&'static str> {
    let reason = match status_code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        484 => "Address Incomplete",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        600 => "Busy Everywhere",
        603 => "Decline",
        604 => "Does Not Exist Anywhere",
        606 => "Not Acceptable",
        _ => return None,
    };
    Some(reason)
}

/// SIP Response wrapper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        match SipMessage::parse(data)? {
            SipMessage::Response(response) => Ok(response),
            SipMessage::Request(_) => Err(SipError::ParseError(
                "Expected a response, got a request".to_string(),
            )),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.code()
    }

    /// Reason phrase. rsip keeps the phrase only for codes it has no name
    /// for, so well-known codes report their standard phrase.
    pub fn reason(&self) -> String {
        match &self.inner.status_code {
            StatusCode::Other(_, reason) => reason.clone(),
            known => standard_reason(known.code())
                .map(str::to_string)
                .unwrap_or_else(|| {
                    let line = known.to_string();
                    line.split_once(' ')
                        .map(|(_, name)| name.to_string())
                        .unwrap_or_default()
                }),
        }
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.inner.headers
    }

    /// First value for `name`, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<String> {
        values_named(&self.inner.headers, name).into_iter().next()
    }

    pub fn header_values(&self, name: &str) -> Vec<String> {
        values_named(&self.inner.headers, name)
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn call_id(&self) -> Option<&str> {
        call_id_of(&self.inner.headers)
    }

    pub fn cseq(&self) -> Option<(u32, SipMethod)> {
        cseq_of(&self.inner.headers)
    }

    pub fn from_tag(&self) -> Option<String> {
        from_tag_of(&self.inner.headers)
    }

    pub fn to_tag(&self) -> Option<String> {
        to_tag_of(&self.inner.headers)
    }

    /// Parameters of the topmost Via
    pub fn via_params(&self) -> Vec<Param> {
        top_via_params(&self.inner.headers)
    }

    pub fn to_bytes(&self) -> Bytes {
        let start_line = format!("{} {}", self.inner.version, self.inner.status_code);
        render(start_line, &self.inner.headers, &self.inner.body)
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// Parse a datagram into a request or response.
    ///
    /// Folded continuation lines are joined and bare LF line endings accepted
    /// before rsip sees the message. Compact header names are expanded and
    /// non-repeating headers keep their first occurrence. Messages without
    /// Call-ID or a well-formed CSeq are rejected since nothing can be matched
    /// against them.
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let framed = frame(data)?;
        let message = match rsip::SipMessage::try_from(framed.as_slice())? {
            rsip::SipMessage::Request(mut request) => {
                request.headers = normalize_headers(request.headers);
                apply_content_length(&request.headers, &mut request.body)?;
                SipMessage::Request(SipRequest::new(request))
            }
            rsip::SipMessage::Response(mut response) => {
                response.headers = normalize_headers(response.headers);
                apply_content_length(&response.headers, &mut response.body)?;
                SipMessage::Response(SipResponse::new(response))
            }
        };

        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<(), SipError> {
        let headers = match self {
            SipMessage::Request(req) => req.headers(),
            SipMessage::Response(resp) => resp.headers(),
        };
        if call_id_of(headers).is_none() {
            return Err(SipError::InvalidMessage("Missing Call-ID header".to_string()));
        }
        if cseq_of(headers).is_none() {
            return Err(SipError::InvalidMessage(
                "Missing or malformed CSeq header".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            SipMessage::Request(req) => req.call_id(),
            SipMessage::Response(resp) => resp.call_id(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

/// Re-frame the header section with CRLF line endings and folded lines
/// joined, since rsip accepts neither folding nor bare LF.
fn frame(data: &[u8]) -> Result<Vec<u8>, SipError> {
    let (head, body) = match data.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => (&data[..pos], &data[pos + 4..]),
        None => match data.windows(2).position(|w| w == b"\n\n") {
            Some(pos) => (&data[..pos], &data[pos + 2..]),
            None => (data, &data[data.len()..]),
        },
    };
    let head = std::str::from_utf8(head)
        .map_err(|e| SipError::ParseError(format!("Non UTF-8 header section: {}", e)))?;

    let mut lines: Vec<String> = Vec::new();
    for raw in head.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if raw.starts_with(' ') || raw.starts_with('\t') {
            if let Some(last) = lines.last_mut() {
                last.push(' ');
                last.push_str(raw.trim());
                continue;
            }
        }
        lines.push(raw.to_string());
    }
    if lines.first().map_or(true, |l| l.trim().is_empty()) {
        return Err(SipError::ParseError("Empty message".to_string()));
    }

    let mut framed = Vec::with_capacity(data.len() + 4);
    for line in &lines {
        framed.extend_from_slice(line.as_bytes());
        framed.extend_from_slice(b"\r\n");
    }
    framed.extend_from_slice(b"\r\n");
    framed.extend_from_slice(body);
    Ok(framed)
}

/// Expand compact names and drop repeats of headers that may appear once
fn normalize_headers(headers: Headers) -> Headers {
    let mut seen = HashSet::new();
    let kept: Vec<Header> = headers
        .into_iter()
        .map(|header| match header {
            Header::Other(name, value) if name.len() == 1 => make_header(&name, value),
            other => other,
        })
        .filter(|header| {
            let (name, _) = header_parts(header);
            let name = name.to_ascii_lowercase();
            REPEATABLE_HEADERS.contains(&name.as_str()) || seen.insert(name)
        })
        .collect();
    Headers::from(kept)
}

/// Trim the body to Content-Length; a declared length past the end of the
/// datagram means the message was cut short.
fn apply_content_length(headers: &Headers, body: &mut Vec<u8>) -> Result<(), SipError> {
    let declared = headers.iter().find_map(|h| match h {
        Header::ContentLength(len) => Some(len),
        _ => None,
    });
    let Some(declared) = declared else {
        return Ok(());
    };

    let len = declared
        .value()
        .trim()
        .parse::<usize>()
        .map_err(|_| SipError::ParseError(format!("Bad Content-Length: {}", declared.value())))?;
    if len > body.len() {
        return Err(SipError::ParseError(format!(
            "Content-Length {} exceeds the {} body bytes received",
            len,
            body.len()
        )));
    }
    body.truncate(len);
    Ok(())
}
