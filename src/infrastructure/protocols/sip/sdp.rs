//! SDP offer for the outbound call and the few answer fields the engine reads

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Payload type used for RFC 4733 telephone events
pub const TELEPHONE_EVENT_PT: u8 = 101;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub version: u32,
    pub origin: SdpOrigin,
    pub session_name: String,
    pub connection: Option<SdpConnection>,
    pub media: Vec<SdpMedia>,
}

/// `o=` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub address: SdpConnection,
}

/// `c=` line; also the address part of `o=`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpConnection {
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

/// `m=` section with its rtpmap and fmtp attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMedia {
    pub media_type: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    pub connection: Option<SdpConnection>,
    pub rtpmap: Vec<(String, String)>,
    pub fmtp: Vec<(String, String)>,
}

impl SdpConnection {
    fn for_ip(ip: IpAddr) -> Self {
        let address_type = if ip.is_ipv4() { "IP4" } else { "IP6" };
        Self {
            network_type: "IN".to_string(),
            address_type: address_type.to_string(),
            address: ip.to_string(),
        }
    }

    fn from_fields(fields: &[&str]) -> Option<Self> {
        match fields {
            [network_type, address_type, address, ..] => Some(Self {
                network_type: network_type.to_string(),
                address_type: address_type.to_string(),
                address: address.to_string(),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for SdpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.network_type, self.address_type, self.address)
    }
}

impl SdpOrigin {
    fn from_line(value: &str) -> Option<Self> {
        let fields: Vec<&str> = value.split_whitespace().collect();
        let [username, session_id, session_version, address @ ..] = fields.as_slice() else {
            return None;
        };
        Some(Self {
            username: username.to_string(),
            session_id: session_id.to_string(),
            session_version: session_version.to_string(),
            address: SdpConnection::from_fields(address)?,
        })
    }
}

impl SdpMedia {
    fn from_line(value: &str) -> Option<Self> {
        let mut fields = value.split_whitespace();
        let media_type = fields.next()?.to_string();
        // "port/count" is legal; only the port matters here
        let port = fields.next()?.split('/').next()?.parse().ok()?;
        let protocol = fields.next()?.to_string();
        let formats: Vec<String> = fields.map(str::to_string).collect();
        if formats.is_empty() {
            return None;
        }
        Some(Self {
            media_type,
            port,
            protocol,
            formats,
            connection: None,
            rtpmap: Vec::new(),
            fmtp: Vec::new(),
        })
    }

    fn add_attribute(&mut self, value: &str) {
        let pair = |rest: &str| {
            rest.split_once(' ')
                .map(|(pt, v)| (pt.to_string(), v.trim().to_string()))
        };
        if let Some(entry) = value.strip_prefix("rtpmap:").and_then(pair) {
            self.rtpmap.push(entry);
        } else if let Some(entry) = value.strip_prefix("fmtp:").and_then(pair) {
            self.fmtp.push(entry);
        }
    }
}

impl SdpSession {
    /// Audio offer: PCMU, PCMA and telephone-event for DTMF
    pub fn create_audio_session(local_ip: IpAddr, local_port: u16) -> Self {
        let session_id = chrono::Utc::now().timestamp().to_string();
        let formats = ["0", "8"]
            .iter()
            .map(|pt| pt.to_string())
            .chain(std::iter::once(TELEPHONE_EVENT_PT.to_string()))
            .collect();
        Self {
            version: 0,
            origin: SdpOrigin {
                username: "-".to_string(),
                session_id: session_id.clone(),
                session_version: session_id,
                address: SdpConnection::for_ip(local_ip),
            },
            session_name: "-".to_string(),
            connection: Some(SdpConnection::for_ip(local_ip)),
            media: vec![SdpMedia {
                media_type: "audio".to_string(),
                port: local_port,
                protocol: "RTP/AVP".to_string(),
                formats,
                connection: None,
                rtpmap: vec![
                    ("0".to_string(), "PCMU/8000".to_string()),
                    ("8".to_string(), "PCMA/8000".to_string()),
                    (TELEPHONE_EVENT_PT.to_string(), "telephone-event/8000".to_string()),
                ],
                fmtp: vec![(TELEPHONE_EVENT_PT.to_string(), "0-15".to_string())],
            }],
        }
    }

    /// Parse a session description; `None` without a usable `o=` line
    pub fn parse(body: &str) -> Option<Self> {
        let mut version = 0;
        let mut origin = None;
        let mut session_name = String::new();
        let mut connection = None;
        let mut media: Vec<SdpMedia> = Vec::new();

        for line in body.lines() {
            let Some((kind, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = value.trim();
            match kind {
                "v" => version = value.parse().unwrap_or(0),
                "o" => origin = SdpOrigin::from_line(value),
                "s" => session_name = value.to_string(),
                "c" => {
                    let fields: Vec<&str> = value.split_whitespace().collect();
                    let parsed = SdpConnection::from_fields(&fields);
                    // c= after an m= line belongs to that media section
                    match media.last_mut() {
                        Some(section) => section.connection = parsed,
                        None => connection = parsed,
                    }
                }
                "m" => media.extend(SdpMedia::from_line(value)),
                "a" => {
                    if let Some(section) = media.last_mut() {
                        section.add_attribute(value);
                    }
                }
                _ => {}
            }
        }

        Some(Self {
            version,
            origin: origin?,
            session_name,
            connection,
            media,
        })
    }

    pub fn audio_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    /// Numeric payload types offered for audio
    pub fn audio_codecs(&self) -> Vec<u8> {
        self.audio_media()
            .map(|audio| audio.formats.iter().filter_map(|f| f.parse().ok()).collect())
            .unwrap_or_default()
    }

    /// Where the peer expects audio, media-level connection first
    pub fn audio_endpoint(&self) -> Option<SocketAddr> {
        let audio = self.audio_media()?;
        let conn = audio.connection.as_ref().or(self.connection.as_ref())?;
        let ip: IpAddr = conn.address.parse().ok()?;
        Some(SocketAddr::new(ip, audio.port))
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = &self.origin;
        write!(f, "v={}\r\n", self.version)?;
        write!(
            f,
            "o={} {} {} {}\r\n",
            origin.username, origin.session_id, origin.session_version, origin.address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(conn) = &self.connection {
            write!(f, "c={}\r\n", conn)?;
        }
        write!(f, "t=0 0\r\n")?;

        for section in &self.media {
            write!(
                f,
                "m={} {} {} {}\r\n",
                section.media_type,
                section.port,
                section.protocol,
                section.formats.join(" ")
            )?;
            if let Some(conn) = &section.connection {
                write!(f, "c={}\r\n", conn)?;
            }
            for (pt, encoding) in &section.rtpmap {
                write!(f, "a=rtpmap:{} {}\r\n", pt, encoding)?;
            }
            for (pt, params) in &section.fmtp {
                write!(f, "a=fmtp:{} {}\r\n", pt, params)?;
            }
            write!(f, "a=sendrecv\r\n")?;
        }
        Ok(())
    }
}
