//! SIP Digest Authentication (RFC 2617, RFC 3261), client side

use super::message::{SipError, SipResponse};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Digest hash algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    fn parse(value: &str) -> Result<Self, SipError> {
        match value.to_ascii_uppercase().as_str() {
            "MD5" => Ok(DigestAlgorithm::Md5),
            "SHA-256" => Ok(DigestAlgorithm::Sha256),
            other => Err(SipError::Authentication(format!(
                "Unsupported digest algorithm: {}",
                other
            ))),
        }
    }

    fn hash(&self, input: &str) -> String {
        match self {
            DigestAlgorithm::Md5 => format!("{:x}", md5::compute(input)),
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestAlgorithm::Md5 => write!(f, "MD5"),
            DigestAlgorithm::Sha256 => write!(f, "SHA-256"),
        }
    }
}

/// Which header carried the challenge, and so which header answers it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// 401 with WWW-Authenticate, answered by Authorization
    Www,
    /// 407 with Proxy-Authenticate, answered by Proxy-Authorization
    Proxy,
}

impl ChallengeKind {
    pub fn challenge_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "WWW-Authenticate",
            ChallengeKind::Proxy => "Proxy-Authenticate",
        }
    }

    pub fn authorization_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "Authorization",
            ChallengeKind::Proxy => "Proxy-Authorization",
        }
    }
}

/// Authentication challenge received from the trunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub kind: ChallengeKind,
    pub realm: String,
    pub nonce: String,
    pub algorithm: DigestAlgorithm,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

impl AuthChallenge {
    /// Parse a `Digest ...` challenge value
    pub fn parse(kind: ChallengeKind, value: &str) -> Result<Self, SipError> {
        let params = parse_digest_params(value)?;

        let realm = params
            .get("realm")
            .cloned()
            .ok_or_else(|| SipError::Authentication("Challenge without realm".to_string()))?;
        let nonce = params
            .get("nonce")
            .cloned()
            .ok_or_else(|| SipError::Authentication("Challenge without nonce".to_string()))?;
        let algorithm = match params.get("algorithm") {
            Some(alg) => DigestAlgorithm::parse(alg)?,
            None => DigestAlgorithm::Md5,
        };

        // Only qop=auth is supported; auth-int is ignored when offered alongside it
        let qop = match params.get("qop") {
            Some(offered) => {
                if offered.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")) {
                    Some("auth".to_string())
                } else {
                    return Err(SipError::Authentication(format!(
                        "Unsupported qop: {}",
                        offered
                    )));
                }
            }
            None => None,
        };

        Ok(Self {
            kind,
            realm,
            nonce,
            algorithm,
            qop,
            opaque: params.get("opaque").cloned(),
        })
    }

    /// Extract the challenge from a 401 or 407 response
    pub fn from_response(response: &SipResponse) -> Result<Self, SipError> {
        let kind = match response.status_code() {
            401 => ChallengeKind::Www,
            407 => ChallengeKind::Proxy,
            code => {
                return Err(SipError::Authentication(format!(
                    "Status {} is not an authentication challenge",
                    code
                )))
            }
        };
        let mut last_err = SipError::Authentication(format!(
            "{} response without {} header",
            response.status_code(),
            kind.challenge_header()
        ));
        for value in response.header_values(kind.challenge_header()) {
            match Self::parse(kind, &value) {
                Ok(challenge) => return Ok(challenge),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

/// Split a Digest header value into its parameters.
///
/// Commas inside quoted strings do not separate parameters.
pub fn parse_digest_params(value: &str) -> Result<HashMap<String, String>, SipError> {
    let value = value.trim();
    let rest = match value.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("Digest ") => &value[7..],
        _ => {
            return Err(SipError::Authentication(format!(
                "Not a Digest header: {}",
                value
            )))
        }
    };

    let mut params = HashMap::new();
    let mut in_quotes = false;
    let mut start = 0;
    let mut parts = Vec::new();
    for (i, c) in rest.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&rest[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&rest[start..]);

    for part in parts {
        if let Some((key, val)) = part.split_once('=') {
            let val = val.trim().trim_matches('"');
            params.insert(key.trim().to_ascii_lowercase(), val.to_string());
        }
    }

    Ok(params)
}

/// Digest response for a challenge without qop:
/// `H(H(user:realm:secret):nonce:H(method:uri))`
pub fn challenge_response(
    algorithm: DigestAlgorithm,
    username: &str,
    realm: &str,
    secret: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = algorithm.hash(&format!("{}:{}:{}", username, realm, secret));
    let ha2 = algorithm.hash(&format!("{}:{}", method, uri));
    algorithm.hash(&format!("{}:{}:{}", ha1, nonce, ha2))
}

/// Digest response with qop: `H(HA1:nonce:nc:cnonce:qop:HA2)`
#[allow(clippy::too_many_arguments)]
pub fn challenge_response_qop(
    algorithm: DigestAlgorithm,
    username: &str,
    realm: &str,
    secret: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
    qop: &str,
) -> String {
    let ha1 = algorithm.hash(&format!("{}:{}:{}", username, realm, secret));
    let ha2 = algorithm.hash(&format!("{}:{}", method, uri));
    algorithm.hash(&format!(
        "{}:{}:{}:{}:{}:{}",
        ha1, nonce, nc, cnonce, qop, ha2
    ))
}

/// Credentials configured for the trunk
#[derive(Clone)]
pub struct DigestCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for DigestCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl DigestCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Authorization value carrying only the username, sent before any challenge
    pub fn empty_authorization(&self, realm: &str, uri: &str) -> String {
        format!(
            r#"Digest username="{}", realm="{}", nonce="", uri="{}", response="""#,
            self.username, realm, uri
        )
    }

    /// Answer a challenge; returns (header name, header value)
    pub fn authorize(
        &self,
        challenge: &AuthChallenge,
        method: &str,
        uri: &str,
    ) -> (&'static str, String) {
        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}""#,
            self.username, challenge.realm, challenge.nonce, uri
        );

        match &challenge.qop {
            Some(qop) => {
                let cnonce = generate_cnonce();
                let nc = "00000001";
                let response = challenge_response_qop(
                    challenge.algorithm,
                    &self.username,
                    &challenge.realm,
                    &self.password,
                    method,
                    uri,
                    &challenge.nonce,
                    nc,
                    &cnonce,
                    qop,
                );
                value.push_str(&format!(
                    r#", response="{}", qop={}, nc={}, cnonce="{}""#,
                    response, qop, nc, cnonce
                ));
            }
            None => {
                let response = challenge_response(
                    challenge.algorithm,
                    &self.username,
                    &challenge.realm,
                    &self.password,
                    method,
                    uri,
                    &challenge.nonce,
                );
                value.push_str(&format!(r#", response="{}""#, response));
            }
        }

        value.push_str(&format!(", algorithm={}", challenge.algorithm));
        if let Some(opaque) = &challenge.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }

        debug!(
            "Answering {} challenge for realm {}",
            challenge.kind.challenge_header(),
            challenge.realm
        );
        (challenge.kind.authorization_header(), value)
    }
}

fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 8] = rng.gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::SipMessage;

    #[test]
    fn test_parse_digest_params() {
        let params = parse_digest_params(
            r#"Digest realm="magnus", nonce="abc,def", qop="auth,auth-int", algorithm=MD5"#,
        )
        .unwrap();
        assert_eq!(params.get("realm"), Some(&"magnus".to_string()));
        assert_eq!(params.get("nonce"), Some(&"abc,def".to_string()));
        assert_eq!(params.get("qop"), Some(&"auth,auth-int".to_string()));
        assert_eq!(params.get("algorithm"), Some(&"MD5".to_string()));
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(parse_digest_params(r#"Basic realm="x""#).is_err());
    }

    #[test]
    fn test_rfc2617_reference_vectors() {
        let plain = challenge_response(
            DigestAlgorithm::Md5,
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
        );
        assert_eq!(plain, "670fd8c2df070c60b045671b8b24ff02");

        let with_qop = challenge_response_qop(
            DigestAlgorithm::Md5,
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "00000001",
            "0a4f113b",
            "auth",
        );
        assert_eq!(with_qop, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_register_response_md5_and_sha256() {
        let md5 = challenge_response(
            DigestAlgorithm::Md5,
            "1001",
            "magnus",
            "s3cret",
            "REGISTER",
            "sip:trunk.example.net:5060",
            "abc123nonce",
        );
        assert_eq!(md5, "8d9784c00ae3e7faae403bc31a939307");

        let sha = challenge_response(
            DigestAlgorithm::Sha256,
            "1001",
            "magnus",
            "s3cret",
            "REGISTER",
            "sip:trunk.example.net:5060",
            "abc123nonce",
        );
        assert_eq!(
            sha,
            "e5b5681d59a8697a3158999b4c8712d4e0e5a196c41e5d8f45146d344bdc61a0"
        );
    }

    #[test]
    fn test_authorize_without_qop() {
        let challenge = AuthChallenge::parse(
            ChallengeKind::Www,
            r#"Digest realm="magnus", nonce="abc123nonce", opaque="xyz""#,
        )
        .unwrap();
        let creds = DigestCredentials::new("1001", "s3cret");
        let (name, value) = creds.authorize(&challenge, "REGISTER", "sip:trunk.example.net:5060");
        assert_eq!(name, "Authorization");
        assert_eq!(
            value,
            r#"Digest username="1001", realm="magnus", nonce="abc123nonce", uri="sip:trunk.example.net:5060", response="8d9784c00ae3e7faae403bc31a939307", algorithm=MD5, opaque="xyz""#
        );
    }

    #[test]
    fn test_authorize_with_qop_uses_cnonce() {
        let challenge = AuthChallenge::parse(
            ChallengeKind::Proxy,
            r#"Digest realm="magnus", nonce="n1", qop="auth""#,
        )
        .unwrap();
        let creds = DigestCredentials::new("1001", "s3cret");
        let (name, value) = creds.authorize(&challenge, "INVITE", "sip:555@trunk");
        assert_eq!(name, "Proxy-Authorization");

        let params = parse_digest_params(&value).unwrap();
        let cnonce = params.get("cnonce").unwrap();
        assert_eq!(params.get("nc"), Some(&"00000001".to_string()));
        let expected = challenge_response_qop(
            DigestAlgorithm::Md5,
            "1001",
            "magnus",
            "s3cret",
            "INVITE",
            "sip:555@trunk",
            "n1",
            "00000001",
            cnonce,
            "auth",
        );
        assert_eq!(params.get("response"), Some(&expected));
    }

    #[test]
    fn test_challenge_from_407_response() {
        let data = b"SIP/2.0 407 Proxy Authentication Required\r\n\
Via: SIP/2.0/UDP 10.0.0.5:5070;branch=z9hG4bKa\r\n\
Call-ID: c1\r\n\
CSeq: 1 INVITE\r\n\
Proxy-Authenticate: Digest realm=\"magnus\", nonce=\"77\", algorithm=SHA-256\r\n\r\n";
        let msg = SipMessage::parse(data).unwrap();
        let challenge = AuthChallenge::from_response(msg.as_response().unwrap()).unwrap();
        assert_eq!(challenge.kind, ChallengeKind::Proxy);
        assert_eq!(challenge.algorithm, DigestAlgorithm::Sha256);
        assert_eq!(challenge.nonce, "77");
    }

    #[test]
    fn test_challenge_missing_nonce() {
        assert!(matches!(
            AuthChallenge::parse(ChallengeKind::Www, r#"Digest realm="magnus""#),
            Err(SipError::Authentication(_))
        ));
    }

    #[test]
    fn test_debug_hides_password() {
        let creds = DigestCredentials::new("1001", "s3cret");
        assert!(!format!("{:?}", creds).contains("s3cret"));
    }
}
