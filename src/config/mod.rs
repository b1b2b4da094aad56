//! Configuration management
//!
//! Sources, later ones winning: built-in defaults, an optional TOML file,
//! `SIPDIALER__SECTION__KEY` environment variables, then the flat `SIP_*`
//! variables for the trunk account.

use crate::domain::shared::{Result, SessionError};
use crate::infrastructure::protocols::sip::SipTimers;
use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Flat environment variables mapped onto the `sip` section
const LEGACY_ENV: &[(&str, &str)] = &[
    ("SIP_HOST", "sip.host"),
    ("SIP_PORT", "sip.port"),
    ("SIP_USERNAME", "sip.username"),
    ("SIP_PASSWORD", "sip.password"),
    ("SIP_DOMAIN", "sip.domain"),
    ("SIP_CALLER_ID", "sip.caller_id"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sip: SipTrunkConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

/// Trunk account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SipTrunkConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Realm and identity domain
    pub domain: String,
    /// Display name presented on outbound calls
    pub caller_id: String,
    /// Requested registration lifetime in seconds
    pub expires: u32,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub bind_address: IpAddr,
    /// T1, the first retransmission interval
    pub transaction_timeout_ms: u64,
    pub max_retries: u32,
    pub dtmf_duration_ms: u64,
    /// RTP port advertised in the SDP offer
    pub rtp_port: u16,
    pub event_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing filter directive, e.g. `info` or `sipdialer=debug`
    pub level: String,
}

impl Default for SipTrunkConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 5060,
            username: String::new(),
            password: String::new(),
            domain: String::new(),
            caller_id: String::new(),
            expires: 300,
            user_agent: format!("sipdialer/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            transaction_timeout_ms: 500,
            max_retries: 6,
            dtmf_duration_ms: 100,
            rtp_port: 8000,
            event_capacity: 64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, ConfigError> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    /// Same as [`Config::load`] with a custom lookup for the flat `SIP_*` variables
    pub fn load_with(
        path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> std::result::Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("SIPDIALER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder = apply_legacy_env(builder, lookup)?;
        builder.build()?.try_deserialize()
    }

    /// Copy with the password masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.sip.password.is_empty() {
            copy.sip.password = "********".to_string();
        }
        copy
    }
}

fn apply_legacy_env(
    mut builder: ConfigBuilder<DefaultState>,
    lookup: impl Fn(&str) -> Option<String>,
) -> std::result::Result<ConfigBuilder<DefaultState>, ConfigError> {
    for (var, key) in LEGACY_ENV {
        let value = lookup(var).filter(|v| !v.is_empty());
        builder = builder.set_override_option(*key, value)?;
    }
    Ok(builder)
}

impl SipTrunkConfig {
    /// Every account field must be present before anything is sent
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("host", &self.host),
            ("username", &self.username),
            ("password", &self.password),
            ("domain", &self.domain),
            ("caller_id", &self.caller_id),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            return Err(SessionError::Configuration(format!(
                "missing SIP settings: {}",
                missing.join(", ")
            )));
        }
        if self.port == 0 {
            return Err(SessionError::Configuration("SIP port must not be 0".to_string()));
        }
        Ok(())
    }

    /// Request-URI of the registrar
    pub fn registrar_uri(&self) -> String {
        format!("sip:{}:{}", self.host, self.port)
    }

    /// Address-of-record registered with the trunk
    pub fn aor(&self) -> String {
        format!("sip:{}@{}", self.username, self.domain)
    }
}

impl EngineConfig {
    pub fn timers(&self) -> SipTimers {
        SipTimers {
            t1: Duration::from_millis(self.transaction_timeout_ms.max(1)),
            max_retries: self.max_retries,
        }
    }

    pub fn dtmf_duration(&self) -> Duration {
        Duration::from_millis(self.dtmf_duration_ms)
    }
}
