use crate::strategy::{DeliveryStrategy, LocalSubmission, RelayStrategy};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use smtp_session::{Credentials, SecurityMode, SessionQuirks, TlsParameters, TransportSpec};
use std::path::PathBuf;
use std::time::Duration;

const IMPLICIT_TLS_PORT: u16 = 465;

/// Everything the engine needs, handed over at construction. The
/// engine never reads ambient process state, so tests can point one
/// at whatever fake relay or directory they like.
#[derive(Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Relay host used by the default strategy chain.
    pub host: String,
    #[serde(default = "EngineConfig::default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    /// Envelope sender and `From` header address.
    pub from_address: String,
    #[serde(default)]
    pub from_name: String,
    /// Name announced in EHLO. Defaults to this host's name.
    #[serde(default)]
    pub ehlo_name: Option<String>,
    #[serde(default = "EngineConfig::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Off by default: relays in the wild present certificates many
    /// deployments cannot validate, and the operator's choice here
    /// is reachability over verification.
    #[serde(default)]
    pub verify_certificates: bool,
    #[serde(default = "EngineConfig::default_fallback_dir")]
    pub fallback_dir: PathBuf,
    /// Appends a host-level mail program to the default chain.
    #[serde(default)]
    pub local_submission: Option<LocalSubmission>,
    /// Replaces the default chain entirely when present.
    #[serde(default)]
    pub strategies: Option<Vec<DeliveryStrategy>>,
}

impl EngineConfig {
    fn default_port() -> u16 {
        587
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(30)
    }

    fn default_fallback_dir() -> PathBuf {
        "undelivered-mail".into()
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("parsing engine configuration")
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.secret) {
            (Some(username), Some(secret)) => Some(Credentials {
                username: username.clone(),
                secret: secret.clone(),
            }),
            _ => None,
        }
    }

    pub fn ehlo_name(&self) -> String {
        if let Some(name) = &self.ehlo_name {
            return name.clone();
        }
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        if hostname.is_empty() {
            "[127.0.0.1]".to_string()
        } else {
            hostname
        }
    }

    /// The strategy chain. An explicit `strategies` list wins;
    /// otherwise: STARTTLS on the configured port, then implicit TLS
    /// on 465 with the lenient AUTH prompt enabled, then the local
    /// mail program when one is configured.
    pub fn strategies(&self) -> Vec<DeliveryStrategy> {
        if let Some(strategies) = &self.strategies {
            return strategies.clone();
        }

        let credentials = self.credentials();
        let tls = TlsParameters {
            verify_certificates: self.verify_certificates,
        };

        let mut chain = vec![
            DeliveryStrategy::Relay {
                relay: RelayStrategy {
                    id: None,
                    transport: TransportSpec {
                        host: self.host.clone(),
                        port: self.port,
                        security: SecurityMode::StartTls,
                        timeout: self.timeout,
                        tls,
                    },
                    credentials: credentials.clone(),
                    auth_required: false,
                    quirks: SessionQuirks::default(),
                },
            },
            DeliveryStrategy::Relay {
                relay: RelayStrategy {
                    id: None,
                    transport: TransportSpec {
                        host: self.host.clone(),
                        port: IMPLICIT_TLS_PORT,
                        security: SecurityMode::ImplicitTls,
                        timeout: self.timeout,
                        tls,
                    },
                    credentials,
                    auth_required: false,
                    quirks: SessionQuirks {
                        accept_ok_as_auth_prompt: true,
                    },
                },
            },
        ];

        if let Some(local_submission) = &self.local_submission {
            chain.push(DeliveryStrategy::LocalSubmission {
                local_submission: local_submission.clone(),
            });
        }

        chain
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("EngineConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("from_address", &self.from_address)
            .field("from_name", &self.from_name)
            .field("ehlo_name", &self.ehlo_name)
            .field("timeout", &self.timeout)
            .field("verify_certificates", &self.verify_certificates)
            .field("fallback_dir", &self.fallback_dir)
            .field("local_submission", &self.local_submission)
            .field("strategies", &self.strategies)
            .finish()
    }
}
