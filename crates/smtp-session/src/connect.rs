use crate::tls::TlsParameters;
use crate::traits::BoxedSessionStream;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("connection to {host}:{port} failed: {error}")]
    Tcp {
        host: String,
        port: u16,
        error: std::io::Error,
    },
    #[error("timeout after {duration:?} establishing a connection to {host}")]
    TimedOut { host: String, duration: Duration },
    #[error("TLS handshake with {host} failed: {error}")]
    Handshake {
        host: String,
        error: std::io::Error,
    },
    #[error("{0} is not a valid DNS name")]
    InvalidDnsName(String),
}

impl ConnectError {
    /// Which layer the failure belongs to, for failure reporting.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Tcp { .. } | Self::TimedOut { .. } => "connect",
            Self::Handshake { .. } | Self::InvalidDnsName(_) => "tls",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityMode {
    /// No encryption at any point in the session.
    Plain,
    /// TLS is negotiated immediately on connect, before any protocol
    /// exchange. The port-465 style of submission.
    ImplicitTls,
    /// The session starts in plaintext and is upgraded mid-stream
    /// once the server acknowledges a STARTTLS command.
    #[serde(rename = "starttls")]
    StartTls,
}

impl SecurityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::ImplicitTls => "implicit-tls",
            Self::StartTls => "starttls",
        }
    }
}

impl std::fmt::Display for SecurityMode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// One concrete way to reach a relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransportSpec {
    pub host: String,
    pub port: u16,
    #[serde(default = "TransportSpec::default_security")]
    pub security: SecurityMode,
    /// Bound applied to the connect attempt and to each subsequent
    /// read or write on the session.
    #[serde(
        default = "TransportSpec::default_timeout",
        with = "humantime_serde"
    )]
    pub timeout: Duration,
    #[serde(default)]
    pub tls: TlsParameters,
}

impl TransportSpec {
    fn default_security() -> SecurityMode {
        SecurityMode::StartTls
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(30)
    }
}

/// Open the transport described by `spec`. For `StartTls` the
/// returned stream is still plaintext; the session driver calls
/// [`upgrade_to_tls`] once the server acknowledges the upgrade.
pub async fn connect(spec: &TransportSpec) -> Result<BoxedSessionStream, ConnectError> {
    let stream = match timeout(
        spec.timeout,
        TcpStream::connect((spec.host.as_str(), spec.port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            return Err(ConnectError::Tcp {
                host: spec.host.clone(),
                port: spec.port,
                error,
            })
        }
        Err(_) => {
            return Err(ConnectError::TimedOut {
                host: spec.host.clone(),
                duration: spec.timeout,
            })
        }
    };
    // No need for Nagle with SMTP request/response
    stream.set_nodelay(true).map_err(|error| ConnectError::Tcp {
        host: spec.host.clone(),
        port: spec.port,
        error,
    })?;

    match spec.security {
        SecurityMode::Plain | SecurityMode::StartTls => Ok(Box::new(stream)),
        SecurityMode::ImplicitTls => {
            upgrade_to_tls(Box::new(stream), &spec.host, &spec.tls, spec.timeout).await
        }
    }
}

/// Wrap an established stream in TLS. Used by [`connect`] for
/// implicit TLS and by the session driver for the STARTTLS upgrade.
pub async fn upgrade_to_tls(
    stream: BoxedSessionStream,
    host: &str,
    tls: &TlsParameters,
    duration: Duration,
) -> Result<BoxedSessionStream, ConnectError> {
    let connector = tls.build_connector();
    let server_name = match IpAddr::from_str(host) {
        Ok(ip) => ServerName::IpAddress(ip.into()),
        Err(_) => ServerName::try_from(host.to_string())
            .map_err(|_| ConnectError::InvalidDnsName(host.to_string()))?,
    };

    match timeout(duration, connector.connect(server_name, stream)).await {
        Ok(Ok(tls_stream)) => Ok(Box::new(tls_stream)),
        Ok(Err(error)) => Err(ConnectError::Handshake {
            host: host.to_string(),
            error,
        }),
        Err(_) => Err(ConnectError::TimedOut {
            host: host.to_string(),
            duration,
        }),
    }
}
