use serde::{Deserialize, Serialize};
use smtp_session::{Credentials, SessionQuirks, TransportSpec};
use std::path::PathBuf;
use std::time::Duration;

/// One way of getting a message off this host. Strategies are tried
/// in configuration order; the first to succeed ends the chain.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum DeliveryStrategy {
    Relay { relay: RelayStrategy },
    LocalSubmission { local_submission: LocalSubmission },
}

impl DeliveryStrategy {
    /// Label used in outcomes and logs to identify this strategy.
    pub fn id(&self) -> String {
        match self {
            Self::Relay { relay } => relay.id(),
            Self::LocalSubmission { local_submission } => local_submission.id(),
        }
    }
}

/// Deliver by speaking SMTP to a relay.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RelayStrategy {
    /// Overrides the derived `<security>:<host>:<port>` label.
    #[serde(default)]
    pub id: Option<String>,
    pub transport: TransportSpec,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Refuse to run this strategy without credentials rather than
    /// attempt an unauthenticated hand-off.
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub quirks: SessionQuirks,
}

impl RelayStrategy {
    pub fn id(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!(
                "{}:{}:{}",
                self.transport.security, self.transport.host, self.transport.port
            ),
        }
    }
}

/// Deliver by piping the message to a host-level mail program.
/// Success means the program accepted the message, nothing more.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LocalSubmission {
    #[serde(default = "LocalSubmission::default_command")]
    pub command: PathBuf,
    /// `-t` takes the recipients from the message headers; `-i`
    /// keeps a lone dot line from terminating the input.
    #[serde(default = "LocalSubmission::default_args")]
    pub args: Vec<String>,
    #[serde(default = "LocalSubmission::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl LocalSubmission {
    fn default_command() -> PathBuf {
        "/usr/sbin/sendmail".into()
    }

    fn default_args() -> Vec<String> {
        vec!["-t".to_string(), "-i".to_string()]
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(60)
    }

    pub fn id(&self) -> String {
        format!("local:{}", self.command.display())
    }
}

impl Default for LocalSubmission {
    fn default() -> Self {
        Self {
            command: Self::default_command(),
            args: Self::default_args(),
            timeout: Self::default_timeout(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn untagged_variants_are_told_apart_by_field_name() {
        let relay: DeliveryStrategy = serde_json::from_str(
            r#"{"relay": {"transport": {"host": "smtp.example.com", "port": 587}}}"#,
        )
        .unwrap();
        k9::snapshot!(relay.id(), "starttls:smtp.example.com:587");

        let local: DeliveryStrategy =
            serde_json::from_str(r#"{"local_submission": {}}"#).unwrap();
        k9::snapshot!(local.id(), "local:/usr/sbin/sendmail");
    }

    #[test]
    fn explicit_id_wins() {
        let strategy: DeliveryStrategy = serde_json::from_str(
            r#"{"relay": {"id": "primary", "transport": {"host": "smtp.example.com", "port": 587}}}"#,
        )
        .unwrap();
        k9::snapshot!(strategy.id(), "primary");
    }

    #[test]
    fn local_submission_defaults() {
        let local = LocalSubmission::default();
        assert_eq!(local.args, vec!["-t", "-i"]);
        assert_eq!(local.timeout, Duration::from_secs(60));
    }
}
