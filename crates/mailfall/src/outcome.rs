use serde::Serialize;

/// One failed attempt against one strategy.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    /// Strategy label, e.g. `starttls:smtp.example.com:587`.
    pub strategy: String,
    /// Where the attempt died: `connect`, `tls`, `greeting`, `ehlo`,
    /// `pre-tls`, `auth`, `mail-from`, `rcpt-to`, `data`,
    /// `submission` or `store`.
    pub stage: String,
    pub reason: String,
}

/// The full story of one delivery: which strategy carried the
/// message, if any, and why every earlier attempt was passed over.
/// This is the primary diagnostic artifact; nothing that happened on
/// the wire is discarded.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub succeeded: bool,
    pub strategy_used: Option<String>,
    pub failures: Vec<AttemptFailure>,
}

impl DeliveryOutcome {
    /// The reason strings of every failed attempt, in attempt order.
    pub fn failure_reasons(&self) -> Vec<&str> {
        self.failures
            .iter()
            .map(|failure| failure.reason.as_str())
            .collect()
    }

    /// Caller-facing summary with fixed texts. Wire-level detail
    /// stays in the outcome itself and in the logs, never in the
    /// text shown to an end user.
    pub fn report(&self) -> SendReport {
        SendReport {
            success: self.succeeded,
            message: if self.succeeded {
                "Email sent successfully".to_string()
            } else {
                "Email could not be sent".to_string()
            },
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub success: bool,
    pub message: String,
}
