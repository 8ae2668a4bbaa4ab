use crate::chain;
use crate::config::EngineConfig;
use crate::outcome::{AttemptFailure, DeliveryOutcome, SendReport};
use crate::strategy::DeliveryStrategy;
use dead_letter::DeadLetterStore;
use mail_message::Message;

/// Strategy label reported when a message ends up in the dead letter
/// store instead of being delivered.
pub const DURABLE_FALLBACK: &str = "durable-fallback";

/// Owns the strategy chain and the dead letter store, and runs the
/// whole delivery sequence for each message. All configuration is
/// fixed at construction.
pub struct DeliveryEngine {
    strategies: Vec<DeliveryStrategy>,
    store: DeadLetterStore,
    ehlo_name: String,
    from_address: String,
    from_name: String,
}

impl DeliveryEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            strategies: config.strategies(),
            ehlo_name: config.ehlo_name(),
            store: DeadLetterStore::new(config.fallback_dir),
            from_address: config.from_address,
            from_name: config.from_name,
        }
    }

    /// Compose a message carrying this engine's sender identity.
    pub fn message<R, S, B>(&self, recipient: R, subject: S, html_body: B) -> Message
    where
        R: Into<String>,
        S: Into<String>,
        B: Into<String>,
    {
        Message::new(
            recipient,
            subject,
            html_body,
            self.from_address.clone(),
            self.from_name.clone(),
        )
    }

    pub fn store(&self) -> &DeadLetterStore {
        &self.store
    }

    /// Deliver `message`, walking the strategy chain and falling back
    /// to the dead letter store when no strategy succeeds. A stored
    /// message counts as handled: `succeeded` promises "not lost",
    /// not "reached the inbox". The logs keep the two apart even
    /// though the boolean does not.
    pub async fn send(&self, message: &Message) -> DeliveryOutcome {
        let outcome = chain::attempt_all(message, &self.strategies, &self.ehlo_name).await;
        if outcome.succeeded {
            return outcome;
        }

        let mut failures = outcome.failures;
        match self.store.persist(message).await {
            Ok(record) => {
                tracing::warn!(
                    "message for {} recorded as {}; it was not delivered to any relay",
                    message.recipient(),
                    record.file_name
                );
                DeliveryOutcome {
                    succeeded: true,
                    strategy_used: Some(DURABLE_FALLBACK.to_string()),
                    failures,
                }
            }
            Err(err) => {
                let reason = format!("{err:#}");
                tracing::error!(
                    "message for {} could not be recorded: {reason}",
                    message.recipient()
                );
                failures.push(AttemptFailure {
                    strategy: DURABLE_FALLBACK.to_string(),
                    stage: "store".to_string(),
                    reason,
                });
                DeliveryOutcome {
                    succeeded: false,
                    strategy_used: None,
                    failures,
                }
            }
        }
    }

    /// The one-call surface for callers that only want the summary:
    /// compose, deliver, reduce to a report with fixed texts.
    pub async fn send_report<R, S, B>(&self, recipient: R, subject: S, html_body: B) -> SendReport
    where
        R: Into<String>,
        S: Into<String>,
        B: Into<String>,
    {
        let message = self.message(recipient, subject, html_body);
        self.send(&message).await.report()
    }
}
