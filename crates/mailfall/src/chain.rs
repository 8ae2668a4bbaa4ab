use crate::outcome::{AttemptFailure, DeliveryOutcome};
use crate::strategy::{DeliveryStrategy, LocalSubmission, RelayStrategy};
use mail_message::Message;
use smtp_session::{SecurityMode, SessionError, SmtpSession};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

/// Try each strategy in order until one carries the message.
/// Strictly sequential; racing a second relay while the first may
/// still succeed risks duplicate delivery. Every failure is recorded
/// in order and the next strategy is tried.
pub(crate) async fn attempt_all(
    message: &Message,
    strategies: &[DeliveryStrategy],
    ehlo_name: &str,
) -> DeliveryOutcome {
    let mut failures = vec![];

    for strategy in strategies {
        let id = strategy.id();
        tracing::debug!("attempting delivery for {} via {id}", message.recipient());

        match attempt(strategy, message, ehlo_name).await {
            Ok(()) => {
                match strategy {
                    DeliveryStrategy::LocalSubmission { .. } => tracing::info!(
                        "message for {} accepted by {id}; no relay confirmation",
                        message.recipient()
                    ),
                    DeliveryStrategy::Relay { .. } => tracing::info!(
                        "delivered message for {} via {id}",
                        message.recipient()
                    ),
                }
                return DeliveryOutcome {
                    succeeded: true,
                    strategy_used: Some(id),
                    failures,
                };
            }
            Err(failure) => {
                tracing::warn!(
                    "delivery via {} failed at {}: {}",
                    failure.strategy,
                    failure.stage,
                    failure.reason
                );
                failures.push(failure);
            }
        }
    }

    DeliveryOutcome {
        succeeded: false,
        strategy_used: None,
        failures,
    }
}

async fn attempt(
    strategy: &DeliveryStrategy,
    message: &Message,
    ehlo_name: &str,
) -> Result<(), AttemptFailure> {
    match strategy {
        DeliveryStrategy::Relay { relay } => {
            attempt_relay(relay, message, ehlo_name)
                .await
                .map_err(|err| AttemptFailure {
                    strategy: relay.id(),
                    stage: err.stage().to_string(),
                    reason: err.to_string(),
                })
        }
        DeliveryStrategy::LocalSubmission { local_submission } => {
            attempt_local(local_submission, message)
                .await
                .map_err(|reason| AttemptFailure {
                    strategy: local_submission.id(),
                    stage: "submission".to_string(),
                    reason,
                })
        }
    }
}

#[derive(Error, Debug)]
enum RelayError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("authentication required but no credentials are configured")]
    CredentialsMissing,
}

impl RelayError {
    fn stage(&self) -> &'static str {
        match self {
            Self::Session(err) => err.stage(),
            Self::CredentialsMissing => "auth",
        }
    }
}

/// One complete SMTP conversation. Dropping the session on any exit
/// path closes the socket, so a failure part-way never leaks a
/// connection into the next attempt.
async fn attempt_relay(
    relay: &RelayStrategy,
    message: &Message,
    ehlo_name: &str,
) -> Result<(), RelayError> {
    if relay.auth_required && relay.credentials.is_none() {
        return Err(RelayError::CredentialsMissing);
    }

    let mut session = SmtpSession::connect(&relay.transport, relay.quirks).await?;
    session.read_greeting().await?;
    session.ehlo(ehlo_name).await?;

    if relay.transport.security == SecurityMode::StartTls {
        session.starttls().await?;
        session.ehlo(ehlo_name).await?;
    }

    if let Some(credentials) = &relay.credentials {
        session.auth_login(credentials).await?;
    }

    session
        .send_mail(message.from_address(), message.recipient(), message.rfc822())
        .await?;

    // The relay has taken responsibility; a failed goodbye is noise
    session.quit().await.ok();
    Ok(())
}

async fn attempt_local(local: &LocalSubmission, message: &Message) -> Result<(), String> {
    let mut command = tokio::process::Command::new(&local.command);
    command
        .args(&local.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|err| format!("spawning {}: {err}", local.command.display()))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| format!("{}: no stdin handle", local.command.display()))?;
    match timeout(local.timeout, stdin.write_all(message.rfc822().as_bytes())).await {
        Ok(result) => {
            result.map_err(|err| format!("writing message to {}: {err}", local.command.display()))?
        }
        Err(_) => {
            return Err(format!(
                "timeout: {} did not read the message within {:?}",
                local.command.display(),
                local.timeout
            ));
        }
    }
    // Close stdin so the program sees EOF and can exit
    drop(stdin);

    let output = match timeout(local.timeout, child.wait_with_output()).await {
        Ok(result) => {
            result.map_err(|err| format!("waiting for {}: {err}", local.command.display()))?
        }
        Err(_) => {
            return Err(format!(
                "timeout: {} did not exit within {:?}",
                local.command.display(),
                local.timeout
            ));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let excerpt: String = stderr.trim().chars().take(200).collect();
        let mut reason = format!("{} exited with {}", local.command.display(), output.status);
        if !excerpt.is_empty() {
            reason.push_str(": ");
            reason.push_str(&excerpt);
        }
        return Err(reason);
    }

    Ok(())
}
