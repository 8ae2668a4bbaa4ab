use dead_letter::parse_artifact;
use mail_message::MAILER_IDENT;
use mailfall::{
    DeliveryEngine, DeliveryStrategy, EngineConfig, LocalSubmission, RelayStrategy,
    DURABLE_FALLBACK,
};
use smtp_session::{Credentials, SecurityMode, SessionQuirks, TlsParameters, TransportSpec};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// One step of a scripted relay conversation.
enum Exchange {
    /// Send a line to the client.
    Send(&'static str),
    /// Read a line and require the given prefix. `""` matches any
    /// line, which is how the base64 credential blobs are consumed.
    Expect(&'static str),
    /// Read payload lines until the lone `.` terminator.
    DrainData,
}
use Exchange::*;

/// Serve exactly one connection according to `script`, returning
/// every line the client sent.
fn spawn_relay(listener: TcpListener, script: Vec<Exchange>) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = socket.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut seen = vec![];

        for step in script {
            match step {
                Send(text) => {
                    write_half
                        .write_all(format!("{text}\r\n").as_bytes())
                        .await
                        .unwrap();
                }
                Expect(prefix) => {
                    let line = lines.next_line().await.unwrap().unwrap_or_default();
                    assert!(
                        line.starts_with(prefix),
                        "relay expected {prefix:?}, client sent {line:?}"
                    );
                    seen.push(line);
                }
                DrainData => loop {
                    let line = lines.next_line().await.unwrap().unwrap_or_default();
                    let done = line == ".";
                    seen.push(line);
                    if done {
                        break;
                    }
                },
            }
        }

        seen
    })
}

async fn listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// An address where nothing is listening.
async fn refused_addr() -> SocketAddr {
    let (listener, addr) = listener().await;
    drop(listener);
    addr
}

fn relay_to(addr: SocketAddr, security: SecurityMode) -> RelayStrategy {
    RelayStrategy {
        id: None,
        transport: TransportSpec {
            host: addr.ip().to_string(),
            port: addr.port(),
            security,
            timeout: Duration::from_secs(5),
            tls: TlsParameters::default(),
        },
        credentials: None,
        auth_required: false,
        quirks: SessionQuirks::default(),
    }
}

fn credentials() -> Credentials {
    Credentials {
        username: "user".to_string(),
        secret: "secret".to_string(),
    }
}

fn engine_with(strategies: Vec<DeliveryStrategy>, fallback_dir: &Path) -> DeliveryEngine {
    DeliveryEngine::new(EngineConfig {
        host: "unused.example.com".to_string(),
        port: 587,
        username: None,
        secret: None,
        from_address: "noreply@example.com".to_string(),
        from_name: "Example".to_string(),
        ehlo_name: Some("client.test".to_string()),
        timeout: Duration::from_secs(5),
        verify_certificates: false,
        fallback_dir: fallback_dir.to_path_buf(),
        local_submission: None,
        strategies: Some(strategies),
    })
}

/// Greeting through QUIT for an unauthenticated delivery.
fn accepting_script() -> Vec<Exchange> {
    vec![
        Send("220 fake ESMTP ready"),
        Expect("EHLO "),
        Send("250-fake greets you"),
        Send("250 AUTH LOGIN"),
        Expect("MAIL FROM:<noreply@example.com>"),
        Send("250 sender ok"),
        Expect("RCPT TO:<"),
        Send("250 recipient ok"),
        Expect("DATA"),
        Send("354 go ahead"),
        DrainData,
        Send("250 queued"),
        Expect("QUIT"),
        Send("221 bye"),
    ]
}

#[tokio::test]
async fn earlier_failures_are_recorded_and_the_first_success_stops_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let refused = refused_addr().await;
    let (good_listener, good_addr) = listener().await;
    let relay = spawn_relay(good_listener, accepting_script());

    let engine = engine_with(
        vec![
            DeliveryStrategy::Relay {
                relay: relay_to(refused, SecurityMode::StartTls),
            },
            DeliveryStrategy::Relay {
                relay: relay_to(good_addr, SecurityMode::Plain),
            },
        ],
        dir.path(),
    );

    let message = engine.message("user@example.com", "hello", "<p>hi</p>");
    let outcome = engine.send(&message).await;
    relay.await.unwrap();

    assert!(outcome.succeeded);
    assert_eq!(
        outcome.strategy_used.as_deref(),
        Some(format!("plain:{}:{}", good_addr.ip(), good_addr.port()).as_str())
    );
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].stage, "connect");
    assert!(
        outcome.failures[0].reason.contains("refused"),
        "{}",
        outcome.failures[0].reason
    );

    // Nothing reached the fallback store
    assert!(engine.store().list().await.unwrap().is_empty());
}

#[tokio::test]
async fn all_failures_fall_back_to_the_store_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let refused = refused_addr().await;
    let (rejecting_listener, rejecting_addr) = listener().await;
    let relay = spawn_relay(
        rejecting_listener,
        vec![
            Send("220 fake ESMTP ready"),
            Expect("EHLO "),
            Send("250 AUTH LOGIN"),
            Expect("AUTH LOGIN"),
            Send("334 VXNlcm5hbWU6"),
            Expect(""),
            Send("334 UGFzc3dvcmQ6"),
            Expect(""),
            Send("535 5.7.8 authentication credentials invalid"),
        ],
    );

    let mut rejecting = relay_to(rejecting_addr, SecurityMode::Plain);
    rejecting.credentials = Some(credentials());

    let engine = engine_with(
        vec![
            DeliveryStrategy::Relay {
                relay: relay_to(refused, SecurityMode::StartTls),
            },
            DeliveryStrategy::Relay { relay: rejecting },
        ],
        dir.path(),
    );

    let message = engine.message("user@example.com", "hello", "<p>hi</p>");
    let outcome = engine.send(&message).await;
    relay.await.unwrap();

    assert!(outcome.succeeded);
    assert_eq!(outcome.strategy_used.as_deref(), Some(DURABLE_FALLBACK));
    assert!(outcome.report().success);

    let reasons = outcome.failure_reasons();
    assert_eq!(reasons.len(), 2);
    assert!(reasons[0].contains("refused"), "{}", reasons[0]);
    assert!(reasons[1].contains("535"), "{}", reasons[1]);
    assert_eq!(outcome.failures[1].stage, "auth");

    // Exactly one artifact, and it round-trips the message
    let stored = engine.store().list().await.unwrap();
    assert_eq!(stored.len(), 1);
    let text = engine.store().load(&stored[0].file_name).await.unwrap();
    let parsed = parse_artifact(&text).unwrap();
    assert_eq!(parsed.header("To"), Some("user@example.com"));
    assert_eq!(parsed.header("Subject"), Some("hello"));
    assert_eq!(parsed.html_body, "<p>hi</p>");
}

#[tokio::test]
async fn starttls_rejection_fails_before_credentials_are_offered() {
    let dir = tempfile::tempdir().unwrap();
    let (tls_listener, tls_addr) = listener().await;
    let tls_relay = spawn_relay(
        tls_listener,
        vec![
            Send("220 fake ESMTP ready"),
            Expect("EHLO "),
            Send("250-fake greets you"),
            Send("250 STARTTLS"),
            Expect("STARTTLS"),
            Send("502 command not implemented"),
        ],
    );
    let (good_listener, good_addr) = listener().await;
    let good_relay = spawn_relay(good_listener, accepting_script());

    let mut upgrading = relay_to(tls_addr, SecurityMode::StartTls);
    upgrading.credentials = Some(credentials());

    let engine = engine_with(
        vec![
            DeliveryStrategy::Relay { relay: upgrading },
            DeliveryStrategy::Relay {
                relay: relay_to(good_addr, SecurityMode::Plain),
            },
        ],
        dir.path(),
    );

    let message = engine.message("user@example.com", "hello", "<p>hi</p>");
    let outcome = engine.send(&message).await;
    let tls_seen = tls_relay.await.unwrap();
    good_relay.await.unwrap();

    assert!(outcome.succeeded);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].stage, "pre-tls");
    assert!(
        outcome.failures[0].reason.contains("502"),
        "{}",
        outcome.failures[0].reason
    );

    // The chain moved on without ever attempting authentication
    assert!(
        !tls_seen.iter().any(|line| line.starts_with("AUTH")),
        "{tls_seen:?}"
    );
}

#[tokio::test]
async fn quirky_ok_auth_prompt_still_authenticates() {
    let dir = tempfile::tempdir().unwrap();
    let (quirky_listener, quirky_addr) = listener().await;
    let relay = spawn_relay(
        quirky_listener,
        vec![
            Send("220 fake ESMTP ready"),
            Expect("EHLO "),
            Send("250 AUTH LOGIN"),
            Expect("AUTH LOGIN"),
            Send("250 ok go ahead"),
            Expect("dXNlcg=="),
            Send("334 UGFzc3dvcmQ6"),
            Expect("c2VjcmV0"),
            Send("235 2.7.0 accepted"),
            Expect("MAIL FROM:<noreply@example.com>"),
            Send("250 sender ok"),
            Expect("RCPT TO:<user@example.com>"),
            Send("250 recipient ok"),
            Expect("DATA"),
            Send("354 go ahead"),
            DrainData,
            Send("250 queued"),
            Expect("QUIT"),
            Send("221 bye"),
        ],
    );

    let mut quirky = relay_to(quirky_addr, SecurityMode::Plain);
    quirky.credentials = Some(credentials());
    quirky.quirks = SessionQuirks {
        accept_ok_as_auth_prompt: true,
    };

    let engine = engine_with(vec![DeliveryStrategy::Relay { relay: quirky }], dir.path());
    let message = engine.message("user@example.com", "hello", "<p>hi</p>");
    let outcome = engine.send(&message).await;
    relay.await.unwrap();

    assert!(outcome.succeeded);
    assert!(outcome.failures.is_empty());
    assert_ne!(outcome.strategy_used.as_deref(), Some(DURABLE_FALLBACK));
}

#[tokio::test]
async fn auth_required_without_credentials_never_connects() {
    let dir = tempfile::tempdir().unwrap();
    let (strict_listener, strict_addr) = listener().await;

    let mut strict = relay_to(strict_addr, SecurityMode::Plain);
    strict.auth_required = true;

    let engine = engine_with(vec![DeliveryStrategy::Relay { relay: strict }], dir.path());
    let message = engine.message("user@example.com", "hello", "<p>hi</p>");
    let outcome = engine.send(&message).await;

    assert!(outcome.succeeded, "fallback should have handled it");
    assert_eq!(outcome.strategy_used.as_deref(), Some(DURABLE_FALLBACK));
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].stage, "auth");
    assert!(
        outcome.failures[0].reason.contains("credentials"),
        "{}",
        outcome.failures[0].reason
    );

    // The listener was never touched; accept would still be pending
    let untouched = tokio::time::timeout(Duration::from_millis(50), strict_listener.accept()).await;
    assert!(untouched.is_err(), "a connection arrived unexpectedly");
}

#[tokio::test]
async fn unresponsive_relay_counts_as_a_timeout_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (silent_listener, silent_addr) = listener().await;
    tokio::spawn(async move {
        let (_socket, _) = silent_listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let mut silent = relay_to(silent_addr, SecurityMode::Plain);
    silent.transport.timeout = Duration::from_millis(200);

    let engine = engine_with(vec![DeliveryStrategy::Relay { relay: silent }], dir.path());
    let message = engine.message("user@example.com", "hello", "<p>hi</p>");
    let outcome = engine.send(&message).await;

    assert_eq!(outcome.strategy_used.as_deref(), Some(DURABLE_FALLBACK));
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].stage, "greeting");
    assert!(
        outcome.failures[0].reason.contains("timeout"),
        "{}",
        outcome.failures[0].reason
    );
}

#[tokio::test]
async fn delivered_payload_carries_headers_and_crlf_body() {
    let dir = tempfile::tempdir().unwrap();
    let (good_listener, good_addr) = listener().await;
    let relay = spawn_relay(good_listener, accepting_script());

    let engine = engine_with(
        vec![DeliveryStrategy::Relay {
            relay: relay_to(good_addr, SecurityMode::Plain),
        }],
        dir.path(),
    );

    let message = engine.message(
        "user@example.com",
        "Two paragraphs",
        "<p>one</p>\n<p>two</p>",
    );
    let outcome = engine.send(&message).await;
    let seen = relay.await.unwrap();

    assert!(outcome.succeeded);
    assert_eq!(seen[0], "EHLO client.test");

    let payload_start = seen
        .iter()
        .position(|line| line == "DATA")
        .expect("DATA command missing")
        + 1;
    let payload = &seen[payload_start..seen.len() - 2];
    assert_eq!(
        payload,
        &[
            "To: user@example.com",
            "From: Example <noreply@example.com>",
            "Subject: Two paragraphs",
            "MIME-Version: 1.0",
            "Content-Type: text/html; charset=UTF-8",
            &format!("X-Mailer: {MAILER_IDENT}"),
            "",
            "<p>one</p>",
            "<p>two</p>",
        ]
    );
    assert_eq!(seen[seen.len() - 2], ".");
    assert_eq!(seen[seen.len() - 1], "QUIT");
}

#[tokio::test]
async fn send_report_reduces_the_outcome_to_the_caller_contract() {
    let dir = tempfile::tempdir().unwrap();
    let (good_listener, good_addr) = listener().await;
    let relay = spawn_relay(good_listener, accepting_script());

    let engine = engine_with(
        vec![DeliveryStrategy::Relay {
            relay: relay_to(good_addr, SecurityMode::Plain),
        }],
        dir.path(),
    );

    let report = engine
        .send_report("user@example.com", "hello", "<p>hi</p>")
        .await;
    relay.await.unwrap();

    assert!(report.success);
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"success": true, "message": "Email sent successfully"})
    );
}

#[tokio::test]
async fn local_submission_pipes_the_rendered_message() {
    let dir = tempfile::tempdir().unwrap();
    let captured = dir.path().join("captured.eml");

    let engine = engine_with(
        vec![DeliveryStrategy::LocalSubmission {
            local_submission: LocalSubmission {
                command: "/bin/sh".into(),
                args: vec![
                    "-c".to_string(),
                    format!("cat > {}", captured.display()),
                ],
                timeout: Duration::from_secs(5),
            },
        }],
        dir.path(),
    );

    let message = engine.message("user@example.com", "hello", "<p>hi</p>");
    let outcome = engine.send(&message).await;

    assert!(outcome.succeeded);
    assert_eq!(outcome.strategy_used.as_deref(), Some("local:/bin/sh"));

    let piped = std::fs::read_to_string(&captured).unwrap();
    assert!(piped.contains("To: user@example.com\r\n"), "{piped}");
    assert!(piped.contains("Subject: hello\r\n"), "{piped}");
    assert!(piped.ends_with("<p>hi</p>"), "{piped}");
}

#[tokio::test]
async fn local_submission_failure_carries_the_stderr_excerpt() {
    let dir = tempfile::tempdir().unwrap();

    let engine = engine_with(
        vec![DeliveryStrategy::LocalSubmission {
            local_submission: LocalSubmission {
                command: "/bin/sh".into(),
                args: vec![
                    "-c".to_string(),
                    "echo mail system unavailable >&2; exit 12".to_string(),
                ],
                timeout: Duration::from_secs(5),
            },
        }],
        dir.path(),
    );

    let message = engine.message("user@example.com", "hello", "<p>hi</p>");
    let outcome = engine.send(&message).await;

    assert_eq!(outcome.strategy_used.as_deref(), Some(DURABLE_FALLBACK));
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].stage, "submission");
    assert!(
        outcome.failures[0].reason.contains("mail system unavailable"),
        "{}",
        outcome.failures[0].reason
    );
    assert!(
        outcome.failures[0].reason.contains("12"),
        "{}",
        outcome.failures[0].reason
    );
}

#[tokio::test]
async fn store_failure_surfaces_instead_of_swallowing_the_loss() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("occupied");
    std::fs::write(&blocker, "a file where the store wants a directory").unwrap();

    let refused = refused_addr().await;
    let engine = engine_with(
        vec![DeliveryStrategy::Relay {
            relay: relay_to(refused, SecurityMode::Plain),
        }],
        &blocker,
    );

    let message = engine.message("user@example.com", "hello", "<p>hi</p>");
    let outcome = engine.send(&message).await;

    assert!(!outcome.succeeded);
    assert_eq!(outcome.strategy_used, None);
    assert!(!outcome.report().success);

    let last = outcome.failures.last().expect("store failure missing");
    assert_eq!(last.strategy, DURABLE_FALLBACK);
    assert_eq!(last.stage, "store");
}
