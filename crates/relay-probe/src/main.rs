use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use dead_letter::DeadLetterStore;
use mailfall::{DeliveryEngine, EngineConfig};
use smtp_session::{SecurityMode, SessionQuirks, SmtpSession, TlsParameters, TransportSpec};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(about = "mail delivery utilities: probe relays, send through the chain, manage dead letters")]
struct Opt {
    /// Can be used to change the diagnostic log format
    #[arg(long, default_value = "pretty")]
    diag_format: DiagnosticFormat,

    #[command(subcommand)]
    cmd: SubCommand,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    Probe(ProbeCommand),
    Send(SendCommand),
    DeadLetters(DeadLettersCommand),
}

/// Connect to a relay, print its banner and capabilities, and
/// optionally verify that a TLS upgrade works.
#[derive(Debug, Args)]
struct ProbeCommand {
    /// Verify the relay certificate instead of accepting any peer
    #[arg(long)]
    verify_certificates: bool,

    /// Negotiate TLS immediately on connect (port-465 style)
    #[arg(long)]
    implicit_tls: bool,

    /// Bound on the connect attempt and on each read or write
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Name to announce in EHLO. Defaults to this host's name
    #[arg(long)]
    ehlo_name: Option<String>,

    /// The relay to probe, as host or host:port
    target: String,
}

impl ProbeCommand {
    async fn run(self) -> anyhow::Result<()> {
        let (host, port) = split_target(&self.target)?;
        let spec = TransportSpec {
            host,
            port,
            security: if self.implicit_tls {
                SecurityMode::ImplicitTls
            } else {
                SecurityMode::StartTls
            },
            timeout: self.timeout,
            tls: TlsParameters {
                verify_certificates: self.verify_certificates,
            },
        };
        let ehlo_name = match &self.ehlo_name {
            Some(name) => name.clone(),
            None => gethostname::gethostname().to_string_lossy().into_owned(),
        };

        let mut session = SmtpSession::connect(&spec, SessionQuirks::default()).await?;
        let banner = session.read_greeting().await?;
        println!("{}", banner.to_single_line());

        let caps = session.ehlo(&ehlo_name).await?;
        println!("{caps:#?}");

        if spec.security == SecurityMode::StartTls {
            if session.capabilities().contains_key("STARTTLS") {
                session.starttls().await?;
                println!("TLS established");
                let caps = session.ehlo(&ehlo_name).await?;
                println!("{caps:#?}");
            } else {
                println!("STARTTLS not advertised by {}:{}", spec.host, spec.port);
            }
        }

        session.quit().await.ok();
        Ok(())
    }
}

/// Send an HTML message through the configured delivery chain.
#[derive(Debug, Args)]
struct SendCommand {
    /// Engine configuration file (TOML)
    #[arg(long)]
    config: PathBuf,

    /// Recipient address
    #[arg(long)]
    to: String,

    #[arg(long)]
    subject: String,

    /// HTML body. Read from stdin when omitted
    #[arg(long)]
    body: Option<String>,
}

impl SendCommand {
    async fn run(self) -> anyhow::Result<()> {
        let text = std::fs::read_to_string(&self.config)
            .with_context(|| format!("reading {}", self.config.display()))?;
        let config = EngineConfig::from_toml(&text)?;
        let engine = DeliveryEngine::new(config);

        let body = match self.body {
            Some(body) => body,
            None => {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("reading body from stdin")?;
                buf
            }
        };

        let message = engine.message(self.to, self.subject, body);
        let outcome = engine.send(&message).await;
        let report = outcome.report();

        println!("{}", report.message);
        if !outcome.failures.is_empty() {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        if report.success {
            Ok(())
        } else {
            anyhow::bail!("the message was neither delivered nor recorded");
        }
    }
}

/// Inspect and manage the dead letter store.
#[derive(Debug, Args)]
struct DeadLettersCommand {
    /// Store directory
    #[arg(long, default_value = "undelivered-mail")]
    dir: PathBuf,

    #[command(subcommand)]
    cmd: DeadLettersSubCommand,
}

#[derive(Debug, Subcommand)]
enum DeadLettersSubCommand {
    /// List stored messages, oldest first
    List,
    /// Print a stored message
    Show { file_name: String },
    /// Delete a stored message
    Delete { file_name: String },
}

impl DeadLettersCommand {
    async fn run(self) -> anyhow::Result<()> {
        let store = DeadLetterStore::new(self.dir);
        match self.cmd {
            DeadLettersSubCommand::List => {
                for record in store.list().await? {
                    println!(
                        "{}\t{}\t{} bytes",
                        record.file_name,
                        record.created_at.to_rfc3339(),
                        record.size_bytes
                    );
                }
            }
            DeadLettersSubCommand::Show { file_name } => {
                print!("{}", store.load(&file_name).await?);
            }
            DeadLettersSubCommand::Delete { file_name } => {
                store.remove(&file_name).await?;
                println!("removed {file_name}");
            }
        }
        Ok(())
    }
}

fn split_target(target: &str) -> anyhow::Result<(String, u16)> {
    match target.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port in {target:?}"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((target.to_string(), 25)),
    }
}

fn init_logging(diag_format: DiagnosticFormat) {
    let env_filter =
        EnvFilter::try_from_env("MAILFALL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = fmt::layer().with_target(false);
    let registry = tracing_subscriber::registry().with(env_filter);
    match diag_format {
        DiagnosticFormat::Pretty => registry.with(layer.pretty()).init(),
        DiagnosticFormat::Full => registry.with(layer).init(),
        DiagnosticFormat::Compact => registry.with(layer.compact()).init(),
        DiagnosticFormat::Json => registry.with(layer.json()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();
    init_logging(opts.diag_format);

    match opts.cmd {
        SubCommand::Probe(cmd) => cmd.run().await,
        SubCommand::Send(cmd) => cmd.run().await,
        SubCommand::DeadLetters(cmd) => cmd.run().await,
    }
}
