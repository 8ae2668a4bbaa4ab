use crate::connect::{connect, upgrade_to_tls, ConnectError, TransportSpec};
use crate::response::{parse_response_line, Response, ResponseBuilder};
use crate::traits::{BoxedSessionStream, SessionStream};
use data_encoding::BASE64;
use memchr::memmem::Finder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const MAX_LINE_LEN: usize = 4096;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("Malformed Response: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("{stage} rejected: {}", .response.to_single_line())]
    Rejected {
        stage: SessionStage,
        response: Response,
    },
    #[error("authentication rejected: {}", .response.to_single_line())]
    AuthRejected { response: Response },
    #[error("timeout waiting {duration:?} for {stage} response")]
    TimedOut {
        stage: SessionStage,
        duration: Duration,
    },
}

impl SessionError {
    /// Which layer of the exchange failed, for failure reporting.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Connect(err) => err.stage(),
            Self::Rejected { stage, .. } | Self::TimedOut { stage, .. } => stage.as_str(),
            Self::AuthRejected { .. } => "auth",
            Self::Utf8(_)
            | Self::Io(_)
            | Self::MalformedResponseLine(_)
            | Self::ResponseTooLong
            | Self::NotConnected => "session",
        }
    }

    /// Credential rejections usually mean misconfiguration rather
    /// than a flaky relay, so callers may want to single them out.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthRejected { .. })
    }
}

/// The protocol step a response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    Greeting,
    Ehlo,
    PreTls,
    Auth,
    MailFrom,
    RcptTo,
    Data,
    Quit,
}

impl SessionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::Ehlo => "ehlo",
            Self::PreTls => "pre-tls",
            Self::Auth => "auth",
            Self::MailFrom => "mail-from",
            Self::RcptTo => "rcpt-to",
            Self::Data => "data",
            Self::Quit => "quit",
        }
    }
}

impl std::fmt::Display for SessionStage {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    StartTls,
    AuthLogin,
    /// A base64 blob answering an AUTH LOGIN prompt. Sensitive: never
    /// traced verbatim.
    AuthResponse(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Quit,
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Self::Ehlo(name) => format!("EHLO {name}\r\n"),
            Self::StartTls => "STARTTLS\r\n".to_string(),
            Self::AuthLogin => "AUTH LOGIN\r\n".to_string(),
            Self::AuthResponse(blob) => format!("{blob}\r\n"),
            Self::MailFrom(address) => format!("MAIL FROM:<{address}>\r\n"),
            Self::RcptTo(address) => format!("RCPT TO:<{address}>\r\n"),
            Self::Data => "DATA\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
        }
    }

    fn stage(&self) -> SessionStage {
        match self {
            Self::Ehlo(_) => SessionStage::Ehlo,
            Self::StartTls => SessionStage::PreTls,
            Self::AuthLogin | Self::AuthResponse(_) => SessionStage::Auth,
            Self::MailFrom(_) => SessionStage::MailFrom,
            Self::RcptTo(_) => SessionStage::RcptTo,
            Self::Data => SessionStage::Data,
            Self::Quit => SessionStage::Quit,
        }
    }

    fn is_sensitive(&self) -> bool {
        matches!(self, Self::AuthResponse(_))
    }
}

/// Relay login. The secret is redacted down to its ends in Debug
/// output so it can never land in a log verbatim.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &redacted(&self.secret))
            .finish()
    }
}

fn redacted(secret: &str) -> String {
    let n = secret.chars().count();
    let mut chars = secret.chars();
    match (chars.next(), secret.chars().last()) {
        (Some(first), Some(last)) if n >= 3 => format!("{first}..{last} <{n} chars>"),
        _ => format!("<{n} chars>"),
    }
}

/// Named allowances for relays that deviate from the RFC dialogue.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionQuirks {
    /// Some providers answer `250` to `AUTH LOGIN` where the RFC
    /// calls for a `334` prompt. With this set, a `250` there is
    /// treated as an implicit prompt and the username is sent anyway.
    /// The username and secret exchanges are still held to `334` and
    /// `235` respectively.
    #[serde(default)]
    pub accept_ok_as_auth_prompt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpCapability {
    pub name: String,
    pub param: Option<String>,
}

/// Drives the SMTP command/response state machine over a connected
/// transport. Every exchange is gated on the three-digit code of the
/// response; any mismatch is an error and the caller is expected to
/// drop the session, which closes the socket.
#[derive(Debug)]
pub struct SmtpSession {
    stream: Option<BoxedSessionStream>,
    host: String,
    timeout: Duration,
    tls: crate::tls::TlsParameters,
    quirks: SessionQuirks,
    capabilities: HashMap<String, EsmtpCapability>,
    read_buffer: Vec<u8>,
}

impl SmtpSession {
    /// Connect the transport described by `spec` and wrap it in a
    /// session. For `StartTls` transports the stream is plaintext
    /// until [`starttls`](Self::starttls) runs.
    pub async fn connect(spec: &TransportSpec, quirks: SessionQuirks) -> Result<Self, SessionError> {
        let stream = connect(spec).await?;
        Ok(Self::with_boxed_stream(stream, spec, quirks))
    }

    pub fn with_stream<S: SessionStream + 'static>(
        stream: S,
        spec: &TransportSpec,
        quirks: SessionQuirks,
    ) -> Self {
        Self::with_boxed_stream(Box::new(stream), spec, quirks)
    }

    fn with_boxed_stream(
        stream: BoxedSessionStream,
        spec: &TransportSpec,
        quirks: SessionQuirks,
    ) -> Self {
        Self {
            stream: Some(stream),
            host: spec.host.clone(),
            timeout: spec.timeout,
            tls: spec.tls,
            quirks,
            capabilities: HashMap::new(),
            read_buffer: Vec::with_capacity(1024),
        }
    }

    pub fn capabilities(&self) -> &HashMap<String, EsmtpCapability> {
        &self.capabilities
    }

    async fn read_line(&mut self, stage: SessionStage) -> Result<String, SessionError> {
        static CRLF: LazyLock<Finder> = LazyLock::new(|| Finder::new("\r\n"));

        let mut too_long = false;
        loop {
            if let Some(i) = CRLF.find(&self.read_buffer) {
                if too_long {
                    self.read_buffer.drain(0..i + 2);
                    return Err(SessionError::ResponseTooLong);
                }

                let line = String::from_utf8(self.read_buffer[0..i].to_vec());
                self.read_buffer.drain(0..i + 2);
                return Ok(line?);
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            // Didn't find a complete line, fill up the rest of the buffer
            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.stream.as_mut() {
                Some(s) => match timeout(self.timeout, s.read(&mut data)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(SessionError::TimedOut {
                            stage,
                            duration: self.timeout,
                        })
                    }
                },
                None => return Err(SessionError::NotConnected),
            };
            if size == 0 {
                self.stream.take();
                return Err(SessionError::NotConnected);
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    pub async fn read_response(&mut self, stage: SessionStage) -> Result<Response, SessionError> {
        if let Some(stream) = self.stream.as_mut() {
            stream.flush().await?;
        }

        let mut line = self.read_line(stage).await?;
        tracing::trace!("recv<-{}: {line}", self.host);
        let parsed = parse_response_line(&line).map_err(SessionError::MalformedResponseLine)?;
        let mut builder = ResponseBuilder::new(&parsed);
        let mut is_final = parsed.is_final;

        while !is_final {
            line = self.read_line(stage).await?;
            tracing::trace!("recv<-{}: {line}", self.host);
            let parsed = parse_response_line(&line).map_err(SessionError::MalformedResponseLine)?;
            is_final = parsed.is_final;
            builder
                .add_line(&parsed)
                .map_err(SessionError::MalformedResponseLine)?;
        }

        Ok(builder.build())
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<Response, SessionError> {
        let line = command.encode();
        if command.is_sensitive() {
            tracing::trace!("send->{}: (credential elided)", self.host);
        } else {
            tracing::trace!("send->{}: {}", self.host, line.trim_end());
        }
        match self.stream.as_mut() {
            Some(stream) => match timeout(self.timeout, stream.write_all(line.as_bytes())).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SessionError::TimedOut {
                        stage: command.stage(),
                        duration: self.timeout,
                    })
                }
            },
            None => return Err(SessionError::NotConnected),
        }

        self.read_response(command.stage()).await
    }

    /// Read the server greeting that opens a session; must be `220`.
    pub async fn read_greeting(&mut self) -> Result<Response, SessionError> {
        let response = self.read_response(SessionStage::Greeting).await?;
        if response.code != 220 {
            return Err(SessionError::Rejected {
                stage: SessionStage::Greeting,
                response,
            });
        }
        Ok(response)
    }

    /// Say EHLO and record the advertised capabilities. Multi-line
    /// continuations are consumed; only the `250` gates advancement.
    pub async fn ehlo(
        &mut self,
        ehlo_name: &str,
    ) -> Result<&HashMap<String, EsmtpCapability>, SessionError> {
        let response = self
            .send_command(&Command::Ehlo(ehlo_name.to_string()))
            .await?;
        if response.code != 250 {
            return Err(SessionError::Rejected {
                stage: SessionStage::Ehlo,
                response,
            });
        }

        let mut capabilities = HashMap::new();

        for line in response.content.lines().skip(1) {
            let mut fields = line.splitn(2, ' ');
            if let Some(name) = fields.next() {
                let param = fields.next().map(|s| s.to_string());
                let cap = EsmtpCapability {
                    name: name.to_string(),
                    param,
                };
                capabilities.insert(name.to_ascii_uppercase(), cap);
            }
        }

        self.capabilities = capabilities;
        Ok(&self.capabilities)
    }

    /// Issue STARTTLS and, on a `220`, run the TLS handshake over the
    /// existing stream. The caller must EHLO again afterwards before
    /// doing anything else.
    pub async fn starttls(&mut self) -> Result<(), SessionError> {
        let response = self.send_command(&Command::StartTls).await?;
        if response.code != 220 {
            return Err(SessionError::Rejected {
                stage: SessionStage::PreTls,
                response,
            });
        }

        let plain = match self.stream.take() {
            Some(stream) => stream,
            None => return Err(SessionError::NotConnected),
        };
        let stream = upgrade_to_tls(plain, &self.host, &self.tls, self.timeout).await?;
        self.stream.replace(stream);
        // The plaintext capabilities no longer apply
        self.capabilities.clear();
        Ok(())
    }

    /// AUTH LOGIN: prompt, base64 username, base64 secret. The prompt
    /// must be `334`, unless the session's quirks accept a `250`
    /// there. Username and secret rejections are reported as
    /// [`SessionError::AuthRejected`].
    pub async fn auth_login(&mut self, credentials: &Credentials) -> Result<(), SessionError> {
        let response = self.send_command(&Command::AuthLogin).await?;
        let prompted = response.code == 334
            || (self.quirks.accept_ok_as_auth_prompt && response.code == 250);
        if !prompted {
            return Err(SessionError::Rejected {
                stage: SessionStage::Auth,
                response,
            });
        }

        let response = self
            .send_command(&Command::AuthResponse(
                BASE64.encode(credentials.username.as_bytes()),
            ))
            .await?;
        if response.code != 334 {
            return Err(SessionError::AuthRejected { response });
        }

        let response = self
            .send_command(&Command::AuthResponse(
                BASE64.encode(credentials.secret.as_bytes()),
            ))
            .await?;
        if response.code != 235 {
            return Err(SessionError::AuthRejected { response });
        }

        Ok(())
    }

    /// Run the envelope and data phases: MAIL FROM, RCPT TO, DATA,
    /// then the dot-stuffed payload terminated with `CRLF.CRLF`.
    pub async fn send_mail<B: AsRef<[u8]>>(
        &mut self,
        sender: &str,
        recipient: &str,
        data: B,
    ) -> Result<Response, SessionError> {
        let response = self
            .send_command(&Command::MailFrom(sender.to_string()))
            .await?;
        if response.code != 250 {
            return Err(SessionError::Rejected {
                stage: SessionStage::MailFrom,
                response,
            });
        }

        let response = self
            .send_command(&Command::RcptTo(recipient.to_string()))
            .await?;
        if response.code != 250 {
            return Err(SessionError::Rejected {
                stage: SessionStage::RcptTo,
                response,
            });
        }

        let response = self.send_command(&Command::Data).await?;
        if response.code != 354 {
            return Err(SessionError::Rejected {
                stage: SessionStage::Data,
                response,
            });
        }

        let data: &[u8] = data.as_ref();
        let stuffed;
        let data = match apply_dot_stuffing(data) {
            Some(d) => {
                stuffed = d;
                &stuffed
            }
            None => data,
        };
        let needs_newline = data.last().map(|&b| b != b'\n').unwrap_or(true);

        tracing::trace!("message data is {} bytes", data.len());

        match self.stream.as_mut() {
            Some(stream) => match timeout(self.timeout, stream.write_all(data)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SessionError::TimedOut {
                        stage: SessionStage::Data,
                        duration: self.timeout,
                    })
                }
            },
            None => return Err(SessionError::NotConnected),
        }

        let marker = if needs_newline { "\r\n.\r\n" } else { ".\r\n" };
        tracing::trace!("send->{}: {}", self.host, marker.escape_debug());

        match self.stream.as_mut() {
            Some(stream) => match timeout(self.timeout, stream.write_all(marker.as_bytes())).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SessionError::TimedOut {
                        stage: SessionStage::Data,
                        duration: self.timeout,
                    })
                }
            },
            None => return Err(SessionError::NotConnected),
        }

        let response = self.read_response(SessionStage::Data).await?;
        if response.code != 250 {
            return Err(SessionError::Rejected {
                stage: SessionStage::Data,
                response,
            });
        }

        Ok(response)
    }

    /// Say goodbye. The response is returned but callers normally
    /// ignore it; the delivery already happened.
    pub async fn quit(&mut self) -> Result<Response, SessionError> {
        self.send_command(&Command::Quit).await
    }
}

fn apply_dot_stuffing(data: &[u8]) -> Option<Vec<u8>> {
    static LFDOT: LazyLock<Finder> = LazyLock::new(|| Finder::new("\n."));

    if !data.starts_with(b".") && LFDOT.find(data).is_none() {
        return None;
    }

    let mut stuffed = vec![];
    if data.starts_with(b".") {
        stuffed.push(b'.');
    }
    let mut last_idx = 0;
    for i in LFDOT.find_iter(data) {
        stuffed.extend_from_slice(&data[last_idx..=i]);
        stuffed.push(b'.');
        last_idx = i + 1;
    }
    stuffed.extend_from_slice(&data[last_idx..]);
    Some(stuffed)
}
