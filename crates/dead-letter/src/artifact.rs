use anyhow::anyhow;
use chrono::{DateTime, NaiveDateTime, Utc};
use mail_message::{Message, MAILER_IDENT};

pub const ARTIFACT_PREFIX: &str = "email_";
pub const ARTIFACT_SUFFIX: &str = ".txt";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Render a message in the on-disk artifact layout: a header block,
/// a blank line, the HTML body, then a `---` trailer line. Existing
/// viewers consume this layout, so it must not change shape.
pub fn format_artifact(message: &Message) -> String {
    format!(
        "To: {to}\n\
         From: {from}\n\
         Subject: {subject}\n\
         MIME-Version: 1.0\n\
         Content-Type: text/html; charset=UTF-8\n\
         X-Mailer: {mailer}\n\
         \n\
         {body}\n\
         ---\n",
        to = message.recipient(),
        from = message.from_header(),
        subject = message.subject(),
        mailer = MAILER_IDENT,
        body = message.html_body(),
    )
}

/// `email_<YYYY-MM-DD_HH-mm-ss>_<crc32 of the recipient>.txt`.
/// The timestamp is UTC; the hash keeps names for different
/// recipients apart within the same second.
pub fn artifact_file_name(recipient: &str, when: DateTime<Utc>) -> String {
    format!(
        "{ARTIFACT_PREFIX}{}_{:08x}{ARTIFACT_SUFFIX}",
        when.format(TIMESTAMP_FORMAT),
        crc32fast::hash(recipient.as_bytes())
    )
}

/// Recover the creation time encoded in an artifact file name.
/// Returns None for files that don't follow the naming pattern.
pub fn artifact_timestamp(file_name: &str) -> Option<DateTime<Utc>> {
    let rest = file_name.strip_prefix(ARTIFACT_PREFIX)?;
    let rest = rest.strip_suffix(ARTIFACT_SUFFIX)?;
    let stamp = rest.get(0..19)?;
    let parsed = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    Some(parsed.and_utc())
}

/// Derive an alternate name for `base` when the preferred name is
/// already taken: `email_..._cafebabe.txt` -> `email_..._cafebabe-2.txt`.
pub(crate) fn disambiguated(base: &str, serial: u32) -> String {
    match base.strip_suffix(ARTIFACT_SUFFIX) {
        Some(stem) => format!("{stem}-{serial}{ARTIFACT_SUFFIX}"),
        None => format!("{base}-{serial}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContent {
    pub headers: Vec<(String, String)>,
    pub html_body: String,
}

impl StoredContent {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Split a stored artifact back into its header block and body.
pub fn parse_artifact(text: &str) -> anyhow::Result<StoredContent> {
    let (header_block, rest) = text
        .split_once("\n\n")
        .ok_or_else(|| anyhow!("artifact has no header separator"))?;

    let mut headers = vec![];
    for line in header_block.lines() {
        let (name, value) = line
            .split_once(": ")
            .ok_or_else(|| anyhow!("malformed artifact header line {line:?}"))?;
        headers.push((name.to_string(), value.to_string()));
    }

    let html_body = rest
        .strip_suffix("\n---\n")
        .ok_or_else(|| anyhow!("artifact has no trailer"))?;

    Ok(StoredContent {
        headers,
        html_body: html_body.to_string(),
    })
}
