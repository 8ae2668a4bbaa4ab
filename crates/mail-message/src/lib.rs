use serde::{Deserialize, Serialize};

/// Identifier placed in the `X-Mailer` header of every rendered message.
pub const MAILER_IDENT: &str = concat!("mailfall/", env!("CARGO_PKG_VERSION"));

/// A fully composed outbound message. Constructed once and never
/// mutated; renderings are derived on demand.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    recipient: String,
    subject: String,
    html_body: String,
    from_address: String,
    #[serde(default)]
    from_name: String,
}

impl Message {
    pub fn new<R, S, B, A, N>(
        recipient: R,
        subject: S,
        html_body: B,
        from_address: A,
        from_name: N,
    ) -> Self
    where
        R: Into<String>,
        S: Into<String>,
        B: Into<String>,
        A: Into<String>,
        N: Into<String>,
    {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            html_body: html_body.into(),
            from_address: from_address.into(),
            from_name: from_name.into(),
        }
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn html_body(&self) -> &str {
        &self.html_body
    }

    pub fn from_address(&self) -> &str {
        &self.from_address
    }

    pub fn from_name(&self) -> &str {
        &self.from_name
    }

    /// The `From` header value: `Name <address>`, or the bare address
    /// when no display name was configured.
    pub fn from_header(&self) -> String {
        if self.from_name.is_empty() {
            self.from_address.clone()
        } else {
            format!("{} <{}>", self.from_name, self.from_address)
        }
    }

    /// Render the wire payload transmitted in the DATA phase:
    /// header block, blank line, HTML body, with CRLF line endings
    /// throughout.
    pub fn rfc822(&self) -> String {
        let mut out = String::with_capacity(self.html_body.len() + 256);
        out.push_str(&format!("To: {}\r\n", self.recipient));
        out.push_str(&format!("From: {}\r\n", self.from_header()));
        out.push_str(&format!("Subject: {}\r\n", self.subject));
        out.push_str("MIME-Version: 1.0\r\n");
        out.push_str("Content-Type: text/html; charset=UTF-8\r\n");
        out.push_str(&format!("X-Mailer: {MAILER_IDENT}\r\n"));
        out.push_str("\r\n");
        out.push_str(&normalize_line_endings(&self.html_body));
        out
    }

    /// Derived plain text rendering of the HTML body: tags stripped,
    /// common entities decoded. Good enough for logs and previews;
    /// not a substitute for real multipart composition.
    pub fn plain_text_body(&self) -> String {
        let mut stripped = String::with_capacity(self.html_body.len());
        let mut in_tag = false;
        for c in self.html_body.chars() {
            match c {
                '<' => in_tag = true,
                '>' => in_tag = false,
                c if !in_tag => stripped.push(c),
                _ => {}
            }
        }

        stripped
            .replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&amp;", "&")
    }
}

/// Convert any mix of `\r\n`, bare `\n` and bare `\r` to `\r\n`.
fn normalize_line_endings(text: &str) -> String {
    let data = text.as_bytes();
    let mut out = Vec::with_capacity(data.len() + 16);
    let mut last_idx = 0;

    for i in memchr::memchr2_iter(b'\r', b'\n', data) {
        if i < last_idx {
            // the \n of a \r\n pair, already emitted
            continue;
        }
        out.extend_from_slice(&data[last_idx..i]);
        out.extend_from_slice(b"\r\n");
        last_idx = if data[i] == b'\r' && data.get(i + 1).copied() == Some(b'\n') {
            i + 2
        } else {
            i + 1
        };
    }

    out.extend_from_slice(&data[last_idx..]);
    // Only ASCII line-ending bytes were rewritten; the UTF-8 data
    // around them is untouched
    unsafe { String::from_utf8_unchecked(out) }
}
