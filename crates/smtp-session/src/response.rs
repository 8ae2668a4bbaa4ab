use serde::{Deserialize, Serialize};

/// A complete server response: the three-digit code that gates the
/// state machine plus the full text, which is kept only for
/// diagnostics. Multi-line responses are collapsed with `\n`
/// separators between the per-line contents.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Hash)]
pub struct Response {
    pub code: u16,
    #[serde(serialize_with = "as_single_line")]
    pub content: String,
}

impl Response {
    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);
        line.push_str(&remove_line_break(&self.content));
        line
    }
}

fn remove_line_break(data: &str) -> String {
    let data = data.as_bytes();
    let mut normalized = Vec::with_capacity(data.len());
    let mut last_idx = 0;

    for i in memchr::memchr2_iter(b'\r', b'\n', data) {
        match data[i] {
            b'\r' => {
                normalized.extend_from_slice(&data[last_idx..i]);
                if data.get(i + 1).copied() != Some(b'\n') {
                    normalized.push(b' ');
                }
            }
            b'\n' => {
                normalized.extend_from_slice(&data[last_idx..i]);
                normalized.push(b' ');
            }
            _ => unreachable!(),
        }
        last_idx = i + 1;
    }

    normalized.extend_from_slice(&data[last_idx..]);
    // This is safe because data comes from str, which is
    // guaranteed to be valid utf8, and all we're manipulating
    // above is whitespace which won't invalidate the utf8
    // byte sequences in the data byte array
    unsafe { String::from_utf8_unchecked(normalized) }
}

/// One parsed line of a (possibly multi-line) response.
/// `is_final` is false for `XYZ-` continuation lines.
#[derive(Debug, PartialEq, Eq)]
pub struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

impl<'a> ResponseLine<'a> {
    /// Reconsitute the original line that we parsed
    fn to_original_line(&self) -> String {
        format!(
            "{}{}{}",
            self.code,
            if self.is_final { " " } else { "-" },
            self.content
        )
    }
}

/// Parse a single line: three digits, then either a space (final
/// line) or a dash (continuation), then the text.
pub fn parse_response_line(line: &str) -> Result<ResponseLine, String> {
    if line.len() < 4 {
        return Err(line.to_string());
    }

    match line.as_bytes()[3] {
        b' ' | b'-' => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ResponseLine {
                code,
                is_final: line.as_bytes()[3] == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(line.to_string()),
        },
        _ => Err(line.to_string()),
    }
}

pub(crate) struct ResponseBuilder {
    pub code: u16,
    pub content: String,
}

impl ResponseBuilder {
    pub fn new(parsed: &ResponseLine) -> Self {
        Self {
            code: parsed.code,
            content: parsed.content.to_string(),
        }
    }

    /// Continuation lines must repeat the code of the first line;
    /// anything else is a framing error and the offending line is
    /// handed back for the error message.
    pub fn add_line(&mut self, parsed: &ResponseLine) -> Result<(), String> {
        if parsed.code != self.code {
            return Err(parsed.to_original_line());
        }

        self.content.push('\n');
        self.content.push_str(parsed.content);
        Ok(())
    }

    pub fn build(self) -> Response {
        Response {
            code: self.code,
            content: self.content,
        }
    }
}

fn as_single_line<S>(content: &String, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&remove_line_break(content))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn response_line_parsing() {
        assert_eq!(
            parse_response_line("220 woot").unwrap(),
            ResponseLine {
                code: 220,
                is_final: true,
                content: "woot"
            }
        );
        assert_eq!(
            parse_response_line("220-woot").unwrap(),
            ResponseLine {
                code: 220,
                is_final: false,
                content: "woot"
            }
        );

        assert!(parse_response_line("220_woot").is_err());
        assert!(parse_response_line("not really").is_err());
        assert!(parse_response_line("22").is_err());
    }

    #[test]
    fn multi_line_response() {
        let mut builder = ResponseBuilder::new(&parse_response_line("250-mail.example.com").unwrap());
        builder
            .add_line(&parse_response_line("250-PIPELINING").unwrap())
            .unwrap();
        builder
            .add_line(&parse_response_line("250 STARTTLS").unwrap())
            .unwrap();
        let response = builder.build();
        assert_eq!(response.code, 250);
        assert_eq!(response.content, "mail.example.com\nPIPELINING\nSTARTTLS");
        assert_eq!(
            response.to_single_line(),
            "250 mail.example.com PIPELINING STARTTLS"
        );
    }

    #[test]
    fn mismatched_continuation_code() {
        let mut builder = ResponseBuilder::new(&parse_response_line("250-one").unwrap());
        assert_eq!(
            builder
                .add_line(&parse_response_line("220 two").unwrap())
                .unwrap_err(),
            "220 two"
        );
    }

    #[test]
    fn remove_crlf() {
        fn remove(s: &str, expect: &str) {
            assert_eq!(remove_line_break(s), expect, "input: {s:?}");
        }

        remove("hello\r\nthere\r\n", "hello there ");
        remove("hello\r", "hello ");
        remove("hello\nthere\r\n", "hello there ");
        remove("hello\r\nthere\n", "hello there ");
        remove("hello\r\r\r\nthere\n", "hello   there ");
    }
}
