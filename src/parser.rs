//! Message parser (§4.G), grounded on `src/handler/mod.rs`'s use of
//! `mail_parser::MessageParser` to pull the header-from address back out of
//! a parsed message for authentication checks.

use mail_parser::MessageParser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("message could not be parsed as RFC 5322")]
    Malformed,
}

/// The handful of fields the validator and forwarder need out of the DATA
/// buffer; everything else is discarded once this is built.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub from: Vec<String>,
    pub subject: Option<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
}

impl ParsedMessage {
    /// `from[0]`, the header-from fed into DMARC (§4.G).
    pub fn header_from(&self) -> Option<&str> {
        self.from.first().map(String::as_str)
    }
}

pub fn parse(raw: &[u8]) -> Result<ParsedMessage, ParseError> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or(ParseError::Malformed)?;

    let from = message
        .from()
        .map(|addrs| {
            addrs
                .iter()
                .filter_map(|addr| addr.address())
                .map(|addr| addr.to_string())
                .collect()
        })
        .unwrap_or_default();

    Ok(ParsedMessage {
        from,
        subject: message.subject().map(str::to_string),
        html_body: message.body_html(0).map(|s| s.to_string()),
        text_body: message.body_text(0).map(|s| s.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_subject_and_bodies() {
        let raw = b"From: sender@example.com\r\n\
Subject: hello\r\n\
Content-Type: text/plain\r\n\
\r\n\
hi there\r\n";

        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.header_from(), Some("sender@example.com"));
        assert_eq!(parsed.subject.as_deref(), Some("hello"));
        assert_eq!(parsed.text_body.as_deref(), Some("hi there"));
    }

    #[test]
    fn rejects_empty_buffer() {
        assert!(matches!(parse(b""), Err(ParseError::Malformed)));
    }
}
