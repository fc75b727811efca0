//! BlueWatch Wire Protocol
//!
//! This module contains the protocol definitions for talking to the watch
//! over the Nordic UART service.
//!
//! # Outbound (phone → watch)
//!
//! The watch runs a JavaScript interpreter on its UART. Every write is a
//! line of code that hands one piece of the message to the watch app:
//!
//! ```text
//! require('BlueWatch').receive('<escaped chunk>')\n
//! ```
//!
//! A message is terminated by [`TERMINATOR`] and split into as many chunks as
//! needed; the watch concatenates chunk bodies until it sees the terminator.
//! Each chunk is a self-contained string literal body: chunk boundaries never
//! fall inside an escape sequence or a multi-byte character.
//!
//! # Inbound (watch → phone)
//!
//! Newline-terminated records, either JSON packets or bare command tokens.
//! See [`crate::domain::reassembler`] and [`crate::domain::commands`].

use anyhow::Result;
use tracing::warn;
use uuid::Uuid;

/// Nordic UART Service UUID
pub const SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/// Write characteristic (the watch's RX) - where commands are sent
pub const WRITE_CHAR_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

/// Notify characteristic (the watch's TX) - where records are received
pub const NOTIFY_CHAR_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/// Key under which the bonded watch's identifier is persisted
pub const IDENTITY_KEY: &str = "banglePeripheralID";

/// Expression the watch evaluates for every chunk
pub const RECEIVE_PREFIX: &str = "require('BlueWatch').receive";

/// Marks the end of a message across chunk boundaries (EOT)
pub const TERMINATOR: char = '\u{4}';

/// Longest escaped form of a single character, in bytes
pub const MIN_CHUNK_SIZE: usize = 4;

/// Bytes the wrapper adds around a chunk body
pub const WRAPPER_OVERHEAD: usize = RECEIVE_PREFIX.len() + "('')\n".len();

/// Parse a UUID string
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str).map_err(|e| anyhow::anyhow!("Invalid UUID {}: {}", uuid_str, e))
}

/// Escape one character for a single-quoted string literal on one line.
fn push_escaped(out: &mut String, c: char) {
    match c {
        '\\' => out.push_str("\\\\"),
        '\'' => out.push_str("\\'"),
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        TERMINATOR => out.push_str("\\x04"),
        _ => out.push(c),
    }
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        push_escaped(&mut out, c);
    }
    out
}

/// Reverse [`escape`]. Returns `None` for a malformed escape sequence.
pub fn unescape(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            'x' => {
                let hex: String = chars.by_ref().take(2).collect();
                let code = u8::from_str_radix(&hex, 16).ok()?;
                out.push(char::from(code));
            }
            _ => return None,
        }
    }
    Some(out)
}

/// Split a message into escaped chunk bodies of at most `chunk_size` bytes.
///
/// The terminator is appended before escaping. A literal terminator inside
/// `message` is removed, otherwise the watch would cut the message short.
pub fn chunk_message(message: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(MIN_CHUNK_SIZE);

    let payload: String = if message.contains(TERMINATOR) {
        warn!("Stripping terminator character from outbound message");
        message.chars().filter(|&c| c != TERMINATOR).collect()
    } else {
        message.to_string()
    };

    let mut chunks = Vec::new();
    let mut current = String::with_capacity(chunk_size);
    let mut token = String::with_capacity(MIN_CHUNK_SIZE);

    for c in payload.chars().chain(std::iter::once(TERMINATOR)) {
        token.clear();
        push_escaped(&mut token, c);
        if !current.is_empty() && current.len() + token.len() > chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(&token);
    }
    chunks.push(current);
    chunks
}

/// Wrap a chunk body in the receive expression.
pub fn wrap_chunk(body: &str) -> Vec<u8> {
    format!("{}('{}')\n", RECEIVE_PREFIX, body).into_bytes()
}

/// Every write needed to deliver `message`, in order.
pub fn encode_message(message: &str, chunk_size: usize) -> Vec<Vec<u8>> {
    chunk_message(message, chunk_size)
        .iter()
        .map(|body| wrap_chunk(body))
        .collect()
}

/// Extract the chunk body from one write, as the watch would see it.
pub fn unwrap_chunk(write: &[u8]) -> Option<&str> {
    std::str::from_utf8(write)
        .ok()?
        .strip_prefix(RECEIVE_PREFIX)?
        .strip_prefix("('")?
        .strip_suffix("')\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(chunks: &[String]) -> String {
        chunks.iter().map(|c| unescape(c).unwrap()).collect()
    }

    #[test]
    fn test_parse_uuid() {
        let uuid = parse_uuid(SERVICE_UUID).unwrap();
        assert_eq!(uuid.as_u128() >> 96, 0x6e400001);
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_short_message_is_one_write() {
        let writes = encode_message("Buzz", 140);
        assert_eq!(writes.len(), 1);
        assert_eq!(
            writes[0],
            b"require('BlueWatch').receive('Buzz\\x04')\n".to_vec()
        );
    }

    #[test]
    fn test_escaping() {
        assert_eq!(escape(r"it's a\b"), r"it\'s a\\b");
        assert_eq!(escape("a\nb"), "a\\nb");
        assert_eq!(unescape(r"it\'s a\\b\x04"), Some("it's a\\b\u{4}".to_string()));
        assert_eq!(unescape(r"bad\q"), None);
        assert_eq!(unescape("dangling\\"), None);
    }

    #[test]
    fn test_chunks_reassemble_to_message_and_terminator() {
        let messages = [
            String::new(),
            "iPhone Connected".to_string(),
            r#"{"type":"weather","city":"O'Fallon","note":"C:\\temp"}"#.to_string(),
            "Zürich – 12°C, ☀️".repeat(20),
            "'\\'\\\n".repeat(50),
        ];
        for message in &messages {
            for chunk_size in [MIN_CHUNK_SIZE, 5, 7, 20, 140] {
                let chunks = chunk_message(message, chunk_size);
                assert!(chunks.iter().all(|c| c.len() <= chunk_size));
                assert!(chunks.iter().all(|c| unescape(c).is_some()));
                assert_eq!(
                    reassemble(&chunks),
                    format!("{}{}", message, TERMINATOR),
                    "chunk size {}",
                    chunk_size
                );
            }
        }
    }

    #[test]
    fn test_terminator_only_in_last_chunk() {
        let chunks = chunk_message(&"x".repeat(300), 140);
        assert_eq!(chunks.len(), 3);
        let (last, rest) = chunks.split_last().unwrap();
        assert!(last.ends_with("\\x04"));
        assert!(rest.iter().all(|c| !c.contains("\\x04")));
    }

    #[test]
    fn test_literal_terminator_is_stripped() {
        let chunks = chunk_message("a\u{4}b", 140);
        assert_eq!(reassemble(&chunks), "ab\u{4}");
    }

    #[test]
    fn test_chunk_size_is_clamped() {
        let chunks = chunk_message("ab", 1);
        assert_eq!(reassemble(&chunks), "ab\u{4}");
        assert!(chunks.iter().all(|c| c.len() <= MIN_CHUNK_SIZE));
    }

    #[test]
    fn test_unwrap_chunk() {
        let writes = encode_message("it's", 140);
        assert_eq!(unwrap_chunk(&writes[0]), Some("it\\'s\\x04"));
        assert_eq!(unwrap_chunk(b"print('hi')\n"), None);
        assert_eq!(writes[0].len(), WRAPPER_OVERHEAD + "it\\'s\\x04".len());
    }
}
