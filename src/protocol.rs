//! WebSocket wire protocol.

use serde::{Deserialize, Serialize};

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Run {
        lang: String,
        #[serde(default)]
        code: String,
    },
    Stdin {
        data: String,
    },
}

/// Messages sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Stdout { data: String },
    Stderr { data: String },
    Exit { code: i32 },
    Error { data: String },
}

impl ClientMessage {
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl ServerMessage {
    pub fn error(data: impl Into<String>) -> Self {
        ServerMessage::Error { data: data.into() }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Incremental UTF-8 decoding for one output stream.
///
/// A multi-byte character split across two reads is held back until the
/// rest of it arrives, so chunk boundaries never produce replacement
/// characters. Genuinely invalid bytes are replaced.
#[derive(Debug, Default)]
pub struct TextDecoder {
    pending: Vec<u8>,
}

impl TextDecoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let split = self.pending.len() - incomplete_suffix_len(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    /// Flush whatever is still held back.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a truncated multi-byte sequence at the end of `bytes`.
fn incomplete_suffix_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let b = bytes[bytes.len() - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match b {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => return 0,
        };
        return if back < width { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_client_messages() {
        assert_eq!(
            ClientMessage::decode(r#"{"type":"run","lang":"python","code":"print(1+1)"}"#).unwrap(),
            ClientMessage::Run {
                lang: "python".into(),
                code: "print(1+1)".into()
            }
        );
        assert_eq!(
            ClientMessage::decode(r#"{"type":"stdin","data":"hello\n"}"#).unwrap(),
            ClientMessage::Stdin { data: "hello\n".into() }
        );
        assert_eq!(
            ClientMessage::decode(r#"{"type":"run","lang":"ruby"}"#).unwrap(),
            ClientMessage::Run {
                lang: "ruby".into(),
                code: String::new()
            }
        );
    }

    #[test]
    fn rejects_malformed_client_messages() {
        assert!(ClientMessage::decode("not json").is_err());
        assert!(ClientMessage::decode(r#"{"type":"kill"}"#).is_err());
        assert!(ClientMessage::decode(r#"{"type":"stdin"}"#).is_err());
        assert!(ClientMessage::decode(r#"{"lang":"python","code":""}"#).is_err());
    }

    #[test]
    fn encodes_server_messages() {
        let encode = |m: ServerMessage| serde_json::from_str::<serde_json::Value>(&m.encode().unwrap()).unwrap();
        assert_eq!(
            encode(ServerMessage::Stdout { data: "2\n".into() }),
            serde_json::json!({"type": "stdout", "data": "2\n"})
        );
        assert_eq!(
            encode(ServerMessage::Stderr { data: "oops".into() }),
            serde_json::json!({"type": "stderr", "data": "oops"})
        );
        assert_eq!(
            encode(ServerMessage::Exit { code: 7 }),
            serde_json::json!({"type": "exit", "code": 7})
        );
        assert_eq!(
            encode(ServerMessage::error("Unsupported language: cobol")),
            serde_json::json!({"type": "error", "data": "Unsupported language: cobol"})
        );
    }

    #[test]
    fn split_characters_are_held_back() {
        let mut decoder = TextDecoder::default();
        let bytes = "héllo €".as_bytes();
        // 'é' is 2 bytes starting at 1, '€' is 3 bytes at the end
        assert_eq!(decoder.decode(&bytes[..2]), "h");
        assert_eq!(decoder.decode(&bytes[2..bytes.len() - 1]), "éllo ");
        assert_eq!(decoder.decode(&bytes[bytes.len() - 1..]), "€");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn invalid_and_truncated_bytes_are_replaced() {
        let mut decoder = TextDecoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
        assert_eq!(decoder.decode(b"c\xe2\x82"), "c");
        assert_eq!(decoder.finish(), "\u{fffd}");
        assert_eq!(decoder.finish(), "");
    }
}
