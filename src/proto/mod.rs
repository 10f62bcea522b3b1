//! Wire protocol for terminal traffic.
//!
//! Every frame on a terminal WebSocket is a UTF-8 JSON object
//! `{"Type": <tag>, "Data": <base64>}` where `Data` holds a nested JSON
//! payload. Three tags exist: `Write` (terminal bytes), `WinSize` (window
//! dimensions) and `Encrypted` (an AEAD envelope around one of the former
//! two). Byte fields are base64 strings so the same frames can be produced
//! and consumed by the browser viewer without a binary codec.
//!
//! When a [`SessionKey`] is configured the codec transparently seals every
//! outgoing `Write`/`WinSize` into an `Encrypted` envelope and opens incoming
//! ones. A codec without a key renders incoming `Encrypted` frames as a
//! visible `[ENCRYPTED] <base64>` marker instead, so a keyless viewer sees
//! that traffic exists but never the plaintext.

pub mod crypto;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crypto::SessionKey;

pub const MSG_ID_WRITE: &str = "Write";
pub const MSG_ID_WINSIZE: &str = "WinSize";
pub const MSG_ID_ENCRYPTED: &str = "Encrypted";

/// Marker prefixed to ciphertext shown to viewers that have no key.
pub const ENCRYPTED_MARKER: &str = "[ENCRYPTED] ";

/// Errors surfaced by the codec.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Malformed outer or inner JSON. The offending frame is dropped by
    /// callers; the connection continues.
    #[error("cannot decode message: {0}")]
    Decode(#[from] serde_json::Error),

    /// Top-level tag this implementation does not know. Dropped by callers
    /// for forward compatibility.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// AEAD decryption failed: bad tag, bad nonce, or wrong key. The frame is
    /// dropped; a single failure never tears down the session.
    #[error("message decryption failed")]
    CryptoFail,

    /// The url-safe base64 key material could not be parsed.
    #[error("invalid encryption key: {0}")]
    BadKey(String),
}

/// A decoded terminal-plane message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtyMessage {
    /// Raw bytes for the terminal.
    Write(Vec<u8>),
    /// Window dimensions in character cells.
    WinSize { cols: u16, rows: u16 },
}

/// Serde adapter matching Go's `[]byte` JSON marshaling: byte slices are
/// standard-base64 strings, and absent/null fields decode to empty.
mod base64_bytes {
    use super::{Engine, STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(de)? {
            None => Ok(Vec::new()),
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
        }
    }
}

/// Outer frame envelope. Also used for the nested envelope inside an
/// `Encrypted` payload.
#[derive(Serialize, Deserialize)]
struct MsgWrapper {
    #[serde(rename = "Type")]
    msg_type: String,
    #[serde(rename = "Data", with = "base64_bytes", default)]
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Default)]
struct MsgTtyWrite {
    #[serde(rename = "Data", with = "base64_bytes", default)]
    data: Vec<u8>,
    #[serde(rename = "Size", default)]
    size: usize,
}

#[derive(Serialize, Deserialize)]
struct MsgTtyWinSize {
    #[serde(rename = "Cols")]
    cols: u16,
    #[serde(rename = "Rows")]
    rows: u16,
}

#[derive(Serialize, Deserialize)]
struct MsgEncrypted {
    #[serde(rename = "EncryptedData", with = "base64_bytes", default)]
    ciphertext: Vec<u8>,
    #[serde(rename = "Nonce", with = "base64_bytes", default)]
    nonce: Vec<u8>,
}

/// Older peers encrypt the bare inner message without a nested envelope; the
/// two inner shapes are told apart structurally on decode.
#[derive(Deserialize, Default)]
struct LegacyInner {
    #[serde(rename = "Data", with = "base64_bytes", default)]
    data: Vec<u8>,
    #[serde(rename = "Cols", default)]
    cols: u16,
    #[serde(rename = "Rows", default)]
    rows: u16,
}

/// Encoder/decoder for terminal-plane frames, optionally sealing them with a
/// session key.
#[derive(Clone, Default)]
pub struct TtyCodec {
    key: Option<SessionKey>,
}

impl TtyCodec {
    /// A codec that passes frames through in cleartext.
    pub fn cleartext() -> Self {
        TtyCodec { key: None }
    }

    /// A codec that seals and opens frames with `key`.
    pub fn encrypted(key: SessionKey) -> Self {
        TtyCodec { key: Some(key) }
    }

    /// Encode a `Write` frame carrying `data`. `Size` always equals the
    /// payload length.
    pub fn encode_write(&self, data: &[u8]) -> Result<String, ProtocolError> {
        let inner = serde_json::to_vec(&MsgTtyWrite {
            data: data.to_vec(),
            size: data.len(),
        })?;
        self.encode_frame(MSG_ID_WRITE, inner)
    }

    /// Encode a `WinSize` frame.
    pub fn encode_winsize(&self, cols: u16, rows: u16) -> Result<String, ProtocolError> {
        let inner = serde_json::to_vec(&MsgTtyWinSize { cols, rows })?;
        self.encode_frame(MSG_ID_WINSIZE, inner)
    }

    fn encode_frame(&self, msg_type: &str, inner: Vec<u8>) -> Result<String, ProtocolError> {
        let wrapper = match &self.key {
            None => MsgWrapper {
                msg_type: msg_type.to_string(),
                data: inner,
            },
            Some(key) => {
                // Seal a nested {Type, Data} envelope so the receiver does not
                // have to guess the inner shape. Encrypted frames are never
                // double-wrapped.
                let plaintext = serde_json::to_vec(&MsgWrapper {
                    msg_type: msg_type.to_string(),
                    data: inner,
                })?;
                let (ciphertext, nonce) = key.seal(&plaintext)?;
                MsgWrapper {
                    msg_type: MSG_ID_ENCRYPTED.to_string(),
                    data: serde_json::to_vec(&MsgEncrypted {
                        ciphertext,
                        nonce: nonce.to_vec(),
                    })?,
                }
            }
        };
        Ok(serde_json::to_string(&wrapper)?)
    }

    /// Decode one frame of text into a [`TtyMessage`].
    pub fn decode(&self, text: &str) -> Result<TtyMessage, ProtocolError> {
        let wrapper: MsgWrapper = serde_json::from_str(text)?;
        match wrapper.msg_type.as_str() {
            MSG_ID_WRITE => {
                let msg: MsgTtyWrite = serde_json::from_slice(&wrapper.data)?;
                Ok(TtyMessage::Write(msg.data))
            }
            MSG_ID_WINSIZE => {
                let msg: MsgTtyWinSize = serde_json::from_slice(&wrapper.data)?;
                Ok(TtyMessage::WinSize {
                    cols: msg.cols,
                    rows: msg.rows,
                })
            }
            MSG_ID_ENCRYPTED => {
                let envelope: MsgEncrypted = serde_json::from_slice(&wrapper.data)?;
                match &self.key {
                    Some(key) => {
                        let plaintext = key.open(&envelope.ciphertext, &envelope.nonce)?;
                        decode_plaintext(&plaintext)
                    }
                    None => {
                        // No key: make the traffic visible without the content.
                        let marker =
                            format!("{ENCRYPTED_MARKER}{}", STANDARD.encode(&envelope.ciphertext));
                        Ok(TtyMessage::Write(marker.into_bytes()))
                    }
                }
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Parse the plaintext found inside an `Encrypted` envelope.
///
/// Accepts the nested `{Type, Data}` envelope we emit, and falls back to the
/// older bare inner JSON where a non-empty `Data` means `Write` and non-zero
/// `Cols`/`Rows` mean `WinSize`.
fn decode_plaintext(plaintext: &[u8]) -> Result<TtyMessage, ProtocolError> {
    if let Ok(wrapper) = serde_json::from_slice::<MsgWrapper>(plaintext) {
        match wrapper.msg_type.as_str() {
            MSG_ID_WRITE => {
                let msg: MsgTtyWrite = serde_json::from_slice(&wrapper.data)?;
                return Ok(TtyMessage::Write(msg.data));
            }
            MSG_ID_WINSIZE => {
                let msg: MsgTtyWinSize = serde_json::from_slice(&wrapper.data)?;
                return Ok(TtyMessage::WinSize {
                    cols: msg.cols,
                    rows: msg.rows,
                });
            }
            _ => {}
        }
    }

    let legacy: LegacyInner = serde_json::from_slice(plaintext)?;
    if !legacy.data.is_empty() {
        Ok(TtyMessage::Write(legacy.data))
    } else if legacy.cols > 0 || legacy.rows > 0 {
        Ok(TtyMessage::WinSize {
            cols: legacy.cols,
            rows: legacy.rows,
        })
    } else {
        Err(ProtocolError::UnknownType("empty encrypted payload".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn cleartext_write_roundtrip() {
        let codec = TtyCodec::cleartext();
        let frame = codec.encode_write(b"ls -la\n").unwrap();
        assert_eq!(
            codec.decode(&frame).unwrap(),
            TtyMessage::Write(b"ls -la\n".to_vec())
        );
    }

    #[test]
    fn cleartext_winsize_roundtrip() {
        let codec = TtyCodec::cleartext();
        let frame = codec.encode_winsize(120, 40).unwrap();
        assert_eq!(
            codec.decode(&frame).unwrap(),
            TtyMessage::WinSize { cols: 120, rows: 40 }
        );
    }

    #[test]
    fn wire_format_matches_envelope_shape() {
        let codec = TtyCodec::cleartext();
        let frame = codec.encode_write(b"hi").unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["Type"], "Write");

        let inner = STANDARD.decode(value["Data"].as_str().unwrap()).unwrap();
        let inner: Value = serde_json::from_slice(&inner).unwrap();
        assert_eq!(inner["Size"], 2);
        assert_eq!(inner["Data"], STANDARD.encode(b"hi"));
    }

    #[test]
    fn encrypted_roundtrip() {
        let key = SessionKey::generate();
        let codec = TtyCodec::encrypted(key);
        for msg in [
            codec.encode_write(b"secret output").unwrap(),
            codec.encode_winsize(80, 24).unwrap(),
        ] {
            let value: Value = serde_json::from_str(&msg).unwrap();
            assert_eq!(value["Type"], "Encrypted");
            assert!(!msg.contains("secret output"));
        }

        let frame = codec.encode_write(b"secret output").unwrap();
        assert_eq!(
            codec.decode(&frame).unwrap(),
            TtyMessage::Write(b"secret output".to_vec())
        );
        let frame = codec.encode_winsize(80, 24).unwrap();
        assert_eq!(
            codec.decode(&frame).unwrap(),
            TtyMessage::WinSize { cols: 80, rows: 24 }
        );
    }

    #[test]
    fn successive_encrypted_frames_differ() {
        let codec = TtyCodec::encrypted(SessionKey::generate());
        let a = codec.encode_write(b"same bytes").unwrap();
        let b = codec.encode_write(b"same bytes").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_is_crypto_fail() {
        let sender = TtyCodec::encrypted(SessionKey::generate());
        let receiver = TtyCodec::encrypted(SessionKey::generate());
        let frame = sender.encode_write(b"payload").unwrap();
        assert!(matches!(
            receiver.decode(&frame),
            Err(ProtocolError::CryptoFail)
        ));
    }

    #[test]
    fn keyless_decode_shows_marker() {
        let sender = TtyCodec::encrypted(SessionKey::generate());
        let keyless = TtyCodec::cleartext();
        let frame = sender.encode_write(b"top secret").unwrap();
        match keyless.decode(&frame).unwrap() {
            TtyMessage::Write(data) => {
                let text = String::from_utf8(data).unwrap();
                assert!(text.starts_with(ENCRYPTED_MARKER));
                assert!(!text.contains("top secret"));
            }
            other => panic!("expected Write, got {other:?}"),
        }
    }

    #[test]
    fn legacy_bare_inner_plaintext_accepted() {
        // Older senders seal the bare inner JSON without a nested envelope.
        let key = SessionKey::generate();
        let receiver = TtyCodec::encrypted(key.clone());

        let bare_write = serde_json::to_vec(&MsgTtyWrite {
            data: b"legacy".to_vec(),
            size: 6,
        })
        .unwrap();
        let (ciphertext, nonce) = key.seal(&bare_write).unwrap();
        let frame = serde_json::to_string(&MsgWrapper {
            msg_type: MSG_ID_ENCRYPTED.to_string(),
            data: serde_json::to_vec(&MsgEncrypted {
                ciphertext,
                nonce: nonce.to_vec(),
            })
            .unwrap(),
        })
        .unwrap();
        assert_eq!(
            receiver.decode(&frame).unwrap(),
            TtyMessage::Write(b"legacy".to_vec())
        );

        let bare_winsize = serde_json::to_vec(&MsgTtyWinSize { cols: 100, rows: 30 }).unwrap();
        let (ciphertext, nonce) = key.seal(&bare_winsize).unwrap();
        let frame = serde_json::to_string(&MsgWrapper {
            msg_type: MSG_ID_ENCRYPTED.to_string(),
            data: serde_json::to_vec(&MsgEncrypted {
                ciphertext,
                nonce: nonce.to_vec(),
            })
            .unwrap(),
        })
        .unwrap();
        assert_eq!(
            receiver.decode(&frame).unwrap(),
            TtyMessage::WinSize { cols: 100, rows: 30 }
        );
    }

    #[test]
    fn unknown_tag_is_reported_not_fatal() {
        let codec = TtyCodec::cleartext();
        let frame = r#"{"Type":"FutureThing","Data":null}"#;
        assert!(matches!(
            codec.decode(frame),
            Err(ProtocolError::UnknownType(t)) if t == "FutureThing"
        ));
    }

    #[test]
    fn garbage_is_decode_error() {
        let codec = TtyCodec::cleartext();
        assert!(matches!(
            codec.decode("not json at all"),
            Err(ProtocolError::Decode(_))
        ));
    }
}
