//! Wire format for the KeePassXC browser protocol.
//!
//! Every message is a single JSON object written to the socket. There is no
//! length prefix or delimiter, so [`JsonFramer`] reads until one complete
//! JSON value has arrived instead of trusting a single `read` to return a
//! whole document.
//!
//! Two envelope shapes exist:
//!
//! - **Plain** (key exchange only): the logical message plus a random
//!   `nonce` used as a correlation token, and `clientID`.
//! - **Encrypted**: `{action, nonce, message, clientID}` where `message` is
//!   the base64 ciphertext of the JSON-serialized logical message and
//!   `nonce` the base64 box nonce.
//!
//! # Example
//!
//! ```
//! use kpht_core::codec::{Message, WireCodec};
//! use serde_json::json;
//!
//! let codec = WireCodec::new("kpht-test");
//! let mut message = Message::new();
//! message.insert("action".to_string(), json!("change-public-keys"));
//!
//! let bytes = codec.encode_plain(message).unwrap();
//! let envelope: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
//! assert_eq!(envelope["clientID"], "kpht-test");
//! assert!(envelope["nonce"].is_string());
//! ```

use std::io::{self, Read};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::IgnoredAny;
use serde_json::Value;
use tracing::{trace, warn};

use crate::crypto::{generate_nonce, SealedPayload, NONCE_SIZE};
use crate::error::{Error, Result};

/// A logical protocol message (or response) as a JSON object.
pub type Message = serde_json::Map<String, Value>;

/// Upper bound for a single response document.
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Size of each read from the stream.
const READ_CHUNK_SIZE: usize = 4096;

/// Builds outgoing envelopes for one client ID.
#[derive(Debug, Clone)]
pub struct WireCodec {
    client_id: String,
}

impl WireCodec {
    /// Create a codec that stamps every envelope with `client_id`.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }

    /// The client ID attached to every envelope.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Encode a plaintext envelope: adds a fresh `nonce` and `clientID`.
    pub fn encode_plain(&self, mut message: Message) -> Result<Vec<u8>> {
        message.insert(
            "nonce".to_string(),
            Value::String(STANDARD.encode(generate_nonce())),
        );
        message.insert(
            "clientID".to_string(),
            Value::String(self.client_id.clone()),
        );
        serde_json::to_vec(&message).map_err(|e| Error::SendFailed(e.into()))
    }

    /// Encode an encrypted envelope around an already sealed payload.
    pub fn encode_encrypted(&self, action: &str, sealed: &SealedPayload) -> Result<Vec<u8>> {
        let mut envelope = Message::new();
        envelope.insert("action".to_string(), Value::String(action.to_string()));
        envelope.insert(
            "nonce".to_string(),
            Value::String(STANDARD.encode(sealed.nonce())),
        );
        envelope.insert(
            "message".to_string(),
            Value::String(STANDARD.encode(sealed.ciphertext())),
        );
        envelope.insert(
            "clientID".to_string(),
            Value::String(self.client_id.clone()),
        );
        serde_json::to_vec(&envelope).map_err(|e| Error::SendFailed(e.into()))
    }
}

/// A decoded response envelope.
///
/// For encrypted exchanges the client replaces the `message` field with the
/// decrypted JSON object before handing the response out.
#[derive(Debug, Clone, PartialEq)]
pub struct Response(Message);

impl Response {
    /// Parse a response document.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(Error::InvalidResponse(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
            Err(e) => Err(Error::InvalidResponse(format!("malformed JSON: {}", e))),
        }
    }

    /// The daemon's explicit error, if the response carries one.
    pub fn protocol_error(&self) -> Option<Error> {
        let message = self.0.get("error")?;
        let code = match self.0.get("errorCode") {
            Some(Value::String(code)) => code.clone(),
            Some(Value::Null) | None => "unknown".to_string(),
            Some(other) => other.to_string(),
        };
        let message = match message {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Some(Error::Protocol { code, message })
    }

    /// A top-level string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// The decrypted inner message, once substituted by the client.
    pub fn message(&self) -> Option<&Message> {
        self.0.get("message").and_then(Value::as_object)
    }

    /// Decode the `nonce` and `message` fields of an encrypted response.
    pub fn sealed_parts(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let nonce = self.decode_field("nonce")?;
        if nonce.len() != NONCE_SIZE {
            return Err(Error::InvalidResponse(format!(
                "nonce must be {} bytes, got {}",
                NONCE_SIZE,
                nonce.len()
            )));
        }
        let ciphertext = self.decode_field("message")?;
        Ok((nonce, ciphertext))
    }

    /// Replace the `message` field with its decrypted form.
    pub(crate) fn set_message(&mut self, message: Message) {
        self.0
            .insert("message".to_string(), Value::Object(message));
    }

    /// The underlying JSON object.
    pub fn as_map(&self) -> &Message {
        &self.0
    }

    fn decode_field(&self, key: &str) -> Result<Vec<u8>> {
        let encoded = self
            .get_str(key)
            .ok_or_else(|| Error::InvalidResponse(format!("missing `{}` field", key)))?;
        STANDARD
            .decode(encoded)
            .map_err(|e| Error::InvalidResponse(format!("`{}` is not valid base64: {}", key, e)))
    }
}

/// Parse a decrypted payload into a message object.
pub fn parse_message(plaintext: &[u8]) -> Result<Message> {
    match serde_json::from_slice::<Value>(plaintext) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::InvalidResponse(format!(
            "decrypted message is {}, expected an object",
            json_kind(&other)
        ))),
        Err(e) => Err(Error::InvalidResponse(format!(
            "decrypted message is not JSON: {}",
            e
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Splits a byte stream into complete JSON documents.
///
/// Bytes received after the end of a document are kept for the next call.
/// Only objects and arrays are framed; any other leading byte is rejected
/// as soon as it arrives.
#[derive(Debug)]
pub struct JsonFramer {
    pending: Vec<u8>,
    scanner: ValueScanner,
    limit: usize,
}

impl JsonFramer {
    /// Create a framer with the default size limit.
    pub fn new() -> Self {
        Self::with_limit(MAX_DOCUMENT_SIZE)
    }

    /// Create a framer with a custom size limit.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            scanner: ValueScanner::default(),
            limit,
        }
    }

    /// Read from `reader` until one complete JSON value is buffered and
    /// return its bytes.
    ///
    /// # Errors
    ///
    /// - `UnexpectedEof` if the peer closes before the document completes.
    /// - `InvalidData` if the bytes cannot be JSON or exceed the size limit.
    /// - Any error (including timeouts) from the underlying reader.
    pub fn read_document<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Vec<u8>> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            if let Some(end) = self.scanner.scan(&self.pending)? {
                self.scanner = ValueScanner::default();
                let rest = self.pending.split_off(end);
                let document = std::mem::replace(&mut self.pending, rest);
                serde_json::from_slice::<IgnoredAny>(&document)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                if !self.pending.iter().all(u8::is_ascii_whitespace) {
                    warn!(
                        extra = self.pending.len(),
                        "Received bytes after the end of a response"
                    );
                }
                return Ok(document);
            }

            if self.pending.len() > self.limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("response exceeds {} bytes", self.limit),
                ));
            }

            let n = match reader.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                let reason = if self.pending.iter().all(u8::is_ascii_whitespace) {
                    "connection closed before a response arrived"
                } else {
                    "connection closed in the middle of a response"
                };
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, reason));
            }
            trace!(bytes = n, buffered = self.pending.len() + n, "Read chunk");
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Finds the end of the first top-level object or array in a growing
/// buffer. Each byte is looked at once; the value itself is validated by
/// serde_json after the closing bracket is found.
#[derive(Debug, Default)]
struct ValueScanner {
    offset: usize,
    depth: usize,
    started: bool,
    in_string: bool,
    escaped: bool,
}

impl ValueScanner {
    /// Scan the bytes of `buf` not seen yet. Returns the offset just past
    /// the closing bracket once the value is complete.
    fn scan(&mut self, buf: &[u8]) -> io::Result<Option<usize>> {
        while let Some(&byte) = buf.get(self.offset) {
            self.offset += 1;

            if !self.started {
                match byte {
                    b'{' | b'[' => {
                        self.started = true;
                        self.depth = 1;
                    }
                    b if b.is_ascii_whitespace() => {}
                    other => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("expected a JSON object, found byte 0x{:02x}", other),
                        ))
                    }
                }
                continue;
            }

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Ok(Some(self.offset));
                    }
                }
                _ => {}
            }
        }
        Ok(None)
    }
}

impl Default for JsonFramer {
    fn default() -> Self {
        Self::new()
    }
}
