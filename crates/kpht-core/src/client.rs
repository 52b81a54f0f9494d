//! The KeePassXC browser-protocol client.
//!
//! [`ProtocolClient::open`] connects to the daemon and drives the handshake:
//!
//! ```text
//! Disconnected --change-public-keys--> KeysExchanged
//! KeysExchanged --associate | test-associate--> Associated --> Ready
//! any step --error--> Failed
//! ```
//!
//! - `change-public-keys` is sent in the clear and yields the daemon's
//!   session public key.
//! - Without a stored association, `associate` registers a freshly
//!   generated association key and the daemon's answer is persisted through
//!   the [`IdentityStore`].
//! - With a stored association, `test-associate` checks that the daemon
//!   still accepts it.
//!
//! Every later request is sealed with the session keys. A single connection
//! attempt is made and no step is retried.
//!
//! # Example
//!
//! ```no_run
//! use kpht_core::{ClientOptions, MemoryIdentityStore, ProtocolClient};
//!
//! let mut identity = MemoryIdentityStore::new();
//! let mut client = ProtocolClient::open(&mut identity, ClientOptions::default())?;
//! let logins = client.query_logins("script://keepassxc.go")?;
//! for login in &logins {
//!     println!("{}", login.format_combined(&["%s (%s)", "name", "login"]));
//! }
//! client.close();
//! # Ok::<(), kpht_core::Error>(())
//! ```
//!
//! # Timeouts
//!
//! Each read and write is bounded by [`ClientOptions::io_timeout`], and the
//! whole handshake by [`ClientOptions::handshake_timeout`]. Expiry surfaces
//! as [`Error::SendFailed`] with a timed-out I/O error.

use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::codec::{parse_message, JsonFramer, Message, Response, WireCodec};
use crate::config::{ConnectionConfig, DEFAULT_APPLICATION_NAME};
use crate::crypto::{generate_nonce, CryptoSession, PublicKey, SecretKey};
use crate::endpoint::Endpoint;
use crate::entry::CredentialSet;
use crate::error::{Error, HandshakeStep, Result};
use crate::identity::IdentityStore;
use crate::transport::{ByteStream, LocalTransport, Transport};

const ACTION_CHANGE_PUBLIC_KEYS: &str = "change-public-keys";
const ACTION_ASSOCIATE: &str = "associate";
const ACTION_TEST_ASSOCIATE: &str = "test-associate";
const ACTION_GET_LOGINS: &str = "get-logins";

/// Where the client is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No handshake has happened (or the client was closed).
    Disconnected,
    /// Session keys are exchanged; the association is not checked yet.
    KeysExchanged,
    /// The association is established or confirmed.
    Associated,
    /// Requests such as `get-logins` may be sent.
    Ready,
    /// A step failed; the connection is unusable.
    Failed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Disconnected => write!(f, "disconnected"),
            ClientState::KeysExchanged => write!(f, "keys exchanged"),
            ClientState::Associated => write!(f, "associated"),
            ClientState::Ready => write!(f, "ready"),
            ClientState::Failed => write!(f, "failed"),
        }
    }
}

/// Connection settings for [`ProtocolClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Prefix of the client ID.
    pub application_name: String,
    /// Explicit socket/pipe path; `None` runs platform discovery.
    pub socket_path: Option<PathBuf>,
    /// Bound on every read and write; `None` blocks indefinitely.
    pub io_timeout: Option<Duration>,
    /// Bound on the whole handshake; `None` disables it.
    pub handshake_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

impl ClientOptions {
    /// Options from the `[connection]` config table.
    pub fn from_config(config: &ConnectionConfig) -> Self {
        let application_name = if config.application_name.is_empty() {
            DEFAULT_APPLICATION_NAME.to_string()
        } else {
            config.application_name.clone()
        };
        Self {
            application_name,
            socket_path: config.socket_path.clone(),
            io_timeout: config.io_timeout(),
            handshake_timeout: config.handshake_timeout(),
        }
    }
}

/// The association in use for this session.
struct Association {
    name: String,
    key: SecretKey,
}

/// An encrypted session with KeePassXC.
pub struct ProtocolClient {
    stream: Option<Box<dyn ByteStream>>,
    codec: WireCodec,
    crypto: CryptoSession,
    framer: JsonFramer,
    state: ClientState,
    association: Option<Association>,
    io_timeout: Option<Duration>,
    deadline: Option<Instant>,
    awaiting_user: bool,
}

impl fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("client_id", &self.codec.client_id())
            .field("state", &self.state)
            .field("connected", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}

impl ProtocolClient {
    /// Connect over the platform transport and complete the handshake.
    ///
    /// # Errors
    ///
    /// - [`Error::EndpointNotFound`] if no socket can be located.
    /// - [`Error::Transport`] if connecting fails.
    /// - [`Error::Handshake`] naming the step that failed otherwise.
    pub fn open<S>(identity: &mut S, options: ClientOptions) -> Result<Self>
    where
        S: IdentityStore + ?Sized,
    {
        Self::open_with(identity, &LocalTransport, options)
    }

    /// Like [`open`](Self::open), connecting through `transport`.
    pub fn open_with<S, T>(identity: &mut S, transport: &T, options: ClientOptions) -> Result<Self>
    where
        S: IdentityStore + ?Sized,
        T: Transport + ?Sized,
    {
        let endpoint = Endpoint::resolve(options.socket_path.as_deref())?;
        let stream = transport.connect(&endpoint)?;
        Self::with_stream(identity, stream, options)
    }

    /// Complete the handshake over an already connected stream.
    pub fn with_stream<S>(
        identity: &mut S,
        stream: Box<dyn ByteStream>,
        options: ClientOptions,
    ) -> Result<Self>
    where
        S: IdentityStore + ?Sized,
    {
        let client_id = format!(
            "{}{}",
            options.application_name,
            STANDARD.encode(generate_nonce())
        );
        debug!(client_id = %client_id, "Starting keepassxc session");

        let mut client = Self {
            stream: Some(stream),
            codec: WireCodec::new(client_id),
            crypto: CryptoSession::new(),
            framer: JsonFramer::new(),
            state: ClientState::Disconnected,
            association: None,
            io_timeout: options.io_timeout,
            deadline: options.handshake_timeout.map(|t| Instant::now() + t),
            awaiting_user: false,
        };

        let outcome = client.handshake(identity);
        client.deadline = None;
        match outcome {
            Ok(()) => Ok(client),
            Err(e) => {
                client.transition(ClientState::Failed);
                client.close();
                Err(e)
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// The client ID sent with every message.
    pub fn client_id(&self) -> &str {
        self.codec.client_id()
    }

    /// Name of the association used for this session, once established.
    pub fn association_name(&self) -> Option<&str> {
        self.association.as_ref().map(|a| a.name.as_str())
    }

    fn transition(&mut self, next: ClientState) {
        trace!(from = %self.state, to = %next, "Client state change");
        self.state = next;
    }

    fn handshake<S>(&mut self, identity: &mut S) -> Result<()>
    where
        S: IdentityStore + ?Sized,
    {
        self.exchange_keys()
            .map_err(|e| e.in_step(HandshakeStep::KeyExchange))?;
        self.transition(ClientState::KeysExchanged);

        match identity.association_key() {
            Some(key) => {
                let name = identity.association_name();
                self.test_associate(name, key)
                    .map_err(|e| e.in_step(HandshakeStep::TestAssociate))?;
            }
            None => self
                .associate(identity)
                .map_err(|e| e.in_step(HandshakeStep::Associate))?,
        }
        self.transition(ClientState::Associated);
        self.transition(ClientState::Ready);
        Ok(())
    }

    fn exchange_keys(&mut self) -> Result<()> {
        let message = action_message(ACTION_CHANGE_PUBLIC_KEYS, [(
            "publicKey",
            Value::String(self.crypto.public_key().to_base64()),
        )]);
        let response = self.send_message(message, false)?;

        let encoded = response
            .get_str("publicKey")
            .ok_or_else(|| Error::KeyExchangeFailed("response has no publicKey".to_string()))?;
        let peer = PublicKey::from_base64(encoded).ok_or_else(|| {
            Error::KeyExchangeFailed("publicKey is not a base64 encoded 32 byte key".to_string())
        })?;
        self.crypto.set_peer_key(peer);
        debug!("Exchanged session keys with keepassxc");
        Ok(())
    }

    fn associate<S>(&mut self, identity: &mut S) -> Result<()>
    where
        S: IdentityStore + ?Sized,
    {
        let key = SecretKey::generate();
        let message = action_message(ACTION_ASSOCIATE, [
            ("key", Value::String(self.crypto.public_key().to_base64())),
            ("idKey", Value::String(key.public_key().to_base64())),
        ]);
        // KeePassXC answers only once the user approved the new client.
        self.awaiting_user = true;
        let response = self.send_message(message, true);
        self.awaiting_user = false;
        let response = response.map_err(|e| match e {
            Error::InvalidResponse(reason) => Error::AssociationFailed(reason),
            other => other,
        })?;

        let name = response
            .message()
            .and_then(|m| m.get("id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::AssociationFailed("response has no id".to_string()))?
            .to_string();

        identity.set_association(&name, &key)?;
        debug!(association = %name, "Associated with keepassxc");
        self.association = Some(Association { name, key });
        Ok(())
    }

    fn test_associate(&mut self, name: String, key: SecretKey) -> Result<()> {
        let message = action_message(ACTION_TEST_ASSOCIATE, [
            ("key", Value::String(key.public_key().to_base64())),
            ("id", Value::String(name.clone())),
        ]);
        self.send_message(message, true)
            .map_err(|e| Error::TestAssociationFailed(Box::new(e)))?;
        debug!(association = %name, "Association confirmed by keepassxc");
        self.association = Some(Association { name, key });
        Ok(())
    }

    /// Fetch the logins KeePassXC has stored for `url`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotReady`] unless the handshake completed.
    /// - [`Error::Protocol`] if KeePassXC answers with an error (e.g. no
    ///   logins found, database locked).
    /// - [`Error::InvalidResponse`] if the answer carries no entries.
    pub fn query_logins(&mut self, url: &str) -> Result<CredentialSet> {
        if self.state != ClientState::Ready {
            return Err(Error::NotReady(self.state.to_string()));
        }
        let (name, key) = match &self.association {
            Some(a) => (a.name.clone(), a.key.public_key().to_base64()),
            None => return Err(Error::NotReady("no association".to_string())),
        };

        let message = action_message(ACTION_GET_LOGINS, [
            ("url", Value::String(url.to_string())),
            ("keys", json!([{ "id": name, "key": key }])),
        ]);
        let response = self.send_message(message, true)?;
        let inner = response
            .message()
            .ok_or_else(|| Error::InvalidResponse("response has no message".to_string()))?;
        let logins = CredentialSet::from_message(inner)?;
        debug!(count = logins.len(), "Received logins");
        Ok(logins)
    }

    /// Send one request and wait for its response.
    ///
    /// Encrypted requests are sealed with the session keys and the
    /// response's `message` is replaced by its decrypted JSON object. Plain
    /// requests get a random correlation `nonce`. Both carry `clientID`.
    ///
    /// # Errors
    ///
    /// - [`Error::SendFailed`] on any I/O failure, including timeouts.
    /// - [`Error::Protocol`] if the response has an `error` field.
    /// - [`Error::InvalidPeerKey`] for an encrypted request before the key
    ///   exchange.
    pub fn send_message(&mut self, message: Message, encrypted: bool) -> Result<Response> {
        let action = message
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        trace!(action = %action, encrypted, "Sending message");

        if !encrypted {
            let request = self.codec.encode_plain(message)?;
            return self.round_trip(&request);
        }

        let plaintext = Zeroizing::new(
            serde_json::to_vec(&message).map_err(|e| Error::EncryptionFailed(e.to_string()))?,
        );
        let sealed = self.crypto.seal(&plaintext)?;
        let request = self.codec.encode_encrypted(&action, &sealed)?;
        let mut response = self.round_trip(&request)?;

        let (nonce, ciphertext) = response.sealed_parts()?;
        let decrypted = Zeroizing::new(self.crypto.open(&nonce, &ciphertext)?);
        response.set_message(parse_message(&decrypted)?);
        Ok(response)
    }

    /// Write `request`, read one response document, surface daemon errors.
    fn round_trip(&mut self, request: &[u8]) -> Result<Response> {
        let timeout = self.next_timeout();
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(Error::NotReady(self.state.to_string())),
        };

        let io_result = timeout.and_then(|t| {
            stream.set_timeout(t)?;
            stream.write_all(request)?;
            stream.flush()?;
            self.framer.read_document(stream)
        });
        let document = match io_result {
            Ok(document) => document,
            Err(e) => {
                self.transition(ClientState::Failed);
                return Err(Error::SendFailed(e));
            }
        };
        trace!(sent = request.len(), received = document.len(), "Round trip complete");

        let response = Response::parse(&document)?;
        if let Some(err) = response.protocol_error() {
            warn!(error = %err, "keepassxc returned an error");
            return Err(err);
        }
        Ok(response)
    }

    /// Timeout for the next I/O call: the I/O timeout, shortened to what is
    /// left of the handshake deadline. While waiting for the user only the
    /// deadline applies.
    fn next_timeout(&self) -> io::Result<Option<Duration>> {
        let io_timeout = if self.awaiting_user {
            None
        } else {
            self.io_timeout
        };
        let Some(deadline) = self.deadline else {
            return Ok(io_timeout);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "handshake deadline exceeded",
            ));
        }
        Ok(Some(io_timeout.map_or(remaining, |t| t.min(remaining))))
    }

    /// Close the connection. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close() {
                debug!(error = %e, "Error while closing connection");
            }
            if self.state != ClientState::Failed {
                self.transition(ClientState::Disconnected);
            }
        }
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// A message with `action` plus the given fields.
fn action_message<const N: usize>(action: &str, fields: [(&str, Value); N]) -> Message {
    let mut message = Message::new();
    message.insert("action".to_string(), Value::String(action.to_string()));
    for (key, value) in fields {
        message.insert(key.to_string(), value);
    }
    message
}
