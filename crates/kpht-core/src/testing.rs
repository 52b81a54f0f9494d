//! In-process KeePassXC stand-in for tests.
//!
//! [`FakeDaemon`] answers the browser protocol with real NaCl boxes. It can
//! be handed to the client as a [`Transport`], as a single in-memory
//! [`ByteStream`], or served over a Unix socket from a thread. Responses are
//! delivered in chunks of [`DaemonBehavior::chunk_size`] bytes to exercise
//! the client's framing.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};

use crate::codec::JsonFramer;
use crate::crypto::{open_sealed, seal, KeyPair, PublicKey};
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::transport::{ByteStream, Transport};

/// How the fake daemon should behave.
#[derive(Debug, Clone)]
pub(crate) struct DaemonBehavior {
    /// Answer `change-public-keys` without a `publicKey`.
    pub omit_public_key: bool,
    /// Id handed out on `associate`; `None` answers without one.
    pub associate_id: Option<String>,
    /// Answer this action with a protocol error.
    pub reject: Option<&'static str>,
    /// Close the connection instead of answering this action.
    pub hang_up_on: Option<&'static str>,
    /// Entries returned by `get-logins`.
    pub entries: Vec<Value>,
    /// Maximum bytes returned per read.
    pub chunk_size: usize,
    /// Wait this long before answering this action (Unix socket only).
    pub delay: Option<(&'static str, Duration)>,
}

impl Default for DaemonBehavior {
    fn default() -> Self {
        Self {
            omit_public_key: false,
            associate_id: Some("fake-assoc".to_string()),
            reject: None,
            hang_up_on: None,
            entries: Vec::new(),
            chunk_size: 4096,
            delay: None,
        }
    }
}

struct DaemonState {
    behavior: DaemonBehavior,
    keys: KeyPair,
    client_key: Option<PublicKey>,
    associations: HashMap<String, String>,
    actions: Vec<String>,
    envelopes: Vec<Value>,
    last_request: Option<Value>,
    closed: usize,
}

/// A scripted KeePassXC. Clones share state.
#[derive(Clone)]
pub(crate) struct FakeDaemon(Arc<Mutex<DaemonState>>);

/// What the daemon does with one request.
enum Reply {
    Send(Vec<u8>),
    HangUp,
}

impl FakeDaemon {
    pub fn new(behavior: DaemonBehavior) -> Self {
        Self(Arc::new(Mutex::new(DaemonState {
            behavior,
            keys: KeyPair::generate(),
            client_key: None,
            associations: HashMap::new(),
            actions: Vec::new(),
            envelopes: Vec::new(),
            last_request: None,
            closed: 0,
        })))
    }

    /// Pre-register an association, as if made in an earlier session.
    pub fn register(&self, id: &str, id_key: &PublicKey) {
        self.lock()
            .associations
            .insert(id.to_string(), id_key.to_base64());
    }

    /// Actions received so far, decrypted where needed.
    pub fn actions(&self) -> Vec<String> {
        self.lock().actions.clone()
    }

    /// Raw request envelopes received so far.
    pub fn envelopes(&self) -> Vec<Value> {
        self.lock().envelopes.clone()
    }

    /// The `idKey` registered under `id`.
    pub fn registered_id_key(&self, id: &str) -> Option<String> {
        self.lock().associations.get(id).cloned()
    }

    /// `url` of the last decrypted request.
    pub fn last_url(&self) -> Option<String> {
        self.lock()
            .last_request
            .as_ref()
            .and_then(|r| r["url"].as_str())
            .map(str::to_string)
    }

    /// `(id, key)` of the last request's first `keys` item.
    pub fn last_keys(&self) -> Option<(String, String)> {
        let state = self.lock();
        let first = state.last_request.as_ref()?.get("keys")?.get(0)?;
        Some((
            first["id"].as_str()?.to_string(),
            first["key"].as_str()?.to_string(),
        ))
    }

    /// How many streams were closed by the client.
    pub fn closed_count(&self) -> usize {
        self.lock().closed
    }

    /// An in-memory stream connected to this daemon.
    pub fn stream(&self) -> Box<dyn ByteStream> {
        Box::new(FakeStream {
            daemon: self.clone(),
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            hung_up: false,
        })
    }

    /// Serve one connection on `listener` until the client hangs up.
    #[cfg(unix)]
    pub fn serve(
        &self,
        listener: std::os::unix::net::UnixListener,
    ) -> std::thread::JoinHandle<()> {
        let daemon = self.clone();
        std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            let mut framer = JsonFramer::new();
            while let Ok(request) = framer.read_document(&mut conn) {
                let reply = daemon.handle(&request);
                daemon.pause_after_last_action();
                match reply {
                    Reply::Send(bytes) => {
                        let chunk = daemon.lock().behavior.chunk_size.max(1);
                        for piece in bytes.chunks(chunk) {
                            // The client may have given up already.
                            if conn.write_all(piece).and_then(|_| conn.flush()).is_err() {
                                return;
                            }
                        }
                    }
                    Reply::HangUp => break,
                }
            }
        })
    }

    #[cfg(unix)]
    fn pause_after_last_action(&self) {
        let pause = {
            let state = self.lock();
            match (state.behavior.delay, state.actions.last()) {
                (Some((action, pause)), Some(last)) if last == action => Some(pause),
                _ => None,
            }
        };
        if let Some(pause) = pause {
            std::thread::sleep(pause);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DaemonState> {
        self.0.lock().unwrap()
    }

    fn handle(&self, request: &[u8]) -> Reply {
        let envelope: Value = serde_json::from_slice(request).unwrap();
        let mut state = self.lock();
        state.envelopes.push(envelope.clone());

        if envelope.get("message").is_none() {
            return state.handle_plain(envelope);
        }

        let nonce = STANDARD
            .decode(envelope["nonce"].as_str().unwrap())
            .unwrap();
        let ciphertext = STANDARD
            .decode(envelope["message"].as_str().unwrap())
            .unwrap();
        let client_key = state.client_key.unwrap();
        let plaintext = open_sealed(&nonce, &ciphertext, &client_key, state.keys.secret()).unwrap();
        let inner: Value = serde_json::from_slice(&plaintext).unwrap();
        state.handle_encrypted(inner)
    }
}

impl DaemonState {
    fn handle_plain(&mut self, envelope: Value) -> Reply {
        let action = envelope["action"].as_str().unwrap_or_default().to_string();
        self.actions.push(action.clone());
        if self.behavior.hang_up_on == Some(action.as_str()) {
            return Reply::HangUp;
        }
        assert_eq!(action, "change-public-keys");

        let client_key = PublicKey::from_base64(envelope["publicKey"].as_str().unwrap()).unwrap();
        self.client_key = Some(client_key);

        let mut response = json!({
            "action": action,
            "nonce": envelope["nonce"],
            "success": "true",
            "version": "2.7.9"
        });
        if !self.behavior.omit_public_key {
            response["publicKey"] = json!(self.keys.public().to_base64());
        }
        Reply::Send(serde_json::to_vec(&response).unwrap())
    }

    fn handle_encrypted(&mut self, inner: Value) -> Reply {
        let action = inner["action"].as_str().unwrap_or_default().to_string();
        self.actions.push(action.clone());
        self.last_request = Some(inner.clone());

        if self.behavior.hang_up_on == Some(action.as_str()) {
            return Reply::HangUp;
        }
        if self.behavior.reject == Some(action.as_str()) {
            return self.error(&action, "15", "No logins found");
        }

        match action.as_str() {
            "associate" => {
                let own_key = self.client_key.map(|k| k.to_base64());
                assert_eq!(inner["key"].as_str(), own_key.as_deref());
                match self.behavior.associate_id.clone() {
                    Some(id) => {
                        let id_key = inner["idKey"].as_str().unwrap().to_string();
                        self.associations.insert(id.clone(), id_key);
                        self.sealed(&action, json!({"id": id, "hash": "abc", "success": "true"}))
                    }
                    None => self.sealed(&action, json!({"success": "true"})),
                }
            }
            "test-associate" => {
                let id = inner["id"].as_str().unwrap_or_default();
                let key = inner["key"].as_str().unwrap_or_default();
                if self.associations.get(id).map(String::as_str) == Some(key) {
                    self.sealed(&action, json!({"id": id, "success": "true"}))
                } else {
                    self.error(&action, "5", "Key change was not successful")
                }
            }
            "get-logins" => {
                let entries = self.behavior.entries.clone();
                self.sealed(
                    &action,
                    json!({"count": entries.len(), "entries": entries, "success": "true"}),
                )
            }
            other => panic!("fake daemon got unexpected action {other}"),
        }
    }

    fn sealed(&self, action: &str, message: Value) -> Reply {
        let plaintext = serde_json::to_vec(&message).unwrap();
        let client_key = self.client_key.unwrap();
        let sealed = seal(&plaintext, &client_key, self.keys.secret()).unwrap();
        let response = json!({
            "action": action,
            "nonce": STANDARD.encode(sealed.nonce()),
            "message": STANDARD.encode(sealed.ciphertext()),
        });
        Reply::Send(serde_json::to_vec(&response).unwrap())
    }

    fn error(&self, action: &str, code: &str, message: &str) -> Reply {
        let response = json!({"action": action, "error": message, "errorCode": code});
        Reply::Send(serde_json::to_vec(&response).unwrap())
    }
}

impl Transport for FakeDaemon {
    fn connect(&self, _endpoint: &Endpoint) -> Result<Box<dyn ByteStream>> {
        Ok(self.stream())
    }
}

/// Client end of an in-memory connection.
struct FakeStream {
    daemon: FakeDaemon,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    hung_up: bool,
}

impl Write for FakeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.hung_up {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.inbox.extend_from_slice(buf);

        // Answer every complete request buffered so far.
        loop {
            let mut documents =
                serde_json::Deserializer::from_slice(&self.inbox).into_iter::<Value>();
            let end = match documents.next() {
                Some(Ok(_)) => documents.byte_offset(),
                _ => break,
            };
            let request: Vec<u8> = self.inbox.drain(..end).collect();
            match self.daemon.handle(&request) {
                Reply::Send(bytes) => self.outbox.extend(bytes),
                Reply::HangUp => {
                    self.hung_up = true;
                    break;
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for FakeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let chunk = self.daemon.lock().behavior.chunk_size.max(1);
        let n = buf.len().min(chunk).min(self.outbox.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl ByteStream for FakeStream {
    fn set_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.daemon.lock().closed += 1;
        Ok(())
    }
}
