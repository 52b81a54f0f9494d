//! Core of kpht, a command line client for KeePassXC's browser protocol.
//!
//! This crate talks to a running KeePassXC over its local socket (or named
//! pipe on Windows), the same channel the browser extension uses. It is
//! UI-agnostic: selecting an entry and delivering the copied value are left
//! to the caller.
//!
//! # Modules
//!
//! - [`client`]: Handshake state machine and `get-logins` (`ProtocolClient`)
//! - [`codec`]: Envelope encoding and JSON framing (`WireCodec`, `JsonFramer`)
//! - [`crypto`]: NaCl box session keys (`CryptoSession`, `KeyPair`)
//! - [`transport`]: Byte streams to the daemon (`Transport`, `LocalTransport`)
//! - [`endpoint`]: Per-platform socket discovery (`Endpoint`)
//! - [`identity`]: Association storage (`IdentityStore`)
//! - [`entry`]: Credential records, filters and selection (`CredentialSet`)
//! - [`template`]: `%s` key-list formatting
//! - [`config`]: TOML configuration and the config-backed identity store
//! - [`secret`]: Redacted strings (`SecretString`)
//!
//! # Example
//!
//! ```
//! use kpht_core::{CredentialRecord, CredentialSet, SecretString};
//!
//! let set: CredentialSet = vec![
//!     CredentialRecord {
//!         name: "vpn-work-01".to_string(),
//!         password: SecretString::from("s3cret"),
//!         ..Default::default()
//!     },
//!     CredentialRecord {
//!         name: "vpn-home".to_string(),
//!         ..Default::default()
//!     },
//! ]
//! .into_iter()
//! .collect();
//!
//! let work = set.filter_by_name_substrings(&["vpn", "work"]);
//! assert_eq!(work.len(), 1);
//! assert_eq!(work[0].get_field("password"), "s3cret");
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod endpoint;
pub mod entry;
pub mod error;
pub mod identity;
pub mod secret;
pub mod template;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types at the crate root for convenience
pub use client::{ClientOptions, ClientState, ProtocolClient};
pub use codec::{Message, Response};
pub use config::{Config, ConfigError, ConfigIdentityStore};
pub use crypto::{CryptoSession, KeyPair, PublicKey, SecretKey};
pub use endpoint::Endpoint;
pub use entry::{CredentialRecord, CredentialSet, Selector};
pub use error::{Error, HandshakeStep, IdentityError, Result};
pub use identity::{FixedIdentityStore, IdentityStore, MemoryIdentityStore};
pub use secret::SecretString;
pub use template::format_keys;
pub use transport::{ByteStream, LocalTransport, Transport};
