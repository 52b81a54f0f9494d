//! Where the long-lived association lives.
//!
//! An association is the `(name, key)` pair KeePassXC hands out the first
//! time a client is approved for a database. The protocol client reads it
//! once before the handshake and writes it back at most once, after a
//! first-time association. [`IdentityStore`] is that capability; callers
//! pick the implementation:
//!
//! - [`ConfigIdentityStore`](crate::config::ConfigIdentityStore): persisted
//!   in the config file.
//! - [`MemoryIdentityStore`]: kept in memory, for tests and one-shot runs.
//! - [`FixedIdentityStore`]: a constant association that is never replaced.

use crate::crypto::SecretKey;
use crate::error::IdentityError;

/// Supplies and stores the association name and key.
pub trait IdentityStore {
    /// The stored association name (empty if none).
    fn association_name(&self) -> String;

    /// The stored association key, if the client has been associated.
    fn association_key(&self) -> Option<SecretKey>;

    /// Persist a freshly established association.
    fn set_association(&mut self, name: &str, key: &SecretKey) -> Result<(), IdentityError>;
}

impl<S: IdentityStore + ?Sized> IdentityStore for &mut S {
    fn association_name(&self) -> String {
        (**self).association_name()
    }

    fn association_key(&self) -> Option<SecretKey> {
        (**self).association_key()
    }

    fn set_association(&mut self, name: &str, key: &SecretKey) -> Result<(), IdentityError> {
        (**self).set_association(name, key)
    }
}

/// An association held in memory only.
#[derive(Debug, Default, Clone)]
pub struct MemoryIdentityStore {
    name: String,
    key: Option<SecretKey>,
}

impl MemoryIdentityStore {
    /// An empty store: the next handshake performs a first association.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-loaded with an association.
    pub fn with_association(name: impl Into<String>, key: SecretKey) -> Self {
        Self {
            name: name.into(),
            key: Some(key),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn association_name(&self) -> String {
        self.name.clone()
    }

    fn association_key(&self) -> Option<SecretKey> {
        self.key.clone()
    }

    fn set_association(&mut self, name: &str, key: &SecretKey) -> Result<(), IdentityError> {
        self.name = name.to_string();
        self.key = Some(key.clone());
        Ok(())
    }
}

/// A constant association that refuses to be replaced.
///
/// Useful when the association is provisioned out of band: a daemon that
/// no longer accepts it fails at `test-associate` instead of silently
/// creating a new association.
#[derive(Debug, Clone)]
pub struct FixedIdentityStore {
    name: String,
    key: SecretKey,
}

impl FixedIdentityStore {
    /// Create a fixed store.
    pub fn new(name: impl Into<String>, key: SecretKey) -> Self {
        Self {
            name: name.into(),
            key,
        }
    }
}

impl IdentityStore for FixedIdentityStore {
    fn association_name(&self) -> String {
        self.name.clone()
    }

    fn association_key(&self) -> Option<SecretKey> {
        Some(self.key.clone())
    }

    fn set_association(&mut self, _name: &str, _key: &SecretKey) -> Result<(), IdentityError> {
        Err(IdentityError::ReadOnly)
    }
}
