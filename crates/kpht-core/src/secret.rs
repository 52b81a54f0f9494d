//! Redacted string type for passwords, TOTP codes and key material.
//!
//! [`SecretString`] wraps [`secrecy::SecretString`] so the payload is zeroed
//! on drop, and adds the two things the credential model needs on top of it:
//! a fixed redaction marker for `Display`/`Debug`, and content equality.
//!
//! # Example
//!
//! ```
//! use kpht_core::SecretString;
//!
//! let password = SecretString::from("hunter2");
//! assert_eq!(password.to_string(), "*****");
//! assert_eq!(format!("{:?}", password), "SecretString(*****)");
//! assert_eq!(password.reveal(), "hunter2");
//! ```

use std::fmt;

use secrecy::ExposeSecret;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The marker printed in place of any secret.
pub const REDACTED: &str = "*****";

/// Sensitive text that never shows up in default formatting.
///
/// The only way to get at the payload is [`SecretString::reveal`], which
/// should be called at the point of final consumption (writing the value
/// to its sink), never to build log lines.
#[derive(Clone)]
pub struct SecretString(secrecy::SecretString);

impl SecretString {
    /// Wrap a value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(secrecy::SecretString::from(value.into()))
    }

    /// Return the original text.
    pub fn reveal(&self) -> &str {
        self.0.expose_secret()
    }

    /// Whether the payload is the empty string.
    pub fn is_empty(&self) -> bool {
        self.reveal().is_empty()
    }
}

impl Default for SecretString {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.reveal() == other.reveal()
    }
}

impl Eq for SecretString {}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString({})", REDACTED)
    }
}

// Serialization exposes the value: it is only used for the wire format and
// for persisting the association key to the config file.
impl Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.reveal())
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(SecretString::from(s))
    }
}
