//! Credential records returned by `get-logins`.
//!
//! A [`CredentialRecord`] mirrors one entry of the daemon's `entries` array.
//! Passwords, TOTP codes and custom string fields are held as
//! [`SecretString`], so `{:?}` on a record (or a whole [`CredentialSet`])
//! never prints them.
//!
//! # Example
//!
//! ```
//! use kpht_core::{CredentialRecord, SecretString};
//!
//! let record = CredentialRecord {
//!     name: "Example".to_string(),
//!     login: "alice".to_string(),
//!     password: SecretString::from("hunter2"),
//!     ..Default::default()
//! };
//!
//! assert_eq!(record.format_combined(&["%s (%s)", "name", "login"]), "Example (alice)");
//! assert_eq!(record.get_field("password"), "hunter2");
//! assert!(!format!("{:?}", record).contains("hunter2"));
//! ```

use std::collections::BTreeMap;
use std::ops::Index;

use serde::{Deserialize, Serialize};

use crate::codec::Message;
use crate::error::{Error, Result};
use crate::secret::SecretString;
use crate::template;

/// Prefix KeePassXC puts in front of custom string field names.
///
/// Only fields whose name starts with it (plus at least one space) are
/// returned over the browser protocol.
pub const STRING_FIELD_PREFIX: &str = "KPH: ";

/// Lookup prefix that addresses a custom string field explicitly.
const STRING_FIELDS_KEY: &str = "stringFields.";

/// One password entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialRecord {
    /// Entry title.
    pub name: String,
    /// User name.
    pub login: String,
    /// Password.
    pub password: SecretString,
    /// Current TOTP code, if the entry has TOTP configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totp: Option<SecretString>,
    /// Group (folder) the entry lives in.
    pub group: String,
    /// Stable entry identifier.
    pub uuid: String,
    /// Custom fields as sent by the daemon: single-key maps, keys prefixed
    /// with [`STRING_FIELD_PREFIX`].
    #[serde(rename = "stringFields")]
    pub string_fields: Vec<BTreeMap<String, SecretString>>,
}

impl CredentialRecord {
    /// Custom fields keyed by their bare names.
    ///
    /// The prefix and surrounding whitespace are stripped from each key.
    /// When a name repeats, the later field wins.
    pub fn fields_map(&self) -> BTreeMap<String, SecretString> {
        let mut fields = BTreeMap::new();
        for single in &self.string_fields {
            for (key, value) in single {
                let bare = key.strip_prefix(STRING_FIELD_PREFIX).unwrap_or(key).trim();
                fields.insert(bare.to_string(), value.clone());
            }
        }
        fields
    }

    /// Value of a field by name, revealed.
    ///
    /// Fixed fields (`name`, `login`, `password`, `totp`, `group`, `uuid`)
    /// take precedence; anything else is looked up among the custom fields,
    /// optionally addressed as `stringFields.<name>`. Unknown names yield an
    /// empty string.
    pub fn get_field(&self, key: &str) -> String {
        match key {
            "name" => self.name.clone(),
            "login" => self.login.clone(),
            "password" => self.password.reveal().to_string(),
            "totp" => self
                .totp
                .as_ref()
                .map(|t| t.reveal().to_string())
                .unwrap_or_default(),
            "group" => self.group.clone(),
            "uuid" => self.uuid.clone(),
            other => {
                let bare = other.replacen(STRING_FIELDS_KEY, "", 1);
                self.fields_map()
                    .get(&bare)
                    .map(|v| v.reveal().to_string())
                    .unwrap_or_default()
            }
        }
    }

    /// Combine several fields through a key list.
    ///
    /// One key returns that field; more keys treat the first as a `%s`
    /// template for the remaining fields; no keys give an empty string.
    pub fn format_combined<S: AsRef<str>>(&self, keys: &[S]) -> String {
        template::combine(keys, |key| self.get_field(key))
    }
}

/// The records returned by one query, in daemon order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSet {
    records: Vec<CredentialRecord>,
}

/// Picks one record out of several candidates.
pub trait Selector {
    /// Choose among `labels` (one per candidate, in order).
    ///
    /// Returns the chosen index, or `None` if the user declined.
    fn choose(&mut self, labels: &[String]) -> Option<usize>;
}

impl<F> Selector for F
where
    F: FnMut(&[String]) -> Option<usize>,
{
    fn choose(&mut self, labels: &[String]) -> Option<usize> {
        self(labels)
    }
}

impl CredentialSet {
    /// Wrap records.
    pub fn new(records: Vec<CredentialRecord>) -> Self {
        Self { records }
    }

    /// Parse the decrypted `get-logins` payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidResponse`] if `entries` is missing, empty or
    /// malformed.
    pub fn from_message(message: &Message) -> Result<Self> {
        let entries = message
            .get("entries")
            .ok_or_else(|| Error::InvalidResponse("missing entries".to_string()))?;
        let records: Vec<CredentialRecord> = serde_json::from_value(entries.clone())
            .map_err(|e| Error::InvalidResponse(format!("malformed entries: {}", e)))?;
        if records.is_empty() {
            return Err(Error::InvalidResponse("empty entries".to_string()));
        }
        Ok(Self { records })
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the set has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate over the records in order.
    pub fn iter(&self) -> std::slice::Iter<'_, CredentialRecord> {
        self.records.iter()
    }

    /// The records as a slice.
    pub fn records(&self) -> &[CredentialRecord] {
        &self.records
    }

    /// Keep records whose name contains every substring (case-sensitive).
    pub fn filter_by_name_substrings<S: AsRef<str>>(&self, substrings: &[S]) -> Self {
        self.filtered(|r| substrings.iter().all(|s| r.name.contains(s.as_ref())))
    }

    /// Keep records whose group equals one of `groups` exactly.
    ///
    /// An empty `groups` list keeps nothing.
    pub fn filter_by_group_exact<S: AsRef<str>>(&self, groups: &[S]) -> Self {
        self.filtered(|r| groups.iter().any(|g| r.group == g.as_ref()))
    }

    fn filtered<P>(&self, predicate: P) -> Self
    where
        P: Fn(&CredentialRecord) -> bool,
    {
        Self {
            records: self.records.iter().filter(|r| predicate(r)).cloned().collect(),
        }
    }

    /// Display labels for all records, built with `format_combined`.
    pub fn labels<S: AsRef<str>>(&self, label_keys: &[S]) -> Vec<String> {
        self.records
            .iter()
            .map(|r| r.format_combined(label_keys))
            .collect()
    }

    /// Pick exactly one record.
    ///
    /// - none: [`Error::NoMatch`] naming `criteria`
    /// - one: that record, without asking
    /// - several: `selector` chooses among labels built from `label_keys`
    ///
    /// # Errors
    ///
    /// Returns [`Error::SelectionCancelled`] if the selector declines or
    /// returns an index out of range.
    pub fn select<S, Sel>(
        &self,
        label_keys: &[S],
        criteria: &str,
        selector: &mut Sel,
    ) -> Result<&CredentialRecord>
    where
        S: AsRef<str>,
        Sel: Selector + ?Sized,
    {
        match self.records.as_slice() {
            [] => Err(Error::NoMatch(criteria.to_string())),
            [only] => Ok(only),
            records => {
                let labels = self.labels(label_keys);
                selector
                    .choose(&labels)
                    .and_then(|i| records.get(i))
                    .ok_or(Error::SelectionCancelled)
            }
        }
    }
}

impl Index<usize> for CredentialSet {
    type Output = CredentialRecord;

    fn index(&self, index: usize) -> &CredentialRecord {
        &self.records[index]
    }
}

impl<'a> IntoIterator for &'a CredentialSet {
    type Item = &'a CredentialRecord;
    type IntoIter = std::slice::Iter<'a, CredentialRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl IntoIterator for CredentialSet {
    type Item = CredentialRecord;
    type IntoIter = std::vec::IntoIter<CredentialRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl FromIterator<CredentialRecord> for CredentialSet {
    fn from_iter<I: IntoIterator<Item = CredentialRecord>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
