//! Configuration types and loading for kpht.
//!
//! Configuration is loaded from `~/.config/kpht/config.toml`. The `[assoc]`
//! table is written back automatically after the first successful
//! association with KeePassXC.
//!
//! # Error Handling
//!
//! - If the config file doesn't exist, default values are returned.
//! - If the config file exists but is invalid, an error is returned (fail fast).
//!
//! # Environment
//!
//! `KPHT_SOCKET_PATH` and `KPHT_SCRIPT_INDICATOR_URL` take precedence over
//! the corresponding file settings.
//!
//! # Example Configuration
//!
//! ```toml
//! script_indicator_url = "script://keepassxc.go"
//! entry_identifier = ["%s (%s)", "name", "login"]
//!
//! [clip]
//! default_copy = ["password"]
//! filter_groups = ["Scripts"]
//!
//! [clip.copy]
//! "92bfee4f24614ef9ac6e1f440eff3292" = ["%s:%s", "login", "password"]
//!
//! [connection]
//! io_timeout_secs = 10
//! handshake_timeout_secs = 120
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::crypto::SecretKey;
use crate::error::IdentityError;
use crate::identity::IdentityStore;
use crate::secret::SecretString;

/// URL that entries meant for this tool carry in KeePassXC.
pub const DEFAULT_SCRIPT_INDICATOR_URL: &str = "script://keepassxc.go";

/// Name this client registers under with KeePassXC.
pub const DEFAULT_APPLICATION_NAME: &str = "keepassxc-http-tools";

/// Environment variable overriding `connection.socket_path`.
pub const ENV_SOCKET_PATH: &str = "KPHT_SOCKET_PATH";

/// Environment variable overriding `script_indicator_url`.
pub const ENV_SCRIPT_INDICATOR_URL: &str = "KPHT_SCRIPT_INDICATOR_URL";

/// Errors that can occur when loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read or write the configuration file.
    #[error("Failed to access config file: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse the configuration file.
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to serialize the configuration.
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The stored association key is not a valid base64 key.
    #[error("Invalid association key: {0}")]
    InvalidKey(String),
}

/// Main configuration struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// URL passed to `get-logins`; only entries with this URL are returned.
    pub script_indicator_url: String,
    /// Keys used to build an entry's display label (see `format_combined`).
    pub entry_identifier: Vec<String>,
    /// The stored association with KeePassXC.
    pub assoc: AssocConfig,
    /// Settings for the `clip` command.
    pub clip: ClipConfig,
    /// Connection settings.
    pub connection: ConnectionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            script_indicator_url: DEFAULT_SCRIPT_INDICATOR_URL.to_string(),
            entry_identifier: vec![
                "%s (%s)".to_string(),
                "name".to_string(),
                "login".to_string(),
            ],
            assoc: AssocConfig::default(),
            clip: ClipConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

/// The `[assoc]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssocConfig {
    /// Association name handed out by KeePassXC.
    pub name: String,
    /// Base64 private association key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<SecretString>,
}

/// The `[clip]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipConfig {
    /// Keys copied when neither a flag nor a per-entry override applies.
    pub default_copy: Vec<String>,
    /// Only consider entries in one of these groups (empty: all groups).
    pub filter_groups: Vec<String>,
    /// Per-entry copy keys, keyed by entry uuid.
    pub copy: BTreeMap<String, Vec<String>>,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            default_copy: vec!["password".to_string()],
            filter_groups: Vec::new(),
            copy: BTreeMap::new(),
        }
    }
}

/// The `[connection]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Explicit socket (or pipe) path; disables discovery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    /// Application name used to build the client ID.
    pub application_name: String,
    /// Timeout in seconds for each read or write (0 disables it).
    pub io_timeout_secs: u64,
    /// Timeout in seconds for the whole handshake, including waiting for the
    /// user to approve a new association (0 disables it).
    pub handshake_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            io_timeout_secs: 10,
            handshake_timeout_secs: 120,
        }
    }
}

impl ConnectionConfig {
    /// The per-operation I/O timeout, `None` if disabled.
    pub fn io_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.io_timeout_secs)
    }

    /// The overall handshake timeout, `None` if disabled.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.handshake_timeout_secs)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Config {
    /// Returns the default configuration file path.
    ///
    /// Returns `~/.config/kpht/config.toml` using `dirs::config_dir()`,
    /// or `None` if the config directory cannot be determined.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("kpht").join("config.toml"))
    }

    /// Load configuration from the default path, with environment overrides.
    ///
    /// - Returns defaults if no config file exists.
    /// - Returns `Err` if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::default_path() {
            Some(path) => Self::read_optional(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load configuration from `path`, with environment overrides.
    ///
    /// A missing file yields defaults, so the path can name a file that the
    /// first association will create.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::read_optional(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    fn read_optional(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                debug!(path = %path.display(), "Loaded config file");
                Self::parse(&contents)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply `KPHT_*` overrides looked up through `env`.
    pub fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = env(ENV_SOCKET_PATH).filter(|v| !v.is_empty()) {
            self.connection.socket_path = Some(PathBuf::from(path));
        }
        if let Some(url) = env(ENV_SCRIPT_INDICATOR_URL).filter(|v| !v.is_empty()) {
            self.script_indicator_url = url;
        }
    }

    /// Keys to copy from the entry with `uuid`.
    ///
    /// Resolution order:
    /// 1. Per-entry override from `[clip.copy]`
    /// 2. `clip.default_copy`
    pub fn copy_keys_for(&self, uuid: &str) -> &[String] {
        self.clip
            .copy
            .get(uuid)
            .unwrap_or(&self.clip.default_copy)
    }
}

/// An [`IdentityStore`] backed by the `[assoc]` table of a config file.
#[derive(Debug)]
pub struct ConfigIdentityStore {
    path: PathBuf,
    name: String,
    key: Option<SecretKey>,
}

impl ConfigIdentityStore {
    /// Create a store that persists to `path`, starting from `assoc`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidKey`] if the stored key is not a
    /// base64-encoded 32-byte key.
    pub fn new(path: impl Into<PathBuf>, assoc: &AssocConfig) -> Result<Self, ConfigError> {
        let key = match assoc.key.as_ref().filter(|k| !k.is_empty()) {
            Some(encoded) => Some(SecretKey::from_base64(encoded.reveal()).ok_or_else(|| {
                ConfigError::InvalidKey("expected base64 encoded 32 bytes".to_string())
            })?),
            None => None,
        };
        Ok(Self {
            path: path.into(),
            name: assoc.name.clone(),
            key,
        })
    }

    /// The file this store writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the `[assoc]` table of the file, keeping everything else.
    fn write_assoc(&self, name: &str, key: &SecretKey) -> Result<(), ConfigError> {
        let mut document: toml::Table = match fs::read_to_string(&self.path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => toml::Table::new(),
            Err(e) => return Err(e.into()),
        };

        let mut assoc = toml::Table::new();
        assoc.insert("name".to_string(), toml::Value::String(name.to_string()));
        assoc.insert(
            "key".to_string(),
            toml::Value::String(key.to_base64().to_string()),
        );
        document.insert("assoc".to_string(), toml::Value::Table(assoc));

        let rendered = zeroize::Zeroizing::new(toml::to_string(&document)?);
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        write_private(&self.path, rendered.as_bytes())?;
        debug!(path = %self.path.display(), "Saved association to config file");
        Ok(())
    }
}

impl IdentityStore for ConfigIdentityStore {
    fn association_name(&self) -> String {
        self.name.clone()
    }

    fn association_key(&self) -> Option<SecretKey> {
        self.key.clone()
    }

    fn set_association(&mut self, name: &str, key: &SecretKey) -> Result<(), IdentityError> {
        self.write_assoc(name, key)?;
        self.name = name.to_string();
        self.key = Some(key.clone());
        Ok(())
    }
}

/// Replace `path` with `contents`, readable by the owner only.
///
/// The contents go to a fresh temporary file in the same directory, which
/// is renamed over `path` once synced. The temporary file is removed if
/// any step fails.
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut builder = tempfile::Builder::new();
    builder.prefix(".kpht-").suffix(".tmp");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(0o600));
    }

    let mut file = builder.tempfile_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn default_config_values() {
        let config = Config::default();

        assert_eq!(config.script_indicator_url, "script://keepassxc.go");
        assert_eq!(config.entry_identifier, vec!["%s (%s)", "name", "login"]);
        assert_eq!(config.assoc.name, "");
        assert!(config.assoc.key.is_none());
        assert_eq!(config.clip.default_copy, vec!["password"]);
        assert!(config.clip.filter_groups.is_empty());
        assert!(config.clip.copy.is_empty());
        assert_eq!(config.connection.socket_path, None);
        assert_eq!(config.connection.application_name, "keepassxc-http-tools");
        assert_eq!(config.connection.io_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(
            config.connection.handshake_timeout(),
            Some(Duration::from_secs(120))
        );
    }

    #[test]
    fn load_nonexistent_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::read_optional(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_valid_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
script_indicator_url = "script://mine"
entry_identifier = ["%s", "uuid"]

[assoc]
name = "laptop"
key = "c2VjcmV0"

[clip]
default_copy = ["login"]
filter_groups = ["Scripts", "Work"]

[clip.copy]
"abc123" = ["%s:%s", "login", "password"]

[connection]
socket_path = "/run/kp.sock"
application_name = "my-tool"
io_timeout_secs = 0
handshake_timeout_secs = 5
"#
        )
        .unwrap();

        let config = Config::read_optional(file.path()).expect("Should parse");

        assert_eq!(config.script_indicator_url, "script://mine");
        assert_eq!(config.entry_identifier, vec!["%s", "uuid"]);
        assert_eq!(config.assoc.name, "laptop");
        assert_eq!(config.assoc.key.as_ref().unwrap().reveal(), "c2VjcmV0");
        assert_eq!(config.clip.default_copy, vec!["login"]);
        assert_eq!(config.clip.filter_groups, vec!["Scripts", "Work"]);
        assert_eq!(
            config.clip.copy.get("abc123").unwrap(),
            &vec!["%s:%s", "login", "password"]
        );
        assert_eq!(
            config.connection.socket_path,
            Some(PathBuf::from("/run/kp.sock"))
        );
        assert_eq!(config.connection.application_name, "my-tool");
        assert_eq!(config.connection.io_timeout(), None);
        assert_eq!(
            config.connection.handshake_timeout(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn load_partial_config_uses_defaults() {
        let config = Config::parse(
            r#"
[clip]
filter_groups = ["Scripts"]
"#,
        )
        .unwrap();

        assert_eq!(config.script_indicator_url, DEFAULT_SCRIPT_INDICATOR_URL);
        assert_eq!(config.clip.default_copy, vec!["password"]);
        assert_eq!(config.clip.filter_groups, vec!["Scripts"]);
        assert_eq!(config.connection.io_timeout_secs, 10);
    }

    #[test]
    fn load_invalid_config_returns_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "this is not valid toml {{{{").unwrap();

        let result = Config::read_optional(file.path());
        assert!(matches!(result.unwrap_err(), ConfigError::Parse(_)));
    }

    #[test]
    fn wrong_type_returns_error() {
        let result = Config::parse("entry_identifier = \"name\"");
        assert!(matches!(result.unwrap_err(), ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::parse("script_indicator_url = \"script://file\"").unwrap();
        let env: HashMap<&str, &str> = [
            (ENV_SOCKET_PATH, "/tmp/override.sock"),
            (ENV_SCRIPT_INDICATOR_URL, "script://env"),
        ]
        .into_iter()
        .collect();

        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.script_indicator_url, "script://env");
        assert_eq!(
            config.connection.socket_path,
            Some(PathBuf::from("/tmp/override.sock"))
        );
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env(|_| Some(String::new()));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn copy_keys_prefer_per_entry_override() {
        let config = Config::parse(
            r#"
[clip]
default_copy = ["password"]

[clip.copy]
"uuid-1" = ["login"]
"#,
        )
        .unwrap();

        assert_eq!(config.copy_keys_for("uuid-1"), ["login"]);
        assert_eq!(config.copy_keys_for("uuid-2"), ["password"]);
    }

    #[test]
    fn identity_store_reads_assoc() {
        let key = SecretKey::generate();
        let assoc = AssocConfig {
            name: "desk".to_string(),
            key: Some(SecretString::from(key.to_base64().to_string())),
        };
        let store = ConfigIdentityStore::new("/nonexistent/config.toml", &assoc).unwrap();

        assert_eq!(store.association_name(), "desk");
        assert_eq!(store.association_key(), Some(key));
    }

    #[test]
    fn identity_store_without_key() {
        let store =
            ConfigIdentityStore::new("/nonexistent/config.toml", &AssocConfig::default()).unwrap();
        assert!(store.association_key().is_none());

        let blank = AssocConfig {
            name: String::new(),
            key: Some(SecretString::from("")),
        };
        let store = ConfigIdentityStore::new("/nonexistent/config.toml", &blank).unwrap();
        assert!(store.association_key().is_none());
    }

    #[test]
    fn identity_store_rejects_bad_key() {
        let assoc = AssocConfig {
            name: "desk".to_string(),
            key: Some(SecretString::from("not base64!")),
        };
        let err = ConfigIdentityStore::new("/nonexistent/config.toml", &assoc).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey(_)));
    }

    #[test]
    fn set_association_creates_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut store = ConfigIdentityStore::new(&path, &AssocConfig::default()).unwrap();
        let key = SecretKey::generate();

        store.set_association("new-assoc", &key).unwrap();

        assert_eq!(store.association_name(), "new-assoc");
        assert_eq!(store.association_key(), Some(key.clone()));

        let reloaded = Config::read_optional(&path).unwrap();
        assert_eq!(reloaded.assoc.name, "new-assoc");
        let reopened = ConfigIdentityStore::new(&path, &reloaded.assoc).unwrap();
        assert_eq!(reopened.association_key(), Some(key));
    }

    #[test]
    fn set_association_preserves_other_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
script_indicator_url = "script://kept"

[assoc]
name = "old"

[clip]
filter_groups = ["Scripts"]

[clip.copy]
"uuid-1" = ["login"]
"#,
        )
        .unwrap();

        let config = Config::read_optional(&path).unwrap();
        let mut store = ConfigIdentityStore::new(&path, &config.assoc).unwrap();
        store
            .set_association("replaced", &SecretKey::generate())
            .unwrap();

        let reloaded = Config::read_optional(&path).unwrap();
        assert_eq!(reloaded.assoc.name, "replaced");
        assert!(reloaded.assoc.key.is_some());
        assert_eq!(reloaded.script_indicator_url, "script://kept");
        assert_eq!(reloaded.clip.filter_groups, vec!["Scripts"]);
        assert_eq!(reloaded.copy_keys_for("uuid-1"), ["login"]);
        assert_eq!(dir_entries(dir.path()), vec!["config.toml"]);
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[cfg(unix)]
    #[test]
    fn saved_config_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut store = ConfigIdentityStore::new(&path, &AssocConfig::default()).unwrap();
        store.set_association("a", &SecretKey::generate()).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn rewrite_tightens_loose_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let stale = dir.path().join("config.toml.tmp");
        for file in [&path, &stale] {
            fs::write(file, "script_indicator_url = \"script://x\"\n").unwrap();
            fs::set_permissions(file, fs::Permissions::from_mode(0o644)).unwrap();
        }

        let mut store = ConfigIdentityStore::new(&path, &AssocConfig::default()).unwrap();
        store.set_association("a", &SecretKey::generate()).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(
            Config::read_optional(&path).unwrap().script_indicator_url,
            "script://x"
        );
        assert_eq!(dir_entries(dir.path()), vec!["config.toml", "config.toml.tmp"]);
    }

    #[cfg(unix)]
    #[test]
    fn failed_write_leaves_no_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        // A directory in place of the config makes the final rename fail.
        let path = dir.path().join("config.toml");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), "").unwrap();

        let err = write_private(&path, b"x").unwrap_err();
        assert_ne!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(dir_entries(dir.path()), vec!["config.toml"]);
    }

    #[test]
    fn set_association_fails_on_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not [valid").unwrap();

        let mut store = ConfigIdentityStore::new(&path, &AssocConfig::default()).unwrap();
        let err = store
            .set_association("a", &SecretKey::generate())
            .unwrap_err();

        assert!(matches!(err, IdentityError::Config(ConfigError::Parse(_))));
        assert_eq!(store.association_name(), "");
        assert!(store.association_key().is_none());
    }

    #[test]
    fn config_debug_redacts_key() {
        let config = Config::parse(
            r#"
[assoc]
name = "x"
key = "c3VwZXJzZWNyZXQ="
"#,
        )
        .unwrap();
        assert!(!format!("{:?}", config).contains("c3VwZXJzZWNyZXQ="));
    }
}
