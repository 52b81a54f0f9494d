//! Locating the KeePassXC browser socket.
//!
//! KeePassXC listens on a Unix domain socket (Linux, macOS) or a named pipe
//! (Windows) called [`SOCKET_FILE_NAME`]. Where that file lives depends on
//! the platform and on how KeePassXC was installed:
//!
//! - Linux: `~/snap/keepassxc/common/`, then `$XDG_RUNTIME_DIR` (default
//!   `/run/user/<uid>/`), then `$TMPDIR` (default `/tmp`). The first
//!   candidate that exists wins.
//! - macOS: `$TMPDIR`, which must be set.
//! - Windows: `\\.\pipe\org.keepassxc.KeePassXC.BrowserServer_<USERNAME>`.
//!
//! An explicitly configured path bypasses discovery but must exist.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// File name of the KeePassXC browser socket (and pipe name prefix).
pub const SOCKET_FILE_NAME: &str = "org.keepassxc.KeePassXC.BrowserServer";

/// Sub-directory of the home directory used by the snap package.
const SNAP_COMMON_SUBDIR: &str = "snap/keepassxc/common";

/// A resolved local endpoint the transport can dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Filesystem path of a Unix domain socket.
    UnixSocket(PathBuf),
    /// Full name of a Windows named pipe (`\\.\pipe\...`).
    NamedPipe(String),
}

impl Endpoint {
    /// Resolve the endpoint: the override if given, otherwise discovery for
    /// the current platform.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointNotFound`] if the override does not exist or
    /// no candidate location holds the socket.
    pub fn resolve(override_path: Option<&Path>) -> Result<Self> {
        match override_path {
            Some(path) => Self::from_override(path),
            None => discover(),
        }
    }

    /// Use an explicitly configured path.
    ///
    /// A leading `~` is expanded to the home directory.
    pub fn from_override(path: &Path) -> Result<Self> {
        let path = expand_home(path, dirs::home_dir().as_deref());
        if cfg!(windows) {
            if let Some(name) = path.to_str() {
                if name.starts_with(r"\\.\pipe\") {
                    return Ok(Endpoint::NamedPipe(name.to_string()));
                }
            }
        }
        match path.try_exists() {
            Ok(true) => Ok(Endpoint::UnixSocket(path)),
            Ok(false) => Err(Error::EndpointNotFound(format!(
                "{} does not exist",
                path.display()
            ))),
            Err(e) => Err(Error::EndpointNotFound(format!(
                "cannot access {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::UnixSocket(path) => write!(f, "{}", path.display()),
            Endpoint::NamedPipe(name) => f.write_str(name),
        }
    }
}

/// Discover the endpoint for the current platform.
#[cfg(all(unix, not(target_os = "macos")))]
pub fn discover() -> Result<Endpoint> {
    let home = dirs::home_dir();
    // SAFETY: getuid() is always safe to call and cannot fail.
    let uid = unsafe { libc::getuid() };
    let candidates = linux_candidates(|key| std::env::var(key).ok(), home.as_deref(), uid);
    first_existing(&candidates, |path| path.try_exists())
}

/// Discover the endpoint for the current platform.
#[cfg(target_os = "macos")]
pub fn discover() -> Result<Endpoint> {
    let tmp_dir = std::env::var_os("TMPDIR")
        .ok_or_else(|| Error::EndpointNotFound("$TMPDIR not set".to_string()))?;
    let path = Path::new(&tmp_dir).join(SOCKET_FILE_NAME);
    first_existing(&[path], |path| path.try_exists())
}

/// Discover the endpoint for the current platform.
#[cfg(windows)]
pub fn discover() -> Result<Endpoint> {
    let user = std::env::var("USERNAME").unwrap_or_default();
    Ok(Endpoint::NamedPipe(windows_pipe_name(&user)))
}

/// Candidate socket locations on Linux, in lookup order.
///
/// `env` looks up an environment variable; it is a parameter so the lookup
/// order can be tested without touching the process environment.
pub fn linux_candidates<F>(env: F, home: Option<&Path>, uid: u32) -> Vec<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    let mut bases = Vec::with_capacity(3);
    if let Some(home) = home {
        bases.push(home.join(SNAP_COMMON_SUBDIR));
    }
    bases.push(PathBuf::from(
        env("XDG_RUNTIME_DIR").unwrap_or_else(|| format!("/run/user/{}/", uid)),
    ));
    bases.push(PathBuf::from(
        env("TMPDIR").unwrap_or_else(|| "/tmp".to_string()),
    ));
    bases
        .into_iter()
        .map(|base| base.join(SOCKET_FILE_NAME))
        .collect()
}

/// Named pipe KeePassXC listens on for `user`.
pub fn windows_pipe_name(user: &str) -> String {
    format!(r"\\.\pipe\{}_{}", SOCKET_FILE_NAME, user)
}

/// Return the first candidate that exists.
///
/// A candidate that cannot be checked (e.g. permission denied) stops the
/// search rather than being skipped.
fn first_existing<F>(candidates: &[PathBuf], exists: F) -> Result<Endpoint>
where
    F: Fn(&Path) -> io::Result<bool>,
{
    for path in candidates {
        match exists(path) {
            Ok(true) => {
                debug!(path = %path.display(), "Found keepassxc socket");
                return Ok(Endpoint::UnixSocket(path.clone()));
            }
            Ok(false) => continue,
            Err(e) => {
                return Err(Error::EndpointNotFound(format!(
                    "error on file {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
    let searched: Vec<String> = candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    Err(Error::EndpointNotFound(format!(
        "searched {}",
        searched.join(", ")
    )))
}

/// Expand a leading `~` in `path`.
fn expand_home(path: &Path, home: Option<&Path>) -> PathBuf {
    let Some(home) = home else {
        return path.to_path_buf();
    };
    match path.strip_prefix("~") {
        Ok(rest) if rest.as_os_str().is_empty() => home.to_path_buf(),
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}
