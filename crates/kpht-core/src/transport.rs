//! Byte-stream transports to the local KeePassXC endpoint.
//!
//! The protocol client only needs "a connected, bidirectional byte stream".
//! [`Transport`] produces one from a resolved [`Endpoint`]; [`LocalTransport`]
//! is the platform implementation (Unix domain socket, or a named pipe on
//! Windows). Tests substitute an in-process fake.
//!
//! A single connection attempt is made; there is no retry.

use std::io::{self, Read, Write};
use std::time::Duration;

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

/// A connected stream to the daemon.
pub trait ByteStream: Read + Write + Send {
    /// Bound every subsequent read and write. `None` blocks indefinitely.
    ///
    /// Streams that cannot enforce a timeout accept the call and ignore it.
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Close the stream. Calling it more than once is harmless.
    fn close(&mut self) -> io::Result<()>;
}

/// Opens byte streams to endpoints.
pub trait Transport {
    /// Connect to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the connection cannot be established.
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ByteStream>>;
}

/// The platform's native transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ByteStream>> {
        debug!(%endpoint, "Connecting to keepassxc");
        connect_native(endpoint).map_err(|source| Error::Transport {
            endpoint: endpoint.to_string(),
            source,
        })
    }
}

#[cfg(unix)]
fn connect_native(endpoint: &Endpoint) -> io::Result<Box<dyn ByteStream>> {
    use std::os::unix::net::UnixStream;

    match endpoint {
        Endpoint::UnixSocket(path) => Ok(Box::new(UnixStream::connect(path)?)),
        Endpoint::NamedPipe(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "named pipes are only available on Windows",
        )),
    }
}

#[cfg(windows)]
fn connect_native(endpoint: &Endpoint) -> io::Result<Box<dyn ByteStream>> {
    match endpoint {
        Endpoint::NamedPipe(name) => {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(name)?;
            Ok(Box::new(PipeStream(Some(file))))
        }
        Endpoint::UnixSocket(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        )),
    }
}

#[cfg(unix)]
impl ByteStream for std::os::unix::net::UnixStream {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        // A zero duration is rejected by the socket API.
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.shutdown(std::net::Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// A client handle to a Windows named pipe.
///
/// Synchronous pipe handles have no per-call timeout, so
/// [`ByteStream::set_timeout`] is a no-op here.
#[cfg(windows)]
struct PipeStream(Option<std::fs::File>);

#[cfg(windows)]
impl PipeStream {
    fn file(&mut self) -> io::Result<&mut std::fs::File> {
        self.0
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "pipe is closed"))
    }
}

#[cfg(windows)]
impl Read for PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file()?.read(buf)
    }
}

#[cfg(windows)]
impl Write for PipeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

#[cfg(windows)]
impl ByteStream for PipeStream {
    fn set_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.0.take();
        Ok(())
    }
}
