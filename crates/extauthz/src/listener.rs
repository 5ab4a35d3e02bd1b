//! Listener address parsing and binding
//!
//! Supported forms:
//!
//! - `host:port` or `grpc://host:port` for plain TCP (an empty host binds
//!   every interface)
//! - `unix:///path/to/socket`, removing a stale socket file first
//! - `unix://@name` for a Linux abstract socket

use std::fmt;
use std::io;
use std::path::PathBuf;

use tokio::net::{TcpListener, UnixListener};
use tracing::debug;

use crate::error::{ExtAuthzError, Result};

const GRPC_SCHEME: &str = "grpc://";
const UNIX_SCHEME: &str = "unix://";

/// Parsed listener address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// TCP `host:port`
    Tcp(String),
    /// Unix socket on the filesystem
    Unix(PathBuf),
    /// Linux abstract Unix socket, name without the leading `@`
    Abstract(String),
}

impl ListenAddr {
    /// Parse a configured address
    pub fn parse(addr: &str) -> Result<Self> {
        let addr = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("{}{}", GRPC_SCHEME, addr)
        };

        if let Some(host_port) = addr.strip_prefix(GRPC_SCHEME) {
            if !host_port.contains(':') {
                return Err(ExtAuthzError::listener(format!(
                    "missing port in address {:?}",
                    host_port
                )));
            }
            let host_port = if host_port.starts_with(':') {
                format!("0.0.0.0{}", host_port)
            } else {
                host_port.to_string()
            };
            return Ok(ListenAddr::Tcp(host_port));
        }

        if let Some(rest) = addr.strip_prefix(UNIX_SCHEME) {
            if let Some(name) = rest.strip_prefix('@') {
                if name.is_empty() {
                    return Err(ExtAuthzError::listener("empty abstract socket name"));
                }
                return Ok(ListenAddr::Abstract(name.to_string()));
            }
            if rest.is_empty() {
                return Err(ExtAuthzError::listener("empty unix socket path"));
            }
            return Ok(ListenAddr::Unix(PathBuf::from(rest)));
        }

        Err(ExtAuthzError::listener(format!(
            "invalid url scheme in address {:?}",
            addr
        )))
    }

    /// Bind the address
    pub async fn bind(&self) -> Result<BoundListener> {
        match self {
            ListenAddr::Tcp(host_port) => TcpListener::bind(host_port.as_str())
                .await
                .map(BoundListener::Tcp)
                .map_err(|e| bind_error(self, e)),
            ListenAddr::Unix(path) => {
                match std::fs::remove_file(path) {
                    Ok(()) => debug!(path = %path.display(), "Removed stale socket file"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(bind_error(self, e)),
                }
                UnixListener::bind(path)
                    .map(BoundListener::Unix)
                    .map_err(|e| bind_error(self, e))
            }
            ListenAddr::Abstract(name) => bind_abstract(name)
                .map(BoundListener::Unix)
                .map_err(|e| bind_error(self, e)),
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(host_port) => write!(f, "{}{}", GRPC_SCHEME, host_port),
            ListenAddr::Unix(path) => write!(f, "{}{}", UNIX_SCHEME, path.display()),
            ListenAddr::Abstract(name) => write!(f, "{}@{}", UNIX_SCHEME, name),
        }
    }
}

fn bind_error(addr: &ListenAddr, err: io::Error) -> ExtAuthzError {
    ExtAuthzError::listener(format!("unable to bind {}: {}", addr, err))
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> io::Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};

    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    let listener = StdUnixListener::bind_addr(&addr)?;
    listener.set_nonblocking(true)?;
    UnixListener::from_std(listener)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(_name: &str) -> io::Result<UnixListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract unix sockets are only supported on Linux",
    ))
}

/// A bound listener ready to accept connections
#[derive(Debug)]
pub enum BoundListener {
    /// TCP listener
    Tcp(TcpListener),
    /// Unix socket listener (filesystem or abstract)
    Unix(UnixListener),
}

impl BoundListener {
    /// Local TCP address, if this is a TCP listener
    pub fn tcp_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            BoundListener::Tcp(listener) => listener.local_addr().ok(),
            BoundListener::Unix(_) => None,
        }
    }
}
