// src/server/stream.rs

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

/// A listening address: `unix:///path/to.sock`, `tcp://host:port` or a bare
/// `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    pub fn parse(raw: &str) -> io::Result<Self> {
        let raw = raw.trim();
        if let Some(path) = raw.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unix endpoint '{raw}' has no path"),
                ));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        let addr = raw.strip_prefix("tcp://").unwrap_or(raw);
        if !addr.contains(':') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("tcp endpoint '{raw}' must be host:port"),
            ));
        }
        Ok(Endpoint::Tcp(addr.to_string()))
    }

    /// The socket file of a unix endpoint.
    pub fn unix_path(&self) -> Option<&Path> {
        match self {
            Endpoint::Unix(path) => Some(path),
            Endpoint::Tcp(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// An enum to wrap the listener types (TCP or unix domain) into a single type.
pub enum AnyListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl AnyListener {
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(AnyListener::Tcp(TcpListener::bind(addr.as_str()).await?)),
            Endpoint::Unix(path) => Ok(AnyListener::Unix(UnixListener::bind(path)?)),
        }
    }

    /// Accepts one connection, returning it with a printable peer address.
    pub async fn accept(&self) -> io::Result<(AnyStream, String)> {
        match self {
            AnyListener::Tcp(listener) => {
                let (socket, addr) = listener.accept().await?;
                socket.set_nodelay(true)?;
                Ok((AnyStream::Tcp(socket), addr.to_string()))
            }
            AnyListener::Unix(listener) => {
                let (socket, _) = listener.accept().await?;
                Ok((AnyStream::Unix(socket), "unix".to_string()))
            }
        }
    }
}

/// An enum to wrap different stream types (TCP or unix domain) into a single type.
pub enum AnyStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for AnyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            AnyStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AnyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            AnyStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            AnyStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            AnyStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
