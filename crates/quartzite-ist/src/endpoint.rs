//! Receive endpoint resolution and the blocking TCP/TLS stream.
//!
//! Endpoint URIs have the shape `(tcp|ssl)://host:port`. When the port is
//! omitted it defaults to `base_port + 1`; port 0 asks the listener for an
//! ephemeral port. TLS material is supplied by the embedder as prebuilt
//! rustls configurations.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConnection, StreamOwned};

use crate::error::{Error, Result};

// ============================================================================
// Endpoint
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Ssl,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Ssl => "ssl",
        }
    }
}

/// A parsed `(tcp|ssl)://host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parses an endpoint string. A missing scheme defaults to `tcp` (or
    /// `ssl` when `prefer_ssl`); a missing port defaults to `default_port`.
    pub fn parse(addr: &str, default_port: u16, prefer_ssl: bool) -> Result<Self> {
        let (scheme, rest) = match addr.split_once("://") {
            Some(("tcp", rest)) => (Scheme::Tcp, rest),
            Some(("ssl", rest)) => (Scheme::Ssl, rest),
            Some((other, _)) => {
                return Err(Error::Address(format!("unsupported scheme '{other}'")));
            }
            None => (if prefer_ssl { Scheme::Ssl } else { Scheme::Tcp }, addr),
        };

        if rest.is_empty() {
            return Err(Error::Address("empty host".to_string()));
        }

        // bracketed IPv6 literal or host[:port]
        let (host, port) = if let Some(stripped) = rest.strip_prefix('[') {
            match stripped.split_once(']') {
                Some((host, "")) => (host.to_string(), default_port),
                Some((host, p)) => {
                    let p = p.strip_prefix(':').ok_or_else(|| {
                        Error::Address(format!("malformed address '{rest}'"))
                    })?;
                    (host.to_string(), parse_port(p)?)
                }
                None => return Err(Error::Address(format!("malformed address '{rest}'"))),
            }
        } else {
            match rest.rsplit_once(':') {
                Some((host, p)) if !host.contains(':') => (host.to_string(), parse_port(p)?),
                _ => (rest.to_string(), default_port),
            }
        };

        if host.is_empty() {
            return Err(Error::Address("empty host".to_string()));
        }

        Ok(Endpoint { scheme, host, port })
    }

    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority())
    }
}

fn parse_port(p: &str) -> Result<u16> {
    p.parse()
        .map_err(|_| Error::Address(format!("invalid port '{p}'")))
}

// ============================================================================
// TLS configuration
// ============================================================================

/// Prebuilt TLS material supplied by the embedder. Certificate loading and
/// verification policy are outside the replication core.
#[derive(Clone)]
pub struct TlsConfig {
    pub server: Arc<rustls::ServerConfig>,
    pub client: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TlsConfig { .. }")
    }
}

// ============================================================================
// Stream
// ============================================================================

/// A blocking byte stream over plain TCP or TLS.
pub enum Stream {
    Tcp(TcpStream),
    TlsClient(Box<StreamOwned<ClientConnection, TcpStream>>),
    TlsServer(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Stream {
    /// Connects to a peer endpoint.
    pub fn connect(endpoint: &Endpoint, tls: Option<&TlsConfig>) -> Result<Self> {
        let sock = TcpStream::connect(endpoint.authority())?;
        sock.set_nodelay(true)?;
        match endpoint.scheme {
            Scheme::Tcp => Ok(Stream::Tcp(sock)),
            Scheme::Ssl => {
                let tls = tls.ok_or(Error::TlsNotConfigured)?;
                let name = ServerName::try_from(endpoint.host.clone())
                    .map_err(|_| Error::Address(format!("invalid TLS name '{}'", endpoint.host)))?;
                let conn = ClientConnection::new(Arc::clone(&tls.client), name)
                    .map_err(|e| Error::Proto(format!("TLS client setup: {e}")))?;
                Ok(Stream::TlsClient(Box::new(StreamOwned::new(conn, sock))))
            }
        }
    }

    /// Wraps an accepted connection according to the listener's scheme.
    pub fn accept(sock: TcpStream, scheme: Scheme, tls: Option<&TlsConfig>) -> Result<Self> {
        sock.set_nodelay(true)?;
        match scheme {
            Scheme::Tcp => Ok(Stream::Tcp(sock)),
            Scheme::Ssl => {
                let tls = tls.ok_or(Error::TlsNotConfigured)?;
                let conn = ServerConnection::new(Arc::clone(&tls.server))
                    .map_err(|e| Error::Proto(format!("TLS server setup: {e}")))?;
                Ok(Stream::TlsServer(Box::new(StreamOwned::new(conn, sock))))
            }
        }
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Tcp(s) => s,
            Stream::TlsClient(s) => s.get_ref(),
            Stream::TlsServer(s) => s.get_ref(),
        }
    }

    /// A cloned handle usable to shut the connection down from another
    /// thread.
    pub fn shutdown_handle(&self) -> Result<ShutdownHandle> {
        Ok(ShutdownHandle(self.tcp().try_clone()?))
    }

    pub fn shutdown(&self) {
        let _ = self.tcp().shutdown(Shutdown::Both);
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::TlsClient(s) => s.read(buf),
            Stream::TlsServer(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::TlsClient(s) => s.write(buf),
            Stream::TlsServer(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::TlsClient(s) => s.flush(),
            Stream::TlsServer(s) => s.flush(),
        }
    }
}

/// Cross-thread shutdown handle for a [`Stream`].
pub struct ShutdownHandle(TcpStream);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_endpoint() {
        let e = Endpoint::parse("tcp://10.0.0.5:4568", 4568, false).unwrap();
        assert_eq!(e.scheme, Scheme::Tcp);
        assert_eq!(e.host, "10.0.0.5");
        assert_eq!(e.port, 4568);
        assert_eq!(e.to_string(), "tcp://10.0.0.5:4568");
    }

    #[test]
    fn defaults_scheme_and_port() {
        let e = Endpoint::parse("db1.example.com", 4568, false).unwrap();
        assert_eq!(e.scheme, Scheme::Tcp);
        assert_eq!(e.port, 4568);

        let e = Endpoint::parse("db1.example.com", 4568, true).unwrap();
        assert_eq!(e.scheme, Scheme::Ssl);
    }

    #[test]
    fn parses_ipv6_literal() {
        let e = Endpoint::parse("tcp://[::1]:9999", 4568, false).unwrap();
        assert_eq!(e.host, "::1");
        assert_eq!(e.port, 9999);
        assert_eq!(e.authority(), "[::1]:9999");

        let e = Endpoint::parse("[fe80::2]", 4568, false).unwrap();
        assert_eq!(e.host, "fe80::2");
        assert_eq!(e.port, 4568);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Endpoint::parse("", 1, false).is_err());
        assert!(Endpoint::parse("ftp://x:1", 1, false).is_err());
        assert!(Endpoint::parse("tcp://host:notaport", 1, false).is_err());
        assert!(Endpoint::parse("tcp://[::1", 1, false).is_err());
    }
}
