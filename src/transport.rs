//! Byte transport abstraction and the non-blocking TCP/TLS implementation.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::{self, Error, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use native_tls::Certificate;
use tcp_stream::{HandshakeError, MidHandshakeTlsStream, NativeTlsConnector, TcpStream};

/// Result of asking a transport whether the connection attempt has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// Still in progress, ask again later.
    Retry,
}

/// Result of driving a TLS handshake one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsOutcome {
    Established,
    /// Still in progress, ask again later.
    Retry,
}

/// How server certificates are treated when negotiating TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Certificate chain and hostname must both check out.
    Strict,
    /// Certificate chain must check out; hostname mismatches are tolerated.
    Loose,
    /// Accept anything.
    NoVerify,
}

/// Name components of the certificate subject presented by a peer, keyed by
/// attribute name (`CN`, `O`, `OU`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSubject {
    components: BTreeMap<String, String>,
}

impl PeerSubject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.components.insert(name.to_string(), value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.components.get(name).map(String::as_str)
    }

    /// True if every component of `self` appears in `other` with the same
    /// value. An empty subject is a subset of anything.
    pub fn is_subset_of(&self, other: &PeerSubject) -> bool {
        self.components
            .iter()
            .all(|(name, value)| other.components.get(name) == Some(value))
    }
}

/// One bidirectional byte pipe to a server.
///
/// Every method is non-waiting unless documented otherwise; in non-blocking
/// mode `read` and `write` surface [`ErrorKind::WouldBlock`] and the caller
/// maps that to a retry-later outcome.
pub trait Transport: Debug {
    /// Advances a pending connection attempt without waiting.
    fn try_connect(&mut self) -> io::Result<ConnectOutcome>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Waits until the transport is ready to accept writes, or the timeout
    /// elapses. `None` waits indefinitely. Returns `Ok(false)` on timeout.
    fn wait_writable(&mut self, timeout: Option<Duration>) -> io::Result<bool>;

    /// Begins negotiating TLS over the established connection.
    fn start_tls(&mut self, domain: &str) -> io::Result<TlsOutcome>;

    /// Advances a handshake begun by [`Transport::start_tls`].
    fn drive_tls(&mut self) -> io::Result<TlsOutcome>;

    fn is_secure(&self) -> bool;

    /// Subject of the certificate the peer presented, when the implementation
    /// can expose one.
    fn peer_subject(&self) -> Option<PeerSubject>;

    fn host(&self) -> &str;

    fn port(&self) -> u16;
}

enum TcpState {
    Connecting(mio::net::TcpStream, mio::Poll, mio::Events),
    Plain(TcpStream),
    MidHandshake(MidHandshakeTlsStream),
    Secure(TcpStream),
    Closed,
}

impl Debug for TcpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting(_, _, _) => "Connecting",
            Self::Plain(_) => "Plain",
            Self::MidHandshake(_) => "MidHandshake",
            Self::Secure(_) => "Secure",
            Self::Closed => "Closed",
        };
        f.write_str(s)
    }
}

/// [`Transport`] over a non-blocking TCP socket with optional TLS upgrade.
///
/// The connection attempt is always initiated in non-blocking mode through mio;
/// once the socket is connected it is converted to a [`tcp_stream::TcpStream`]
/// and switched to the requested blocking mode.
#[derive(Debug)]
pub struct TcpTransport {
    state: TcpState,
    #[cfg(unix)]
    fd: RawFd,
    host: String,
    port: u16,
    nonblocking: bool,
    root_certs: Option<String>,
    verify: VerifyMode,
}

impl TcpTransport {
    /// Starts a connection attempt to `host:port`. Name resolution happens
    /// here, synchronously; the TCP connect itself does not wait.
    ///
    /// `root_certs` optionally carries extra PEM root certificates to trust
    /// during a later TLS upgrade.
    pub fn connect(
        host: &str,
        port: u16,
        nonblocking: bool,
        root_certs: Option<String>,
        verify: VerifyMode,
    ) -> io::Result<Self> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|err| Error::new(ErrorKind::InvalidInput, err))?
            .collect::<Vec<SocketAddr>>();
        let (stream, poll) = Self::addr_to_stream(addrs)?;
        #[cfg(unix)]
        let fd = stream.as_raw_fd();
        let events = mio::Events::with_capacity(1);
        Ok(Self {
            state: TcpState::Connecting(stream, poll, events),
            #[cfg(unix)]
            fd,
            host: host.to_string(),
            port,
            nonblocking,
            root_certs,
            verify,
        })
    }

    fn addr_to_stream(addrs: Vec<SocketAddr>) -> io::Result<(mio::net::TcpStream, mio::Poll)> {
        let mut stream = None;
        let mut err = None;
        for addr in addrs {
            match mio::net::TcpStream::connect(addr) {
                Ok(x) => stream = Some(x),
                Err(x) => err = Some(x),
            }
        }
        let mut stream = match stream {
            Some(x) => x,
            None => match err {
                Some(err) => return Err(err),
                None => return Err(Error::new(ErrorKind::Other, "could not connect to addr")),
            },
        };
        let poll = mio::Poll::new()?;
        poll.registry()
            .register(&mut stream, mio::Token(0), mio::Interest::WRITABLE)?;
        Ok((stream, poll))
    }

    fn connector(&self) -> io::Result<NativeTlsConnector> {
        let mut builder = NativeTlsConnector::builder();
        match self.verify {
            VerifyMode::Strict => {}
            VerifyMode::Loose => {
                builder.danger_accept_invalid_hostnames(true);
            }
            VerifyMode::NoVerify => {
                builder.danger_accept_invalid_hostnames(true);
                builder.danger_accept_invalid_certs(true);
            }
        }
        if let Some(cert_chain) = &self.root_certs {
            let mut cert_chain = std::io::BufReader::new(cert_chain.as_bytes());
            for cert in rustls_pemfile::read_all(&mut cert_chain) {
                if let rustls_pemfile::Item::X509Certificate(cert) = cert? {
                    builder.add_root_certificate(
                        Certificate::from_der(&cert[..])
                            .map_err(|e| Error::new(ErrorKind::Other, e))?,
                    );
                }
            }
        }
        builder.build().map_err(|e| Error::new(ErrorKind::Other, e))
    }

    #[cfg(unix)]
    fn wait_socket_writable(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        let timeout_ms = match timeout {
            None => -1,
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        };
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if rc < 0 {
            return Err(Error::last_os_error());
        }
        Ok(rc > 0)
    }

    #[cfg(windows)]
    fn wait_socket_writable(&self, _timeout: Option<Duration>) -> io::Result<bool> {
        // No poll(2) here. An established socket is reported writable; a full
        // send buffer still surfaces as WouldBlock on the write itself.
        Ok(true)
    }

    fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        match &mut self.state {
            TcpState::Plain(x) | TcpState::Secure(x) => Ok(x),
            TcpState::Connecting(_, _, _) => {
                Err(Error::new(ErrorKind::NotConnected, "stream is connecting"))
            }
            TcpState::MidHandshake(_) => Err(Error::new(
                ErrorKind::NotConnected,
                "stream is mid-handshake",
            )),
            TcpState::Closed => Err(Error::new(ErrorKind::NotConnected, "stream not connected")),
        }
    }
}

impl Transport for TcpTransport {
    fn try_connect(&mut self) -> io::Result<ConnectOutcome> {
        match std::mem::replace(&mut self.state, TcpState::Closed) {
            TcpState::Connecting(stream, mut poll, mut events) => {
                poll.poll(&mut events, Some(Duration::ZERO))?;
                if let Ok(Some(err)) | Err(err) = stream.take_error() {
                    return Err(err);
                }
                match stream.peer_addr() {
                    Ok(..) => {
                        let stream: TcpStream = unsafe { into_tcpstream(stream) };
                        stream.set_nonblocking(self.nonblocking)?;
                        stream.set_nodelay(true)?;
                        self.state = TcpState::Plain(stream);
                        Ok(ConnectOutcome::Connected)
                    }
                    Err(err) => {
                        // `NotConnected`/`ENOTCONN` => still connecting
                        // `ECONNREFUSED` => failed
                        if err.kind() == ErrorKind::NotConnected
                            || err.raw_os_error() == Some(libc::EINPROGRESS)
                        {
                            self.state = TcpState::Connecting(stream, poll, events);
                            Ok(ConnectOutcome::Retry)
                        } else {
                            Err(err)
                        }
                    }
                }
            }
            s @ (TcpState::Plain(_) | TcpState::Secure(_) | TcpState::MidHandshake(_)) => {
                self.state = s;
                Ok(ConnectOutcome::Connected)
            }
            TcpState::Closed => Err(Error::new(ErrorKind::NotConnected, "stream not connected")),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream_mut()?.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream_mut()?.write(buf)
    }

    fn wait_writable(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        // While connecting, the mio registration from `connect` is still live.
        if let TcpState::Connecting(_, poll, events) = &mut self.state {
            poll.poll(events, timeout)?;
            return Ok(!events.is_empty());
        }
        if matches!(self.state, TcpState::Closed) {
            return Err(Error::new(ErrorKind::NotConnected, "stream not connected"));
        }
        self.wait_socket_writable(timeout)
    }

    fn start_tls(&mut self, domain: &str) -> io::Result<TlsOutcome> {
        let stream = match std::mem::replace(&mut self.state, TcpState::Closed) {
            TcpState::Plain(x) => x,
            s @ TcpState::Secure(_) => {
                self.state = s;
                return Ok(TlsOutcome::Established);
            }
            s @ TcpState::MidHandshake(_) => {
                self.state = s;
                return self.drive_tls();
            }
            TcpState::Connecting(_, _, _) => {
                return Err(Error::new(ErrorKind::NotConnected, "stream is connecting"))
            }
            TcpState::Closed => {
                return Err(Error::new(ErrorKind::NotConnected, "stream not connected"))
            }
        };
        let connector = self.connector()?;
        match stream.into_native_tls(&connector, domain) {
            Ok(x) => {
                self.state = TcpState::Secure(x);
                Ok(TlsOutcome::Established)
            }
            Err(HandshakeError::WouldBlock(x)) => {
                self.state = TcpState::MidHandshake(x);
                Ok(TlsOutcome::Retry)
            }
            Err(HandshakeError::Failure(err)) => Err(err),
        }
    }

    fn drive_tls(&mut self) -> io::Result<TlsOutcome> {
        match std::mem::replace(&mut self.state, TcpState::Closed) {
            TcpState::MidHandshake(x) => match x.handshake() {
                Ok(x) => {
                    self.state = TcpState::Secure(x);
                    Ok(TlsOutcome::Established)
                }
                Err(HandshakeError::WouldBlock(x)) => {
                    self.state = TcpState::MidHandshake(x);
                    Ok(TlsOutcome::Retry)
                }
                Err(HandshakeError::Failure(err)) => Err(err),
            },
            s @ TcpState::Secure(_) => {
                self.state = s;
                Ok(TlsOutcome::Established)
            }
            _ => Err(Error::new(ErrorKind::NotConnected, "no handshake pending")),
        }
    }

    fn is_secure(&self) -> bool {
        matches!(self.state, TcpState::Secure(_))
    }

    fn peer_subject(&self) -> Option<PeerSubject> {
        // native-tls validates the chain and hostname during the handshake but
        // does not expose a parsed subject
        None
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        match &mut self.state {
            TcpState::Connecting(stream, _, _) => {
                stream.shutdown(Shutdown::Both).ok();
            }
            TcpState::Plain(stream) | TcpState::Secure(stream) => {
                stream.shutdown(Shutdown::Both).ok();
            }
            TcpState::MidHandshake(x) => {
                x.get_mut().shutdown(Shutdown::Both).ok();
            }
            TcpState::Closed => {}
        }
    }
}

#[cfg(unix)]
unsafe fn into_tcpstream(stream: mio::net::TcpStream) -> TcpStream {
    use std::os::fd::{FromRawFd, IntoRawFd};
    TcpStream::from_raw_fd(stream.into_raw_fd())
}

#[cfg(windows)]
unsafe fn into_tcpstream(stream: mio::net::TcpStream) -> TcpStream {
    use std::os::windows::io::{FromRawSocket, IntoRawSocket};
    TcpStream::from_raw_socket(stream.into_raw_socket())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn subject_subset_matching() {
        let expected = PeerSubject::new().with("O", "Example Corp");
        let presented = PeerSubject::new()
            .with("CN", "www.example.com")
            .with("O", "Example Corp")
            .with("C", "US");
        assert!(expected.is_subset_of(&presented));
        assert!(!presented.is_subset_of(&expected));
        assert!(PeerSubject::new().is_subset_of(&presented));

        let wrong = PeerSubject::new().with("O", "Other Corp");
        assert!(!wrong.is_subset_of(&presented));
    }
}
