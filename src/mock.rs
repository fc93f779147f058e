//! Mock transport, most useful for testing

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::io::{self, Error, ErrorKind};
use std::rc::Rc;
use std::time::Duration;

use crate::transport::{ConnectOutcome, PeerSubject, TlsOutcome, Transport};

/// One scripted result for a [`MockTransport`] read call.
#[derive(Debug, Clone)]
pub enum ReadStep {
    /// Deliver these bytes. A step larger than the caller's buffer is split,
    /// with the remainder requeued at the front.
    Data(Vec<u8>),
    /// Report `WouldBlock` once.
    Retry,
    /// Report end of stream (the peer closed the connection).
    Eof,
}

/// Scripted behavior and recorded traffic shared between a [`MockTransport`]
/// and the test that created it.
///
/// All fields are public [`VecDeque`] instances; a test pushes steps before
/// (or between) driving calls and inspects `written` afterwards. When
/// `read_queue` is empty, reads report `WouldBlock`. When `connect_queue` is
/// empty, connecting succeeds immediately.
#[derive(Debug, Default)]
pub struct MockScript {
    pub connect_queue: VecDeque<io::Result<ConnectOutcome>>,
    pub read_queue: VecDeque<ReadStep>,
    pub written: Vec<u8>,
    /// Caps how many bytes a single write accepts, to exercise partial sends.
    pub write_limit: Option<usize>,
    /// Subject reported by [`Transport::peer_subject`] once TLS is up.
    pub peer_subject: Option<PeerSubject>,
}

impl MockScript {
    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::default()))
    }

    /// Queues raw bytes for delivery in one read.
    pub fn push_read(&mut self, bytes: &[u8]) {
        self.read_queue.push_back(ReadStep::Data(bytes.to_vec()));
    }

    /// Drains and returns everything written so far.
    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }
}

/// A [`Transport`] driven entirely by a shared [`MockScript`].
pub struct MockTransport {
    script: Rc<RefCell<MockScript>>,
    host: String,
    port: u16,
    secure: bool,
}

impl MockTransport {
    pub fn new(script: Rc<RefCell<MockScript>>) -> Self {
        Self {
            script,
            host: "mock".to_string(),
            port: 0,
            secure: false,
        }
    }

    pub fn with_endpoint(mut self, host: &str, port: u16) -> Self {
        self.host = host.to_string();
        self.port = port;
        self
    }
}

impl Transport for MockTransport {
    fn try_connect(&mut self) -> io::Result<ConnectOutcome> {
        match self.script.borrow_mut().connect_queue.pop_front() {
            Some(x) => x,
            None => Ok(ConnectOutcome::Connected),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut script = self.script.borrow_mut();
        match script.read_queue.pop_front() {
            None | Some(ReadStep::Retry) => Err(Error::new(ErrorKind::WouldBlock, "no data")),
            Some(ReadStep::Eof) => Ok(0),
            Some(ReadStep::Data(mut data)) => {
                if data.len() > buf.len() {
                    let rest = data.split_off(buf.len());
                    script.read_queue.push_front(ReadStep::Data(rest));
                }
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut script = self.script.borrow_mut();
        let n = match script.write_limit {
            Some(limit) => buf.len().min(limit),
            None => buf.len(),
        };
        script.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn wait_writable(&mut self, _timeout: Option<Duration>) -> io::Result<bool> {
        Ok(true)
    }

    fn start_tls(&mut self, _domain: &str) -> io::Result<TlsOutcome> {
        self.secure = true;
        Ok(TlsOutcome::Established)
    }

    fn drive_tls(&mut self) -> io::Result<TlsOutcome> {
        Ok(TlsOutcome::Established)
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn peer_subject(&self) -> Option<PeerSubject> {
        self.script.borrow().peer_subject.clone()
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }
}

impl Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MockTransport")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mock_transport() {
        let script = MockScript::new();
        let mut transport = MockTransport::new(script.clone());

        assert_eq!(transport.try_connect().unwrap(), ConnectOutcome::Connected);

        // pop read results, including a split oversized step
        script.borrow_mut().push_read(b"hello, reader!");
        let mut buf = [0u8; 8];
        assert_eq!(transport.read(&mut buf).unwrap(), 8);
        assert_eq!(&buf, b"hello, r");
        assert_eq!(transport.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"eader!");
        assert_eq!(
            transport.read(&mut buf).unwrap_err().kind(),
            ErrorKind::WouldBlock
        );

        // writes are recorded, honoring write_limit
        script.borrow_mut().write_limit = Some(4);
        assert_eq!(transport.write(b"GET / HTTP/1.1").unwrap(), 4);
        assert_eq!(script.borrow_mut().take_written(), b"GET ");

        // eof after the script runs dry
        script.borrow_mut().read_queue.push_back(ReadStep::Eof);
        assert_eq!(transport.read(&mut buf).unwrap(), 0);
    }
}
