//! Buffered reading and writing over a [`Transport`].

use std::io::{self, ErrorKind};

use log::{debug, info, trace};

use crate::buffer::SlideBuffer;
use crate::transport::Transport;

const READ_BUFFER_CAPACITY: usize = 4096;

/// Result of asking the stream for a complete line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// A full line, with the terminator and trailing whitespace stripped.
    Line(String),
    /// No complete line buffered yet, ask again later.
    Pending,
    /// The connection closed before a terminator arrived.
    Closed,
}

/// Result of asking the stream for raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOutcome {
    /// This many bytes were copied into the caller's buffer.
    Data(usize),
    /// Nothing available right now, ask again later.
    Pending,
    /// The connection is closed and the buffer is drained.
    Closed,
}

enum FillOutcome {
    Data,
    Pending,
    Closed,
}

/// A [`Transport`] wrapped with a slide buffer on the read side and partial
/// line accumulation for header parsing.
///
/// A line begun in one call is held across any number of `Pending` returns
/// until its terminator arrives, so non-blocking callers can simply retry.
/// The write side offers both a single non-waiting attempt and a fully
/// draining blocking send.
#[derive(Debug)]
pub struct ConnectionStream {
    transport: Box<dyn Transport>,
    buffer: SlideBuffer,
    partial_line: String,
    closed: bool,
}

impl ConnectionStream {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            buffer: SlideBuffer::with_capacity(READ_BUFFER_CAPACITY),
            partial_line: String::new(),
            closed: false,
        }
    }

    pub fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        &mut *self.transport
    }

    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }

    /// True once the peer has closed the connection or a read error occurred.
    /// Buffered bytes remain readable after this turns true.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn fill(&mut self) -> FillOutcome {
        if !self.buffer.is_empty() {
            return FillOutcome::Data;
        }
        if self.closed {
            return FillOutcome::Closed;
        }
        let space = self.buffer.space();
        match self.transport.read(space) {
            Ok(0) => {
                info!(
                    "Lost connection to {}:{}",
                    self.transport.host(),
                    self.transport.port()
                );
                self.closed = true;
                FillOutcome::Closed
            }
            Ok(n) => {
                self.buffer.commit(n);
                FillOutcome::Data
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => FillOutcome::Pending,
            Err(err) => {
                info!(
                    "Socket error detected on connection to {}:{}: {}",
                    self.transport.host(),
                    self.transport.port(),
                    err
                );
                self.closed = true;
                FillOutcome::Closed
            }
        }
    }

    /// Reads one line terminated by `\n`. The terminator and any trailing
    /// whitespace, carriage return included, are trimmed.
    pub fn read_line(&mut self) -> LineOutcome {
        loop {
            let unread = self.buffer.unread();
            match unread.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    for b in &unread[..pos] {
                        self.partial_line.push(*b as char);
                    }
                    self.buffer.consume(pos + 1);
                    let mut line = std::mem::take(&mut self.partial_line);
                    line.truncate(line.trim_end().len());
                    trace!("recv: {line}");
                    return LineOutcome::Line(line);
                }
                None => {
                    for b in unread {
                        self.partial_line.push(*b as char);
                    }
                    let n = self.buffer.len();
                    self.buffer.consume(n);
                    match self.fill() {
                        FillOutcome::Data => continue,
                        FillOutcome::Pending => return LineOutcome::Pending,
                        FillOutcome::Closed => return LineOutcome::Closed,
                    }
                }
            }
        }
    }

    /// Reads raw bytes into `buf`, draining the internal buffer first.
    pub fn read_into(&mut self, buf: &mut [u8]) -> ByteOutcome {
        if buf.is_empty() {
            return ByteOutcome::Data(0);
        }
        match self.fill() {
            FillOutcome::Data => {
                let unread = self.buffer.unread();
                let n = unread.len().min(buf.len());
                buf[..n].copy_from_slice(&unread[..n]);
                self.buffer.consume(n);
                ByteOutcome::Data(n)
            }
            FillOutcome::Pending => ByteOutcome::Pending,
            FillOutcome::Closed => ByteOutcome::Closed,
        }
    }

    /// Attempts one write. Returns `Ok(None)` when the transport is not ready
    /// for any bytes right now. A definitive failure marks the stream closed.
    pub fn try_write(&mut self, data: &[u8]) -> io::Result<Option<usize>> {
        match self.transport.write(data) {
            Ok(0) if !data.is_empty() => {
                self.closed = true;
                Err(io::Error::new(ErrorKind::UnexpectedEof, "write returned 0"))
            }
            Ok(n) => Ok(Some(n)),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => {
                self.closed = true;
                Err(err)
            }
        }
    }

    /// Writes all of `data`, waiting for transport readiness as needed.
    pub fn write_fully(&mut self, data: &[u8]) -> io::Result<()> {
        let mut sent = 0;
        while sent < data.len() {
            match self.try_write(&data[sent..])? {
                Some(n) => sent += n,
                None => {
                    debug!("waiting for transport to accept writes");
                    self.transport.wait_writable(None)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::{MockScript, MockTransport, ReadStep};

    fn stream(script: &std::rc::Rc<std::cell::RefCell<MockScript>>) -> ConnectionStream {
        ConnectionStream::new(Box::new(MockTransport::new(script.clone())))
    }

    #[test]
    fn line_accumulates_across_pending_reads() {
        let script = MockScript::new();
        let mut s = stream(&script);

        script.borrow_mut().push_read(b"HTTP/1.1 20");
        assert_eq!(s.read_line(), LineOutcome::Pending);
        script.borrow_mut().push_read(b"0 OK\r\nSer");
        assert_eq!(
            s.read_line(),
            LineOutcome::Line("HTTP/1.1 200 OK".to_string())
        );
        // the tail of the second read stays buffered for the next line
        script.borrow_mut().push_read(b"ver: x\r\n");
        assert_eq!(s.read_line(), LineOutcome::Line("Server: x".to_string()));
    }

    #[test]
    fn line_strips_bare_cr_and_trailing_whitespace() {
        let script = MockScript::new();
        let mut s = stream(&script);
        script.borrow_mut().push_read(b"value  \t \r\n");
        assert_eq!(s.read_line(), LineOutcome::Line("value".to_string()));
    }

    #[test]
    fn closed_midline_reports_closed() {
        let script = MockScript::new();
        let mut s = stream(&script);
        script.borrow_mut().push_read(b"no newline");
        script.borrow_mut().read_queue.push_back(ReadStep::Eof);
        assert_eq!(s.read_line(), LineOutcome::Closed);
        assert!(s.is_closed());
    }

    #[test]
    fn read_into_drains_buffer_before_transport() {
        let script = MockScript::new();
        let mut s = stream(&script);
        script.borrow_mut().push_read(b"head\r\nbody");
        assert_eq!(s.read_line(), LineOutcome::Line("head".to_string()));
        let mut buf = [0u8; 16];
        assert_eq!(s.read_into(&mut buf), ByteOutcome::Data(4));
        assert_eq!(&buf[..4], b"body");
        assert_eq!(s.read_into(&mut buf), ByteOutcome::Pending);
    }

    #[test]
    fn write_fully_drains_partial_sends() {
        let script = MockScript::new();
        script.borrow_mut().write_limit = Some(3);
        let mut s = stream(&script);
        s.write_fully(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(script.borrow_mut().take_written(), b"GET / HTTP/1.1\r\n\r\n");
    }
}
