//! Response body decoders for the chunked and identity transfer codings.

use std::cell::{Cell, RefCell};
use std::io::{self, Error, ErrorKind};
use std::rc::Rc;

use log::trace;

use crate::stream::{ByteOutcome, ConnectionStream, LineOutcome};

/// Completion flag a decoder raises when the body logically ends.
///
/// The channel holds one clone and the decoder the other, so the channel can
/// observe completion without the decoder holding a reference back into it.
/// The carried bool reports whether trailer lines still follow on the
/// connection and must be skipped before it can be reused.
#[derive(Debug, Clone, Default)]
pub struct BodySignal {
    state: Rc<Cell<Option<bool>>>,
}

impl BodySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn finish(&self, has_trailer: bool) {
        self.state.set(Some(has_trailer));
    }

    /// Consumes and returns the completion flag, if raised.
    pub fn take(&self) -> Option<bool> {
        self.state.take()
    }

    pub fn is_finished(&self) -> bool {
        self.state.get().is_some()
    }
}

/// Result of one decoder read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyRead {
    /// This many decoded bytes were copied into the caller's buffer.
    Data(usize),
    /// Nothing available right now, ask again later.
    Pending,
    /// The body ended at its logical end. Further reads keep returning this.
    Finished,
    /// The connection closed before the logical end of the body.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data,
    DataTerminator,
    Trailer,
    Done,
}

/// Decoder for `Transfer-Encoding: chunked`.
///
/// Consumes chunk size lines, chunk payloads, and the trailer section
/// including its blank line, leaving the connection positioned at the start of
/// the next response. Because the trailer is consumed here, completion is
/// signaled with `has_trailer = false`.
pub struct ChunkedBodyDecoder {
    source: Rc<RefCell<ConnectionStream>>,
    signal: BodySignal,
    state: ChunkState,
    chunk_remaining: usize,
}

impl ChunkedBodyDecoder {
    pub fn new(source: Rc<RefCell<ConnectionStream>>, signal: BodySignal) -> Self {
        Self {
            source,
            signal,
            state: ChunkState::Size,
            chunk_remaining: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<BodyRead> {
        loop {
            match self.state {
                ChunkState::Done => return Ok(BodyRead::Finished),
                ChunkState::Size => {
                    let line = match self.source.borrow_mut().read_line() {
                        LineOutcome::Line(line) => line,
                        LineOutcome::Pending => return Ok(BodyRead::Pending),
                        LineOutcome::Closed => return Ok(BodyRead::Closed),
                    };
                    let size_text = match line.split_once(';') {
                        Some((size, _extensions)) => size,
                        None => line.as_str(),
                    };
                    let size = usize::from_str_radix(size_text.trim(), 16).map_err(|_| {
                        Error::new(
                            ErrorKind::InvalidData,
                            format!("invalid chunk size: {line:?}"),
                        )
                    })?;
                    if size == 0 {
                        self.state = ChunkState::Trailer;
                    } else {
                        self.chunk_remaining = size;
                        self.state = ChunkState::Data;
                    }
                }
                ChunkState::Data => {
                    if self.chunk_remaining == 0 {
                        self.state = ChunkState::DataTerminator;
                        continue;
                    }
                    let want = buf.len().min(self.chunk_remaining);
                    match self.source.borrow_mut().read_into(&mut buf[..want]) {
                        ByteOutcome::Data(n) => {
                            self.chunk_remaining -= n;
                            return Ok(BodyRead::Data(n));
                        }
                        ByteOutcome::Pending => return Ok(BodyRead::Pending),
                        ByteOutcome::Closed => return Ok(BodyRead::Closed),
                    }
                }
                ChunkState::DataTerminator => {
                    // the empty line that closes each chunk
                    match self.source.borrow_mut().read_line() {
                        LineOutcome::Line(_) => self.state = ChunkState::Size,
                        LineOutcome::Pending => return Ok(BodyRead::Pending),
                        LineOutcome::Closed => return Ok(BodyRead::Closed),
                    }
                }
                ChunkState::Trailer => match self.source.borrow_mut().read_line() {
                    LineOutcome::Line(line) => {
                        if line.is_empty() {
                            self.state = ChunkState::Done;
                            self.signal.finish(false);
                            return Ok(BodyRead::Finished);
                        }
                        trace!("discarding trailer line: {line}");
                    }
                    LineOutcome::Pending => return Ok(BodyRead::Pending),
                    LineOutcome::Closed => return Ok(BodyRead::Closed),
                },
            }
        }
    }
}

/// Decoder for bodies delimited by `Content-Length`, or by connection close
/// when no length was announced.
pub struct IdentityBodyDecoder {
    source: Rc<RefCell<ConnectionStream>>,
    signal: BodySignal,
    remaining: Option<usize>,
    done: bool,
}

impl IdentityBodyDecoder {
    /// `length` is the announced `Content-Length`; `None` reads until the
    /// connection closes.
    pub fn new(
        source: Rc<RefCell<ConnectionStream>>,
        signal: BodySignal,
        length: Option<usize>,
    ) -> Self {
        let mut decoder = Self {
            source,
            signal,
            remaining: length,
            done: false,
        };
        if length == Some(0) {
            decoder.done = true;
            decoder.signal.finish(false);
        }
        decoder
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<BodyRead> {
        if self.done {
            return Ok(BodyRead::Finished);
        }
        let want = match self.remaining {
            Some(remaining) => buf.len().min(remaining),
            None => buf.len(),
        };
        match self.source.borrow_mut().read_into(&mut buf[..want]) {
            ByteOutcome::Data(n) => {
                if let Some(remaining) = &mut self.remaining {
                    *remaining -= n;
                    if *remaining == 0 {
                        self.done = true;
                        self.signal.finish(false);
                    }
                }
                Ok(BodyRead::Data(n))
            }
            ByteOutcome::Pending => Ok(BodyRead::Pending),
            ByteOutcome::Closed => match self.remaining {
                // no announced length: close is the logical end
                None => {
                    self.done = true;
                    self.signal.finish(false);
                    Ok(BodyRead::Finished)
                }
                Some(_) => Ok(BodyRead::Closed),
            },
        }
    }
}

/// Either decoder, chosen from the response headers by
/// [`crate::channel::HttpChannel::read_body`].
pub enum BodyReader {
    Chunked(ChunkedBodyDecoder),
    Identity(IdentityBodyDecoder),
}

impl BodyReader {
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<BodyRead> {
        match self {
            Self::Chunked(d) => d.read(buf),
            Self::Identity(d) => d.read(buf),
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            Self::Chunked(d) => d.is_done(),
            Self::Identity(d) => d.is_done(),
        }
    }

    /// Drives reads into `out` until the body finishes or progress stalls.
    pub fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<BodyRead> {
        let mut buf = [0u8; 4096];
        loop {
            match self.read(&mut buf)? {
                BodyRead::Data(n) => out.extend_from_slice(&buf[..n]),
                other => return Ok(other),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::{MockScript, MockTransport, ReadStep};

    fn source(script: &Rc<std::cell::RefCell<MockScript>>) -> Rc<RefCell<ConnectionStream>> {
        Rc::new(RefCell::new(ConnectionStream::new(Box::new(
            MockTransport::new(script.clone()),
        ))))
    }

    #[test]
    fn chunked_reassembles_and_consumes_trailer() {
        let script = MockScript::new();
        script
            .borrow_mut()
            .push_read(b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\nHTTP/1.1 ");
        let signal = BodySignal::new();
        let mut d = ChunkedBodyDecoder::new(source(&script), signal.clone());

        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match d.read(&mut buf).unwrap() {
                BodyRead::Data(n) => out.extend_from_slice(&buf[..n]),
                BodyRead::Finished => break,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(out, b"Wikipedia");
        assert_eq!(signal.take(), Some(false));
        // reads after the end stay finished
        assert_eq!(d.read(&mut buf).unwrap(), BodyRead::Finished);
        // the next response is untouched in the stream
        assert_eq!(
            d.source.borrow_mut().read_into(&mut buf),
            crate::stream::ByteOutcome::Data(9)
        );
        assert_eq!(&buf[..9], b"HTTP/1.1 ");
    }

    #[test]
    fn chunked_honors_extensions_and_trailer_lines() {
        let script = MockScript::new();
        script
            .borrow_mut()
            .push_read(b"5;name=value\r\nhello\r\n0\r\nExpires: never\r\n\r\n");
        let mut d = ChunkedBodyDecoder::new(source(&script), BodySignal::new());
        assert_eq!(drain(&mut d), b"hello");
    }

    fn drain(d: &mut ChunkedBodyDecoder) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match d.read(&mut buf).unwrap() {
                BodyRead::Data(n) => out.extend_from_slice(&buf[..n]),
                BodyRead::Finished => return out,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
    }

    #[test]
    fn chunked_survives_pending_mid_size_line() {
        let script = MockScript::new();
        let src = source(&script);
        let mut d = ChunkedBodyDecoder::new(src, BodySignal::new());
        let mut buf = [0u8; 64];

        script.borrow_mut().push_read(b"4\r");
        assert_eq!(d.read(&mut buf).unwrap(), BodyRead::Pending);
        script.borrow_mut().push_read(b"\nWi");
        assert_eq!(d.read(&mut buf).unwrap(), BodyRead::Data(2));
        assert_eq!(&buf[..2], b"Wi");
        script.borrow_mut().push_read(b"ki\r\n0\r\n\r\n");
        assert_eq!(d.read(&mut buf).unwrap(), BodyRead::Data(2));
        assert_eq!(&buf[..2], b"ki");
        assert_eq!(d.read(&mut buf).unwrap(), BodyRead::Finished);
    }

    #[test]
    fn chunked_rejects_malformed_size() {
        let script = MockScript::new();
        script.borrow_mut().push_read(b"xyzzy\r\n");
        let mut d = ChunkedBodyDecoder::new(source(&script), BodySignal::new());
        let mut buf = [0u8; 8];
        let err = d.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn chunked_reports_closed_mid_body() {
        let script = MockScript::new();
        script.borrow_mut().push_read(b"8\r\nhal");
        script.borrow_mut().read_queue.push_back(ReadStep::Eof);
        let mut d = ChunkedBodyDecoder::new(source(&script), BodySignal::new());
        let mut buf = [0u8; 8];
        assert_eq!(d.read(&mut buf).unwrap(), BodyRead::Data(3));
        assert_eq!(d.read(&mut buf).unwrap(), BodyRead::Closed);
    }

    #[test]
    fn identity_stops_at_content_length_without_over_read() {
        let script = MockScript::new();
        script.borrow_mut().push_read(b"helloHTTP/1.1 200 OK\r\n");
        let src = source(&script);
        let signal = BodySignal::new();
        let mut d = IdentityBodyDecoder::new(src.clone(), signal.clone(), Some(5));

        let mut buf = [0u8; 64];
        assert_eq!(d.read(&mut buf).unwrap(), BodyRead::Data(5));
        assert_eq!(&buf[..5], b"hello");
        // peeking at the flag must not consume it
        assert!(signal.is_finished());
        assert_eq!(signal.take(), Some(false));
        assert_eq!(d.read(&mut buf).unwrap(), BodyRead::Finished);
        // the next response's status line is still intact
        assert_eq!(
            src.borrow_mut().read_line(),
            LineOutcome::Line("HTTP/1.1 200 OK".to_string())
        );
    }

    #[test]
    fn identity_without_length_finishes_on_close() {
        let script = MockScript::new();
        script.borrow_mut().push_read(b"all of it");
        script.borrow_mut().read_queue.push_back(ReadStep::Eof);
        let signal = BodySignal::new();
        let mut d = IdentityBodyDecoder::new(source(&script), signal.clone(), None);

        let mut buf = [0u8; 64];
        assert_eq!(d.read(&mut buf).unwrap(), BodyRead::Data(9));
        assert_eq!(d.read(&mut buf).unwrap(), BodyRead::Finished);
        assert_eq!(signal.take(), Some(false));
    }

    #[test]
    fn identity_with_length_reports_premature_close() {
        let script = MockScript::new();
        script.borrow_mut().push_read(b"part");
        script.borrow_mut().read_queue.push_back(ReadStep::Eof);
        let mut d = IdentityBodyDecoder::new(source(&script), BodySignal::new(), Some(10));
        let mut buf = [0u8; 64];
        assert_eq!(d.read(&mut buf).unwrap(), BodyRead::Data(4));
        assert_eq!(d.read(&mut buf).unwrap(), BodyRead::Closed);
    }

    #[test]
    fn zero_length_identity_is_immediately_finished() {
        let script = MockScript::new();
        let signal = BodySignal::new();
        let mut d = IdentityBodyDecoder::new(source(&script), signal.clone(), Some(0));
        let mut buf = [0u8; 8];
        assert_eq!(d.read(&mut buf).unwrap(), BodyRead::Finished);
        assert!(signal.is_finished());
    }
}
