//! Message body reader that prepends the `Received:` trace header.
//!
//! [`TraceHeaderStream`] wraps the body reader handed over after `DATA`
//! and serves the synthesized header bytes before the wrapped stream's
//! own bytes, without buffering the body. The splice is forward-only:
//! once the header is drained every read is delegated untouched, and
//! operations that would rewind or jump across the boundary are refused.

use std::{
    io::{self, BufRead, Cursor, Empty, Read},
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

use crate::ReceivedHeader;

/// Estimate of the bytes a reader can serve without blocking.
pub trait Available {
    fn available(&self) -> io::Result<usize>;
}

impl Available for &[u8] {
    fn available(&self) -> io::Result<usize> {
        Ok(self.len())
    }
}

impl<T: AsRef<[u8]>> Available for Cursor<T> {
    fn available(&self) -> io::Result<usize> {
        let len = self.get_ref().as_ref().len() as u64;
        Ok(len.saturating_sub(self.position()) as usize)
    }
}

impl Available for Empty {
    fn available(&self) -> io::Result<usize> {
        Ok(0)
    }
}

impl<R> Available for io::BufReader<R> {
    fn available(&self) -> io::Result<usize> {
        Ok(self.buffer().len())
    }
}

impl<R: AsyncRead> Available for tokio::io::BufReader<R> {
    fn available(&self) -> io::Result<usize> {
        Ok(self.buffer().len())
    }
}

impl<T: Available + ?Sized> Available for &mut T {
    fn available(&self) -> io::Result<usize> {
        (**self).available()
    }
}

fn unsupported(operation: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{operation} is not supported by the trace header stream"),
    )
}

/// Reader splicing a frozen header in front of an underlying stream.
#[derive(Debug)]
pub struct TraceHeaderStream<R> {
    inner: R,
    header: Box<[u8]>,
    position: usize,
}

impl<R> TraceHeaderStream<R> {
    /// Wraps `inner`, rendering `header` once at construction.
    pub fn new(inner: R, header: &ReceivedHeader) -> Self {
        Self::with_header_bytes(inner, header.to_bytes())
    }

    /// Wraps `inner` with an already rendered header block.
    pub fn with_header_bytes(inner: R, header: impl Into<Vec<u8>>) -> Self {
        Self {
            inner,
            header: header.into().into_boxed_slice(),
            position: 0,
        }
    }

    /// The complete frozen header, regardless of how much was read.
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Header bytes still to be served.
    pub fn header_remaining(&self) -> usize {
        self.header.len() - self.position
    }

    /// Whether reads are now delegated to the underlying stream.
    pub fn is_header_drained(&self) -> bool {
        self.header_remaining() == 0
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Always `false`, the splice cannot be rewound.
    pub fn mark_supported(&self) -> bool {
        false
    }

    pub fn mark(&mut self, _read_limit: usize) -> io::Result<()> {
        Err(unsupported("mark"))
    }

    pub fn reset(&mut self) -> io::Result<()> {
        Err(unsupported("reset"))
    }

    /// Skipping would cross the header/body boundary with no defined meaning.
    pub fn skip(&mut self, _count: u64) -> io::Result<u64> {
        Err(unsupported("skip"))
    }

    /// Closes the stream together with the underlying one.
    pub fn close(self) {
        debug!(
            header_remaining = self.header_remaining(),
            "Closing trace header stream"
        );
        drop(self.inner);
    }

    fn remaining_header(&self) -> &[u8] {
        &self.header[self.position..]
    }

    fn advance_header(&mut self, count: usize) {
        self.position += count;
        if count > 0 && self.is_header_drained() {
            debug!(
                header_len = self.header.len(),
                "Trace header drained, delegating to body stream"
            );
        }
    }

    fn copy_header(&mut self, buf: &mut [u8]) -> usize {
        let remaining = self.remaining_header();
        let count = remaining.len().min(buf.len());
        buf[..count].copy_from_slice(&remaining[..count]);
        self.advance_header(count);
        count
    }
}

impl<R: Available> TraceHeaderStream<R> {
    /// Header remainder plus the underlying estimate, not a readiness guarantee.
    pub fn available(&self) -> io::Result<usize> {
        Ok(self
            .header_remaining()
            .saturating_add(self.inner.available()?))
    }
}

impl<R: Read> TraceHeaderStream<R> {
    /// Reads a single byte, `None` at the end of the stream.
    pub fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

impl<R: Read> Read for TraceHeaderStream<R> {
    /// Serves header bytes first; a read the header only partially fills is
    /// topped off with one read of the underlying stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let copied = self.copy_header(buf);
        if copied == 0 {
            return self.inner.read(buf);
        }
        if copied == buf.len() {
            return Ok(copied);
        }

        // header bytes are already in `buf`, an error resurfaces on the next read
        match self.inner.read(&mut buf[copied..]) {
            Ok(extra) => Ok(copied + extra),
            Err(err) => {
                debug!(error = %err, "Body read failed after the trace header");
                Ok(copied)
            }
        }
    }
}

impl<R: BufRead> BufRead for TraceHeaderStream<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if !self.is_header_drained() {
            return Ok(self.remaining_header());
        }
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        let from_header = amt.min(self.header_remaining());
        self.advance_header(from_header);
        if amt > from_header {
            self.inner.consume(amt - from_header);
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TraceHeaderStream<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let remaining = this.remaining_header();
        let count = remaining.len().min(buf.remaining());
        if count == 0 {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
        buf.put_slice(&remaining[..count]);
        this.advance_header(count);
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // the header bytes complete the read even if the body is not ready
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Err(err)) => {
                debug!(error = %err, "Body read failed after the trace header");
                Poll::Ready(Ok(()))
            }
            _ => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::RemoteHost;

    pub(super) const BODY: &[u8] = b"Subject: Hello\r\n\r\nBody text\r\n";

    pub(super) fn header() -> ReceivedHeader {
        ReceivedHeader::new(
            RemoteHost::new("10.0.0.1".parse().unwrap()).with_hostname("client.example.com"),
            "mx.example.com",
            "abc123",
        )
        .helo("client.example.com")
        .recipient("rcpt@example.com")
        .timestamp(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap())
    }

    pub(super) fn expected() -> Vec<u8> {
        let mut expected = header().to_bytes();
        expected.extend_from_slice(BODY);
        expected
    }

    fn stream() -> TraceHeaderStream<Cursor<&'static [u8]>> {
        TraceHeaderStream::new(Cursor::new(BODY), &header())
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl Read for DropFlag {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_header_rendered_once() {
        let stream = stream();
        assert_eq!(stream.header(), header().to_bytes().as_slice());
        assert_eq!(stream.header_remaining(), stream.header().len());
        assert!(!stream.is_header_drained());
    }

    #[test]
    fn test_read_to_end_splices_header_and_body() {
        let mut stream = stream();
        let mut output = Vec::new();
        stream.read_to_end(&mut output).unwrap();
        assert_eq!(output, expected());
    }

    #[test]
    fn test_splice_boundary() {
        let mut stream = stream();
        let header_len = stream.header().len();

        let mut first = vec![0u8; header_len - 1];
        assert_eq!(stream.read(&mut first).unwrap(), header_len - 1);

        let mut second = [0u8; 10];
        assert_eq!(stream.read(&mut second).unwrap(), 10);
        assert_eq!(second[0], b'\n');
        assert_eq!(&second[1..], &BODY[..9]);
        assert!(stream.is_header_drained());
    }

    #[test]
    fn test_short_underlying_read() {
        let mut stream = TraceHeaderStream::with_header_bytes(&b"xy"[..], b"HDR".to_vec());
        let mut buf = [0u8; 10];
        assert_eq!(stream.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"HDRxy");
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_empty_underlying_stream() {
        let mut stream = TraceHeaderStream::with_header_bytes(io::empty(), b"HDR".to_vec());
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 3);
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        assert_eq!(stream.available().unwrap(), 0);
    }

    #[test]
    fn test_read_byte() {
        let mut stream = TraceHeaderStream::with_header_bytes(&b"b"[..], b"a".to_vec());
        assert_eq!(stream.read_byte().unwrap(), Some(b'a'));
        assert_eq!(stream.read_byte().unwrap(), Some(b'b'));
        assert_eq!(stream.read_byte().unwrap(), None);
    }

    #[test]
    fn test_zero_length_read() {
        let mut stream = stream();
        let mut empty = [0u8; 0];
        assert_eq!(stream.read(&mut empty).unwrap(), 0);
        assert_eq!(stream.header_remaining(), stream.header().len());
    }

    #[test]
    fn test_available() {
        let mut stream = stream();
        let header_len = stream.header().len();
        assert_eq!(stream.available().unwrap(), header_len + BODY.len());

        let mut buf = vec![0u8; header_len + 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(stream.available().unwrap(), BODY.len() - 4);
    }

    fn assert_unsupported<R>(stream: &mut TraceHeaderStream<R>) {
        assert!(!stream.mark_supported());
        assert_eq!(
            stream.mark(16).unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
        assert_eq!(stream.reset().unwrap_err().kind(), io::ErrorKind::Unsupported);
        assert_eq!(stream.skip(1).unwrap_err().kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_unsupported_operations_in_every_state() {
        let mut stream = stream();
        let header_len = stream.header().len();
        assert_unsupported(&mut stream);

        let mut buf = vec![0u8; header_len / 2];
        stream.read_exact(&mut buf).unwrap();
        assert_unsupported(&mut stream);

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert!(stream.is_header_drained());
        assert_unsupported(&mut stream);
    }

    #[test]
    fn test_body_error_after_header_is_deferred() {
        let mut stream = TraceHeaderStream::with_header_bytes(FailingReader, b"HDR".to_vec());
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 3);
        assert_eq!(
            stream.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );
    }

    #[test]
    fn test_buf_read_lines() {
        let mut stream = TraceHeaderStream::new(io::BufReader::new(BODY), &header());
        let mut lines = Vec::new();
        let mut line = String::new();
        while stream.read_line(&mut line).unwrap() > 0 {
            lines.push(line.clone());
            line.clear();
        }

        assert_eq!(lines.len(), 8);
        assert!(lines[0].starts_with("Received: from client.example.com ("));
        assert_eq!(lines[3], "        for rcpt@example.com;\r\n");
        assert_eq!(lines[5], "Subject: Hello\r\n");
        assert_eq!(lines[7], "Body text\r\n");
    }

    #[test]
    fn test_close_drops_underlying_stream() {
        let closed = Arc::new(AtomicBool::new(false));
        let stream =
            TraceHeaderStream::with_header_bytes(DropFlag(Arc::clone(&closed)), b"HDR".to_vec());
        assert!(!closed.load(Ordering::SeqCst));
        stream.close();
        assert!(closed.load(Ordering::SeqCst));
    }
}
