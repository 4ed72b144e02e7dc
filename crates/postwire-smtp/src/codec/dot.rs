//! Dot-transparency codec for the `DATA` body (RFC 5321 section 4.5.2).
//!
//! The reader starts at the beginning of a line, so a peer may send an
//! empty body as a bare `.<CRLF>`. The writer always emits a full
//! `<CRLF>.<CRLF>` after an empty body.
//!
//! Only `CRLF` starts a new line. A bare `LF` never does, so a body cannot
//! smuggle a terminator with `<LF>.<LF>` or `<LF>.<CRLF>`.

#![allow(clippy::missing_errors_doc)]

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::Status;
use crate::{Error, Result};

/// Size of the scratch buffer used while draining a body.
const DRAIN_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// At the start of a line.
    BeginLine,
    /// Saw a leading `.`, dropped.
    Dot,
    /// Saw `.` then `\r` at line start; `\r` held back.
    DotCr,
    /// Saw `\r` mid-line; held back until the next byte.
    Cr,
    /// Inside a line.
    Data,
    /// Consumed the terminator.
    Eof,
}

/// Decoded bytes produced by one `read` call.
struct Output<'a> {
    buf: &'a mut [u8],
    len: usize,
    carry: Option<u8>,
    remaining: Option<u64>,
    overflow: bool,
}

impl Output<'_> {
    fn push(&mut self, byte: u8) {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                self.overflow = true;
                return;
            }
            *remaining -= 1;
        }
        if self.len < self.buf.len() {
            self.buf[self.len] = byte;
            self.len += 1;
        } else {
            self.carry = Some(byte);
        }
    }

    fn is_full(&self) -> bool {
        self.len >= self.buf.len() || self.carry.is_some() || self.overflow
    }
}

fn data_byte(byte: u8, out: &mut Output<'_>) -> ReadState {
    if byte == b'\r' {
        ReadState::Cr
    } else {
        out.push(byte);
        ReadState::Data
    }
}

fn step(state: ReadState, byte: u8, out: &mut Output<'_>) -> ReadState {
    match state {
        ReadState::BeginLine => match byte {
            b'.' => ReadState::Dot,
            other => data_byte(other, out),
        },
        ReadState::Dot => match byte {
            b'\r' => ReadState::DotCr,
            other => data_byte(other, out),
        },
        ReadState::DotCr => {
            if byte == b'\n' {
                ReadState::Eof
            } else {
                out.push(b'\r');
                data_byte(byte, out)
            }
        }
        ReadState::Cr => {
            if byte == b'\n' {
                out.push(b'\r');
                out.push(b'\n');
                ReadState::BeginLine
            } else {
                out.push(b'\r');
                data_byte(byte, out)
            }
        }
        ReadState::Data => data_byte(byte, out),
        ReadState::Eof => ReadState::Eof,
    }
}

/// Decodes a dot-terminated body from a buffered source.
///
/// `CRLF` pairs pass through unchanged. One leading dot is dropped from
/// every line. The terminator line is consumed and not returned.
#[derive(Debug)]
pub struct DotReader<R> {
    input: R,
    state: ReadState,
    carry: Option<u8>,
    remaining: Option<u64>,
    overflow: bool,
}

impl<R> DotReader<R>
where
    R: AsyncBufRead + Unpin,
{
    /// Creates a reader. `max_bytes` of 0 means no limit.
    pub const fn new(input: R, max_bytes: u64) -> Self {
        Self {
            input,
            state: ReadState::BeginLine,
            carry: None,
            remaining: if max_bytes > 0 { Some(max_bytes) } else { None },
            overflow: false,
        }
    }

    /// Reads decoded bytes into `buf`. Returns 0 once the terminator is seen.
    ///
    /// Fails with `552 5.3.4` once the body exceeds the limit and with
    /// [`Error::ConnectionLost`] if the stream ends before the terminator.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.overflow {
            return Err(Status::ERR_DATA_TOO_LARGE.into());
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut out = Output {
            buf,
            len: 0,
            carry: None,
            remaining: self.remaining,
            overflow: false,
        };
        if let Some(byte) = self.carry.take() {
            out.buf[0] = byte;
            out.len = 1;
        }

        while !out.is_full() && self.state != ReadState::Eof {
            let chunk = self.input.fill_buf().await?;
            if chunk.is_empty() {
                if out.len > 0 {
                    break;
                }
                return Err(Error::ConnectionLost);
            }

            let mut used = 0;
            for &byte in chunk {
                if out.is_full() || self.state == ReadState::Eof {
                    break;
                }
                used += 1;
                self.state = step(self.state, byte, &mut out);
            }
            self.input.consume(used);
        }

        self.carry = out.carry;
        self.remaining = out.remaining;
        self.overflow = out.overflow;

        if out.overflow && out.len == 0 {
            return Err(Status::ERR_DATA_TOO_LARGE.into());
        }
        Ok(out.len)
    }

    /// Reads the whole body into `out`.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut buf = [0u8; DRAIN_BUFFER_SIZE];
        let mut total = 0;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
    }

    /// Discards the rest of the body, ignoring the size limit.
    pub async fn drain(&mut self) -> Result<()> {
        self.remaining = None;
        self.overflow = false;
        self.carry = None;
        let mut buf = [0u8; DRAIN_BUFFER_SIZE];
        while self.read(&mut buf).await? > 0 {}
        Ok(())
    }

    /// Returns true once the terminator has been consumed.
    pub fn is_done(&self) -> bool {
        self.state == ReadState::Eof && self.carry.is_none()
    }

    /// Returns a mutable reference to the source.
    pub const fn get_mut(&mut self) -> &mut R {
        &mut self.input
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    /// Nothing written yet.
    Begin,
    BeginLine,
    Cr,
    Data,
}

/// Encodes a body into the dot-terminated form.
///
/// Doubles a leading `.` on every line and turns a bare `LF` into `CRLF`.
/// A trailing `CR` is remembered across writes.
#[derive(Debug)]
pub struct DotWriter<W> {
    output: W,
    state: WriteState,
    scratch: BytesMut,
}

impl<W> DotWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Creates a writer for a new body.
    pub fn new(output: W) -> Self {
        Self {
            output,
            state: WriteState::Begin,
            scratch: BytesMut::with_capacity(DRAIN_BUFFER_SIZE),
        }
    }

    /// Encodes and writes `data`.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.scratch.clear();
        self.scratch.reserve(data.len() + data.len() / 16 + 2);

        for &byte in data {
            self.state = match (self.state, byte) {
                (WriteState::Begin | WriteState::BeginLine, b'.') => {
                    self.scratch.put_slice(b"..");
                    WriteState::Data
                }
                (WriteState::Cr, b'\n') => {
                    self.scratch.put_u8(b'\n');
                    WriteState::BeginLine
                }
                (_, b'\n') => {
                    self.scratch.put_slice(b"\r\n");
                    WriteState::BeginLine
                }
                (_, b'\r') => {
                    self.scratch.put_u8(b'\r');
                    WriteState::Cr
                }
                (_, other) => {
                    self.scratch.put_u8(other);
                    WriteState::Data
                }
            };
        }

        self.output.write_all(&self.scratch).await?;
        Ok(())
    }

    /// Ends the current line if needed, writes `.<CRLF>` and flushes.
    pub async fn close(&mut self) -> Result<()> {
        let tail: &[u8] = match self.state {
            WriteState::Begin | WriteState::Data => b"\r\n.\r\n",
            WriteState::Cr => b"\n.\r\n",
            WriteState::BeginLine => b".\r\n",
        };
        self.output.write_all(tail).await?;
        self.output.flush().await?;
        self.state = WriteState::BeginLine;
        Ok(())
    }

    /// Returns the destination.
    pub fn into_inner(self) -> W {
        self.output
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    async fn decode(wire: &[u8], limit: u64) -> Result<Vec<u8>> {
        let mut reader = DotReader::new(wire, limit);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        Ok(out)
    }

    async fn encode(body: &[u8]) -> Vec<u8> {
        let mut writer = DotWriter::new(Vec::new());
        writer.write(body).await.unwrap();
        writer.close().await.unwrap();
        writer.into_inner()
    }

    mod reader {
        use super::*;

        #[tokio::test]
        async fn test_strips_terminator() {
            let out = decode(b"Subject: hi\r\n\r\nbody\r\n.\r\n", 0).await.unwrap();
            assert_eq!(out, b"Subject: hi\r\n\r\nbody\r\n");
        }

        #[tokio::test]
        async fn test_empty_body() {
            assert_eq!(decode(b".\r\n", 0).await.unwrap(), b"");
        }

        #[tokio::test]
        async fn test_drops_one_leading_dot() {
            assert_eq!(
                decode(b".command\r\n.\r\n", 0).await.unwrap(),
                b"command\r\n"
            );
            assert_eq!(
                decode(b"..command\r\n.\r\n", 0).await.unwrap(),
                b".command\r\n"
            );
            assert_eq!(decode(b"..\r\n.\r\n", 0).await.unwrap(), b".\r\n");
        }

        #[tokio::test]
        async fn test_leaves_trailing_bytes_unread() {
            let wire: &[u8] = b"a\r\n.\r\nQUIT\r\n";
            let mut reader = DotReader::new(wire, 0);
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            assert!(reader.is_done());
            assert_eq!(*reader.get_mut(), b"QUIT\r\n");
        }

        #[tokio::test]
        async fn test_bare_lf_does_not_terminate() {
            let out = decode(b"a\n.\nb\n.\r\nc\r\n.\r\n", 0).await.unwrap();
            assert_eq!(out, b"a\n.\nb\n.\r\nc\r\n");
        }

        #[tokio::test]
        async fn test_bare_cr_does_not_terminate() {
            let out = decode(b"a\r.\rb\r\n.\r\n", 0).await.unwrap();
            assert_eq!(out, b"a\r.\rb\r\n");
        }

        #[tokio::test]
        async fn test_dot_cr_without_lf_is_data() {
            let out = decode(b".\rx\r\n.\r\n", 0).await.unwrap();
            assert_eq!(out, b"\rx\r\n");
        }

        #[tokio::test]
        async fn test_unexpected_end() {
            let err = decode(b"a\r\nb\r\n", 0).await.unwrap_err();
            assert!(matches!(err, Error::ConnectionLost));
        }

        #[tokio::test]
        async fn test_quota_exceeded() {
            let err = decode(b"0123456789\r\n.\r\n", 5).await.unwrap_err();
            assert_eq!(err.status(), Some(Status::ERR_DATA_TOO_LARGE));
        }

        #[tokio::test]
        async fn test_quota_exactly_met() {
            let out = decode(b"abc\r\n.\r\n", 5).await.unwrap();
            assert_eq!(out, b"abc\r\n");
        }

        #[tokio::test]
        async fn test_drain_after_quota() {
            let wire: &[u8] = b"0123456789\r\n.\r\nNOOP\r\n";
            let mut reader = DotReader::new(wire, 4);
            let mut out = Vec::new();
            assert!(reader.read_to_end(&mut out).await.is_err());
            reader.drain().await.unwrap();
            assert_eq!(*reader.get_mut(), b"NOOP\r\n");
        }

        #[tokio::test]
        async fn test_one_byte_reads_split_crlf() {
            let wire: &[u8] = b"ab\r\n..c\r\n.\r\n";
            let mut reader = DotReader::new(wire, 0);
            let mut out = Vec::new();
            let mut buf = [0u8; 1];
            loop {
                let n = reader.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            assert_eq!(out, b"ab\r\n.c\r\n");
        }

        #[tokio::test]
        async fn test_fragmented_source() {
            let mock = tokio_test::io::Builder::new()
                .read(b"line one\r")
                .read(b"\n.")
                .read(b".dotted\r\n.")
                .read(b"\r\n")
                .build();
            let mut reader = DotReader::new(tokio::io::BufReader::new(mock), 0);
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, b"line one\r\n.dotted\r\n");
        }
    }

    mod writer {
        use super::*;

        #[tokio::test]
        async fn test_terminates_open_line() {
            assert_eq!(encode(b"hello").await, b"hello\r\n.\r\n");
        }

        #[tokio::test]
        async fn test_keeps_crlf() {
            assert_eq!(encode(b"hello\r\n").await, b"hello\r\n.\r\n");
        }

        #[tokio::test]
        async fn test_converts_bare_lf() {
            assert_eq!(encode(b"a\nb\n").await, b"a\r\nb\r\n.\r\n");
        }

        #[tokio::test]
        async fn test_escapes_leading_dots() {
            assert_eq!(encode(b".\r\n").await, b"..\r\n.\r\n");
            assert_eq!(encode(b"a\r\n.b\n").await, b"a\r\n..b\r\n.\r\n");
        }

        #[tokio::test]
        async fn test_empty_body() {
            assert_eq!(encode(b"").await, b"\r\n.\r\n");
        }

        #[tokio::test]
        async fn test_trailing_cr_across_writes() {
            let mut writer = DotWriter::new(Vec::new());
            writer.write(b"abc\r").await.unwrap();
            writer.write(b"\n.next").await.unwrap();
            writer.close().await.unwrap();
            assert_eq!(writer.into_inner(), b"abc\r\n..next\r\n.\r\n");
        }

        #[tokio::test]
        async fn test_trailing_cr_at_close() {
            assert_eq!(encode(b"abc\r").await, b"abc\r\n.\r\n");
        }

        #[tokio::test]
        async fn test_dot_split_across_writes() {
            let mut writer = DotWriter::new(Vec::new());
            writer.write(b"line\r\n").await.unwrap();
            writer.write(b".").await.unwrap();
            writer.write(b"\r\n").await.unwrap();
            writer.close().await.unwrap();
            assert_eq!(writer.into_inner(), b"line\r\n..\r\n.\r\n");
        }
    }

    fn normalize(body: &[u8]) -> Vec<u8> {
        if body.is_empty() {
            return b"\r\n".to_vec();
        }
        let mut out = Vec::with_capacity(body.len() + 2);
        for (i, &byte) in body.iter().enumerate() {
            if byte == b'\n' && (i == 0 || body[i - 1] != b'\r') {
                out.push(b'\r');
            }
            out.push(byte);
        }
        if !out.ends_with(b"\r\n") {
            if out.ends_with(b"\r") {
                out.push(b'\n');
            } else {
                out.extend_from_slice(b"\r\n");
            }
        }
        out
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    proptest! {
        #[test]
        fn round_trip(body in proptest::collection::vec(
            prop_oneof![Just(b'.'), Just(b'\r'), Just(b'\n'), Just(b'a'), any::<u8>()],
            0..256,
        )) {
            let decoded = block_on(async {
                let wire = encode(&body).await;
                decode(&wire, 0).await.unwrap()
            });
            prop_assert_eq!(decoded, normalize(&body));
        }
    }
}
