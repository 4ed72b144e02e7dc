//! `BDAT` chunking (RFC 3030).
//!
//! The reader pulls chunk announcements out of the command stream through
//! a [`NextCommand`] strategy, so the body layer never parses commands on
//! its own. The writers split a body into `BDAT <n> [LAST]` chunks and wait
//! for the peer's acknowledgement through a [`ChunkSink`].

#![allow(clippy::missing_errors_doc)]

use std::future::Future;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::types::{EnhancedCode, Status};
use crate::{Error, Result};

const DRAIN_BUFFER_SIZE: usize = 4096;

fn bdat_syntax(message: &'static str) -> Error {
    Status::new(501, EnhancedCode::new(5, 5, 4), message).into()
}

/// Parses the argument of a `BDAT` command into `(size, last)`.
///
/// # Errors
///
/// Returns a `501 5.5.4` status for a missing, malformed or zero size
/// (unless `LAST`), an unknown trailing token, or too many arguments.
pub fn parse_bdat_args(arg: &str) -> Result<(u64, bool)> {
    let args: Vec<&str> = arg.split_whitespace().collect();
    let (size, last) = match args.as_slice() {
        [] => return Err(bdat_syntax("Missing chunk size argument")),
        [size] => (*size, false),
        [size, flag] => {
            if !flag.eq_ignore_ascii_case("LAST") {
                return Err(bdat_syntax("Unknown BDAT argument"));
            }
            (*size, true)
        }
        _ => return Err(bdat_syntax("Too many arguments")),
    };

    let size = Some(size)
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|size| *size > 0 || last)
        .ok_or_else(|| bdat_syntax("Malformed size argument"))?;
    Ok((u64::from(size), last))
}

/// Strategy that fetches the command following a non-final chunk.
///
/// Implementations acknowledge the chunk just read and then read the next
/// command line from `input`, returning `(VERB, argument)`.
pub trait NextCommand<R> {
    /// Acknowledges the previous chunk and reads the next command.
    fn next_command(&mut self, input: &mut R) -> impl Future<Output = Result<(String, String)>> + Send;
}

/// Reads a chunked body.
///
/// Fails with [`Error::Reset`] or [`Error::Quit`] when the peer sends
/// `RSET` or `QUIT` instead of another chunk, and with
/// [`Error::ConnectionLost`] if the stream ends inside the body.
#[derive(Debug)]
pub struct ChunkReader<R, N> {
    input: R,
    next: N,
    /// Bytes left in the current chunk.
    remaining: u64,
    last: bool,
    received: u64,
    max_bytes: u64,
    done: bool,
}

impl<R, N> ChunkReader<R, N>
where
    R: AsyncRead + Unpin + Send,
    N: NextCommand<R> + Send,
{
    /// Creates a reader for a transfer whose first `BDAT` announced
    /// `size` bytes. `max_bytes` of 0 means no limit.
    pub const fn new(input: R, next: N, size: u64, last: bool, max_bytes: u64) -> Self {
        Self {
            input,
            next,
            remaining: size,
            last,
            received: 0,
            max_bytes,
            done: size == 0 && last,
        }
    }

    /// Returns the number of body bytes received so far.
    #[must_use]
    pub const fn received(&self) -> u64 {
        self.received
    }

    /// Reads body bytes into `buf`. Returns 0 after the `LAST` chunk.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.done {
                return Ok(0);
            }
            if self.max_bytes != 0 && self.received + self.remaining > self.max_bytes {
                return Err(Status::new(
                    552,
                    EnhancedCode::new(5, 3, 4),
                    "Max message size exceeded",
                )
                .into());
            }

            if self.remaining > 0 {
                let want = usize::try_from(self.remaining)
                    .unwrap_or(usize::MAX)
                    .min(buf.len());
                let n = self.input.read(&mut buf[..want]).await?;
                if n == 0 {
                    return Err(Error::ConnectionLost);
                }
                self.remaining -= n as u64;
                self.received += n as u64;
                return Ok(n);
            }

            if self.last {
                self.done = true;
                return Ok(0);
            }

            let (cmd, arg) = match self.next.next_command(&mut self.input).await {
                Ok(next) => next,
                Err(err) if err.is_eof() || matches!(err, Error::ConnectionLost) => {
                    return Err(Error::ConnectionLost);
                }
                Err(err) => return Err(err),
            };
            match cmd.as_str() {
                "RSET" => return Err(Error::Reset),
                "QUIT" => return Err(Error::Quit),
                "BDAT" => {
                    let (size, last) = parse_bdat_args(&arg)?;
                    self.remaining = size;
                    self.last = last;
                }
                _ => return Err(bdat_syntax("BDAT command expected")),
            }
        }
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
        self.max_bytes = 0;
        let mut buf = [0u8; DRAIN_BUFFER_SIZE];
        while self.read(&mut buf).await? > 0 {}
        Ok(())
    }

    /// Returns a mutable reference to the source.
    pub const fn get_mut(&mut self) -> &mut R {
        &mut self.input
    }

    /// Returns a mutable reference to the command strategy.
    pub const fn commands_mut(&mut self) -> &mut N {
        &mut self.next
    }
}

/// Transport for outgoing chunks.
pub trait ChunkSink {
    /// Queues bytes for the peer.
    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Flushes queued bytes.
    fn flush(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Waits for the peer to accept a non-final chunk.
    fn acknowledge(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Splits a body into `BDAT` chunks.
///
/// With a known total size the final chunk carries `LAST` itself; otherwise
/// [`close`](Self::close) sends an empty `BDAT 0 LAST`.
#[derive(Debug)]
pub struct ChunkWriter<S> {
    sink: S,
    max_chunk_size: usize,
    remaining: Option<u64>,
    chunk_left: u64,
    chunk_last: bool,
    header: BytesMut,
}

impl<S> ChunkWriter<S>
where
    S: ChunkSink,
{
    /// Creates a writer. `max_chunk_size` of 0 means one chunk per write
    /// (or one chunk in total when `size` is known). `size` of 0 means the
    /// total is unknown.
    pub fn new(sink: S, max_chunk_size: usize, size: u64) -> Self {
        Self {
            sink,
            max_chunk_size,
            remaining: (size > 0).then_some(size),
            chunk_left: 0,
            chunk_last: false,
            header: BytesMut::with_capacity(32),
        }
    }

    async fn open_chunk(&mut self, size: u64, last: bool) -> Result<()> {
        self.header.clear();
        self.header.put_slice(format!("BDAT {size}").as_bytes());
        if last {
            self.header.put_slice(b" LAST");
        }
        self.header.put_slice(b"\r\n");
        self.sink.send(&self.header).await
    }

    async fn finish_chunk(&mut self, last: bool) -> Result<()> {
        self.sink.flush().await?;
        if last {
            return Ok(());
        }
        self.sink.acknowledge().await
    }

    /// Writes body bytes.
    ///
    /// Fails before sending anything if `data` would exceed the declared
    /// total size.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let Some(mut remaining) = self.remaining else {
            let piece_size = if self.max_chunk_size == 0 {
                data.len()
            } else {
                self.max_chunk_size
            };
            for piece in data.chunks(piece_size) {
                self.open_chunk(piece.len() as u64, false).await?;
                self.sink.send(piece).await?;
                self.finish_chunk(false).await?;
            }
            return Ok(());
        };

        if data.len() as u64 > remaining {
            return Err(Error::InvalidInput(
                "got more bytes than expected, check length".to_string(),
            ));
        }

        while !data.is_empty() {
            if self.chunk_left == 0 {
                let size = if self.max_chunk_size == 0 {
                    remaining
                } else {
                    remaining.min(self.max_chunk_size as u64)
                };
                let last = size == remaining;
                self.open_chunk(size, last).await?;
                self.chunk_left = size;
                self.chunk_last = last;
            }

            let n = usize::try_from(self.chunk_left)
                .unwrap_or(usize::MAX)
                .min(data.len());
            self.sink.send(&data[..n]).await?;
            data = &data[n..];
            self.chunk_left -= n as u64;
            remaining -= n as u64;
            self.remaining = Some(remaining);

            if self.chunk_left == 0 {
                self.finish_chunk(self.chunk_last).await?;
            }
        }
        Ok(())
    }

    /// Ends the body.
    ///
    /// With a known size this only checks that every declared byte was
    /// written; the final reply is read by the caller.
    pub async fn close(&mut self) -> Result<()> {
        match self.remaining {
            Some(0) => Ok(()),
            Some(_) => Err(Error::InvalidInput(
                "got less bytes than expected, check length".to_string(),
            )),
            None => {
                self.sink.send(b"BDAT 0 LAST\r\n").await?;
                self.sink.flush().await
            }
        }
    }

    /// Returns the sink.
    pub fn into_inner(self) -> S {
        self.sink
    }
}

/// [`ChunkWriter`] that collects small writes into a fixed-size buffer.
///
/// When the total size is unknown, whatever is buffered at close goes out
/// as the `LAST` chunk, saving the trailing `BDAT 0 LAST`.
#[derive(Debug)]
pub struct BufferedChunkWriter<S> {
    inner: ChunkWriter<S>,
    buffer: BytesMut,
    capacity: usize,
}

impl<S> BufferedChunkWriter<S>
where
    S: ChunkSink,
{
    /// Creates a buffered writer with a scratch buffer of `capacity` bytes.
    pub fn new(sink: S, max_chunk_size: usize, size: u64, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: ChunkWriter::new(sink, max_chunk_size, size),
            buffer: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    async fn flush_buffer(&mut self) -> Result<()> {
        let buffered = self.buffer.split();
        self.inner.write(&buffered).await?;
        self.buffer = buffered;
        self.buffer.clear();
        Ok(())
    }

    /// Buffers body bytes, sending full buffers as chunks.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let available = self.capacity - self.buffer.len();
            if available == 0 {
                self.flush_buffer().await?;
                continue;
            }
            if data.len() > available && self.buffer.is_empty() {
                return self.inner.write(data).await;
            }
            let n = available.min(data.len());
            self.buffer.put_slice(&data[..n]);
            data = &data[n..];
        }
        Ok(())
    }

    /// Sends the buffered tail and ends the body.
    pub async fn close(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            if self.inner.remaining.is_none() {
                self.inner.remaining = Some(self.buffer.len() as u64);
            }
            self.flush_buffer().await?;
        }
        self.inner.close().await
    }

    /// Returns the sink.
    pub fn into_inner(self) -> S {
        self.inner.into_inner()
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
    use std::collections::VecDeque;
    use tokio::io::{AsyncBufReadExt, BufReader};

    /// Replays lines from the shared input, recording every acknowledgement.
    #[derive(Default)]
    struct LineCommands {
        acks: usize,
    }

    impl NextCommand<BufReader<&'static [u8]>> for LineCommands {
        async fn next_command(
            &mut self,
            input: &mut BufReader<&'static [u8]>,
        ) -> Result<(String, String)> {
            self.acks += 1;
            let mut line = String::new();
            if input.read_line(&mut line).await? == 0 {
                return Err(Error::ConnectionLost);
            }
            crate::parser::parse_command(&line)
        }
    }

    fn reader(
        first: &str,
        wire: &'static [u8],
        max: u64,
    ) -> ChunkReader<BufReader<&'static [u8]>, LineCommands> {
        let (size, last) = parse_bdat_args(first).unwrap();
        ChunkReader::new(BufReader::new(wire), LineCommands::default(), size, last, max)
    }

    /// Records chunk traffic; `acks` scripts the peer's answers.
    #[derive(Default)]
    struct RecordingSink {
        wire: Vec<u8>,
        flushes: usize,
        acks: usize,
        refuse_after: Option<usize>,
    }

    impl ChunkSink for &mut RecordingSink {
        async fn send(&mut self, data: &[u8]) -> Result<()> {
            self.wire.extend_from_slice(data);
            Ok(())
        }

        async fn flush(&mut self) -> Result<()> {
            self.flushes += 1;
            Ok(())
        }

        async fn acknowledge(&mut self) -> Result<()> {
            self.acks += 1;
            if self.refuse_after.is_some_and(|limit| self.acks > limit) {
                return Err(Status::new(554, EnhancedCode::new(5, 6, 0), "refused").into());
            }
            Ok(())
        }
    }

    /// Splits recorded traffic back into `(size, last, payload)` chunks.
    fn split_chunks(mut wire: &[u8]) -> Vec<(usize, bool, Vec<u8>)> {
        let mut chunks = Vec::new();
        while !wire.is_empty() {
            let eol = wire.windows(2).position(|w| w == b"\r\n").unwrap();
            let header = std::str::from_utf8(&wire[..eol]).unwrap();
            let arg = header.strip_prefix("BDAT ").unwrap();
            let (size, last) = parse_bdat_args(arg).unwrap();
            let size = size as usize;
            let body = &wire[eol + 2..eol + 2 + size];
            chunks.push((size, last, body.to_vec()));
            wire = &wire[eol + 2 + size..];
        }
        chunks
    }

    mod args {
        use super::*;

        #[test]
        fn test_parse_bdat_args() {
            assert_eq!(parse_bdat_args("100").unwrap(), (100, false));
            assert_eq!(parse_bdat_args("100 last").unwrap(), (100, true));
            assert_eq!(parse_bdat_args("0 LAST").unwrap(), (0, true));
        }

        #[test]
        fn test_parse_bdat_args_errors() {
            let message = |arg: &str| match parse_bdat_args(arg).unwrap_err() {
                Error::Status(status) => {
                    assert_eq!(status.code.as_u16(), 501);
                    assert_eq!(status.enhanced, EnhancedCode::new(5, 5, 4));
                    status.message.into_owned()
                }
                other => panic!("unexpected {other:?}"),
            };
            assert_eq!(message(""), "Missing chunk size argument");
            assert_eq!(message("1 LAST x"), "Too many arguments");
            assert_eq!(message("1 FIRST"), "Unknown BDAT argument");
            assert_eq!(message("abc"), "Malformed size argument");
            assert_eq!(message("-1"), "Malformed size argument");
            assert_eq!(message("+1"), "Malformed size argument");
            assert_eq!(message("0"), "Malformed size argument");
            assert_eq!(message("4294967296"), "Malformed size argument");
        }
    }

    mod reader {
        use super::*;

        #[tokio::test]
        async fn test_single_last_chunk() {
            let mut r = reader("5 LAST", b"helloQUIT\r\n", 0);
            let mut out = Vec::new();
            r.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, b"hello");
            assert_eq!(r.next.acks, 0);
        }

        #[tokio::test]
        async fn test_multiple_chunks() {
            let mut r = reader("3", b"abcBDAT 2\r\ndeBDAT 1 LAST\r\nf", 0);
            let mut out = Vec::new();
            r.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, b"abcdef");
            assert_eq!(r.next.acks, 2);
            assert_eq!(r.received(), 6);
        }

        #[tokio::test]
        async fn test_empty_last_chunk() {
            let mut r = reader("3", b"abcBDAT 0 LAST\r\n", 0);
            let mut out = Vec::new();
            r.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, b"abc");
        }

        #[tokio::test]
        async fn test_commands_inside_chunk_are_data() {
            let body: &'static [u8] = b"x\r\nRSET\r\nQUIT\r\n";
            let mut r = reader("15 LAST", body, 0);
            let mut out = Vec::new();
            r.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, body);
        }

        #[tokio::test]
        async fn test_dot_line_is_data() {
            let mut r = reader("7 LAST", b"a\r\n.\r\nb", 0);
            let mut out = Vec::new();
            r.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, b"a\r\n.\r\nb");
        }

        #[tokio::test]
        async fn test_rset_and_quit_sentinels() {
            let mut r = reader("1", b"aRSET\r\n", 0);
            let mut out = Vec::new();
            assert!(matches!(r.read_to_end(&mut out).await, Err(Error::Reset)));

            let mut r = reader("1", b"aquit\r\n", 0);
            assert!(matches!(r.read_to_end(&mut out).await, Err(Error::Quit)));
        }

        #[tokio::test]
        async fn test_unexpected_command() {
            let mut r = reader("1", b"aNOOP\r\n", 0);
            let mut out = Vec::new();
            let err = r.read_to_end(&mut out).await.unwrap_err();
            assert_eq!(err.status().unwrap().code.as_u16(), 501);
            assert_eq!(err.status().unwrap().message, "BDAT command expected");
        }

        #[tokio::test]
        async fn test_bad_follow_up_size() {
            let mut r = reader("1", b"aBDAT x\r\n", 0);
            let mut out = Vec::new();
            let err = r.read_to_end(&mut out).await.unwrap_err();
            assert_eq!(err.status().unwrap().message, "Malformed size argument");
        }

        #[tokio::test]
        async fn test_connection_lost() {
            let mut r = reader("10", b"short", 0);
            let mut out = Vec::new();
            assert!(matches!(
                r.read_to_end(&mut out).await,
                Err(Error::ConnectionLost)
            ));

            let mut r = reader("2", b"ab", 0);
            assert!(matches!(
                r.read_to_end(&mut out).await,
                Err(Error::ConnectionLost)
            ));
        }

        #[tokio::test]
        async fn test_quota_checked_per_chunk() {
            let mut r = reader("4", b"abcdBDAT 4 LAST\r\nefgh", 6);
            let mut out = Vec::new();
            let err = r.read_to_end(&mut out).await.unwrap_err();
            assert_eq!(err.status().unwrap().code.as_u16(), 552);
            assert_eq!(out, b"abcd");
        }

        #[tokio::test]
        async fn test_quota_exactly_met() {
            let mut r = reader("4", b"abcdBDAT 2 LAST\r\nef", 6);
            let mut out = Vec::new();
            r.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, b"abcdef");
        }

        #[tokio::test]
        async fn test_drain_consumes_current_chunk() {
            let mut r = reader("8 LAST", b"12345678NOOP\r\n", 4);
            let mut out = Vec::new();
            assert!(r.read_to_end(&mut out).await.is_err());
            r.drain().await.unwrap();
            let mut rest = String::new();
            r.get_mut().read_line(&mut rest).await.unwrap();
            assert_eq!(rest, "NOOP\r\n");
        }
    }

    mod writer {
        use super::*;

        #[tokio::test]
        async fn test_unknown_size_splits_and_ends_with_empty_last() {
            let mut sink = RecordingSink::default();
            let mut w = ChunkWriter::new(&mut sink, 4, 0);
            w.write(b"0123456789").await.unwrap();
            w.close().await.unwrap();
            assert_eq!(
                sink.wire,
                b"BDAT 4\r\n0123BDAT 4\r\n4567BDAT 2\r\n89BDAT 0 LAST\r\n"
            );
            assert_eq!(sink.acks, 3);
            assert_eq!(sink.flushes, 4);
        }

        #[tokio::test]
        async fn test_unknown_size_unlimited_chunk() {
            let mut sink = RecordingSink::default();
            let mut w = ChunkWriter::new(&mut sink, 0, 0);
            w.write(b"abc").await.unwrap();
            w.write(b"").await.unwrap();
            w.write(b"de").await.unwrap();
            w.close().await.unwrap();
            assert_eq!(sink.wire, b"BDAT 3\r\nabcBDAT 2\r\ndeBDAT 0 LAST\r\n");
        }

        #[tokio::test]
        async fn test_known_size_marks_last_chunk() {
            let mut sink = RecordingSink::default();
            let mut w = ChunkWriter::new(&mut sink, 4, 10);
            w.write(b"01").await.unwrap();
            w.write(b"2345678").await.unwrap();
            w.write(b"9").await.unwrap();
            w.close().await.unwrap();
            assert_eq!(
                sink.wire,
                b"BDAT 4\r\n0123BDAT 4\r\n4567BDAT 2 LAST\r\n89"
            );
            assert_eq!(sink.acks, 2);
        }

        #[tokio::test]
        async fn test_known_size_single_chunk() {
            let mut sink = RecordingSink::default();
            let mut w = ChunkWriter::new(&mut sink, 0, 5);
            w.write(b"hel").await.unwrap();
            w.write(b"lo").await.unwrap();
            w.close().await.unwrap();
            assert_eq!(sink.wire, b"BDAT 5 LAST\r\nhello");
            assert_eq!(sink.acks, 0);
            assert_eq!(sink.flushes, 1);
        }

        #[tokio::test]
        async fn test_more_bytes_than_declared() {
            let mut sink = RecordingSink::default();
            let mut w = ChunkWriter::new(&mut sink, 0, 3);
            w.write(b"ab").await.unwrap();
            let err = w.write(b"cd").await.unwrap_err();
            assert!(err.to_string().contains("more bytes"));
            drop(w);
            assert_eq!(sink.wire, b"BDAT 3 LAST\r\nab");
        }

        #[tokio::test]
        async fn test_less_bytes_than_declared() {
            let mut sink = RecordingSink::default();
            let mut w = ChunkWriter::new(&mut sink, 0, 3);
            w.write(b"ab").await.unwrap();
            let err = w.close().await.unwrap_err();
            assert!(err.to_string().contains("less bytes"));
        }

        #[tokio::test]
        async fn test_refused_chunk_stops_writer() {
            let mut sink = RecordingSink {
                refuse_after: Some(1),
                ..RecordingSink::default()
            };
            let mut w = ChunkWriter::new(&mut sink, 2, 0);
            let err = w.write(b"abcdef").await.unwrap_err();
            assert_eq!(err.status().unwrap().code.as_u16(), 554);
            drop(w);
            assert_eq!(sink.wire, b"BDAT 2\r\nabBDAT 2\r\ncd");
        }
    }

    mod buffered {
        use super::*;

        #[tokio::test]
        async fn test_small_writes_coalesce_into_last() {
            let mut sink = RecordingSink::default();
            let mut w = BufferedChunkWriter::new(&mut sink, 8, 0, 8);
            for piece in [&b"ab"[..], b"cd", b"ef"] {
                w.write(piece).await.unwrap();
            }
            w.close().await.unwrap();
            assert_eq!(sink.wire, b"BDAT 6 LAST\r\nabcdef");
            assert_eq!(sink.acks, 0);
        }

        #[tokio::test]
        async fn test_full_buffer_flushes() {
            let mut sink = RecordingSink::default();
            let mut w = BufferedChunkWriter::new(&mut sink, 4, 0, 4);
            w.write(b"abc").await.unwrap();
            w.write(b"def").await.unwrap();
            w.close().await.unwrap();
            assert_eq!(sink.wire, b"BDAT 4\r\nabcdBDAT 2 LAST\r\nef");
            assert_eq!(sink.acks, 1);
        }

        #[tokio::test]
        async fn test_large_write_passes_through() {
            let mut sink = RecordingSink::default();
            let mut w = BufferedChunkWriter::new(&mut sink, 4, 0, 4);
            w.write(b"0123456789").await.unwrap();
            w.close().await.unwrap();
            assert_eq!(
                sink.wire,
                b"BDAT 4\r\n0123BDAT 4\r\n4567BDAT 2\r\n89BDAT 0 LAST\r\n"
            );
        }

        #[tokio::test]
        async fn test_empty_body() {
            let mut sink = RecordingSink::default();
            let mut w = BufferedChunkWriter::new(&mut sink, 4, 0, 4);
            w.close().await.unwrap();
            assert_eq!(sink.wire, b"BDAT 0 LAST\r\n");
        }

        #[tokio::test]
        async fn test_known_size() {
            let mut sink = RecordingSink::default();
            let mut w = BufferedChunkWriter::new(&mut sink, 4, 6, 4);
            w.write(b"abc").await.unwrap();
            w.write(b"def").await.unwrap();
            w.close().await.unwrap();
            assert_eq!(sink.wire, b"BDAT 4\r\nabcdBDAT 2 LAST\r\nef");
        }
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    proptest! {
        #[test]
        fn chunks_reassemble(
            body in proptest::collection::vec(any::<u8>(), 0..512),
            max in 1usize..64,
            known in any::<bool>(),
            buffered in any::<bool>(),
            splits in proptest::collection::vec(1usize..50, 1..8),
        ) {
            let mut sink = RecordingSink::default();
            let size = if known { body.len() as u64 } else { 0 };
            block_on(async {
                let mut pieces: VecDeque<&[u8]> = VecDeque::new();
                let mut rest = &body[..];
                for split in splits.iter().cycle() {
                    if rest.is_empty() {
                        break;
                    }
                    let n = (*split).min(rest.len());
                    pieces.push_back(&rest[..n]);
                    rest = &rest[n..];
                }
                if buffered {
                    let mut w = BufferedChunkWriter::new(&mut sink, max, size, max);
                    for piece in pieces {
                        w.write(piece).await.unwrap();
                    }
                    w.close().await.unwrap();
                } else {
                    let mut w = ChunkWriter::new(&mut sink, max, size);
                    for piece in pieces {
                        w.write(piece).await.unwrap();
                    }
                    w.close().await.unwrap();
                }
            });

            let chunks = split_chunks(&sink.wire);
            let joined: Vec<u8> = chunks.iter().flat_map(|c| c.2.clone()).collect();
            prop_assert_eq!(joined, body);
            prop_assert_eq!(chunks.iter().filter(|c| c.1).count(), 1);
            prop_assert!(chunks.last().unwrap().1);
            prop_assert!(chunks.iter().all(|c| c.0 <= max));
        }
    }
}
