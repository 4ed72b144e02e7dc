//! Line framing for the SMTP text protocol.
//!
//! SMTP is CRLF-terminated lines in both directions, interrupted by
//! message bodies that the codecs read straight from the same buffer.
//! [`TextConn`] therefore implements the async I/O traits itself, so a
//! body codec can borrow it without losing buffered bytes.

#![allow(clippy::missing_errors_doc)]

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{BufMut, BytesMut};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
};

use crate::parser::parse_reply_line;
use crate::types::{Reply, ReplyCode, Status};
use crate::{Error, Result};

/// Default buffer size for reading.
const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Handle for a command awaiting its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

/// Framed text connection.
///
/// Reads CRLF lines with an optional length cap and keeps the order of
/// pipelined commands so replies are matched first in, first out.
pub struct TextConn<S> {
    stream: BufReader<S>,
    max_line_length: usize,
    line_too_long: bool,
    pipeline: VecDeque<RequestId>,
    next_id: u64,
    write_buffer: BytesMut,
}

impl<S> std::fmt::Debug for TextConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextConn")
            .field("max_line_length", &self.max_line_length)
            .field("line_too_long", &self.line_too_long)
            .field("pending", &self.pipeline.len())
            .finish_non_exhaustive()
    }
}

impl<S> TextConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a framed connection. A `max_line_length` of 0 means no limit.
    pub fn new(stream: S, max_line_length: usize) -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE, stream, max_line_length)
    }

    /// Creates a framed connection with a specific read buffer size.
    pub fn with_capacity(capacity: usize, stream: S, max_line_length: usize) -> Self {
        Self::with_buffer_sizes(capacity, DEFAULT_BUFFER_SIZE, stream, max_line_length)
    }

    /// Creates a framed connection with specific read and write buffer sizes.
    pub fn with_buffer_sizes(
        reader_size: usize,
        writer_size: usize,
        stream: S,
        max_line_length: usize,
    ) -> Self {
        Self {
            stream: BufReader::with_capacity(reader_size.max(1), stream),
            max_line_length,
            line_too_long: false,
            pipeline: VecDeque::new(),
            next_id: 0,
            write_buffer: BytesMut::with_capacity(writer_size),
        }
    }

    /// Reads one line without its terminator.
    ///
    /// Accepts `CRLF` or a bare `LF`. Invalid UTF-8 is replaced. A final
    /// line without terminator is returned as is.
    pub async fn read_line(&mut self) -> Result<String> {
        if self.line_too_long {
            return Err(Error::LineTooLong);
        }

        let mut line = Vec::new();
        loop {
            let buf = self.stream.fill_buf().await?;
            if buf.is_empty() {
                if line.is_empty() {
                    return Err(Error::Io(
                        io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed").into(),
                    ));
                }
                break;
            }

            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                line.extend_from_slice(&buf[..pos]);
                self.stream.consume(pos + 1);
                break;
            }

            let len = buf.len();
            line.extend_from_slice(buf);
            self.stream.consume(len);

            // One extra byte may be the CR of the terminator.
            if self.max_line_length > 0 && line.len() > self.max_line_length + 1 {
                self.line_too_long = true;
                return Err(Error::LineTooLong);
            }
        }

        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if self.max_line_length > 0 && line.len() > self.max_line_length {
            self.line_too_long = true;
            return Err(Error::LineTooLong);
        }

        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Writes one line followed by CRLF and flushes.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.write_buffer.clear();
        self.write_buffer.put_slice(line.as_bytes());
        self.write_buffer.put_slice(b"\r\n");
        self.flush_buffer().await
    }

    /// Writes every line of a status reply in one flush.
    pub async fn write_status(&mut self, status: &Status) -> Result<()> {
        self.write_buffer.clear();
        for line in status.to_lines() {
            self.write_buffer.put_slice(line.as_bytes());
            self.write_buffer.put_slice(b"\r\n");
        }
        self.flush_buffer().await
    }

    async fn flush_buffer(&mut self) -> Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(&self.write_buffer).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Sends a command line and queues it for a reply.
    pub async fn send_command(&mut self, line: &str) -> Result<RequestId> {
        self.write_line(line).await?;
        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.pipeline.push_back(id);
        Ok(id)
    }

    /// Reads the reply to a queued command.
    ///
    /// Replies arrive in command order, so `id` must be the oldest
    /// outstanding request.
    pub async fn read_response_for(&mut self, id: RequestId, expect: u16) -> Result<Reply> {
        if self.pipeline.front() != Some(&id) {
            return Err(Error::InvalidState(
                "reply requested out of pipeline order".to_string(),
            ));
        }
        self.pipeline.pop_front();
        self.read_response(expect).await
    }

    /// Sends a command and reads its reply.
    pub async fn cmd(&mut self, expect: u16, line: &str) -> Result<Reply> {
        let id = self.send_command(line).await?;
        self.read_response_for(id, expect).await
    }

    /// Reads a possibly multi-line reply and checks its code.
    ///
    /// See [`ReplyCode::matches`] for `expect`. A mismatch yields
    /// [`Error::SmtpError`] holding every line of the reply. Continuation
    /// lines that do not parse, or carry another code, are kept verbatim.
    pub async fn read_response(&mut self, expect: u16) -> Result<Reply> {
        let first = self.read_line().await?;
        let (code, mut continued, text) = parse_reply_line(&first)?;
        let mut lines = vec![text.to_string()];

        while continued {
            let line = self.read_line().await?;
            match parse_reply_line(&line) {
                Ok((next_code, more, text)) if next_code == code => {
                    lines.push(text.to_string());
                    continued = more;
                }
                _ => {
                    lines.push(line.trim_end_matches(['\r', '\n']).to_string());
                }
            }
        }

        let code = ReplyCode::new(code);
        if !code.matches(expect) {
            return Err(Error::smtp_error(code.as_u16(), lines.join("\n")));
        }
        Ok(Reply::new(code, lines))
    }

    /// Returns the number of commands awaiting replies.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pipeline.len()
    }

    /// Returns true if bytes were received but not consumed yet.
    #[must_use]
    pub fn has_buffered_input(&self) -> bool {
        !self.stream.buffer().is_empty()
    }

    /// Gets a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    /// Gets a mutable reference to the underlying stream.
    ///
    /// Bytes already buffered stay in the buffer.
    pub fn get_mut(&mut self) -> &mut S {
        self.stream.get_mut()
    }

    /// Consumes the connection and returns the inner stream.
    ///
    /// Any buffered input is lost.
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

impl<S> AsyncRead for TextConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl<S> AsyncBufRead for TextConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        Pin::new(&mut self.get_mut().stream).poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.get_mut().stream).consume(amt);
    }
}

impl<S> AsyncWrite for TextConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
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
    use crate::types::EnhancedCode;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_line_variants() {
        let mock = Builder::new()
            .read(b"EHLO a\r\nNOOP\nQU")
            .read(b"IT\r\ntail")
            .build();
        let mut conn = TextConn::new(mock, 0);
        assert_eq!(conn.read_line().await.unwrap(), "EHLO a");
        assert_eq!(conn.read_line().await.unwrap(), "NOOP");
        assert_eq!(conn.read_line().await.unwrap(), "QUIT");
        assert_eq!(conn.read_line().await.unwrap(), "tail");
        assert!(conn.read_line().await.unwrap_err().is_eof());
    }

    #[tokio::test]
    async fn test_line_too_long_is_sticky() {
        let mock = Builder::new().read(b"0123456789\r\nNOOP\r\n").build();
        let mut conn = TextConn::new(mock, 8);
        assert!(matches!(conn.read_line().await, Err(Error::LineTooLong)));
        assert!(matches!(conn.read_line().await, Err(Error::LineTooLong)));
    }

    #[tokio::test]
    async fn test_line_at_limit() {
        let mock = Builder::new().read(b"12345678\r\n").build();
        let mut conn = TextConn::new(mock, 8);
        assert_eq!(conn.read_line().await.unwrap(), "12345678");
    }

    #[tokio::test]
    async fn test_long_line_without_terminator() {
        let mock = Builder::new().read(b"0123456789").build();
        let mut conn = TextConn::new(mock, 8);
        assert!(matches!(conn.read_line().await, Err(Error::LineTooLong)));
    }

    #[tokio::test]
    async fn test_invalid_utf8_replaced() {
        let mock = Builder::new().read(b"MAIL \xff\r\n").build();
        let mut conn = TextConn::new(mock, 0);
        assert_eq!(conn.read_line().await.unwrap(), "MAIL \u{fffd}");
    }

    #[tokio::test]
    async fn test_multiline_response() {
        let mock = Builder::new()
            .read(b"250-mx.example.com\r\n250-PIPELINING\r\n250 SIZE 1000\r\n")
            .build();
        let mut conn = TextConn::new(mock, 0);
        let reply = conn.read_response(250).await.unwrap();
        assert_eq!(reply.code, ReplyCode::OK);
        assert_eq!(reply.lines, vec!["mx.example.com", "PIPELINING", "SIZE 1000"]);
    }

    #[tokio::test]
    async fn test_mismatch_carries_full_message() {
        let mock = Builder::new()
            .read(b"550-5.1.1 first\r\n550 5.1.1 second\r\n")
            .build();
        let mut conn = TextConn::new(mock, 0);
        let err = conn.read_response(25).await.unwrap_err();
        match err {
            Error::SmtpError { code, message } => {
                assert_eq!(code, 550);
                assert_eq!(message, "5.1.1 first\n5.1.1 second");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_foreign_continuation_kept() {
        let mock = Builder::new()
            .read(b"250-one\r\nbogus\r\n251-two\r\n250 three\r\n")
            .build();
        let mut conn = TextConn::new(mock, 0);
        let reply = conn.read_response(2).await.unwrap();
        assert_eq!(reply.lines, vec!["one", "bogus", "251-two", "three"]);
    }

    #[tokio::test]
    async fn test_malformed_first_line() {
        for wire in [&b"25\r\n"[..], b"250x\r\n", b"abc ok\r\n", b"099 low\r\n"] {
            let mock = Builder::new().read(wire).build();
            let mut conn = TextConn::new(mock, 0);
            assert!(matches!(
                conn.read_response(0).await,
                Err(Error::Protocol(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_pipeline_order() {
        let mock = Builder::new()
            .write(b"MAIL FROM:<a@b>\r\n")
            .write(b"RCPT TO:<c@d>\r\n")
            .read(b"250 ok\r\n250 ok\r\n")
            .build();
        let mut conn = TextConn::new(mock, 0);
        let mail = conn.send_command("MAIL FROM:<a@b>").await.unwrap();
        let rcpt = conn.send_command("RCPT TO:<c@d>").await.unwrap();
        assert_eq!(conn.pending(), 2);

        assert!(matches!(
            conn.read_response_for(rcpt, 250).await,
            Err(Error::InvalidState(_))
        ));
        conn.read_response_for(mail, 250).await.unwrap();
        conn.read_response_for(rcpt, 250).await.unwrap();
        assert_eq!(conn.pending(), 0);
    }

    #[tokio::test]
    async fn test_write_status_single_flush() {
        let status = Status::new(250, EnhancedCode::Omitted, "Hello x\nPIPELINING\nSIZE");
        let mock = Builder::new()
            .write(b"250-Hello x\r\n250-PIPELINING\r\n250 SIZE\r\n")
            .build();
        let mut conn = TextConn::new(mock, 0);
        conn.write_status(&status).await.unwrap();
    }

    #[tokio::test]
    async fn test_buffered_input_visible() {
        let mock = Builder::new().read(b"STARTTLS\r\nMAIL FROM:<x>\r\n").build();
        let mut conn = TextConn::new(mock, 0);
        assert_eq!(conn.read_line().await.unwrap(), "STARTTLS");
        assert!(conn.has_buffered_input());
        assert_eq!(conn.read_line().await.unwrap(), "MAIL FROM:<x>");
        assert!(!conn.has_buffered_input());
    }
}
