//! Message body handed to [`Session::data`](super::Session::data).

use std::mem;
use std::time::Duration;

use tracing::debug;

use crate::codec::{ChunkReader, DotReader, NextCommand};
use crate::connection::{SmtpStream, TextConn, with_deadline};
use crate::parser::parse_command;
use crate::types::{EnhancedCode, Status};
use crate::{Error, Result};

const READ_BUFFER_SIZE: usize = 4096;

type Wire<'a> = &'a mut TextConn<SmtpStream>;

/// Read and write deadlines applied to body I/O.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Timeouts {
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

/// Acknowledges every non-final chunk with `250 2.0.0 Continue` and reads
/// the command that follows.
#[derive(Debug)]
pub(crate) struct ContinueChunks {
    timeouts: Timeouts,
    /// Set after a failed chunk: no further chunk is acknowledged.
    closed: bool,
}

impl<'a> NextCommand<Wire<'a>> for ContinueChunks {
    async fn next_command(&mut self, input: &mut Wire<'a>) -> Result<(String, String)> {
        if self.closed {
            return Err(Error::ConnectionLost);
        }
        let text: &mut TextConn<SmtpStream> = input;
        let ack = Status::new(250, EnhancedCode::new(2, 0, 0), "Continue");
        with_deadline(self.timeouts.write, text.write_status(&ack)).await?;
        let line = with_deadline(self.timeouts.read, text.read_line()).await?;
        debug!(line = %line, "read");
        parse_command(&line)
    }
}

enum Source<'a> {
    /// `DATA` before the first read; `354` not sent yet.
    Pending(Wire<'a>),
    Dot(DotReader<Wire<'a>>),
    Chunk(ChunkReader<Wire<'a>, ContinueChunks>),
    /// Placeholder while switching from `Pending` to `Dot`.
    Taken,
}

/// Incoming message body.
///
/// Reads are bounded by the server's read timeout and its message size
/// limit; exceeding the limit fails with `552 5.3.4`. For `DATA` the
/// `354` go-ahead is sent on the first read.
pub struct Body<'a> {
    source: Source<'a>,
    timeouts: Timeouts,
    max_bytes: u64,
}

impl std::fmt::Debug for Body<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            Source::Pending(_) => "pending",
            Source::Dot(_) => "dot",
            Source::Chunk(_) => "chunk",
            Source::Taken => "taken",
        };
        f.debug_struct("Body")
            .field("source", &source)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

impl<'a> Body<'a> {
    /// Body of a `DATA` command.
    pub(crate) const fn data(text: Wire<'a>, timeouts: Timeouts, max_bytes: u64) -> Self {
        Self {
            source: Source::Pending(text),
            timeouts,
            max_bytes,
        }
    }

    /// Body of a `BDAT` transfer whose first chunk announced `size` bytes.
    pub(crate) const fn chunks(
        text: Wire<'a>,
        timeouts: Timeouts,
        size: u64,
        last: bool,
        max_bytes: u64,
    ) -> Self {
        let commands = ContinueChunks {
            timeouts,
            closed: false,
        };
        Self {
            source: Source::Chunk(ChunkReader::new(text, commands, size, last, max_bytes)),
            timeouts,
            max_bytes,
        }
    }

    /// Returns true if the body arrives in `BDAT` chunks.
    #[must_use]
    pub const fn is_chunked(&self) -> bool {
        matches!(self.source, Source::Chunk(_))
    }

    /// Reads body bytes into `buf`. Returns 0 at the end of the message.
    ///
    /// # Errors
    ///
    /// Fails with a `552` status past the size limit, with
    /// [`Error::ConnectionLost`] if the client goes away mid-body, with
    /// [`Error::Reset`] or [`Error::Quit`] if the client aborts a chunked
    /// transfer, and with [`Error::Timeout`] when a read stalls.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.start().await?;
        let deadline = self.timeouts.read;
        match &mut self.source {
            Source::Dot(reader) => with_deadline(deadline, reader.read(buf)).await,
            Source::Chunk(reader) => with_deadline(deadline, reader.read(buf)).await,
            Source::Pending(_) | Source::Taken => {
                Err(Error::InvalidState("body is no longer readable".to_string()))
            }
        }
    }

    /// Reads the rest of the body into `out`, returning the byte count.
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read).
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
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

    async fn start(&mut self) -> Result<()> {
        match mem::replace(&mut self.source, Source::Taken) {
            Source::Pending(text) => {
                let go_ahead = Status::new(
                    354,
                    EnhancedCode::Omitted,
                    "Go ahead. End your data with <CR><LF>.<CR><LF>",
                );
                with_deadline(self.timeouts.write, text.write_status(&go_ahead)).await?;
                self.source = Source::Dot(DotReader::new(text, self.max_bytes));
            }
            other => self.source = other,
        }
        Ok(())
    }

    /// Stops acknowledging chunks after a failed transfer.
    pub(crate) fn close_chunks(&mut self) {
        if let Source::Chunk(reader) = &mut self.source {
            reader.commands_mut().closed = true;
        }
    }

    /// Discards whatever the session left unread. A `DATA` body that was
    /// never started is left alone.
    ///
    /// The read deadline covers the whole drain.
    pub(crate) async fn finish(&mut self) -> Result<()> {
        let deadline = self.timeouts.read;
        match &mut self.source {
            Source::Dot(reader) if !reader.is_done() => {
                with_deadline(deadline, reader.drain()).await
            }
            Source::Chunk(reader) => with_deadline(deadline, reader.drain()).await,
            _ => Ok(()),
        }
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
    use tokio_test::io::Builder;

    fn text(mock: tokio_test::io::Mock) -> TextConn<SmtpStream> {
        TextConn::new(SmtpStream::plain(mock), 2000)
    }

    #[tokio::test]
    async fn test_data_sends_go_ahead_on_first_read() {
        let mock = Builder::new()
            .write(b"354 Go ahead. End your data with <CR><LF>.<CR><LF>\r\n")
            .read(b"Subject: hi\r\n\r\n..dot\r\n.\r\n")
            .build();
        let mut conn = text(mock);
        let mut body = Body::data(&mut conn, Timeouts::default(), 0);
        assert!(!body.is_chunked());

        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"Subject: hi\r\n\r\n.dot\r\n");
        body.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_unstarted_data_is_not_drained() {
        let mut conn = text(Builder::new().build());
        let mut body = Body::data(&mut conn, Timeouts::default(), 0);
        body.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_data_is_drained() {
        let mock = Builder::new()
            .write(b"354 Go ahead. End your data with <CR><LF>.<CR><LF>\r\n")
            .read(b"0123456789\r\n.\r\n")
            .build();
        let mut conn = text(mock);
        let mut body = Body::data(&mut conn, Timeouts::default(), 0);
        let mut buf = [0u8; 4];
        assert_eq!(body.read(&mut buf).await.unwrap(), 4);
        body.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_chunks_are_acknowledged() {
        let mock = Builder::new()
            .read(b"abc")
            .write(b"250 2.0.0 Continue\r\n")
            .read(b"BDAT 2 LAST\r\nde")
            .build();
        let mut conn = text(mock);
        let mut body = Body::chunks(&mut conn, Timeouts::default(), 3, false, 0);
        assert!(body.is_chunked());

        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcde");
    }

    #[tokio::test]
    async fn test_closed_chunks_stop_at_chunk_end() {
        let mock = Builder::new().read(b"abcdef").build();
        let mut conn = text(mock);
        let mut body = Body::chunks(&mut conn, Timeouts::default(), 6, false, 4);

        let mut buf = [0u8; 8];
        let err = body.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::Status(ref s) if s.code.as_u16() == 552));

        body.close_chunks();
        assert!(matches!(
            body.finish().await.unwrap_err(),
            Error::ConnectionLost
        ));
    }

    #[tokio::test]
    async fn test_quit_between_chunks() {
        let mock = Builder::new()
            .read(b"ab")
            .write(b"250 2.0.0 Continue\r\n")
            .read(b"QUIT\r\n")
            .build();
        let mut conn = text(mock);
        let mut body = Body::chunks(&mut conn, Timeouts::default(), 2, false, 0);
        let mut out = Vec::new();
        assert!(matches!(
            body.read_to_end(&mut out).await.unwrap_err(),
            Error::Quit
        ));
        assert_eq!(out, b"ab");
    }
}
