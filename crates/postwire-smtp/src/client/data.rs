//! Outgoing message body.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::codec::{BufferedChunkWriter, ChunkSink, ChunkWriter, DotWriter};
use crate::connection::{SmtpStream, TextConn, with_deadline};
use crate::types::Reply;
use crate::{Error, Result};

type Wire<'a> = &'a mut TextConn<SmtpStream>;

/// Sends `BDAT` chunks and waits for the `250` after each non-final one.
#[derive(Debug)]
pub(crate) struct ChunkConn<'a> {
    text: Wire<'a>,
    timeout: Option<Duration>,
}

impl<'a> ChunkConn<'a> {
    pub(crate) const fn new(text: Wire<'a>, timeout: Option<Duration>) -> Self {
        Self { text, timeout }
    }
}

impl ChunkSink for ChunkConn<'_> {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.text.write_all(data).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.text.flush().await?;
        Ok(())
    }

    async fn acknowledge(&mut self) -> Result<()> {
        let reply = with_deadline(self.timeout, self.text.read_response(250))
            .await
            .map_err(Error::into_status_error)?;
        debug!(code = reply.code.as_u16(), "chunk accepted");
        Ok(())
    }
}

#[derive(Debug)]
enum Writer<'a> {
    Dot(DotWriter<Wire<'a>>),
    Chunk(ChunkWriter<ChunkConn<'a>>),
    Buffered(BufferedChunkWriter<ChunkConn<'a>>),
}

/// Held in the client's error slot while a body is open, so a writer that
/// is dropped before [`MessageWriter::close`] leaves the client unusable.
fn unfinished() -> Error {
    Error::InvalidState("message body was not completed".to_string())
}

/// Writer for a message body, returned by
/// [`Client::content`](super::Client::content).
///
/// Call [`close`](Self::close) to end the body and read the server's
/// verdict. A writer dropped without closing, or one that failed mid-body
/// without a server reply, leaves the connection out of step; the client
/// then refuses every operation until it is closed.
#[derive(Debug)]
pub struct MessageWriter<'a> {
    writer: Writer<'a>,
    /// The client's sticky error.
    failed: &'a mut Option<Error>,
    /// First error seen; later calls return it without I/O.
    error: Option<Error>,
    write_timeout: Option<Duration>,
    submission_timeout: Option<Duration>,
}

impl<'a> MessageWriter<'a> {
    fn new(
        writer: Writer<'a>,
        failed: &'a mut Option<Error>,
        write_timeout: Option<Duration>,
        submission_timeout: Option<Duration>,
    ) -> Self {
        *failed = Some(unfinished());
        Self {
            writer,
            failed,
            error: None,
            write_timeout,
            submission_timeout,
        }
    }

    /// Body sent after `DATA` was accepted with `354`.
    pub(crate) fn dot(
        text: Wire<'a>,
        failed: &'a mut Option<Error>,
        write_timeout: Option<Duration>,
        submission_timeout: Option<Duration>,
    ) -> Self {
        let writer = Writer::Dot(DotWriter::new(text));
        Self::new(writer, failed, write_timeout, submission_timeout)
    }

    /// Body sent as `BDAT` chunks of at most `max_chunk_size` bytes.
    ///
    /// A `buffer` capacity collects small writes before they become
    /// chunks.
    pub(crate) fn chunked(
        text: Wire<'a>,
        failed: &'a mut Option<Error>,
        max_chunk_size: usize,
        size: u64,
        buffer: Option<usize>,
        write_timeout: Option<Duration>,
        submission_timeout: Option<Duration>,
    ) -> Self {
        let sink = ChunkConn::new(text, write_timeout);
        let writer = match buffer {
            Some(capacity) => {
                Writer::Buffered(BufferedChunkWriter::new(sink, max_chunk_size, size, capacity))
            }
            None => Writer::Chunk(ChunkWriter::new(sink, max_chunk_size, size)),
        };
        Self::new(writer, failed, write_timeout, submission_timeout)
    }

    /// Returns true if the body goes out as `BDAT` chunks.
    #[must_use]
    pub const fn is_chunked(&self) -> bool {
        !matches!(self.writer, Writer::Dot(_))
    }

    /// Records the outcome of a failed step in the client.
    ///
    /// A server reply ends the transaction with both sides in step, so the
    /// client stays usable. A connection-fatal error becomes the client's
    /// sticky error. Anything else leaves the body unfinished.
    fn settle(failed: &mut Option<Error>, err: &Error) {
        if matches!(err, Error::Status(_)) {
            *failed = None;
        } else if err.is_connection_fatal() {
            *failed = Some(err.clone());
        }
    }

    /// Writes body bytes.
    ///
    /// Line endings are normalized to CRLF for `DATA`; `BDAT` sends the
    /// bytes unchanged.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, on a rejected chunk, and when writing past a
    /// size declared to [`Client::content`](super::Client::content). After
    /// a failure every call returns the same error.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let deadline = self.write_timeout;
        let result = match &mut self.writer {
            Writer::Dot(writer) => with_deadline(deadline, writer.write(data)).await,
            Writer::Chunk(writer) => with_deadline(deadline, writer.write(data)).await,
            Writer::Buffered(writer) => with_deadline(deadline, writer.write(data)).await,
        };
        if let Err(err) = &result {
            Self::settle(self.failed, err);
            self.error = Some(err.clone());
        }
        result
    }

    /// Ends the body and returns the server's final reply, which usually
    /// carries the queue id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Status`] when the server refuses the message, and
    /// [`Error::InvalidInput`] when fewer bytes were written than declared.
    pub async fn close(self) -> Result<Reply> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let failed = self.failed;
        let result = Self::finish(self.writer, self.write_timeout, self.submission_timeout).await;
        match &result {
            Ok(reply) => {
                *failed = None;
                debug!(code = reply.code.as_u16(), "message accepted: {}", reply.text());
            }
            Err(err) => Self::settle(failed, err),
        }
        result
    }

    async fn finish(
        writer: Writer<'a>,
        write_timeout: Option<Duration>,
        submission_timeout: Option<Duration>,
    ) -> Result<Reply> {
        let text = match writer {
            Writer::Dot(mut writer) => {
                with_deadline(write_timeout, writer.close()).await?;
                writer.into_inner()
            }
            Writer::Chunk(mut writer) => {
                with_deadline(write_timeout, writer.close()).await?;
                writer.into_inner().text
            }
            Writer::Buffered(mut writer) => {
                with_deadline(write_timeout, writer.close()).await?;
                writer.into_inner().text
            }
        };

        with_deadline(submission_timeout, text.read_response(250))
            .await
            .map_err(Error::into_status_error)
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
    async fn test_dot_body() {
        let mock = Builder::new()
            .write(b"Subject: hi\r\n\r\n..leading dot\r\n")
            .write(b".\r\n")
            .read(b"250 2.0.0 OK: queued as ABC\r\n")
            .build();
        let mut conn = text(mock);
        let mut failed = None;
        let mut writer = MessageWriter::dot(&mut conn, &mut failed, None, None);
        assert!(!writer.is_chunked());
        writer
            .write(b"Subject: hi\n\n.leading dot\n")
            .await
            .unwrap();
        let reply = writer.close().await.unwrap();
        assert_eq!(reply.text(), "2.0.0 OK: queued as ABC");
        assert!(failed.is_none());
    }

    #[tokio::test]
    async fn test_known_size_single_chunk() {
        let mock = Builder::new()
            .write(b"BDAT 5 LAST\r\n")
            .write(b"hello")
            .read(b"250 2.0.0 OK: queued\r\n")
            .build();
        let mut conn = text(mock);
        let mut failed = None;
        let mut writer = MessageWriter::chunked(&mut conn, &mut failed, 0, 5, None, None, None);
        assert!(writer.is_chunked());
        writer.write(b"hello").await.unwrap();
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_chunks_wait_for_acknowledgement() {
        let mock = Builder::new()
            .write(b"BDAT 3\r\n")
            .write(b"abc")
            .read(b"250 2.0.0 Continue\r\n")
            .write(b"BDAT 2 LAST\r\n")
            .write(b"de")
            .read(b"250 2.0.0 OK: queued\r\n")
            .build();
        let mut conn = text(mock);
        let mut failed = None;
        let mut writer = MessageWriter::chunked(&mut conn, &mut failed, 3, 5, None, None, None);
        writer.write(b"abcde").await.unwrap();
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_buffered_body_ends_with_last_chunk() {
        let mock = Builder::new()
            .write(b"BDAT 11 LAST\r\n")
            .write(b"hello world")
            .read(b"250 2.0.0 OK: queued\r\n")
            .build();
        let mut conn = text(mock);
        let mut failed = None;
        let mut writer = MessageWriter::chunked(&mut conn, &mut failed, 0, 0, Some(64), None, None);
        writer.write(b"hello").await.unwrap();
        writer.write(b" world").await.unwrap();
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_chunk() {
        let mock = Builder::new()
            .write(b"BDAT 3\r\n")
            .write(b"abc")
            .read(b"552 5.3.4 Maximum message size exceeded\r\n")
            .build();
        let mut conn = text(mock);
        let mut failed = None;
        let mut writer = MessageWriter::chunked(&mut conn, &mut failed, 3, 6, None, None, None);
        let err = writer.write(b"abcdef").await.unwrap_err();
        let status = err.status().unwrap();
        assert_eq!(status.code.as_u16(), 552);

        // The refusal sticks to the writer but the connection is in step.
        let again = writer.write(b"x").await.unwrap_err();
        assert_eq!(again.status().unwrap().code.as_u16(), 552);
        drop(writer);
        assert!(failed.is_none());
    }

    #[tokio::test]
    async fn test_short_body_is_an_error() {
        let mock = Builder::new()
            .write(b"BDAT 10 LAST\r\n")
            .write(b"abc")
            .build();
        let mut conn = text(mock);
        let mut failed = None;
        let mut writer = MessageWriter::chunked(&mut conn, &mut failed, 0, 10, None, None, None);
        writer.write(b"abc").await.unwrap();
        let err = writer.close().await.unwrap_err();
        assert!(err.to_string().contains("less bytes"));
        assert!(matches!(failed, Some(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_refused_message() {
        let mock = Builder::new()
            .write(b"x\r\n.\r\n")
            .read(b"554 5.6.0 Message rejected\r\n")
            .build();
        let mut conn = text(mock);
        let mut failed = None;
        let mut writer = MessageWriter::dot(&mut conn, &mut failed, None, None);
        writer.write(b"x").await.unwrap();
        let err = writer.close().await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(err.status().unwrap().message, "Message rejected");
        assert!(failed.is_none());
    }

    #[tokio::test]
    async fn test_dropped_writer_marks_body_unfinished() {
        let mock = Builder::new().write(b"partial\r\n").build();
        let mut conn = text(mock);
        let mut failed = None;
        let mut writer = MessageWriter::dot(&mut conn, &mut failed, None, None);
        writer.write(b"partial\n").await.unwrap();
        drop(writer);
        assert!(matches!(failed, Some(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_late_final_reply_is_fatal() {
        let mock = Builder::new()
            .write(b"x\r\n.\r\n")
            .wait(Duration::from_millis(200))
            .build();
        let mut conn = text(mock);
        let mut failed = None;
        let timeout = Duration::from_millis(50);
        let mut writer = MessageWriter::dot(&mut conn, &mut failed, None, Some(timeout));
        writer.write(b"x\r\n").await.unwrap();
        let err = writer.close().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(matches!(failed, Some(Error::Timeout(_))));
    }
}
