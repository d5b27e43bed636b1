//! Bounded in-process pipe between the pack producer and its reader.
//!
//! Chunks travel through a `tokio::sync::mpsc` channel. Dropping every
//! writer is a normal close; `close_with_error` queues an error that the
//! reader sees in place of end-of-stream.

use super::{Error, Result};
use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

type Message = Result<Bytes>;

/// Creates a pipe whose writer can run at most `capacity` chunks ahead of
/// the reader.
pub fn pipe(capacity: usize) -> Result<(PipeWriter, PipeReader)> {
    if capacity == 0 {
        return Err(Error::InvalidRequest(
            "pipe capacity must be at least 1".into(),
        ));
    }

    let (tx, rx) = mpsc::channel(capacity);
    let reader = PipeReader {
        rx,
        current: Bytes::new(),
        finished: false,
    };
    Ok((PipeWriter { tx }, reader))
}

#[derive(Debug, Clone)]
pub struct PipeWriter {
    tx: mpsc::Sender<Message>,
}

impl PipeWriter {
    /// Waits for room in the pipe. Empty chunks are skipped.
    pub async fn write(&self, chunk: Bytes) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx.send(Ok(chunk)).await.map_err(|_| Error::PipeClosed)
    }

    /// Same as [`PipeWriter::write`] for callers outside the async runtime.
    pub fn blocking_write(&self, chunk: Bytes) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx.blocking_send(Ok(chunk)).map_err(|_| Error::PipeClosed)
    }

    pub async fn close_with_error(self, err: Error) {
        // A reader that is already gone has nothing left to learn.
        let _ = self.tx.send(Err(err)).await;
    }

    pub fn blocking_close_with_error(self, err: Error) {
        let _ = self.tx.blocking_send(Err(err));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Reading half of the pipe. Chunks arrive in the order they were written.
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::Receiver<Message>,
    current: Bytes,
    finished: bool,
}

impl PipeReader {
    /// Next whole chunk, `None` at end-of-stream. An error closes the
    /// stream: later calls return `None`.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        if !self.current.is_empty() {
            return Some(Ok(std::mem::take(&mut self.current)));
        }
        if self.finished {
            return None;
        }

        match self.rx.recv().await {
            Some(Ok(chunk)) => Some(Ok(chunk)),
            Some(Err(err)) => {
                self.finish();
                Some(Err(err))
            }
            None => {
                self.finish();
                None
            }
        }
    }

    /// Copies up to `buf.len()` bytes, returning 0 at end-of-stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.current.is_empty() {
            match self.next_chunk().await {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(err)) => return Err(err),
                None => return Ok(0),
            }
        }

        Ok(self.copy_to(buf))
    }

    /// Drains the pipe into memory.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = vec![];
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    fn copy_to(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        n
    }

    fn finish(&mut self) {
        self.finished = true;
        self.rx.close();
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.current.is_empty() {
            if this.finished {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => this.current = chunk,
                Some(Err(err)) => {
                    this.finish();
                    return Poll::Ready(Err(err.into()));
                }
                None => {
                    this.finish();
                    return Poll::Ready(Ok(()));
                }
            }
        }

        let n = buf.remaining().min(this.current.len());
        buf.put_slice(&this.current[..n]);
        this.current.advance(n);
        Poll::Ready(Ok(()))
    }
}
