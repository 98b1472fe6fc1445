//! Bidirectional copy between two endpoints
//!
//! Termination is strict: the splice ends as soon as the first direction
//! finishes (EOF or error), the lifetime deadline fires, or the caller
//! cancels. Connections never linger on a half-open peer.

use crate::status::Status;
use crate::transport::Conn;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One copy direction with its own buffer.
struct CopyBuffer {
    buf: Box<[u8]>,
    pos: usize,
    cap: usize,
    read_done: bool,
}

impl CopyBuffer {
    fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
            pos: 0,
            cap: 0,
            read_done: false,
        }
    }

    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            if self.pos == self.cap && !self.read_done {
                let mut rb = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut rb) {
                    Poll::Ready(Ok(())) => {
                        let n = rb.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.pos = 0;
                            self.cap = n;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {
                        // push along partially written data before parking
                        ready!(writer.as_mut().poll_flush(cx))?;
                        return Poll::Pending;
                    }
                }
            }
            while self.pos < self.cap {
                let n = ready!(writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]))?;
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                self.pos += n;
            }
            if self.read_done {
                // forward the FIN so the peer sees end-of-stream
                ready!(writer.as_mut().poll_flush(cx))?;
                ready!(writer.as_mut().poll_shutdown(cx))?;
                return Poll::Ready(Ok(()));
            }
        }
    }
}

/// Splices `a` and `b` together end-to-end, copying in both directions
/// with independent buffers of `buf_size` bytes.
///
/// With a non-zero `max_lifetime`, endpoints with native deadline
/// support get the deadline set directly; otherwise a fallback timer
/// bounds the splice and yields `TimedOut`.
///
/// Returns the finishing direction's result (possibly `Ok` for a clean
/// EOF). Cancellation shuts both write sides down and returns `Ok`
/// regardless of in-flight errors. On an error return the endpoints are
/// left open so the caller can still write a terminal status before
/// closing them.
pub async fn splice<A, B>(
    cancel: &CancellationToken,
    a: &mut A,
    b: &mut B,
    max_lifetime: Duration,
    buf_size: usize,
) -> io::Result<()>
where
    A: Conn,
    B: Conn,
{
    let mut fallback = None;
    if max_lifetime != Duration::ZERO {
        let deadline = Instant::now() + max_lifetime;
        let a_native = a.set_deadline(Some(deadline));
        let b_native = b.set_deadline(Some(deadline));
        if !(a_native && b_native) {
            fallback = Some(deadline);
        }
    }
    let timer = async move {
        match fallback {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };

    let mut fwd = CopyBuffer::new(buf_size);
    let mut rev = CopyBuffer::new(buf_size);
    // scoped so the copy future's borrow of both endpoints ends before
    // the cancellation path shuts them down
    let finished = {
        let copy = poll_fn(|cx| {
            // both directions share one task; first to finish wins
            if let Poll::Ready(res) = fwd.poll_copy(cx, Pin::new(&mut *a), Pin::new(&mut *b)) {
                return Poll::Ready(res);
            }
            rev.poll_copy(cx, Pin::new(&mut *b), Pin::new(&mut *a))
        });
        tokio::select! {
            res = copy => Some(res),
            _ = cancel.cancelled() => None,
            _ = timer => Some(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "maximum tunnel lifetime exceeded",
            ))),
        }
    };
    match finished {
        Some(res) => {
            if let Err(e) = &res {
                if let Some(st) = Status::from_io_error(e) {
                    // a structured status is a protocol-level event, not
                    // an unexpected transport failure
                    debug!("splice ended with status: {}", st);
                }
            }
            res
        }
        None => {
            // cancelled: dropping the copy future stopped both
            // directions; unblock the peers too
            a.shutdown().await.ok();
            b.shutdown().await.ok();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_BUF_SIZE;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_splice_both_directions() {
        let (mut client, inbound) = tokio::io::duplex(1024);
        let (outbound, mut server) = tokio::io::duplex(1024);

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut inbound = inbound;
                let mut outbound = outbound;
                splice(
                    &cancel,
                    &mut inbound,
                    &mut outbound,
                    Duration::ZERO,
                    DEFAULT_BUF_SIZE,
                )
                .await
            }
        });

        client.write_all(b"to server").await.unwrap();
        let mut buf = [0u8; 9];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to server");

        server.write_all(b"to client").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to client");

        // EOF from the client terminates the splice cleanly
        client.shutdown().await.unwrap();
        let res = task.await.unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_returns_promptly_without_error() {
        let (mut client, inbound) = tokio::io::duplex(64);
        let (outbound, mut server) = tokio::io::duplex(64);

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut inbound = inbound;
                let mut outbound = outbound;
                splice(
                    &cancel,
                    &mut inbound,
                    &mut outbound,
                    Duration::ZERO,
                    DEFAULT_BUF_SIZE,
                )
                .await
            }
        });

        cancel.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("splice did not return promptly")
            .unwrap();
        assert!(res.is_ok());

        // both peers observe the shutdown
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lifetime_deadline_times_out() {
        let (_client, inbound) = tokio::io::duplex(64);
        let (outbound, _server) = tokio::io::duplex(64);

        let cancel = CancellationToken::new();
        let mut inbound = inbound;
        let mut outbound = outbound;
        let res = splice(
            &cancel,
            &mut inbound,
            &mut outbound,
            Duration::from_millis(50),
            DEFAULT_BUF_SIZE,
        )
        .await;
        let err = res.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_error_from_one_direction_is_returned() {
        let (client, inbound) = tokio::io::duplex(64);
        let (outbound, server) = tokio::io::duplex(64);

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut inbound = inbound;
                let mut outbound = outbound;
                splice(
                    &cancel,
                    &mut inbound,
                    &mut outbound,
                    Duration::ZERO,
                    DEFAULT_BUF_SIZE,
                )
                .await
            }
        });

        // dropping both peer handles aborts both directions
        drop(client);
        drop(server);
        // duplex drop reads as EOF, so this is a clean completion
        assert!(task.await.unwrap().is_ok());
    }
}
