//! HTTP/2 stream-to-connection adapters
//!
//! [`StreamConn`] wraps a streaming client PUT request as a [`Conn`]:
//! the request send-stream is the write side, the response body is the
//! read side. Writes proceed immediately; the first read blocks until
//! the round trip resolves, and the result is cached so later reads
//! never re-block on it. A non-OK terminal status in the response
//! trailer surfaces as the read error at end-of-stream.
//!
//! [`H2Stream`] is the server-side counterpart: request body in,
//! response send-stream out, terminal status via `send_trailers`.
//!
//! Deadlines follow the timer-closes-the-resource pattern: an armed
//! `Sleep` is polled at every suspension point, and once it fires the
//! stream is reset and all pending I/O fails with `TimedOut`. Arming a
//! new deadline replaces the previous timer.

use super::Conn;
use crate::protocol::{Init, STATUS_TRAILER};
use crate::status::Status;
use bytes::Bytes;
use h2::client::{ResponseFuture, SendRequest};
use h2::{RecvStream, SendStream};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Response};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};

fn h2_io(e: h2::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// Polls an armed deadline; firing resets the stream via `reset`.
fn poll_deadline(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    cx: &mut Context<'_>,
) -> Result<(), io::Error> {
    if let Some(dl) = deadline.as_mut() {
        if dl.as_mut().poll(cx).is_ready() {
            return Err(io::ErrorKind::TimedOut.into());
        }
    }
    Ok(())
}

fn poll_send(
    send: &mut SendStream<Bytes>,
    cx: &mut Context<'_>,
    buf: &[u8],
) -> Poll<io::Result<usize>> {
    if buf.is_empty() {
        return Poll::Ready(Ok(0));
    }
    send.reserve_capacity(buf.len());
    loop {
        match ready!(send.poll_capacity(cx)) {
            Some(Ok(0)) => continue,
            Some(Ok(n)) => {
                let n = n.min(buf.len());
                send.send_data(Bytes::copy_from_slice(&buf[..n]), false)
                    .map_err(h2_io)?;
                return Poll::Ready(Ok(n));
            }
            Some(Err(e)) => return Poll::Ready(Err(h2_io(e))),
            None => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "h2 stream closed",
                )))
            }
        }
    }
}

enum ReadState {
    /// Round trip in flight; resolves exactly once.
    Waiting(Pin<Box<ResponseFuture>>),
    /// Response arrived, streaming the body.
    Body { stream: RecvStream, data_done: bool },
    Eof,
    /// Round trip or stream failed; the error is cached for all
    /// subsequent reads.
    Failed(String),
}

/// A client connection whose reads and writes are directed over an
/// HTTP/2 stream.
pub struct StreamConn {
    send: SendStream<Bytes>,
    read: ReadState,
    leftover: Bytes,
    deadline: Option<Pin<Box<Sleep>>>,
    write_closed: bool,
}

impl StreamConn {
    /// Issues a streaming PUT carrying the init payload as a request
    /// header and returns before the round trip completes. The caller
    /// must have awaited `send_req.ready()` first.
    pub fn new(
        send_req: &mut SendRequest<Bytes>,
        uri: http::Uri,
        init: &Init,
    ) -> Result<Self, crate::transport::TransportError> {
        let (name, value) = init.header()?;
        let req = Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header(name, value)
            .body(())
            .map_err(|e| crate::transport::TransportError::InvalidRemote(e.to_string()))?;
        let (response, send) = send_req.send_request(req, false)?;
        Ok(Self {
            send,
            read: ReadState::Waiting(Box::pin(response)),
            leftover: Bytes::new(),
            deadline: None,
            write_closed: false,
        })
    }

    fn fail(&mut self, msg: String) -> io::Error {
        self.read = ReadState::Failed(msg.clone());
        io::Error::new(io::ErrorKind::Other, msg)
    }

    fn check_deadline(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if let Err(e) = poll_deadline(&mut self.deadline, cx) {
            self.send.send_reset(h2::Reason::CANCEL);
            self.read = ReadState::Failed("deadline exceeded".into());
            return Err(e);
        }
        Ok(())
    }

    fn on_response(&mut self, res: Response<RecvStream>) {
        self.read = ReadState::Body {
            stream: res.into_body(),
            data_done: false,
        };
    }
}

impl AsyncRead for StreamConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        me.check_deadline(cx)?;
        loop {
            if !me.leftover.is_empty() {
                let n = me.leftover.len().min(buf.remaining());
                buf.put_slice(&me.leftover.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match &mut me.read {
                ReadState::Waiting(fut) => match ready!(fut.as_mut().poll(cx)) {
                    Ok(res) => me.on_response(res),
                    Err(e) => return Poll::Ready(Err(me.fail(e.to_string()))),
                },
                ReadState::Body { stream, data_done } => {
                    if !*data_done {
                        match ready!(stream.poll_data(cx)) {
                            Some(Ok(data)) => {
                                let _ = stream.flow_control().release_capacity(data.len());
                                me.leftover = data;
                                continue;
                            }
                            Some(Err(e)) => {
                                let msg = e.to_string();
                                return Poll::Ready(Err(me.fail(msg)));
                            }
                            None => *data_done = true,
                        }
                    }
                    match ready!(stream.poll_trailers(cx)) {
                        Ok(trailers) => {
                            me.read = ReadState::Eof;
                            if let Some(st) = trailers
                                .as_ref()
                                .and_then(|t| t.get(STATUS_TRAILER))
                                .and_then(|v| Status::from_json(v.as_bytes()).ok())
                            {
                                if !st.is_ok() {
                                    return Poll::Ready(Err(st.into_io_error()));
                                }
                            }
                            return Poll::Ready(Ok(()));
                        }
                        Err(e) => {
                            let msg = e.to_string();
                            return Poll::Ready(Err(me.fail(msg)));
                        }
                    }
                }
                ReadState::Eof => return Poll::Ready(Ok(())),
                ReadState::Failed(msg) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, msg.clone())))
                }
            }
        }
    }
}

impl AsyncWrite for StreamConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        me.check_deadline(cx)?;
        if me.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        poll_send(&mut me.send, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // h2 flushes data frames as they are sent
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if !me.write_closed {
            me.write_closed = true;
            if let Err(e) = me.send.send_data(Bytes::new(), true) {
                return Poll::Ready(Err(h2_io(e)));
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl Conn for StreamConn {
    fn set_deadline(&mut self, deadline: Option<Instant>) -> bool {
        // stop-then-replace: at most one live timer
        self.deadline = deadline.map(|t| Box::pin(sleep_until(t)));
        true
    }
}

impl Drop for StreamConn {
    fn drop(&mut self) {
        if !self.write_closed {
            self.send.send_reset(h2::Reason::CANCEL);
        }
    }
}

/// Server-side counterpart of [`StreamConn`]: the accepted request body
/// is the read side, the response send-stream is the write side.
pub struct H2Stream {
    recv: RecvStream,
    send: SendStream<Bytes>,
    leftover: Bytes,
    deadline: Option<Pin<Box<Sleep>>>,
    ended: bool,
}

impl H2Stream {
    pub fn new(recv: RecvStream, send: SendStream<Bytes>) -> Self {
        Self {
            recv,
            send,
            leftover: Bytes::new(),
            deadline: None,
            ended: false,
        }
    }

    /// Sends the terminal status in the fixed response trailer, ending
    /// the stream.
    pub fn send_trailers(&mut self, status: &Status) -> Result<(), h2::Error> {
        let mut trailers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_bytes(&status.to_json()) {
            trailers.insert(HeaderName::from_static(STATUS_TRAILER), value);
        }
        self.ended = true;
        self.send.send_trailers(trailers)
    }

    fn check_deadline(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if let Err(e) = poll_deadline(&mut self.deadline, cx) {
            self.send.send_reset(h2::Reason::CANCEL);
            self.ended = true;
            return Err(e);
        }
        Ok(())
    }
}

impl AsyncRead for H2Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        me.check_deadline(cx)?;
        loop {
            if !me.leftover.is_empty() {
                let n = me.leftover.len().min(buf.remaining());
                buf.put_slice(&me.leftover.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match ready!(me.recv.poll_data(cx)) {
                Some(Ok(data)) => {
                    let _ = me.recv.flow_control().release_capacity(data.len());
                    me.leftover = data;
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_io(e))),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        me.check_deadline(cx)?;
        if me.ended {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        poll_send(&mut me.send, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if !me.ended {
            me.ended = true;
            if let Err(e) = me.send.send_data(Bytes::new(), true) {
                return Poll::Ready(Err(h2_io(e)));
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl Conn for H2Stream {
    fn set_deadline(&mut self, deadline: Option<Instant>) -> bool {
        self.deadline = deadline.map(|t| Box::pin(sleep_until(t)));
        true
    }
}
