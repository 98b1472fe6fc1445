//! Raw-substrate wire framing
//!
//! Frame format, repeated for the lifetime of the stream:
//!
//! ```text
//! +--------+----------------------------------+-----------------+
//! | MAGIC  |  i64 header (little-endian)      |  payload bytes  |
//! +--------+----------------------------------+-----------------+
//! ```
//!
//! The header's sign bit marks out-of-band frames (negative means OOB:
//! a terminal status follows instead of payload bytes); its magnitude is
//! the payload length. A wrong magic byte means the stream is
//! desynchronized and the connection must be aborted — there is no
//! resynchronization.

use super::{Init, ProtocolError, MAGIC, MAX_PAYLOAD_SIZE};
use crate::status::Status;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Wire size of a frame header: magic byte plus i64.
pub const HEADER_LEN: usize = 9;

/// Encodes the OOB bit and payload size into an i64 header. A negative
/// size makes no sense, so the sign bit is free to carry the OOB mark.
pub fn encode_header(oob: bool, size: usize) -> i64 {
    if oob {
        -(size as i64)
    } else {
        size as i64
    }
}

/// Decodes an i64 header into its OOB bit and payload size.
pub fn decode_header(h: i64) -> (bool, usize) {
    (h < 0, h.unsigned_abs() as usize)
}

fn header_bytes(oob: bool, size: usize) -> [u8; HEADER_LEN] {
    let mut hdr = [0u8; HEADER_LEN];
    hdr[0] = MAGIC;
    hdr[1..].copy_from_slice(&encode_header(oob, size).to_le_bytes());
    hdr
}

/// Reads one frame header, verifying the magic byte.
pub async fn read_header<R>(r: &mut R) -> Result<(bool, usize), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut magic = [0u8; 1];
    r.read_exact(&mut magic).await?;
    if magic[0] != MAGIC {
        return Err(ProtocolError::Desync);
    }
    let h = r.read_i64_le().await?;
    Ok(decode_header(h))
}

/// Writes one frame header.
pub async fn write_header<W>(w: &mut W, oob: bool, size: usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&header_bytes(oob, size)).await
}

/// Serializes an init payload as an OOB frame.
pub async fn write_init<W>(w: &mut W, init: &Init) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let buf = serde_json::to_vec(init)?;
    write_header(w, true, buf.len()).await?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Reads and validates an init payload. A failed sanity check is
/// terminal; the connection is not reusable afterwards.
pub async fn read_init<R>(r: &mut R, expected_minor: u64) -> Result<Init, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let (oob, size) = read_header(r).await?;
    if !oob {
        return Err(ProtocolError::UnexpectedFrame);
    }
    if size > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(size));
    }
    let mut buf = vec![0u8; size];
    r.read_exact(&mut buf).await?;
    let init: Init = serde_json::from_slice(&buf)?;
    init.sanity_check(expected_minor)?;
    Ok(init)
}

/// Serializes a terminal status as an OOB frame.
pub async fn write_status<W>(w: &mut W, status: &Status) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = status.to_json();
    write_header(w, true, buf.len()).await?;
    w.write_all(&buf).await?;
    w.flush().await
}

enum ReadState {
    /// Collecting the next frame header.
    Header { filled: usize },
    /// `left` bytes still owed from the current data frame.
    Data { left: u64 },
    /// Collecting an OOB status payload of `size` bytes.
    Oob { size: usize, filled: usize },
}

/// Reads transparently from a stream of relay-fragmented data.
///
/// Each `read` either drains bytes owed from the in-flight data frame or
/// decodes a new header. OOB frames are surfaced as read errors carrying
/// the decoded [`Status`], never as data. Writes pass through untouched,
/// so a client can wrap its whole connection.
pub struct FragReader<C> {
    inner: C,
    state: ReadState,
    header: [u8; HEADER_LEN],
    oob_buf: Vec<u8>,
}

impl<C> FragReader<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            state: ReadState::Header { filled: 0 },
            header: [0u8; HEADER_LEN],
            oob_buf: Vec::new(),
        }
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C> AsyncRead for FragReader<C>
where
    C: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        // an empty destination must not be mistaken for a peer EOF
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            match &mut me.state {
                ReadState::Data { left } => {
                    let want = (*left).min(buf.remaining() as u64) as usize;
                    let mut sub = buf.take(want);
                    ready!(Pin::new(&mut me.inner).poll_read(cx, &mut sub))?;
                    let n = sub.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream ended mid-frame",
                        )));
                    }
                    // sub borrows buf's unfilled region, so the bytes
                    // are already in place
                    unsafe { buf.assume_init(n) };
                    buf.advance(n);
                    *left -= n as u64;
                    if *left == 0 {
                        me.state = ReadState::Header { filled: 0 };
                    }
                    return Poll::Ready(Ok(()));
                }
                ReadState::Header { filled } => {
                    while *filled < HEADER_LEN {
                        let mut hb = ReadBuf::new(&mut me.header[*filled..]);
                        ready!(Pin::new(&mut me.inner).poll_read(cx, &mut hb))?;
                        let n = hb.filled().len();
                        if n == 0 {
                            return if *filled == 0 {
                                // clean EOF on a frame boundary
                                Poll::Ready(Ok(()))
                            } else {
                                Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "stream ended mid-header",
                                )))
                            };
                        }
                        *filled += n;
                    }
                    if me.header[0] != MAGIC {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            ProtocolError::Desync.to_string(),
                        )));
                    }
                    let h = i64::from_le_bytes(me.header[1..].try_into().unwrap());
                    let (oob, size) = decode_header(h);
                    if oob {
                        if size > MAX_PAYLOAD_SIZE {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                ProtocolError::PayloadTooLarge(size).to_string(),
                            )));
                        }
                        me.oob_buf.clear();
                        me.oob_buf.resize(size, 0);
                        me.state = ReadState::Oob { size, filled: 0 };
                    } else if size > 0 {
                        me.state = ReadState::Data { left: size as u64 };
                    } else {
                        // empty data frame, keep going
                        me.state = ReadState::Header { filled: 0 };
                    }
                }
                ReadState::Oob { size, filled } => {
                    while *filled < *size {
                        let mut ob = ReadBuf::new(&mut me.oob_buf[*filled..]);
                        ready!(Pin::new(&mut me.inner).poll_read(cx, &mut ob))?;
                        let n = ob.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "stream ended mid-status",
                            )));
                        }
                        *filled += n;
                    }
                    let status = Status::from_json(&me.oob_buf).map_err(|e| {
                        io::Error::new(io::ErrorKind::InvalidData, e.to_string())
                    })?;
                    me.state = ReadState::Header { filled: 0 };
                    return Poll::Ready(Err(status.into_io_error()));
                }
            }
        }
    }
}

impl<C> AsyncWrite for FragReader<C>
where
    C: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Writes transparently to a stream of relay-fragmented data: one write
/// call emits exactly one data frame, header first, no coalescing.
/// Reads pass through untouched.
pub struct FragWriter<C> {
    inner: C,
    pending: BytesMut,
}

impl<C> FragWriter<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            pending: BytesMut::new(),
        }
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C> FragWriter<C>
where
    C: AsyncWrite + Unpin,
{
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<C> AsyncWrite for FragWriter<C>
where
    C: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        // finish the previously staged frame before accepting a new one
        ready!(me.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        me.pending.reserve(HEADER_LEN + buf.len());
        me.pending.put_slice(&header_bytes(false, buf.len()));
        me.pending.put_slice(buf);
        // opportunistic drain; the frame is staged either way
        match me.poll_drain(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) | Poll::Pending => {}
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        ready!(me.poll_drain(cx))?;
        Pin::new(&mut me.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        ready!(me.poll_drain(cx))?;
        ready!(Pin::new(&mut me.inner).poll_flush(cx))?;
        Pin::new(&mut me.inner).poll_shutdown(cx)
    }
}

impl<C> AsyncRead for FragWriter<C>
where
    C: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{proto_version, Command, Protocol, Token};
    use semver::Version;
    use url::Url;

    #[test]
    fn test_header_codec_bijection() {
        for size in [1usize, 9, 4096, usize::from(u16::MAX), 1 << 30] {
            for oob in [false, true] {
                let h = encode_header(oob, size);
                assert_eq!(h < 0, oob, "sign encodes the OOB bit");
                assert_eq!(decode_header(h), (oob, size));
            }
        }
        assert_eq!(decode_header(encode_header(false, 0)), (false, 0));
    }

    #[tokio::test]
    async fn test_header_wire_layout() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_header(&mut a, true, 5).await.unwrap();
        let mut raw = [0u8; HEADER_LEN];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw[0], MAGIC);
        assert_eq!(i64::from_le_bytes(raw[1..].try_into().unwrap()), -5);
    }

    #[tokio::test]
    async fn test_magic_mismatch_aborts() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[43u8; HEADER_LEN]).await.unwrap();
        match read_header(&mut b).await {
            Err(ProtocolError::Desync) => {}
            other => panic!("expected desync, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frame_fidelity_across_small_reads() {
        let (a, b) = tokio::io::duplex(1024);
        let mut w = FragWriter::new(a);
        let mut r = FragReader::new(b);

        let payload = b"the quick brown fox jumps over the lazy dog";
        w.write_all(payload).await.unwrap();
        w.flush().await.unwrap();

        // destination buffer much smaller than the frame
        let mut got = Vec::new();
        let mut chunk = [0u8; 7];
        while got.len() < payload.len() {
            let n = r.read(&mut chunk).await.unwrap();
            assert!(n > 0);
            got.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn test_one_write_one_frame() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut w = FragWriter::new(a);
        w.write_all(b"ab").await.unwrap();
        w.write_all(b"cd").await.unwrap();
        w.flush().await.unwrap();

        let mut raw = vec![0u8; 2 * (HEADER_LEN + 2)];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw[0], MAGIC);
        assert_eq!(&raw[HEADER_LEN..HEADER_LEN + 2], b"ab");
        assert_eq!(raw[HEADER_LEN + 2], MAGIC);
        assert_eq!(&raw[2 * HEADER_LEN + 2..], b"cd");
    }

    #[tokio::test]
    async fn test_zero_length_read_mid_frame() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut r = FragReader::new(b);

        write_header(&mut a, false, 3).await.unwrap();
        a.write_all(b"abc").await.unwrap();

        // leave a frame in flight, then read into an empty buffer
        let mut one = [0u8; 1];
        r.read_exact(&mut one).await.unwrap();
        assert_eq!(r.read(&mut []).await.unwrap(), 0);

        // the in-flight frame is untouched
        let mut rest = [0u8; 2];
        r.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"bc");
    }

    #[tokio::test]
    async fn test_status_after_flush_lands_on_frame_boundary() {
        // pipe smaller than one header, so a frame stays staged in the
        // writer after poll_write reports success
        let (a, b) = tokio::io::duplex(8);
        let mut w = FragWriter::new(a);
        let mut r = FragReader::new(b);

        let reader = tokio::spawn(async move {
            let mut got = Vec::new();
            let mut buf = [0u8; 32];
            loop {
                match r.read(&mut buf).await {
                    Ok(0) => panic!("stream closed without a status"),
                    Ok(n) => got.extend_from_slice(&buf[..n]),
                    Err(e) => {
                        let st = Status::from_io_error(&e).expect("status error").clone();
                        return (got, st);
                    }
                }
            }
        });

        w.write_all(b"0123456789").await.unwrap();
        w.flush().await.unwrap();
        let mut inner = w.into_inner();
        write_status(&mut inner, &Status::gone("endpoint is gone"))
            .await
            .unwrap();

        let (got, st) = reader.await.unwrap();
        assert_eq!(got, b"0123456789");
        assert_eq!(st.code, 410);
    }

    #[tokio::test]
    async fn test_oob_never_mistaken_for_data() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut r = FragReader::new(b);

        // data, then an OOB status, then more data
        write_header(&mut a, false, 3).await.unwrap();
        a.write_all(b"one").await.unwrap();
        write_status(&mut a, &Status::gone("relay shutting down"))
            .await
            .unwrap();
        write_header(&mut a, false, 3).await.unwrap();
        a.write_all(b"two").await.unwrap();

        let mut buf = [0u8; 16];
        let n = r.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");

        let err = r.read(&mut buf).await.unwrap_err();
        let st = Status::from_io_error(&err).expect("status error");
        assert_eq!(st.code, 410);

        let n = r.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");
    }

    #[tokio::test]
    async fn test_init_round_trip_and_version_gate() {
        let minor = proto_version().minor;
        let init = Init {
            command: Command::Connect,
            protocol: Some(Protocol::Tcp),
            remote: Some(Url::parse("wireleap://relay2.example.com:443").unwrap()),
            token: Some(Token(serde_json::json!({"k": "v"}))),
            version: proto_version(),
        };

        let (mut a, mut b) = tokio::io::duplex(4096);
        write_init(&mut a, &init).await.unwrap();
        let got = read_init(&mut b, minor).await.unwrap();
        assert_eq!(got.command, Command::Connect);
        assert_eq!(got.remote, init.remote);

        // wrong minor is rejected at read time
        let mut stale = init.clone();
        stale.version = Version::new(0, minor + 1, 0);
        write_init(&mut a, &stale).await.unwrap();
        match read_init(&mut b, minor).await {
            Err(ProtocolError::VersionMismatch { expected_minor, .. }) => {
                assert_eq!(expected_minor, minor)
            }
            other => panic!("expected version mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_oob_init_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_header(&mut a, false, 2).await.unwrap();
        a.write_all(b"{}").await.unwrap();
        assert!(matches!(
            read_init(&mut b, proto_version().minor).await,
            Err(ProtocolError::UnexpectedFrame)
        ));
    }
}
