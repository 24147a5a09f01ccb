//! Server-side session object (C8): binds a raw stream to the chunked AEAD
//! body codec once the request header has been authenticated.
//!
//! The response prelude (see [`super::header::seal_response_header`]) is a
//! one-off AEAD blob, not a chunk frame, so the listener writes it directly
//! to the raw stream before a `VmessSession` is built; from that point on,
//! every read/write on the session goes through [`super::chunk`]'s framing
//! in the request and response directions respectively — unless the client
//! didn't set `OptChunkStream` in its request header, in which case the
//! body is a transparent byte stream and the chunk codec is bypassed
//! entirely.

use super::chunk::{ChunkReader, ChunkWriter};
use super::header::{self, RequestHeader, OPT_CHUNK_STREAM};
use crate::Result;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, ReadBuf, WriteHalf};

enum BodyReader<R> {
    Chunked(ChunkReader<R>),
    Raw(R),
}

impl<R: AsyncRead + Unpin> AsyncRead for BodyReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BodyReader::Chunked(r) => Pin::new(r).poll_read(cx, buf),
            BodyReader::Raw(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

enum BodyWriter<W> {
    Chunked(ChunkWriter<W>),
    Raw(W),
}

impl<W: AsyncWrite + Unpin> AsyncWrite for BodyWriter<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BodyWriter::Chunked(w) => Pin::new(w).poll_write(cx, buf),
            BodyWriter::Raw(w) => Pin::new(w).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BodyWriter::Chunked(w) => Pin::new(w).poll_flush(cx),
            BodyWriter::Raw(w) => Pin::new(w).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BodyWriter::Chunked(w) => Pin::new(w).poll_shutdown(cx),
            BodyWriter::Raw(w) => Pin::new(w).poll_shutdown(cx),
        }
    }
}

/// A bound V-MESS connection: decrypts the client's chunked request body on
/// read, encrypts the proxied response on write — or, when the client opted
/// out of chunk framing, passes both directions straight through.
pub struct VmessSession<S> {
    reader: BodyReader<ReadHalf<S>>,
    writer: BodyWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> VmessSession<S> {
    /// `stream` must not have had any bytes consumed beyond the request
    /// header; `req` is the header that header::open_request_header just
    /// authenticated.
    pub fn new(stream: S, req: &RequestHeader) -> Result<Self> {
        let chunked = req.opt & OPT_CHUNK_STREAM != 0;
        let (read_half, write_half) = tokio::io::split(stream);

        let reader = if chunked {
            BodyReader::Chunked(ChunkReader::new(
                read_half,
                req.security,
                req.req_body_key,
                req.req_body_iv,
            )?)
        } else {
            BodyReader::Raw(read_half)
        };

        let writer = if chunked {
            let (resp_key, resp_iv) = header::response_body_key_iv(req);
            BodyWriter::Chunked(ChunkWriter::new(write_half, req.security, resp_key, resp_iv)?)
        } else {
            BodyWriter::Raw(write_half)
        };

        Ok(VmessSession { reader, writer })
    }

    /// Explicitly terminate the outbound body with the protocol's
    /// zero-length marker frame, ahead of a clean shutdown. A no-op in
    /// transparent (non-chunked) mode, which has no such marker.
    pub async fn write_eof_marker(&mut self) -> Result<()> {
        match &mut self.writer {
            BodyWriter::Chunked(w) => w.write_eof_marker().await,
            BodyWriter::Raw(_) => Ok(()),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for VmessSession<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.reader).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for VmessSession<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        Pin::new(&mut this.writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.writer).poll_shutdown(cx)
    }
}
