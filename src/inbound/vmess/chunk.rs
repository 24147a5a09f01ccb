//! Chunked body stream (C7): per-direction AEAD framing of the proxied
//! payload after the V-MESS handshake completes.
//!
//! Each chunk is `u16 BE length ++ ciphertext` (length includes the AEAD
//! tag when a security mode other than `None` is negotiated). The AEAD
//! nonce is 12 bytes: a 2-byte big-endian chunk counter followed by 10
//! bytes taken from the body IV at offset 2 (`iv[2..12]`), matching the
//! reference implementation's per-direction nonce derivation. The counter
//! is a `u16`; wraparound past 65535 chunks on one direction is treated as
//! a fatal stream error rather than silently reusing a nonce.

use crate::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes128Gcm, Nonce,
};
use bytes::{Buf, BufMut, BytesMut};
use chacha20poly1305::ChaCha20Poly1305;
use std::io::{self, ErrorKind};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Body encryption negotiated for a V-MESS session, decoded from the low
/// nibble of the request header's security byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    None,
    Aes128Gcm,
    ChaCha20Poly1305,
}

impl Security {
    pub fn tag_size(&self) -> usize {
        match self {
            Security::None => 0,
            Security::Aes128Gcm | Security::ChaCha20Poly1305 => 16,
        }
    }
}

impl TryFrom<u8> for Security {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(Security::None),
            0x03 => Ok(Security::Aes128Gcm),
            0x04 => Ok(Security::ChaCha20Poly1305),
            other => Err(Error::unsupported(format!(
                "unsupported VMess security byte {:#x}",
                other
            ))),
        }
    }
}

enum BodyCipher {
    None,
    Aes128Gcm(Box<Aes128Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

impl BodyCipher {
    fn new(security: Security, key: &[u8; 16]) -> Result<Self> {
        Ok(match security {
            Security::None => BodyCipher::None,
            Security::Aes128Gcm => BodyCipher::Aes128Gcm(Box::new(
                Aes128Gcm::new_from_slice(key).map_err(|e| Error::crypto(e.to_string()))?,
            )),
            Security::ChaCha20Poly1305 => {
                // V-MESS expands the 16-byte body key to ChaCha20-Poly1305's
                // 32-byte key as MD5(key) ++ MD5(MD5(key)).
                use md5::{Digest, Md5};
                let first = Md5::digest(key);
                let second = Md5::digest(&first);
                let mut expanded = [0u8; 32];
                expanded[..16].copy_from_slice(&first);
                expanded[16..].copy_from_slice(&second);
                BodyCipher::ChaCha20Poly1305(Box::new(
                    ChaCha20Poly1305::new_from_slice(&expanded)
                        .map_err(|e| Error::crypto(e.to_string()))?,
                ))
            }
        })
    }

    fn seal(&self, nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            BodyCipher::None => Ok(plaintext.to_vec()),
            BodyCipher::Aes128Gcm(c) => c
                .encrypt(Nonce::from_slice(nonce), plaintext)
                .map_err(|e| Error::crypto(e.to_string())),
            BodyCipher::ChaCha20Poly1305(c) => c
                .encrypt(Nonce::from_slice(nonce), plaintext)
                .map_err(|e| Error::crypto(e.to_string())),
        }
    }

    fn open(&self, nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self {
            BodyCipher::None => Ok(ciphertext.to_vec()),
            BodyCipher::Aes128Gcm(c) => c
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|e| Error::crypto(e.to_string())),
            BodyCipher::ChaCha20Poly1305(c) => c
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|e| Error::crypto(e.to_string())),
        }
    }
}

/// Counts chunks in one direction and builds the 12-byte nonce for each,
/// failing closed on u16 wraparound.
struct ChunkCounter {
    count: u16,
    wrapped: bool,
    iv_suffix: [u8; 10],
}

impl ChunkCounter {
    fn new(iv: &[u8; 16]) -> Self {
        let mut iv_suffix = [0u8; 10];
        iv_suffix.copy_from_slice(&iv[2..12]);
        ChunkCounter {
            count: 0,
            wrapped: false,
            iv_suffix,
        }
    }

    fn next_nonce(&mut self) -> Result<[u8; 12]> {
        if self.wrapped {
            return Err(Error::crypto("VMess chunk counter wrapped past 65535"));
        }
        let mut nonce = [0u8; 12];
        nonce[0..2].copy_from_slice(&self.count.to_be_bytes());
        nonce[2..12].copy_from_slice(&self.iv_suffix);

        let (next, overflowed) = self.count.overflowing_add(1);
        self.count = next;
        if overflowed {
            self.wrapped = true;
        }
        Ok(nonce)
    }
}

const MAX_CHUNK_PAYLOAD: usize = 0x4000 - 16;

/// Reads chunked, AEAD-sealed body data off an inner `AsyncRead` and yields
/// decrypted plaintext.
pub struct ChunkReader<R> {
    inner: R,
    cipher: BodyCipher,
    counter: ChunkCounter,
    read_buf: BytesMut,
    pending: BytesMut,
    eof: bool,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(inner: R, security: Security, key: [u8; 16], iv: [u8; 16]) -> Result<Self> {
        Ok(ChunkReader {
            inner,
            cipher: BodyCipher::new(security, &key)?,
            counter: ChunkCounter::new(&iv),
            read_buf: BytesMut::with_capacity(4096),
            pending: BytesMut::new(),
            eof: false,
        })
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ChunkReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.pending.is_empty() {
            let n = std::cmp::min(buf.remaining(), self.pending.len());
            buf.put_slice(&self.pending.split_to(n));
            return Poll::Ready(Ok(()));
        }
        if self.eof {
            return Poll::Ready(Ok(()));
        }

        loop {
            // A zero-length chunk is the end-of-stream marker.
            if let Some(frame) = try_take_frame(&mut self.read_buf) {
                if frame.is_empty() {
                    self.eof = true;
                    return Poll::Ready(Ok(()));
                }
                let nonce = self
                    .counter
                    .next_nonce()
                    .map_err(|e| io::Error::new(ErrorKind::Other, e.to_string()))?;
                let plaintext = self
                    .cipher
                    .open(&nonce, &frame)
                    .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
                self.pending.extend_from_slice(&plaintext);

                let n = std::cmp::min(buf.remaining(), self.pending.len());
                buf.put_slice(&self.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            let mut scratch = [0u8; 4096];
            let mut read_buf = ReadBuf::new(&mut scratch);
            match Pin::new(&mut self.inner).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        self.eof = true;
                        return Poll::Ready(Ok(()));
                    }
                    self.read_buf.extend_from_slice(filled);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn try_take_frame(buf: &mut BytesMut) -> Option<Vec<u8>> {
    if buf.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len {
        return None;
    }
    buf.advance(2);
    Some(buf.split_to(len).to_vec())
}

/// Writes plaintext as chunked, AEAD-sealed frames to an inner `AsyncWrite`.
pub struct ChunkWriter<W> {
    inner: W,
    cipher: BodyCipher,
    counter: ChunkCounter,
}

impl<W: AsyncWrite + Unpin> ChunkWriter<W> {
    pub fn new(inner: W, security: Security, key: [u8; 16], iv: [u8; 16]) -> Result<Self> {
        Ok(ChunkWriter {
            inner,
            cipher: BodyCipher::new(security, &key)?,
            counter: ChunkCounter::new(&iv),
        })
    }

    fn seal_frame(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.counter.next_nonce()?;
        let sealed = self.cipher.seal(&nonce, plaintext)?;
        let mut frame = BytesMut::with_capacity(2 + sealed.len());
        frame.put_u16(sealed.len() as u16);
        frame.put_slice(&sealed);
        Ok(frame.to_vec())
    }

    /// Explicitly terminate the stream with a zero-length sealed frame, the
    /// protocol's end-of-body marker. Callers that know they're done
    /// writing should call this before shutting the connection down so the
    /// client's `ChunkReader` sees a clean end rather than a bare EOF.
    pub async fn write_eof_marker(&mut self) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let frame = self.seal_frame(&[])?;
        self.inner
            .write_all(&frame)
            .await
            .map_err(|e| Error::io_error(e.to_string()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ChunkWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let n = std::cmp::min(buf.len(), MAX_CHUNK_PAYLOAD);
        let chunk = &buf[..n];

        let frame = self
            .seal_frame(chunk)
            .map_err(|e| io::Error::new(ErrorKind::Other, e.to_string()))?;

        match Pin::new(&mut self.inner).poll_write(cx, &frame) {
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(chunk.len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_from_byte() {
        assert_eq!(Security::try_from(0x00).unwrap(), Security::None);
        assert_eq!(Security::try_from(0x03).unwrap(), Security::Aes128Gcm);
        assert_eq!(Security::try_from(0x04).unwrap(), Security::ChaCha20Poly1305);
        assert!(Security::try_from(0x02).is_err());
    }

    #[test]
    fn test_chunk_counter_nonce_varies_by_count() {
        let iv = [3u8; 16];
        let mut counter = ChunkCounter::new(&iv);
        let n0 = counter.next_nonce().unwrap();
        let n1 = counter.next_nonce().unwrap();
        assert_ne!(n0, n1);
        assert_eq!(&n0[2..], &n1[2..]);
        assert_eq!(&n0[0..2], &0u16.to_be_bytes());
        assert_eq!(&n1[0..2], &1u16.to_be_bytes());
    }

    #[test]
    fn test_chunk_counter_wraparound_is_fatal() {
        let iv = [0u8; 16];
        let mut counter = ChunkCounter::new(&iv);
        counter.count = u16::MAX;
        assert!(counter.next_nonce().is_ok());
        assert!(counter.next_nonce().is_err());
    }

    #[tokio::test]
    async fn test_chunk_round_trip_aes128gcm() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let key = [9u8; 16];
        let iv = [1u8; 16];
        let (client, server) = tokio::io::duplex(4096);

        let mut writer = ChunkWriter::new(client, Security::Aes128Gcm, key, iv).unwrap();
        let mut reader = ChunkReader::new(server, Security::Aes128Gcm, key, iv).unwrap();

        writer.write_all(b"hello vmess").await.unwrap();
        writer.flush().await.unwrap();

        let mut out = vec![0u8; 64];
        let n = reader.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"hello vmess");
    }

    #[tokio::test]
    async fn test_chunk_round_trip_none() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let key = [0u8; 16];
        let iv = [0u8; 16];
        let (client, server) = tokio::io::duplex(4096);

        let mut writer = ChunkWriter::new(client, Security::None, key, iv).unwrap();
        let mut reader = ChunkReader::new(server, Security::None, key, iv).unwrap();

        writer.write_all(b"plain").await.unwrap();
        writer.flush().await.unwrap();

        let mut out = vec![0u8; 64];
        let n = reader.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"plain");
    }
}
