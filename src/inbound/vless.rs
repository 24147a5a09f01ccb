//! V-LESS inbound: a terse, unencrypted framed handshake with fallback
//! semantics on framing failure, plus the CRUMFURS UDP side-channel.

use super::InboundListener;
use crate::common::identity::{IdentityRegistry, User};
use crate::common::target_addr::{read_port_and_address, TargetAddr, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use crate::common::Metadata;
use crate::config::VlessInboundConfig;
use crate::tunnel::Tunnel;
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CMD_TCP: u8 = 0x01;
const CMD_UDP: u8 = 0x02;
const CMD_MUX: u8 = 0x03;
const CMD_CRUMFURS: u8 = 0x04;

/// Byte written back to a client once its CRUMFURS channel is established.
pub const CRUMFURS_ESTABLISHED: u8 = 0x01;

/// Sentinel target name for the recognized-but-unimplemented mux command.
pub const MUX_TARGET_NAME: &str = "v1.mux.cool";

/// Sentinel target name for a CRUMFURS channel; upper layers must treat a
/// session with this target as "do not close".
pub const CRUMFURS_TARGET_NAME: &str = "v1.crumfurs.vless";

const HANDSHAKE_READ_DEADLINE: Duration = Duration::from_secs(4);
const MIN_HEADER_LEN: usize = 17;

/// The dialed target and transport, once a V-LESS header parses cleanly.
#[derive(Debug)]
enum VlessCommand {
    Tcp { addr: TargetAddr, port: u16 },
    Udp { addr: TargetAddr, port: u16 },
    Mux { addr: TargetAddr, port: u16 },
    Crumfurs,
}

struct ParsedHeader {
    user: User,
    version: u8,
    command: VlessCommand,
}

/// Parse and authenticate a V-LESS header out of `buf`, the full bytes read
/// by the handshake's single deadline-bound read. Returns the parsed header
/// and the number of bytes consumed from `buf`; any remaining bytes are
/// already-received body data that must be replayed to the session stream.
///
/// Any framing or authentication failure returns `Error::VlessFallback`
/// carrying `buf` unchanged, so the caller can hand the exact bytes to a
/// fallback upstream.
fn parse_header(identity: &IdentityRegistry, buf: &[u8]) -> Result<(ParsedHeader, usize)> {
    let fallback = |reason: &str| Error::vless_fallback(reason.to_string(), buf.to_vec());

    if buf.len() < MIN_HEADER_LEN {
        return Err(fallback("short read"));
    }

    let mut cursor: &[u8] = buf;
    let version = cursor.get_u8();
    if version > 1 {
        return Err(fallback("unsupported version"));
    }

    let mut uuid_bytes = [0u8; 16];
    cursor.copy_to_slice(&mut uuid_bytes);
    let user = identity
        .get_by_uuid_bytes(&uuid_bytes)
        .ok_or_else(|| fallback("unknown user"))?;

    if version == 0 {
        if cursor.remaining() < 1 {
            return Err(fallback("missing addon length"));
        }
        let addon_len = cursor.get_u8() as usize;
        if addon_len > 0 {
            warn!("VLESS addon bytes present (len={}), skipping", addon_len);
            if cursor.remaining() < addon_len {
                return Err(fallback("truncated addon"));
            }
            cursor.advance(addon_len);
        }
    }

    if cursor.remaining() < 1 {
        return Err(fallback("missing command byte"));
    }
    let command_byte = cursor.get_u8();

    let command = match command_byte {
        CMD_TCP => {
            let (addr, port) =
                read_port_and_address(&mut cursor).map_err(|_| fallback("malformed address"))?;
            VlessCommand::Tcp { addr, port }
        }
        CMD_UDP => {
            let (addr, port) =
                read_port_and_address(&mut cursor).map_err(|_| fallback("malformed address"))?;
            VlessCommand::Udp { addr, port }
        }
        CMD_MUX => VlessCommand::Mux {
            addr: TargetAddr::Domain(MUX_TARGET_NAME.to_string()),
            port: 0,
        },
        CMD_CRUMFURS => {
            if version != 1 {
                return Err(fallback("CRUMFURS requires version 1"));
            }
            VlessCommand::Crumfurs
        }
        other => return Err(fallback(&format!("unknown command {}", other))),
    };

    let consumed = buf.len() - cursor.remaining();
    Ok((ParsedHeader { user, version, command }, consumed))
}

/// Encode a CRUMFURS UDP reply record: `atype ++ address ++ port [++ u16 BE
/// payload-len] ++ payload`. `include_length` is only set when no other
/// framing layer beneath this one already delimits the payload.
pub fn encode_crumfurs_reply(addr: &TargetAddr, port: u16, payload: &[u8], include_length: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 24);
    match addr {
        TargetAddr::Ipv4(ip) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&ip.octets());
        }
        TargetAddr::Ipv6(ip) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&ip.octets());
        }
        TargetAddr::Domain(domain) => {
            out.push(ATYP_DOMAIN);
            out.push(domain.len() as u8);
            out.extend_from_slice(domain.as_bytes());
        }
    }
    out.extend_from_slice(&port.to_be_bytes());
    if include_length {
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// Registry of active CRUMFURS channels, one per user. The table only ever
/// holds a weak handle: the per-connection task that accepted the channel
/// owns the strong `Arc` and is responsible for deregistering on exit, so a
/// task that dies leaves a naturally-expiring weak reference rather than a
/// dangling strong one.
pub struct CrumfursTable {
    channels: DashMap<[u8; 16], Weak<Mutex<tokio::net::TcpStream>>>,
}

impl CrumfursTable {
    pub fn new() -> Self {
        CrumfursTable {
            channels: DashMap::new(),
        }
    }

    /// Registering a new channel for a user supersedes any previous one.
    pub fn register(&self, uuid_bytes: [u8; 16], handle: Weak<Mutex<tokio::net::TcpStream>>) {
        self.channels.insert(uuid_bytes, handle);
    }

    pub fn get(&self, uuid_bytes: &[u8; 16]) -> Option<Arc<Mutex<tokio::net::TcpStream>>> {
        self.channels.get(uuid_bytes).and_then(|w| w.upgrade())
    }

    pub fn remove(&self, uuid_bytes: &[u8; 16]) {
        self.channels.remove(uuid_bytes);
    }
}

impl Default for CrumfursTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps an authenticated stream so its first reads drain the bytes already
/// consumed by the handshake's single greedy read before falling through to
/// the bare underlying stream. Writes pass straight through.
pub struct VlessSession<S> {
    inner: S,
    residual: BytesMut,
}

impl<S> VlessSession<S> {
    pub fn new(inner: S, residual: Vec<u8>) -> Self {
        VlessSession {
            inner,
            residual: BytesMut::from(&residual[..]),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for VlessSession<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.residual.is_empty() {
            let n = std::cmp::min(buf.remaining(), this.residual.len());
            buf.put_slice(&this.residual.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for VlessSession<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

pub struct VlessListener {
    config: VlessInboundConfig,
    tunnel: Arc<Tunnel>,
    identity: Arc<IdentityRegistry>,
    crumfurs: Arc<CrumfursTable>,
    running: AtomicBool,
}

impl VlessListener {
    pub fn new(config: VlessInboundConfig, tunnel: Arc<Tunnel>) -> Result<Self> {
        let identity = Arc::new(IdentityRegistry::new());
        for uuid_str in &config.users {
            let uuid = Uuid::parse_str(uuid_str)
                .map_err(|e| Error::config(format!("Invalid VLESS user UUID {}: {}", uuid_str, e)))?;
            // V-LESS authenticates by raw UUID bytes, not an AuthID scan, so
            // no per-user cipher is needed; the scan-list cipher slot is
            // unused here but still keyed consistently with the registry.
            identity.add_user(uuid, unused_cipher());
        }

        Ok(VlessListener {
            config,
            tunnel,
            identity,
            crumfurs: Arc::new(CrumfursTable::new()),
            running: AtomicBool::new(false),
        })
    }

    async fn handle_connection(
        identity: Arc<IdentityRegistry>,
        crumfurs: Arc<CrumfursTable>,
        tunnel: Arc<Tunnel>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) {
        if let Err(e) =
            Self::process_connection(&identity, &crumfurs, &tunnel, stream, peer_addr).await
        {
            debug!("VLESS connection error from {}: {}", peer_addr, e);
        }
    }

    async fn process_connection(
        identity: &IdentityRegistry,
        crumfurs: &CrumfursTable,
        tunnel: &Tunnel,
        mut stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let mut buf = vec![0u8; 4096];
        let n = match tokio::time::timeout(HANDSHAKE_READ_DEADLINE, stream.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            // I/O failures on the initial read leave the stream unusable;
            // no fallback buffer is meaningful here.
            Ok(Err(e)) => return Err(Error::io_error(e.to_string())),
            Err(_) => return Err(Error::timeout("VLESS handshake read deadline exceeded")),
        };
        buf.truncate(n);

        let (parsed, consumed) = parse_header(identity, &buf)?;

        match parsed.command {
            VlessCommand::Mux { addr, port } => {
                debug!(
                    "VLESS {} requested mux, handshaking onto the sentinel target {} (mux framing itself is not implemented)",
                    peer_addr, MUX_TARGET_NAME
                );
                Self::relay_stream(tunnel, stream, peer_addr, &parsed.user, addr, port, &buf, consumed, false)
                    .await
            }
            VlessCommand::Crumfurs => {
                stream
                    .write_u8(CRUMFURS_ESTABLISHED)
                    .await
                    .map_err(|e| Error::io_error(e.to_string()))?;

                let uuid_bytes = parsed.user.uuid_bytes();
                let shared = Arc::new(Mutex::new(stream));
                crumfurs.register(uuid_bytes, Arc::downgrade(&shared));
                info!(
                    "VLESS CRUMFURS channel established for user {}",
                    parsed.user.uuid
                );

                Self::hold_crumfurs_channel(shared).await;
                crumfurs.remove(&uuid_bytes);
                Ok(())
            }
            VlessCommand::Tcp { addr, port } => {
                Self::relay_stream(tunnel, stream, peer_addr, &parsed.user, addr, port, &buf, consumed, false)
                    .await
            }
            VlessCommand::Udp { addr, port } => {
                Self::relay_stream(tunnel, stream, peer_addr, &parsed.user, addr, port, &buf, consumed, true)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn relay_stream(
        tunnel: &Tunnel,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
        user: &User,
        addr: TargetAddr,
        port: u16,
        buf: &[u8],
        consumed: usize,
        is_udp: bool,
    ) -> Result<()> {
        let residual = buf[consumed..].to_vec();
        let host = addr.to_host();

        debug!(
            "VLESS {} {} -> {}:{} (user {})",
            peer_addr,
            if is_udp { "UDP" } else { "TCP" },
            host,
            port,
            user.uuid
        );

        let mut metadata = if is_udp { Metadata::udp() } else { Metadata::tcp() }
            .with_source(peer_addr)
            .with_host(host.clone())
            .with_dst_port(port);
        if let Some(ip) = addr.to_ip() {
            metadata = metadata.with_dst_ip(ip);
        }

        let (mut remote, _conn_id) = tunnel.handle_tcp_with_dialer(&metadata).await?;
        let mut session = VlessSession::new(stream, residual);
        let (sent, received) =
            crate::common::net::copy_bidirectional(&mut session, &mut remote).await?;
        debug!(
            "VLESS {} -> {}:{} completed (sent: {}, received: {})",
            peer_addr, host, port, sent, received
        );
        Ok(())
    }

    /// Keep a CRUMFURS channel's connection alive until the client closes
    /// it; the channel is only useful while the task that accepted it is
    /// still running, since the table only holds a weak handle to it.
    async fn hold_crumfurs_channel(shared: Arc<Mutex<tokio::net::TcpStream>>) {
        let mut probe = [0u8; 1];
        loop {
            let n = {
                let mut guard = shared.lock().await;
                guard.read(&mut probe).await
            };
            match n {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }
}

/// V-LESS authenticates by raw UUID bytes; the identity registry's
/// scan-list cipher slot exists for V-MESS's AuthID scan and is unused on
/// this path, so a fixed placeholder key is enough.
fn unused_cipher() -> aes::Aes128 {
    use aes::cipher::KeyInit;
    aes::Aes128::new_from_slice(&[0u8; 16]).expect("AES-128 key must be 16 bytes")
}

#[async_trait::async_trait]
impl InboundListener for VlessListener {
    fn name(&self) -> &str {
        "VLESS"
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        let addr = listener.local_addr()?;
        info!("VLESS proxy listening on {}", addr);

        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let identity = self.identity.clone();
                    let crumfurs = self.crumfurs.clone();
                    let tunnel = self.tunnel.clone();
                    tokio::spawn(async move {
                        Self::handle_connection(identity, crumfurs, tunnel, stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        error!("VLESS accept error: {}", e);
                    }
                }
            }
        }

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn registry_with_user(uuid: Uuid) -> IdentityRegistry {
        let reg = IdentityRegistry::new();
        reg.add_user(uuid, unused_cipher());
        reg
    }

    #[test]
    fn test_s1_tcp_ipv4() {
        let uuid = Uuid::parse_str("b831381d-6324-4d53-ad4f-8cda48b30811").unwrap();
        let reg = registry_with_user(uuid);

        let mut buf = vec![0x00u8];
        buf.extend_from_slice(uuid.as_bytes());
        buf.push(0x00); // addonLen
        buf.push(CMD_TCP);
        buf.push(0x00);
        buf.push(0x50); // port 80
        buf.push(ATYP_IPV4);
        buf.extend_from_slice(&[93, 184, 216, 34]);

        let (parsed, consumed) = parse_header(&reg, &buf).unwrap();
        assert_eq!(consumed, buf.len());
        match parsed.command {
            VlessCommand::Tcp { addr, port } => {
                assert_eq!(addr, TargetAddr::Ipv4(Ipv4Addr::new(93, 184, 216, 34)));
                assert_eq!(port, 80);
            }
            _ => panic!("expected Tcp command"),
        }
    }

    #[test]
    fn test_s2_domain_udp() {
        let uuid = Uuid::parse_str("b831381d-6324-4d53-ad4f-8cda48b30811").unwrap();
        let reg = registry_with_user(uuid);

        let mut buf = vec![0x00u8];
        buf.extend_from_slice(uuid.as_bytes());
        buf.push(0x00);
        buf.push(CMD_UDP);
        buf.push(0x01);
        buf.push(0xBB); // port 443
        buf.push(ATYP_DOMAIN);
        buf.push(0x0B);
        buf.extend_from_slice(b"example.com");

        let (parsed, _consumed) = parse_header(&reg, &buf).unwrap();
        match parsed.command {
            VlessCommand::Udp { addr, port } => {
                assert_eq!(addr, TargetAddr::Domain("example.com".into()));
                assert_eq!(port, 443);
            }
            _ => panic!("expected Udp command"),
        }
    }

    #[test]
    fn test_s3_unknown_user_fallback_carries_exact_bytes() {
        let reg = IdentityRegistry::new();
        let random_uuid = Uuid::new_v4();
        let mut buf = vec![0x00u8];
        buf.extend_from_slice(random_uuid.as_bytes());

        let err = parse_header(&reg, &buf).unwrap_err();
        assert_eq!(err.fallback_buffer(), Some(&buf[..]));
    }

    #[test]
    fn test_short_read_fallback() {
        let reg = IdentityRegistry::new();
        let buf = vec![0u8; 10];
        let err = parse_header(&reg, &buf).unwrap_err();
        assert_eq!(err.fallback_buffer(), Some(&buf[..]));
    }

    #[test]
    fn test_version_above_one_is_fallback() {
        let uuid = Uuid::new_v4();
        let reg = registry_with_user(uuid);
        let mut buf = vec![2u8];
        buf.extend_from_slice(uuid.as_bytes());
        let err = parse_header(&reg, &buf).unwrap_err();
        assert!(err.fallback_buffer().is_some());
    }

    #[test]
    fn test_crumfurs_requires_version_one() {
        let uuid = Uuid::new_v4();
        let reg = registry_with_user(uuid);
        let mut buf = vec![0x00u8];
        buf.extend_from_slice(uuid.as_bytes());
        buf.push(0x00);
        buf.push(CMD_CRUMFURS);
        assert!(parse_header(&reg, &buf).is_err());
    }

    #[test]
    fn test_crumfurs_version_one_accepted() {
        let uuid = Uuid::new_v4();
        let reg = registry_with_user(uuid);
        let mut buf = vec![0x01u8];
        buf.extend_from_slice(uuid.as_bytes());
        buf.push(CMD_CRUMFURS);
        let (parsed, _) = parse_header(&reg, &buf).unwrap();
        assert!(matches!(parsed.command, VlessCommand::Crumfurs));
    }

    #[test]
    fn test_mux_command_recognized() {
        let uuid = Uuid::new_v4();
        let reg = registry_with_user(uuid);
        let mut buf = vec![0x01u8];
        buf.extend_from_slice(uuid.as_bytes());
        buf.push(CMD_MUX);
        let (parsed, _) = parse_header(&reg, &buf).unwrap();
        match parsed.command {
            VlessCommand::Mux { addr, port } => {
                assert_eq!(addr, TargetAddr::Domain(MUX_TARGET_NAME.to_string()));
                assert_eq!(port, 0);
            }
            _ => panic!("expected Mux command"),
        }
    }

    #[test]
    fn test_crumfurs_table_weak_handle_expires_with_task() {
        let table = CrumfursTable::new();
        let uuid_bytes = [7u8; 16];
        {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let strong = rt.block_on(async {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                let connect = tokio::net::TcpStream::connect(addr);
                let accept = listener.accept();
                let (a, _) = tokio::join!(connect, accept);
                Arc::new(Mutex::new(a.unwrap()))
            });
            table.register(uuid_bytes, Arc::downgrade(&strong));
            assert!(table.get(&uuid_bytes).is_some());
        }
        // strong handle dropped with the block above
        assert!(table.get(&uuid_bytes).is_none());
    }

    #[test]
    fn test_encode_crumfurs_reply_with_length() {
        let addr = TargetAddr::Ipv4(Ipv4Addr::new(1, 2, 3, 4));
        let encoded = encode_crumfurs_reply(&addr, 53, b"abc", true);
        assert_eq!(encoded[0], ATYP_IPV4);
        assert_eq!(&encoded[1..5], &[1, 2, 3, 4]);
        assert_eq!(&encoded[5..7], &53u16.to_be_bytes());
        assert_eq!(&encoded[7..9], &3u16.to_be_bytes());
        assert_eq!(&encoded[9..], b"abc");
    }
}
