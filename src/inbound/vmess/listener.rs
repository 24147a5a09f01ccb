//! V-MESS inbound listener: accepts TCP connections, authenticates the
//! AuthID, opens the request header, and relays the proxied body.

use super::authid;
use super::header::{self, CMD_TCP, CMD_UDP};
use super::session::VmessSession;
use crate::common::identity::IdentityRegistry;
use crate::common::Metadata;
use crate::config::VmessInboundConfig;
use crate::tunnel::Tunnel;
use crate::{Error, Result};
use md5::{Digest, Md5};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Magic suffix mixed into a user's UUID to derive their command key,
/// matching the outbound side's own `derive_key`.
const CMD_KEY_MAGIC: &[u8] = b"c48619fe-8f02-49e0-b9e9-edf763e17e21";

/// How long to keep reading and discarding bytes from a connection whose
/// handshake failed in a way that should not be distinguishable from a
/// healthy-but-slow client.
const DRAIN_DURATION: Duration = Duration::from_secs(2);

/// Bound on the entire handshake read path (AuthID through request header),
/// matching VLESS's own handshake deadline: a client that opens a connection
/// and trickles bytes (or never writes at all) must not hold the task open
/// indefinitely.
const HANDSHAKE_READ_DEADLINE: Duration = Duration::from_secs(4);

/// Hashes the canonical hyphenated UUID text, not the raw 16 bytes: this
/// differs from the outbound dialer's own `derive_key`, which is keying
/// against a server that expects the text form here.
fn derive_cmd_key(uuid: &Uuid) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(uuid.hyphenated().to_string().as_bytes());
    hasher.update(CMD_KEY_MAGIC);
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest);
    key
}

pub struct VmessListener {
    config: VmessInboundConfig,
    tunnel: Arc<Tunnel>,
    identity: Arc<IdentityRegistry>,
    running: AtomicBool,
}

impl VmessListener {
    pub fn new(config: VmessInboundConfig, tunnel: Arc<Tunnel>) -> Result<Self> {
        let identity = Arc::new(IdentityRegistry::new());
        for uuid_str in &config.users {
            let uuid = Uuid::parse_str(uuid_str)
                .map_err(|e| Error::config(format!("Invalid VMess user UUID {}: {}", uuid_str, e)))?;
            let cmd_key = derive_cmd_key(&uuid);
            identity.add_user(uuid, authid::auth_id_cipher(&cmd_key));
        }

        Ok(VmessListener {
            config,
            tunnel,
            identity,
            running: AtomicBool::new(false),
        })
    }

    async fn handle_connection(
        identity: Arc<IdentityRegistry>,
        tunnel: Arc<Tunnel>,
        mut stream: TcpStream,
        peer_addr: std::net::SocketAddr,
    ) {
        match Self::process_connection(&identity, &tunnel, &mut stream, peer_addr).await {
            Ok(()) => {}
            Err(e) if e.should_drain() => {
                warn!("VMess handshake failed from {}: {} (draining)", peer_addr, e);
                Self::drain(&mut stream).await;
            }
            Err(e) => {
                debug!("VMess connection error from {}: {}", peer_addr, e);
            }
        }
    }

    /// Read and discard whatever the client sends for a bounded window,
    /// rather than closing the socket the instant auth fails.
    async fn drain(stream: &mut TcpStream) {
        let mut buf = [0u8; 4096];
        let deadline = tokio::time::Instant::now() + DRAIN_DURATION;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, stream.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => continue,
                _ => break,
            }
        }
    }

    async fn process_connection(
        identity: &IdentityRegistry,
        tunnel: &Tunnel,
        stream: &mut TcpStream,
        peer_addr: std::net::SocketAddr,
    ) -> Result<()> {
        let mut auth_id = [0u8; 16];
        match tokio::time::timeout(HANDSHAKE_READ_DEADLINE, stream.read_exact(&mut auth_id)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(Error::vmess_drain(format!("short AuthID read: {}", e), true)),
            Err(_) => return Err(Error::vmess_drain("AuthID read deadline exceeded", true)),
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let matched = identity.scan_auth_id(&auth_id, |cipher, ciphertext| {
            authid::try_match_auth_id(cipher, ciphertext, now).map(|_time| [0u8; 16])
        });
        let user = match matched {
            Some((user, _)) => user,
            None => return Err(Error::vmess_drain("no user matched AuthID", true)),
        };

        let cmd_key = derive_cmd_key(&user.uuid);
        let req = match tokio::time::timeout(
            HANDSHAKE_READ_DEADLINE,
            header::open_request_header_from_stream(&cmd_key, &auth_id, stream),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(Error::vmess_drain("request header read deadline exceeded", true)),
        };

        if req.cmd != CMD_TCP && req.cmd != CMD_UDP {
            return Err(Error::unsupported(format!("VMess command {}", req.cmd)));
        }

        let resp_prelude = header::seal_response_header(&req)?;

        let host = req.addr.to_host();
        debug!(
            "VMess {} -> {}:{} (user {})",
            peer_addr, host, req.port, user.uuid
        );

        let mut metadata = Metadata::tcp()
            .with_source(peer_addr)
            .with_host(host.clone())
            .with_dst_port(req.port);
        if let Some(ip) = req.addr.to_ip() {
            metadata = metadata.with_dst_ip(ip);
        }

        let (mut remote, _conn_id) = tunnel.handle_tcp_with_dialer(&metadata).await?;

        {
            use tokio::io::AsyncWriteExt;
            stream
                .write_all(&resp_prelude)
                .await
                .map_err(|e| Error::io_error(e.to_string()))?;
        }

        let mut session = VmessSession::new(stream, &req)?;
        let (sent, received) =
            crate::common::net::copy_bidirectional(&mut session, &mut remote).await?;
        debug!(
            "VMess {} -> {}:{} completed (sent: {}, received: {})",
            peer_addr, host, req.port, sent, received
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl super::super::InboundListener for VmessListener {
    fn name(&self) -> &str {
        "VMess"
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        let addr = listener.local_addr()?;
        info!("VMess proxy listening on {}", addr);

        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let identity = self.identity.clone();
                    let tunnel = self.tunnel.clone();
                    tokio::spawn(async move {
                        Self::handle_connection(identity, tunnel, stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        error!("VMess accept error: {}", e);
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

    #[test]
    fn test_derive_cmd_key_is_deterministic() {
        let uuid = Uuid::new_v4();
        assert_eq!(derive_cmd_key(&uuid), derive_cmd_key(&uuid));
    }

    #[test]
    fn test_derive_cmd_key_differs_per_user() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(derive_cmd_key(&a), derive_cmd_key(&b));
    }
}
