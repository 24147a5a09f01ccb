//! V-MESS AEAD header codec (C5): opens the client's encrypted request
//! header and seals the server's response prelude.
//!
//! Wire layout of the request header, following the 16-byte AuthID already
//! consumed by the caller: an 18-byte length-AEAD block (2-byte plaintext
//! length + 16-byte tag, AAD = AuthID), an 8-byte connection nonce, then a
//! `length + 16`-byte payload-AEAD block (AAD = AuthID). Both AEAD keys/IVs
//! are derived from the user's command key, the AuthID, and the connection
//! nonce via the nested KDF in [`super::kdf`].
//!
//! The response prelude has the same two-AEAD-block shape but with no
//! AuthID/nonce prefix and an empty AAD, since by the time the server
//! writes it the session is already bound to a specific connection.

use super::chunk::Security;
use super::kdf;
use crate::common::target_addr::{read_port_and_address, TargetAddr};
use crate::{Error, Result};
use aes_gcm::{
    aead::{Aead, Payload},
    Aes128Gcm, Nonce,
};
use aes_gcm::aead::KeyInit;
use bytes::Buf;
use sha2::{Digest, Sha256};

pub const CMD_TCP: u8 = 1;
pub const CMD_UDP: u8 = 2;

/// Option bit: chunk framing (length-prefixed, authenticated frames) applies
/// to the body. If unset, the body is a transparent byte stream.
pub const OPT_CHUNK_STREAM: u8 = 0x01;

/// A fully decoded, authenticated V-MESS request header.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub version: u8,
    pub req_body_iv: [u8; 16],
    pub req_body_key: [u8; 16],
    pub resp_v: u8,
    pub opt: u8,
    pub security: Security,
    pub cmd: u8,
    pub addr: TargetAddr,
    pub port: u16,
}

fn length_aead(cmd_key: &[u8; 16], auth_id: &[u8; 16], nonce: &[u8; 8]) -> Result<Aes128Gcm> {
    let key = kdf::kdf16(
        cmd_key,
        &[kdf::SALT_HEADER_PAYLOAD_LENGTH_AEAD_KEY, auth_id, nonce],
    );
    Aes128Gcm::new_from_slice(&key).map_err(|e| Error::crypto(e.to_string()))
}

fn length_nonce(cmd_key: &[u8; 16], auth_id: &[u8; 16], nonce: &[u8; 8]) -> [u8; 12] {
    let full = kdf::kdf(
        cmd_key,
        &[kdf::SALT_HEADER_PAYLOAD_LENGTH_AEAD_IV, auth_id, nonce],
    );
    full[..12].try_into().unwrap()
}

fn payload_aead(cmd_key: &[u8; 16], auth_id: &[u8; 16], nonce: &[u8; 8]) -> Result<Aes128Gcm> {
    let key = kdf::kdf16(cmd_key, &[kdf::SALT_HEADER_PAYLOAD_AEAD_KEY, auth_id, nonce]);
    Aes128Gcm::new_from_slice(&key).map_err(|e| Error::crypto(e.to_string()))
}

fn payload_nonce(cmd_key: &[u8; 16], auth_id: &[u8; 16], nonce: &[u8; 8]) -> [u8; 12] {
    let full = kdf::kdf(cmd_key, &[kdf::SALT_HEADER_PAYLOAD_AEAD_IV, auth_id, nonce]);
    full[..12].try_into().unwrap()
}

/// 32-bit FNV-1a, matching the outbound side's own `fnv1a_hash`.
fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in data {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

fn decrypt_length(
    cmd_key: &[u8; 16],
    auth_id: &[u8; 16],
    nonce: &[u8; 8],
    length_ct: &[u8; 18],
) -> Result<usize> {
    let length_cipher = length_aead(cmd_key, auth_id, nonce)?;
    let length_n = length_nonce(cmd_key, auth_id, nonce);
    let length_pt = length_cipher
        .decrypt(
            Nonce::from_slice(&length_n),
            Payload {
                msg: length_ct.as_slice(),
                aad: auth_id,
            },
        )
        .map_err(|_| Error::vmess_drain("length AEAD open failed", true))?;

    if length_pt.len() != 2 {
        return Err(Error::vmess_drain("length AEAD yielded bad plaintext", true));
    }
    Ok(u16::from_be_bytes([length_pt[0], length_pt[1]]) as usize)
}

fn decrypt_payload(
    cmd_key: &[u8; 16],
    auth_id: &[u8; 16],
    nonce: &[u8; 8],
    payload_ct: &[u8],
) -> Result<Vec<u8>> {
    let payload_cipher = payload_aead(cmd_key, auth_id, nonce)?;
    let payload_n = payload_nonce(cmd_key, auth_id, nonce);
    // should_drain=false: the length AEAD already succeeded, so a failure
    // here is past the point the protocol asks the caller to drain for.
    payload_cipher
        .decrypt(
            Nonce::from_slice(&payload_n),
            Payload {
                msg: payload_ct,
                aad: auth_id,
            },
        )
        .map_err(|_| Error::vmess_drain("payload AEAD open failed", false))
}

/// Open the client's request header. `auth_id` is the already-matched
/// 16-byte AuthID ciphertext (used verbatim as AAD, per the protocol).
/// `remain` must contain at least the full header: the length-AEAD block,
/// the connection nonce, and the payload-AEAD block.
///
/// Only failures up through the length-AEAD open set `should_drain`: once
/// the length AEAD has authenticated, the caller already knows this is (or
/// was) a live handshake attempt, so a payload-AEAD failure, bad checksum,
/// or unsupported command is reported as a plain error instead of a
/// drain-worthy one.
pub fn open_request_header(
    cmd_key: &[u8; 16],
    auth_id: &[u8; 16],
    remain: &mut impl Buf,
) -> Result<RequestHeader> {
    if remain.remaining() < 18 + 8 {
        return Err(Error::vmess_drain("truncated header prefix", true));
    }

    let mut length_ct = [0u8; 18];
    remain.copy_to_slice(&mut length_ct);

    let mut nonce = [0u8; 8];
    remain.copy_to_slice(&mut nonce);

    let payload_len = decrypt_length(cmd_key, auth_id, &nonce, &length_ct)?;

    if remain.remaining() < payload_len + 16 {
        return Err(Error::vmess_drain("truncated header payload", false));
    }
    let mut payload_ct = vec![0u8; payload_len + 16];
    remain.copy_to_slice(&mut payload_ct);

    let aead_data = decrypt_payload(cmd_key, auth_id, &nonce, &payload_ct)?;
    parse_aead_data(&aead_data)
}

/// Same as [`open_request_header`] but reads the staged blocks directly off
/// an `AsyncRead`, since the payload-AEAD block's length isn't known until
/// the length-AEAD block has been opened.
pub async fn open_request_header_from_stream<S>(
    cmd_key: &[u8; 16],
    auth_id: &[u8; 16],
    stream: &mut S,
) -> Result<RequestHeader>
where
    S: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut prefix = [0u8; 18 + 8];
    stream
        .read_exact(&mut prefix)
        .await
        .map_err(|e| Error::vmess_drain(format!("short header prefix: {}", e), true))?;

    let mut length_ct = [0u8; 18];
    length_ct.copy_from_slice(&prefix[..18]);
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&prefix[18..]);

    let payload_len = decrypt_length(cmd_key, auth_id, &nonce, &length_ct)?;

    let mut payload_ct = vec![0u8; payload_len + 16];
    stream
        .read_exact(&mut payload_ct)
        .await
        .map_err(|e| Error::vmess_drain(format!("short header payload: {}", e), false))?;

    let aead_data = decrypt_payload(cmd_key, auth_id, &nonce, &payload_ct)?;
    parse_aead_data(&aead_data)
}

fn parse_aead_data(aead_data: &[u8]) -> Result<RequestHeader> {
    // version(1) + body_iv(16) + body_key(16) + resp_v(1) + opt(1) +
    // security/padding(1) + reserved(1) + cmd(1) = 38 bytes minimum, plus a
    // trailing 4-byte checksum.
    if aead_data.len() < 38 + 4 {
        return Err(Error::protocol("VMess header too short"));
    }

    let version = aead_data[0];
    let mut req_body_iv = [0u8; 16];
    req_body_iv.copy_from_slice(&aead_data[1..17]);
    let mut req_body_key = [0u8; 16];
    req_body_key.copy_from_slice(&aead_data[17..33]);
    let resp_v = aead_data[33];
    let opt = aead_data[34];
    let security = Security::try_from(aead_data[35] & 0x0f)?;
    let padding_len = (aead_data[35] >> 4) as usize;
    let cmd = aead_data[37];

    let body_end = aead_data.len() - 4;
    let checksum_expected = u32::from_be_bytes(aead_data[body_end..].try_into().unwrap());
    let checksum_actual = fnv1a(&aead_data[..body_end]);
    if checksum_actual != checksum_expected {
        return Err(Error::protocol("VMess header checksum mismatch"));
    }

    let mut cursor = &aead_data[38..body_end];
    let (addr, port) = match cmd {
        CMD_TCP | CMD_UDP => read_port_and_address(&mut cursor)?,
        other => return Err(Error::unsupported(format!("VMess command {}", other))),
    };
    if cursor.remaining() < padding_len {
        return Err(Error::protocol("VMess header padding longer than remaining bytes"));
    }

    Ok(RequestHeader {
        version,
        req_body_iv,
        req_body_key,
        resp_v,
        opt,
        security,
        cmd,
        addr,
        port,
    })
}

/// SHA-256(key)[:16], used to derive the response body key/IV from the
/// request body key/IV.
fn derive_resp_key_or_iv(input: &[u8; 16]) -> [u8; 16] {
    let digest = Sha256::digest(input);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// Build the server's response prelude, written eagerly once the request
/// header has been authenticated (not lazily on first body write).
pub fn seal_response_header(req: &RequestHeader) -> Result<Vec<u8>> {
    let resp_body_key = derive_resp_key_or_iv(&req.req_body_key);
    let resp_body_iv = derive_resp_key_or_iv(&req.req_body_iv);

    let length_key = kdf::kdf16(&resp_body_key, &[kdf::SALT_AEAD_RESP_HEADER_LEN_KEY]);
    let length_iv: [u8; 12] = kdf::kdf(&resp_body_key, &[kdf::SALT_AEAD_RESP_HEADER_LEN_IV])[..12]
        .try_into()
        .unwrap();
    let payload_key = kdf::kdf16(&resp_body_key, &[kdf::SALT_AEAD_RESP_HEADER_PAYLOAD_KEY]);
    let payload_iv: [u8; 12] =
        kdf::kdf(&resp_body_key, &[kdf::SALT_AEAD_RESP_HEADER_PAYLOAD_IV])[..12]
            .try_into()
            .unwrap();

    let plaintext = [req.resp_v, 0x00, 0x00, 0x00];

    let length_cipher =
        Aes128Gcm::new_from_slice(&length_key).map_err(|e| Error::crypto(e.to_string()))?;
    let length_ct = length_cipher
        .encrypt(Nonce::from_slice(&length_iv), (plaintext.len() as u16).to_be_bytes().as_ref())
        .map_err(|e| Error::crypto(e.to_string()))?;

    let payload_cipher =
        Aes128Gcm::new_from_slice(&payload_key).map_err(|e| Error::crypto(e.to_string()))?;
    let payload_ct = payload_cipher
        .encrypt(Nonce::from_slice(&payload_iv), plaintext.as_ref())
        .map_err(|e| Error::crypto(e.to_string()))?;

    let mut out = Vec::with_capacity(length_ct.len() + payload_ct.len());
    out.extend_from_slice(&length_ct);
    out.extend_from_slice(&payload_ct);

    let _ = resp_body_iv; // body IV feeds the response ChunkWriter, not this prelude
    Ok(out)
}

/// The response body key/IV, derived the same way [`seal_response_header`]
/// derives its AEAD keys, for use by the response `ChunkWriter`.
pub fn response_body_key_iv(req: &RequestHeader) -> ([u8; 16], [u8; 16]) {
    (
        derive_resp_key_or_iv(&req.req_body_key),
        derive_resp_key_or_iv(&req.req_body_iv),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::vmess::authid;
    use bytes::BytesMut;

    fn sample_aead_data_with_opt(
        cmd: u8,
        addr: &TargetAddr,
        port: u16,
        padding: usize,
        opt: u8,
    ) -> Vec<u8> {
        let mut body = vec![0u8; 38];
        body[0] = 1; // version
        body[1..17].copy_from_slice(&[2u8; 16]); // req_body_iv
        body[17..33].copy_from_slice(&[3u8; 16]); // req_body_key
        body[33] = 7; // resp_v
        body[34] = opt;
        body[35] = ((padding as u8) << 4) | 0x03; // padding_len | Aes128Gcm
        body[36] = 0; // reserved
        body[37] = cmd;

        let mut addr_bytes = Vec::new();
        crate::common::target_addr::write_port_and_address(&mut addr_bytes, addr, port);
        body.extend_from_slice(&addr_bytes);
        body.extend(std::iter::repeat(0u8).take(padding));

        let checksum = fnv1a(&body);
        body.extend_from_slice(&checksum.to_be_bytes());
        body
    }

    fn sample_aead_data(cmd: u8, addr: &TargetAddr, port: u16, padding: usize) -> Vec<u8> {
        sample_aead_data_with_opt(cmd, addr, port, padding, OPT_CHUNK_STREAM)
    }

    fn seal_request(cmd_key: &[u8; 16], auth_id: &[u8; 16], aead_data: &[u8]) -> BytesMut {
        let nonce = [5u8; 8];

        let length_cipher = length_aead(cmd_key, auth_id, &nonce).unwrap();
        let length_n = length_nonce(cmd_key, auth_id, &nonce);
        let length_ct = length_cipher
            .encrypt(
                Nonce::from_slice(&length_n),
                Payload {
                    msg: &(aead_data.len() as u16).to_be_bytes(),
                    aad: auth_id,
                },
            )
            .unwrap();

        let payload_cipher = payload_aead(cmd_key, auth_id, &nonce).unwrap();
        let payload_n = payload_nonce(cmd_key, auth_id, &nonce);
        let payload_ct = payload_cipher
            .encrypt(
                Nonce::from_slice(&payload_n),
                Payload {
                    msg: aead_data,
                    aad: auth_id,
                },
            )
            .unwrap();

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&length_ct);
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&payload_ct);
        wire
    }

    #[test]
    fn test_open_request_header_round_trip_tcp() {
        let cmd_key = [9u8; 16];
        let auth_id = authid::create_auth_id_with_random(&cmd_key, 1_700_000_000, [1, 2, 3, 4]);

        let addr = TargetAddr::Domain("example.com".into());
        let aead_data = sample_aead_data(CMD_TCP, &addr, 443, 0);
        let mut wire = seal_request(&cmd_key, &auth_id, &aead_data);

        let header = open_request_header(&cmd_key, &auth_id, &mut wire).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.cmd, CMD_TCP);
        assert_eq!(header.addr, addr);
        assert_eq!(header.port, 443);
        assert_eq!(header.security, Security::Aes128Gcm);
    }

    #[test]
    fn test_open_request_header_with_padding() {
        let cmd_key = [4u8; 16];
        let auth_id = authid::create_auth_id_with_random(&cmd_key, 1_700_000_000, [9, 9, 9, 9]);
        let addr = TargetAddr::Ipv4(std::net::Ipv4Addr::new(10, 0, 0, 1));
        let aead_data = sample_aead_data(CMD_UDP, &addr, 53, 6);
        let mut wire = seal_request(&cmd_key, &auth_id, &aead_data);

        let header = open_request_header(&cmd_key, &auth_id, &mut wire).unwrap();
        assert_eq!(header.cmd, CMD_UDP);
        assert_eq!(header.port, 53);
    }

    #[test]
    fn test_open_request_header_rejects_wrong_key() {
        let cmd_key = [9u8; 16];
        let wrong_key = [8u8; 16];
        let auth_id = authid::create_auth_id_with_random(&cmd_key, 1_700_000_000, [1, 2, 3, 4]);
        let addr = TargetAddr::Domain("example.com".into());
        let aead_data = sample_aead_data(CMD_TCP, &addr, 443, 0);
        let mut wire = seal_request(&cmd_key, &auth_id, &aead_data);

        let err = open_request_header(&wrong_key, &auth_id, &mut wire).unwrap_err();
        assert!(err.should_drain());
    }

    #[test]
    fn test_checksum_mismatch_is_rejected_without_drain() {
        let cmd_key = [9u8; 16];
        let auth_id = authid::create_auth_id_with_random(&cmd_key, 1_700_000_000, [1, 2, 3, 4]);
        let addr = TargetAddr::Domain("example.com".into());
        let mut aead_data = sample_aead_data(CMD_TCP, &addr, 443, 0);
        let last = aead_data.len() - 1;
        aead_data[last] ^= 0xff;
        let mut wire = seal_request(&cmd_key, &auth_id, &aead_data);

        let err = open_request_header(&cmd_key, &auth_id, &mut wire).unwrap_err();
        assert!(!err.should_drain());
    }

    #[test]
    fn test_opt_byte_round_trips() {
        let cmd_key = [2u8; 16];
        let auth_id = authid::create_auth_id_with_random(&cmd_key, 1_700_000_000, [4, 3, 2, 1]);
        let addr = TargetAddr::Domain("example.com".into());

        let aead_data = sample_aead_data_with_opt(CMD_TCP, &addr, 443, 0, 0);
        let mut wire = seal_request(&cmd_key, &auth_id, &aead_data);
        let header = open_request_header(&cmd_key, &auth_id, &mut wire).unwrap();
        assert_eq!(header.opt, 0);
        assert_eq!(header.opt & OPT_CHUNK_STREAM, 0);

        let aead_data = sample_aead_data_with_opt(CMD_TCP, &addr, 443, 0, OPT_CHUNK_STREAM);
        let mut wire = seal_request(&cmd_key, &auth_id, &aead_data);
        let header = open_request_header(&cmd_key, &auth_id, &mut wire).unwrap();
        assert_eq!(header.opt & OPT_CHUNK_STREAM, OPT_CHUNK_STREAM);
    }

    #[test]
    fn test_response_header_round_trip_lengths() {
        let cmd_key = [1u8; 16];
        let auth_id = authid::create_auth_id_with_random(&cmd_key, 1_700_000_000, [0, 0, 0, 1]);
        let addr = TargetAddr::Domain("example.com".into());
        let aead_data = sample_aead_data(CMD_TCP, &addr, 443, 0);
        let mut wire = seal_request(&cmd_key, &auth_id, &aead_data);
        let header = open_request_header(&cmd_key, &auth_id, &mut wire).unwrap();

        let resp = seal_response_header(&header).unwrap();
        assert_eq!(resp.len(), 18 + (4 + 16));
    }
}
