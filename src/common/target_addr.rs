//! Shared V-LESS / V-MESS address codec.
//!
//! Both protocols frame the dialed target the same way: a big-endian port
//! followed by a one-byte address type and the address itself. This differs
//! from the `atype` numbering `common::net::Address` uses for SOCKS5/HTTP
//! (`0x01` IPv4 / `0x03` domain / `0x04` IPv6), so it gets its own small
//! type rather than reusing `Address`.

use crate::{Error, Result};
use bytes::Buf;
use std::net::{Ipv4Addr, Ipv6Addr};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x02;
pub const ATYP_IPV6: u8 = 0x03;

/// A dialed target address, as carried in a V-LESS or V-MESS header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl TargetAddr {
    pub fn to_host(&self) -> String {
        match self {
            TargetAddr::Ipv4(ip) => ip.to_string(),
            TargetAddr::Ipv6(ip) => ip.to_string(),
            TargetAddr::Domain(d) => d.clone(),
        }
    }

    pub fn to_ip(&self) -> Option<std::net::IpAddr> {
        match self {
            TargetAddr::Ipv4(ip) => Some(std::net::IpAddr::V4(*ip)),
            TargetAddr::Ipv6(ip) => Some(std::net::IpAddr::V6(*ip)),
            TargetAddr::Domain(_) => None,
        }
    }
}

/// Read `port` (2 bytes, BE) then `atype` (1 byte) then the address, in that
/// order, matching the V-LESS/V-MESS wire layout. `buf` must already hold
/// the full header bytes; short reads are reported as `Error::protocol` so
/// callers can decide fallback/drain behavior themselves.
pub fn read_port_and_address(buf: &mut impl Buf) -> Result<(TargetAddr, u16)> {
    if buf.remaining() < 3 {
        return Err(Error::protocol("address header too short"));
    }
    let port = buf.get_u16();
    let atype = buf.get_u8();

    let addr = match atype {
        ATYP_IPV4 => {
            if buf.remaining() < 4 {
                return Err(Error::protocol("truncated IPv4 address"));
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            TargetAddr::Ipv4(Ipv4Addr::from(octets))
        }
        ATYP_IPV6 => {
            if buf.remaining() < 16 {
                return Err(Error::protocol("truncated IPv6 address"));
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            TargetAddr::Ipv6(Ipv6Addr::from(octets))
        }
        ATYP_DOMAIN => {
            if buf.remaining() < 1 {
                return Err(Error::protocol("missing domain length"));
            }
            let len = buf.get_u8() as usize;
            if buf.remaining() < len {
                return Err(Error::protocol("truncated domain"));
            }
            let mut bytes = vec![0u8; len];
            buf.copy_to_slice(&mut bytes);
            let domain = String::from_utf8(bytes)
                .map_err(|_| Error::protocol("domain is not valid UTF-8"))?;
            TargetAddr::Domain(domain)
        }
        other => return Err(Error::protocol(format!("unknown address type {}", other))),
    };

    Ok((addr, port))
}

/// Write `port` then `atype` then the address, mirroring
/// `read_port_and_address`. Used by the CRUMFURS UDP reply path and by
/// tests constructing wire fixtures.
pub fn write_port_and_address(buf: &mut Vec<u8>, addr: &TargetAddr, port: u16) {
    buf.extend_from_slice(&port.to_be_bytes());
    match addr {
        TargetAddr::Ipv4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        TargetAddr::Ipv6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
        TargetAddr::Domain(domain) => {
            buf.push(ATYP_DOMAIN);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_round_trip() {
        let mut wire = Vec::new();
        write_port_and_address(&mut wire, &TargetAddr::Ipv4(Ipv4Addr::new(1, 2, 3, 4)), 443);
        let mut cursor = &wire[..];
        let (addr, port) = read_port_and_address(&mut cursor).unwrap();
        assert_eq!(addr, TargetAddr::Ipv4(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(port, 443);
    }

    #[test]
    fn test_domain_round_trip() {
        let mut wire = Vec::new();
        write_port_and_address(&mut wire, &TargetAddr::Domain("example.com".into()), 80);
        let mut cursor = &wire[..];
        let (addr, port) = read_port_and_address(&mut cursor).unwrap();
        assert_eq!(addr, TargetAddr::Domain("example.com".into()));
        assert_eq!(port, 80);
    }

    #[test]
    fn test_ipv6_round_trip() {
        let ip = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let mut wire = Vec::new();
        write_port_and_address(&mut wire, &TargetAddr::Ipv6(ip), 8443);
        let mut cursor = &wire[..];
        let (addr, port) = read_port_and_address(&mut cursor).unwrap();
        assert_eq!(addr, TargetAddr::Ipv6(ip));
        assert_eq!(port, 8443);
    }

    #[test]
    fn test_short_buffer_is_protocol_error() {
        let mut cursor = &[0u8, 1][..];
        assert!(read_port_and_address(&mut cursor).is_err());
    }

    #[test]
    fn test_unknown_atype_is_protocol_error() {
        let wire = [0x00, 0x50, 0x09];
        let mut cursor = &wire[..];
        assert!(read_port_and_address(&mut cursor).is_err());
    }
}
