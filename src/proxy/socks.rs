//! SOCKS5 server-side wire protocol (RFC 1928)
//!
//! Greeting negotiation, CONNECT request parsing and reply encoding for the
//! downstream side, plus the target-address encoder shared with the SOCKS5
//! upstream dialer.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RevolveError};

pub const SOCKS_VERSION: u8 = 0x05;

pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_USERPASS: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCESS: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Target requested by a SOCKS5 client
///
/// The host is an IPv4 dotted quad, a bracketless canonical IPv6 literal, or
/// a DNS name of at most 255 octets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Read the client greeting and answer method selection
///
/// Accepts only the no-authentication method; anything else is answered with
/// `0xFF` and rejected.
pub async fn negotiate<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(RevolveError::ClientProtocol(format!(
            "bad SOCKS version: {:#04x}",
            head[0]
        )));
    }

    let nmethods = head[1] as usize;
    let mut methods = [0u8; 255];
    stream.read_exact(&mut methods[..nmethods]).await?;

    if methods[..nmethods].contains(&AUTH_NONE) {
        stream.write_all(&[SOCKS_VERSION, AUTH_NONE]).await?;
        Ok(())
    } else {
        let _ = stream.write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE]).await;
        Err(RevolveError::ClientProtocol(
            "no acceptable auth method".to_string(),
        ))
    }
}

/// Read a CONNECT request and assemble the canonical target
pub async fn read_request<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(RevolveError::ClientProtocol(format!(
            "bad SOCKS version: {:#04x}",
            head[0]
        )));
    }
    if head[1] != CMD_CONNECT {
        return Err(RevolveError::CommandNotSupported(head[1]));
    }

    let host = match head[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let len = len[0] as usize;
            if len == 0 {
                return Err(RevolveError::ClientProtocol(
                    "empty domain name".to_string(),
                ));
            }
            let mut domain = [0u8; 255];
            stream.read_exact(&mut domain[..len]).await?;
            String::from_utf8(domain[..len].to_vec()).map_err(|_| {
                RevolveError::ClientProtocol("domain name is not valid UTF-8".to_string())
            })?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        other => return Err(RevolveError::AddressTypeNotSupported(other)),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    Ok(TargetAddr {
        host,
        port: u16::from_be_bytes(port),
    })
}

/// Write a SOCKS5 reply, carrying the upstream bind address when known
///
/// Without a bind address the reply falls back to `0.0.0.0:0`.
pub async fn write_reply<S>(stream: &mut S, reply: u8, bind: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut resp = [0u8; 22];
    resp[0] = SOCKS_VERSION;
    resp[1] = reply;

    let len = match bind {
        Some(addr) => match addr.ip() {
            IpAddr::V4(ip) => {
                resp[3] = ATYP_IPV4;
                resp[4..8].copy_from_slice(&ip.octets());
                resp[8..10].copy_from_slice(&addr.port().to_be_bytes());
                10
            }
            IpAddr::V6(ip) => {
                resp[3] = ATYP_IPV6;
                resp[4..20].copy_from_slice(&ip.octets());
                resp[20..22].copy_from_slice(&addr.port().to_be_bytes());
                22
            }
        },
        None => {
            resp[3] = ATYP_IPV4;
            // Address and port stay zeroed.
            10
        }
    };

    stream.write_all(&resp[..len]).await?;
    Ok(())
}

/// Append ATYP + address + port for a target, as sent to a SOCKS5 upstream
///
/// IP literals are encoded in binary; everything else goes out as a domain
/// name, which must fit in 255 octets.
pub fn encode_target(host: &str, port: u16, out: &mut Vec<u8>) -> Result<()> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        match ip {
            IpAddr::V4(v4) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&v6.octets());
            }
        }
    } else {
        if host.len() > 255 {
            return Err(RevolveError::ClientProtocol(
                "target hostname too long".to_string(),
            ));
        }
        out.push(ATYP_DOMAIN);
        out.push(host.len() as u8);
        out.extend_from_slice(host.as_bytes());
    }
    out.extend_from_slice(&port.to_be_bytes());
    Ok(())
}
