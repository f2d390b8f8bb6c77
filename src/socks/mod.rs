//! Hand-rolled pieces of the SOCKS protocol family
//!
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [SOCKS4](https://www.openssh.com/txt/socks4.protocol) and
//!   [SOCKS4a](https://www.openssh.com/txt/socks4a.protocol)
//!
//! The SOCKS5 *client* is provided by `fast-socks5`
//! (see [`SocksProtocol`](crate::connect)); SOCKS4/4a client and the SOCKS5
//! *server* used by local bridges live here.

use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr},
};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{connect::NetworkTarget, parse::join_host_port};

pub mod server;
pub mod socks4;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const SOCKS4_VERSION: u8 = 0x04;
pub const CMD_CONNECT: u8 = 0x01;

// RSV: Fields marked RESERVED (RSV) must be set to X'00'.
pub const RSV: u8 = 0x00;

/// SOCKS5 authentication methods
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UserPass = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 address types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

impl AddressType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::IPv4),
            0x03 => Some(Self::DomainName),
            0x04 => Some(Self::IPv6),
            _ => None,
        }
    }
}

/// SOCKS5 reply field
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    ServerFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddrTypeUnsupported = 0x08,
}

impl ReplyCode {
    /// Closest reply for a failed upstream connect
    pub fn from_io_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::HostUnreachable => Self::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => Self::NetworkUnreachable,
            io::ErrorKind::PermissionDenied => Self::ConnectionNotAllowed,
            io::ErrorKind::TimedOut => Self::TtlExpired,
            _ => Self::ServerFailure,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("Input/Output fail")]
    Io(#[from] io::Error),

    #[error("Unsupported SOCKS version {0}")]
    UnsupportedVersion(u8),

    #[error("Client offered no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("Unsupported SOCKS command {0}")]
    UnsupportedCommand(u8),

    #[error("Unsupported SOCKS address type {0}")]
    UnsupportedAddressType(u8),

    #[error("Destination domain is not valid UTF-8")]
    InvalidDomain,

    #[error("SOCKS handshake timed out")]
    HandshakeTimeout,

    #[error("Destination domain is {0} bytes, at most 255 fit")]
    DomainTooLong(usize),
}

/// Target parsed out of a SOCKS5 request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Ipv4(Ipv4Addr, u16),
    Domain(String, u16),
    Ipv6(Ipv6Addr, u16),
}

impl Destination {
    pub fn address_type(&self) -> AddressType {
        match self {
            Destination::Ipv4(..) => AddressType::IPv4,
            Destination::Domain(..) => AddressType::DomainName,
            Destination::Ipv6(..) => AddressType::IPv6,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Destination::Ipv4(ip, _) => ip.to_string(),
            Destination::Domain(domain, _) => domain.clone(),
            Destination::Ipv6(ip, _) => ip.to_string(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Destination::Ipv4(_, port)
            | Destination::Domain(_, port)
            | Destination::Ipv6(_, port) => *port,
        }
    }

    /// Reads `DST.ADDR | DST.PORT` for an already consumed `ATYP`
    pub async fn read_from<R>(reader: &mut R, address_type: AddressType) -> Result<Self, SocksError>
    where
        R: AsyncRead + Unpin,
    {
        let destination = match address_type {
            AddressType::IPv4 => {
                let mut addr = [0u8; 4];
                reader.read_exact(&mut addr).await?;
                Destination::Ipv4(Ipv4Addr::from(addr), read_port(reader).await?)
            }
            AddressType::DomainName => {
                // First octet holds the number of octets to follow
                let len = reader.read_u8().await?;
                let mut domain = vec![0u8; len as usize];
                reader.read_exact(&mut domain).await?;
                let domain = String::from_utf8(domain).map_err(|_| SocksError::InvalidDomain)?;
                Destination::Domain(domain, read_port(reader).await?)
            }
            AddressType::IPv6 => {
                let mut addr = [0u8; 16];
                reader.read_exact(&mut addr).await?;
                Destination::Ipv6(Ipv6Addr::from(addr), read_port(reader).await?)
            }
        };
        Ok(destination)
    }

    /// SOCKS5 address encoding: `ATYP | DST.ADDR | DST.PORT`
    pub fn encode(&self) -> Result<Vec<u8>, SocksError> {
        let mut buf = Vec::with_capacity(22);
        buf.push(self.address_type() as u8);
        match self {
            Destination::Ipv4(ip, _) => buf.extend_from_slice(&ip.octets()),
            Destination::Domain(domain, _) => {
                let len = u8::try_from(domain.len())
                    .map_err(|_| SocksError::DomainTooLong(domain.len()))?;
                buf.push(len);
                buf.extend_from_slice(domain.as_bytes());
            }
            Destination::Ipv6(ip, _) => buf.extend_from_slice(&ip.octets()),
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
        Ok(buf)
    }
}

async fn read_port<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<u16> {
    reader.read_u16().await
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&join_host_port(&self.host(), self.port()))
    }
}

impl From<Destination> for NetworkTarget {
    fn from(destination: Destination) -> Self {
        match destination {
            Destination::Ipv4(ip, port) => NetworkTarget::IPAddr {
                socket: (ip, port).into(),
            },
            Destination::Ipv6(ip, port) => NetworkTarget::IPAddr {
                socket: (ip, port).into(),
            },
            Destination::Domain(domain, port) => NetworkTarget::Domain { domain, port },
        }
    }
}

impl From<&NetworkTarget> for Destination {
    fn from(target: &NetworkTarget) -> Self {
        match target {
            NetworkTarget::IPAddr { socket } => match socket.ip() {
                std::net::IpAddr::V4(ip) => Destination::Ipv4(ip, socket.port()),
                std::net::IpAddr::V6(ip) => Destination::Ipv6(ip, socket.port()),
            },
            NetworkTarget::Domain { domain, port } => Destination::Domain(domain.clone(), *port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_each_address_type() {
        let mut input: &[u8] = &[10, 0, 0, 7, 0x1F, 0x90];
        let dest = Destination::read_from(&mut input, AddressType::IPv4)
            .await
            .unwrap();
        assert_eq!(dest, Destination::Ipv4(Ipv4Addr::new(10, 0, 0, 7), 8080));

        let mut input = vec![11u8];
        input.extend_from_slice(b"example.com");
        input.extend_from_slice(&443u16.to_be_bytes());
        let dest = Destination::read_from(&mut input.as_slice(), AddressType::DomainName)
            .await
            .unwrap();
        assert_eq!(dest.host(), "example.com");
        assert_eq!(dest.port(), 443);

        let mut input = Ipv6Addr::LOCALHOST.octets().to_vec();
        input.extend_from_slice(&53u16.to_be_bytes());
        let dest = Destination::read_from(&mut input.as_slice(), AddressType::IPv6)
            .await
            .unwrap();
        assert_eq!(dest.to_string(), "[::1]:53");
    }

    #[tokio::test]
    async fn truncated_address_is_an_error() {
        let mut input: &[u8] = &[5, b'a', b'b'];
        let err = Destination::read_from(&mut input, AddressType::DomainName)
            .await
            .unwrap_err();
        assert!(matches!(err, SocksError::Io(_)));
    }

    #[test]
    fn encodes_domain() {
        let dest = Destination::Domain("a.io".to_owned(), 80);
        assert_eq!(dest.encode().unwrap(), vec![3, 4, b'a', b'.', b'i', b'o', 0, 80]);
    }

    #[test]
    fn overlong_domain_is_not_truncated() {
        let longest = Destination::Domain("a".repeat(255), 443);
        assert_eq!(longest.encode().unwrap()[1], 255);

        let overlong = Destination::Domain("a".repeat(256), 443);
        assert!(matches!(overlong.encode(), Err(SocksError::DomainTooLong(256))));
    }
}
