//! SOCKS4 / SOCKS4a client
//!
//! SOCKS4 only carries IPv4 destinations. SOCKS4a sends the `0.0.0.1`
//! marker address followed by a NUL terminated hostname and lets the proxy
//! resolve it.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{CMD_CONNECT, SOCKS4_VERSION};
use crate::connect::{BoxedStream, ConnectError, NetworkTarget, ProxyProto};

pub const REQUEST_GRANTED: u8 = 0x5A;

const SOCKS4A_MARKER: [u8; 4] = [0, 0, 0, 1];

pub struct Socks4Protocol;

impl ProxyProto for Socks4Protocol {
    /// Only the username of `creds` is used, as the SOCKS4 `USERID`
    async fn new<S>(
        creds: Option<&(String, String)>,
        target: NetworkTarget,
        mut proxy_stream: S,
    ) -> Result<BoxedStream, ConnectError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let user_id = creds.map(|(user, _)| user.as_str()).unwrap_or_default();
        let request = encode_request(user_id, &target)?;
        proxy_stream.write_all(&request).await?;

        let mut reply = [0u8; 8];
        proxy_stream.read_exact(&mut reply).await?;
        check_reply(&reply)?;

        tracing::debug!(target = %target, "SOCKS4 tunnel established");
        Ok(Box::new(proxy_stream))
    }
}

/// `VN CD DSTPORT DSTIP USERID NUL [HOST NUL]`
pub fn encode_request(user_id: &str, target: &NetworkTarget) -> Result<Vec<u8>, ConnectError> {
    let mut request = Vec::with_capacity(9 + user_id.len());
    request.push(SOCKS4_VERSION);
    request.push(CMD_CONNECT);
    request.extend_from_slice(&target.port().to_be_bytes());

    let domain = match target {
        NetworkTarget::IPAddr {
            socket: SocketAddr::V4(socket),
        } => {
            request.extend_from_slice(&socket.ip().octets());
            None
        }
        NetworkTarget::IPAddr {
            socket: SocketAddr::V6(_),
        } => return Err(ConnectError::UnsupportedTarget("SOCKS4")),
        NetworkTarget::Domain { domain, .. } => {
            if domain.len() > 255 {
                return Err(ConnectError::ExceededMaxDomainLen);
            }
            request.extend_from_slice(&SOCKS4A_MARKER);
            Some(domain)
        }
    };

    request.extend_from_slice(user_id.as_bytes());
    request.push(0);
    if let Some(domain) = domain {
        request.extend_from_slice(domain.as_bytes());
        request.push(0);
    }
    Ok(request)
}

fn check_reply(reply: &[u8; 8]) -> Result<(), ConnectError> {
    // VN should be 0, though some servers echo the request version
    if reply[0] != 0 && reply[0] != SOCKS4_VERSION {
        return Err(ConnectError::WrongProtocol);
    }
    match reply[1] {
        REQUEST_GRANTED => Ok(()),
        code => Err(ConnectError::Socks4Rejected(code)),
    }
}

/// Resolves a domain target to its first IPv4 address, for plain SOCKS4
pub async fn resolve_ipv4(target: NetworkTarget) -> Result<NetworkTarget, ConnectError> {
    match target {
        NetworkTarget::Domain { domain, port } => {
            let mut addrs = tokio::net::lookup_host((domain.as_str(), port)).await?;
            addrs
                .find(SocketAddr::is_ipv4)
                .map(|socket| NetworkTarget::IPAddr { socket })
                .ok_or(ConnectError::DnsNameNotResolved)
        }
        ip => Ok(ip),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn socks4_request_bytes() {
        let target: NetworkTarget = "1.2.3.4:80".parse().unwrap();
        let request = encode_request("bob", &target).unwrap();
        assert_eq!(
            request,
            vec![4, 1, 0, 80, 1, 2, 3, 4, b'b', b'o', b'b', 0]
        );
    }

    #[test]
    fn socks4a_request_bytes() {
        let target: NetworkTarget = "example.com:443".parse().unwrap();
        let request = encode_request("", &target).unwrap();
        let mut expected = vec![4, 1, 0x01, 0xBB, 0, 0, 0, 1, 0];
        expected.extend_from_slice(b"example.com\0");
        assert_eq!(request, expected);
    }

    #[test]
    fn socks4_rejects_ipv6() {
        let target: NetworkTarget = "[::1]:80".parse().unwrap();
        assert!(matches!(
            encode_request("", &target),
            Err(ConnectError::UnsupportedTarget(_))
        ));
    }

    #[tokio::test]
    async fn handshake_against_fake_server() {
        let (client, mut server) = duplex(256);
        let server = tokio::spawn(async move {
            let mut head = [0u8; 8];
            server.read_exact(&mut head).await.unwrap();
            let mut user = [0u8; 1];
            server.read_exact(&mut user).await.unwrap();
            server
                .write_all(&[0, REQUEST_GRANTED, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            server.write_all(b"hi").await.unwrap();
            head
        });

        let target: NetworkTarget = "10.0.0.1:8080".parse().unwrap();
        let mut stream = Socks4Protocol::new(None, target, client).await.unwrap();
        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"hi");

        let head = server.await.unwrap();
        assert_eq!(head, [4, 1, 0x1F, 0x90, 10, 0, 0, 1]);
    }

    #[tokio::test]
    async fn rejected_request() {
        let (client, mut server) = duplex(256);
        tokio::spawn(async move {
            let mut request = [0u8; 9];
            server.read_exact(&mut request).await.unwrap();
            server.write_all(&[0, 0x5B, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let target: NetworkTarget = "10.0.0.1:8080".parse().unwrap();
        let err = Socks4Protocol::new(None, target, client).await.err().unwrap();
        assert!(matches!(err, ConnectError::Socks4Rejected(0x5B)));
    }
}
