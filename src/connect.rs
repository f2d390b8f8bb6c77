use std::{
    net::{IpAddr, SocketAddr},
    pin::Pin,
    str::FromStr,
    task::{Context, Poll},
    time::Duration,
};

use async_http_proxy::HttpError;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::parse::join_host_port;

#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("No DNS records were present for this domain")]
    DnsNameNotResolved,

    #[error("Input/Output fail")]
    IO(#[from] std::io::Error),

    #[error("HTTP tunnel failed to connect")]
    Http(#[from] HttpError),

    #[error("SOCKS tunnel failed to connect")]
    Socks(#[from] fast_socks5::SocksError),

    #[error("SOCKS4 request rejected with code {0:#04x}")]
    Socks4Rejected(u8),

    #[error("Authentication Failed")]
    AuthFailed { details: Option<String> },

    #[error("Authentication method is unacceptable")]
    AuthMethodUnacceptable,

    #[error("Failed target address parsing")]
    FailedAddrParsing,

    #[error("Wrong protocol used")]
    WrongProtocol,

    #[error("Passed connection domain is too long")]
    ExceededMaxDomainLen,

    #[error("Target is not reachable over {0}")]
    UnsupportedTarget(&'static str),

    #[error("TLS configuration or handshake failed")]
    Tls(#[from] rustls::Error),

    #[error("Invalid TLS server name `{0}`")]
    InvalidServerName(String),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Deadline can not be represented")]
    DeadlineOverflow,

    #[error("Dial panicked: {0}")]
    DialPanic(String),

    #[error("{0} was closed while starting")]
    ClosedWhileStarting(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// Target for proxy for connection, in form of DNS name or socket's IP Address
///
/// Domains are handed to the proxy untouched so that resolution happens
/// on the far side whenever the protocol allows it.
pub enum NetworkTarget {
    Domain { domain: String, port: u16 },
    IPAddr { socket: SocketAddr },
}

impl NetworkTarget {
    pub fn new(host: &str, port: u16) -> Self {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        match host.parse::<IpAddr>() {
            Ok(ip) => NetworkTarget::IPAddr {
                socket: SocketAddr::new(ip, port),
            },
            Err(_) => NetworkTarget::Domain {
                domain: host.to_owned(),
                port,
            },
        }
    }

    pub fn host(&self) -> String {
        match &self {
            NetworkTarget::Domain { domain, .. } => domain.clone(),
            NetworkTarget::IPAddr { socket } => socket.ip().to_string(),
        }
    }

    pub fn port(&self) -> u16 {
        match &self {
            NetworkTarget::Domain { port, .. } => *port,
            NetworkTarget::IPAddr { socket } => socket.port(),
        }
    }
}

impl FromStr for NetworkTarget {
    type Err = ConnectError;

    /// `host:port`, with IPv6 hosts in brackets
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if let Ok(socket) = input.parse::<SocketAddr>() {
            return Ok(NetworkTarget::IPAddr { socket });
        }
        let (host, port) = input
            .rsplit_once(':')
            .ok_or(ConnectError::FailedAddrParsing)?;
        let port = port.parse().map_err(|_| ConnectError::FailedAddrParsing)?;
        if host.is_empty() || host.contains(':') {
            return Err(ConnectError::FailedAddrParsing);
        }
        Ok(NetworkTarget::new(host, port))
    }
}

impl From<SocketAddr> for NetworkTarget {
    fn from(socket: SocketAddr) -> Self {
        NetworkTarget::IPAddr { socket }
    }
}

impl std::fmt::Display for NetworkTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            NetworkTarget::Domain { domain, port } => {
                f.write_str(&join_host_port(domain, *port))
            }
            NetworkTarget::IPAddr { socket } => f.write_str(&socket.to_string()),
        }
    }
}

/// Any bidirectional byte stream a proxy hands back
pub trait BiConnection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BiConnection for T {}

pub type BoxedStream = Box<dyn BiConnection>;

/// Client side of a tunnelling protocol, run over an already connected stream
pub(crate) trait ProxyProto {
    async fn new<S>(
        creds: Option<&(String, String)>,
        target: NetworkTarget,
        proxy_stream: S,
    ) -> Result<BoxedStream, ConnectError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static;
}

pub(crate) mod socks_proto {
    use fast_socks5::{client::Config, util::target_addr::TargetAddr, AuthenticationMethod};
    use tokio::io::{AsyncRead, AsyncWrite};

    use super::{BoxedStream, ConnectError, NetworkTarget, ProxyProto};

    impl From<NetworkTarget> for TargetAddr {
        fn from(val: NetworkTarget) -> Self {
            match val {
                NetworkTarget::Domain { domain, port } => TargetAddr::Domain(domain, port),
                NetworkTarget::IPAddr { socket } => TargetAddr::Ip(socket),
            }
        }
    }

    /// SOCKS5 with remote name resolution
    pub struct SocksProtocol;
    impl ProxyProto for SocksProtocol {
        async fn new<S>(
            creds: Option<&(String, String)>,
            target: NetworkTarget,
            proxy_stream: S,
        ) -> Result<BoxedStream, ConnectError>
        where
            S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        {
            let auth = creds.map(|(username, password)| AuthenticationMethod::Password {
                username: username.clone(),
                password: password.clone(),
            });
            let stream = fast_socks5::client::Socks5Stream::use_stream(
                proxy_stream,
                auth,
                Config::default(),
            )
            .await;

            let mut stream = match stream {
                Ok(stream) => stream,
                Err(error) => match error {
                    fast_socks5::SocksError::AuthMethodUnacceptable(_) => {
                        return Err(ConnectError::AuthMethodUnacceptable);
                    }
                    fast_socks5::SocksError::UnsupportedSocksVersion(_) => {
                        return Err(ConnectError::WrongProtocol);
                    }
                    fast_socks5::SocksError::AuthenticationFailed(details)
                    | fast_socks5::SocksError::AuthenticationRejected(details) => {
                        return Err(ConnectError::AuthFailed {
                            details: Some(details),
                        });
                    }

                    err => return Err(err.into()),
                },
            };

            let command_result = stream
                .request(fast_socks5::Socks5Command::TCPConnect, target.into())
                .await;

            match command_result {
                Ok(_) => Ok(Box::new(stream)),
                Err(fast_socks5::SocksError::ExceededMaxDomainLen(_)) => {
                    Err(ConnectError::ExceededMaxDomainLen)
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}

pub(crate) mod http_proto {
    use async_http_proxy::HttpError;
    use tokio::io::{AsyncRead, AsyncWrite};

    use super::{BoxedStream, ConnectError, NetworkTarget, ProxyProto};

    /// HTTP `CONNECT` tunnel
    pub struct HttpProtocol;
    impl ProxyProto for HttpProtocol {
        async fn new<S>(
            creds: Option<&(String, String)>,
            target: NetworkTarget,
            mut proxy_stream: S,
        ) -> Result<BoxedStream, ConnectError>
        where
            S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        {
            let host = target.host();
            let resp = match creds {
                Some((login, password)) => {
                    async_http_proxy::http_connect_tokio_with_basic_auth(
                        &mut proxy_stream,
                        host.as_str(),
                        target.port(),
                        login.as_str(),
                        password.as_str(),
                    )
                    .await
                }
                None => {
                    async_http_proxy::http_connect_tokio(
                        &mut proxy_stream,
                        host.as_str(),
                        target.port(),
                    )
                    .await
                }
            };

            match resp {
                Ok(()) => (),
                Err(HttpError::IoError(io)) => return Err(ConnectError::IO(io)),
                Err(HttpError::HttpCode200(407)) => {
                    return Err(ConnectError::AuthFailed { details: None })
                }

                Err(err) => return Err(err.into()),
            }

            Ok(Box::new(proxy_stream))
        }
    }
}

/// Plain TCP connect bounded by `timeout` when one is set
pub(crate) async fn connect_tcp(
    addr: &str,
    timeout: Option<Duration>,
) -> Result<TcpStream, ConnectError> {
    let connect = TcpStream::connect(addr);
    let stream = match timeout.filter(|t| !t.is_zero()) {
        Some(timeout) => tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| ConnectError::Timeout("connect"))??,
        None => connect.await?,
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// TCP Tunnel through proxy server
///
/// Create using [`ProxyClient::connect_tcp`](crate::ProxyClient::connect_tcp)
/// or [`ProxyClient::connect_tls`](crate::ProxyClient::connect_tls)
pub struct TCPConnection(BoxedStream);

impl TCPConnection {
    pub(crate) fn new(inner: BoxedStream) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> BoxedStream {
        self.0
    }
}

impl AsyncRead for TCPConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for TCPConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut *self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut *self.0).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut *self.0).poll_shutdown(cx)
    }
}
