//! `socks5`, `socks5h`, `socks4` and `socks4a` proxies

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use super::{parse_duration, query_pairs, within};
use crate::{
    client::{Backend, BuildError, ClientOptions, Dialer, Resolver},
    connect::{
        connect_tcp, socks_proto::SocksProtocol, BoxedStream, ConnectError, NetworkTarget,
        ProxyProto,
    },
    parse::{join_host_port, ParseError, ProxyUrl},
    relay::apply_deadline,
    socks::socks4::{resolve_ipv4, Socks4Protocol},
};

pub const DEFAULT_PORT: u16 = 1080;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocksVersion {
    /// Domains are resolved by the proxy
    V5,
    /// IPv4 only, domains resolved locally
    V4,
    /// SOCKS4 with proxy-side resolution
    V4a,
}

impl SocksVersion {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "socks5" | "socks5h" => Some(SocksVersion::V5),
            "socks4" => Some(SocksVersion::V4),
            "socks4a" => Some(SocksVersion::V4a),
            _ => None,
        }
    }
}

/// Connection parameters of a SOCKS proxy server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksConfig {
    pub version: SocksVersion,
    pub host: String,
    pub port: u16,
    /// For SOCKS4 only the username is sent, as `USERID`
    pub credentials: Option<(String, String)>,
    /// Bounds the handshake; for SOCKS4 also the whole connection
    pub timeout: Option<Duration>,
}

impl SocksConfig {
    pub fn new(version: SocksVersion, host: &str, port: u16) -> Self {
        Self {
            version,
            host: host.to_owned(),
            port,
            credentials: None,
            timeout: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_owned(), password.to_owned()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reads the version from the scheme and an optional `?timeout=10s`
    pub fn from_url(url: &ProxyUrl) -> Result<Self, ParseError> {
        let version = SocksVersion::from_scheme(&url.scheme).ok_or(ParseError::Malformed {
            scheme: "socks",
            reason: format!("`{}` is not a SOCKS scheme", url.scheme),
        })?;
        let timeout = match query_pairs(&url.raw).get("timeout") {
            Some(value) => Some(parse_duration(value).ok_or(ParseError::Malformed {
                scheme: "socks",
                reason: format!("invalid timeout `{value}`"),
            })?),
            None => None,
        };

        Ok(Self {
            version,
            host: url.host.clone(),
            port: url.port_or(DEFAULT_PORT),
            credentials: url.credentials(),
            timeout,
        })
    }

    pub fn authority(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

pub struct SocksDialer {
    config: SocksConfig,
    connect_timeout: Option<Duration>,
}

impl SocksDialer {
    /// `connect_timeout` applies when the config carries no timeout of its own
    pub fn new(config: SocksConfig, connect_timeout: Option<Duration>) -> Self {
        Self {
            config,
            connect_timeout,
        }
    }

    pub fn config(&self) -> &SocksConfig {
        &self.config
    }

    async fn handshake(&self, target: NetworkTarget) -> Result<BoxedStream, ConnectError> {
        let proxy_stream = connect_tcp(&self.config.authority(), None).await?;
        let creds = self.config.credentials.as_ref();
        match self.config.version {
            SocksVersion::V5 => SocksProtocol::new(creds, target, proxy_stream).await,
            SocksVersion::V4 => {
                let target = resolve_ipv4(target).await?;
                Socks4Protocol::new(creds, target, proxy_stream).await
            }
            SocksVersion::V4a => Socks4Protocol::new(creds, target, proxy_stream).await,
        }
    }
}

#[async_trait]
impl Dialer for SocksDialer {
    async fn dial(&self, target: &NetworkTarget) -> Result<BoxedStream, ConnectError> {
        let timeout = self.config.timeout.or(self.connect_timeout);
        let stream = within(timeout, "SOCKS handshake", self.handshake(target.clone())).await?;
        tracing::debug!(proxy = %self.config.authority(), target = %target, "SOCKS tunnel ready");

        match self.config.version {
            SocksVersion::V5 => Ok(stream),
            SocksVersion::V4 | SocksVersion::V4a => apply_deadline(stream, timeout, true),
        }
    }
}

pub struct SocksBackend;

#[async_trait]
impl Backend for SocksBackend {
    async fn build(
        &self,
        url: &ProxyUrl,
        options: &ClientOptions,
        _resolver: &Resolver,
    ) -> Result<Arc<dyn Dialer>, BuildError> {
        let config = SocksConfig::from_url(url)?;
        Ok(Arc::new(SocksDialer::new(config, options.connect_timeout())))
    }
}

pub fn register(resolver: &Resolver) {
    for scheme in ["socks5", "socks5h", "socks4", "socks4a"] {
        resolver.register(scheme, SocksBackend);
    }
}
