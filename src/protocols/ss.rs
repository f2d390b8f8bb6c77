//! `ss` (Shadowsocks) through a local SOCKS5 bridge
//!
//! The tunnel engine only knows how to wrap one upstream stream, so each
//! `ss://` URL gets a [`BridgeServer`] that accepts SOCKS5 locally, dials the
//! Shadowsocks server (through the plugin disguise, if any) and hands the
//! stream to the engine. The client then talks SOCKS5 to the bridge.

use std::{collections::BTreeMap, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use rustls::ClientConfig;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use super::{
    query_pairs,
    socks::{SocksConfig, SocksDialer, SocksVersion},
    split_host_port,
};
use crate::{
    bridge::{BridgeServer, BridgeUpstream},
    client::{Backend, BuildError, ClientOptions, Dialer, Resolver},
    connect::{connect_tcp, BoxedStream, ConnectError, NetworkTarget},
    engine::{EngineError, TunnelDialer},
    parse::{decode_base64_string, decode_component, join_host_port, opaque_part, ParseError, ProxyUrl},
    socks::Destination,
    tls,
};

/// Bytes of the obfs server reply that are read and thrown away
const OBFS_RESPONSE_LIMIT: usize = 1024;

const PLUGIN_TLS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsConfig {
    pub server: String,
    pub port: u16,
    pub method: String,
    pub password: String,
    pub name: Option<String>,
    pub plugin: Option<PluginConfig>,
}

/// `plugin=name;key=value;flag` from the URL query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginConfig {
    pub name: String,
    /// Bare flags map to `"true"`
    pub opts: BTreeMap<String, String>,
}

impl PluginConfig {
    pub fn parse(spec: &str) -> Self {
        let (name, opts) = spec.split_once(';').unwrap_or((spec, ""));
        let opts = opts
            .split(';')
            .map(str::trim)
            .filter(|opt| !opt.is_empty())
            .map(|opt| match opt.split_once('=') {
                Some((key, value)) => (key.trim().to_owned(), value.trim().to_owned()),
                None => (opt.to_owned(), "true".to_owned()),
            })
            .collect();
        Self {
            name: name.trim().to_owned(),
            opts,
        }
    }

    pub fn opt(&self, key: &str) -> Option<&str> {
        self.opts.get(key).map(String::as_str)
    }
}

impl SsConfig {
    /**
    Accepts both layouts:

    - SIP002 `ss://userinfo@host:port/?plugin=...#name`, where `userinfo` is
      `method:password` or its base64
    - legacy `ss://base64(method:password@host:port)#name`
    */
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let rest = opaque_part(raw);
        let (rest, name) = match rest.split_once('#') {
            Some((rest, name)) => (rest, Some(decode_component(name)).filter(|n| !n.is_empty())),
            None => (rest, None),
        };
        let body = rest.split_once('?').map_or(rest, |(body, _)| body);

        let (userinfo, host_port) = match body.rsplit_once('@') {
            Some((userinfo, host_port)) => {
                let userinfo = decode_component(userinfo);
                let userinfo = if userinfo.contains(':') {
                    userinfo
                } else {
                    decode_base64_string("ss userinfo", &userinfo)?
                };
                (userinfo, host_port.trim_end_matches('/').to_owned())
            }
            None => {
                let decoded = decode_base64_string("ss", body.trim_end_matches('/'))?;
                let (userinfo, host_port) =
                    decoded.rsplit_once('@').ok_or(ParseError::Malformed {
                        scheme: "ss",
                        reason: "missing `@` in decoded payload".to_owned(),
                    })?;
                (userinfo.to_owned(), host_port.to_owned())
            }
        };

        let (method, password) = userinfo.split_once(':').ok_or(ParseError::Malformed {
            scheme: "ss",
            reason: "userinfo is not method:password".to_owned(),
        })?;
        if method.is_empty() {
            return Err(ParseError::MissingField("method"));
        }
        let (server, port) = split_host_port("ss", &host_port)?;
        let plugin = query_pairs(raw)
            .get("plugin")
            .filter(|spec| !spec.is_empty())
            .map(|spec| PluginConfig::parse(spec));

        Ok(Self {
            server,
            port,
            method: method.to_ascii_lowercase(),
            password: password.to_owned(),
            name,
            plugin,
        })
    }

    pub fn to_proxy_url(&self, raw: &str) -> ProxyUrl {
        ProxyUrl {
            scheme: "ss".to_owned(),
            host: self.server.clone(),
            port: Some(self.port),
            username: Some(self.method.clone()),
            password: Some(self.password.clone()),
            opaque: opaque_part(raw).to_owned(),
            raw: raw.to_owned(),
        }
    }

    pub fn server_addr(&self) -> String {
        join_host_port(&self.server, self.port)
    }
}

/// Dials the Shadowsocks server and wraps the stream with the tunnel engine
struct SsUpstream {
    config: SsConfig,
    tunnel: Arc<dyn TunnelDialer>,
    connect_timeout: Option<Duration>,
    plugin_tls: Arc<ClientConfig>,
}

impl SsUpstream {
    fn new(
        config: SsConfig,
        tunnel: Arc<dyn TunnelDialer>,
        options: &ClientOptions,
    ) -> Result<Self, ConnectError> {
        Ok(Self {
            config,
            tunnel,
            connect_timeout: options.connect_timeout(),
            plugin_tls: options.effective_tls_config()?,
        })
    }

    async fn apply_plugin(&self, stream: TcpStream) -> Result<BoxedStream, ConnectError> {
        let Some(plugin) = &self.config.plugin else {
            return Ok(Box::new(stream));
        };
        match plugin.name.as_str() {
            "simple-obfs" | "obfs-local" if plugin.opt("obfs") == Some("http") => {
                let host = plugin.opt("obfs-host").unwrap_or(&self.config.server);
                Ok(Box::new(http_obfs(stream, host).await?))
            }
            "v2ray-plugin" if plugin.opt("tls").is_some() => {
                let host = plugin.opt("host").unwrap_or(&self.config.server);
                let stream =
                    tls::handshake(self.plugin_tls.clone(), stream, host, Some(PLUGIN_TLS_TIMEOUT))
                        .await?;
                Ok(Box::new(stream))
            }
            name => {
                tracing::debug!(plugin = %name, "plugin mode not handled, using a plain connection");
                Ok(Box::new(stream))
            }
        }
    }
}

/// Sends the HTTP upgrade disguise and discards the first chunk of the reply
async fn http_obfs(mut stream: TcpStream, host: &str) -> io::Result<TcpStream> {
    let request = format!("GET / HTTP/1.1\r\nHost: {host}\r\nConnection: upgrade\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    let mut discard = [0u8; OBFS_RESPONSE_LIMIT];
    let read = stream.read(&mut discard).await?;
    tracing::trace!(bytes = read, "obfs response discarded");
    Ok(stream)
}

#[async_trait]
impl BridgeUpstream for SsUpstream {
    async fn connect(&self, destination: &Destination) -> Result<BoxedStream, ConnectError> {
        let stream = connect_tcp(&self.config.server_addr(), self.connect_timeout).await?;
        let stream = self.apply_plugin(stream).await?;
        let tunnel = self.tunnel.dial_conn(stream, destination).await?;
        Ok(tunnel)
    }
}

/// SOCKS5 client pointed at a running bridge
///
/// Dialing fails fast once the bridge has been closed.
pub struct BridgeDialer {
    bridge: Arc<BridgeServer>,
    socks: SocksDialer,
}

impl BridgeDialer {
    pub fn new(bridge: Arc<BridgeServer>, connect_timeout: Option<Duration>) -> Self {
        let config = SocksConfig::new(SocksVersion::V5, "127.0.0.1", bridge.port());
        Self {
            bridge,
            socks: SocksDialer::new(config, connect_timeout),
        }
    }

    pub fn bridge(&self) -> &Arc<BridgeServer> {
        &self.bridge
    }
}

#[async_trait]
impl Dialer for BridgeDialer {
    async fn dial(&self, target: &NetworkTarget) -> Result<BoxedStream, ConnectError> {
        if !self.bridge.is_running() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "bridge is closed").into());
        }
        self.socks.dial(target).await
    }
}

pub struct SsBackend;

#[async_trait]
impl Backend for SsBackend {
    async fn build(
        &self,
        url: &ProxyUrl,
        options: &ClientOptions,
        resolver: &Resolver,
    ) -> Result<Arc<dyn Dialer>, BuildError> {
        let engine = options
            .shadowsocks
            .clone()
            .ok_or(EngineError::NotConfigured("shadowsocks"))
            .map_err(BuildError::engine("ss"))?;

        let bridge = resolver
            .bridges()
            .get_or_start(&url.raw, || async {
                let config = SsConfig::parse(&url.raw)?;
                let tunnel = engine
                    .method(&config.method, &config.password)
                    .map_err(BuildError::engine("ss"))?;
                let upstream = SsUpstream::new(config, tunnel, options)?;
                BridgeServer::start(&url.raw, Arc::new(upstream), options.bridge_reply)
                    .await
                    .map_err(|e| BuildError::engine("ss")(e.into()))
            })
            .await?;

        Ok(Arc::new(BridgeDialer::new(bridge, options.connect_timeout())))
    }
}

pub fn register(resolver: &Resolver) {
    resolver.register_parser("ss", |raw| Ok(SsConfig::parse(raw)?.to_proxy_url(raw)));
    resolver.register("ss", SsBackend);
}
