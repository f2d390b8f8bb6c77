//! `http` and `https` proxies speaking `CONNECT`

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rustls::ClientConfig;

use super::within;
use crate::{
    client::{Backend, BuildError, ClientOptions, Dialer, Resolver},
    connect::{
        connect_tcp, http_proto::HttpProtocol, BoxedStream, ConnectError, NetworkTarget,
        ProxyProto,
    },
    parse::{join_host_port, ProxyUrl},
    tls,
};

pub struct HttpDialer {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    /// TLS towards the proxy itself, for `https://` proxies
    tls: Option<(Arc<ClientConfig>, Duration)>,
    connect_timeout: Option<Duration>,
}

impl HttpDialer {
    pub fn new(url: &ProxyUrl, connect_timeout: Option<Duration>) -> Self {
        let default_port = if url.scheme == "https" { 443 } else { 80 };
        Self {
            host: url.host.clone(),
            port: url.port_or(default_port),
            credentials: url.credentials(),
            tls: None,
            connect_timeout,
        }
    }

    pub fn with_tls(mut self, config: Arc<ClientConfig>, handshake_timeout: Duration) -> Self {
        self.tls = Some((config, handshake_timeout));
        self
    }

    async fn tunnel(&self, target: NetworkTarget) -> Result<BoxedStream, ConnectError> {
        let proxy_stream = connect_tcp(&join_host_port(&self.host, self.port), None).await?;
        let creds = self.credentials.as_ref();
        match &self.tls {
            Some((config, handshake_timeout)) => {
                let proxy_stream =
                    tls::handshake(config.clone(), proxy_stream, &self.host, Some(*handshake_timeout))
                        .await?;
                HttpProtocol::new(creds, target, proxy_stream).await
            }
            None => HttpProtocol::new(creds, target, proxy_stream).await,
        }
    }
}

#[async_trait]
impl Dialer for HttpDialer {
    async fn dial(&self, target: &NetworkTarget) -> Result<BoxedStream, ConnectError> {
        let stream = within(self.connect_timeout, "HTTP CONNECT", self.tunnel(target.clone())).await?;
        tracing::debug!(proxy = %join_host_port(&self.host, self.port), target = %target, "HTTP tunnel ready");
        Ok(stream)
    }
}

pub struct HttpBackend;

#[async_trait]
impl Backend for HttpBackend {
    async fn build(
        &self,
        url: &ProxyUrl,
        options: &ClientOptions,
        _resolver: &Resolver,
    ) -> Result<Arc<dyn Dialer>, BuildError> {
        let dialer = HttpDialer::new(url, options.connect_timeout());
        let dialer = if url.scheme == "https" {
            let transport = options.effective_transport();
            dialer.with_tls(options.effective_tls_config()?, transport.tls_handshake_timeout)
        } else {
            dialer
        };
        Ok(Arc::new(dialer))
    }
}

pub fn register(resolver: &Resolver) {
    resolver.register("http", HttpBackend);
    resolver.register("https", HttpBackend);
}
