//! Scheme registry, client construction and the resulting [`ProxyClient`]

use std::{
    collections::HashMap,
    sync::{Arc, LazyLock, Mutex, PoisonError, RwLock},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{
    header::{CONNECTION, HOST},
    HeaderValue, Request, Response, Uri,
};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;

use crate::{
    bridge::BridgeRegistry,
    connect::{BoxedStream, ConnectError, NetworkTarget, TCPConnection},
    engine::{EngineError, EngineRegistry, ProxyEngine, ShadowsocksEngine},
    parse::{join_host_port, scheme_of, ParseError, ParseFn, ParserRegistry, ProxyUrl},
    relay::apply_deadline,
    socks::server::BridgeReply,
    tls,
};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Unknown proxy protocol `{0}`")]
    UnknownProtocol(String),

    #[error("Failed to parse proxy URL")]
    Parse(#[from] ParseError),

    #[error("{backend} engine failed to start")]
    EngineStart {
        backend: &'static str,
        #[source]
        source: EngineError,
    },

    #[error("Failed to prepare proxy connection")]
    Connect(#[from] ConnectError),
}

impl BuildError {
    pub(crate) fn engine(backend: &'static str) -> impl FnOnce(EngineError) -> Self {
        move |source| BuildError::EngineStart { backend, source }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Request URI has no host")]
    MissingHost,

    #[error("Unsupported request scheme `{0}`")]
    UnsupportedScheme(String),

    #[error("Invalid request URI")]
    InvalidUri(#[from] http::uri::InvalidUri),

    #[error("Invalid Host header")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    #[error("Failed to reach target through the proxy")]
    Connect(#[from] ConnectError),

    #[error("HTTP exchange failed")]
    Http(#[from] hyper::Error),

    #[error("Request timed out")]
    Timeout,
}

/**
Connection pooling and timeout knobs of a [`ProxyClient`]

| field                   | default |
|-------------------------|---------|
| `max_idle_conns`        | 100     |
| `max_idle_per_host`     | 2       |
| `idle_conn_timeout`     | 90s     |
| `tls_handshake_timeout` | 30s     |
| `disable_keep_alives`   | false   |
| `connect_timeout`       | none    |
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transport {
    pub max_idle_conns: usize,
    pub max_idle_per_host: usize,
    pub idle_conn_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    /// One request per connection; the client timeout then also bounds the
    /// life of every connection
    pub disable_keep_alives: bool,
    pub connect_timeout: Option<Duration>,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            max_idle_conns: 100,
            max_idle_per_host: 2,
            idle_conn_timeout: Duration::from_secs(90),
            tls_handshake_timeout: Duration::from_secs(30),
            disable_keep_alives: false,
            connect_timeout: None,
        }
    }
}

/// Options consumed by [`Resolver::build_client`]
#[derive(Clone)]
pub struct ClientOptions {
    pub timeout: Option<Duration>,
    pub transport: Option<Transport>,
    pub tls_config: Option<Arc<ClientConfig>>,
    /// Only used when no `tls_config` is given. Defaults to `true`.
    pub insecure_skip_verify: bool,
    pub disable_keep_alives: bool,
    pub shadowsocks: Option<Arc<dyn ShadowsocksEngine>>,
    pub proxy_engine: Option<Arc<dyn ProxyEngine>>,
    pub bridge_reply: BridgeReply,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            transport: None,
            tls_config: None,
            insecure_skip_verify: true,
            disable_keep_alives: false,
            shadowsocks: None,
            proxy_engine: None,
            bridge_reply: BridgeReply::default(),
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Used as is instead of the defaults derived from the timeout
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    pub fn with_insecure_skip_verify(mut self, insecure: bool) -> Self {
        self.insecure_skip_verify = insecure;
        self
    }

    pub fn with_disable_keep_alives(mut self, disable: bool) -> Self {
        self.disable_keep_alives = disable;
        self
    }

    pub fn with_shadowsocks_engine(mut self, engine: Arc<dyn ShadowsocksEngine>) -> Self {
        self.shadowsocks = Some(engine);
        self
    }

    pub fn with_proxy_engine(mut self, engine: Arc<dyn ProxyEngine>) -> Self {
        self.proxy_engine = Some(engine);
        self
    }

    pub fn with_bridge_reply(mut self, reply: BridgeReply) -> Self {
        self.bridge_reply = reply;
        self
    }

    pub fn effective_transport(&self) -> Transport {
        let mut transport = self.transport.clone().unwrap_or_else(|| Transport {
            connect_timeout: self.timeout,
            ..Default::default()
        });
        transport.disable_keep_alives |= self.disable_keep_alives;
        transport
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.effective_transport().connect_timeout.or(self.timeout)
    }

    pub fn effective_tls_config(&self) -> Result<Arc<ClientConfig>, ConnectError> {
        match &self.tls_config {
            Some(config) => Ok(config.clone()),
            None => tls::default_client_config(self.insecure_skip_verify),
        }
    }
}

/// Opens a stream to `target` through some proxy
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &NetworkTarget) -> Result<BoxedStream, ConnectError>;
}

/// Per-scheme constructor of [`Dialer`]s
#[async_trait]
pub trait Backend: Send + Sync {
    async fn build(
        &self,
        url: &ProxyUrl,
        options: &ClientOptions,
        resolver: &Resolver,
    ) -> Result<Arc<dyn Dialer>, BuildError>;
}

/**
Scheme → [`Backend`] registry plus the runtime state backends share

Populate it at startup with [`register`](Resolver::register), or use
[`Resolver::with_defaults`] which registers every built-in scheme. Registering
a scheme again replaces the earlier backend.

```rust,no_run
# async fn run() -> Result<(), proxyroute::BuildError> {
let resolver = proxyroute::Resolver::with_defaults();
let client = resolver
    .build_client("socks5://127.0.0.1:1080", proxyroute::ClientOptions::new())
    .await?;
# Ok(())
# }
```
*/
#[derive(Default)]
pub struct Resolver {
    backends: RwLock<HashMap<String, Arc<dyn Backend>>>,
    parsers: ParserRegistry,
    bridges: BridgeRegistry,
    engines: EngineRegistry,
}

impl Resolver {
    /// Empty resolver, no scheme registered
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let resolver = Self::new();
        crate::protocols::register_defaults(&resolver);
        resolver
    }

    /// Process-wide resolver with the built-in schemes
    pub fn global() -> &'static Resolver {
        static GLOBAL: LazyLock<Resolver> = LazyLock::new(Resolver::with_defaults);
        &GLOBAL
    }

    /// Returns the backend this registration replaced, if any
    pub fn register<B>(&self, scheme: &str, backend: B) -> Option<Arc<dyn Backend>>
    where
        B: Backend + 'static,
    {
        let scheme = scheme.to_ascii_lowercase();
        let previous = self
            .backends
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scheme.clone(), Arc::new(backend));
        if previous.is_some() {
            tracing::debug!(scheme = %scheme, "proxy backend replaced");
        }
        previous
    }

    pub fn register_parser<F>(&self, scheme: &str, parser: F) -> Option<ParseFn>
    where
        F: Fn(&str) -> Result<ProxyUrl, ParseError> + Send + Sync + 'static,
    {
        self.parsers.register(scheme, parser)
    }

    pub fn backend(&self, scheme: &str) -> Option<Arc<dyn Backend>> {
        self.backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&scheme.to_ascii_lowercase())
            .cloned()
    }

    pub fn parsers(&self) -> &ParserRegistry {
        &self.parsers
    }

    pub fn bridges(&self) -> &BridgeRegistry {
        &self.bridges
    }

    pub fn engines(&self) -> &EngineRegistry {
        &self.engines
    }

    pub fn parse(&self, proxy_url: &str) -> Result<ProxyUrl, ParseError> {
        self.parsers.parse(proxy_url)
    }

    /// Builds a client whose connections all go through `proxy_url`
    pub async fn build_client(
        &self,
        proxy_url: &str,
        options: ClientOptions,
    ) -> Result<ProxyClient, BuildError> {
        let scheme = scheme_of(proxy_url)?.to_ascii_lowercase();
        let backend = self
            .backend(&scheme)
            .ok_or_else(|| BuildError::UnknownProtocol(scheme.clone()))?;

        let url = self.parse(proxy_url)?;
        let dialer = backend.build(&url, &options, self).await?;
        let tls_config = options.effective_tls_config()?;

        tracing::debug!(scheme = %scheme, host = %url.host, port = ?url.port, "proxy client built");
        Ok(ProxyClient::new(
            dialer,
            options.effective_transport(),
            tls_config,
            options.timeout,
        ))
    }

    /// Stops the bridge or engine instance started for `proxy_url`, if any
    pub async fn close(&self, proxy_url: &str) {
        self.bridges.close(proxy_url).await;
        self.engines.close(proxy_url).await;
    }

    pub async fn close_all(&self) {
        self.bridges.close_all().await;
        self.engines.close_all().await;
    }
}

/// HTTP/1.1 client, and raw stream source, over a proxy [`Dialer`]
#[derive(Clone)]
pub struct ProxyClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    dialer: Arc<dyn Dialer>,
    transport: Transport,
    tls_config: Arc<ClientConfig>,
    timeout: Option<Duration>,
    pool: IdlePool,
}

impl ProxyClient {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        transport: Transport,
        tls_config: Arc<ClientConfig>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                dialer,
                transport,
                tls_config,
                timeout: timeout.filter(|t| !t.is_zero()),
                pool: IdlePool::default(),
            }),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    async fn dial(&self, target: &NetworkTarget) -> Result<BoxedStream, ConnectError> {
        let stream = self.inner.dialer.dial(target).await?;
        apply_deadline(
            stream,
            self.inner.timeout,
            self.inner.transport.disable_keep_alives,
        )
    }

    /// Raw tunnel to `target`
    pub async fn connect_tcp(&self, target: &NetworkTarget) -> Result<TCPConnection, ConnectError> {
        let stream = self.dial(target).await?;
        Ok(TCPConnection::new(stream))
    }

    /// Tunnel to `target` with a TLS session on top, SNI set to the target host
    pub async fn connect_tls(&self, target: &NetworkTarget) -> Result<TCPConnection, ConnectError> {
        let stream = self.dial(target).await?;
        let stream = tls::handshake(
            self.inner.tls_config.clone(),
            stream,
            &target.host(),
            Some(self.inner.transport.tls_handshake_timeout),
        )
        .await?;
        Ok(TCPConnection::new(Box::new(stream)))
    }

    /// Sends `request` and reads the whole response.
    ///
    /// The request URI must be absolute (`http` or `https`). The client
    /// timeout, when set, bounds the entire exchange.
    pub async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, RequestError> {
        match self.inner.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.exchange(request))
                .await
                .map_err(|_| RequestError::Timeout)?,
            None => self.exchange(request).await,
        }
    }

    async fn exchange(&self, mut request: Request<Bytes>) -> Result<Response<Bytes>, RequestError> {
        let keep_alive = !self.inner.transport.disable_keep_alives;
        let key = PoolKey::from_uri(request.uri())?;
        prepare_request(&mut request, &key, keep_alive)?;

        let mut sender = match self.checkout(&key).await {
            Some(sender) => sender,
            None => self.handshake(&key).await?,
        };

        let response = sender.send_request(request.map(Full::new)).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();

        let server_closes = parts
            .headers
            .get(CONNECTION)
            .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"close"));
        if keep_alive && !server_closes && !sender.is_closed() {
            self.inner.pool.checkin(key, sender, &self.inner.transport);
        }

        Ok(Response::from_parts(parts, body))
    }

    async fn checkout(&self, key: &PoolKey) -> Option<SendRequest<Full<Bytes>>> {
        let idle_timeout = self.inner.transport.idle_conn_timeout;
        while let Some(mut sender) = self.inner.pool.pop(key, idle_timeout) {
            if sender.ready().await.is_ok() {
                return Some(sender);
            }
        }
        None
    }

    async fn handshake(&self, key: &PoolKey) -> Result<SendRequest<Full<Bytes>>, RequestError> {
        let target = NetworkTarget::new(&key.host, key.port);
        let stream = if key.https {
            self.connect_tls(&target).await?
        } else {
            self.connect_tcp(&target).await?
        };

        let (sender, conn) = http1::Builder::new()
            .handshake(TokioIo::new(stream))
            .await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "pooled connection ended");
            }
        });
        Ok(sender)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    https: bool,
    host: String,
    port: u16,
}

impl PoolKey {
    fn from_uri(uri: &Uri) -> Result<Self, RequestError> {
        let https = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            Some(other) => return Err(RequestError::UnsupportedScheme(other.to_owned())),
            None => return Err(RequestError::MissingHost),
        };
        let host = uri
            .host()
            .ok_or(RequestError::MissingHost)?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
        Ok(Self { https, host, port })
    }

    fn host_header(&self) -> String {
        let default_port = if self.https { 443 } else { 80 };
        if self.port == default_port {
            join_host_port(&self.host, self.port)
                .rsplit_once(':')
                .map(|(host, _)| host.to_owned())
                .unwrap_or_else(|| self.host.clone())
        } else {
            join_host_port(&self.host, self.port)
        }
    }
}

/// Turns an absolute-form request into origin-form with a `Host` header
fn prepare_request(
    request: &mut Request<Bytes>,
    key: &PoolKey,
    keep_alive: bool,
) -> Result<(), RequestError> {
    if !request.headers().contains_key(HOST) {
        let host = HeaderValue::from_str(&key.host_header())?;
        request.headers_mut().insert(HOST, host);
    }
    if !keep_alive {
        request
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
    let origin_form: Uri = request
        .uri()
        .path_and_query()
        .map(|path| path.as_str())
        .unwrap_or("/")
        .parse()?;
    *request.uri_mut() = origin_form;
    Ok(())
}

struct Idle {
    sender: SendRequest<Full<Bytes>>,
    since: Instant,
}

#[derive(Default)]
struct IdlePool {
    idle: Mutex<HashMap<PoolKey, Vec<Idle>>>,
}

impl IdlePool {
    /// Most recently used first; expired and closed entries are dropped
    fn pop(&self, key: &PoolKey, idle_timeout: Duration) -> Option<SendRequest<Full<Bytes>>> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = idle.get_mut(key)?;
        let mut found = None;
        while let Some(entry) = entries.pop() {
            if entry.since.elapsed() < idle_timeout && !entry.sender.is_closed() {
                found = Some(entry.sender);
                break;
            }
        }
        if entries.is_empty() {
            idle.remove(key);
        }
        found
    }

    fn checkin(&self, key: PoolKey, sender: SendRequest<Full<Bytes>>, transport: &Transport) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let total: usize = idle.values().map(Vec::len).sum();
        if total >= transport.max_idle_conns {
            return;
        }
        let entries = idle.entry(key).or_default();
        if entries.len() >= transport.max_idle_per_host {
            return;
        }
        entries.push(Idle {
            sender,
            since: Instant::now(),
        });
    }
}
