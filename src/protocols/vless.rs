//! `vless://uuid@host:port?params#name`

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{engine::start_dialer, flag_enabled, query_pairs};
use crate::{
    client::{Backend, BuildError, ClientOptions, Dialer, Resolver},
    engine::{
        config::{Outbound, StreamParams, StreamSettings},
        EngineError,
    },
    parse::{decode_component, opaque_part, parse_authority, url_host, ParseError, ProxyUrl},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessConfig {
    pub uuid: String,
    pub address: String,
    pub port: u16,
    /// `none` unless the link says otherwise
    pub encryption: String,
    pub flow: String,
    /// Transport, `tcp` by default
    pub network: String,
    pub security: String,
    pub path: String,
    pub host: String,
    /// Falls back to `host`
    pub sni: String,
    pub alpn: String,
    pub fingerprint: String,
    pub public_key: String,
    pub short_id: String,
    pub spider_x: String,
    pub service_name: String,
    pub allow_insecure: bool,
    pub name: Option<String>,
}

impl Default for VlessConfig {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            address: String::new(),
            port: 0,
            encryption: "none".to_owned(),
            flow: String::new(),
            network: "tcp".to_owned(),
            security: String::new(),
            path: String::new(),
            host: String::new(),
            sni: String::new(),
            alpn: String::new(),
            fingerprint: String::new(),
            public_key: String::new(),
            short_id: String::new(),
            spider_x: String::new(),
            service_name: String::new(),
            allow_insecure: true,
            name: None,
        }
    }
}

impl VlessConfig {
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let url = parse_authority("vless", raw)?;
        let uuid = decode_component(url.username());
        if uuid.is_empty() {
            return Err(ParseError::MissingField("uuid"));
        }
        let address = url_host(&url);
        if address.is_empty() {
            return Err(ParseError::MissingField("host"));
        }
        if !crate::host::is_host(&address) {
            return Err(ParseError::InvalidHost(address));
        }
        let port = url.port().ok_or(ParseError::MissingField("port"))?;

        let mut query = query_pairs(raw);
        let mut take = |key: &str| query.remove(key).filter(|v| !v.is_empty());
        let mut config = Self {
            uuid,
            address,
            port,
            name: url.fragment().map(decode_component).filter(|n| !n.is_empty()),
            ..Default::default()
        };

        if let Some(encryption) = take("encryption") {
            config.encryption = encryption;
        }
        if let Some(network) = take("type") {
            config.network = network;
        }
        config.flow = take("flow").unwrap_or_default();
        config.security = take("security").unwrap_or_default();
        config.path = take("path").unwrap_or_default();
        config.host = take("host").unwrap_or_default();
        config.sni = take("sni").unwrap_or_else(|| config.host.clone());
        config.alpn = take("alpn").unwrap_or_default();
        config.fingerprint = take("fp").unwrap_or_default();
        config.public_key = take("pbk").unwrap_or_default();
        config.short_id = take("sid").unwrap_or_default();
        config.spider_x = take("spx").unwrap_or_default();
        config.service_name = take("serviceName").unwrap_or_default();
        config.allow_insecure = flag_enabled(take("allowInsecure").as_ref());
        Ok(config)
    }

    pub fn to_proxy_url(&self, raw: &str) -> ProxyUrl {
        ProxyUrl {
            scheme: "vless".to_owned(),
            host: self.address.clone(),
            port: Some(self.port),
            username: Some(self.uuid.clone()),
            password: None,
            opaque: opaque_part(raw).to_owned(),
            raw: raw.to_owned(),
        }
    }

    pub fn stream_params(&self) -> StreamParams {
        StreamParams {
            network: self.network.clone(),
            security: self.security.clone(),
            host: self.host.clone(),
            path: self.path.clone(),
            server_name: self.sni.clone(),
            alpn: self.alpn.clone(),
            fingerprint: self.fingerprint.clone(),
            allow_insecure: self.allow_insecure,
            public_key: self.public_key.clone(),
            short_id: self.short_id.clone(),
            spider_x: self.spider_x.clone(),
            service_name: self.service_name.clone(),
            header_type: String::new(),
            tcp_http_header: !self.host.is_empty() || !self.path.is_empty(),
        }
    }

    pub fn outbound(&self) -> Result<Outbound, EngineError> {
        let settings = json!({
            "vnext": [{
                "address": self.address,
                "port": self.port,
                "users": [{
                    "id": self.uuid,
                    "flow": self.flow,
                    "encryption": self.encryption,
                    "level": 0,
                }],
            }]
        });
        Ok(Outbound::new("vless", settings)
            .with_stream_settings(StreamSettings::from_params(&self.stream_params())))
    }
}

pub struct VlessBackend;

#[async_trait]
impl Backend for VlessBackend {
    async fn build(
        &self,
        url: &ProxyUrl,
        options: &ClientOptions,
        resolver: &Resolver,
    ) -> Result<Arc<dyn Dialer>, BuildError> {
        let config = VlessConfig::parse(&url.raw)?;
        start_dialer("vless", url, options, resolver, move || config.outbound()).await
    }
}

pub fn register(resolver: &Resolver) {
    resolver.register_parser("vless", |raw| Ok(VlessConfig::parse(raw)?.to_proxy_url(raw)));
    resolver.register("vless", VlessBackend);
}
