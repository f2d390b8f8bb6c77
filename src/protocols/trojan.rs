//! `trojan://password@host:port?params#name`

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
pub struct TrojanConfig {
    pub password: String,
    pub address: String,
    pub port: u16,
    pub flow: String,
    /// `tls` by default
    pub security: String,
    /// `tcp` by default
    pub network: String,
    pub path: String,
    pub host: String,
    /// Falls back to `host`, then to the server address
    pub sni: String,
    pub alpn: String,
    pub fingerprint: String,
    pub service_name: String,
    pub allow_insecure: bool,
    pub name: Option<String>,
}

impl TrojanConfig {
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let url = parse_authority("trojan", raw)?;
        let password = decode_component(url.username());
        if password.is_empty() {
            return Err(ParseError::MissingField("password"));
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

        let host = take("host").unwrap_or_default();
        let sni = take("sni")
            .or_else(|| (!host.is_empty()).then(|| host.clone()))
            .unwrap_or_else(|| address.clone());

        Ok(Self {
            password,
            port,
            flow: take("flow").unwrap_or_default(),
            security: take("security").unwrap_or_else(|| "tls".to_owned()),
            network: take("type").unwrap_or_else(|| "tcp".to_owned()),
            path: take("path").unwrap_or_default(),
            host,
            sni,
            alpn: take("alpn").unwrap_or_default(),
            fingerprint: take("fp").unwrap_or_default(),
            service_name: take("serviceName").unwrap_or_default(),
            allow_insecure: flag_enabled(take("allowInsecure").as_ref()),
            name: url.fragment().map(decode_component).filter(|n| !n.is_empty()),
            address,
        })
    }

    pub fn to_proxy_url(&self, raw: &str) -> ProxyUrl {
        ProxyUrl {
            scheme: "trojan".to_owned(),
            host: self.address.clone(),
            port: Some(self.port),
            username: None,
            password: Some(self.password.clone()),
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
            service_name: self.service_name.clone(),
            tcp_http_header: !self.host.is_empty() || !self.path.is_empty(),
            ..Default::default()
        }
    }

    pub fn outbound(&self) -> Result<Outbound, EngineError> {
        let settings = json!({
            "servers": [{
                "address": self.address,
                "port": self.port,
                "password": self.password,
                "flow": self.flow,
                "level": 0,
            }]
        });
        Ok(Outbound::new("trojan", settings)
            .with_stream_settings(StreamSettings::from_params(&self.stream_params())))
    }
}

pub struct TrojanBackend;

#[async_trait]
impl Backend for TrojanBackend {
    async fn build(
        &self,
        url: &ProxyUrl,
        options: &ClientOptions,
        resolver: &Resolver,
    ) -> Result<Arc<dyn Dialer>, BuildError> {
        let config = TrojanConfig::parse(&url.raw)?;
        start_dialer("trojan", url, options, resolver, move || config.outbound()).await
    }
}

pub fn register(resolver: &Resolver) {
    resolver.register_parser("trojan", |raw| Ok(TrojanConfig::parse(raw)?.to_proxy_url(raw)));
    resolver.register("trojan", TrojanBackend);
}
