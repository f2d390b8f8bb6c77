//! `ssr` (ShadowsocksR), served by the full-proxy engine as a Shadowsocks
//! outbound

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::json;

use super::{engine::start_dialer, split_host_port};
use crate::{
    client::{Backend, BuildError, ClientOptions, Dialer, Resolver},
    engine::{
        config::{Mux, Outbound},
        EngineError,
    },
    parse::{decode_base64, decode_base64_string, opaque_part, ParseError, ProxyUrl},
};

const METHODS: [&str; 10] = [
    "aes-128-cfb",
    "aes-256-cfb",
    "chacha20",
    "chacha20-ietf",
    "aes-128-gcm",
    "aes-256-gcm",
    "chacha20-poly1305",
    "chacha20-ietf-poly1305",
    "xchacha20-poly1305",
    "xchacha20-ietf-poly1305",
];

const PROTOCOLS: [&str; 4] = ["origin", "auth_aes128_md5", "auth_aes128_sha1", "auth_chain_a"];

const OBFS: [&str; 4] = ["plain", "http_simple", "tls1.2_ticket_auth", "http_post"];

/// `ssr://base64(server:port:protocol:method:obfs:base64(password)/?params)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SsrConfig {
    pub server: String,
    pub port: u16,
    pub protocol: String,
    pub method: String,
    pub obfs: String,
    pub password: String,
    pub protocol_param: String,
    pub obfs_param: String,
    pub remarks: String,
}

impl SsrConfig {
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let text = decode_base64_string("ssr", opaque_part(raw))?;
        let (main, params) = match text.split_once("/?").or_else(|| text.split_once('?')) {
            Some((main, params)) => (main, params),
            None => (text.as_str(), ""),
        };

        // server may be an IPv6 literal, so split from the right
        let mut parts = main.rsplitn(6, ':');
        let mut next = |field| parts.next().ok_or(ParseError::MissingField(field));
        let password = next("password")?;
        let obfs = next("obfs")?;
        let method = next("method")?;
        let protocol = next("protocol")?;
        let port = next("port")?;
        let server = next("server")?;
        let (server, port) = split_host_port("ssr", &format!("{server}:{port}"))?;

        let mut config = Self {
            server,
            port,
            protocol: protocol.to_owned(),
            method: method.to_owned(),
            obfs: obfs.to_owned(),
            password: decode_base64_string("ssr password", password)?,
            ..Default::default()
        };

        for (key, value) in params.split('&').filter_map(|param| param.split_once('=')) {
            let value = decode_base64(key_field(key), value)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .unwrap_or_else(|| value.to_owned());
            match key {
                "obfsparam" => config.obfs_param = value,
                "protoparam" => config.protocol_param = value,
                "remarks" => config.remarks = value,
                _ => {}
            }
        }
        Ok(config)
    }

    /// Encodes back to the URL form, URL-safe alphabet without padding
    pub fn to_url(&self) -> String {
        let mut text = format!(
            "{}:{}:{}:{}:{}:{}",
            self.server,
            self.port,
            self.protocol,
            self.method,
            self.obfs,
            URL_SAFE_NO_PAD.encode(&self.password)
        );
        let params: Vec<String> = [
            ("obfsparam", &self.obfs_param),
            ("protoparam", &self.protocol_param),
            ("remarks", &self.remarks),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| format!("{key}={}", URL_SAFE_NO_PAD.encode(value)))
        .collect();
        if !params.is_empty() {
            text.push_str("/?");
            text.push_str(&params.join("&"));
        }
        format!("ssr://{}", URL_SAFE_NO_PAD.encode(text))
    }

    /// Rejects protocol, obfs and method combinations the engine can not run
    pub fn validate(&self) -> Result<(), EngineError> {
        let protocol = self.protocol.to_ascii_lowercase();
        if !PROTOCOLS.contains(&protocol.as_str()) {
            return Err(EngineError::Unsupported(format!("SSR protocol `{}`", self.protocol)));
        }
        let obfs = self.obfs.to_ascii_lowercase();
        if !OBFS.contains(&obfs.as_str()) {
            return Err(EngineError::Unsupported(format!("SSR obfs `{}`", self.obfs)));
        }
        self.engine_method().map(|_| ())
    }

    fn engine_method(&self) -> Result<&'static str, EngineError> {
        let method = self.method.to_ascii_lowercase();
        METHODS
            .iter()
            .find(|known| **known == method)
            .copied()
            .ok_or_else(|| EngineError::UnsupportedMethod(self.method.clone()))
    }

    /// Password with the protocol and obfs folded in, as the engine expects
    pub fn effective_password(&self) -> String {
        let mut password = self.password.clone();
        if !self.protocol.eq_ignore_ascii_case("origin") {
            password = format!("{}:{password}", self.protocol);
            if !self.protocol_param.is_empty() {
                password = format!("{password}?protocolparam={}", self.protocol_param);
            }
        }
        if !self.obfs.eq_ignore_ascii_case("plain") {
            password = format!("{}:{password}", self.obfs);
            if !self.obfs_param.is_empty() {
                password = format!("{password}?obfsparam={}", self.obfs_param);
            }
        }
        password
    }

    pub fn outbound(&self) -> Result<Outbound, EngineError> {
        self.validate()?;
        let settings = json!({
            "servers": [{
                "address": self.server,
                "port": self.port,
                "method": self.engine_method()?,
                "password": self.effective_password(),
                "uot": true,
                "level": 0,
            }]
        });
        Ok(Outbound::new("shadowsocks", settings).with_mux(Mux::disabled(8)))
    }

    pub fn to_proxy_url(&self, raw: &str) -> ProxyUrl {
        ProxyUrl {
            scheme: "ssr".to_owned(),
            host: self.server.clone(),
            port: Some(self.port),
            username: None,
            password: Some(self.password.clone()),
            opaque: opaque_part(raw).to_owned(),
            raw: raw.to_owned(),
        }
    }
}

fn key_field(key: &str) -> &'static str {
    match key {
        "obfsparam" => "ssr obfsparam",
        "protoparam" => "ssr protoparam",
        "remarks" => "ssr remarks",
        _ => "ssr param",
    }
}

pub struct SsrBackend;

#[async_trait]
impl Backend for SsrBackend {
    async fn build(
        &self,
        url: &ProxyUrl,
        options: &ClientOptions,
        resolver: &Resolver,
    ) -> Result<Arc<dyn Dialer>, BuildError> {
        let config = SsrConfig::parse(&url.raw)?;
        start_dialer("ssr", url, options, resolver, move || config.outbound()).await
    }
}

pub fn register(resolver: &Resolver) {
    resolver.register_parser("ssr", |raw| Ok(SsrConfig::parse(raw)?.to_proxy_url(raw)));
    resolver.register("ssr", SsrBackend);
}
