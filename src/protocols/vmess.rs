//! `vmess://base64(json)` links

use std::{fmt::Display, str::FromStr, sync::Arc};

use async_trait::async_trait;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use super::engine::start_dialer;
use crate::{
    client::{Backend, BuildError, ClientOptions, Dialer, Resolver},
    engine::{
        config::{Outbound, StreamParams, StreamSettings},
        EngineError,
    },
    parse::{decode_base64, opaque_part, ParseError, ProxyUrl},
};

/**
Decoded link payload

Publishers disagree on JSON types, so numeric fields also accept numeric
strings, string fields accept any scalar, and `skip_cert_verify` accepts
`"yes"`, `"1"`, `"on"` and friends.
*/
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmessConfig {
    #[serde(deserialize_with = "lenient_int")]
    pub v: u32,
    #[serde(deserialize_with = "lenient_string")]
    pub ps: String,
    #[serde(deserialize_with = "lenient_string")]
    pub add: String,
    #[serde(deserialize_with = "lenient_int")]
    pub port: u16,
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(deserialize_with = "lenient_int")]
    pub aid: u32,
    #[serde(deserialize_with = "lenient_string")]
    pub net: String,
    #[serde(rename = "type", deserialize_with = "lenient_string")]
    pub kind: String,
    #[serde(deserialize_with = "lenient_string")]
    pub host: String,
    #[serde(deserialize_with = "lenient_string")]
    pub path: String,
    #[serde(deserialize_with = "lenient_string")]
    pub tls: String,
    #[serde(deserialize_with = "lenient_string")]
    pub sni: String,
    #[serde(deserialize_with = "lenient_string")]
    pub alpn: String,
    #[serde(deserialize_with = "lenient_string")]
    pub flow: String,
    #[serde(deserialize_with = "lenient_string")]
    pub fp: String,
    #[serde(deserialize_with = "lenient_string")]
    pub pbk: String,
    #[serde(deserialize_with = "lenient_string")]
    pub sid: String,
    #[serde(deserialize_with = "lenient_string")]
    pub spx: String,
    #[serde(deserialize_with = "lenient_string")]
    pub security: String,
    /// XHTTP version; turns a `ws` transport into `xhttp`
    #[serde(deserialize_with = "lenient_string")]
    pub xver: String,
    #[serde(deserialize_with = "lenient_bool")]
    pub skip_cert_verify: bool,
}

impl Default for VmessConfig {
    fn default() -> Self {
        Self {
            v: 0,
            ps: String::new(),
            add: String::new(),
            port: 0,
            id: String::new(),
            aid: 0,
            net: String::new(),
            kind: String::new(),
            host: String::new(),
            path: String::new(),
            tls: String::new(),
            sni: String::new(),
            alpn: String::new(),
            flow: String::new(),
            fp: String::new(),
            pbk: String::new(),
            sid: String::new(),
            spx: String::new(),
            security: String::new(),
            xver: String::new(),
            skip_cert_verify: true,
        }
    }
}

impl VmessConfig {
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let payload = decode_base64("vmess", opaque_part(raw))?;
        let config: Self = serde_json::from_slice(&payload)?;
        if config.add.is_empty() {
            return Err(ParseError::MissingField("add"));
        }
        if config.id.is_empty() {
            return Err(ParseError::MissingField("id"));
        }
        Ok(config)
    }

    pub fn to_proxy_url(&self, raw: &str) -> ProxyUrl {
        ProxyUrl {
            scheme: "vmess".to_owned(),
            host: self.add.clone(),
            port: Some(self.port),
            username: Some(self.id.clone()),
            password: None,
            opaque: opaque_part(raw).to_owned(),
            raw: raw.to_owned(),
        }
    }

    pub fn user_security(&self) -> &str {
        if self.security.is_empty() {
            "auto"
        } else {
            &self.security
        }
    }

    pub fn stream_params(&self) -> StreamParams {
        let security = match self.tls.to_ascii_lowercase().as_str() {
            "tls" | "true" => "tls",
            "xtls" => "xtls",
            "reality" => "reality",
            _ => "",
        };
        let server_name = match (security, self.sni.is_empty()) {
            ("reality", _) | (_, false) => self.sni.clone(),
            _ => self.host.clone(),
        };
        let network = if self.net == "ws" && !self.xver.is_empty() {
            "xhttp".to_owned()
        } else {
            self.net.clone()
        };

        StreamParams {
            network,
            security: security.to_owned(),
            host: self.host.clone(),
            path: self.path.clone(),
            server_name,
            alpn: self.alpn.clone(),
            fingerprint: self.fp.clone(),
            allow_insecure: self.skip_cert_verify,
            public_key: self.pbk.clone(),
            short_id: self.sid.clone(),
            spider_x: self.spx.clone(),
            service_name: self.path.clone(),
            header_type: self.kind.clone(),
            tcp_http_header: self.kind == "http",
        }
    }

    pub fn outbound(&self) -> Result<Outbound, EngineError> {
        let settings = json!({
            "vnext": [{
                "address": self.add,
                "port": self.port,
                "users": [{
                    "id": self.id,
                    "alterId": self.aid,
                    "security": self.user_security(),
                    "level": 0,
                    "flow": self.flow,
                }],
            }]
        });
        Ok(Outbound::new("vmess", settings)
            .with_stream_settings(StreamSettings::from_params(&self.stream_params())))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(i64),
    Str(String),
}

fn lenient_int<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64> + FromStr,
    <T as FromStr>::Err: Display,
{
    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(n) => {
            T::try_from(n).map_err(|_| D::Error::custom(format!("integer {n} out of range")))
        }
        IntOrString::Str(s) => s
            .trim()
            .parse()
            .map_err(|e| D::Error::custom(format!("`{s}` is not an integer: {e}"))),
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::String(s) => Ok(matches!(
            s.to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on" | "y" | "t"
        )),
        other => Err(D::Error::custom(format!(
            "expected a boolean or boolean string, got {other}"
        ))),
    }
}

pub struct VmessBackend;

#[async_trait]
impl Backend for VmessBackend {
    async fn build(
        &self,
        url: &ProxyUrl,
        options: &ClientOptions,
        resolver: &Resolver,
    ) -> Result<Arc<dyn Dialer>, BuildError> {
        let config = VmessConfig::parse(&url.raw)?;
        start_dialer("vmess", url, options, resolver, move || config.outbound()).await
    }
}

pub fn register(resolver: &Resolver) {
    resolver.register_parser("vmess", |raw| Ok(VmessConfig::parse(raw)?.to_proxy_url(raw)));
    resolver.register("vmess", VmessBackend);
}
