//! Structured configuration handed to a [`ProxyEngine`](super::ProxyEngine)
//!
//! Shaped after the common v2ray/xray JSON layout: one SOCKS inbound, the
//! protocol outbound and a `freedom` fallback. Field names serialize in
//! camelCase and empty sections are omitted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub inbounds: Vec<Inbound>,
    #[serde(default)]
    pub outbounds: Vec<Outbound>,
}

impl EngineConfig {
    /// SOCKS inbound on `socks_port`, `outbound`, then a direct fallback
    pub fn with_outbound(outbound: Outbound, socks_port: u16) -> Self {
        Self {
            log: Some(LogConfig {
                loglevel: Some("warning".to_owned()),
                ..Default::default()
            }),
            inbounds: vec![Inbound::socks(socks_port)],
            outbounds: vec![outbound, Outbound::direct()],
        }
    }

    pub fn socks_port(&self) -> Option<u16> {
        self.inbounds
            .iter()
            .find(|inbound| inbound.protocol == "socks")
            .map(|inbound| inbound.port)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loglevel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    pub protocol: String,
    pub settings: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Sniffing>,
}

impl Inbound {
    pub fn socks(port: u16) -> Self {
        Self {
            tag: "socks-in".to_owned(),
            port,
            listen: Some("127.0.0.1".to_owned()),
            protocol: "socks".to_owned(),
            settings: serde_json::json!({
                "auth": "noauth",
                "udp": true,
                "ip": "127.0.0.1",
            }),
            sniffing: Some(Sniffing {
                enabled: true,
                dest_override: vec!["http".to_owned(), "tls".to_owned()],
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sniffing {
    pub enabled: bool,
    pub dest_override: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mux: Option<Mux>,
}

impl Outbound {
    pub fn new(protocol: &str, settings: Value) -> Self {
        Self {
            tag: Some(format!("{protocol}-out")),
            protocol: protocol.to_owned(),
            settings: Some(settings),
            stream_settings: None,
            mux: Some(Mux::disabled(default_concurrency())),
        }
    }

    pub fn direct() -> Self {
        Self {
            tag: Some("direct".to_owned()),
            protocol: "freedom".to_owned(),
            ..Default::default()
        }
    }

    pub fn with_stream_settings(mut self, stream_settings: StreamSettings) -> Self {
        self.stream_settings = Some(stream_settings);
        self
    }

    pub fn with_mux(mut self, mux: Mux) -> Self {
        self.mux = Some(mux);
        self
    }
}

fn default_concurrency() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mux {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
}

impl Mux {
    pub fn disabled(concurrency: u32) -> Self {
        Self {
            enabled: false,
            concurrency: Some(concurrency),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xtls_settings: Option<TlsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealitySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_settings: Option<TcpSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kcp_settings: Option<KcpSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_settings: Option<HttpSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quic_settings: Option<QuicSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xhttp_settings: Option<XhttpSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    #[serde(default)]
    pub allow_insecure: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fingerprint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    #[serde(default)]
    pub show: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub short_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub spider_x: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<Header>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl Header {
    fn kind(kind: &str) -> Self {
        Self {
            kind: kind.to_owned(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KcpSettings {
    pub mtu: u32,
    pub tti: u32,
    pub uplink_capacity: u32,
    pub downlink_capacity: u32,
    pub congestion: bool,
    pub read_buffer_size: u32,
    pub write_buffer_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<Header>,
}

impl Default for KcpSettings {
    fn default() -> Self {
        Self {
            mtu: 1350,
            tti: 20,
            uplink_capacity: 5,
            downlink_capacity: 20,
            congestion: false,
            read_buffer_size: 1,
            write_buffer_size: 1,
            header: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WsSettings {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuicSettings {
    pub security: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<Header>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSettings {
    pub service_name: String,
    #[serde(default)]
    pub multi_mode: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XhttpSettings {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// `h2` or `h3`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// Transport and security knobs shared by the URL based protocols
#[derive(Debug, Clone, Default)]
pub struct StreamParams {
    /// `tcp`, `ws`, `xhttp`, `grpc`, `http`/`h2`, `kcp`, `quic`
    pub network: String,
    /// `tls`, `xtls`, `reality` or empty
    pub security: String,
    pub host: String,
    pub path: String,
    pub server_name: String,
    /// Comma separated
    pub alpn: String,
    pub fingerprint: String,
    pub allow_insecure: bool,
    pub public_key: String,
    pub short_id: String,
    pub spider_x: String,
    pub service_name: String,
    /// Camouflage header type for kcp and quic
    pub header_type: String,
    /// Add an HTTP request header disguise on plain tcp
    pub tcp_http_header: bool,
}

impl StreamParams {
    fn alpn_list(&self) -> Vec<String> {
        self.alpn
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }

    fn tls_settings(&self) -> TlsSettings {
        TlsSettings {
            server_name: self.server_name.clone(),
            alpn: self.alpn_list(),
            allow_insecure: self.allow_insecure,
            fingerprint: self.fingerprint.clone(),
        }
    }

    fn header(&self) -> Option<Header> {
        (!self.header_type.is_empty()).then(|| Header::kind(&self.header_type))
    }
}

impl StreamSettings {
    pub fn from_params(params: &StreamParams) -> Self {
        let mut settings = StreamSettings {
            network: non_empty(&params.network),
            security: non_empty(&params.security),
            ..Default::default()
        };

        match params.security.as_str() {
            "tls" => settings.tls_settings = Some(params.tls_settings()),
            "xtls" => settings.xtls_settings = Some(params.tls_settings()),
            "reality" => {
                settings.reality_settings = Some(RealitySettings {
                    server_name: params.server_name.clone(),
                    fingerprint: params.fingerprint.clone(),
                    public_key: params.public_key.clone(),
                    short_id: params.short_id.clone(),
                    spider_x: params.spider_x.clone(),
                    ..Default::default()
                })
            }
            _ => {}
        }

        match params.network.as_str() {
            "ws" => {
                settings.ws_settings = Some(WsSettings {
                    path: params.path.clone(),
                    host: params.host.clone(),
                    ..Default::default()
                })
            }
            "xhttp" => {
                let version = if params.alpn.contains("h3") { "h3" } else { "h2" };
                settings.xhttp_settings = Some(XhttpSettings {
                    host: params.host.clone(),
                    path: params.path.clone(),
                    method: "GET".to_owned(),
                    version: version.to_owned(),
                    ..Default::default()
                })
            }
            "tcp" if params.tcp_http_header => {
                settings.tcp_settings = Some(TcpSettings {
                    header: Some(Header {
                        kind: "http".to_owned(),
                        request: Some(serde_json::json!({
                            "path": [params.path],
                            "headers": { "Host": [params.host] },
                        })),
                        response: None,
                    }),
                })
            }
            "kcp" => {
                settings.kcp_settings = Some(KcpSettings {
                    header: params.header(),
                    ..Default::default()
                })
            }
            "http" | "h2" => {
                settings.http_settings = Some(HttpSettings {
                    path: params.path.clone(),
                    host: non_empty(&params.host).into_iter().collect(),
                })
            }
            "quic" => {
                settings.quic_settings = Some(QuicSettings {
                    security: "none".to_owned(),
                    header: params.header(),
                    ..Default::default()
                })
            }
            "grpc" => {
                settings.grpc_settings = Some(GrpcSettings {
                    service_name: params.service_name.clone(),
                    multi_mode: false,
                })
            }
            _ => {}
        }

        settings
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_owned())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reality_over_tcp() {
        let settings = StreamSettings::from_params(&StreamParams {
            network: "tcp".to_owned(),
            security: "reality".to_owned(),
            server_name: "www.example.com".to_owned(),
            fingerprint: "chrome".to_owned(),
            public_key: "pbk".to_owned(),
            short_id: "ab".to_owned(),
            ..Default::default()
        });

        assert_eq!(
            serde_json::to_value(&settings).unwrap(),
            json!({
                "network": "tcp",
                "security": "reality",
                "realitySettings": {
                    "show": false,
                    "fingerprint": "chrome",
                    "serverName": "www.example.com",
                    "publicKey": "pbk",
                    "shortId": "ab",
                }
            })
        );
    }

    #[test]
    fn xhttp_follows_alpn() {
        let mut params = StreamParams {
            network: "xhttp".to_owned(),
            path: "/up".to_owned(),
            ..Default::default()
        };
        let settings = StreamSettings::from_params(&params);
        assert_eq!(settings.xhttp_settings.unwrap().version, "h2");

        params.alpn = "h3,h2".to_owned();
        let settings = StreamSettings::from_params(&params);
        assert_eq!(settings.xhttp_settings.unwrap().version, "h3");
    }

    #[test]
    fn tls_alpn_list_and_tcp_header() {
        let settings = StreamSettings::from_params(&StreamParams {
            network: "tcp".to_owned(),
            security: "tls".to_owned(),
            host: "cdn.example".to_owned(),
            path: "/".to_owned(),
            server_name: "cdn.example".to_owned(),
            alpn: "h2, http/1.1".to_owned(),
            allow_insecure: true,
            tcp_http_header: true,
            ..Default::default()
        });

        let tls = settings.tls_settings.as_ref().unwrap();
        assert_eq!(tls.alpn, ["h2", "http/1.1"]);
        assert!(tls.allow_insecure);

        let header = settings.tcp_settings.unwrap().header.unwrap();
        assert_eq!(header.kind, "http");
        assert_eq!(
            header.request.unwrap(),
            json!({ "path": ["/"], "headers": { "Host": ["cdn.example"] } })
        );
    }

    #[test]
    fn full_config_layout() {
        let outbound = Outbound::new("trojan", json!({ "servers": [] }));
        let config = EngineConfig::with_outbound(outbound, 10808);
        assert_eq!(config.socks_port(), Some(10808));

        let value: Value = serde_json::from_slice(&config.to_json().unwrap()).unwrap();
        assert_eq!(value["inbounds"][0]["listen"], "127.0.0.1");
        assert_eq!(value["inbounds"][0]["sniffing"]["destOverride"], json!(["http", "tls"]));
        assert_eq!(value["outbounds"][0]["tag"], "trojan-out");
        assert_eq!(value["outbounds"][0]["mux"]["enabled"], false);
        assert_eq!(value["outbounds"][1], json!({ "tag": "direct", "protocol": "freedom" }));
        assert!(value["outbounds"][0].get("streamSettings").is_none());
    }
}
