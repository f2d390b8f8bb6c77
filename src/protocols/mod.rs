//! Built-in scheme backends
//!
//! Each module exposes `register`, which installs its URL parser (if the
//! scheme needs one) and its [`Backend`](crate::Backend) into a
//! [`Resolver`].

use std::{collections::HashMap, future::Future, sync::LazyLock, time::Duration};

use regex::Regex;

use crate::{
    client::Resolver,
    connect::ConnectError,
    parse::{parse_port, ParseError},
};

pub mod engine;
pub mod http;
pub mod socks;
pub mod ss;
pub mod ssr;
pub mod trojan;
pub mod vless;
pub mod vmess;

/// Registers every built-in scheme
pub fn register_defaults(resolver: &Resolver) {
    socks::register(resolver);
    http::register(resolver);
    ss::register(resolver);
    ssr::register(resolver);
    vmess::register(resolver);
    vless::register(resolver);
    trojan::register(resolver);
}

/// Query parameters of `raw`, percent-decoded. Later duplicates win.
pub(crate) fn query_pairs(raw: &str) -> HashMap<String, String> {
    let without_fragment = raw.split_once('#').map_or(raw, |(head, _)| head);
    match without_fragment.split_once('?') {
        Some((_, query)) => url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect(),
        None => HashMap::new(),
    }
}

/// `host:port`, `[v6]:port`
pub(crate) fn split_host_port(
    scheme: &'static str,
    input: &str,
) -> Result<(String, u16), ParseError> {
    let input = input.trim_end_matches('/');
    let (host, port) = input.rsplit_once(':').ok_or(ParseError::Malformed {
        scheme,
        reason: format!("`{input}` is not host:port"),
    })?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if !crate::host::is_host(host) {
        return Err(ParseError::InvalidHost(host.to_owned()));
    }
    Ok((host.to_owned(), parse_port(port)?))
}

/// `true` unless the value explicitly says otherwise
pub(crate) fn flag_enabled(value: Option<&String>) -> bool {
    !matches!(value.map(String::as_str), Some("false" | "0"))
}

static DURATION_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d*)?|\.\d+)(ns|us|µs|ms|s|m|h)").expect("duration regex is valid")
});

/// Durations such as `10s`, `1m30s` or `250ms`
pub(crate) fn parse_duration(input: &str) -> Option<Duration> {
    if input == "0" {
        return Some(Duration::ZERO);
    }
    let mut consumed = 0;
    let mut nanos = 0f64;
    for part in DURATION_PART.captures_iter(input) {
        let whole = part.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();
        let value: f64 = part[1].parse().ok()?;
        let unit = match &part[2] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            _ => 3600e9,
        };
        nanos += value * unit;
    }
    if consumed != input.len() || consumed == 0 || nanos >= u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos.round() as u64))
}

/// Awaits `fut`, failing with [`ConnectError::Timeout`] once `timeout` passes
pub(crate) async fn within<F, T>(
    timeout: Option<Duration>,
    stage: &'static str,
    fut: F,
) -> Result<T, ConnectError>
where
    F: Future<Output = Result<T, ConnectError>>,
{
    match timeout.filter(|t| !t.is_zero()) {
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| ConnectError::Timeout(stage))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("1.5h"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("10s junk"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn query_decoding() {
        let pairs = query_pairs("vless://id@h:1?path=%2Fws&sni=a.example#name?x=y");
        assert_eq!(pairs["path"], "/ws");
        assert_eq!(pairs["sni"], "a.example");
        assert!(!pairs.contains_key("x"));
        assert!(query_pairs("socks5://h:1").is_empty());
    }

    #[test]
    fn host_port_split() {
        assert_eq!(
            split_host_port("t", "[2001:db8::1]:8388").unwrap(),
            ("2001:db8::1".to_owned(), 8388)
        );
        assert_eq!(
            split_host_port("t", "example.com:443/").unwrap(),
            ("example.com".to_owned(), 443)
        );
        assert!(split_host_port("t", "example.com").is_err());
        assert!(split_host_port("t", "bad host:1").is_err());
    }

    #[test]
    fn insecure_flag() {
        assert!(flag_enabled(None));
        assert!(flag_enabled(Some(&"1".to_owned())));
        assert!(!flag_enabled(Some(&"false".to_owned())));
        assert!(!flag_enabled(Some(&"0".to_owned())));
    }
}
