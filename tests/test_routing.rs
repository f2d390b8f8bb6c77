use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use proxyroute::{
    socks::{
        server::{accept_handshake, send_reply},
        Destination, ReplyCode,
    },
    Backend, BoxedStream, BuildError, ClientOptions, ConnectError, Dialer, NetworkTarget,
    ProxyUrl, Resolver,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

mod common;

/// SOCKS5 proxy that records every requested destination and forwards
/// the tunnel to `echo` whatever was asked
async fn spawn_recording_socks5(
    echo: SocketAddr,
) -> anyhow::Result<(SocketAddr, mpsc::UnboundedReceiver<Destination>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let destination = accept_handshake(&mut stream).await?;
                let _ = tx.send(destination);
                let upstream = TcpStream::connect(echo).await?;
                send_reply(&mut stream, ReplyCode::Succeeded).await?;
                proxyroute::relay::relay(stream, upstream).await?;
                anyhow::Ok(())
            });
        }
    });
    Ok((addr, rx))
}

#[derive(Debug, PartialEq, Eq)]
struct Socks4Request {
    port: u16,
    ip: [u8; 4],
    user_id: String,
    domain: Option<String>,
}

async fn read_nul_terminated(stream: &mut TcpStream) -> anyhow::Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            return Ok(String::from_utf8(bytes)?);
        }
        bytes.push(byte);
    }
}

/// SOCKS4/4a proxy that grants every request and forwards it to `echo`
async fn spawn_socks4(
    echo: SocketAddr,
) -> anyhow::Result<(SocketAddr, mpsc::UnboundedReceiver<Socks4Request>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut head = [0u8; 8];
                stream.read_exact(&mut head).await?;
                anyhow::ensure!(head[0] == 4 && head[1] == 1, "not a SOCKS4 CONNECT");
                let ip = [head[4], head[5], head[6], head[7]];
                let user_id = read_nul_terminated(&mut stream).await?;
                let domain = if ip[..3] == [0, 0, 0] && ip[3] != 0 {
                    Some(read_nul_terminated(&mut stream).await?)
                } else {
                    None
                };
                let _ = tx.send(Socks4Request {
                    port: u16::from_be_bytes([head[2], head[3]]),
                    ip,
                    user_id,
                    domain,
                });

                let upstream = TcpStream::connect(echo).await?;
                stream.write_all(&[0, 0x5A, 0, 0, 0, 0, 0, 0]).await?;
                proxyroute::relay::relay(stream, upstream).await?;
                anyhow::Ok(())
            });
        }
    });
    Ok((addr, rx))
}

/// HTTP proxy answering `CONNECT` with `status_line`, then forwarding to `echo`
async fn spawn_http_connect(
    echo: SocketAddr,
    status_line: &'static str,
) -> anyhow::Result<(SocketAddr, mpsc::UnboundedReceiver<String>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let head = common::read_head(&mut stream).await?;
                let _ = tx.send(head);
                stream
                    .write_all(format!("{status_line}\r\n\r\n").as_bytes())
                    .await?;
                if status_line.contains(" 200 ") {
                    let upstream = TcpStream::connect(echo).await?;
                    proxyroute::relay::relay(stream, upstream).await?;
                }
                anyhow::Ok(())
            });
        }
    });
    Ok((addr, rx))
}

fn options() -> ClientOptions {
    ClientOptions::new().with_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn socks5h_sends_domain_to_proxy() -> anyhow::Result<()> {
    common::init_tracing();
    let echo = common::spawn_echo().await?;
    let (proxy, mut seen) = spawn_recording_socks5(echo).await?;

    let client = Resolver::with_defaults()
        .build_client(&format!("socks5h://{proxy}"), options())
        .await?;
    let mut conn = client
        .connect_tcp(&NetworkTarget::new("echo.internal", 7))
        .await?;
    common::assert_echo(&mut conn).await?;

    assert_eq!(
        seen.recv().await,
        Some(Destination::Domain("echo.internal".to_owned(), 7))
    );
    Ok(())
}

#[tokio::test]
async fn socks5_routes_ip_targets() -> anyhow::Result<()> {
    common::init_tracing();
    let echo = common::spawn_echo().await?;
    let (proxy, mut seen) = spawn_recording_socks5(echo).await?;

    let client = Resolver::with_defaults()
        .build_client(&format!("SOCKS5://{proxy}"), options())
        .await?;
    let mut conn = client.connect_tcp(&"10.1.2.3:8080".parse()?).await?;
    common::assert_echo(&mut conn).await?;

    assert_eq!(
        seen.recv().await,
        Some(Destination::Ipv4("10.1.2.3".parse()?, 8080))
    );
    Ok(())
}

#[tokio::test]
async fn socks4a_hands_domain_to_proxy() -> anyhow::Result<()> {
    common::init_tracing();
    let echo = common::spawn_echo().await?;
    let (proxy, mut seen) = spawn_socks4(echo).await?;

    let client = Resolver::with_defaults()
        .build_client(&format!("socks4a://bob@{proxy}"), options())
        .await?;
    let mut conn = client
        .connect_tcp(&NetworkTarget::new("echo.internal", 7))
        .await?;
    common::assert_echo(&mut conn).await?;

    assert_eq!(
        seen.recv().await,
        Some(Socks4Request {
            port: 7,
            ip: [0, 0, 0, 1],
            user_id: "bob".to_owned(),
            domain: Some("echo.internal".to_owned()),
        })
    );
    Ok(())
}

#[tokio::test]
async fn socks4_resolves_locally() -> anyhow::Result<()> {
    common::init_tracing();
    let echo = common::spawn_echo().await?;
    let (proxy, mut seen) = spawn_socks4(echo).await?;

    let client = Resolver::with_defaults()
        .build_client(&format!("socks4://{proxy}"), options())
        .await?;
    let mut conn = client
        .connect_tcp(&NetworkTarget::new("localhost", 9))
        .await?;
    common::assert_echo(&mut conn).await?;

    let request = seen.recv().await.expect("request recorded");
    assert_eq!(request.ip, [127, 0, 0, 1]);
    assert_eq!(request.domain, None);
    assert_eq!(request.user_id, "");

    let err = client
        .connect_tcp(&"[2001:db8::1]:443".parse()?)
        .await
        .err()
        .expect("IPv6 is not expressible in SOCKS4");
    assert!(matches!(err, ConnectError::UnsupportedTarget(_)), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn http_connect_with_basic_auth() -> anyhow::Result<()> {
    common::init_tracing();
    let echo = common::spawn_echo().await?;
    let (proxy, mut seen) = spawn_http_connect(echo, "HTTP/1.1 200 Connection established").await?;

    let client = Resolver::with_defaults()
        .build_client(&format!("http://user:pass@{proxy}"), options())
        .await?;
    let mut conn = client
        .connect_tcp(&NetworkTarget::new("example.com", 443))
        .await?;
    common::assert_echo(&mut conn).await?;

    let head = seen.recv().await.expect("CONNECT recorded");
    assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"), "{head}");
    let auth = head
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("proxy-authorization:"))
        .expect("credentials sent");
    // base64("user:pass")
    assert!(auth.ends_with("Basic dXNlcjpwYXNz"), "{auth}");
    Ok(())
}

#[tokio::test]
async fn http_connect_407_is_auth_failure() -> anyhow::Result<()> {
    common::init_tracing();
    let echo = common::spawn_echo().await?;
    let (proxy, _seen) =
        spawn_http_connect(echo, "HTTP/1.1 407 Proxy Authentication Required").await?;

    let client = Resolver::with_defaults()
        .build_client(&format!("http://{proxy}"), options())
        .await?;
    let err = client
        .connect_tcp(&NetworkTarget::new("example.com", 443))
        .await
        .err()
        .expect("proxy refused");
    assert!(matches!(err, ConnectError::AuthFailed { .. }), "{err:?}");
    Ok(())
}

struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, target: &NetworkTarget) -> Result<BoxedStream, ConnectError> {
        let stream = TcpStream::connect(target.to_string()).await?;
        Ok(Box::new(stream))
    }
}

struct DirectBackend;

#[async_trait]
impl Backend for DirectBackend {
    async fn build(
        &self,
        _url: &ProxyUrl,
        _options: &ClientOptions,
        _resolver: &Resolver,
    ) -> Result<Arc<dyn Dialer>, BuildError> {
        Ok(Arc::new(DirectDialer))
    }
}

#[tokio::test]
async fn custom_scheme_backend() -> anyhow::Result<()> {
    common::init_tracing();
    let echo = common::spawn_echo().await?;
    let resolver = Resolver::with_defaults();

    let err = resolver
        .build_client("direct://127.0.0.1:1", options())
        .await
        .err()
        .expect("not registered yet");
    assert!(matches!(err, BuildError::UnknownProtocol(ref s) if s == "direct"), "{err:?}");

    assert!(resolver.register("Direct", DirectBackend).is_none());
    let client = resolver
        .build_client("direct://127.0.0.1:1", options())
        .await?;
    let mut conn = client.connect_tcp(&NetworkTarget::from(echo)).await?;
    common::assert_echo(&mut conn).await?;
    Ok(())
}
