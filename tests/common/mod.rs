#![allow(dead_code)]

use std::{net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

pub const VERIFICATION_SLICE: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// TCP echo server on an ephemeral loopback port
pub async fn spawn_echo() -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
                    tracing::debug!(error = %e, "echo connection ended");
                }
            });
        }
    });
    Ok(addr)
}

/// Waits until something accepts connections on `addr`
pub async fn wait_listening(addr: &str) -> anyhow::Result<()> {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("nothing listening on {addr}")
}

/// Writes the verification bytes and expects them echoed back
pub async fn assert_echo<S>(stream: &mut S) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(VERIFICATION_SLICE).await?;
    let mut recv_buffer = vec![0u8; VERIFICATION_SLICE.len()];
    stream.read_exact(&mut recv_buffer).await?;
    anyhow::ensure!(recv_buffer == VERIFICATION_SLICE, "echo mismatch");
    Ok(())
}

/// Reads an HTTP head up to and including the blank line
pub async fn read_head<S>(stream: &mut S) -> anyhow::Result<String>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            anyhow::bail!("connection closed inside HTTP head");
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8(head)?)
}
