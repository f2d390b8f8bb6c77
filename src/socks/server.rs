//! Server side of SOCKS5, just enough for a local bridge
//!
//! Only `NO AUTHENTICATION REQUIRED` and `CONNECT` are supported.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    AddressType, AuthMethod, Destination, ReplyCode, SocksError, CMD_CONNECT, RSV,
    SOCKS5_VERSION,
};

/// Upper bound on the whole greeting + request exchange
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// When the bridge confirms a CONNECT to its client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BridgeReply {
    /// Reply success right after the request is parsed, before dialing upstream
    Eager,
    /// Reply only once the upstream tunnel is up, else report the failure
    #[default]
    Deferred,
}

/// Runs the greeting and request phases, returning the requested destination.
///
/// Unsupported commands and address types are answered with the matching
/// reply code before the error is returned; the caller only has to drop the
/// stream.
pub async fn accept_handshake<S>(stream: &mut S) -> Result<Destination, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(stream))
        .await
        .map_err(|_| SocksError::HandshakeTimeout)?
}

async fn handshake<S>(stream: &mut S) -> Result<Destination, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let [version, nmethods] = read_array::<_, 2>(stream).await?;
    if version != SOCKS5_VERSION {
        return Err(SocksError::UnsupportedVersion(version));
    }
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&(AuthMethod::NoAuth as u8)) {
        stream
            .write_all(&[SOCKS5_VERSION, AuthMethod::NoAcceptable as u8])
            .await?;
        return Err(SocksError::NoAcceptableMethod);
    }
    stream
        .write_all(&[SOCKS5_VERSION, AuthMethod::NoAuth as u8])
        .await?;

    let [version, cmd, _rsv, atyp] = read_array::<_, 4>(stream).await?;
    if version != SOCKS5_VERSION {
        return Err(SocksError::UnsupportedVersion(version));
    }
    if cmd != CMD_CONNECT {
        send_reply(stream, ReplyCode::CommandNotSupported).await?;
        return Err(SocksError::UnsupportedCommand(cmd));
    }
    let Some(address_type) = AddressType::from_byte(atyp) else {
        send_reply(stream, ReplyCode::AddrTypeUnsupported).await?;
        return Err(SocksError::UnsupportedAddressType(atyp));
    };

    Destination::read_from(stream, address_type).await
}

async fn read_array<S, const N: usize>(stream: &mut S) -> std::io::Result<[u8; N]>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; N];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// `VER REP RSV ATYP BND.ADDR BND.PORT` with `0.0.0.0:0` as bound address
pub async fn send_reply<S>(stream: &mut S, code: ReplyCode) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&reply_bytes(code)).await?;
    stream.flush().await
}

pub fn reply_bytes(code: ReplyCode) -> [u8; 10] {
    [
        SOCKS5_VERSION,
        code as u8,
        RSV,
        AddressType::IPv4 as u8,
        0,
        0,
        0,
        0,
        0,
        0,
    ]
}
