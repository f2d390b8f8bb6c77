//! Building blocks shared by every dial path: port allocation, panic
//! isolation, deadlines and the bidirectional copy loop

use std::{
    any::Any,
    future::Future,
    io,
    net::Ipv4Addr,
    panic::AssertUnwindSafe,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::FutureExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    time::{Instant, Sleep},
};
use tokio_util::sync::CancellationToken;

use crate::connect::{BoxedStream, ConnectError};

/// Asks the OS for a free loopback port and releases it right away.
///
/// Another process may grab the port before it is bound again, so a later
/// `AddrInUse` on it is worth a retry.
pub fn free_port() -> io::Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Runs a dial future, turning a panic inside it into [`ConnectError::DialPanic`]
pub async fn dial_with_recover<F, T, E>(dial: F) -> Result<T, ConnectError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ConnectError>,
{
    match AssertUnwindSafe(dial).catch_unwind().await {
        Ok(result) => result.map_err(Into::into),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::warn!(panic = %message, "dial panicked");
            Err(ConnectError::DialPanic(message))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Bounds the whole life of `conn` by `timeout` when `enforce` is set.
///
/// On failure the connection is dropped, and with it the socket.
pub fn apply_deadline(
    conn: BoxedStream,
    timeout: Option<Duration>,
    enforce: bool,
) -> Result<BoxedStream, ConnectError> {
    let Some(timeout) = timeout.filter(|t| enforce && !t.is_zero()) else {
        return Ok(conn);
    };
    match Instant::now().checked_add(timeout) {
        Some(deadline) => Ok(Box::new(Deadline::new(conn, deadline))),
        None => {
            drop(conn);
            Err(ConnectError::DeadlineOverflow)
        }
    }
}

/// Stream whose reads and writes fail with `TimedOut` once the deadline passes
pub struct Deadline<S> {
    inner: S,
    sleep: Pin<Box<Sleep>>,
}

impl<S> Deadline<S> {
    pub fn new(inner: S, deadline: Instant) -> Self {
        Self {
            inner,
            sleep: Box::pin(tokio::time::sleep_until(deadline)),
        }
    }

    fn expired(&mut self, cx: &mut Context<'_>) -> bool {
        self.sleep.as_mut().poll(cx).is_ready()
    }
}

fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connection deadline exceeded")
}

impl<S: AsyncRead + Unpin> AsyncRead for Deadline<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.expired(cx) {
            return Poll::Ready(Err(deadline_exceeded()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Deadline<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.expired(cx) {
            return Poll::Ready(Err(deadline_exceeded()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.expired(cx) {
            return Poll::Ready(Err(deadline_exceeded()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Bytes moved by a finished [`relay`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copies `a -> b` and `b -> a` concurrently until both directions are done.
///
/// End of stream on one side only shuts down the opposite writer. The other
/// direction keeps flowing until its own reader ends, so a peer that never
/// closes keeps the relay open; bound such connections with [`apply_deadline`].
/// An error in either direction aborts the other one.
pub async fn relay<A, B>(a: A, b: B) -> io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let abort = CancellationToken::new();

    let (a_to_b, b_to_a) = tokio::join!(
        pump(&mut a_read, &mut b_write, &abort),
        pump(&mut b_read, &mut a_write, &abort),
    );

    match (a_to_b, b_to_a) {
        (Ok(a_to_b), Ok(b_to_a)) => Ok(RelayStats { a_to_b, b_to_a }),
        (Err(Pumped::Failed(e)), _) | (_, Err(Pumped::Failed(e))) => Err(e),
        _ => Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "relay aborted",
        )),
    }
}

enum Pumped {
    Failed(io::Error),
    Aborted,
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, abort: &CancellationToken) -> Result<u64, Pumped>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = tokio::select! {
        copied = tokio::io::copy(reader, writer) => copied.map_err(Pumped::Failed),
        _ = abort.cancelled() => Err(Pumped::Aborted),
    };
    if let Err(Pumped::Failed(e)) = &result {
        tracing::debug!(error = %e, "relay direction failed");
        abort.cancel();
    }
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(error = %e, "relay shutdown failed");
    }
    result
}
