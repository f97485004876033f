//! Relay: the browser-launched process between native messaging and the broker.
//!
//! ```text
//! browser ──stdin [len][json]──► Relay ──raw json──► broker socket
//! browser ◄─stdout [len][json]── Relay ◄──raw bytes── broker socket
//! ```
//!
//! The Relay holds no protocol state and never parses payloads. It exits
//! when either side closes, or when the browser declares a frame larger than
//! the configured maximum. Two broker replies that arrive in one socket read
//! are delivered to the browser as a single frame.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::constants::READ_BUFFER_SIZE;
use crate::error::{BridgeError, Result};
use crate::framing::{read_frame, write_frame};

/// Why the relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The browser closed stdin.
    StdinClosed,
    /// The broker closed the socket.
    SocketClosed,
}

/// Connect to the broker socket. No retry.
///
/// # Errors
///
/// [`BridgeError::Io`] if nothing is listening at `path`.
pub async fn connect(path: &Path) -> Result<UnixStream> {
    let stream = UnixStream::connect(path).await?;
    log::info!("[Relay] Connected to {}", path.display());
    Ok(stream)
}

/// Shuttle messages between the browser streams and the broker socket until
/// one side closes.
///
/// # Errors
///
/// [`BridgeError::FrameTooLarge`] when the browser declares an oversized
/// frame (nothing of it is forwarded), or [`BridgeError::Io`] on a transport
/// failure.
pub async fn run<I, O, S>(stdin: I, stdout: O, socket: S, max_len: usize) -> Result<RelayExit>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite,
{
    let (socket_rx, socket_tx) = tokio::io::split(socket);

    let exit = tokio::select! {
        exit = browser_to_broker(stdin, socket_tx, max_len) => exit,
        exit = broker_to_browser(socket_rx, stdout) => exit,
    };
    match &exit {
        Ok(reason) => log::info!("[Relay] Stopping: {reason:?}"),
        Err(e) => log::error!("[Relay] Stopping: {e}"),
    }
    exit
}

/// stdin frames → socket, payload only.
async fn browser_to_broker<I, W>(mut stdin: I, mut socket: W, max_len: usize) -> Result<RelayExit>
where
    I: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(payload) = read_frame(&mut stdin, max_len).await? else {
            return Ok(RelayExit::StdinClosed);
        };
        log::debug!("[Relay] browser -> broker: {} bytes", payload.len());
        socket.write_all(&payload).await?;
        socket.flush().await?;
    }
}

/// socket chunks → stdout, one frame per read.
async fn broker_to_browser<R, O>(mut socket: R, mut stdout: O) -> Result<RelayExit>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(RelayExit::SocketClosed);
        }
        log::debug!("[Relay] broker -> browser: {n} bytes");
        write_frame(&mut stdout, &buf[..n]).await?;
    }
}

/// Connect to `path` and relay until one side closes.
///
/// # Errors
///
/// See [`connect`] and [`run`].
pub async fn run_at<I, O>(path: &Path, stdin: I, stdout: O, max_len: usize) -> Result<RelayExit>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let socket = connect(path).await.map_err(|e| {
        log::error!("[Relay] Cannot reach broker at {}: {e}", path.display());
        e
    })?;
    run(stdin, stdout, socket, max_len).await
}
