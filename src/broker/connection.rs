//! Per-connection read and write tasks.
//!
//! Each accepted socket gets two tasks:
//! - Read task: splits the byte stream into JSON messages and runs them
//!   through the connection's [`Session`] strictly in arrival order. It keeps
//!   reading while a message is in flight, queueing what arrives.
//! - Write task: drains an unbounded channel onto the socket, so replies and
//!   broadcasts never wait on this peer.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::time::Instant;

use super::decoder::{Decoded, MessageDecoder};
use super::registry::ConnectionHandle;
use super::session::{ConnectionState, Session};
use super::{BrokerShared, ConnectionId};
use crate::constants::{MAX_QUEUED_MESSAGES, READ_BUFFER_SIZE};
use crate::error::BridgeError;
use crate::protocol::Response;

/// Register `stream` as connection `id` and start its tasks.
///
/// Returns `false` if the broker is stopped; the stream is dropped.
pub(crate) fn spawn(shared: &Arc<BrokerShared>, id: ConnectionId, stream: UnixStream) -> bool {
    let deadline = shared
        .config
        .handshake_timeout()
        .map(|timeout| Instant::now() + timeout);

    shared.registry.insert_with(id, || {
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (state_tx, state_rx) = watch::channel(ConnectionState::AwaitingHandshake);

        let session = Session::new(
            id,
            state_tx,
            Arc::clone(&shared.store),
            Arc::clone(&shared.approver),
        );

        let read_handle = tokio::spawn(read_loop(
            Arc::clone(shared),
            id,
            read_half,
            session,
            outbound_tx.clone(),
            deadline,
        ));
        let write_handle = tokio::spawn(write_loop(id, write_half, outbound_rx));

        ConnectionHandle {
            outbound: outbound_tx,
            state: state_rx,
            read_handle,
            write_handle,
        }
    })
}

/// Read loop: decode messages and dispatch them in order.
///
/// The socket and the association deadline stay watched while a message is
/// being handled, so a peer that hangs up during a pending approval (or
/// outlives its deadline) is closed without waiting for the approver.
///
/// On exit the connection leaves the registry and its outbound sender is
/// dropped, letting the write task flush whatever is queued and close.
async fn read_loop(
    shared: Arc<BrokerShared>,
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    mut session: Session,
    outbound: UnboundedSender<Vec<u8>>,
    deadline: Option<Instant>,
) {
    let mut decoder = MessageDecoder::new(shared.config.max_message_length);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut backlog: VecDeque<Decoded> = VecDeque::new();

    'read: loop {
        while let Some(message) = backlog.pop_front() {
            let limit = deadline.filter(|_| !session.state().is_associated());
            let handling = session.handle(message);
            tokio::pin!(handling);

            let outcome = loop {
                tokio::select! {
                    biased;
                    outcome = &mut handling => break outcome,
                    read = reader.read(&mut buf), if backlog.len() < MAX_QUEUED_MESSAGES => {
                        match ingest(id, read, &buf, &mut decoder, &outbound) {
                            Some(messages) => backlog.extend(messages),
                            None => break 'read,
                        }
                    }
                    () = expire(limit) => {
                        log::info!("[Broker] {id} did not associate in time, closing");
                        break 'read;
                    }
                }
            };

            if let Some(reply) = outcome.reply {
                if outbound.send(reply.to_bytes()).is_err() {
                    break 'read;
                }
            }
            if outcome.close {
                log::warn!("[Broker] {id} closing untrusted session");
                break 'read;
            }
        }

        let limit = deadline.filter(|_| !session.state().is_associated());
        tokio::select! {
            read = reader.read(&mut buf) => {
                match ingest(id, read, &buf, &mut decoder, &outbound) {
                    Some(messages) => backlog.extend(messages),
                    None => break,
                }
            }
            () = expire(limit) => {
                log::info!("[Broker] {id} did not associate in time, closing");
                break;
            }
        }
    }

    session.close();
    drop(shared.registry.remove(id));
}

/// Feed one socket read into the decoder.
///
/// Returns `None` once the connection is finished: end of stream, a read
/// error, or bytes the decoder refuses (the peer is told why first).
fn ingest(
    id: ConnectionId,
    read: std::io::Result<usize>,
    buf: &[u8],
    decoder: &mut MessageDecoder,
    outbound: &UnboundedSender<Vec<u8>>,
) -> Option<Vec<Decoded>> {
    match read {
        Ok(0) => {
            log::info!("[Broker] {id} disconnected");
            None
        }
        Ok(n) => match decoder.feed(&buf[..n]) {
            Ok(messages) => Some(messages),
            Err(e) => {
                log::error!("[Broker] {id} decode error: {e}");
                let _ = outbound.send(Response::error("", None, &e).to_bytes());
                None
            }
        },
        Err(e) => {
            log::error!("[Broker] {id} read error: {}", BridgeError::from(e));
            None
        }
    }
}

/// Resolves at `deadline`; never resolves without one.
async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Write loop: receive encoded messages and write them to the socket.
async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outbound: UnboundedReceiver<Vec<u8>>,
) {
    while let Some(data) = outbound.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            log::error!("[Broker] {id} write error: {e}");
            return;
        }
        if let Err(e) = writer.flush().await {
            log::error!("[Broker] {id} flush error: {e}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
