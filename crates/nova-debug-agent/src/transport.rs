//! Moving packets between a byte stream and a [`DebugSession`].
//!
//! The stream is split once. A writer task owns the write half and drains the
//! session's outbound channel (replies and events alike). A reader task owns
//! the read half and forwards packets to the command loop, which hands each
//! command to the blocking pool so a command that waits for threads to stop
//! never stalls the reactor. The connection dropping ends the session even
//! while a command is still running. No lock is held across I/O.

use std::sync::Arc;
use std::time::Duration;

use nova_jdwp::io::{accept_handshake, read_packet, write_packet};
use nova_jdwp::{encode_reply, CommandPacket, Packet, ERROR_NONE};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, AgentResult};
use crate::session::DebugSession;

/// Agent side of the `JDWP-Handshake` exchange.
pub async fn handshake<S>(stream: &mut S, timeout: Duration) -> AgentResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    accept_handshake(stream, timeout).await?;
    tracing::debug!(target = "nova.jdwp", "handshake complete");
    Ok(())
}

pub async fn bind(address: &str) -> AgentResult<TcpListener> {
    let listener = TcpListener::bind(address).await?;
    tracing::info!(
        target = "nova.jdwp",
        address = %listener.local_addr()?,
        "listening for debugger"
    );
    Ok(listener)
}

pub async fn dial(address: &str) -> AgentResult<TcpStream> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    tracing::info!(target = "nova.jdwp", %address, "connected to debugger");
    Ok(stream)
}

/// Drive an attached session until the debugger disposes it, the connection
/// drops, or the session is detached from elsewhere. Always leaves the session
/// detached.
pub async fn run<S>(
    session: Arc<DebugSession>,
    stream: S,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) -> AgentResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let writer = tokio::spawn(write_loop(writer, outbound));
    let closed = CancellationToken::new();
    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_loop(reader, inbound_tx, closed.clone()));

    let mut result = command_loop(&session, inbound, &closed).await;
    if closed.is_cancelled() {
        result = result.and(reader_result(reader).await);
    } else {
        reader.abort();
    }
    if let Err(err) = &result {
        tracing::warn!(target = "nova.jdwp", error = %err, "debugger connection failed");
    }

    let detaching = Arc::clone(&session);
    tokio::task::spawn_blocking(move || detaching.detach())
        .await
        .map_err(|err| AgentError::Internal(format!("detach task failed: {err}")))?;
    if let Err(err) = writer.await {
        tracing::warn!(target = "nova.jdwp", error = %err, "writer task failed");
    }
    result
}

async fn reader_result(reader: JoinHandle<AgentResult<()>>) -> AgentResult<()> {
    reader
        .await
        .map_err(|err| AgentError::Internal(format!("reader task failed: {err}")))?
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = outbound.recv().await {
        if let Err(err) = write_packet(&mut writer, &packet).await {
            tracing::debug!(target = "nova.jdwp", error = %err, "write to debugger failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Forward packets until end of stream or a read error, then cancel `closed`.
async fn read_loop<R>(
    mut reader: R,
    inbound: mpsc::UnboundedSender<Packet>,
    closed: CancellationToken,
) -> AgentResult<()>
where
    R: AsyncRead + Unpin,
{
    let result = loop {
        match read_packet(&mut reader).await {
            Ok(Some(packet)) => {
                if inbound.send(packet).is_err() {
                    break Ok(());
                }
            }
            Ok(None) => {
                tracing::info!(target = "nova.jdwp", "debugger closed the connection");
                break Ok(());
            }
            Err(err) => break Err(err.into()),
        }
    };
    closed.cancel();
    result
}

async fn command_loop(
    session: &Arc<DebugSession>,
    mut inbound: mpsc::UnboundedReceiver<Packet>,
    closed: &CancellationToken,
) -> AgentResult<()> {
    loop {
        let packet = tokio::select! {
            _ = session.detached().cancelled() => return Ok(()),
            packet = inbound.recv() => packet,
        };
        let Some(packet) = packet else {
            return Ok(());
        };
        let CommandPacket {
            id,
            command_set,
            command,
            payload,
        } = match packet {
            Packet::Command(command) => command,
            Packet::Reply(reply) => {
                tracing::warn!(
                    target = "nova.jdwp",
                    id = reply.id,
                    "ignoring reply packet from debugger"
                );
                continue;
            }
        };

        if closed.is_cancelled() {
            return Ok(());
        }
        let worker = Arc::clone(session);
        let handler = tokio::task::spawn_blocking(move || {
            worker.handle_command(command_set, command, &payload)
        });
        // A command may wait on threads for a long time; losing the
        // connection meanwhile detaches, which is what ends the wait.
        let result = tokio::select! {
            joined = handler => joined
                .map_err(|err| AgentError::Internal(format!("command handler failed: {err}")))?,
            _ = closed.cancelled() => {
                tracing::debug!(
                    target = "nova.jdwp",
                    id,
                    command_set,
                    command,
                    "connection lost while a command was running"
                );
                return Ok(());
            }
        };

        let reply = match result {
            Ok(body) => encode_reply(id, ERROR_NONE, &body),
            Err(err) => {
                tracing::debug!(
                    target = "nova.jdwp",
                    id,
                    command_set,
                    command,
                    error = %err,
                    "command failed"
                );
                encode_reply(id, err.error_code(), &[])
            }
        };
        session.send_packet(reply);
        if session.is_disposed() {
            return Ok(());
        }
    }
}
