//! Async packet framing over any `AsyncRead`/`AsyncWrite` byte stream.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{assemble, decode_header, HANDSHAKE};
use crate::{JdwpError, Packet, Result, JDWP_HEADER_LEN};

/// Read one packet. Returns `Ok(None)` on a clean EOF at a packet boundary.
pub async fn read_packet<R>(reader: &mut R) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; JDWP_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let header = decode_header(&header)?;
    let payload_len = header.length - JDWP_HEADER_LEN;
    let mut payload = Vec::new();
    payload.try_reserve_exact(payload_len).map_err(|_| {
        JdwpError::Protocol(format!(
            "unable to allocate packet buffer ({payload_len} bytes)"
        ))
    })?;
    payload.resize(payload_len, 0);
    reader.read_exact(&mut payload).await?;
    Ok(Some(assemble(header, payload)))
}

/// Write an already-encoded packet and flush it.
pub async fn write_packet<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Agent side of the handshake: wait for the debugger's greeting, echo it back.
pub async fn accept_handshake<S>(stream: &mut S, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; HANDSHAKE.len()];
    tokio::time::timeout(timeout, stream.read_exact(&mut buf))
        .await
        .map_err(|_| JdwpError::Timeout)??;
    if buf != HANDSHAKE {
        return Err(JdwpError::HandshakeFailed);
    }
    write_packet(stream, HANDSHAKE).await
}

/// Debugger side of the handshake: send the greeting, expect it echoed.
pub async fn initiate_handshake<S>(stream: &mut S, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_packet(stream, HANDSHAKE).await?;
    let mut buf = [0u8; HANDSHAKE.len()];
    tokio::time::timeout(timeout, stream.read_exact(&mut buf))
        .await
        .map_err(|_| JdwpError::Timeout)??;
    if buf != HANDSHAKE {
        return Err(JdwpError::HandshakeFailed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{encode_command, encode_reply, CommandPacket};

    #[tokio::test]
    async fn handshake_and_packets_over_duplex() {
        let (mut agent, mut debugger) = tokio::io::duplex(1024);
        let timeout = Duration::from_secs(5);

        let agent_side = tokio::spawn(async move {
            accept_handshake(&mut agent, timeout).await.unwrap();
            let packet = read_packet(&mut agent).await.unwrap().unwrap();
            write_packet(&mut agent, &encode_reply(packet.id(), 0, &[42]))
                .await
                .unwrap();
            agent
        });

        initiate_handshake(&mut debugger, timeout).await.unwrap();
        write_packet(&mut debugger, &encode_command(5, 1, 1, &[]))
            .await
            .unwrap();
        match read_packet(&mut debugger).await.unwrap().unwrap() {
            Packet::Reply(reply) => {
                assert_eq!(reply.id, 5);
                assert_eq!(reply.payload, vec![42]);
            }
            other => panic!("expected reply, got {other:?}"),
        }
        drop(agent_side.await.unwrap());
        assert!(read_packet(&mut debugger).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_a_wrong_greeting() {
        let (mut agent, mut debugger) = tokio::io::duplex(64);
        tokio::spawn(async move {
            debugger.write_all(b"NOT-A-Handshake").await.unwrap();
        });
        let err = accept_handshake(&mut agent, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, JdwpError::HandshakeFailed));
    }

    #[tokio::test]
    async fn command_payloads_survive_framing() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_packet(&mut a, &encode_command(1, 15, 1, &[1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(
            read_packet(&mut b).await.unwrap(),
            Some(Packet::Command(CommandPacket {
                id: 1,
                command_set: 15,
                command: 1,
                payload: vec![1, 2, 3],
            }))
        );
    }
}
