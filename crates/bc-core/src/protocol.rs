//! Beacon Handshake Protocol
//!
//! Every socket, inbound or outbound, starts with one identity frame in each
//! direction. A frame is an unsigned varint length prefix followed by that
//! many raw bytes.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::HandshakeError;
use crate::network::PeerId;

/// Time a connection gets to complete its handshake. Fixed at compile time.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Largest identity frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 1024;

/// Maximum encoded length of a `usize` varint
const MAX_VARINT_LEN: usize = 10;

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    let mut prefix = unsigned_varint::encode::usize_buffer();
    let prefix = unsigned_varint::encode::usize(payload.len(), &mut prefix);

    writer.write_all(prefix).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; MAX_VARINT_LEN];
    let mut used = 0;

    loop {
        let byte = reader.read_u8().await?;
        prefix[used] = byte;
        used += 1;

        if unsigned_varint::decode::is_last(byte) || used == MAX_VARINT_LEN {
            break;
        }
    }

    let (len, _) = unsigned_varint::decode::usize(&prefix[..used])?;
    if len > MAX_FRAME_LEN {
        return Err(HandshakeError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Exchange identities over a freshly opened socket.
///
/// The local frame is written while the remote frame is read, so neither side
/// waits for the other to speak first. Fails if the socket closes or errors
/// before both frames complete. The caller applies [`HANDSHAKE_TIMEOUT`].
pub async fn handshake<S>(socket: &mut S, local_id: &PeerId) -> Result<PeerId, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(socket);

    let (_, remote) = tokio::try_join!(
        write_frame(&mut writer, local_id.as_bytes()),
        read_frame(&mut reader),
    )?;

    Ok(PeerId::from_bytes(remote))
}
