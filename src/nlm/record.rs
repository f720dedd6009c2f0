//! RPC-over-TCP record marking (RFC 5531 §11): every message is a
//! sequence of fragments, each prefixed by a 4-byte header whose top
//! bit marks the last fragment and whose low 31 bits give its length.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

const LAST_FRAGMENT_BIT: u32 = 0x8000_0000;

/// Largest single RPC message this crate will read off the wire before
/// giving up, independent of any fragment's individually claimed size.
/// Matches the 1 MiB cap applied to GRANTED replies (spec §4.4).
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

fn io_err(err: std::io::Error) -> Error {
    Error::IOError(err.to_string())
}

/// Reads a complete RPC message (one or more record-marked fragments)
/// from `stream`.
pub async fn read_message(stream: &mut (impl AsyncRead + Unpin)) -> Result<Vec<u8>> {
    let mut message = Vec::new();
    loop {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.map_err(io_err)?;
        let header = u32::from_be_bytes(header);
        let last = header & LAST_FRAGMENT_BIT != 0;
        let len = (header & !LAST_FRAGMENT_BIT) as usize;

        if message.len() + len > MAX_MESSAGE_LEN {
            return Err(Error::InvalidArgument("rpc message exceeds maximum size"));
        }

        let mut fragment = vec![0u8; len];
        stream.read_exact(&mut fragment).await.map_err(io_err)?;
        message.extend_from_slice(&fragment);

        if last {
            return Ok(message);
        }
    }
}

/// Writes `payload` as a single-fragment RPC message.
pub async fn write_message(stream: &mut (impl AsyncWrite + Unpin), payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_MESSAGE_LEN {
        return Err(Error::InvalidArgument("rpc message exceeds maximum size"));
    }
    let header = (payload.len() as u32) | LAST_FRAGMENT_BIT;
    stream.write_all(&header.to_be_bytes()).await.map_err(io_err)?;
    stream.write_all(payload).await.map_err(io_err)?;
    stream.flush().await.map_err(io_err)
}
