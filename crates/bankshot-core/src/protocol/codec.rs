//! Line framing for the RPC socket.
//!
//! One JSON object per `\n`-terminated line, at most [`MAX_FRAME_SIZE`]
//! bytes. Reads accumulate into a [`BytesMut`] and split one frame off the
//! front; a buffer that outgrows the cap without a newline is a protocol
//! error on the spot, so a hostile peer cannot make the reader buffer
//! unboundedly. Writers refuse to emit an oversized frame symmetrically.
//!
//! The wire contract is one exchange per connection, so each `read_frame`
//! call owns its buffer; bytes past the first newline are dropped with the
//! connection.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::{Error, Result};
use crate::protocol::{Request, Response};

/// Read one frame. Returns `Ok(None)` on clean EOF before any bytes.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8192);

    loop {
        if let Some(frame) = split_frame(&mut buf)? {
            return Ok(Some(frame));
        }
        if buf.len() > MAX_FRAME_SIZE {
            return Err(oversized());
        }

        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            // EOF mid-line: tolerate a missing trailing newline and let the
            // JSON parser judge what arrived.
            return frame_to_string(buf.split()).map(Some);
        }
    }
}

/// Split one `\n`-terminated frame off the front of the buffer, consuming
/// the newline. Returns `Ok(None)` when no complete frame is buffered yet.
fn split_frame(buf: &mut BytesMut) -> Result<Option<String>> {
    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    if newline > MAX_FRAME_SIZE {
        return Err(oversized());
    }

    let frame = buf.split_to(newline);
    buf.advance(1);
    frame_to_string(frame).map(Some)
}

fn frame_to_string(frame: BytesMut) -> Result<String> {
    String::from_utf8(frame.to_vec()).map_err(|e| Error::Protocol {
        message: format!("frame is not valid UTF-8: {}", e),
    })
}

fn oversized() -> Error {
    Error::Protocol {
        message: format!("frame exceeds {} bytes", MAX_FRAME_SIZE),
    }
}

/// Serialize a value as one frame and flush it.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let payload = serde_json::to_vec(value).map_err(|e| Error::Internal {
        message: format!("failed to serialize frame: {}", e),
    })?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(oversized());
    }

    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_slice(&payload);
    buf.put_u8(b'\n');

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Parse a frame into a [`Request`].
pub fn parse_request(line: &str) -> Result<Request> {
    serde_json::from_str(line).map_err(|e| Error::Protocol {
        message: format!("invalid request frame: {}", e),
    })
}

/// Parse a frame into a [`Response`].
pub fn parse_response(line: &str) -> Result<Response> {
    serde_json::from_str(line).map_err(|e| Error::Protocol {
        message: format!("invalid response frame: {}", e),
    })
}
