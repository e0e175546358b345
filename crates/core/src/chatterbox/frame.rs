//! Length-prefixed TCP framing.
//!
//! Every frame is a little-endian u32 length followed by that many bytes.
//! Reads poll in short slices so a blocked socket still observes process
//! shutdown; interrupted and timed-out reads are retried, never surfaced.

use crate::ctx::ProcessCtx;
use bytes::{Bytes, BytesMut};
use elga_api::{ElgaError, ElgaResult};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Frames beyond this size indicate a corrupt stream.
const MAX_FRAME: u32 = 1 << 30;

const READ_TICK: Duration = Duration::from_millis(50);

/// Write one frame.
pub(crate) fn write_frame(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(data.len() as u32).to_le_bytes())?;
    stream.write_all(data)?;
    Ok(())
}

/// Fill `buf` completely. Returns false on clean EOF before the first
/// byte; EOF mid-buffer is an error.
fn read_full(stream: &mut TcpStream, buf: &mut [u8], ctx: &ProcessCtx) -> ElgaResult<bool> {
    stream.set_read_timeout(Some(READ_TICK))?;
    let mut read = 0;
    while read < buf.len() {
        match stream.read(&mut buf[read..]) {
            Ok(0) => {
                if read == 0 {
                    return Ok(false);
                }
                return Err(ElgaError::protocol("connection closed mid-frame"));
            }
            Ok(n) => read += n,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                if ctx.shutdown_requested() {
                    return Err(ElgaError::other("shutdown during read"));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Read one frame. `None` means the peer closed cleanly between frames.
pub(crate) fn read_frame(stream: &mut TcpStream, ctx: &ProcessCtx) -> ElgaResult<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    if !read_full(stream, &mut len_buf, ctx)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME {
        return Err(ElgaError::protocol(format!("oversized frame: {len}")));
    }
    let mut body = BytesMut::zeroed(len as usize);
    if len > 0 && !read_full(stream, &mut body, ctx)? {
        return Err(ElgaError::protocol("connection closed mid-frame"));
    }
    Ok(Some(body.freeze()))
}
