//! Framed serial codec and the zero-run sync handshake.
//!
//! Frames are symmetric in both directions. A frame whose command byte has
//! bit 7 clear carries exactly one payload byte; bit 7 set means a 32-bit
//! little-endian length follows, then the payload. The sender interleaves a
//! confirmation byte of value 1 after every 256-byte block of payload,
//! measured from the end: the byte at index `i` is followed by a
//! confirmation when `(len - 1 - i) & 0xff == 0`. The receiver aborts to the
//! sync state on any other confirmation value.

use std::io::{self, Cursor};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::primitive;
use super::{Request, Response};

/// Number of consecutive zero bytes that constitute a sync run.
pub const NUM_SERIAL_SYNC_ZEROS: usize = 300;

/// The only valid confirmation byte value.
pub const CONFIRMATION: u8 = 0x01;

/// Payloads larger than this cannot be genuine; treat them as line noise.
const MAX_PAYLOAD: usize = 0x0100_0000;

/// Bytes written per chunk while emitting a response, between checks for
/// spurious inbound data.
const WRITE_CHUNK: usize = 512;

/// Errors from the framed codec.
#[derive(Debug)]
pub enum LinkError {
    /// The stream is out of sync; re-enter the sync loop.
    Desync(&'static str),
    /// The underlying stream failed; the link is dead.
    Io(io::Error),
}

impl From<io::Error> for LinkError {
    fn from(err: io::Error) -> Self {
        LinkError::Io(err)
    }
}

/// Result alias for codec operations.
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// True if the payload byte at `index` is followed by a confirmation byte.
fn confirmation_follows(len: usize, index: usize) -> bool {
    (len - 1 - index) & 0xff == 0
}

/// Encodes one frame. The compact form is used for single-byte payloads
/// unless `force_full` is set.
pub fn encode_frame(code: u8, payload: &[u8], force_full: bool) -> Vec<u8> {
    if payload.len() == 1 && !force_full {
        return vec![code & 0x7f, payload[0], CONFIRMATION];
    }

    let mut bytes = Vec::with_capacity(5 + payload.len() + payload.len() / 256 + 1);
    bytes.push(code | 0x80);
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    for (i, &b) in payload.iter().enumerate() {
        bytes.push(b);
        if confirmation_follows(payload.len(), i) {
            bytes.push(CONFIRMATION);
        }
    }
    bytes
}

/// Encodes a response frame.
pub fn encode_response(response: &Response, force_full: bool) -> Vec<u8> {
    encode_frame(response.code as u8, &response.payload, force_full)
}

/// Decodes one frame from an in-memory source. The counterpart of
/// [`encode_frame`]; used by tests and by loopback clients.
pub fn decode_frame(src: &mut Cursor<&[u8]>) -> LinkResult<(u8, Vec<u8>)> {
    let mut one = [0u8; 1];
    std::io::Read::read_exact(&mut *src, &mut one).map_err(LinkError::Io)?;
    let cmd = one[0];

    if cmd & 0x80 == 0 {
        std::io::Read::read_exact(&mut *src, &mut one).map_err(LinkError::Io)?;
        let payload = vec![one[0]];
        let mut conf = [0u8; 1];
        std::io::Read::read_exact(&mut *src, &mut conf).map_err(LinkError::Io)?;
        if conf[0] != CONFIRMATION {
            return Err(LinkError::Desync("bad confirmation byte"));
        }
        return Ok((cmd, payload));
    }

    let len = primitive::u32(src).map_err(LinkError::Io)? as usize;
    if len > MAX_PAYLOAD {
        return Err(LinkError::Desync("implausible payload length"));
    }
    let mut payload = Vec::with_capacity(len);
    for i in 0..len {
        std::io::Read::read_exact(&mut *src, &mut one).map_err(LinkError::Io)?;
        payload.push(one[0]);
        if confirmation_follows(len, i) {
            std::io::Read::read_exact(&mut *src, &mut one).map_err(LinkError::Io)?;
            if one[0] != CONFIRMATION {
                return Err(LinkError::Desync("bad confirmation byte"));
            }
        }
    }
    Ok((cmd & 0x7f, payload))
}

/// Reads one request frame from a synced stream.
///
/// Command byte 0x00 or 0x7f at request start means the BBC is out of step
/// (BREAK, or noise); the caller must re-enter the sync loop.
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> LinkResult<Request> {
    let cmd = reader.read_u8().await?;
    if cmd == 0x00 || cmd == 0x7f {
        return Err(LinkError::Desync("reserved request code"));
    }

    if cmd & 0x80 == 0 {
        let byte = reader.read_u8().await?;
        let conf = reader.read_u8().await?;
        if conf != CONFIRMATION {
            return Err(LinkError::Desync("bad confirmation byte"));
        }
        return Ok(Request::new(cmd, vec![byte]));
    }

    let len = reader.read_u32_le().await? as usize;
    if len > MAX_PAYLOAD {
        return Err(LinkError::Desync("implausible payload length"));
    }

    let mut payload = vec![0u8; len];
    let mut i = 0;
    while i < len {
        // read up to the next confirmation boundary in one go
        let run = ((len - 1 - i) & 0xff) + 1;
        reader.read_exact(&mut payload[i..i + run]).await?;
        i += run;
        let conf = reader.read_u8().await?;
        if conf != CONFIRMATION {
            return Err(LinkError::Desync("bad confirmation byte"));
        }
    }
    Ok(Request::new(cmd & 0x7f, payload))
}

/// Writes one response frame, aborting if the BBC sends anything while the
/// response is in flight (it has been reset, or pressed BREAK).
pub async fn write_response<R, W>(
    reader: &mut R,
    writer: &mut W,
    response: &Response,
    force_full: bool,
) -> LinkResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let bytes = encode_response(response, force_full);
    let mut scratch = [0u8; 64];
    for chunk in bytes.chunks(WRITE_CHUNK) {
        tokio::select! {
            biased;
            read = reader.read(&mut scratch) => {
                return match read {
                    Ok(0) => Err(LinkError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "link closed",
                    ))),
                    Ok(_) => Err(LinkError::Desync("inbound data while writing response")),
                    Err(err) => Err(LinkError::Io(err)),
                };
            }
            written = writer.write_all(chunk) => {
                written?;
            }
        }
    }
    writer.flush().await?;
    Ok(())
}

/// Runs the sync handshake from the server side:
///
/// 1. read until [`NUM_SERIAL_SYNC_ZEROS`] consecutive zero bytes arrive;
/// 2. write the same number of zeros followed by a single 0x01;
/// 3. discard further zeros; the first non-zero byte must be 0x01, anything
///    else restarts the procedure.
pub async fn synchronize<R, W>(reader: &mut R, writer: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    'restart: loop {
        let mut zeros = 0usize;
        while zeros < NUM_SERIAL_SYNC_ZEROS {
            if reader.read_u8().await? == 0 {
                zeros += 1;
            } else {
                zeros = 0;
            }
        }

        let mut out = vec![0u8; NUM_SERIAL_SYNC_ZEROS + 1];
        out[NUM_SERIAL_SYNC_ZEROS] = CONFIRMATION;
        writer.write_all(&out).await?;
        writer.flush().await?;

        loop {
            match reader.read_u8().await? {
                0 => continue,
                CONFIRMATION => return Ok(()),
                _ => continue 'restart,
            }
        }
    }
}
