//! PostgreSQL simple-protocol codec subset.
//!
//! Only what the proxy needs: length-prefixed startup messages, tagged
//! frames, Query text extraction, and synthesized ErrorResponse /
//! ReadyForQuery messages. Everything else is relayed as opaque frames.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// Frames larger than this are treated as protocol corruption.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const SSL_REQUEST_CODE: u32 = 80877103;

pub const SQLSTATE_POLICY_BLOCKED: &str = "42501";
pub const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";
pub const SQLSTATE_QUERY_CANCELED: &str = "57014";
pub const SQLSTATE_INVALID_PASSWORD: &str = "28P01";
pub const SQLSTATE_DISK_FULL: &str = "53100";
pub const SQLSTATE_OUT_OF_MEMORY: &str = "53200";
pub const SQLSTATE_CONNECTION_FAILURE: &str = "08006";
pub const SQLSTATE_DATATYPE_MISMATCH: &str = "42804";

/// One tagged protocol frame. `payload` excludes tag and length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_ready_for_query(&self) -> bool {
        self.tag == b'Z'
    }

    pub fn is_error(&self) -> bool {
        self.tag == b'E'
    }

    pub fn is_terminate(&self) -> bool {
        self.tag == b'X'
    }
}

/// An untyped startup-phase message from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupMessage {
    /// SSLRequest; the proxy answers `N` itself.
    SslRequest,
    /// Raw startup bytes (length prefix included) to relay upstream.
    Startup(Vec<u8>),
}

fn corrupt(reason: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.into())
}

/// Read one startup-phase message (no tag byte).
pub async fn read_startup<R>(reader: &mut R) -> io::Result<StartupMessage>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if !(8..=MAX_FRAME_LEN).contains(&len) {
        return Err(corrupt(format!("startup length {}", len)));
    }
    let mut body = vec![0u8; len - 4];
    reader.read_exact(&mut body).await?;

    if len == 8 {
        let code = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        if code == SSL_REQUEST_CODE {
            return Ok(StartupMessage::SslRequest);
        }
    }

    let mut raw = Vec::with_capacity(len);
    raw.extend_from_slice(&(len as u32).to_be_bytes());
    raw.extend_from_slice(&body);
    Ok(StartupMessage::Startup(raw))
}

/// Read one tagged frame. `None` on a clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut tag = [0u8; 1];
    match reader.read_exact(&mut tag).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = reader.read_u32().await? as usize;
    if !(4..=MAX_FRAME_LEN).contains(&len) {
        return Err(corrupt(format!("frame length {}", len)));
    }
    let mut payload = vec![0u8; len - 4];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame {
        tag: tag[0],
        payload,
    }))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u8(frame.tag).await?;
    writer.write_u32(frame.payload.len() as u32 + 4).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await
}

/// SQL text of a Query (`Q`) frame.
pub fn query_text(frame: &Frame) -> io::Result<String> {
    if frame.tag != b'Q' {
        return Err(corrupt(format!("expected Query frame, got {}", frame.tag)));
    }
    let bytes = frame
        .payload
        .strip_suffix(&[0])
        .ok_or_else(|| corrupt("Query frame not nul-terminated"))?;
    String::from_utf8(bytes.to_vec()).map_err(|_| corrupt("Query text is not UTF-8"))
}

/// Build a Query frame from SQL text.
pub fn query(text: &str) -> Frame {
    let mut payload = Vec::with_capacity(text.len() + 1);
    payload.extend_from_slice(text.as_bytes());
    payload.push(0);
    Frame {
        tag: b'Q',
        payload,
    }
}

/// Synthesized ErrorResponse with S/C/M fields.
pub fn error_response(sqlstate: &str, message: &str) -> Frame {
    let mut payload = Vec::new();
    for (field, value) in [(b'S', "ERROR"), (b'C', sqlstate), (b'M', message)] {
        payload.push(field);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
    }
    payload.push(0);
    Frame {
        tag: b'E',
        payload,
    }
}

/// ReadyForQuery in idle transaction status.
pub fn ready_for_query() -> Frame {
    Frame {
        tag: b'Z',
        payload: vec![b'I'],
    }
}

/// The `M` (message) field of an ErrorResponse payload.
pub fn error_message(frame: &Frame) -> Option<String> {
    let mut rest = frame.payload.as_slice();
    while let Some((&field, tail)) = rest.split_first() {
        if field == 0 {
            break;
        }
        let end = tail.iter().position(|&b| b == 0)?;
        if field == b'M' {
            return String::from_utf8(tail[..end].to_vec()).ok();
        }
        rest = &tail[end + 1..];
    }
    None
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let frame = query("SELECT 1");
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        let mut reader = buf.as_slice();
        let back = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(back, frame);
        assert_eq!(query_text(&back).unwrap(), "SELECT 1");

        // Clean EOF after the frame.
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = vec![b'Q'];
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut reader = buf.as_slice();
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_ssl_request_detected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&8u32.to_be_bytes());
        buf.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        let mut reader = buf.as_slice();
        assert_eq!(
            read_startup(&mut reader).await.unwrap(),
            StartupMessage::SslRequest
        );
    }

    #[tokio::test]
    async fn test_startup_relayed_with_length_prefix() {
        let body = b"\x00\x03\x00\x00user\0agent\0\0";
        let mut buf = Vec::new();
        buf.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
        buf.extend_from_slice(body);

        let mut reader = buf.as_slice();
        let StartupMessage::Startup(raw) = read_startup(&mut reader).await.unwrap() else {
            panic!("expected startup");
        };
        assert_eq!(raw, buf);
    }

    #[test]
    fn test_error_response_fields() {
        let frame = error_response(SQLSTATE_POLICY_BLOCKED, "blocked by policy");
        assert!(frame.is_error());
        assert_eq!(error_message(&frame).as_deref(), Some("blocked by policy"));

        let text = String::from_utf8_lossy(&frame.payload).into_owned();
        assert!(text.contains("42501"));
    }

    #[test]
    fn test_error_message_absent() {
        let frame = ready_for_query();
        assert!(error_message(&frame).is_none());
    }
}
