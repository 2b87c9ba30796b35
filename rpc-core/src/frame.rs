//! Length-prefixed request/response frames spoken between clients and
//! downstream services.
//!
//! Request:  `u32 len | u16 method_len | method | u16 log_id_len | log_id | payload`
//! Response: `u32 len | u8 status | payload`
//!
//! All integers are big-endian; `len` counts the bytes after itself.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const STATUS_OK: u8 = 0;
const STATUS_ERR: u8 = 1;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

impl From<FrameError> for std::io::Error {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub method: String,
    pub log_id: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFrame {
    Ok(Bytes),
    /// application level failure reported by the remote handler
    Err(String),
}

pub async fn write_request<W>(w: &mut W, frame: &RequestFrame) -> Result<(), FrameError>
where W: AsyncWrite + Unpin + ?Sized
{
    let method = frame.method.as_bytes();
    let log_id = frame.log_id.as_bytes();
    if method.len() > u16::MAX as usize || log_id.len() > u16::MAX as usize {
        return Err(FrameError::Malformed("header string longer than 65535 bytes"));
    }
    let body_len = 2 + method.len() + 2 + log_id.len() + frame.payload.len();
    if body_len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body_len));
    }

    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u16(method.len() as u16);
    buf.put_slice(method);
    buf.put_u16(log_id.len() as u16);
    buf.put_slice(log_id);
    buf.put_slice(&frame.payload);

    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_request<R>(r: &mut R) -> Result<RequestFrame, FrameError>
where R: AsyncRead + Unpin + ?Sized
{
    let mut body = read_body(r).await?;
    let method = take_str(&mut body)?;
    let log_id = take_str(&mut body)?;
    Ok(RequestFrame { method, log_id, payload: body })
}

pub async fn write_response<W>(w: &mut W, frame: &ResponseFrame) -> Result<(), FrameError>
where W: AsyncWrite + Unpin + ?Sized
{
    let (status, payload) = match frame {
        ResponseFrame::Ok(p) => (STATUS_OK, p.as_ref()),
        ResponseFrame::Err(msg) => (STATUS_ERR, msg.as_bytes()),
    };
    let body_len = 1 + payload.len();
    if body_len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body_len));
    }

    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u8(status);
    buf.put_slice(payload);

    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_response<R>(r: &mut R) -> Result<ResponseFrame, FrameError>
where R: AsyncRead + Unpin + ?Sized
{
    let mut body = read_body(r).await?;
    if !body.has_remaining() {
        return Err(FrameError::Malformed("missing status byte"));
    }
    match body.get_u8() {
        STATUS_OK => Ok(ResponseFrame::Ok(body)),
        STATUS_ERR => Ok(ResponseFrame::Err(String::from_utf8_lossy(&body).into_owned())),
        _ => Err(FrameError::Malformed("unknown status byte")),
    }
}

async fn read_body<R>(r: &mut R) -> Result<Bytes, FrameError>
where R: AsyncRead + Unpin + ?Sized
{
    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

fn take_str(body: &mut Bytes) -> Result<String, FrameError> {
    if body.remaining() < 2 {
        return Err(FrameError::Malformed("truncated string length"));
    }
    let n = body.get_u16() as usize;
    if body.remaining() < n {
        return Err(FrameError::Malformed("truncated string"));
    }
    let raw = body.split_to(n);
    String::from_utf8(raw.to_vec())
        .map_err(|_| FrameError::Malformed("string is not utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let req = RequestFrame {
            method: "GetUser".to_string(),
            log_id: "20261016abc".to_string(),
            payload: Bytes::from_static(b"uid=7"),
        };
        write_request(&mut a, &req).await.unwrap();
        let got = read_request(&mut b).await.unwrap();
        assert_eq!(got, req);
    }

    #[tokio::test]
    async fn test_error_response() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_response(&mut a, &ResponseFrame::Err("no such user".into())).await.unwrap();
        write_response(&mut a, &ResponseFrame::Ok(Bytes::new())).await.unwrap();
        assert_eq!(read_response(&mut b).await.unwrap(), ResponseFrame::Err("no such user".into()));
        assert_eq!(read_response(&mut b).await.unwrap(), ResponseFrame::Ok(Bytes::new()));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_LEN + 1) as u32).await.unwrap();
        let err = read_response(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[tokio::test]
    async fn test_truncated_method() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(3).await.unwrap();
        a.write_all(&[0, 9, b'x']).await.unwrap();
        let err = read_request(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_eof_is_io_error() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_request(&mut b).await.unwrap_err();
        let io: std::io::Error = err.into();
        assert_eq!(io.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
