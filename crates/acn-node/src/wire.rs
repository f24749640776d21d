//! Length-prefixed JSON framing shared by every ACN stream.
//!
//! Each frame is a 4-byte big-endian length header followed by a JSON body.
//! The same framing carries handshake messages, [`AcnMessage`]s on the four
//! peer channels and on delegate sockets.

use crate::message::{decode_message, AcnMessage};
use acn_types::{AcnError, Status, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    /// The frame decoded but violates the ACN protocol.
    #[error("Protocol error: {0}")]
    Protocol(#[from] AcnError),
    /// The remote side answered with an error status.
    #[error("Remote replied {}: {}", .0.status_code, .0.error_messages.join("; "))]
    Rejected(Status),
    #[error("Timed out while {0}")]
    Timeout(&'static str),
    /// The request was sent on an open stream but no reply came in time.
    #[error("No reply within {0:?}")]
    NoReply(std::time::Duration),
}

impl WireError {
    /// Status to report this failure to whoever is waiting on it.
    pub fn to_status(&self) -> Status {
        match self {
            Self::Protocol(e) => e.to_status(),
            Self::Rejected(status) => status.clone(),
            Self::Json(e) => Status::error(StatusCode::ErrorSerialization, e.to_string()),
            Self::MessageTooLarge { .. } => Status::error(StatusCode::ErrorSerialization, self.to_string()),
            Self::NoReply(_) => Status::error(StatusCode::ErrorAgentNotReady, self.to_string()),
            other => Status::error(StatusCode::ErrorGeneric, other.to_string()),
        }
    }
}

/// Write one JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(value)?;
    let len = u32::try_from(json.len()).map_err(|_| WireError::MessageTooLarge {
        size: u32::MAX,
        max: u32::MAX,
    })?;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the raw body of one frame, rejecting frames over `max` bytes
/// before allocating.
pub async fn read_frame_body<R>(reader: &mut R, max: u32) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = u32::from_be_bytes(header);
    if len > max {
        return Err(WireError::MessageTooLarge { size: len, max });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Read one frame and parse it as `T`.
pub async fn read_frame<R, T>(reader: &mut R, max: u32) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let body = read_frame_body(reader, max).await?;
    Ok(serde_json::from_slice(&body)?)
}

pub async fn write_message<W>(writer: &mut W, msg: &AcnMessage) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, msg).await
}

/// Read one frame and decode it as an [`AcnMessage`].
///
/// Decoding failures surface as [`WireError::Protocol`] carrying the
/// matching status so the caller can answer before dropping the exchange.
pub async fn read_message<R>(reader: &mut R, max: u32) -> Result<AcnMessage, WireError>
where
    R: AsyncRead + Unpin,
{
    let body = read_frame_body(reader, max).await?;
    Ok(decode_message(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = AcnMessage::new(Payload::LookupRequest {
            address: "abc".into(),
        });
        write_message(&mut a, &msg).await.unwrap();
        let got = read_message(&mut b, 1024).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = a.write_all(&5000u32.to_be_bytes()).await;
        });
        match read_frame_body(&mut b, 1024).await {
            Err(WireError::MessageTooLarge { size, max }) => {
                assert_eq!(size, 5000);
                assert_eq!(max, 1024);
            }
            other => panic!("expected MessageTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_failure_statuses() {
        let too_large = WireError::MessageTooLarge { size: 5000, max: 1024 };
        assert_eq!(too_large.to_status().status_code, StatusCode::ErrorSerialization);
        let late = WireError::NoReply(std::time::Duration::from_millis(10));
        assert_eq!(late.to_status().status_code, StatusCode::ErrorAgentNotReady);
        let impostor = WireError::HandshakeFailed("wrong peer".into());
        assert_eq!(impostor.to_status().status_code, StatusCode::ErrorGeneric);
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            read_frame_body(&mut b, 1024).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let body = br#"{"version":"0.1.0","type":"status","status_code":0}"#;
        let mut reader = tokio_test::io::Builder::new()
            .read(&(body.len() as u32).to_be_bytes()[..2])
            .read(&(body.len() as u32).to_be_bytes()[2..])
            .read(&body[..10])
            .read(&body[10..])
            .build();
        let msg = read_message(&mut reader, 1024).await.unwrap();
        assert!(msg.into_status().unwrap().is_success());
    }

    #[tokio::test]
    async fn test_write_frame_emits_length_prefix() {
        let msg = AcnMessage::success();
        let json = serde_json::to_vec(&msg).unwrap();
        let mut expected = (json.len() as u32).to_be_bytes().to_vec();
        expected.extend_from_slice(&json);
        let mut writer = tokio_test::io::Builder::new().write(&expected).build();
        write_message(&mut writer, &msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_version_surfaces_status() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let raw = serde_json::json!({"version": "9.9.9", "type": "lookup_request", "address": "x"});
        write_frame(&mut a, &raw).await.unwrap();
        let err = read_message(&mut b, 1024).await.unwrap_err();
        assert_eq!(
            err.to_status().status_code,
            StatusCode::ErrorUnsupportedVersion
        );
    }
}
