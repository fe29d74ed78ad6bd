//! Length-prefixed frames for the binary RPC transport.
//!
//! Each frame is a 4-byte big-endian length followed by a JSON envelope.
//! Calls are multiplexed over one connection by `call_id`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::wire::{WireBatchRequest, WireBatchResponse, WireCheckRequest, WireCheckResponse};
use crate::error::{Result, TransportError};

/// Largest frame body either side accepts (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Call metadata carried next to every frame (trace headers, auth).
pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub call_id: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: Metadata,
    pub body: FrameBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum FrameBody {
    Check(WireCheckRequest),
    CheckBatch(WireBatchRequest),
    CheckResult(WireCheckResponse),
    BatchResult(WireBatchResponse),
    StreamOpen,
    StreamMessage(WireCheckRequest),
    StreamResponse(WireCheckResponse),
    StreamEnd,
    Ping,
    Pong,
    Error { code: String, message: String },
}

impl Frame {
    pub fn new(call_id: u64, body: FrameBody) -> Self {
        Self {
            call_id,
            headers: Metadata::new(),
            body,
        }
    }

    pub fn with_headers(mut self, headers: Metadata) -> Self {
        self.headers = headers;
        self
    }
}

/// Serialize a frame including its length prefix.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(TransportError::Protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_frame(frame)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean EOF between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::Protocol(format!(
            "frame of {len} bytes exceeds limit of {MAX_FRAME_SIZE}"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let frame = serde_json::from_slice(&body)?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::wire::WireStruct;

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let mut headers = Metadata::new();
        headers.insert("traceparent".into(), "00-abc-def-01".into());
        let frame = Frame::new(7, FrameBody::Ping).with_headers(headers);

        write_frame(&mut client, &frame).await.unwrap();
        write_frame(
            &mut client,
            &Frame::new(
                8,
                FrameBody::Error {
                    code: "unavailable".into(),
                    message: "draining".into(),
                },
            ),
        )
        .await
        .unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap(), Some(frame));
        let second = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(second.call_id, 8);
        assert!(matches!(second.body, FrameBody::Error { ref code, .. } if code == "unavailable"));
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejects_oversized_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn test_envelope_shape() {
        let frame = Frame::new(
            1,
            FrameBody::StreamMessage(WireCheckRequest {
                request_id: "r1".into(),
                context: WireStruct::default(),
                ..Default::default()
            }),
        );
        let encoded = encode_frame(&frame).unwrap();
        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(len, encoded.len() - 4);

        let json: serde_json::Value = serde_json::from_slice(&encoded[4..]).unwrap();
        assert_eq!(json["body"]["type"], "stream_message");
        assert_eq!(json["body"]["payload"]["request_id"], "r1");
        assert!(json.get("headers").is_none());
    }
}
