//! Length-prefixed request/response frames on stdio.
//!
//! Each frame is a little-endian `u32` byte count followed by one envelope,
//! encoded as MessagePack or JSON. Responses use the codec of the request
//! they answer; unsolicited events use the codec last seen from the host.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use nbsql_core::{FailurePayload, OutboundMessage, Reply};

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Command name reserved for cancelling another in-flight request.
pub const CANCEL_COMMAND: &str = "__cancel__";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireCodec {
    Json,
    Msgpack,
}

/// The codec most recently used by the host.
#[derive(Debug, Default)]
pub struct LastCodec(AtomicBool);

impl LastCodec {
    pub fn store(&self, wire: WireCodec) {
        self.0.store(wire == WireCodec::Msgpack, Ordering::Relaxed);
    }

    pub fn load(&self) -> WireCodec {
        if self.0.load(Ordering::Relaxed) {
            WireCodec::Msgpack
        } else {
            WireCodec::Json
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct RequestContext {
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RequestEnvelope {
    pub request_id: u64,
    pub command: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub context: RequestContext,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub request_id: u64,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ResponseEnvelope {
    pub request_id: u64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailurePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, u64>>,
    /// Set on unsolicited events, which always carry `request_id` 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

impl ResponseEnvelope {
    pub fn ok(request_id: u64, payload: Option<Value>) -> Self {
        Self {
            request_id,
            status: "Ok".to_string(),
            payload,
            error: None,
            metrics: None,
            event: None,
        }
    }

    /// A failure that never reached a handler.
    pub fn failure(request_id: u64, status: &'static str, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: status.to_string(),
            payload: None,
            error: Some(FailurePayload {
                kind: status.to_string(),
                message: message.into(),
                retryable: status == "Busy",
            }),
            metrics: None,
            event: None,
        }
    }

    pub fn reply(request_id: u64, reply: Reply) -> Self {
        let mut metrics = BTreeMap::new();
        metrics.insert("exec_ms".to_string(), reply.elapsed_ms);
        Self {
            request_id,
            status: reply.status,
            payload: reply.payload,
            error: reply.error,
            metrics: Some(metrics),
            event: None,
        }
    }

    pub fn event(message: &OutboundMessage) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_value(message)?;
        let event = payload
            .get("event")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self {
            event,
            ..Self::ok(0, Some(payload))
        })
    }
}

#[derive(Debug)]
pub struct DecodedRequest {
    pub envelope: RequestEnvelope,
    pub wire: WireCodec,
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header).await {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Frame exceeds max size",
        ));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let size = u32::try_from(payload.len())
        .ok()
        .filter(|size| *size as usize <= MAX_FRAME_SIZE)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Frame exceeds max size"))?;
    writer.write_all(&size.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub fn decode_request(bytes: &[u8]) -> Result<DecodedRequest, String> {
    if let Ok(envelope) = rmp_serde::from_slice::<RequestEnvelope>(bytes) {
        return Ok(DecodedRequest {
            envelope,
            wire: WireCodec::Msgpack,
        });
    }
    let envelope = serde_json::from_slice::<RequestEnvelope>(bytes)
        .map_err(|err| format!("Invalid request: {err}"))?;
    Ok(DecodedRequest {
        envelope,
        wire: WireCodec::Json,
    })
}

pub fn encode_response(response: &ResponseEnvelope, wire: WireCodec) -> Result<Vec<u8>, String> {
    match wire {
        WireCodec::Msgpack => rmp_serde::to_vec_named(response).map_err(|err| err.to_string()),
        WireCodec::Json => serde_json::to_vec(response).map_err(|err| err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frames_round_trip_and_end_cleanly() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"hello").await.expect("write");
        drop(client);
        assert_eq!(read_frame(&mut server).await.expect("read"), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut server).await.expect("eof"), None);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes();
        let mut reader: &[u8] = &header;
        let err = read_frame(&mut reader).await.expect_err("too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn json_requests_decode_with_defaults() {
        let decoded = decode_request(br#"{"request_id": 9, "command": "refresh"}"#).expect("decode");
        assert_eq!(decoded.wire, WireCodec::Json);
        assert_eq!(decoded.envelope.request_id, 9);
        assert_eq!(decoded.envelope.payload, Value::Null);
        assert_eq!(decoded.envelope.context, RequestContext::default());
    }

    #[test]
    fn msgpack_requests_are_preferred() {
        #[derive(Serialize)]
        struct Outgoing {
            request_id: u64,
            command: &'static str,
            payload: Value,
            context: BTreeMap<&'static str, &'static str>,
        }
        let bytes = rmp_serde::to_vec_named(&Outgoing {
            request_id: 3,
            command: "executeCell",
            payload: json!({ "sql": "SELECT 1" }),
            context: BTreeMap::from([("session", "cell-1")]),
        })
        .expect("encode");
        let decoded = decode_request(&bytes).expect("decode");
        assert_eq!(decoded.wire, WireCodec::Msgpack);
        assert_eq!(decoded.envelope.payload["sql"], "SELECT 1");
        assert_eq!(decoded.envelope.context.session.as_deref(), Some("cell-1"));
    }

    #[test]
    fn garbage_is_invalid() {
        let err = decode_request(b"\xff\x00nope").expect_err("invalid");
        assert!(err.starts_with("Invalid request"));
    }

    #[test]
    fn replies_carry_exec_metrics() {
        let reply = Reply {
            status: "Ok".into(),
            payload: Some(json!({ "cancelled": false })),
            error: None,
            elapsed_ms: 12,
        };
        let response = ResponseEnvelope::reply(4, reply);
        let value: Value =
            serde_json::from_slice(&encode_response(&response, WireCodec::Json).expect("encode"))
                .expect("json");
        assert_eq!(value["metrics"]["exec_ms"], 12);
        assert!(value.get("error").is_none());
        assert!(value.get("event").is_none());
    }

    #[test]
    fn events_are_named_and_unsolicited() {
        let message = OutboundMessage::CommandFailed {
            command: "refresh".into(),
            error: FailurePayload {
                kind: "Closed".into(),
                message: "connection pool is closed".into(),
                retryable: false,
            },
        };
        let envelope = ResponseEnvelope::event(&message).expect("event");
        assert_eq!(envelope.request_id, 0);
        assert_eq!(envelope.event.as_deref(), Some("commandFailed"));
        let bytes = encode_response(&envelope, WireCodec::Msgpack).expect("msgpack");
        let back: Value = rmp_serde::from_slice(&bytes).expect("decode");
        assert_eq!(back["payload"]["error"]["kind"], "Closed");
    }

    #[test]
    fn busy_failures_are_retryable() {
        let busy = ResponseEnvelope::failure(5, "Busy", "Worker queue full");
        assert!(busy.error.as_ref().expect("error").retryable);
        let invalid = ResponseEnvelope::failure(0, "InvalidInput", "bad frame");
        assert!(!invalid.error.expect("error").retryable);
    }
}
