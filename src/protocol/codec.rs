use super::messages::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Constant written at the start of every frame. A stream whose next frame
/// does not begin with these bytes is foreign or corrupted.
pub const EYE_CATCHER: [u8; 4] = *b"RMQW";

pub const PROTOCOL_VERSION: u8 = 1;

/// eye-catcher(4) + version(1) + class(1) + sub(1) + payload length(4)
const HEADER_LEN: usize = 11;

/// Upper bound on a single payload; anything larger is treated as garbage.
const MAX_PAYLOAD_LEN: usize = 8 * 1024 * 1024;

pub const CLASS_REQUEST: u8 = 1;
pub const CLASS_REPLY: u8 = 2;
pub const CLASS_SYSTEM: u8 = 3;

const SUB_CONNECT: u8 = 1;
const SUB_DISCONNECT: u8 = 2;
const SUB_DEFINE: u8 = 3;
const SUB_ALTER: u8 = 4;
const SUB_DELETE: u8 = 5;
const SUB_PUT: u8 = 6;
const SUB_GET: u8 = 7;
const SUB_QUERY: u8 = 8;

const SUB_OK: u8 = 1;
const SUB_ERROR: u8 = 2;
const SUB_MESSAGE: u8 = 3;
const SUB_QUEUE_INFO: u8 = 4;

const SUB_SYSTEM_STATE: u8 = 1;

#[derive(Debug, Error)]
pub enum FrameCodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted stream: bad eye-catcher")]
    CorruptedStream,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown frame class={class_id} sub={sub_type}")]
    UnknownFrame { class_id: u8, sub_type: u8 },

    #[error("invalid frame format: {0}")]
    InvalidFormat(String),

    #[error("payload length {0} exceeds limit")]
    PayloadTooLarge(usize),
}

type CodecResult<T> = std::result::Result<T, FrameCodecError>;

/// Fixed-layout header written before every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub eye_catcher: [u8; 4],
    pub version: u8,
    pub class_id: u8,
    pub sub_type: u8,
    pub payload_len: u32,
}

impl FrameHeader {
    /// Reject a foreign stream before any payload decode is attempted.
    pub fn verify(&self) -> CodecResult<()> {
        if self.eye_catcher != EYE_CATCHER {
            return Err(FrameCodecError::CorruptedStream);
        }
        if self.version != PROTOCOL_VERSION {
            return Err(FrameCodecError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

// --- primitive field encoders (big-endian, length-prefixed) ---

fn need(src: &Bytes, n: usize) -> CodecResult<()> {
    if src.remaining() < n {
        return Err(FrameCodecError::InvalidFormat(format!(
            "truncated payload: need {} bytes, have {}",
            n,
            src.remaining()
        )));
    }
    Ok(())
}

fn put_string(dst: &mut BytesMut, s: &str) -> CodecResult<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| FrameCodecError::InvalidFormat("string exceeds u16::MAX bytes".into()))?;
    dst.put_u16(len);
    dst.put_slice(s.as_bytes());
    Ok(())
}

fn get_string(src: &mut Bytes) -> CodecResult<String> {
    need(src, 2)?;
    let len = src.get_u16() as usize;
    need(src, len)?;
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| FrameCodecError::InvalidFormat("string is not valid utf-8".into()))
}

fn put_bytes(dst: &mut BytesMut, b: &Bytes) -> CodecResult<()> {
    let len = u32::try_from(b.len())
        .map_err(|_| FrameCodecError::InvalidFormat("bytes exceed u32::MAX".into()))?;
    dst.put_u32(len);
    dst.put_slice(b);
    Ok(())
}

fn get_bytes(src: &mut Bytes) -> CodecResult<Bytes> {
    need(src, 4)?;
    let len = src.get_u32() as usize;
    need(src, len)?;
    Ok(src.split_to(len))
}

fn get_u8(src: &mut Bytes) -> CodecResult<u8> {
    need(src, 1)?;
    Ok(src.get_u8())
}

fn get_u16(src: &mut Bytes) -> CodecResult<u16> {
    need(src, 2)?;
    Ok(src.get_u16())
}

fn get_u32(src: &mut Bytes) -> CodecResult<u32> {
    need(src, 4)?;
    Ok(src.get_u32())
}

fn get_u64(src: &mut Bytes) -> CodecResult<u64> {
    need(src, 8)?;
    Ok(src.get_u64())
}

fn get_disposition(src: &mut Bytes) -> CodecResult<Disposition> {
    let b = get_u8(src)?;
    Disposition::from_byte(b)
        .ok_or_else(|| FrameCodecError::InvalidFormat(format!("invalid disposition byte {}", b)))
}

// --- message encoding, shared with the queue snapshot store ---

/// Message layout:
/// `[body: u32-prefixed bytes][prop count: u16][(u16 name, u16 value)...]`
/// `[expiry flag: u8][expiry: u64, only when flag = 1]`
/// Property order on the wire is insertion order.
pub fn encode_message(message: &QueueMessage, dst: &mut BytesMut) -> CodecResult<()> {
    put_bytes(dst, &message.body)?;
    let count = u16::try_from(message.properties.len())
        .map_err(|_| FrameCodecError::InvalidFormat("too many message properties".into()))?;
    dst.put_u16(count);
    for (name, value) in &message.properties {
        put_string(dst, name)?;
        put_string(dst, value)?;
    }
    match message.expiry {
        Some(at) => {
            dst.put_u8(1);
            dst.put_u64(at);
        }
        None => dst.put_u8(0),
    }
    Ok(())
}

pub fn decode_message(src: &mut Bytes) -> CodecResult<QueueMessage> {
    let body = get_bytes(src)?;
    let count = get_u16(src)? as usize;
    let mut properties = Vec::with_capacity(count);
    for _ in 0..count {
        let name = get_string(src)?;
        let value = get_string(src)?;
        properties.push((name, value));
    }
    let expiry = match get_u8(src)? {
        0 => None,
        1 => Some(get_u64(src)?),
        b => {
            return Err(FrameCodecError::InvalidFormat(format!(
                "invalid expiry flag {}",
                b
            )))
        }
    };
    Ok(QueueMessage {
        body,
        properties,
        expiry,
    })
}

impl Frame {
    fn class_and_sub(&self) -> (u8, u8) {
        match self {
            Frame::Request(req) => match req {
                Request::Connect(_) => (CLASS_REQUEST, SUB_CONNECT),
                Request::Disconnect => (CLASS_REQUEST, SUB_DISCONNECT),
                Request::Define(_) => (CLASS_REQUEST, SUB_DEFINE),
                Request::Alter(_) => (CLASS_REQUEST, SUB_ALTER),
                Request::Delete(_) => (CLASS_REQUEST, SUB_DELETE),
                Request::Put(_) => (CLASS_REQUEST, SUB_PUT),
                Request::Get(_) => (CLASS_REQUEST, SUB_GET),
                Request::Query(_) => (CLASS_REQUEST, SUB_QUERY),
                Request::SystemState(_) => (CLASS_SYSTEM, SUB_SYSTEM_STATE),
            },
            Frame::Reply(reply) => match reply {
                Reply::Ok => (CLASS_REPLY, SUB_OK),
                Reply::Error(_) => (CLASS_REPLY, SUB_ERROR),
                Reply::Message(_) => (CLASS_REPLY, SUB_MESSAGE),
                Reply::QueueInfo(_) => (CLASS_REPLY, SUB_QUEUE_INFO),
            },
        }
    }

    fn encode_payload(&self, dst: &mut BytesMut) -> CodecResult<()> {
        match self {
            Frame::Request(Request::Connect(req)) => {
                put_string(dst, &req.user)?;
                put_string(dst, &req.credential)?;
            }
            Frame::Request(Request::Disconnect) => {}
            Frame::Request(Request::Define(req)) => {
                put_string(dst, &req.name)?;
                dst.put_u32(req.threshold);
                dst.put_u8(req.disposition.as_byte());
            }
            Frame::Request(Request::Alter(req)) => {
                put_string(dst, &req.name)?;
                match req.threshold {
                    Some(t) => {
                        dst.put_u8(1);
                        dst.put_u32(t);
                    }
                    None => dst.put_u8(0),
                }
                match req.disposition {
                    Some(d) => {
                        dst.put_u8(1);
                        dst.put_u8(d.as_byte());
                    }
                    None => dst.put_u8(0),
                }
            }
            Frame::Request(Request::Delete(req)) => {
                put_string(dst, &req.name)?;
            }
            Frame::Request(Request::Put(req)) => {
                put_string(dst, &req.queue)?;
                encode_message(&req.message, dst)?;
            }
            Frame::Request(Request::Get(req)) => {
                put_string(dst, &req.queue)?;
                dst.put_u64(req.timeout_ms);
            }
            Frame::Request(Request::Query(req)) => {
                put_string(dst, &req.queue)?;
            }
            Frame::Request(Request::SystemState(req)) => {
                dst.put_u8(u8::from(req.activated));
                put_string(dst, &req.host)?;
                dst.put_u16(req.port);
                let count = u16::try_from(req.queue_names.len()).map_err(|_| {
                    FrameCodecError::InvalidFormat("too many advertised queue names".into())
                })?;
                dst.put_u16(count);
                for name in &req.queue_names {
                    put_string(dst, name)?;
                }
            }
            Frame::Reply(Reply::Ok) => {}
            Frame::Reply(Reply::Error(reply)) => {
                dst.put_u16(reply.code.as_u16());
                put_string(dst, &reply.reason)?;
            }
            Frame::Reply(Reply::Message(reply)) => {
                encode_message(&reply.message, dst)?;
            }
            Frame::Reply(Reply::QueueInfo(reply)) => {
                put_string(dst, &reply.name)?;
                dst.put_u32(reply.depth);
                dst.put_u32(reply.threshold);
                dst.put_u8(reply.disposition.as_byte());
            }
        }
        Ok(())
    }

    /// Closed payload decoder registry: class + sub-type select the concrete
    /// decoder; unknown combinations are a decode error.
    fn decode_payload(class_id: u8, sub_type: u8, src: &mut Bytes) -> CodecResult<Frame> {
        let frame = match (class_id, sub_type) {
            (CLASS_REQUEST, SUB_CONNECT) => Frame::Request(Request::Connect(ConnectRequest {
                user: get_string(src)?,
                credential: get_string(src)?,
            })),
            (CLASS_REQUEST, SUB_DISCONNECT) => Frame::Request(Request::Disconnect),
            (CLASS_REQUEST, SUB_DEFINE) => Frame::Request(Request::Define(DefineQueueRequest {
                name: get_string(src)?,
                threshold: get_u32(src)?,
                disposition: get_disposition(src)?,
            })),
            (CLASS_REQUEST, SUB_ALTER) => {
                let name = get_string(src)?;
                let threshold = match get_u8(src)? {
                    0 => None,
                    _ => Some(get_u32(src)?),
                };
                let disposition = match get_u8(src)? {
                    0 => None,
                    _ => Some(get_disposition(src)?),
                };
                Frame::Request(Request::Alter(AlterQueueRequest {
                    name,
                    threshold,
                    disposition,
                }))
            }
            (CLASS_REQUEST, SUB_DELETE) => Frame::Request(Request::Delete(DeleteQueueRequest {
                name: get_string(src)?,
            })),
            (CLASS_REQUEST, SUB_PUT) => Frame::Request(Request::Put(PutRequest {
                queue: get_string(src)?,
                message: decode_message(src)?,
            })),
            (CLASS_REQUEST, SUB_GET) => Frame::Request(Request::Get(GetRequest {
                queue: get_string(src)?,
                timeout_ms: get_u64(src)?,
            })),
            (CLASS_REQUEST, SUB_QUERY) => Frame::Request(Request::Query(QueryRequest {
                queue: get_string(src)?,
            })),
            (CLASS_SYSTEM, SUB_SYSTEM_STATE) => {
                let activated = get_u8(src)? != 0;
                let host = get_string(src)?;
                let port = get_u16(src)?;
                let count = get_u16(src)? as usize;
                let mut queue_names = Vec::with_capacity(count);
                for _ in 0..count {
                    queue_names.push(get_string(src)?);
                }
                Frame::Request(Request::SystemState(SystemStateRequest {
                    activated,
                    host,
                    port,
                    queue_names,
                }))
            }
            (CLASS_REPLY, SUB_OK) => Frame::Reply(Reply::Ok),
            (CLASS_REPLY, SUB_ERROR) => {
                let raw = get_u16(src)?;
                let code = ErrorCode::from_u16(raw).ok_or_else(|| {
                    FrameCodecError::InvalidFormat(format!("unknown error code {}", raw))
                })?;
                Frame::Reply(Reply::Error(ErrorReply {
                    code,
                    reason: get_string(src)?,
                }))
            }
            (CLASS_REPLY, SUB_MESSAGE) => Frame::Reply(Reply::Message(MessageReply {
                message: decode_message(src)?,
            })),
            (CLASS_REPLY, SUB_QUEUE_INFO) => Frame::Reply(Reply::QueueInfo(QueueInfoReply {
                name: get_string(src)?,
                depth: get_u32(src)?,
                threshold: get_u32(src)?,
                disposition: get_disposition(src)?,
            })),
            _ => return Err(FrameCodecError::UnknownFrame { class_id, sub_type }),
        };

        if src.has_remaining() {
            return Err(FrameCodecError::InvalidFormat(format!(
                "{} trailing bytes after payload",
                src.remaining()
            )));
        }
        Ok(frame)
    }
}

/// Decoder output: a well-formed frame, or a recoverable protocol fault.
///
/// Faults surface as items rather than `Decoder` errors because `Framed`
/// fuses the stream after a decode error; in-band faults let a session
/// report the bad frame and keep reading. Only genuine I/O failures come
/// out as errors.
#[derive(Debug)]
pub enum DecodedFrame {
    Frame(Frame),
    Invalid(FrameCodecError),
}

/// Frame codec for `tokio_util::codec::Framed`.
///
/// A bad frame leaves the read buffer positioned at the next frame boundary
/// wherever the length field is trustworthy, so the stream resynchronizes
/// after the fault is reported.
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = DecodedFrame;
    type Error = FrameCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> CodecResult<Option<DecodedFrame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = FrameHeader {
            eye_catcher: [src[0], src[1], src[2], src[3]],
            version: src[4],
            class_id: src[5],
            sub_type: src[6],
            payload_len: u32::from_be_bytes([src[7], src[8], src[9], src[10]]),
        };

        if header.eye_catcher != EYE_CATCHER {
            // The length field cannot be trusted either; skip what looks like
            // one frame if the claimed length is plausible, otherwise drop
            // the whole buffer and let the peer resynchronize.
            let claimed = header.payload_len as usize;
            let skip = if claimed <= MAX_PAYLOAD_LEN {
                (HEADER_LEN + claimed).min(src.len())
            } else {
                src.len()
            };
            src.advance(skip);
            return Ok(Some(DecodedFrame::Invalid(FrameCodecError::CorruptedStream)));
        }

        let payload_len = header.payload_len as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            src.advance(src.len());
            return Ok(Some(DecodedFrame::Invalid(FrameCodecError::PayloadTooLarge(
                payload_len,
            ))));
        }

        let total = HEADER_LEN + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        // Full frame buffered; consume it before any fallible decode so a
        // fault never leaves the bad frame in the buffer.
        let mut frame_bytes = src.split_to(total);
        frame_bytes.advance(HEADER_LEN);
        let mut payload = frame_bytes.freeze();

        if let Err(e) = header.verify() {
            return Ok(Some(DecodedFrame::Invalid(e)));
        }
        match Frame::decode_payload(header.class_id, header.sub_type, &mut payload) {
            Ok(frame) => {
                trace!(
                    class = header.class_id,
                    sub = header.sub_type,
                    len = payload_len,
                    "decoded frame"
                );
                Ok(Some(DecodedFrame::Frame(frame)))
            }
            Err(e) => Ok(Some(DecodedFrame::Invalid(e))),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameCodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> CodecResult<()> {
        let (class_id, sub_type) = item.class_and_sub();

        let mut payload = BytesMut::new();
        item.encode_payload(&mut payload)?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameCodecError::PayloadTooLarge(payload.len()));
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_slice(&EYE_CATCHER);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(class_id);
        dst.put_u8(sub_type);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).expect("encode");
        match codec
            .decode(&mut buf)
            .expect("decode")
            .expect("complete frame")
        {
            DecodedFrame::Frame(frame) => frame,
            DecodedFrame::Invalid(e) => panic!("invalid frame: {}", e),
        }
    }

    #[test]
    fn put_request_round_trip() {
        let message = QueueMessage::new("payload")
            .with_property("origin", "test")
            .with_expiry(1_700_000_000_000);
        let frame = Frame::Request(Request::Put(PutRequest {
            queue: "APPQ".to_string(),
            message: message.clone(),
        }));
        match round_trip(frame) {
            Frame::Request(Request::Put(req)) => {
                assert_eq!(req.queue, "APPQ");
                assert_eq!(req.message, message);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn alter_request_round_trip_preserves_absent_fields() {
        let frame = Frame::Request(Request::Alter(AlterQueueRequest {
            name: "APPQ".to_string(),
            threshold: Some(32),
            disposition: None,
        }));
        match round_trip(frame) {
            Frame::Request(Request::Alter(req)) => {
                assert_eq!(req.threshold, Some(32));
                assert_eq!(req.disposition, None);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn system_state_round_trip() {
        let frame = Frame::Request(Request::SystemState(SystemStateRequest {
            activated: true,
            host: "broker-a".to_string(),
            port: 4590,
            queue_names: vec!["Q1".to_string(), "Q2".to_string()],
        }));
        match round_trip(frame) {
            Frame::Request(Request::SystemState(req)) => {
                assert!(req.activated);
                assert_eq!(req.queue_names, vec!["Q1", "Q2"]);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn error_reply_round_trip() {
        let frame = Frame::Reply(Reply::error(ErrorCode::QueueFull, "queue full: APPQ"));
        match round_trip(frame) {
            Frame::Reply(Reply::Error(reply)) => {
                assert_eq!(reply.code, ErrorCode::QueueFull);
                assert_eq!(reply.reason, "queue full: APPQ");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn partial_header_returns_none() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&b"RMQ"[..]);
        assert!(codec.decode(&mut buf).expect("incomplete").is_none());
    }

    #[test]
    fn partial_payload_returns_none() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::Request(Request::Query(QueryRequest {
                    queue: "APPQ".to_string(),
                })),
                &mut buf,
            )
            .expect("encode");
        let mut truncated = BytesMut::from(&buf[..buf.len() - 2]);
        assert!(codec.decode(&mut truncated).expect("incomplete").is_none());
    }

    #[test]
    fn bad_eye_catcher_is_corrupted_stream_and_resyncs() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::Request(Request::Disconnect), &mut buf)
            .expect("encode");
        // Corrupt the eye-catcher, then append a valid frame behind it.
        buf[0] = b'X';
        codec
            .encode(Frame::Reply(Reply::Ok), &mut buf)
            .expect("encode");

        match codec.decode(&mut buf) {
            Ok(Some(DecodedFrame::Invalid(FrameCodecError::CorruptedStream))) => {}
            other => panic!("expected corrupted stream, got {:?}", other),
        }
        // The buffer resynchronized onto the valid frame that followed.
        match codec.decode(&mut buf) {
            Ok(Some(DecodedFrame::Frame(Frame::Reply(Reply::Ok)))) => {}
            other => panic!("expected ok reply, got {:?}", other),
        }
    }

    #[test]
    fn unsupported_version_is_invalid_not_fatal() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_slice(&EYE_CATCHER);
        buf.put_u8(99);
        buf.put_u8(CLASS_REQUEST);
        buf.put_u8(SUB_DISCONNECT);
        buf.put_u32(0);
        codec
            .encode(Frame::Reply(Reply::Ok), &mut buf)
            .expect("encode");

        match codec.decode(&mut buf) {
            Ok(Some(DecodedFrame::Invalid(FrameCodecError::UnsupportedVersion(99)))) => {}
            other => panic!("expected unsupported version, got {:?}", other),
        }
        match codec.decode(&mut buf) {
            Ok(Some(DecodedFrame::Frame(Frame::Reply(Reply::Ok)))) => {}
            other => panic!("expected ok reply, got {:?}", other),
        }
    }

    #[test]
    fn unknown_sub_type_is_decode_error() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_slice(&EYE_CATCHER);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(CLASS_REQUEST);
        buf.put_u8(200);
        buf.put_u32(0);
        match codec.decode(&mut buf) {
            Ok(Some(DecodedFrame::Invalid(FrameCodecError::UnknownFrame {
                sub_type: 200, ..
            }))) => {}
            other => panic!("expected unknown frame, got {:?}", other),
        }
        // The bad frame was consumed; the stream can continue.
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_slice(&EYE_CATCHER);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(CLASS_REQUEST);
        buf.put_u8(SUB_QUERY);
        buf.put_u32(u32::MAX);
        match codec.decode(&mut buf) {
            Ok(Some(DecodedFrame::Invalid(FrameCodecError::PayloadTooLarge(_)))) => {}
            other => panic!("expected payload too large, got {:?}", other),
        }
    }

    #[test]
    fn message_without_expiry_never_expires() {
        let message = QueueMessage::new("body");
        assert!(!message.expired(u64::MAX));
    }

    #[test]
    fn ttl_sets_absolute_expiry_in_the_future() {
        let message = QueueMessage::new("body").with_ttl(60_000);
        let expiry = message.expiry.expect("expiry set");
        assert!(!message.expired(now_millis()));
        assert!(message.expired(expiry));
    }
}
