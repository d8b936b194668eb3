use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub type QueueName = String;

/// Whether a queue's contents survive a broker restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Permanent,
    Temporary,
}

impl Disposition {
    pub fn as_byte(self) -> u8 {
        match self {
            Disposition::Permanent => 0,
            Disposition::Temporary => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Disposition::Permanent),
            1 => Some(Disposition::Temporary),
            _ => None,
        }
    }
}

/// One queued message: an opaque body, ordered string properties, and an
/// optional absolute expiry (millis since the Unix epoch).
///
/// A message is owned by exactly one queue at a time; moving it to another
/// queue (the dead-letter queue included) transfers ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QueueMessage {
    pub body: Bytes,
    pub properties: Vec<(String, String)>,
    pub expiry: Option<u64>,
}

impl QueueMessage {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            properties: Vec::new(),
            expiry: None,
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((name.into(), value.into()));
        self
    }

    /// Expire this message `ttl_ms` from now.
    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.expiry = Some(now_millis() + ttl_ms);
        self
    }

    pub fn with_expiry(mut self, expiry_millis: u64) -> Self {
        self.expiry = Some(expiry_millis);
        self
    }

    pub fn expired(&self, now_ms: u64) -> bool {
        matches!(self.expiry, Some(at) if at <= now_ms)
    }
}

/// Current wall clock in millis since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Error codes carried in `Error` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Protocol = 1,
    Auth = 2,
    UnknownQueue = 3,
    QueueFull = 4,
    NoMessage = 5,
    Remote = 6,
    Internal = 7,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(ErrorCode::Protocol),
            2 => Some(ErrorCode::Auth),
            3 => Some(ErrorCode::UnknownQueue),
            4 => Some(ErrorCode::QueueFull),
            5 => Some(ErrorCode::NoMessage),
            6 => Some(ErrorCode::Remote),
            7 => Some(ErrorCode::Internal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub user: String,
    pub credential: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DefineQueueRequest {
    pub name: QueueName,
    pub threshold: u32,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlterQueueRequest {
    pub name: QueueName,
    pub threshold: Option<u32>,
    pub disposition: Option<Disposition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteQueueRequest {
    pub name: QueueName,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutRequest {
    pub queue: QueueName,
    pub message: QueueMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetRequest {
    pub queue: QueueName,
    /// 0 waits indefinitely on a local queue; remote proxies clamp it.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub queue: QueueName,
}

/// Federation notification: a peer announces it activated (carrying its
/// local queue names) or deactivated.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemStateRequest {
    pub activated: bool,
    pub host: String,
    pub port: u16,
    pub queue_names: Vec<QueueName>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Connect(ConnectRequest),
    Disconnect,
    Define(DefineQueueRequest),
    Alter(AlterQueueRequest),
    Delete(DeleteQueueRequest),
    Put(PutRequest),
    Get(GetRequest),
    Query(QueryRequest),
    SystemState(SystemStateRequest),
}

/// Discriminator used by the processor dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Connect,
    Disconnect,
    Define,
    Alter,
    Delete,
    Put,
    Get,
    Query,
    SystemState,
}

impl RequestKind {
    /// Everything except the connection bookends and peer notifications
    /// requires an authenticated session.
    pub fn requires_auth(self) -> bool {
        !matches!(
            self,
            RequestKind::Connect | RequestKind::Disconnect | RequestKind::SystemState
        )
    }
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Connect(_) => RequestKind::Connect,
            Request::Disconnect => RequestKind::Disconnect,
            Request::Define(_) => RequestKind::Define,
            Request::Alter(_) => RequestKind::Alter,
            Request::Delete(_) => RequestKind::Delete,
            Request::Put(_) => RequestKind::Put,
            Request::Get(_) => RequestKind::Get,
            Request::Query(_) => RequestKind::Query,
            Request::SystemState(_) => RequestKind::SystemState,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageReply {
    pub message: QueueMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueInfoReply {
    pub name: QueueName,
    pub depth: u32,
    pub threshold: u32,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Error(ErrorReply),
    Message(MessageReply),
    QueueInfo(QueueInfoReply),
}

impl Reply {
    pub fn error(code: ErrorCode, reason: impl Into<String>) -> Self {
        Reply::Error(ErrorReply {
            code,
            reason: reason.into(),
        })
    }
}

/// One header-plus-payload unit exchanged over a session connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    Reply(Reply),
}
