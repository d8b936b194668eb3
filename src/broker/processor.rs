use super::session::Session;
use crate::auth::SecurityStore;
use crate::federation::NetworkAddress;
use crate::protocol::{
    ErrorCode, MessageReply, QueueInfoReply, Reply, Request, RequestKind,
};
use crate::queue::{QueueRegistry, QueueStatus, ResolvedQueue};
use crate::RelayError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// One pluggable request handler.
///
/// `process` turns a request into a reply; `postprocess` then decides
/// whether the session continues. The broker core routes by
/// [`RequestKind`] and never interprets request semantics itself.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    async fn process(&self, session: &Session, request: Request) -> Reply;

    fn postprocess(&self, _reply: &Reply) -> bool {
        true
    }
}

/// Explicit, compiled dispatch table built at startup. No scanning: every
/// processor is registered by hand, so the command set is statically
/// verifiable.
pub struct ProcessorRegistry {
    table: HashMap<RequestKind, Arc<dyn RequestProcessor>>,
}

impl ProcessorRegistry {
    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: RequestKind, processor: Arc<dyn RequestProcessor>) {
        self.table.insert(kind, processor);
    }

    /// The standard broker command set.
    pub fn standard(registry: Arc<QueueRegistry>, security: Arc<dyn SecurityStore>) -> Self {
        let mut table = Self::empty();
        table.register(
            RequestKind::Connect,
            Arc::new(ConnectProcessor { security }),
        );
        table.register(RequestKind::Disconnect, Arc::new(DisconnectProcessor));
        table.register(
            RequestKind::Define,
            Arc::new(DefineProcessor {
                registry: Arc::clone(&registry),
            }),
        );
        table.register(
            RequestKind::Alter,
            Arc::new(AlterProcessor {
                registry: Arc::clone(&registry),
            }),
        );
        table.register(
            RequestKind::Delete,
            Arc::new(DeleteProcessor {
                registry: Arc::clone(&registry),
            }),
        );
        table.register(
            RequestKind::Put,
            Arc::new(PutProcessor {
                registry: Arc::clone(&registry),
            }),
        );
        table.register(
            RequestKind::Get,
            Arc::new(GetProcessor {
                registry: Arc::clone(&registry),
            }),
        );
        table.register(
            RequestKind::Query,
            Arc::new(QueryProcessor {
                registry: Arc::clone(&registry),
            }),
        );
        table.register(
            RequestKind::SystemState,
            Arc::new(SystemStateProcessor { registry }),
        );
        table
    }

    /// Route one request: auth check, process, postprocess. Returns the
    /// reply and whether the session should continue.
    pub async fn dispatch(&self, session: &Session, request: Request) -> (Reply, bool) {
        let kind = request.kind();
        if kind.requires_auth() && session.user().is_none() {
            return (
                Reply::error(ErrorCode::Auth, "session is not authenticated"),
                true,
            );
        }
        let Some(processor) = self.table.get(&kind) else {
            warn!(?kind, "no processor registered");
            return (
                Reply::error(ErrorCode::Protocol, format!("no processor for {:?}", kind)),
                true,
            );
        };
        let reply = processor.process(session, request).await;
        let keep_going = processor.postprocess(&reply);
        (reply, keep_going)
    }
}

/// Map an engine error onto the reply taxonomy clients see.
fn error_reply(err: RelayError) -> Reply {
    match err {
        RelayError::QueueFull(name) => {
            Reply::error(ErrorCode::QueueFull, format!("queue full: {}", name))
        }
        RelayError::UnknownQueue(name) => {
            Reply::error(ErrorCode::UnknownQueue, format!("unknown queue: {}", name))
        }
        RelayError::Auth(reason) => Reply::error(ErrorCode::Auth, reason),
        RelayError::Remote(reason) | RelayError::Federation(reason) => {
            Reply::error(ErrorCode::Remote, reason)
        }
        RelayError::Protocol(reason) => Reply::error(ErrorCode::Protocol, reason),
        other => Reply::error(ErrorCode::Internal, other.to_string()),
    }
}

fn queue_info(status: QueueStatus) -> Reply {
    Reply::QueueInfo(QueueInfoReply {
        name: status.name,
        depth: status.depth.min(u32::MAX as usize) as u32,
        threshold: status.threshold.min(u32::MAX as usize) as u32,
        disposition: status.disposition,
    })
}

fn mismatched() -> Reply {
    Reply::error(ErrorCode::Internal, "request routed to wrong processor")
}

struct ConnectProcessor {
    security: Arc<dyn SecurityStore>,
}

#[async_trait]
impl RequestProcessor for ConnectProcessor {
    async fn process(&self, session: &Session, request: Request) -> Reply {
        let Request::Connect(req) = request else {
            return mismatched();
        };
        if self.security.authenticate(&req.user, &req.credential).await {
            session.set_user(&req.user);
            debug!(session = %session.id(), user = %req.user, "authenticated");
            Reply::Ok
        } else {
            warn!(session = %session.id(), user = %req.user, "authentication rejected");
            Reply::error(ErrorCode::Auth, format!("authentication failed for '{}'", req.user))
        }
    }
}

struct DisconnectProcessor;

#[async_trait]
impl RequestProcessor for DisconnectProcessor {
    async fn process(&self, _session: &Session, request: Request) -> Reply {
        match request {
            Request::Disconnect => Reply::Ok,
            _ => mismatched(),
        }
    }

    fn postprocess(&self, _reply: &Reply) -> bool {
        false
    }
}

struct DefineProcessor {
    registry: Arc<QueueRegistry>,
}

#[async_trait]
impl RequestProcessor for DefineProcessor {
    async fn process(&self, _session: &Session, request: Request) -> Reply {
        let Request::Define(req) = request else {
            return mismatched();
        };
        if req.threshold == 0 {
            return Reply::error(ErrorCode::Protocol, "threshold must be > 0");
        }
        match self
            .registry
            .local()
            .define_queue(&req.name, req.threshold as usize, req.disposition)
        {
            Ok(queue) => queue_info(queue.status()),
            Err(e) => error_reply(e),
        }
    }
}

struct AlterProcessor {
    registry: Arc<QueueRegistry>,
}

#[async_trait]
impl RequestProcessor for AlterProcessor {
    async fn process(&self, _session: &Session, request: Request) -> Reply {
        let Request::Alter(req) = request else {
            return mismatched();
        };
        match self.registry.local().alter_queue(
            &req.name,
            req.threshold.map(|t| t as usize),
            req.disposition,
        ) {
            Ok(()) => Reply::Ok,
            Err(e) => error_reply(e),
        }
    }
}

struct DeleteProcessor {
    registry: Arc<QueueRegistry>,
}

#[async_trait]
impl RequestProcessor for DeleteProcessor {
    async fn process(&self, _session: &Session, request: Request) -> Reply {
        let Request::Delete(req) = request else {
            return mismatched();
        };
        match self.registry.local().delete_queue(&req.name) {
            Some(_) => Reply::Ok,
            None => error_reply(RelayError::UnknownQueue(req.name)),
        }
    }
}

struct PutProcessor {
    registry: Arc<QueueRegistry>,
}

#[async_trait]
impl RequestProcessor for PutProcessor {
    async fn process(&self, session: &Session, request: Request) -> Reply {
        let Request::Put(req) = request else {
            return mismatched();
        };
        session.set_active_queue(&req.queue);
        match self.registry.resolve(&req.queue) {
            Some(ResolvedQueue::Local(queue)) => match queue.push(req.message) {
                Ok(()) => Reply::Ok,
                Err(e) => error_reply(e),
            },
            Some(ResolvedQueue::Remote(proxy)) => match proxy.put(req.message).await {
                Ok(()) => Reply::Ok,
                Err(e) => error_reply(e),
            },
            None => {
                // Undeliverable traffic goes to the dead-letter queue; the
                // client still sees the failure.
                warn!(queue = %req.queue, "put to unknown queue, dead-lettering message");
                self.registry.local().dead_letter(req.message);
                error_reply(RelayError::UnknownQueue(req.queue))
            }
        }
    }
}

struct GetProcessor {
    registry: Arc<QueueRegistry>,
}

#[async_trait]
impl RequestProcessor for GetProcessor {
    async fn process(&self, session: &Session, request: Request) -> Reply {
        let Request::Get(req) = request else {
            return mismatched();
        };
        session.set_active_queue(&req.queue);
        let result = match self.registry.resolve(&req.queue) {
            Some(ResolvedQueue::Local(queue)) => {
                self.registry.local().get(queue.name(), req.timeout_ms).await
            }
            Some(ResolvedQueue::Remote(proxy)) => proxy.get(req.timeout_ms).await,
            None => Err(RelayError::UnknownQueue(req.queue)),
        };
        match result {
            Ok(Some(message)) => Reply::Message(MessageReply { message }),
            Ok(None) => Reply::error(ErrorCode::NoMessage, "no message available"),
            Err(e) => error_reply(e),
        }
    }
}

struct QueryProcessor {
    registry: Arc<QueueRegistry>,
}

#[async_trait]
impl RequestProcessor for QueryProcessor {
    async fn process(&self, _session: &Session, request: Request) -> Reply {
        let Request::Query(req) = request else {
            return mismatched();
        };
        match self.registry.resolve(&req.queue) {
            Some(ResolvedQueue::Local(queue)) => queue_info(queue.status()),
            Some(ResolvedQueue::Remote(proxy)) => match proxy.query().await {
                Ok(status) => queue_info(status),
                Err(e) => error_reply(e),
            },
            None => error_reply(RelayError::UnknownQueue(req.queue)),
        }
    }
}

struct SystemStateProcessor {
    registry: Arc<QueueRegistry>,
}

#[async_trait]
impl RequestProcessor for SystemStateProcessor {
    async fn process(&self, _session: &Session, request: Request) -> Reply {
        let Request::SystemState(req) = request else {
            return mismatched();
        };
        let address = match NetworkAddress::new(req.host.clone(), req.port) {
            Ok(address) => address,
            Err(e) => return Reply::error(ErrorCode::Protocol, e.to_string()),
        };
        if req.activated {
            self.registry.update_peer(address, req.queue_names);
        } else {
            self.registry.remove_peer(&address);
        }
        Reply::Ok
    }
}
