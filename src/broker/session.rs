use super::processor::ProcessorRegistry;
use crate::protocol::{DecodedFrame, ErrorCode, Frame, FrameCodec, Reply};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-connection session state.
///
/// Exactly one handler owns a session. Nothing else mutates it except the
/// controller clearing `running` during shutdown; the handler observes that
/// at the top of its loop, never mid-frame.
pub struct Session {
    id: Uuid,
    peer: SocketAddr,
    user: RwLock<Option<String>>,
    active_queue: RwLock<Option<String>>,
    running: AtomicBool,
}

impl Session {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            user: RwLock::new(None),
            active_queue: RwLock::new(None),
            running: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn user(&self) -> Option<String> {
        self.user.read().clone()
    }

    pub fn set_user(&self, user: impl Into<String>) {
        *self.user.write() = Some(user.into());
    }

    pub fn active_queue(&self) -> Option<String> {
        self.active_queue.read().clone()
    }

    pub fn set_active_queue(&self, name: impl Into<String>) {
        *self.active_queue.write() = Some(name.into());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Cooperative stop signal; the owning handler exits on its next loop
    /// iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Runs one session's receive-dispatch-reply loop.
pub struct SessionHandler {
    session: Arc<Session>,
    framed: Framed<TcpStream, FrameCodec>,
    processors: Arc<ProcessorRegistry>,
    sessions: Arc<DashMap<Uuid, Arc<Session>>>,
    socket_timeout: Duration,
}

impl SessionHandler {
    pub fn new(
        stream: TcpStream,
        session: Arc<Session>,
        processors: Arc<ProcessorRegistry>,
        sessions: Arc<DashMap<Uuid, Arc<Session>>>,
        socket_timeout: Duration,
    ) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec),
            session,
            processors,
            sessions,
            socket_timeout,
        }
    }

    /// ACCEPTED -> RUNNING -> ENDED. Registers with the controller on entry
    /// and removes itself on exit; per-session faults never escape the
    /// handler.
    pub async fn run(mut self) {
        self.sessions
            .insert(self.session.id(), Arc::clone(&self.session));
        info!(session = %self.session.id(), peer = %self.session.peer(), "session started");

        while self.session.is_running() {
            let frame = match timeout(self.socket_timeout, self.framed.next()).await {
                // Read timeout is not an error: re-enter the wait so the
                // stop signal gets observed periodically.
                Err(_) => continue,
                Ok(None) => {
                    debug!(session = %self.session.id(), "peer closed connection");
                    break;
                }
                Ok(Some(Err(e))) => {
                    warn!(session = %self.session.id(), "connection error: {}", e);
                    break;
                }
                Ok(Some(Ok(DecodedFrame::Invalid(e)))) => {
                    // Protocol fault: the bad frame was discarded by the
                    // codec, the transport is still sound. Report and keep
                    // the session open for the next frame.
                    warn!(session = %self.session.id(), "protocol error: {}", e);
                    let reply = Reply::error(ErrorCode::Protocol, e.to_string());
                    if self.send_reply(reply).await.is_err() {
                        break;
                    }
                    continue;
                }
                Ok(Some(Ok(DecodedFrame::Frame(frame)))) => frame,
            };

            let request = match frame {
                Frame::Request(request) => request,
                Frame::Reply(_) => {
                    let reply =
                        Reply::error(ErrorCode::Protocol, "unexpected reply frame from client");
                    if self.send_reply(reply).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let (reply, keep_going) = self.processors.dispatch(&self.session, request).await;
            if self.send_reply(reply).await.is_err() {
                break;
            }
            if !keep_going {
                debug!(session = %self.session.id(), "processor requested session end");
                break;
            }
        }

        self.session.stop();
        self.sessions.remove(&self.session.id());
        info!(
            session = %self.session.id(),
            peer = %self.session.peer(),
            last_queue = ?self.session.active_queue(),
            "session ended"
        );
    }

    async fn send_reply(&mut self, reply: Reply) -> Result<(), ()> {
        if let Err(e) = self.framed.send(Frame::Reply(reply)).await {
            warn!(session = %self.session.id(), "failed to send reply: {}", e);
            return Err(());
        }
        Ok(())
    }
}
