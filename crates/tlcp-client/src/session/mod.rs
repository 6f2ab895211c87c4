//! Session engine.
//!
//! A [`Session`] is a logical server session that outlives any single
//! connection. A background actor owns the connect cycle:
//!
//! ```text
//! ┌───────────┐  outbound   ┌──────────────┐  TlcpChannel  ┌──────────┐
//! │  Session  │────────────▶│ SessionActor │──────────────▶│  Server  │
//! │  (handle) │             │ (background) │◀──────────────│          │
//! └─────┬─────┘             └──────┬───────┘               └──────────┘
//!       │                          │ dispatch
//!       ▼                          ▼
//! ┌─────────────────────┐  ┌───────────────────────┐
//! │ PendingRequestStore │  │   SubscriptionStore   │
//! │ PendingMessageStore │  │ (per-subscription     │
//! │   (scc::HashMap)    │  │  state machines)      │
//! └─────────────────────┘  └───────────────────────┘
//! ```
//!
//! When the connection is lost the actor binds the same session again with
//! `LS_recovery_from`, sends every request still awaiting its reply, and
//! skips the notifications the server replays.

mod actor;
mod pending;
mod subscription;
mod update;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use self::{
    pending::MessageOutcome,
    subscription::{Subscription, SubscriptionEvent, SubscriptionRequest},
    update::UpdateMap,
};
use self::{
    actor::SessionActor,
    pending::{
        MessageKey, PendingMessageStore, PendingRequestStore, RequestReply, SequenceProgressives,
    },
    subscription::SubscriptionStore,
};
use crate::{
    config::ClientConfig,
    error::{TlcpError, TlcpResult},
    message::{BindSession, ClientMessage, SendMessage, Subscribe, Unsubscribe},
    transport::Transport,
    types::{RequestId, SubscriptionId},
};

/// How a session ended.
#[derive(Clone, Debug)]
pub(crate) enum SessionExit {
    /// Closed locally, by the session or its client.
    Closed,
    /// Failed with a fatal error.
    Failed(TlcpError),
}

/// State shared between the session handle, its subscriptions and the actor.
pub(crate) struct SessionShared {
    config: Arc<ClientConfig>,
    pending_requests: PendingRequestStore,
    pending_messages: PendingMessageStore,
    progressives: SequenceProgressives,
    subscriptions: SubscriptionStore,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    session_id: watch::Sender<Option<String>>,
    exit: watch::Sender<Option<SessionExit>>,
    token: CancellationToken,
    subscription_ids: AtomicU32,
}

impl SessionShared {
    fn is_alive(&self) -> bool {
        !self.token.is_cancelled()
    }

    fn current_session_id(&self) -> Option<String> {
        self.session_id.borrow().clone()
    }

    /// Error handed to operations that can no longer complete.
    fn closed_error(&self) -> TlcpError {
        match &*self.exit.borrow() {
            Some(SessionExit::Failed(err)) => err.clone().into_cancellation(),
            _ => TlcpError::cancelled("Session closed"),
        }
    }

    /// Record the exit cause unless one is already set.
    fn set_exit(&self, exit: SessionExit) {
        self.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(exit);
            true
        });
    }

    fn close(&self) {
        self.set_exit(SessionExit::Closed);
        self.token.cancel();
    }

    /// Track `message` until its reply and queue it for sending.
    fn send_request(&self, message: ClientMessage) -> TlcpResult<RequestReply> {
        if !self.is_alive() {
            return Err(self.closed_error());
        }
        let id = message.request_id();
        let reply = self
            .pending_requests
            .add(message.clone())
            .ok_or_else(|| TlcpError::internal(format!("Request {id} already pending")))?;
        if self.outbound.send(message).is_err() {
            self.pending_requests.remove(&id);
            return Err(self.closed_error());
        }
        Ok(reply)
    }

    /// Queue a request that expects no reply.
    fn enqueue(&self, message: ClientMessage) {
        if self.outbound.send(message).is_err() {
            debug!("Session closed, request dropped");
        }
    }

    /// Bind request carrying the configured stream timing.
    fn bind_request(&self, session_id: &str) -> BindSession {
        let mut bind = BindSession::new(session_id);
        bind.keep_alive = self.config.keep_alive;
        bind.inactivity = self.config.inactivity;
        bind.send_sync = self.config.send_sync;
        bind
    }

    /// Ask the server to remove subscription `id`.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) {
        if !self.is_alive() {
            return;
        }
        let unsubscribe = ClientMessage::Unsubscribe(Unsubscribe { subscription_id: id });
        if let Err(err) = self.send_request(unsubscribe) {
            debug!(subscription_id = %id, error = %err, "Unable to unsubscribe");
        }
    }
}

/// Handle to a server session.
///
/// Dropping the handle closes the session.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Start a session on the current Tokio runtime.
    pub(crate) fn spawn<T: Transport>(
        config: Arc<ClientConfig>,
        transport: Arc<T>,
        token: CancellationToken,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            config,
            pending_requests: PendingRequestStore::new(),
            pending_messages: PendingMessageStore::new(),
            progressives: SequenceProgressives::new(),
            subscriptions: SubscriptionStore::new(),
            outbound: outbound_tx,
            session_id: watch::Sender::new(None),
            exit: watch::Sender::new(None),
            token,
            subscription_ids: AtomicU32::new(0),
        });
        let actor = SessionActor::new(transport, Arc::clone(&shared), outbound_rx);
        tokio::spawn(actor.run());
        Self { shared }
    }

    /// Server-assigned session id, once the session is created.
    ///
    /// Fails if the session terminates before creation.
    pub async fn session_id(&self) -> TlcpResult<String> {
        let mut session_id = self.shared.session_id.subscribe();
        let id = tokio::select! {
            biased;
            id = session_id.wait_for(Option::is_some) => id.ok().and_then(|id| id.clone()),
            _ = self.shared.token.cancelled() => self.shared.current_session_id(),
        };
        id.ok_or_else(|| self.shared.closed_error())
    }

    /// Wait for the session to terminate.
    ///
    /// Resolves to `None` on a local close, otherwise to the fatal error.
    pub async fn exit_status(&self) -> Option<TlcpError> {
        let mut exit = self.shared.exit.subscribe();
        let exit = match exit.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone(),
            Err(_) => None,
        };
        match exit {
            Some(SessionExit::Failed(err)) => Some(err),
            _ => None,
        }
    }

    /// Send an application message and wait for its outcome.
    ///
    /// Messages of the same `sequence` are processed in order by the server;
    /// `None` sends an unordered message. The message is sent again on
    /// session recovery until its outcome arrives; dropping the future
    /// withdraws it.
    pub async fn send_message(
        &self,
        message: impl Into<String>,
        sequence: Option<&str>,
    ) -> TlcpResult<MessageOutcome> {
        if sequence.is_some_and(str::is_empty) {
            return Err(TlcpError::config("Sequence name cannot be empty"));
        }
        let prog = self.shared.progressives.next(sequence.unwrap_or_default());
        let request = SendMessage::new(message, sequence.map(str::to_string), Some(prog))?.ack(false);
        let key = MessageKey {
            sequence: sequence.map(str::to_string),
            prog,
        };
        let mut outcome = self
            .shared
            .pending_messages
            .add(key.clone())
            .ok_or_else(|| TlcpError::internal(format!("Message {prog} already pending")))?;
        let _guard = PendingMessageGuard {
            shared: &self.shared,
            key,
            request_id: request.id().clone(),
        };
        let mut reply = self.shared.send_request(ClientMessage::Message(request))?;

        tokio::select! {
            result = &mut outcome => result.map_err(|_| self.shared.closed_error())?,
            result = &mut reply => match result {
                Ok(Ok(())) => outcome.await.map_err(|_| self.shared.closed_error())?,
                Ok(Err(err)) => Err(err),
                Err(_) => Err(self.shared.closed_error()),
            },
        }
    }

    /// Subscribe to an item group.
    ///
    /// Returns as soon as the request is queued; the first event of the
    /// subscription is [`SubscriptionEvent::Subscribed`].
    pub fn subscribe(&self, request: SubscriptionRequest) -> TlcpResult<Subscription> {
        if !self.shared.is_alive() {
            return Err(self.shared.closed_error());
        }
        let id = SubscriptionId(self.shared.subscription_ids.fetch_add(1, Ordering::Relaxed) + 1);
        let (state, events) = self.shared.subscriptions.create(
            id,
            &request,
            self.shared.config.subscription_buffer_capacity,
        )?;
        let subscribe = ClientMessage::Subscribe(Subscribe {
            subscription_id: id,
            data_adapter: request.data_adapter,
            mode: request.mode,
            item_group: request.item_group,
            fields: request.fields,
            request_snapshot: request.request_snapshot,
            ack: false,
        });
        if let Err(err) = self.shared.send_request(subscribe) {
            self.shared.subscriptions.remove(id);
            state.terminate(Err(err.clone()));
            return Err(err);
        }
        debug!(subscription_id = %id, "Subscription requested");
        Ok(Subscription::new(state, events, Arc::clone(&self.shared)))
    }

    /// Close the session. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        !self.shared.is_alive()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.shared.current_session_id())
            .field("closed", &self.is_closed())
            .field("subscriptions", &self.shared.subscriptions.len())
            .field("pending_requests", &self.shared.pending_requests.len())
            .field("pending_messages", &self.shared.pending_messages.len())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Withdraws a message from both tables once its caller stops waiting.
struct PendingMessageGuard<'a> {
    shared: &'a SessionShared,
    key: MessageKey,
    request_id: RequestId,
}

impl Drop for PendingMessageGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending_messages.remove(&self.key);
        self.shared.pending_requests.remove(&self.request_id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::ServerAddress;

    /// Session state detached from any actor, for unit tests.
    pub(crate) fn detached_shared() -> (Arc<SessionShared>, mpsc::UnboundedReceiver<ClientMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            config: Arc::new(ClientConfig::new(ServerAddress::new("push.example.com", 80, false))),
            pending_requests: PendingRequestStore::new(),
            pending_messages: PendingMessageStore::new(),
            progressives: SequenceProgressives::new(),
            subscriptions: SubscriptionStore::new(),
            outbound: outbound_tx,
            session_id: watch::Sender::new(None),
            exit: watch::Sender::new(None),
            token: CancellationToken::new(),
            subscription_ids: AtomicU32::new(0),
        });
        (shared, outbound_rx)
    }

    #[test]
    fn test_send_request_tracks_and_queues() {
        let (shared, mut outbound) = detached_shared();
        let unsubscribe = ClientMessage::Unsubscribe(Unsubscribe {
            subscription_id: SubscriptionId(7),
        });
        let _reply = shared.send_request(unsubscribe.clone()).expect("queued");
        assert_eq!(outbound.try_recv().ok(), Some(unsubscribe.clone()));
        assert_eq!(shared.pending_requests.len(), 1);

        let err = shared.send_request(unsubscribe).expect_err("duplicate");
        assert!(matches!(err, TlcpError::Internal { .. }));
    }

    #[test]
    fn test_closed_session_refuses_requests() {
        let (shared, mut outbound) = detached_shared();
        shared.close();
        shared.unsubscribe(SubscriptionId(1));
        assert!(outbound.try_recv().is_err());
        assert!(shared.pending_requests.is_empty());
        assert!(matches!(
            shared.closed_error(),
            TlcpError::Cancelled { server_error: None, .. }
        ));
    }

    #[test]
    fn test_first_exit_cause_wins() {
        let (shared, _outbound) = detached_shared();
        shared.set_exit(SessionExit::Failed(TlcpError::protocol("broken")));
        shared.close();
        assert!(matches!(
            &*shared.exit.borrow(),
            Some(SessionExit::Failed(TlcpError::Protocol { .. }))
        ));
        assert!(shared.closed_error().is_cancelled());
    }

    #[test]
    fn test_bind_request_carries_stream_timing() {
        let (shared, _outbound) = detached_shared();
        let bind = shared.bind_request("S1");
        assert_eq!(bind.session, "S1");
        assert_eq!(bind.recovery_from, None);
        assert_eq!(bind.keep_alive, shared.config.keep_alive);
        assert!(!bind.send_sync);
    }

    #[test]
    fn test_guard_withdraws_message() {
        let (shared, _outbound) = detached_shared();
        let key = MessageKey {
            sequence: None,
            prog: 1,
        };
        let request = SendMessage::new("hello", None, Some(1)).expect("valid");
        let request_id = request.id().clone();
        let _outcome = shared.pending_messages.add(key.clone()).expect("added");
        let _reply = shared
            .send_request(ClientMessage::Message(request))
            .expect("queued");
        drop(PendingMessageGuard {
            shared: &shared,
            key,
            request_id,
        });
        assert_eq!(shared.pending_messages.len(), 0);
        assert!(shared.pending_requests.is_empty());
    }
}
