//! Subscription lifecycle and event delivery.
//!
//! A subscription moves from pending (subscribe request sent) to active
//! (`SUBOK`/`SUBCMD` received, update processor attached) and finally to
//! terminated. The session owns one [`SubscriptionState`] per id; the
//! application holds a [`Subscription`] handle that yields the events.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::{
    SessionShared,
    update::{UpdateMap, UpdateProcessor},
};
use crate::{
    error::{TlcpError, TlcpResult},
    field_list::FieldList,
    message::ServerMessage,
    types::{SubscriptionId, SubscriptionMode},
};

/// Parameters of a new subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub mode: SubscriptionMode,
    pub data_adapter: String,
    pub item_group: String,
    pub fields: FieldList,
    pub request_snapshot: bool,
}

impl SubscriptionRequest {
    /// Create a request; a snapshot is requested when the mode supports one.
    pub fn new(
        mode: SubscriptionMode,
        data_adapter: impl Into<String>,
        item_group: impl Into<String>,
        fields: FieldList,
    ) -> Self {
        Self {
            mode,
            data_adapter: data_adapter.into(),
            item_group: item_group.into(),
            fields,
            request_snapshot: mode.supports_snapshot(),
        }
    }

    /// Set whether to request the initial snapshot.
    #[must_use]
    pub fn request_snapshot(mut self, request_snapshot: bool) -> Self {
        self.request_snapshot = request_snapshot;
        self
    }
}

/// Event delivered to the subscriber.
#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionEvent {
    /// The server accepted the subscription.
    Subscribed {
        item_count: u16,
        field_count: u16,
        /// 1-based position of the key field, `COMMAND` mode only.
        key_field: Option<u16>,
        /// 1-based position of the command field, `COMMAND` mode only.
        command_field: Option<u16>,
    },
    /// Current values after an update.
    Update(UpdateMap),
    ClearSnapshot { item: u32 },
    EndOfSnapshot { item: u32 },
    /// Updates were dropped by the server.
    Overflow { item: u32, size: u32 },
    /// Effective subscription configuration.
    Configuration {
        max_frequency: Option<f32>,
        filtered: bool,
    },
}

#[derive(Debug)]
enum Phase {
    /// Subscribe request sent; `cancelled` once the subscriber gave up.
    Pending { cancelled: bool },
    Active(UpdateProcessor),
    /// Unsubscribe request sent, awaiting `UNSUB`.
    Unsubscribing,
    Terminated,
}

/// Outcome of a message consumed by a subscription.
#[derive(Debug, PartialEq)]
pub(crate) enum Step {
    Ignore,
    Deliver(SubscriptionEvent),
    /// The server-side subscription must be removed.
    Unsubscribe,
}

#[derive(Clone, Debug)]
enum EventSender {
    Bounded(mpsc::Sender<SubscriptionEvent>),
    Unbounded(mpsc::UnboundedSender<SubscriptionEvent>),
}

#[derive(Debug)]
pub(crate) enum EventReceiver {
    Bounded(mpsc::Receiver<SubscriptionEvent>),
    Unbounded(mpsc::UnboundedReceiver<SubscriptionEvent>),
}

impl EventReceiver {
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<SubscriptionEvent>> {
        match self {
            Self::Bounded(rx) => rx.poll_recv(cx),
            Self::Unbounded(rx) => rx.poll_recv(cx),
        }
    }
}

/// Session-side state of one subscription.
#[derive(Debug)]
pub(crate) struct SubscriptionState {
    id: SubscriptionId,
    mode: SubscriptionMode,
    fields: FieldList,
    phase: Mutex<Phase>,
    events: Mutex<Option<EventSender>>,
    status: watch::Sender<Option<TlcpResult<()>>>,
}

impl SubscriptionState {
    /// Create the state and the receiving half of its event channel.
    ///
    /// Modes with an end-of-snapshot marker get a bounded buffer of
    /// `capacity` events, the others an unbounded one.
    fn new(
        id: SubscriptionId,
        mode: SubscriptionMode,
        fields: FieldList,
        capacity: usize,
    ) -> (Arc<Self>, EventReceiver) {
        let (events, receiver) = if mode.supports_end_of_snapshot() {
            let (tx, rx) = mpsc::channel(capacity);
            (EventSender::Bounded(tx), EventReceiver::Bounded(rx))
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            (EventSender::Unbounded(tx), EventReceiver::Unbounded(rx))
        };
        let state = Arc::new(Self {
            id,
            mode,
            fields,
            phase: Mutex::new(Phase::Pending { cancelled: false }),
            events: Mutex::new(Some(events)),
            status: watch::Sender::new(None),
        });
        (state, receiver)
    }

    /// Consume a subscription message and deliver the resulting event.
    ///
    /// Delivery waits for buffer space on bounded subscriptions, or until
    /// the subscription terminates.
    pub(crate) async fn consume(&self, message: &ServerMessage) -> Step {
        let step = self.step(message);
        if let Step::Deliver(event) = step {
            self.deliver(event).await;
            return Step::Ignore;
        }
        step
    }

    fn step(&self, message: &ServerMessage) -> Step {
        let mut phase = self.phase.lock();
        let result = match message {
            ServerMessage::SubscriptionOk {
                item_count,
                field_count,
                ..
            } => self.on_subscribed(&mut phase, *item_count, *field_count, None),
            ServerMessage::SubscriptionCommandOk {
                item_count,
                field_count,
                key_field,
                command_field,
                ..
            } => self.on_subscribed(
                &mut phase,
                *item_count,
                *field_count,
                Some((*key_field, *command_field)),
            ),
            ServerMessage::Update { values, .. } => match &mut *phase {
                Phase::Active(processor) => processor
                    .apply(values)
                    .map(|map| Step::Deliver(SubscriptionEvent::Update(map))),
                Phase::Pending { cancelled: false } => Err(TlcpError::protocol(format!(
                    "Update before subscription {} OK",
                    self.id
                ))),
                _ => Ok(Step::Ignore),
            },
            ServerMessage::ClearSnapshot { item, .. } => {
                Ok(Self::event(&phase, SubscriptionEvent::ClearSnapshot { item: *item }))
            }
            ServerMessage::EndOfSnapshot { item, .. } => {
                Ok(Self::event(&phase, SubscriptionEvent::EndOfSnapshot { item: *item }))
            }
            ServerMessage::Overflow { item, size, .. } => Ok(Self::event(
                &phase,
                SubscriptionEvent::Overflow {
                    item: *item,
                    size: *size,
                },
            )),
            ServerMessage::Configuration {
                max_frequency,
                filtered,
                ..
            } => Ok(Self::event(
                &phase,
                SubscriptionEvent::Configuration {
                    max_frequency: *max_frequency,
                    filtered: *filtered,
                },
            )),
            other => Err(TlcpError::protocol(format!(
                "Invalid message {} for subscription {}",
                other.tag(),
                self.id
            ))),
        };

        match result {
            Ok(step) => step,
            Err(err) => {
                warn!(subscription_id = %self.id, error = %err, "Subscription failed");
                *phase = Phase::Unsubscribing;
                drop(phase);
                self.finish(Err(err));
                Step::Unsubscribe
            }
        }
    }

    fn on_subscribed(
        &self,
        phase: &mut Phase,
        item_count: u16,
        field_count: u16,
        command: Option<(u16, u16)>,
    ) -> TlcpResult<Step> {
        match phase {
            Phase::Pending { cancelled: false } => {
                let processor = UpdateProcessor::new(item_count, field_count, self.fields.clone())?;
                *phase = Phase::Active(processor);
                Ok(Step::Deliver(SubscriptionEvent::Subscribed {
                    item_count,
                    field_count,
                    key_field: command.map(|(key, _)| key),
                    command_field: command.map(|(_, command)| command),
                }))
            }
            Phase::Pending { cancelled: true } => {
                debug!(subscription_id = %self.id, "Subscription confirmed after cancel");
                *phase = Phase::Unsubscribing;
                Ok(Step::Unsubscribe)
            }
            Phase::Active(_) => Err(TlcpError::protocol(format!(
                "Subscription {} OK already received",
                self.id
            ))),
            Phase::Unsubscribing | Phase::Terminated => Ok(Step::Ignore),
        }
    }

    /// Deliver `event` only while the subscriber is listening.
    fn event(phase: &Phase, event: SubscriptionEvent) -> Step {
        match phase {
            Phase::Pending { cancelled: false } | Phase::Active(_) => Step::Deliver(event),
            _ => Step::Ignore,
        }
    }

    async fn deliver(&self, event: SubscriptionEvent) {
        let Some(sender) = self.events.lock().clone() else {
            return;
        };
        debug!(subscription_id = %self.id, ?event, "Delivering subscription event");
        match sender {
            EventSender::Unbounded(tx) => {
                let _ = tx.send(event);
            }
            EventSender::Bounded(tx) => {
                let mut status = self.status.subscribe();
                tokio::select! {
                    _ = tx.send(event) => {}
                    _ = status.wait_for(Option::is_some) => {}
                }
            }
        }
    }

    /// Cancel on behalf of the subscriber.
    ///
    /// Returns whether an unsubscribe request must be sent.
    pub(crate) fn cancel(&self) -> bool {
        let mut phase = self.phase.lock();
        let unsubscribe = match &*phase {
            Phase::Pending { cancelled: false } => {
                *phase = Phase::Pending { cancelled: true };
                false
            }
            Phase::Active(_) => {
                *phase = Phase::Unsubscribing;
                true
            }
            _ => return false,
        };
        drop(phase);
        debug!(subscription_id = %self.id, unsubscribe, "Subscription cancelled");
        self.finish(Ok(()));
        unsubscribe
    }

    /// Terminate for good; no unsubscribe is sent.
    pub(crate) fn terminate(&self, result: TlcpResult<()>) {
        *self.phase.lock() = Phase::Terminated;
        self.finish(result);
    }

    fn finish(&self, result: TlcpResult<()>) {
        self.events.lock().take();
        self.status.send_if_modified(|status| {
            if status.is_some() {
                return false;
            }
            *status = Some(result);
            true
        });
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.status.borrow().is_some()
    }
}

/// Subscriptions of one session, keyed by id.
#[derive(Default)]
pub(crate) struct SubscriptionStore {
    subscriptions: scc::HashMap<SubscriptionId, Arc<SubscriptionState>>,
}

impl SubscriptionStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a new subscription.
    pub(crate) fn create(
        &self,
        id: SubscriptionId,
        request: &SubscriptionRequest,
        capacity: usize,
    ) -> TlcpResult<(Arc<SubscriptionState>, EventReceiver)> {
        let (state, receiver) =
            SubscriptionState::new(id, request.mode, request.fields.clone(), capacity);
        self.subscriptions
            .insert_sync(id, Arc::clone(&state))
            .map_err(|_| TlcpError::internal(format!("Duplicate subscription id {id}")))?;
        Ok((state, receiver))
    }

    pub(crate) fn get(&self, id: SubscriptionId) -> Option<Arc<SubscriptionState>> {
        self.subscriptions.read_sync(&id, |_, state| Arc::clone(state))
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> Option<Arc<SubscriptionState>> {
        self.subscriptions.remove_sync(&id).map(|(_, state)| state)
    }

    /// Remove every subscription, terminating each with `error`.
    pub(crate) fn clear_with_error(&self, error: &TlcpError) {
        let mut removed = Vec::new();
        self.subscriptions.retain_sync(|_, state| {
            removed.push(Arc::clone(state));
            false
        });
        for state in removed {
            state.terminate(Err(error.clone()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }
}

/// Handle to a subscription.
///
/// Yields [`SubscriptionEvent`]s until the subscription terminates. Dropping
/// the handle cancels the subscription.
pub struct Subscription {
    state: Arc<SubscriptionState>,
    events: EventReceiver,
    session: Arc<SessionShared>,
}

impl Subscription {
    pub(crate) fn new(
        state: Arc<SubscriptionState>,
        events: EventReceiver,
        session: Arc<SessionShared>,
    ) -> Self {
        Self {
            state,
            events,
            session,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.state.id
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.state.mode
    }

    /// Canonical field list; update values are positioned by it.
    pub fn fields(&self) -> &FieldList {
        &self.state.fields
    }

    /// Receive the next event; `None` once the subscription terminated.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        std::future::poll_fn(|cx| self.events.poll_recv(cx)).await
    }

    /// Wait for termination.
    ///
    /// Resolves to `Ok(())` when cancelled or unsubscribed, otherwise to the
    /// error that ended the subscription.
    pub async fn closed(&self) -> TlcpResult<()> {
        let mut status = self.state.status.subscribe();
        let result = status
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TlcpError::internal("Subscription status dropped"))?;
        result.clone().unwrap_or(Ok(()))
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_finished()
    }

    /// Cancel the subscription, unsubscribing if the server confirmed it.
    pub fn cancel(&self) {
        if self.state.cancel() {
            self.session.unsubscribe(self.state.id);
        }
    }
}

impl Stream for Subscription {
    type Item = SubscriptionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.state.id)
            .field("mode", &self.state.mode)
            .field("fields", &self.state.fields)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
