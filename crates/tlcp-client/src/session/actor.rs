//! Session actor: the connect cycle of one session.
//!
//! The actor runs in a background task and handles:
//! - Session creation, optionally through a polling connection bound on the
//!   control link
//! - Recovery of the session after a lost connection, with replay skipping
//! - Reconnection with exponential backoff
//! - Heartbeats on outbound inactivity and stale stream detection
//! - Message routing (replies to pending requests, notifications to
//!   subscriptions)

use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, trace, warn};

use super::{
    SessionExit, SessionShared,
    pending::{MessageKey, MessageOutcome},
    subscription::Step,
};
use crate::{
    error::{ServerError, TlcpError, TlcpResult},
    message::{ClientMessage, CreateSession, Destroy, ServerMessage},
    reconnect::Backoff,
    transport::{TlcpChannel, Transport},
    types::{RequestId, SUPPORTED_DIFFS, ServerAddress, SubscriptionId},
};

/// Bound on waiting for a channel to finish tearing down.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Actor
// ============================================================================

/// Result of one connect cycle.
enum CycleOutcome {
    /// The connection was lost; connect again.
    Reconnect,
    /// The session is over.
    Terminated(SessionExit),
}

/// Fields of a `CONOK` reply.
struct Connected {
    session_id: String,
    keep_alive: Option<Duration>,
    control_link: Option<String>,
}

/// Background task owning the connections of one session.
pub(crate) struct SessionActor<T: Transport> {
    transport: Arc<T>,
    dispatcher: Dispatcher,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    address: ServerAddress,
    backoff: Backoff,
}

impl<T: Transport> SessionActor<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        shared: Arc<SessionShared>,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
    ) -> Self {
        let address = shared.config.server_address.clone();
        let backoff = Backoff::new(shared.config.backoff());
        Self {
            transport,
            dispatcher: Dispatcher {
                shared,
                notifications: 0,
            },
            outbound,
            address,
            backoff,
        }
    }

    /// Run connect cycles until the session terminates.
    pub(crate) async fn run(mut self) {
        info!(address = %self.address, "Starting session actor");
        let token = self.dispatcher.shared.token.clone();
        let exit = loop {
            match self.run_cycle().await {
                CycleOutcome::Reconnect => {
                    let delay = self.backoff.next_delay();
                    debug!(?delay, attempt = self.backoff.attempt(), "Reconnecting");
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break SessionExit::Closed,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                CycleOutcome::Terminated(exit) => break exit,
            }
        };
        self.terminate(exit);
    }

    /// One connection, from connect to loss or termination.
    ///
    /// The channel lives in `slot` so it can be torn down whichever way the
    /// cycle ends.
    async fn run_cycle(&mut self) -> CycleOutcome {
        let token = self.dispatcher.shared.token.clone();
        let mut slot: Option<T::Channel> = None;
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => CycleOutcome::Terminated(SessionExit::Closed),
            result = self.connect_and_pump(&mut slot) => match result {
                Ok(()) => CycleOutcome::Reconnect,
                Err(err) if err.is_recoverable() => {
                    warn!(error = %err, "Connection lost");
                    CycleOutcome::Reconnect
                }
                Err(err) => {
                    warn!(error = %err, "Session failed");
                    CycleOutcome::Terminated(SessionExit::Failed(err))
                }
            },
        };

        if let Some(channel) = slot.take() {
            if matches!(outcome, CycleOutcome::Terminated(_)) {
                self.destroy(&channel).await;
            }
            channel.disconnect();
            if timeout(JOIN_TIMEOUT, channel.join()).await.is_err() {
                debug!("Channel teardown timed out");
            }
        }
        outcome
    }

    /// Best-effort `destroy` on the way out.
    async fn destroy(&self, channel: &T::Channel) {
        let limit = self
            .dispatcher
            .shared
            .config
            .keep_alive_extra
            .clamp(Duration::from_millis(100), Duration::from_secs(1));
        let destroy = ClientMessage::Destroy(Destroy {
            close_socket: true,
            ..Default::default()
        });
        match timeout(limit, channel.send(destroy)).await {
            Ok(Ok(())) => debug!("Destroy sent"),
            Ok(Err(e)) => debug!(error = %e, "Failed to send destroy"),
            Err(_) => debug!("Destroy timed out"),
        }
    }

    /// Connect, create or recover the session, then pump traffic.
    ///
    /// Returns `Ok(())` when the connection was lost without an error.
    async fn connect_and_pump(&mut self, slot: &mut Option<T::Channel>) -> TlcpResult<()> {
        let shared = Arc::clone(&self.dispatcher.shared);
        *slot = Some(self.connect().await?);

        let keep_alive = match shared.current_session_id() {
            None => self.create(slot).await?,
            Some(session_id) => self.recover(current(slot)?, &session_id).await?,
        };
        self.backoff.reset();
        let session_id = shared.current_session_id().unwrap_or_default();
        info!(%session_id, address = %self.address, "Session connected");

        let channel = current(slot)?;
        let stalled = shared.config.stalled_timeout(keep_alive);
        let inactivity = shared.config.inactivity;
        tokio::select! {
            result = send_pump(channel, &mut self.outbound, &shared, inactivity) => result,
            result = receive_pump(channel, &mut self.dispatcher, stalled) => result,
        }
    }

    async fn connect(&self) -> TlcpResult<T::Channel> {
        let limit = self.dispatcher.shared.config.connect_timeout;
        debug!(address = %self.address, "Connecting");
        timeout(limit, self.transport.connect(&self.address))
            .await
            .map_err(|_| TlcpError::timeout(limit))?
    }

    /// Create the session; returns the server keep-alive.
    async fn create(&mut self, slot: &mut Option<T::Channel>) -> TlcpResult<Option<Duration>> {
        let shared = Arc::clone(&self.dispatcher.shared);
        let config = &shared.config;
        let channel = current(slot)?;

        let mut create = CreateSession::new(config.adapter_set.clone());
        create.credentials = config.credentials.clone();
        create.keep_alive = config.keep_alive;
        create.inactivity = config.inactivity;
        create.polling = config.force_control_link.then_some(Duration::ZERO);
        create.supported_diffs = SUPPORTED_DIFFS.to_vec();
        create.reduce_head = true;
        create.ttl = config.create_session_ttl;
        create.send_sync = config.send_sync;
        channel.send(ClientMessage::CreateSession(create)).await?;

        let mut connected = receive_connection_ok(channel, config.connect_timeout).await?;
        shared
            .session_id
            .send_replace(Some(connected.session_id.clone()));
        info!(session_id = %connected.session_id, "Session created");
        if let Some(link) = &connected.control_link {
            self.address = self.address.with_control_link(link)?;
            debug!(address = %self.address, "Using control link");
        }
        if !config.force_control_link {
            return Ok(connected.keep_alive);
        }

        // the polling connection ends with LOOP, bind a stream on the control link
        loop {
            match next_message(channel, config.stalled_timeout(connected.keep_alive)).await? {
                ServerMessage::Loop { .. } => break,
                message => self.dispatcher.dispatch(message).await?,
            }
        }
        channel.disconnect();
        if timeout(JOIN_TIMEOUT, channel.join()).await.is_err() {
            debug!("Polling channel teardown timed out");
        }

        *slot = Some(self.connect().await?);
        let channel = current(slot)?;
        let bind = shared.bind_request(&connected.session_id);
        channel.send(ClientMessage::BindSession(bind)).await?;
        connected = receive_connection_ok(channel, config.connect_timeout)
            .await
            .map_err(|err| match err {
                TlcpError::Server(ServerError::ConnectionError { code, message }) => {
                    TlcpError::Server(ServerError::ConnectionError {
                        code,
                        message: format!("Unable to bind on {} ({message})", self.address),
                    })
                }
                other => other,
            })?;
        Ok(connected.keep_alive)
    }

    /// Bind the known session again and skip replayed notifications;
    /// returns the server keep-alive.
    async fn recover(
        &mut self,
        channel: &T::Channel,
        session_id: &str,
    ) -> TlcpResult<Option<Duration>> {
        let shared = Arc::clone(&self.dispatcher.shared);
        let recovery_from = self.dispatcher.notifications;
        let mut bind = shared.bind_request(session_id);
        bind.recovery_from = Some(recovery_from);
        debug!(session_id, recovery_from, "Recovering session");
        channel.send(ClientMessage::BindSession(bind)).await?;

        let resend = async {
            let requests = shared.pending_requests.sent_requests();
            debug!(count = requests.len(), "Sending pending requests again");
            for request in requests {
                channel.send(request).await?;
            }
            Ok::<_, TlcpError>(())
        };
        let (resent, connected) = tokio::join!(
            resend,
            receive_connection_ok(channel, shared.config.connect_timeout)
        );
        let connected = connected.map_err(|err| match err {
            TlcpError::Server(ServerError::ConnectionError { code, message }) => {
                TlcpError::Server(ServerError::ConnectionError {
                    code,
                    message: format!("Session {session_id} recovery failed ({message})"),
                })
            }
            other => other,
        })?;
        resent?;
        if connected.session_id != session_id {
            return Err(TlcpError::protocol(format!(
                "Session {session_id} recovered as {}",
                connected.session_id
            )));
        }

        let limit = shared.config.stalled_timeout(connected.keep_alive);
        let mut skip = loop {
            match next_message(channel, limit).await? {
                ServerMessage::Progressive { progressive } => {
                    let notifications = self.dispatcher.notifications;
                    if progressive > notifications {
                        return Err(TlcpError::protocol(format!(
                            "Server progressive {progressive} is ahead of {notifications}"
                        )));
                    }
                    break notifications - progressive;
                }
                message => {
                    let data = message.is_data_notification();
                    self.dispatcher.dispatch(message).await?;
                    if data {
                        break 0;
                    }
                }
            }
        };
        debug!(skip, "Session recovered");
        while skip > 0 {
            let message = next_message(channel, limit).await?;
            if message.is_data_notification() {
                skip -= 1;
                trace!(tag = message.tag(), "Skipped replayed notification");
            } else {
                self.dispatcher.dispatch(message).await?;
            }
        }
        Ok(connected.keep_alive)
    }

    /// Fail everything still waiting on the session.
    fn terminate(mut self, exit: SessionExit) {
        let shared = &self.dispatcher.shared;
        shared.set_exit(exit);
        shared.token.cancel();
        self.outbound.close();

        let cause = shared.closed_error();
        shared.pending_requests.clear_with_error(&cause);
        shared.pending_messages.clear_with_error(&cause);
        shared.subscriptions.clear_with_error(&cause);
        info!(reason = %cause, "Session actor stopped");
    }
}

fn current<C>(slot: &Option<C>) -> TlcpResult<&C> {
    slot.as_ref()
        .ok_or_else(|| TlcpError::internal("No channel in the current cycle"))
}

/// Next message, failing on a closed channel or after `limit`.
async fn next_message<C: TlcpChannel>(
    channel: &C,
    limit: Option<Duration>,
) -> TlcpResult<ServerMessage> {
    let next = match limit {
        Some(limit) => {
            let limit = limit.max(Duration::from_millis(1));
            timeout(limit, channel.recv())
                .await
                .map_err(|_| TlcpError::timeout(limit))?
        }
        None => channel.recv().await,
    };
    next.unwrap_or_else(|| Err(TlcpError::transport("Connection closed")))
}

async fn receive_connection_ok<C: TlcpChannel>(
    channel: &C,
    limit: Duration,
) -> TlcpResult<Connected> {
    match next_message(channel, Some(limit)).await? {
        ServerMessage::ConnectionOk {
            session_id,
            keep_alive,
            control_link,
            ..
        } => Ok(Connected {
            session_id,
            keep_alive,
            control_link,
        }),
        ServerMessage::ConnectionError { code, message } | ServerMessage::End { code, message } => {
            Err(ServerError::ConnectionError { code, message }.into())
        }
        other => Err(TlcpError::protocol(format!(
            "Connection bad response: {}",
            other.tag()
        ))),
    }
}

// ============================================================================
// Pumps
// ============================================================================

/// Forward queued requests, sending a heartbeat after `inactivity`.
async fn send_pump<C: TlcpChannel>(
    channel: &C,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    shared: &SessionShared,
    inactivity: Option<Duration>,
) -> TlcpResult<()> {
    loop {
        let message = match inactivity {
            Some(inactivity) => match timeout(inactivity, outbound.recv()).await {
                Ok(message) => message,
                Err(_) => Some(ClientMessage::Heartbeat),
            },
            None => outbound.recv().await,
        };
        let Some(message) = message else {
            return Err(TlcpError::cancelled("Outbound queue closed"));
        };
        shared.pending_requests.mark_sent(&message.request_id());
        trace!(request = message.name().as_str(), "Sending request");
        channel.send(message).await?;
    }
}

/// Dispatch inbound messages until the channel closes or goes stale.
async fn receive_pump<C: TlcpChannel>(
    channel: &C,
    dispatcher: &mut Dispatcher,
    stalled: Option<Duration>,
) -> TlcpResult<()> {
    loop {
        let next = match stalled {
            Some(limit) => match timeout(limit, channel.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(?limit, "No data from server, reconnecting");
                    return Ok(());
                }
            },
            None => channel.recv().await,
        };
        match next {
            Some(message) => dispatcher.dispatch(message?).await?,
            None => {
                debug!("Connection closed");
                return Ok(());
            }
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Routes server messages and counts data notifications.
struct Dispatcher {
    shared: Arc<SessionShared>,
    notifications: u64,
}

impl Dispatcher {
    /// Route one message; an error is fatal to the session.
    async fn dispatch(&mut self, message: ServerMessage) -> TlcpResult<()> {
        trace!(tag = message.tag(), "Received message");
        if message.is_data_notification() {
            self.notifications += 1;
        }

        match message {
            ServerMessage::SubscriptionOk {
                subscription_id, ..
            }
            | ServerMessage::SubscriptionCommandOk {
                subscription_id, ..
            } => {
                self.shared
                    .pending_requests
                    .resolve(&RequestId::subscribe(subscription_id), Ok(()));
                self.forward(subscription_id, &message).await;
            }
            ServerMessage::UnsubscriptionOk { subscription_id } => {
                if let Some(state) = self.shared.subscriptions.remove(subscription_id) {
                    debug!(%subscription_id, "Unsubscribed");
                    state.terminate(Ok(()));
                }
            }
            ServerMessage::ClearSnapshot {
                subscription_id, ..
            }
            | ServerMessage::Configuration {
                subscription_id, ..
            }
            | ServerMessage::EndOfSnapshot {
                subscription_id, ..
            }
            | ServerMessage::Overflow {
                subscription_id, ..
            }
            | ServerMessage::Update {
                subscription_id, ..
            } => self.forward(subscription_id, &message).await,
            ServerMessage::RequestOk { request_id } => {
                self.shared.pending_requests.resolve(&request_id, Ok(()));
            }
            ServerMessage::RequestError {
                request_id,
                code,
                message,
            } => self.on_request_error(request_id, ServerError::RequestError { code, message }),
            ServerMessage::MessageDone {
                sequence,
                prog,
                response,
            } => {
                self.shared
                    .pending_messages
                    .resolve(&MessageKey { sequence, prog }, MessageOutcome::Done(response));
            }
            ServerMessage::MessageFail {
                sequence,
                prog,
                code,
                message,
            } => {
                self.shared.pending_messages.resolve(
                    &MessageKey { sequence, prog },
                    MessageOutcome::Fail { code, message },
                );
            }
            ServerMessage::Loop { expected_delay } => {
                debug!(?expected_delay, "Server requested a rebind");
                if let Some(session_id) = self.shared.current_session_id() {
                    let bind = self.shared.bind_request(&session_id);
                    self.shared.enqueue(ClientMessage::BindSession(bind));
                }
            }
            ServerMessage::ConnectionError { code, message } => {
                return Err(ServerError::ConnectionError { code, message }.into());
            }
            ServerMessage::End { code, message } => {
                return Err(ServerError::End { code, message }.into());
            }
            ServerMessage::Error { code, message } => {
                return Err(ServerError::Error { code, message }.into());
            }
            ServerMessage::Progressive { progressive } => {
                return Err(TlcpError::protocol(format!(
                    "Unexpected progressive {progressive}"
                )));
            }
            ServerMessage::ConnectionOk { .. }
            | ServerMessage::ClientIp { .. }
            | ServerMessage::Constraint { .. }
            | ServerMessage::NoOp
            | ServerMessage::Probe
            | ServerMessage::ServerName { .. }
            | ServerMessage::Synchronize { .. } => {}
        }
        Ok(())
    }

    /// Hand a notification to its subscription, if it still exists.
    async fn forward(&self, id: SubscriptionId, message: &ServerMessage) {
        let Some(state) = self.shared.subscriptions.get(id) else {
            trace!(subscription_id = %id, tag = message.tag(), "No subscription for message");
            return;
        };
        if matches!(state.consume(message).await, Step::Unsubscribe) {
            self.shared.unsubscribe(id);
        }
    }

    fn on_request_error(&self, request_id: RequestId, error: ServerError) {
        warn!(%request_id, error = %error, "Request refused");
        let error = TlcpError::Server(error);
        match self
            .shared
            .pending_requests
            .resolve(&request_id, Err(error.clone()))
        {
            Some(ClientMessage::Subscribe(subscribe)) => {
                if let Some(state) = self.shared.subscriptions.remove(subscribe.subscription_id) {
                    state.terminate(Err(error));
                }
            }
            Some(ClientMessage::Unsubscribe(unsubscribe)) => {
                self.shared.subscriptions.remove(unsubscribe.subscription_id);
            }
            _ => {}
        }
    }
}
