//! Lock-free correlation tables using `scc::HashMap`.
//!
//! Requests are keyed by request id and kept until the server replies, so
//! they can be sent again verbatim when the session is recovered. Messages
//! are keyed by `(sequence, progressive)` and resolved by their outcome.

use tokio::sync::oneshot;

use crate::{
    error::{TlcpError, TlcpResult},
    message::ClientMessage,
    types::RequestId,
};

/// Reply channel of a pending request.
pub(crate) type RequestReply = oneshot::Receiver<TlcpResult<()>>;

/// A request awaiting `REQOK`/`REQERR`.
pub(crate) struct PendingRequest {
    message: ClientMessage,
    response_tx: oneshot::Sender<TlcpResult<()>>,
    /// Handed to the channel at least once.
    sent: bool,
}

/// Store for pending requests.
#[derive(Default)]
pub(crate) struct PendingRequestStore {
    requests: scc::HashMap<RequestId, PendingRequest>,
}

impl PendingRequestStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `message`.
    ///
    /// Returns `None` if a request with the same id is already pending.
    pub(crate) fn add(&self, message: ClientMessage) -> Option<RequestReply> {
        let (tx, rx) = oneshot::channel();
        let pending = PendingRequest {
            response_tx: tx,
            sent: false,
            message,
        };
        if self
            .requests
            .insert_sync(pending.message.request_id(), pending)
            .is_err()
        {
            return None;
        }
        Some(rx)
    }

    /// Record that the request has been handed to a channel.
    pub(crate) fn mark_sent(&self, id: &RequestId) {
        self.requests.update_sync(id, |_, pending| pending.sent = true);
    }

    /// Resolve a pending request.
    ///
    /// Returns the original message if the request was pending.
    pub(crate) fn resolve(&self, id: &RequestId, result: TlcpResult<()>) -> Option<ClientMessage> {
        let (_, pending) = self.requests.remove_sync(id)?;
        // the caller may have stopped waiting
        let _ = pending.response_tx.send(result);
        Some(pending.message)
    }

    /// Remove a pending request without notifying the receiver.
    pub(crate) fn remove(&self, id: &RequestId) -> bool {
        self.requests.remove_sync(id).is_some()
    }

    /// Requests that reached a previous channel, to be sent again on recovery.
    pub(crate) fn sent_requests(&self) -> Vec<ClientMessage> {
        let mut requests = Vec::new();
        self.requests.retain_sync(|_, pending| {
            if pending.sent {
                requests.push(pending.message.clone());
            }
            true
        });
        requests
    }

    /// Fail every pending request with `error`.
    pub(crate) fn clear_with_error(&self, error: &TlcpError) {
        let mut ids = Vec::new();
        self.requests.retain_sync(|id, _| {
            ids.push(id.clone());
            true
        });
        for id in ids {
            self.resolve(&id, Err(error.clone()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Outcome of an application message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Processed by the adapter, with its response.
    Done(String),
    /// Refused by the adapter.
    Fail { code: i32, message: String },
}

/// Correlation key of a message outcome.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct MessageKey {
    pub(crate) sequence: Option<String>,
    pub(crate) prog: u64,
}

/// Store for messages awaiting `MSGDONE`/`MSGFAIL`.
#[derive(Default)]
pub(crate) struct PendingMessageStore {
    messages: scc::HashMap<MessageKey, oneshot::Sender<TlcpResult<MessageOutcome>>>,
}

impl PendingMessageStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, key: MessageKey) -> Option<oneshot::Receiver<TlcpResult<MessageOutcome>>> {
        let (tx, rx) = oneshot::channel();
        if self.messages.insert_sync(key, tx).is_err() {
            return None;
        }
        Some(rx)
    }

    pub(crate) fn resolve(&self, key: &MessageKey, outcome: MessageOutcome) -> bool {
        if let Some((_, tx)) = self.messages.remove_sync(key) {
            let _ = tx.send(Ok(outcome));
            return true;
        }
        false
    }

    pub(crate) fn remove(&self, key: &MessageKey) -> bool {
        self.messages.remove_sync(key).is_some()
    }

    pub(crate) fn clear_with_error(&self, error: &TlcpError) {
        let mut keys = Vec::new();
        self.messages.retain_sync(|key, _| {
            keys.push(key.clone());
            true
        });
        for key in keys {
            if let Some((_, tx)) = self.messages.remove_sync(&key) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }
}

/// Per-sequence message progressives, starting at 1.
#[derive(Default)]
pub(crate) struct SequenceProgressives {
    counters: scc::HashMap<String, u64>,
}

impl SequenceProgressives {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Next progressive of `sequence`; unordered messages use `""`.
    pub(crate) fn next(&self, sequence: &str) -> u64 {
        loop {
            if let Some(prog) = self.counters.update_sync(sequence, |_, prog| {
                *prog += 1;
                *prog
            }) {
                return prog;
            }
            // lost the race with a concurrent insert: retry the update
            if self.counters.insert_sync(sequence.to_string(), 1).is_ok() {
                return 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::Unsubscribe,
        types::SubscriptionId,
    };

    fn unsubscribe(id: u32) -> ClientMessage {
        ClientMessage::Unsubscribe(Unsubscribe {
            subscription_id: SubscriptionId(id),
        })
    }

    #[tokio::test]
    async fn test_add_and_resolve() {
        let store = PendingRequestStore::new();
        let rx = store.add(unsubscribe(1)).expect("added");
        assert_eq!(store.len(), 1);

        let message = store.resolve(&RequestId::from("u1"), Ok(()));
        assert_eq!(message, Some(unsubscribe(1)));
        assert!(rx.await.expect("resolved").is_ok());
        assert!(store.is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = PendingRequestStore::new();
        let _rx = store.add(unsubscribe(1)).expect("added");
        assert!(store.add(unsubscribe(1)).is_none());
    }

    #[test]
    fn test_second_resolve_is_noop() {
        let store = PendingRequestStore::new();
        let _rx = store.add(unsubscribe(1)).expect("added");
        assert!(store.resolve(&RequestId::from("u1"), Ok(())).is_some());
        assert!(store.resolve(&RequestId::from("u1"), Ok(())).is_none());
    }

    #[test]
    fn test_only_sent_requests_are_replayed() {
        let store = PendingRequestStore::new();
        let _a = store.add(unsubscribe(1)).expect("added");
        let _b = store.add(unsubscribe(2)).expect("added");
        store.mark_sent(&RequestId::from("u2"));
        assert_eq!(store.sent_requests(), vec![unsubscribe(2)]);
    }

    #[tokio::test]
    async fn test_clear_with_error() {
        let store = PendingRequestStore::new();
        let rx = store.add(unsubscribe(1)).expect("added");
        store.clear_with_error(&TlcpError::cancelled("closed"));
        let result = rx.await.expect("resolved");
        assert!(matches!(result, Err(TlcpError::Cancelled { .. })));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_message_store() {
        let store = PendingMessageStore::new();
        let key = MessageKey {
            sequence: None,
            prog: 1,
        };
        let rx = store.add(key.clone()).expect("added");
        assert!(store.add(key.clone()).is_none());
        assert!(store.resolve(&key, MessageOutcome::Done("OK".into())));
        assert_eq!(
            rx.await.expect("resolved").expect("outcome"),
            MessageOutcome::Done("OK".into())
        );
        assert_eq!(store.len(), 0);
        assert!(!store.remove(&key));
    }

    #[test]
    fn test_progressives_per_sequence() {
        let progressives = SequenceProgressives::new();
        assert_eq!(progressives.next(""), 1);
        assert_eq!(progressives.next(""), 2);
        assert_eq!(progressives.next("orders"), 1);
        assert_eq!(progressives.next(""), 3);
        assert_eq!(progressives.next("orders"), 2);
    }
}
