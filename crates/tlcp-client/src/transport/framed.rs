//! Channel over a text frame sink and stream.
//!
//! [`FramedChannel`] adapts any connection that exchanges text frames (a
//! WebSocket split into its halves, for instance) to [`TlcpChannel`]. A
//! writer task encodes queued requests, packing consecutive `control` or
//! `msg` requests into one frame up to the send threshold; a reader task
//! parses inbound frames.

use std::{fmt::Display, time::Duration};

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::TlcpChannel;
use crate::{
    codec::{ServerMessageStream, TlcpEncoder},
    error::{TlcpError, TlcpResult},
    message::{ClientMessage, ServerMessage},
};

const OUTBOUND_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 1024;
/// Bound on writing the frames left once the channel is disconnected.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// [`TlcpChannel`] running a writer and a reader task.
#[derive(Debug)]
pub struct FramedChannel {
    outbound: mpsc::Sender<ClientMessage>,
    inbound: Mutex<mpsc::Receiver<TlcpResult<ServerMessage>>>,
    token: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl FramedChannel {
    /// Spawn the writer and reader tasks on the current runtime.
    pub fn new<Si, St, E>(sink: Si, stream: St) -> Self
    where
        Si: Sink<String> + Send + Unpin + 'static,
        Si::Error: Display + Send,
        St: Stream<Item = Result<String, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let token = CancellationToken::new();

        let writer = tokio::spawn(write_loop(sink, outbound_rx, token.clone()));
        let reader = tokio::spawn(read_loop(stream, inbound_tx, token.clone()));

        Self {
            outbound: outbound_tx,
            inbound: Mutex::new(inbound_rx),
            token,
            tasks: parking_lot::Mutex::new(vec![writer, reader]),
        }
    }
}

#[async_trait]
impl TlcpChannel for FramedChannel {
    async fn send(&self, message: ClientMessage) -> TlcpResult<()> {
        if self.token.is_cancelled() {
            return Err(TlcpError::transport("Channel disconnected"));
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| TlcpError::transport("Channel writer stopped"))
    }

    async fn recv(&self) -> Option<TlcpResult<ServerMessage>> {
        self.inbound.lock().await.recv().await
    }

    fn disconnect(&self) {
        self.token.cancel();
    }

    async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Channel task failed");
            }
        }
    }
}

async fn write_loop<Si>(
    mut sink: Si,
    mut outbound: mpsc::Receiver<ClientMessage>,
    token: CancellationToken,
) where
    Si: Sink<String> + Unpin,
    Si::Error: Display,
{
    let mut encoder = TlcpEncoder::new();
    let mut next: Option<ClientMessage> = None;
    loop {
        let first = match next.take() {
            Some(message) => message,
            None => tokio::select! {
                biased;
                _ = token.cancelled() => break,
                message = outbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            },
        };
        let frame = batch(&mut encoder, first, &mut outbound, &mut next);

        trace!(len = frame.len(), "Sending frame");
        let send = sink.send(frame);
        tokio::pin!(send);
        let sent = tokio::select! {
            biased;
            sent = &mut send => sent,
            // a frame already taken from the queue is still written
            _ = token.cancelled() => match timeout(FLUSH_TIMEOUT, &mut send).await {
                Ok(sent) => sent,
                Err(_) => {
                    debug!("Frame flush timed out");
                    return;
                }
            },
        };
        if let Err(err) = sent {
            warn!(error = %err, "Failed to send frame");
            token.cancel();
            return;
        }
    }

    // requests queued before the disconnect, such as a final destroy
    outbound.close();
    let first = match next.take() {
        Some(message) => Some(message),
        None => outbound.try_recv().ok(),
    };
    if let Some(first) = first {
        let mut frames = Vec::new();
        let mut next = Some(first);
        while let Some(first) = next.take() {
            frames.push(batch(&mut encoder, first, &mut outbound, &mut next));
        }
        let flush = async {
            for frame in frames {
                sink.send(frame).await?;
            }
            sink.close().await
        };
        match timeout(FLUSH_TIMEOUT, flush).await {
            Ok(Ok(())) => trace!("Queued frames flushed"),
            Ok(Err(err)) => debug!(error = %err, "Failed to flush queued frames"),
            Err(_) => debug!("Frame flush timed out"),
        }
        return;
    }
    if let Err(err) = sink.close().await {
        debug!(error = %err, "Failed to close sink");
    }
}

/// Encode `first` and every queued request that fits in the same frame;
/// the first one that does not is left in `next`.
fn batch(
    encoder: &mut TlcpEncoder,
    first: ClientMessage,
    outbound: &mut mpsc::Receiver<ClientMessage>,
    next: &mut Option<ClientMessage>,
) -> String {
    encoder.encode(&first);
    while let Ok(message) = outbound.try_recv() {
        if encoder.accepts(&message) {
            encoder.encode_parameters(&message);
        } else {
            *next = Some(message);
            break;
        }
    }
    encoder.take_frame()
}

async fn read_loop<St, E>(
    stream: St,
    inbound: mpsc::Sender<TlcpResult<ServerMessage>>,
    token: CancellationToken,
) where
    St: Stream<Item = Result<String, E>> + Unpin,
    E: Display,
{
    let mut messages = ServerMessageStream::new(stream);
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            message = messages.next() => message,
        };
        let Some(message) = message else {
            debug!("Inbound stream ended");
            break;
        };
        let failed = message.is_err();
        if inbound.send(message).await.is_err() || failed {
            break;
        }
    }
    // the writer has no use once the inbound side is gone
    token.cancel();
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, time::Duration};

    use futures::channel::mpsc as frames;
    use tokio::time::timeout;

    use super::*;
    use crate::{
        message::{Destroy, Unsubscribe},
        types::SubscriptionId,
    };

    fn unsubscribe(id: u32) -> ClientMessage {
        ClientMessage::Unsubscribe(Unsubscribe {
            subscription_id: SubscriptionId(id),
        })
    }

    fn channel() -> (
        FramedChannel,
        frames::UnboundedReceiver<String>,
        frames::UnboundedSender<String>,
    ) {
        let (sink, written) = frames::unbounded::<String>();
        let (feed, stream) = frames::unbounded::<String>();
        let channel = FramedChannel::new(sink, stream.map(Ok::<_, Infallible>));
        (channel, written, feed)
    }

    #[tokio::test]
    async fn test_consecutive_controls_share_a_frame() {
        let (channel, mut written, _feed) = channel();
        channel.send(unsubscribe(1)).await.expect("queued");
        channel.send(unsubscribe(2)).await.expect("queued");
        channel.send(ClientMessage::Heartbeat).await.expect("queued");

        let frame = timeout(Duration::from_secs(3), written.next())
            .await
            .expect("frame written")
            .expect("open sink");
        assert_eq!(
            frame,
            "control\r\nLS_reqId=u1&LS_subId=1&LS_op=delete\r\n\
             LS_reqId=u2&LS_subId=2&LS_op=delete\r\n"
        );
        let frame = timeout(Duration::from_secs(3), written.next())
            .await
            .expect("frame written")
            .expect("open sink");
        assert_eq!(frame, "heartbeat\r\n\r\n");
    }

    #[tokio::test]
    async fn test_frames_are_parsed() {
        let (channel, _written, feed) = channel();
        feed.unbounded_send("CONOK,S1,50000,5000,*\r\nPRO".to_string())
            .expect("fed");
        feed.unbounded_send("BE\r\n".to_string()).expect("fed");

        let first = channel.recv().await.expect("message").expect("valid");
        assert!(matches!(first, ServerMessage::ConnectionOk { .. }));
        let second = channel.recv().await.expect("message").expect("valid");
        assert_eq!(second, ServerMessage::Probe);

        drop(feed);
        assert!(channel.recv().await.is_none());
        timeout(Duration::from_secs(3), channel.join())
            .await
            .expect("tasks finished");
        assert!(channel.send(ClientMessage::Heartbeat).await.is_err());
    }

    #[tokio::test]
    async fn test_decode_error_closes_inbound() {
        let (channel, _written, feed) = channel();
        feed.unbounded_send("BOGUS\r\nPROBE\r\n".to_string())
            .expect("fed");
        assert!(matches!(
            channel.recv().await,
            Some(Err(TlcpError::Decode { .. }))
        ));
        assert!(channel.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_queued_destroy_is_flushed_on_disconnect() {
        let (channel, mut written, _feed) = channel();
        channel
            .send(ClientMessage::Destroy(Destroy {
                close_socket: true,
                ..Default::default()
            }))
            .await
            .expect("queued");
        channel.disconnect();
        timeout(Duration::from_secs(3), channel.join())
            .await
            .expect("tasks finished");

        let frame = written.next().await.expect("destroy frame written");
        assert!(frame.starts_with("control\r\n"), "{frame}");
        assert!(frame.contains("LS_op=destroy"), "{frame}");
        assert!(frame.contains("LS_close_socket=true"), "{frame}");
        assert!(written.next().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_stops_tasks() {
        let (channel, mut written, _feed) = channel();
        channel.disconnect();
        timeout(Duration::from_secs(3), channel.join())
            .await
            .expect("tasks finished");
        assert!(written.next().await.is_none());
        assert!(channel.recv().await.is_none());
    }
}
