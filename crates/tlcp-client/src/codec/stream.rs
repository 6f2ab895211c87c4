//! [`Stream`] that converts a stream of text frames into [`ServerMessage`]s.

use std::{
    collections::VecDeque,
    fmt::Display,
    pin::Pin,
    task::{Context, Poll, ready},
};

use futures_util::Stream;

use super::parser::TlcpParser;
use crate::{
    error::{TlcpError, TlcpResult},
    message::ServerMessage,
};

pin_project_lite::pin_project! {
    /// A [`Stream`] of parsed server messages.
    ///
    /// Frames need not be aligned with lines. Errors of the inner stream are
    /// reported as transport errors; the stream ends after the first error.
    #[derive(Debug)]
    pub struct ServerMessageStream<S> {
        #[pin]
        frames: S,
        parser: TlcpParser,
        ready: VecDeque<TlcpResult<ServerMessage>>,
        terminated: bool,
    }
}

impl<S> ServerMessageStream<S> {
    pub fn new(frames: S) -> Self {
        Self {
            frames,
            parser: TlcpParser::new(),
            ready: VecDeque::new(),
            terminated: false,
        }
    }
}

impl<S, T, E> Stream for ServerMessageStream<S>
where
    S: Stream<Item = Result<T, E>>,
    T: AsRef<str>,
    E: Display,
{
    type Item = TlcpResult<ServerMessage>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(item) = this.ready.pop_front() {
                if item.is_err() {
                    this.ready.clear();
                    *this.terminated = true;
                }
                return Poll::Ready(Some(item));
            }
            if *this.terminated {
                return Poll::Ready(None);
            }

            match ready!(this.frames.as_mut().poll_next(cx)) {
                Some(Ok(frame)) => {
                    this.ready.extend(this.parser.parse(frame.as_ref()));
                }
                Some(Err(err)) => {
                    *this.terminated = true;
                    return Poll::Ready(Some(Err(TlcpError::transport(err.to_string()))));
                }
                None => {
                    *this.terminated = true;
                    if this.parser.has_partial_line() {
                        return Poll::Ready(Some(Err(TlcpError::transport(
                            "Stream ended inside a line",
                        ))));
                    }
                    return Poll::Ready(None);
                }
            }
        }
    }
}
