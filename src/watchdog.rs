//! Total body size guard.

use std::{
    pin::Pin,
    task::{ready, Context, Poll},
};

use actix_web::error::PayloadError;
use bytes::Bytes;
use futures_core::Stream;
use pin_project_lite::pin_project;
use tokio::sync::mpsc::UnboundedSender;

use crate::{decoder::Event, error::MultipartError};

pin_project! {
    /// Counts raw body bytes on their way to the decoder.
    ///
    /// Once the count exceeds the limit, a `RequestTooLarge` error is sent straight to the event
    /// channel, ahead of anything the decoder makes of the failing stream, and the stream is cut.
    pub(crate) struct BodyWatchdog<S> {
        #[pin]
        stream: S,
        limit: u64,
        received: u64,
        events: Option<UnboundedSender<Event>>,
    }
}

impl<S> BodyWatchdog<S> {
    pub(crate) fn new(stream: S, limit: u64, events: UnboundedSender<Event>) -> Self {
        BodyWatchdog {
            stream,
            limit,
            received: 0,
            events: Some(events),
        }
    }
}

impl<S> Stream for BodyWatchdog<S>
where
    S: Stream<Item = Result<Bytes, PayloadError>>,
{
    type Item = Result<Bytes, PayloadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        // tripped
        if this.events.is_none() {
            return Poll::Ready(None);
        }

        match ready!(this.stream.poll_next(cx)) {
            Some(Ok(chunk)) => {
                *this.received += chunk.len() as u64;

                if *this.received > *this.limit {
                    log::debug!(
                        "request body exceeded limit of {} bytes after {} bytes",
                        this.limit,
                        this.received
                    );

                    if let Some(events) = this.events.take() {
                        let _ = events.send(Event::Error(MultipartError::RequestTooLarge));
                    }

                    return Poll::Ready(Some(Err(PayloadError::Overflow)));
                }

                Poll::Ready(Some(Ok(chunk)))
            }

            item => Poll::Ready(item),
        }
    }
}
