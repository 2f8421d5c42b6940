// Caller-facing handles correlating one outbound request with its
// response(s). The connection driver resolves these from its own task;
// awaiting them is safe from any other task, with no busy-waiting.
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use strand_types::{ExchangeError, RequestHead, Response, StreamId};
use tokio::sync::{mpsc, oneshot};

/// Handle for one submitted request: the primary response future plus the
/// growing sequence of server push promises announced against it.
#[derive(Debug)]
pub struct MessageExchange {
    stream_id: StreamId,
    response: ResponseFuture,
    push_promises: PushPromises,
}

impl MessageExchange {
    pub(crate) fn new(
        stream_id: StreamId,
        response_rx: oneshot::Receiver<Result<Response, ExchangeError>>,
        push_rx: mpsc::UnboundedReceiver<PushPromise>,
    ) -> Self {
        Self {
            stream_id,
            response: ResponseFuture { rx: response_rx },
            push_promises: PushPromises { rx: push_rx },
        }
    }

    /// Stream id the request was dispatched on.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Await the primary response, discarding any push promises.
    pub async fn response(self) -> Result<Response, ExchangeError> {
        self.response.await
    }

    /// Split into the primary response future and the push-promise
    /// sequence, so both can be driven independently.
    pub fn into_parts(self) -> (ResponseFuture, PushPromises) {
        (self.response, self.push_promises)
    }
}

/// Future for a response. Resolved exactly once by the connection driver,
/// with either a complete response or the error that terminated the
/// stream or connection.
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Response, ExchangeError>>,
}

impl Future for ResponseFuture {
    type Output = Result<Response, ExchangeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|resolved| match resolved {
            Ok(outcome) => outcome,
            // The driver resolves every registered exchange before going
            // away; a dropped sender means the exchange never registered.
            Err(_) => Err(ExchangeError::connection_closed(
                "exchange dropped before resolution",
            )),
        })
    }
}

/// The push promises announced for one exchange, in arrival order.
///
/// Grows until the primary stream completes or the connection is
/// destroyed. Consumed once: each promise is yielded to a single caller.
#[derive(Debug)]
pub struct PushPromises {
    rx: mpsc::UnboundedReceiver<PushPromise>,
}

impl PushPromises {
    /// Next promise, or `None` once the exchange can gain no more.
    pub async fn next(&mut self) -> Option<PushPromise> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`PushPromises::next`].
    pub fn try_next(&mut self) -> Option<PushPromise> {
        self.rx.try_recv().ok()
    }
}

/// A server-initiated push announcement tied to an originating exchange.
/// Carries the reconstructed promised request and the future for the
/// pushed response, which completes independently of the parent exchange.
#[derive(Debug)]
pub struct PushPromise {
    stream_id: StreamId,
    promised_stream_id: StreamId,
    request: RequestHead,
    response: ResponseFuture,
}

impl PushPromise {
    pub(crate) fn new(
        stream_id: StreamId,
        promised_stream_id: StreamId,
        request: RequestHead,
        response_rx: oneshot::Receiver<Result<Response, ExchangeError>>,
    ) -> Self {
        Self {
            stream_id,
            promised_stream_id,
            request,
            response: ResponseFuture { rx: response_rx },
        }
    }

    /// Stream id of the exchange this push was announced on.
    pub fn originating_stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Stream id the pushed response will arrive on.
    pub fn promised_stream_id(&self) -> StreamId {
        self.promised_stream_id
    }

    /// The request the server promised to answer.
    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    /// Await the pushed response.
    pub fn into_response(self) -> ResponseFuture {
        self.response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn response(status: u16) -> Response {
        Response {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
            trailers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn response_future_resolves_once_from_another_task() {
        let (tx, rx) = oneshot::channel();
        let (_push_tx, push_rx) = mpsc::unbounded_channel();
        let exchange = MessageExchange::new(1, rx, push_rx);
        assert_eq!(exchange.stream_id(), 1);

        tokio::spawn(async move {
            tx.send(Ok(response(204))).ok();
        });
        let resolved = exchange.response().await.unwrap();
        assert_eq!(resolved.status, 204);
    }

    #[tokio::test]
    async fn dropped_sender_surfaces_connection_closed() {
        let (tx, rx) = oneshot::channel::<Result<Response, ExchangeError>>();
        let (_push_tx, push_rx) = mpsc::unbounded_channel();
        let exchange = MessageExchange::new(3, rx, push_rx);
        drop(tx);
        match exchange.response().await {
            Err(ExchangeError::ConnectionClosed { .. }) => {}
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn push_promises_yield_in_arrival_order() {
        let (_tx, rx) = oneshot::channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let exchange = MessageExchange::new(5, rx, push_rx);
        let (_, mut promises) = exchange.into_parts();

        for promised in [2u32, 4] {
            let (_resp_tx, resp_rx) = oneshot::channel();
            push_tx
                .send(PushPromise::new(
                    5,
                    promised,
                    RequestHead::new("GET", "/asset", "https", "example.com"),
                    resp_rx,
                ))
                .unwrap();
        }
        drop(push_tx);

        assert_eq!(promises.next().await.unwrap().promised_stream_id(), 2);
        let second = promises.next().await.unwrap();
        assert_eq!(second.promised_stream_id(), 4);
        assert_eq!(second.originating_stream_id(), 5);
        assert!(promises.next().await.is_none());
    }
}
