// Per-connection stream registry: correlates inbound events with the
// exchange that originated them. Owned exclusively by the connection
// driver task, so no locking (all mutation is single-writer).
use std::collections::HashMap;

use strand_types::{ExchangeError, RequestHead, Response, StreamId};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::assembler::ResponseAssembler;
use crate::exchange::PushPromise;

type ResponseSender = oneshot::Sender<Result<Response, ExchangeError>>;

/// Driver-side state of an in-flight primary exchange.
pub(crate) struct PrimaryExchange {
    pub(crate) request: RequestHead,
    pub(crate) assembler: ResponseAssembler,
    response_tx: Option<ResponseSender>,
    pub(crate) push_tx: mpsc::UnboundedSender<PushPromise>,
}

impl PrimaryExchange {
    pub(crate) fn new(
        request: RequestHead,
        response_tx: ResponseSender,
        push_tx: mpsc::UnboundedSender<PushPromise>,
    ) -> Self {
        Self {
            request,
            assembler: ResponseAssembler::new(),
            response_tx: Some(response_tx),
            push_tx,
        }
    }

    /// Resolve the exchange's future. The send fails only if the caller
    /// abandoned the future, which is tolerated (cancellation never
    /// resets the stream).
    pub(crate) fn resolve(&mut self, outcome: Result<Response, ExchangeError>) {
        if let Some(tx) = self.response_tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Driver-side state of a promised (server-pushed) stream. Back-references
/// its parent by stream id only; it outlives the parent entry so a push
/// keeps being tracked after the primary response resolves.
pub(crate) struct PushedExchange {
    pub(crate) parent_stream_id: StreamId,
    pub(crate) assembler: ResponseAssembler,
    response_tx: Option<ResponseSender>,
}

impl PushedExchange {
    pub(crate) fn new(parent_stream_id: StreamId, response_tx: ResponseSender) -> Self {
        Self {
            parent_stream_id,
            assembler: ResponseAssembler::new(),
            response_tx: Some(response_tx),
        }
    }

    pub(crate) fn resolve(&mut self, outcome: Result<Response, ExchangeError>) {
        if let Some(tx) = self.response_tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Maps stream ids to exchanges. Primary (client-initiated) and promised
/// (server-pushed) streams live in disjoint maps: a promised id is never
/// resolved as a primary and vice versa.
#[derive(Default)]
pub(crate) struct StreamRegistry {
    in_flight: HashMap<StreamId, PrimaryExchange>,
    promised: HashMap<StreamId, PushedExchange>,
}

impl StreamRegistry {
    /// Register a primary exchange under its assigned stream id.
    /// Registration is append-only per id; a duplicate is a programming
    /// error and the attempt is rejected (the new exchange's future
    /// resolves as dropped).
    pub(crate) fn register(&mut self, stream_id: StreamId, exchange: PrimaryExchange) {
        if self.in_flight.contains_key(&stream_id) {
            debug_assert!(false, "stream {stream_id} already registered");
            warn!(stream_id, "rejecting duplicate stream registration");
            return;
        }
        self.in_flight.insert(stream_id, exchange);
    }

    pub(crate) fn register_push(&mut self, promised_stream_id: StreamId, exchange: PushedExchange) {
        if self.promised.contains_key(&promised_stream_id) {
            debug_assert!(false, "promised stream {promised_stream_id} already registered");
            warn!(promised_stream_id, "rejecting duplicate promised-stream registration");
            return;
        }
        self.promised.insert(promised_stream_id, exchange);
    }

    /// Look up an in-flight primary exchange. A miss is normal flow (the
    /// peer may frame a stream we already half-closed); callers drop the
    /// event and log.
    pub(crate) fn resolve(&mut self, stream_id: StreamId) -> Option<&mut PrimaryExchange> {
        self.in_flight.get_mut(&stream_id)
    }

    pub(crate) fn resolve_push(
        &mut self,
        promised_stream_id: StreamId,
    ) -> Option<&mut PushedExchange> {
        self.promised.get_mut(&promised_stream_id)
    }

    pub(crate) fn unregister(&mut self, stream_id: StreamId) -> Option<PrimaryExchange> {
        self.in_flight.remove(&stream_id)
    }

    pub(crate) fn unregister_push(
        &mut self,
        promised_stream_id: StreamId,
    ) -> Option<PushedExchange> {
        self.promised.remove(&promised_stream_id)
    }

    pub(crate) fn contains(&self, stream_id: StreamId) -> bool {
        self.in_flight.contains_key(&stream_id)
    }

    /// In-flight exchanges, primaries and promised streams together.
    pub(crate) fn len(&self) -> usize {
        self.in_flight.len() + self.promised.len()
    }

    /// Remove and return everything still registered, for connection
    /// teardown.
    pub(crate) fn drain(&mut self) -> (Vec<PrimaryExchange>, Vec<PushedExchange>) {
        (
            self.in_flight.drain().map(|(_, ex)| ex).collect(),
            self.promised.drain().map(|(_, ex)| ex).collect(),
        )
    }
}
