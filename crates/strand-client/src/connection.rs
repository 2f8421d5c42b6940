// Per-connection state and the single-writer driver task.
//
// All inbound events and caller commands for one connection funnel through
// one queue into one task, so the registry, assembler, and interceptor
// chain mutate without locks. Futures resolved here are awaited from other
// tasks; the oneshot hand-off gives exactly-once resolution across that
// boundary.
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use strand_types::{
    ConnectionEvent, ErrorCode, ExchangeError, HeaderFields, RequestHead, Response,
    SettingsUpdate, StreamId,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::assembler::AssemblyStep;
use crate::exchange::{MessageExchange, PushPromise};
use crate::interceptor::{EventInterceptor, InterceptorChain};
use crate::registry::{PrimaryExchange, PushedExchange, StreamRegistry};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const LIFECYCLE_ACTIVE: u8 = 0;
const LIFECYCLE_DRAINING: u8 = 1;
const LIFECYCLE_DESTROYED: u8 = 2;

/// Connection lifecycle. Destroyed is terminal: no further registry
/// mutation happens and every exchange has been resolved with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Draining,
    Destroyed,
}

impl Lifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            LIFECYCLE_ACTIVE => Lifecycle::Active,
            LIFECYCLE_DRAINING => Lifecycle::Draining,
            _ => Lifecycle::Destroyed,
        }
    }
}

/// A request handed to the excluded outbound writer, tagged with the
/// stream id the registry filed its exchange under.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub stream_id: StreamId,
    pub request: RequestHead,
}

/// State observable without going through the driver queue.
#[derive(Debug)]
struct ConnectionShared {
    id: u64,
    /// Next client-initiated stream id (odd, ascending).
    next_stream_id: AtomicU32,
    lifecycle: AtomicU8,
    /// Registered exchanges, primaries plus promised streams.
    in_flight: AtomicUsize,
    /// Milliseconds since `epoch` of the last submit or inbound event.
    last_activity_ms: AtomicU64,
    epoch: Instant,
    /// Last advertised remote concurrency limit; 0 until settings arrive.
    max_concurrent_streams: AtomicU32,
    /// Outstanding pool leases. A leased connection is never idle-swept.
    leases: AtomicUsize,
}

impl ConnectionShared {
    fn new() -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            next_stream_id: AtomicU32::new(1),
            lifecycle: AtomicU8::new(LIFECYCLE_ACTIVE),
            in_flight: AtomicUsize::new(0),
            last_activity_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            max_concurrent_streams: AtomicU32::new(0),
            leases: AtomicUsize::new(0),
        }
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_activity_ms.load(Ordering::Relaxed)))
    }
}

enum Input {
    Event(ConnectionEvent),
    Submit {
        stream_id: StreamId,
        request: RequestHead,
        response_tx: oneshot::Sender<Result<Response, ExchangeError>>,
        push_tx: mpsc::UnboundedSender<PushPromise>,
    },
    Destroy(ExchangeError),
}

/// Cloneable handle to one connection. `submit` dispatches requests,
/// `deliver` is the codec's entry point for decoded events, `destroy`
/// tears the connection down and fails everything still registered.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    input_tx: mpsc::UnboundedSender<Input>,
    shared: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    /// Spawn a connection driver. `interceptors` are consulted in order
    /// for every inbound event; outbound requests are forwarded on
    /// `outbound_tx` for the transport's writer.
    pub fn spawn(
        interceptors: Vec<Box<dyn EventInterceptor>>,
        outbound_tx: mpsc::UnboundedSender<OutboundRequest>,
    ) -> Self {
        let shared = Arc::new(ConnectionShared::new());
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let state = ConnectionState {
            registry: StreamRegistry::default(),
            interceptors: InterceptorChain::new(interceptors),
            remote_settings: None,
            shared: Arc::clone(&shared),
            outbound_tx,
        };
        tokio::spawn(run_connection_driver(state, input_rx));
        Self { input_tx, shared }
    }

    /// Stable id for tracing.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Dispatch a request. The stream id is assigned here; the exchange
    /// registers on the driver and the request is forwarded to the
    /// writer. On a draining or destroyed connection the returned
    /// exchange fails immediately with `ConnectionClosed`.
    pub fn submit(&self, request: RequestHead) -> MessageExchange {
        let stream_id = self.shared.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (response_tx, response_rx) = oneshot::channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let exchange = MessageExchange::new(stream_id, response_rx, push_rx);

        let input = Input::Submit {
            stream_id,
            request,
            response_tx,
            push_tx,
        };
        if let Err(mpsc::error::SendError(rejected)) = self.input_tx.send(input)
            && let Input::Submit { response_tx, .. } = rejected
        {
            let _ = response_tx.send(Err(ExchangeError::connection_closed(
                "connection destroyed",
            )));
        }
        exchange
    }

    /// Feed one decoded inbound event. Events for a destroyed connection
    /// are dropped; the peer half of the stream is gone either way.
    pub fn deliver(&self, event: ConnectionEvent) {
        if self.input_tx.send(Input::Event(event)).is_err() {
            debug!(conn = self.shared.id, "dropping event for destroyed connection");
        }
    }

    /// Stop accepting new streams while in-flight exchanges finish.
    pub fn drain(&self) {
        if self
            .shared
            .lifecycle
            .compare_exchange(
                LIFECYCLE_ACTIVE,
                LIFECYCLE_DRAINING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            debug!(conn = self.shared.id, "connection draining");
        }
    }

    /// Destroy the connection: every registered exchange (primary and
    /// pushed) fails with `error`, the registry is cleared, and the
    /// driver exits. Idempotent.
    pub fn destroy(&self, error: ExchangeError) {
        let _ = self.input_tx.send(Input::Destroy(error));
    }

    /// Destroy with a generic local-close error.
    pub fn close(&self) {
        self.destroy(ExchangeError::connection_closed("closed by local endpoint"));
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.shared.lifecycle.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle() == Lifecycle::Active
    }

    pub fn is_destroyed(&self) -> bool {
        self.lifecycle() == Lifecycle::Destroyed
    }

    /// Registered exchanges, primaries plus promised streams.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Relaxed)
    }

    /// Time since the last submit or inbound event.
    pub fn idle_for(&self) -> Duration {
        self.shared.idle_for()
    }

    /// Last remote concurrency limit from a settings event; 0 if none
    /// has arrived.
    pub fn remote_max_concurrent_streams(&self) -> u32 {
        self.shared.max_concurrent_streams.load(Ordering::Relaxed)
    }

    /// Outstanding pool leases on this connection.
    pub fn active_leases(&self) -> usize {
        self.shared.leases.load(Ordering::Relaxed)
    }

    /// Record a pool lease. Counts as activity so a freshly leased
    /// connection never looks idle.
    pub(crate) fn begin_lease(&self) {
        self.shared.leases.fetch_add(1, Ordering::Relaxed);
        self.shared.touch();
    }

    /// Return a pool lease. Unmatched returns floor at zero instead of
    /// wrapping the counter.
    pub(crate) fn end_lease(&self) {
        let _ = self
            .shared
            .leases
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.shared.touch();
    }
}

/// Which registry map an event resolved into.
#[derive(Clone, Copy)]
enum Target {
    Primary,
    Pushed,
}

struct ConnectionState {
    registry: StreamRegistry,
    interceptors: InterceptorChain,
    remote_settings: Option<SettingsUpdate>,
    shared: Arc<ConnectionShared>,
    outbound_tx: mpsc::UnboundedSender<OutboundRequest>,
}

async fn run_connection_driver(
    mut state: ConnectionState,
    mut input_rx: mpsc::UnboundedReceiver<Input>,
) {
    while let Some(input) = input_rx.recv().await {
        match input {
            Input::Submit {
                stream_id,
                request,
                response_tx,
                push_tx,
            } => state.handle_submit(stream_id, request, response_tx, push_tx),
            Input::Event(event) => state.handle_event(event),
            Input::Destroy(error) => {
                state.destroy(error);
                break;
            }
        }
        if state.is_destroyed() {
            // Terminal event (goaway) processed above.
            break;
        }
    }
    // All handles dropped without an explicit destroy, or the loop broke:
    // make sure nothing stays unresolved.
    state.destroy(ExchangeError::connection_closed("connection handle dropped"));
}

impl ConnectionState {
    fn is_destroyed(&self) -> bool {
        self.shared.lifecycle.load(Ordering::Acquire) == LIFECYCLE_DESTROYED
    }

    fn handle_submit(
        &mut self,
        stream_id: StreamId,
        request: RequestHead,
        response_tx: oneshot::Sender<Result<Response, ExchangeError>>,
        push_tx: mpsc::UnboundedSender<PushPromise>,
    ) {
        if self.shared.lifecycle.load(Ordering::Acquire) != LIFECYCLE_ACTIVE {
            let _ = response_tx.send(Err(ExchangeError::connection_closed(
                "connection not accepting new streams",
            )));
            return;
        }
        self.shared.touch();
        // The writer is a separate concern; losing it surfaces when the
        // connection is invalidated, not here.
        let _ = self.outbound_tx.send(OutboundRequest {
            stream_id,
            request: request.clone(),
        });
        self.registry
            .register(stream_id, PrimaryExchange::new(request, response_tx, push_tx));
        self.sync_in_flight();
        debug!(conn = self.shared.id, stream_id, "exchange registered");
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        self.shared.touch();
        if !self.interceptors.dispatch(&event) {
            // An interceptor fully handled the event.
            return;
        }
        match event {
            ConnectionEvent::Headers {
                stream_id,
                fields,
                end_stream,
            } => self.on_headers(stream_id, fields, end_stream),
            ConnectionEvent::Data {
                stream_id,
                data,
                end_stream,
            } => self.on_data(stream_id, data, end_stream),
            ConnectionEvent::PushPromise {
                stream_id,
                promised_stream_id,
                fields,
            } => self.on_push_promise(stream_id, promised_stream_id, fields),
            ConnectionEvent::Reset {
                stream_id,
                error_code,
            } => self.on_reset(stream_id, error_code),
            ConnectionEvent::Settings(update) => self.on_settings(update),
            ConnectionEvent::GoAway {
                last_stream_id,
                error_code,
            } => {
                warn!(
                    conn = self.shared.id,
                    last_stream_id,
                    %error_code,
                    "goaway received"
                );
                self.destroy(ExchangeError::connection_closed(format!(
                    "goaway received (last stream {last_stream_id}, {error_code})"
                )));
            }
        }
    }

    fn on_headers(&mut self, stream_id: StreamId, fields: HeaderFields, end_stream: bool) {
        let step = if let Some(exchange) = self.registry.resolve(stream_id) {
            Some((Target::Primary, exchange.assembler.on_headers(fields, end_stream)))
        } else if let Some(pushed) = self.registry.resolve_push(stream_id) {
            Some((Target::Pushed, pushed.assembler.on_headers(fields, end_stream)))
        } else {
            None
        };

        match step {
            None => warn!(
                conn = self.shared.id,
                stream_id, "header block for unknown stream, dropping"
            ),
            Some((_, Ok(AssemblyStep::Incomplete))) => {}
            Some((target, Ok(AssemblyStep::Complete(response)))) => {
                self.complete(target, stream_id, response);
            }
            Some((target, Err(source))) => {
                self.fail(
                    target,
                    stream_id,
                    ExchangeError::HeaderTranslation { stream_id, source },
                );
            }
        }
    }

    fn on_data(&mut self, stream_id: StreamId, data: bytes::Bytes, end_stream: bool) {
        let step = if let Some(exchange) = self.registry.resolve(stream_id) {
            Some((Target::Primary, exchange.assembler.on_data(data, end_stream)))
        } else if let Some(pushed) = self.registry.resolve_push(stream_id) {
            Some((Target::Pushed, pushed.assembler.on_data(data, end_stream)))
        } else {
            None
        };

        match step {
            None => warn!(
                conn = self.shared.id,
                stream_id, "data for unknown stream, dropping"
            ),
            Some((_, AssemblyStep::Incomplete)) => {}
            Some((target, AssemblyStep::Complete(response))) => {
                self.complete(target, stream_id, response);
            }
        }
    }

    fn on_push_promise(
        &mut self,
        stream_id: StreamId,
        promised_stream_id: StreamId,
        fields: HeaderFields,
    ) {
        if !self.registry.contains(stream_id) {
            warn!(
                conn = self.shared.id,
                stream_id, promised_stream_id, "push promise for unknown stream, dropping"
            );
            return;
        }
        let request = match RequestHead::from_push_fields(&fields) {
            Ok(request) => request,
            Err(source) => {
                self.fail(
                    Target::Primary,
                    stream_id,
                    ExchangeError::HeaderTranslation { stream_id, source },
                );
                return;
            }
        };

        let (response_tx, response_rx) = oneshot::channel();
        self.registry
            .register_push(promised_stream_id, PushedExchange::new(stream_id, response_tx));
        // Give observers a chance to set up per-stream state before any
        // frame arrives on the promised stream.
        self.interceptors.notify_stream_init(promised_stream_id);

        let promise = PushPromise::new(stream_id, promised_stream_id, request, response_rx);
        if let Some(exchange) = self.registry.resolve(stream_id)
            && exchange.push_tx.send(promise).is_err()
        {
            debug!(
                conn = self.shared.id,
                stream_id, "caller abandoned the push promise sequence"
            );
        }
        self.sync_in_flight();
        debug!(
            conn = self.shared.id,
            stream_id, promised_stream_id, "push promise registered"
        );
    }

    fn on_reset(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        warn!(
            conn = self.shared.id,
            stream_id,
            %error_code,
            "stream reset by the remote peer"
        );
        let error = ExchangeError::StreamReset {
            stream_id,
            code: error_code,
        };
        if self.registry.contains(stream_id) {
            self.fail(Target::Primary, stream_id, error);
        } else if self.registry.resolve_push(stream_id).is_some() {
            self.fail(Target::Pushed, stream_id, error);
        }
        // A reset for an already-completed or unknown stream is a no-op.
    }

    fn on_settings(&mut self, update: SettingsUpdate) {
        if let Some(max) = update.max_concurrent_streams {
            self.shared
                .max_concurrent_streams
                .store(max, Ordering::Relaxed);
        }
        self.remote_settings = Some(update);
        debug!(conn = self.shared.id, ?update, "remote settings recorded");
    }

    fn complete(&mut self, target: Target, stream_id: StreamId, response: Response) {
        match target {
            Target::Primary => {
                if let Some(mut exchange) = self.registry.unregister(stream_id) {
                    exchange.resolve(Ok(response));
                    debug!(conn = self.shared.id, stream_id, "exchange completed");
                }
            }
            Target::Pushed => {
                // Only the pushed mapping goes; the primary exchange
                // stays registered until its own terminal event.
                if let Some(mut pushed) = self.registry.unregister_push(stream_id) {
                    pushed.resolve(Ok(response));
                    debug!(
                        conn = self.shared.id,
                        promised_stream_id = stream_id,
                        parent_stream_id = pushed.parent_stream_id,
                        "pushed response completed"
                    );
                }
            }
        }
        self.sync_in_flight();
    }

    fn fail(&mut self, target: Target, stream_id: StreamId, error: ExchangeError) {
        match target {
            Target::Primary => {
                if let Some(mut exchange) = self.registry.unregister(stream_id) {
                    exchange.resolve(Err(error));
                }
            }
            Target::Pushed => {
                if let Some(mut pushed) = self.registry.unregister_push(stream_id) {
                    pushed.resolve(Err(error));
                }
            }
        }
        self.sync_in_flight();
    }

    fn destroy(&mut self, error: ExchangeError) {
        if self.is_destroyed() {
            return;
        }
        self.shared
            .lifecycle
            .store(LIFECYCLE_DESTROYED, Ordering::Release);
        let (primaries, pushed) = self.registry.drain();
        let failed_primaries = primaries.len();
        let failed_pushed = pushed.len();
        for mut exchange in primaries {
            exchange.resolve(Err(error.clone()));
        }
        for mut promise in pushed {
            promise.resolve(Err(error.clone()));
        }
        self.shared.in_flight.store(0, Ordering::Relaxed);
        debug!(
            conn = self.shared.id,
            failed_primaries,
            failed_pushed,
            %error,
            "connection destroyed"
        );
    }

    fn sync_in_flight(&self) {
        self.shared
            .in_flight
            .store(self.registry.len(), Ordering::Relaxed);
        t_gauge!("strand_connection_in_flight", "conn" => self.shared.id.to_string())
            .set(self.registry.len() as f64);
    }
}
