// Pluggable observers consulted before default event processing.
use strand_types::{ConnectionEvent, StreamId};

/// An observer given the chance to process each inbound event before the
/// registry and assembler do. Returning `false` means the event has been
/// fully handled: remaining interceptors and default processing are
/// skipped. Used for cross-cutting concerns (flow-control accounting,
/// tracing, stream-lifecycle hooks) without the registry knowing about
/// them.
pub trait EventInterceptor: Send {
    /// Observe or consume one inbound event. `true` continues dispatch.
    fn on_event(&mut self, event: &ConnectionEvent) -> bool;

    /// A new stream came into existence (currently: a promised stream was
    /// registered). Runs before any event for that stream is dispatched.
    fn on_stream_init(&mut self, _stream_id: StreamId) {}
}

/// Ordered interceptor chain owned by one connection. Only the connection
/// driver task touches it, so registration order is dispatch order and no
/// mutation races dispatch.
#[derive(Default)]
pub(crate) struct InterceptorChain {
    interceptors: Vec<Box<dyn EventInterceptor>>,
}

impl InterceptorChain {
    pub(crate) fn new(interceptors: Vec<Box<dyn EventInterceptor>>) -> Self {
        Self { interceptors }
    }

    /// `true` if default processing should proceed.
    pub(crate) fn dispatch(&mut self, event: &ConnectionEvent) -> bool {
        for interceptor in &mut self.interceptors {
            if !interceptor.on_event(event) {
                return false;
            }
        }
        true
    }

    pub(crate) fn notify_stream_init(&mut self, stream_id: StreamId) {
        for interceptor in &mut self.interceptors {
            interceptor.on_stream_init(stream_id);
        }
    }
}
