// End-to-end scenarios over an in-memory codec stand-in: the test plays
// the decoder, delivering decoded events straight to connection handles.
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::connection::{ConnectionHandle, OutboundRequest};
use crate::interceptor::EventInterceptor;
use crate::pool::{ConnectionPool, Connector, spawn_sweeper};
use crate::types::{
    ConnectionEvent, ErrorCode, ExchangeError, HeaderFields, RequestHead, StreamId,
};
use crate::PoolConfig;

fn fields(pairs: &[(&str, &str)]) -> HeaderFields {
    pairs
        .iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect()
}

fn get(path: &str) -> RequestHead {
    RequestHead::new("GET", path, "https", "example.com")
}

fn spawn_conn() -> (ConnectionHandle, mpsc::UnboundedReceiver<OutboundRequest>) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    (ConnectionHandle::spawn(Vec::new(), outbound_tx), outbound_rx)
}

fn headers(stream_id: StreamId, status: &str, end_stream: bool) -> ConnectionEvent {
    ConnectionEvent::Headers {
        stream_id,
        fields: fields(&[(":status", status)]),
        end_stream,
    }
}

fn data(stream_id: StreamId, chunk: &'static [u8], end_stream: bool) -> ConnectionEvent {
    ConnectionEvent::Data {
        stream_id,
        data: Bytes::from_static(chunk),
        end_stream,
    }
}

#[tokio::test]
async fn primary_response_assembles_from_partial_frames() -> Result<()> {
    let (conn, _outbound) = spawn_conn();
    let exchange = conn.submit(get("/"));
    let sid = exchange.stream_id();

    conn.deliver(headers(sid, "200", false));
    conn.deliver(data(sid, b"ab", false));
    conn.deliver(data(sid, b"cd", true));

    let response = timeout(Duration::from_secs(1), exchange.response()).await??;
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"abcd");
    Ok(())
}

#[tokio::test]
async fn interleaved_streams_keep_bodies_separate() -> Result<()> {
    let (conn, _outbound) = spawn_conn();
    let first = conn.submit(get("/one"));
    let second = conn.submit(get("/two"));
    let (a, b) = (first.stream_id(), second.stream_id());

    // Interleave the two streams' events arbitrarily.
    conn.deliver(headers(b, "200", false));
    conn.deliver(headers(a, "201", false));
    conn.deliver(data(b, b"BB", false));
    conn.deliver(data(a, b"aa", false));
    conn.deliver(data(a, b"aa", true));
    conn.deliver(data(b, b"BB", false));
    conn.deliver(data(b, b"BB", true));

    let first = timeout(Duration::from_secs(1), first.response()).await??;
    let second = timeout(Duration::from_secs(1), second.response()).await??;
    assert_eq!(first.status, 201);
    assert_eq!(&first.body[..], b"aaaa");
    assert_eq!(second.status, 200);
    assert_eq!(&second.body[..], b"BBBBBB");
    Ok(())
}

#[tokio::test]
async fn push_promise_tracked_through_pushed_response() -> Result<()> {
    let (conn, _outbound) = spawn_conn();
    let exchange = conn.submit(get("/index.html"));
    let sid = exchange.stream_id();
    let (response, mut promises) = exchange.into_parts();

    conn.deliver(ConnectionEvent::PushPromise {
        stream_id: sid,
        promised_stream_id: 7,
        fields: fields(&[
            (":method", "GET"),
            (":path", "/style.css"),
            (":scheme", "https"),
            (":authority", "example.com"),
        ]),
    });

    // The promise is visible while the primary response is still in flight.
    let promise = timeout(Duration::from_secs(1), promises.next())
        .await?
        .expect("one promise");
    assert_eq!(promise.promised_stream_id(), 7);
    assert_eq!(promise.originating_stream_id(), sid);
    assert_eq!(promise.request().path, "/style.css");

    // Primary completes first; the pushed stream keeps being tracked.
    conn.deliver(headers(sid, "200", false));
    conn.deliver(data(sid, b"<html>", true));
    let primary = timeout(Duration::from_secs(1), response).await??;
    assert_eq!(primary.status, 200);

    conn.deliver(headers(7, "200", false));
    conn.deliver(data(7, b"body{}", true));
    let pushed = timeout(Duration::from_secs(1), promise.into_response()).await??;
    assert_eq!(&pushed.body[..], b"body{}");

    // The promise sequence ends with the primary exchange.
    assert!(timeout(Duration::from_secs(1), promises.next()).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn push_promise_for_unknown_stream_is_dropped() -> Result<()> {
    let (conn, _outbound) = spawn_conn();
    let exchange = conn.submit(get("/"));
    let sid = exchange.stream_id();
    let (response, mut promises) = exchange.into_parts();

    conn.deliver(ConnectionEvent::PushPromise {
        stream_id: 41,
        promised_stream_id: 42,
        fields: fields(&[(":method", "GET"), (":path", "/ghost")]),
    });

    // No promise appears and the live exchange is untouched.
    conn.deliver(headers(sid, "200", true));
    let primary = timeout(Duration::from_secs(1), response).await??;
    assert_eq!(primary.status, 200);
    assert!(timeout(Duration::from_secs(1), promises.next()).await?.is_none());

    // Frames for the never-registered promised stream are dropped too.
    conn.deliver(data(42, b"ghost", true));
    Ok(())
}

#[tokio::test]
async fn reset_fails_the_future_and_later_resets_are_noops() -> Result<()> {
    let (conn, _outbound) = spawn_conn();
    let exchange = conn.submit(get("/"));
    let sid = exchange.stream_id();

    conn.deliver(ConnectionEvent::Reset {
        stream_id: sid,
        error_code: ErrorCode::REFUSED_STREAM,
    });
    match timeout(Duration::from_secs(1), exchange.response()).await? {
        Err(ExchangeError::StreamReset { stream_id, code }) => {
            assert_eq!(stream_id, sid);
            assert_eq!(code, ErrorCode::REFUSED_STREAM);
        }
        other => panic!("expected StreamReset, got {other:?}"),
    }

    // A second reset for the same (now unknown) stream changes nothing;
    // the connection keeps serving other exchanges.
    conn.deliver(ConnectionEvent::Reset {
        stream_id: sid,
        error_code: ErrorCode::CANCEL,
    });
    let next = conn.submit(get("/after"));
    conn.deliver(headers(next.stream_id(), "204", true));
    let response = timeout(Duration::from_secs(1), next.response()).await??;
    assert_eq!(response.status, 204);
    Ok(())
}

#[tokio::test]
async fn goaway_fails_every_registered_exchange() -> Result<()> {
    let (conn, _outbound) = spawn_conn();
    let first = conn.submit(get("/one"));
    let second = conn.submit(get("/two"));
    let sid = first.stream_id();
    let (first_response, mut promises) = first.into_parts();

    conn.deliver(ConnectionEvent::PushPromise {
        stream_id: sid,
        promised_stream_id: 2,
        fields: fields(&[(":method", "GET"), (":path", "/pushed")]),
    });
    let promise = timeout(Duration::from_secs(1), promises.next())
        .await?
        .expect("one promise");

    conn.deliver(ConnectionEvent::GoAway {
        last_stream_id: 0,
        error_code: ErrorCode::NO_ERROR,
    });

    for outcome in [
        timeout(Duration::from_secs(1), first_response).await?,
        timeout(Duration::from_secs(1), second.response()).await?,
        timeout(Duration::from_secs(1), promise.into_response()).await?,
    ] {
        match outcome {
            Err(ExchangeError::ConnectionClosed { .. }) => {}
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }
    assert!(conn.is_destroyed());
    assert_eq!(conn.in_flight(), 0);
    Ok(())
}

struct DataSink {
    consumed: Arc<AtomicUsize>,
    inits: Arc<AtomicUsize>,
}

impl EventInterceptor for DataSink {
    fn on_event(&mut self, event: &ConnectionEvent) -> bool {
        if matches!(event, ConnectionEvent::Data { .. }) {
            self.consumed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    fn on_stream_init(&mut self, _stream_id: StreamId) {
        self.inits.fetch_add(1, Ordering::Relaxed);
    }
}

#[tokio::test]
async fn interceptor_veto_skips_default_processing() -> Result<()> {
    let consumed = Arc::new(AtomicUsize::new(0));
    let inits = Arc::new(AtomicUsize::new(0));
    let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
    let conn = ConnectionHandle::spawn(
        vec![Box::new(DataSink {
            consumed: consumed.clone(),
            inits: inits.clone(),
        })],
        outbound_tx,
    );

    let exchange = conn.submit(get("/"));
    let sid = exchange.stream_id();
    conn.deliver(headers(sid, "200", false));
    // The interceptor swallows both data frames, so assembly never
    // completes from them.
    conn.deliver(data(sid, b"ab", false));
    conn.deliver(data(sid, b"cd", true));
    conn.deliver(ConnectionEvent::PushPromise {
        stream_id: sid,
        promised_stream_id: 4,
        fields: fields(&[(":method", "GET"), (":path", "/pushed")]),
    });
    // Terminate with trailers, which the interceptor lets through.
    conn.deliver(ConnectionEvent::Headers {
        stream_id: sid,
        fields: fields(&[("outcome", "trailed")]),
        end_stream: true,
    });

    let response = timeout(Duration::from_secs(1), exchange.response()).await??;
    assert!(response.body.is_empty());
    assert_eq!(response.trailer("outcome"), Some("trailed"));
    assert_eq!(consumed.load(Ordering::Relaxed), 2);
    assert_eq!(inits.load(Ordering::Relaxed), 1, "promised stream init hook");
    Ok(())
}

struct PoolConnector {
    created: AtomicUsize,
}

impl Connector for Arc<PoolConnector> {
    async fn connect(&self, _destination: &str) -> Result<ConnectionHandle> {
        self.created.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        Ok(ConnectionHandle::spawn(Vec::new(), outbound_tx))
    }
}

#[tokio::test]
async fn idle_sweep_then_acquire_creates_a_fresh_connection() -> Result<()> {
    let connector = Arc::new(PoolConnector {
        created: AtomicUsize::new(0),
    });
    let pool = Arc::new(ConnectionPool::new(
        connector.clone(),
        PoolConfig {
            max_per_destination: 1,
            idle_timeout: Duration::from_millis(30),
            sweep_interval: Duration::from_millis(10),
        },
    ));
    let sweeper = spawn_sweeper(Arc::clone(&pool));

    // Two exchanges multiplexed on the one pooled connection.
    let conn = pool.acquire("https://example.com").await?;
    let again = pool.acquire("https://example.com").await?;
    assert_eq!(conn.id(), again.id());
    let first = conn.submit(get("/one"));
    let second = conn.submit(get("/two"));
    conn.deliver(headers(first.stream_id(), "200", true));
    conn.deliver(headers(second.stream_id(), "200", true));
    first.response().await?;
    second.response().await?;
    pool.release(&again);
    pool.release(&conn);

    // Past the idle threshold the sweeper evicts and destroys it.
    timeout(Duration::from_secs(2), async {
        while !conn.is_destroyed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    sweeper.abort();

    // The same destination now gets a brand-new connection.
    let fresh = pool.acquire("https://example.com").await?;
    assert_ne!(fresh.id(), conn.id());
    assert_eq!(connector.created.load(Ordering::Relaxed), 2);
    Ok(())
}
