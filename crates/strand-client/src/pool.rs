// Destination-keyed connection pool: reuse, idle eviction, invalidation.
//
// Membership lives behind one mutex, never held across an await. A
// connection leaves membership under that lock before it is destroyed, so
// a lease can never be handed out for a connection mid-destruction.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use strand_types::ExchangeError;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::{PoolConfig, runtime_pool_config};
use crate::connection::ConnectionHandle;

/// Creates connections for the pool. Owned by the excluded connector
/// layer: transport setup, TLS, preface exchange all happen behind this
/// seam before the handle is returned.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        destination: &str,
    ) -> impl Future<Output = Result<ConnectionHandle>> + Send;
}

struct PooledConn {
    handle: ConnectionHandle,
}

/// Pool of multiplexed connections keyed by destination. Connections are
/// shared, not checked out: `acquire` hands out a clone of the handle and
/// grows the pool up to `max_per_destination` before reusing round-robin.
pub struct ConnectionPool<C: Connector> {
    connector: C,
    config: PoolConfig,
    entries: Mutex<HashMap<String, Vec<PooledConn>>>,
    rr: AtomicUsize,
    leases: AtomicUsize,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            entries: Mutex::new(HashMap::new()),
            rr: AtomicUsize::new(0),
            leases: AtomicUsize::new(0),
        }
    }

    /// Pool with `STRAND_*` environment overrides applied.
    pub fn from_env(connector: C) -> Self {
        Self::new(connector, runtime_pool_config().clone())
    }

    /// Lease a connection for `destination`, creating one if the pool is
    /// below its per-destination bound. Never leases a draining or
    /// destroyed connection.
    pub async fn acquire(&self, destination: &str) -> Result<ConnectionHandle> {
        {
            let mut entries = self.entries.lock().expect("pool membership lock");
            let list = entries.entry(destination.to_string()).or_default();
            list.retain(|conn| !conn.handle.is_destroyed());
            if list.len() >= self.config.max_per_destination {
                if let Some(handle) = self.pick_active(list) {
                    return Ok(self.lease(handle));
                }
                bail!("no active pooled connection for {destination}");
            }
        }

        // Grow: connect outside the membership lock.
        let handle = self
            .connector
            .connect(destination)
            .await
            .with_context(|| format!("connect new pooled connection to {destination}"))?;

        let mut entries = self.entries.lock().expect("pool membership lock");
        let list = entries.entry(destination.to_string()).or_default();
        list.retain(|conn| !conn.handle.is_destroyed());
        if list.len() >= self.config.max_per_destination {
            // Lost the growth race; fall back to an existing connection.
            if let Some(existing) = self.pick_active(list) {
                handle.close();
                return Ok(self.lease(existing));
            }
        }
        debug!(destination, conn = handle.id(), "pooled new connection");
        list.push(PooledConn {
            handle: handle.clone(),
        });
        t_gauge!("strand_pool_connections").set(total_pooled(&entries) as f64);
        Ok(self.lease(handle))
    }

    /// Return a lease. Connections are multiplexed so nothing is handed
    /// back physically; this is activity and gauge bookkeeping. An
    /// unmatched release floors the accounting at zero.
    pub fn release(&self, handle: &ConnectionHandle) {
        handle.end_lease();
        let remaining = self
            .leases
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .map_or(0, |prev| prev - 1);
        t_gauge!("strand_pool_leases").set(remaining as f64);
    }

    /// Remove `handle` from the pool and destroy it, failing every
    /// exchange still pending on it with `PoolInvalidated`.
    pub fn invalidate(&self, handle: &ConnectionHandle, reason: &str) {
        {
            let mut entries = self.entries.lock().expect("pool membership lock");
            for list in entries.values_mut() {
                list.retain(|conn| conn.handle.id() != handle.id());
            }
            entries.retain(|_, list| !list.is_empty());
            t_gauge!("strand_pool_connections").set(total_pooled(&entries) as f64);
        }
        debug!(conn = handle.id(), reason, "invalidating pooled connection");
        handle.destroy(ExchangeError::PoolInvalidated {
            reason: reason.to_string(),
        });
        t_counter!("strand_pool_invalidations_total").increment(1);
    }

    /// Evict and destroy connections that have had no in-flight exchanges
    /// for longer than the idle timeout. Returns how many were evicted.
    pub fn sweep_idle(&self) -> usize {
        let mut victims = Vec::new();
        {
            let mut entries = self.entries.lock().expect("pool membership lock");
            for list in entries.values_mut() {
                list.retain(|conn| {
                    if conn.handle.is_destroyed() {
                        return false;
                    }
                    let idle = conn.handle.in_flight() == 0
                        && conn.handle.active_leases() == 0
                        && conn.handle.idle_for() >= self.config.idle_timeout;
                    if idle {
                        victims.push(conn.handle.clone());
                    }
                    !idle
                });
            }
            entries.retain(|_, list| !list.is_empty());
            t_gauge!("strand_pool_connections").set(total_pooled(&entries) as f64);
        }
        for handle in &victims {
            debug!(conn = handle.id(), "evicting idle connection");
            handle.destroy(ExchangeError::connection_closed("evicted after idle timeout"));
        }
        t_counter!("strand_pool_evictions_total").increment(victims.len() as u64);
        victims.len()
    }

    /// Pooled connections for one destination. Destroyed connections are
    /// purged before counting, so membership never reports one.
    pub fn pooled(&self, destination: &str) -> usize {
        let mut entries = self.entries.lock().expect("pool membership lock");
        prune_destroyed(&mut entries);
        entries.get(destination).map_or(0, Vec::len)
    }

    /// Pooled connections across all destinations.
    pub fn total_pooled(&self) -> usize {
        let mut entries = self.entries.lock().expect("pool membership lock");
        prune_destroyed(&mut entries);
        total_pooled(&entries)
    }

    fn pick_active(&self, list: &[PooledConn]) -> Option<ConnectionHandle> {
        if list.is_empty() {
            return None;
        }
        let start = self.rr.fetch_add(1, Ordering::Relaxed);
        (0..list.len())
            .map(|offset| &list[(start + offset) % list.len()])
            .find(|conn| conn.handle.is_active())
            .map(|conn| conn.handle.clone())
    }

    fn lease(&self, handle: ConnectionHandle) -> ConnectionHandle {
        handle.begin_lease();
        let leases = self.leases.fetch_add(1, Ordering::Relaxed) + 1;
        t_gauge!("strand_pool_leases").set(leases as f64);
        t_counter!("strand_pool_leases_total").increment(1);
        handle
    }
}

/// Spawn the background idle sweep at the pool's configured cadence.
pub fn spawn_sweeper<C: Connector>(pool: Arc<ConnectionPool<C>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(pool.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            pool.sweep_idle();
        }
    })
}

fn total_pooled(entries: &HashMap<String, Vec<PooledConn>>) -> usize {
    entries.values().map(Vec::len).sum()
}

/// Drop destroyed connections from membership. A connection can die
/// between sweeps (goaway, local destroy); every membership read purges so
/// the pool only ever reports live connections.
fn prune_destroyed(entries: &mut HashMap<String, Vec<PooledConn>>) {
    for list in entries.values_mut() {
        list.retain(|conn| !conn.handle.is_destroyed());
    }
    entries.retain(|_, list| !list.is_empty());
    t_gauge!("strand_pool_connections").set(total_pooled(entries) as f64);
}
