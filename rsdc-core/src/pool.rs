//! A set of endpoints for one (node, service-type) pair. The pool grows on
//! saturation up to its maximum, shrinks idle endpoints back to its minimum,
//! and supervises reconnects so the minimum survives connection bounces.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use uuid::Uuid;

use crate::bootstrap::BootstrapParams;
use crate::client::Connector;
use crate::compress::Compressor;
use crate::endpoint::Endpoint;
use crate::events::EventBus;
use crate::retry::reconnect_delay;

/// How a pool picks among its dispatchable endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Rotate over endpoints with spare capacity. The default for services
    /// where requests are independent.
    RoundRobin,
    /// Always prefer the first endpoint with spare capacity, typical for the
    /// KV service where one connection per node is the norm.
    FirstAvailable,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min_endpoints: usize,
    pub max_endpoints: usize,
    /// An endpoint with nothing in flight for this long is closed, down to
    /// `min_endpoints`.
    pub idle_time: Duration,
    /// The per-connection in-flight cap; an endpoint at this cap counts as
    /// saturated.
    pub max_in_flight: usize,
    pub strategy: SelectionStrategy,
}

impl PoolConfig {
    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_endpoints: 1,
            max_endpoints: 4,
            idle_time: Duration::from_secs(60),
            max_in_flight: 16,
            strategy: SelectionStrategy::RoundRobin,
        }
    }
}

pub struct ServicePool<T: Connector, P: Compressor> {
    addr: String,
    config: PoolConfig,
    connector: T,
    params: BootstrapParams,
    compressor: P,
    bus: Arc<dyn EventBus>,
    core_id: Uuid,
    endpoints: Mutex<Vec<Endpoint<T::Conn, P>>>,
    connecting: AtomicUsize,
    round_robin: AtomicUsize,
    closed: AtomicBool,
}

impl<T: Connector, P: Compressor> ServicePool<T, P> {
    pub fn new(
        addr: String,
        config: PoolConfig,
        connector: T,
        params: BootstrapParams,
        compressor: P,
        bus: Arc<dyn EventBus>,
        core_id: Uuid,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            addr,
            config,
            connector,
            params,
            compressor,
            bus,
            core_id,
            endpoints: Mutex::new(vec![]),
            connecting: AtomicUsize::new(0),
            round_robin: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(supervise(Arc::downgrade(&pool)));
        pool
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Pick a dispatchable endpoint with spare capacity. Returns `None` when
    /// every endpoint is saturated or still connecting; if the pool may still
    /// grow, growth is kicked off before returning so a retrying caller finds
    /// capacity soon.
    pub fn endpoint(self: &Arc<Self>) -> Option<Endpoint<T::Conn, P>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let picked = {
            let mut endpoints = self.endpoints.lock().unwrap();
            endpoints.retain(|endpoint| endpoint.is_connected());
            let available: Vec<&Endpoint<T::Conn, P>> = endpoints
                .iter()
                .filter(|endpoint| endpoint.in_flight_len() < self.config.max_in_flight)
                .collect();
            match (available.is_empty(), self.config.strategy) {
                (true, _) => None,
                (false, SelectionStrategy::FirstAvailable) => Some(available[0].clone()),
                (false, SelectionStrategy::RoundRobin) => {
                    let cursor = self.round_robin.fetch_add(1, Ordering::Relaxed);
                    Some(available[cursor % available.len()].clone())
                }
            }
        };
        if picked.is_none() {
            self.grow();
        }
        picked
    }

    fn total(&self) -> usize {
        self.endpoints.lock().unwrap().len() + self.connecting.load(Ordering::SeqCst)
    }

    /// Spawn one connection attempt if the pool is below its maximum.
    fn grow(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) || self.total() >= self.config.max_endpoints {
            return;
        }
        self.connecting.fetch_add(1, Ordering::SeqCst);
        let pool = self.clone();
        tokio::spawn(async move {
            let endpoint = Endpoint::new(
                pool.addr.clone(),
                pool.compressor.clone(),
                pool.bus.clone(),
                pool.core_id,
            );
            let connected = endpoint.connect(&pool.connector, &pool.params).await;
            pool.connecting.fetch_sub(1, Ordering::SeqCst);
            match connected {
                Ok(()) if !pool.closed.load(Ordering::SeqCst) => {
                    pool.endpoints.lock().unwrap().push(endpoint);
                }
                Ok(()) => endpoint.disconnect().await,
                Err(err) => {
                    log::debug!("endpoint connect to {} failed: {}", pool.addr, err);
                }
            }
        });
    }

    /// One pass of the supervisor: drop dead endpoints, close idle ones down
    /// to the minimum, and report whether the pool is below its minimum.
    fn maintain(&self) -> bool {
        let mut idle = vec![];
        {
            let mut endpoints = self.endpoints.lock().unwrap();
            endpoints.retain(|endpoint| endpoint.is_connected());
            let mut len = endpoints.len();
            let mut index = 0;
            while index < endpoints.len() {
                let endpoint = &endpoints[index];
                if len > self.config.min_endpoints
                    && endpoint.in_flight_len() == 0
                    && endpoint.idle_for() >= self.config.idle_time
                {
                    idle.push(endpoints.swap_remove(index));
                    len -= 1;
                } else {
                    index += 1;
                }
            }
        }
        for endpoint in idle {
            tokio::spawn(async move { endpoint.disconnect().await });
        }
        self.total() < self.config.min_endpoints
    }

    pub fn in_flight_total(&self) -> usize {
        self.endpoints
            .lock()
            .unwrap()
            .iter()
            .map(Endpoint::in_flight_len)
            .sum()
    }

    /// Disconnect everything and refuse further dispatch. Non-reversible.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let endpoints: Vec<_> = self.endpoints.lock().unwrap().drain(..).collect();
        for endpoint in endpoints {
            endpoint.disconnect().await;
        }
    }
}

/// Keeps the pool at or above its minimum with reconnect backoff, and
/// applies idle shrink. Exits when the pool is dropped or closed.
async fn supervise<T: Connector, P: Compressor>(pool: Weak<ServicePool<T, P>>) {
    let backoff = AtomicU32::new(0);
    loop {
        let below_min = match pool.upgrade() {
            Some(pool) => {
                if pool.closed.load(Ordering::SeqCst) {
                    return;
                }
                let below_min = pool.maintain();
                if below_min {
                    pool.grow();
                }
                below_min
            }
            None => return,
        };
        // Back off while the node stays unreachable so reconnect attempts do
        // not hammer it; settle to a slow patrol once healthy.
        let delay = if below_min {
            reconnect_delay(backoff.fetch_add(1, Ordering::Relaxed) + 1)
        } else {
            backoff.store(0, Ordering::Relaxed);
            Duration::from_secs(1)
        };
        tokio::time::sleep(delay).await;
    }
}
