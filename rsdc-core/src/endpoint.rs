//! A single bootstrapped connection. The endpoint owns the in-flight map
//! keyed by opaque, demultiplexes responses onto pending results, and walks
//! the `disconnected → connecting → connected → (disconnecting |
//! disconnected)` lifecycle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::bootstrap::{bootstrap, BootstrapParams, ChannelContext};
use crate::client::{Connection, Connector};
use crate::compress::Compressor;
use crate::error::{Error, ErrorKind, Result};
use crate::events::{Event, EventBus, EventContext, EventKind};
use crate::protocol::Packet;

/// Opaques are unique across the process so a frame can never complete a
/// request it does not belong to, even across reconnects.
static NEXT_OPAQUE: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

struct Inner<C: Connection> {
    id: Uuid,
    addr: String,
    state: watch::Sender<EndpointState>,
    in_flight: Mutex<HashMap<u32, oneshot::Sender<Result<Packet>>>>,
    // Opaques cancelled by the dispatcher; a late reply for one of these is
    // silently discarded instead of counting as a protocol violation.
    cancelled: Mutex<HashSet<u32>>,
    conn: Mutex<Option<C>>,
    context: Mutex<Option<Arc<ChannelContext>>>,
    last_activity: Mutex<Instant>,
    bus: Arc<dyn EventBus>,
    core_id: Uuid,
}

impl<C: Connection> Inner<C> {
    fn set_state(&self, state: EndpointState) {
        self.state.send_replace(state);
    }

    fn emit(&self, kind: EventKind, elapsed: std::time::Duration) {
        let conn = self.conn.lock().unwrap().clone();
        self.bus.publish(Event {
            kind,
            context: EventContext {
                local_addr: conn.as_ref().and_then(Connection::local_addr),
                remote_addr: conn.as_ref().and_then(Connection::peer_addr),
                core_id: self.core_id,
                elapsed,
            },
        });
    }

    /// Fail every pending result and drop the connection handle. Runs on
    /// write errors, read-loop exit and close.
    fn fail_all(&self, kind: impl Fn() -> ErrorKind) {
        let pending: Vec<_> = {
            let mut in_flight = self.in_flight.lock().unwrap();
            in_flight.drain().collect()
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(Error::new(kind()).with_node(self.addr.clone())));
        }
        self.cancelled.lock().unwrap().clear();
    }
}

/// A completion handle for one dispatched request. Completes exactly once
/// with the response frame or an error; dropping it abandons the result.
#[derive(Debug)]
pub struct PendingResponse {
    opaque: u32,
    rx: oneshot::Receiver<Result<Packet>>,
}

impl PendingResponse {
    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    pub async fn recv(self) -> Result<Packet> {
        match self.rx.await {
            Ok(result) => result,
            // The endpoint dropped the sender without completing us.
            Err(_) => Err(Error::new(ErrorKind::ConnectionClosed)),
        }
    }
}

/// One connection to one (node, service) pair, shared by reference between
/// the pool that owns it and the dispatcher using it.
pub struct Endpoint<C: Connection, P: Compressor> {
    inner: Arc<Inner<C>>,
    compressor: P,
}

impl<C: Connection, P: Compressor> Clone for Endpoint<C, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            compressor: self.compressor.clone(),
        }
    }
}

impl<C: Connection, P: Compressor> Endpoint<C, P> {
    pub fn new<A: Into<String>>(
        addr: A,
        compressor: P,
        bus: Arc<dyn EventBus>,
        core_id: Uuid,
    ) -> Self {
        let (state, _) = watch::channel(EndpointState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                addr: addr.into(),
                state,
                in_flight: Mutex::new(HashMap::new()),
                cancelled: Mutex::new(HashSet::new()),
                conn: Mutex::new(None),
                context: Mutex::new(None),
                last_activity: Mutex::new(Instant::now()),
                bus,
                core_id,
            }),
            compressor,
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn state(&self) -> EndpointState {
        *self.inner.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<EndpointState> {
        self.inner.state.subscribe()
    }

    /// Whether the endpoint finished bootstrap and accepts dispatch.
    pub fn is_connected(&self) -> bool {
        self.state() == EndpointState::Connected
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.in_flight.lock().unwrap().len()
    }

    /// How long the endpoint has been without traffic. Only meaningful for
    /// shrink decisions when nothing is in flight.
    pub fn idle_for(&self) -> std::time::Duration {
        self.inner.last_activity.lock().unwrap().elapsed()
    }

    /// The channel state negotiated at bootstrap, present once connected.
    pub fn context(&self) -> Option<Arc<ChannelContext>> {
        self.inner.context.lock().unwrap().clone()
    }

    /// Dial and bootstrap. On success the endpoint publishes itself as
    /// dispatchable and spawns the demultiplexing read loop; on failure it
    /// returns to `Disconnected` with the transport closed.
    pub async fn connect<T: Connector<Conn = C>>(
        &self,
        connector: &T,
        params: &BootstrapParams,
    ) -> Result<()> {
        let started = Instant::now();
        let deadline = started + params.timeout;
        self.inner.set_state(EndpointState::Connecting);

        let result = tokio::time::timeout_at(deadline, connector.connect(&self.inner.addr))
            .await
            .unwrap_or_else(|_| {
                Err(Error::new(ErrorKind::UnambiguousTimeout).with_node(self.inner.addr.clone()))
            });
        let mut conn = match result {
            Ok(conn) => conn,
            Err(err) => {
                self.inner.set_state(EndpointState::Disconnected);
                return Err(err);
            }
        };

        match bootstrap(&mut conn, params, deadline).await {
            Ok(context) => {
                *self.inner.context.lock().unwrap() = Some(Arc::new(context));
                *self.inner.conn.lock().unwrap() = Some(conn.clone());
                *self.inner.last_activity.lock().unwrap() = Instant::now();
                self.inner.set_state(EndpointState::Connected);
                self.inner
                    .emit(EventKind::EndpointConnected, started.elapsed());
                tokio::spawn(read_loop(
                    self.inner.clone(),
                    conn,
                    self.compressor.clone(),
                ));
                Ok(())
            }
            Err(err) => {
                conn.shutdown().await;
                self.inner.set_state(EndpointState::Disconnected);
                Err(err)
            }
        }
    }

    /// Assign an opaque, register the pending result and write the frame.
    /// `compressible` marks values the compressor may touch; it only applies
    /// when the channel negotiated snappy. Once this returns the request
    /// counts as written; deadline enforcement stays with the dispatcher.
    pub async fn send(&self, mut packet: Packet, compressible: bool) -> Result<PendingResponse> {
        let mut conn = match &*self.inner.conn.lock().unwrap() {
            Some(conn) if self.is_connected() => conn.clone(),
            _ => return Err(Error::new(ErrorKind::ConnectionClosed).with_node(self.addr())),
        };

        let opaque = NEXT_OPAQUE.fetch_add(1, Ordering::Relaxed);
        packet.header.opaque = opaque;
        let snappy = self.context().map(|c| c.snappy_enabled()).unwrap_or(false);
        let packet = if compressible && snappy {
            self.compressor.compress(packet)?
        } else {
            packet
        };

        let (tx, rx) = oneshot::channel();
        self.inner.in_flight.lock().unwrap().insert(opaque, tx);
        *self.inner.last_activity.lock().unwrap() = Instant::now();

        if let Err(err) = conn.write_packet(packet).await {
            self.inner.in_flight.lock().unwrap().remove(&opaque);
            self.disconnect().await;
            return Err(err.with_node(self.addr()));
        }
        Ok(PendingResponse { opaque, rx })
    }

    /// Remove a timed-out or abandoned opaque. A late reply for it is
    /// dropped without counting as a protocol violation.
    pub fn cancel(&self, opaque: u32) {
        if self
            .inner
            .in_flight
            .lock()
            .unwrap()
            .remove(&opaque)
            .is_some()
        {
            self.inner.cancelled.lock().unwrap().insert(opaque);
        }
    }

    /// Tear the connection down, failing everything in flight.
    pub async fn disconnect(&self) {
        let conn = self.inner.conn.lock().unwrap().take();
        if let Some(mut conn) = conn {
            self.inner.set_state(EndpointState::Disconnecting);
            conn.shutdown().await;
        }
        self.inner.fail_all(|| ErrorKind::ConnectionClosed);
        let was_connected = self.state() != EndpointState::Disconnected;
        self.inner.set_state(EndpointState::Disconnected);
        if was_connected {
            self.inner
                .emit(EventKind::EndpointDisconnected, std::time::Duration::ZERO);
        }
    }
}

async fn read_loop<C: Connection, P: Compressor>(
    inner: Arc<Inner<C>>,
    mut conn: C,
    compressor: P,
) {
    loop {
        let packet = match conn.read_packet().await {
            Ok(packet) => packet,
            Err(_) => break,
        };
        let packet = match compressor.decompress(packet) {
            Ok(packet) => packet,
            Err(_) => {
                inner.emit(
                    EventKind::ProtocolViolation {
                        message: "response value failed to decompress".into(),
                    },
                    std::time::Duration::ZERO,
                );
                continue;
            }
        };

        let opaque = packet.header.opaque;
        let pending = inner.in_flight.lock().unwrap().remove(&opaque);
        *inner.last_activity.lock().unwrap() = Instant::now();
        match pending {
            Some(tx) => {
                let _ = tx.send(Ok(packet));
            }
            None => {
                // Late replies for cancelled requests are expected; anything
                // else is the server talking out of turn.
                if !inner.cancelled.lock().unwrap().remove(&opaque) {
                    inner.emit(
                        EventKind::ProtocolViolation {
                            message: format!("response for unknown opaque {}", opaque),
                        },
                        std::time::Duration::ZERO,
                    );
                }
            }
        }
    }

    // Connection lost (or deliberately shut down): nothing pending can
    // complete anymore.
    inner.conn.lock().unwrap().take();
    inner.fail_all(|| ErrorKind::ConnectionClosed);
    let was_connected = *inner.state.borrow() == EndpointState::Connected;
    inner.set_state(EndpointState::Disconnected);
    if was_connected {
        inner.emit(EventKind::EndpointDisconnected, std::time::Duration::ZERO);
    }
}
