//! The core dispatcher. Typed requests come in, get placed through the
//! locator against the latest topology, ride an endpoint from the right
//! service pool, and come back as typed responses; retry pacing and the
//! request deadline live here and nowhere else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::bootstrap::BootstrapParams;
use crate::client::{Connector, CoreConfig};
use crate::compress::Compressor;
use crate::config::{BucketConfig, ConfigProvider, ConfigSnapshot, ServiceType};
use crate::error::{kind_for_status, Error, ErrorKind, Result};
use crate::events::{Event, EventBus, EventContext, EventKind};
use crate::locator::Locator;
use crate::pool::{PoolConfig, SelectionStrategy, ServicePool};
use crate::protocol::{Status, SubdocCommand};
use crate::request::{KvCommand, KvRequest, KvResponse};
use crate::retry::{BestEffortRetry, RetryStrategy};

struct CoreInner<T: Connector, P: Compressor> {
    config: CoreConfig,
    connector: T,
    compressor: P,
    bus: Arc<dyn EventBus>,
    core_id: Uuid,
    provider: ConfigProvider,
    config_rx: watch::Receiver<ConfigSnapshot>,
    locator: Locator,
    pools: Mutex<HashMap<(String, ServiceType), Arc<ServicePool<T, P>>>>,
    default_retry: Arc<dyn RetryStrategy>,
    closed: AtomicBool,
}

/// The core handle. Cheap to clone; all clones share the same pools,
/// topology and shutdown state.
pub struct Core<T: Connector, P: Compressor> {
    inner: Arc<CoreInner<T, P>>,
}

impl<T: Connector, P: Compressor> Clone for Core<T, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn host_of(addr: &str) -> &str {
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}

impl<T: Connector, P: Compressor> Core<T, P> {
    pub fn new(config: CoreConfig, connector: T, compressor: P, bus: Arc<dyn EventBus>) -> Self {
        let core_id = Uuid::new_v4();
        let provider = ConfigProvider::new(bus.clone(), core_id);
        let config_rx = provider.subscribe();
        Self {
            inner: Arc::new(CoreInner {
                config,
                connector,
                compressor,
                bus,
                core_id,
                provider,
                config_rx,
                locator: Locator::new(),
                pools: Mutex::new(HashMap::new()),
                default_retry: Arc::new(BestEffortRetry::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn core_id(&self) -> Uuid {
        self.inner.core_id
    }

    /// The config ingestion seam, also fed by the HTTP streaming task.
    pub fn config_provider(&self) -> &ConfigProvider {
        &self.inner.provider
    }

    pub fn config_watch(&self) -> watch::Receiver<ConfigSnapshot> {
        self.inner.provider.subscribe()
    }

    pub fn current_config(&self) -> Option<Arc<BucketConfig>> {
        self.inner.config_rx.borrow().clone()
    }

    fn bootstrap_params(&self, service: ServiceType) -> BootstrapParams {
        let config = &self.inner.config;
        BootstrapParams {
            features: config.features.clone(),
            connection_name: config.connection_name.clone(),
            credentials: config.credentials.clone(),
            // Only data channels select a bucket.
            bucket: match service {
                ServiceType::Kv => config.bucket.clone(),
                _ => None,
            },
            error_map_version: config.error_map_version,
            tls: config.tls,
            timeout: config.bootstrap_timeout,
            bus: self.inner.bus.clone(),
            core_id: self.inner.core_id,
        }
    }

    fn pool_for(&self, addr: &str, service: ServiceType) -> Arc<ServicePool<T, P>> {
        let key = (addr.to_string(), service);
        let mut pools = self.inner.pools.lock().unwrap();
        pools
            .entry(key)
            .or_insert_with(|| {
                let strategy = match service {
                    ServiceType::Kv => SelectionStrategy::FirstAvailable,
                    _ => SelectionStrategy::RoundRobin,
                };
                ServicePool::new(
                    addr.to_string(),
                    PoolConfig {
                        strategy,
                        ..self.inner.config.pool
                    },
                    self.inner.connector.clone(),
                    self.bootstrap_params(service),
                    self.inner.compressor.clone(),
                    self.inner.bus.clone(),
                    self.inner.core_id,
                )
            })
            .clone()
    }

    fn emit(&self, kind: EventKind, elapsed: Duration) {
        self.inner.bus.publish(Event {
            kind,
            context: EventContext {
                local_addr: None,
                remote_addr: None,
                core_id: self.inner.core_id,
                elapsed,
            },
        });
    }

    /// Run one typed request to completion under its deadline.
    pub async fn execute(&self, request: KvRequest) -> Result<KvResponse> {
        let inner = &self.inner;
        let service = ServiceType::Kv;
        let started = Instant::now();
        let deadline =
            started + request.timeout.unwrap_or(inner.config.request_timeout);
        let retry = request
            .retry
            .clone()
            .unwrap_or_else(|| inner.default_retry.clone());

        let mut attempt: u32 = 0;
        let mut collection_refreshed = false;

        loop {
            if inner.closed.load(Ordering::SeqCst) {
                return Err(Error::new(ErrorKind::Shutdown).with_service(service));
            }
            if Instant::now() >= deadline {
                // Every pass through here follows a definitive non-answer
                // (stale topology, saturation), so the request never ran.
                self.emit(EventKind::RequestTimeout { service }, started.elapsed());
                return Err(Error::new(ErrorKind::UnambiguousTimeout)
                    .with_service(service)
                    .with_elapsed(started.elapsed()));
            }
            attempt += 1;

            let config = self.ensure_config(deadline).await?;
            let placement = inner
                .locator
                .locate(&config, service, request.command.key(), inner.config.tls)
                .map_err(|err| err.with_elapsed(started.elapsed()))?;
            let addr = config
                .nodes
                .get(placement.node)
                .and_then(|node| node.service_address(service, inner.config.tls))
                .ok_or_else(|| {
                    Error::new(ErrorKind::ServiceNotAvailable).with_service(service)
                })?;
            let pool = self.pool_for(&addr, service);

            let endpoint = match pool.endpoint() {
                Some(endpoint) => endpoint,
                None => {
                    // Saturated or still connecting: pace and come back.
                    self.emit(
                        EventKind::RequestRetried { service, attempt },
                        started.elapsed(),
                    );
                    self.pause(&retry, attempt, deadline, started, service, || {
                        Error::new(ErrorKind::TemporaryFailure).with_service(service)
                    })
                    .await?;
                    continue;
                }
            };
            let context = match endpoint.context() {
                Some(context) => context,
                // Lost a race with a disconnect; try another endpoint.
                None => continue,
            };

            let packet = request
                .command
                .encode(&context, request.collection_id, placement.vbucket);
            let pending = match endpoint.send(packet, request.command.compressible()).await {
                Ok(pending) => pending,
                Err(err) => {
                    // Never written; always safe to retry within deadline.
                    self.pause(&retry, attempt, deadline, started, service, move || err)
                        .await?;
                    continue;
                }
            };
            let opaque = pending.opaque();

            let frame = match tokio::time::timeout_at(deadline, pending.recv()).await {
                Err(_) => {
                    // Deadline hit with the request written: the server may
                    // still execute it. Drop the opaque so a late reply is
                    // discarded quietly.
                    endpoint.cancel(opaque);
                    self.emit(EventKind::RequestTimeout { service }, started.elapsed());
                    return Err(Error::new(ErrorKind::AmbiguousTimeout)
                        .with_service(service)
                        .with_node(addr)
                        .with_elapsed(started.elapsed()));
                }
                Ok(Err(err)) => {
                    if inner.closed.load(Ordering::SeqCst) {
                        return Err(Error::new(ErrorKind::RequestCanceled)
                            .with_service(service)
                            .with_node(addr));
                    }
                    if request.command.is_idempotent() {
                        self.pause(&retry, attempt, deadline, started, service, move || err)
                            .await?;
                        continue;
                    }
                    return Err(err.with_service(service).with_elapsed(started.elapsed()));
                }
                Ok(Ok(frame)) => frame,
            };

            let response =
                KvResponse::decode(frame, &request.command, &context, placement.vbucket)?;
            match response.status {
                Status::Success => return Ok(response),
                Status::NotMyVbucket => {
                    // The response may piggyback the newer config; fall back
                    // to an out-of-band fetch when it does not.
                    let installed = !response.value.is_empty()
                        && self
                            .inner
                            .provider
                            .ingest(&response.value, host_of(&addr))
                            .unwrap_or(false);
                    if !installed {
                        let _ = self.refresh_config(deadline).await;
                    }
                    self.emit(
                        EventKind::RequestRetried { service, attempt },
                        started.elapsed(),
                    );
                    continue;
                }
                Status::UnknownCollection if !collection_refreshed => {
                    collection_refreshed = true;
                    let _ = self.refresh_config(deadline).await;
                    self.emit(
                        EventKind::RequestRetried { service, attempt },
                        started.elapsed(),
                    );
                    continue;
                }
                status if status.is_subdoc() => {
                    // Command-level errors are the caller's bug or data
                    // shape; never retried.
                    return Err(Error::new(kind_for_status(status, request.command.cas_op()))
                        .with_service(service)
                        .with_node(addr)
                        .with_status(status)
                        .with_elapsed(started.elapsed()));
                }
                status if context.retriable(status) => {
                    self.emit(
                        EventKind::RequestRetried { service, attempt },
                        started.elapsed(),
                    );
                    let node = addr.clone();
                    self.pause(&retry, attempt, deadline, started, service, move || {
                        Error::new(kind_for_status(status, false))
                            .with_node(node)
                            .with_status(status)
                    })
                    .await?;
                    continue;
                }
                status => {
                    return Err(Error::new(kind_for_status(status, request.command.cas_op()))
                        .with_service(service)
                        .with_node(addr)
                        .with_status(status)
                        .with_elapsed(started.elapsed()));
                }
            }
        }
    }

    /// Sleep out the retry backoff, or fail when the strategy gives up or
    /// the deadline would pass first. Requests that never made it onto the
    /// wire time out unambiguously.
    async fn pause(
        &self,
        retry: &Arc<dyn RetryStrategy>,
        attempt: u32,
        deadline: Instant,
        started: Instant,
        service: ServiceType,
        source: impl FnOnce() -> Error,
    ) -> Result<()> {
        let delay = match retry.delay(attempt) {
            Some(delay) => delay,
            None => return Err(source().with_service(service).with_elapsed(started.elapsed())),
        };
        if Instant::now() + delay >= deadline {
            self.emit(EventKind::RequestTimeout { service }, started.elapsed());
            return Err(Error::new(ErrorKind::UnambiguousTimeout)
                .with_service(service)
                .with_elapsed(started.elapsed()));
        }
        tokio::time::sleep(delay).await;
        Ok(())
    }

    /// The latest topology, fetching the first config from the seed nodes if
    /// none has been installed yet.
    async fn ensure_config(&self, deadline: Instant) -> Result<Arc<BucketConfig>> {
        if let Some(config) = self.current_config() {
            return Ok(config);
        }
        let seeds = self.inner.config.seeds.clone();
        if seeds.is_empty() {
            return Err(Error::new(ErrorKind::ServiceNotAvailable));
        }
        let mut last_err = Error::new(ErrorKind::ServiceNotAvailable);
        loop {
            for seed in &seeds {
                match self.fetch_config_from(seed, deadline).await {
                    Ok(()) => {
                        if let Some(config) = self.current_config() {
                            return Ok(config);
                        }
                    }
                    Err(err) => last_err = err,
                }
            }
            if Instant::now() >= deadline {
                return Err(last_err);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Fetch a config out of band, preferring the current topology's data
    /// nodes over the seed list.
    pub async fn refresh_config(&self, deadline: Instant) -> Result<()> {
        let mut addrs: Vec<String> = match self.current_config() {
            Some(config) => config
                .nodes_for_service(ServiceType::Kv, self.inner.config.tls)
                .into_iter()
                .filter_map(|i| {
                    config.nodes[i].service_address(ServiceType::Kv, self.inner.config.tls)
                })
                .collect(),
            None => vec![],
        };
        if addrs.is_empty() {
            addrs = self.inner.config.seeds.clone();
        }
        let mut last_err = Error::new(ErrorKind::ServiceNotAvailable);
        for addr in addrs {
            match self.fetch_config_from(&addr, deadline).await {
                Ok(()) => return Ok(()),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    async fn fetch_config_from(&self, addr: &str, deadline: Instant) -> Result<()> {
        let pool = self.pool_for(addr, ServiceType::Kv);
        let endpoint = loop {
            match pool.endpoint() {
                Some(endpoint) => break endpoint,
                None => {
                    if Instant::now() + Duration::from_millis(10) >= deadline {
                        return Err(Error::new(ErrorKind::UnambiguousTimeout).with_node(addr));
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        };
        let context = endpoint
            .context()
            .ok_or_else(|| Error::new(ErrorKind::ConnectionClosed).with_node(addr))?;
        let packet = KvCommand::GetConfig.encode(&context, 0, None);
        let pending = endpoint.send(packet, false).await?;
        let opaque = pending.opaque();
        let frame = match tokio::time::timeout_at(deadline, pending.recv()).await {
            Ok(frame) => frame?,
            Err(_) => {
                endpoint.cancel(opaque);
                return Err(Error::new(ErrorKind::AmbiguousTimeout).with_node(addr));
            }
        };
        match frame.error_for_status() {
            Ok(()) => {
                self.inner.provider.ingest(&frame.value, host_of(addr))?;
                Ok(())
            }
            Err(status) => Err(Error::new(ErrorKind::Status(status))
                .with_node(addr)
                .with_status(status)),
        }
    }

    /// Follow the HTTP streaming config endpoint in the background, feeding
    /// every document into the provider. The task walks the manager nodes of
    /// whatever topology is current and reattaches with backoff when the
    /// stream drops; it exits on shutdown.
    pub fn spawn_config_stream(&self) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let strong = match inner.upgrade() {
                    Some(strong) => strong,
                    None => return,
                };
                if strong.closed.load(Ordering::SeqCst) {
                    return;
                }

                let bucket = strong.config.bucket.clone();
                let config = strong.config_rx.borrow().clone();
                let target = match (&bucket, &config) {
                    (Some(bucket), Some(config)) => config
                        .nodes_for_service(ServiceType::Manager, strong.config.tls)
                        .first()
                        .map(|i| (bucket.clone(), config.nodes[*i].clone())),
                    _ => None,
                };

                if let Some((bucket, node)) = target {
                    let http = crate::http::HttpClient::new(
                        strong.config.credentials.clone(),
                        strong.config.tls,
                    );
                    attempt += 1;
                    let result = http.stream_configs(&node, &bucket, &strong.provider).await;
                    if result.is_ok() {
                        attempt = 0;
                    }
                } else {
                    attempt += 1;
                }
                drop(strong);
                tokio::time::sleep(crate::retry::reconnect_delay(attempt.max(1))).await;
            }
        });
    }

    /// Drain and stop. New submissions fail immediately; in-flight requests
    /// get the grace period to complete before endpoints are force-closed.
    /// Non-reversible.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let deadline = Instant::now() + self.inner.config.shutdown_grace;
        loop {
            let in_flight: usize = {
                let pools = self.inner.pools.lock().unwrap();
                pools.values().map(|pool| pool.in_flight_total()).sum()
            };
            if in_flight == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let pools: Vec<_> = {
            let mut pools = self.inner.pools.lock().unwrap();
            pools.drain().map(|(_, pool)| pool).collect()
        };
        for pool in pools {
            pool.close().await;
        }
    }

    // Convenience constructors for the common operations.

    pub async fn get<K: Into<Vec<u8>>>(&self, key: K) -> Result<KvResponse> {
        self.execute(KvRequest::new(KvCommand::Get { key: key.into() }))
            .await
    }

    pub async fn get_and_lock<K: Into<Vec<u8>>>(
        &self,
        key: K,
        lock_time: u32,
    ) -> Result<KvResponse> {
        self.execute(KvRequest::new(KvCommand::GetAndLock {
            key: key.into(),
            lock_time,
        }))
        .await
    }

    pub async fn get_and_touch<K: Into<Vec<u8>>>(&self, key: K, expiry: u32) -> Result<KvResponse> {
        self.execute(KvRequest::new(KvCommand::GetAndTouch {
            key: key.into(),
            expiry,
        }))
        .await
    }

    pub async fn unlock<K: Into<Vec<u8>>>(&self, key: K, cas: u64) -> Result<KvResponse> {
        self.execute(KvRequest::new(KvCommand::Unlock {
            key: key.into(),
            cas,
        }))
        .await
    }

    pub async fn touch<K: Into<Vec<u8>>>(&self, key: K, expiry: u32) -> Result<KvResponse> {
        self.execute(KvRequest::new(KvCommand::Touch {
            key: key.into(),
            expiry,
        }))
        .await
    }

    pub async fn upsert<K: Into<Vec<u8>>, V: Into<Vec<u8>>>(
        &self,
        key: K,
        value: V,
        flags: u32,
        expiry: u32,
    ) -> Result<KvResponse> {
        self.execute(KvRequest::new(KvCommand::Upsert {
            key: key.into(),
            value: value.into(),
            flags,
            expiry,
            cas: 0,
        }))
        .await
    }

    pub async fn insert<K: Into<Vec<u8>>, V: Into<Vec<u8>>>(
        &self,
        key: K,
        value: V,
        flags: u32,
        expiry: u32,
    ) -> Result<KvResponse> {
        self.execute(KvRequest::new(KvCommand::Insert {
            key: key.into(),
            value: value.into(),
            flags,
            expiry,
        }))
        .await
    }

    pub async fn replace<K: Into<Vec<u8>>, V: Into<Vec<u8>>>(
        &self,
        key: K,
        value: V,
        flags: u32,
        expiry: u32,
        cas: u64,
    ) -> Result<KvResponse> {
        self.execute(KvRequest::new(KvCommand::Replace {
            key: key.into(),
            value: value.into(),
            flags,
            expiry,
            cas,
        }))
        .await
    }

    pub async fn remove<K: Into<Vec<u8>>>(&self, key: K, cas: u64) -> Result<KvResponse> {
        self.execute(KvRequest::new(KvCommand::Remove {
            key: key.into(),
            cas,
        }))
        .await
    }

    pub async fn append<K: Into<Vec<u8>>, V: Into<Vec<u8>>>(
        &self,
        key: K,
        value: V,
    ) -> Result<KvResponse> {
        self.execute(KvRequest::new(KvCommand::Append {
            key: key.into(),
            value: value.into(),
            cas: 0,
        }))
        .await
    }

    pub async fn prepend<K: Into<Vec<u8>>, V: Into<Vec<u8>>>(
        &self,
        key: K,
        value: V,
    ) -> Result<KvResponse> {
        self.execute(KvRequest::new(KvCommand::Prepend {
            key: key.into(),
            value: value.into(),
            cas: 0,
        }))
        .await
    }

    pub async fn increment<K: Into<Vec<u8>>>(
        &self,
        key: K,
        delta: u64,
        initial: u64,
        expiry: u32,
    ) -> Result<KvResponse> {
        self.execute(KvRequest::new(KvCommand::Increment {
            key: key.into(),
            delta,
            initial,
            expiry,
        }))
        .await
    }

    pub async fn decrement<K: Into<Vec<u8>>>(
        &self,
        key: K,
        delta: u64,
        initial: u64,
        expiry: u32,
    ) -> Result<KvResponse> {
        self.execute(KvRequest::new(KvCommand::Decrement {
            key: key.into(),
            delta,
            initial,
            expiry,
        }))
        .await
    }

    pub async fn lookup_in<K: Into<Vec<u8>>>(
        &self,
        key: K,
        commands: Vec<SubdocCommand>,
    ) -> Result<KvResponse> {
        self.execute(KvRequest::new(KvCommand::LookupIn {
            key: key.into(),
            commands,
            doc_flags: 0,
        }))
        .await
    }

    pub async fn mutate_in<K: Into<Vec<u8>>>(
        &self,
        key: K,
        commands: Vec<SubdocCommand>,
        expiry: u32,
        cas: u64,
    ) -> Result<KvResponse> {
        self.execute(KvRequest::new(KvCommand::MutateIn {
            key: key.into(),
            commands,
            doc_flags: 0,
            expiry,
            cas,
        }))
        .await
    }

    pub async fn get_collection_id<S: Into<String>>(&self, path: S) -> Result<KvResponse> {
        self.execute(KvRequest::new(KvCommand::GetCollectionId {
            path: path.into(),
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use super::*;
    use crate::compress::NoCompressor;
    use crate::connstr::StaticCredentials;
    use crate::error::ErrorKind;
    use crate::events::CollectingEventBus;
    use crate::protocol::{SubdocCommand, SubdocOpcode};
    use crate::request::MutationToken;
    use crate::testutil::{
        bootstrap_responder, response, single_node_config, two_node_config, MockConnector,
        Responder,
    };

    const NODE1: &str = "10.0.0.1:11210";
    const NODE2: &str = "10.0.0.2:11210";

    fn test_core(
        connector: MockConnector,
        pool: PoolConfig,
        bus: CollectingEventBus,
    ) -> Core<MockConnector, NoCompressor> {
        let config = CoreConfig {
            seeds: vec![NODE1.to_string()],
            bucket: Some("default".into()),
            credentials: Arc::new(StaticCredentials::new("", "")),
            request_timeout: Duration::from_secs(5),
            bootstrap_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_millis(200),
            pool,
            ..CoreConfig::default()
        };
        Core::new(config, connector, NoCompressor, Arc::new(bus))
    }

    fn upsert_command() -> KvCommand {
        KvCommand::Upsert {
            key: b"k".to_vec(),
            value: br#"{"a":1}"#.to_vec(),
            flags: 0x02000006,
            expiry: 0,
            cas: 0,
        }
    }

    // Scenario: an upsert round trip carrying a cas and a mutation token.
    #[test]
    fn test_upsert_round_trip() {
        tokio_test::block_on(async {
            let responder = bootstrap_responder(vec![0x04], |_, request| {
                match request.header.opcode {
                    0xb5 => vec![response(
                        0xb5,
                        Status::Success,
                        vec![],
                        single_node_config(1, "10.0.0.1", 11210),
                    )],
                    0x01 => {
                        let extras = [7_u64.to_be_bytes(), 11_u64.to_be_bytes()].concat();
                        let mut reply = response(0x01, Status::Success, extras, vec![]);
                        reply.header.cas = 42;
                        vec![reply]
                    }
                    _ => vec![],
                }
            });
            let core = test_core(
                MockConnector::new(responder),
                PoolConfig::default(),
                CollectingEventBus::new(),
            );

            let result = core
                .execute(KvRequest::new(upsert_command()))
                .await
                .unwrap();
            assert_eq!(Status::Success, result.status);
            assert_eq!(42, result.cas);
            let token = result.mutation_token.unwrap();
            assert_eq!(
                MutationToken {
                    bucket: "default".into(),
                    partition: token.partition,
                    partition_uuid: 7,
                    seqno: 11,
                },
                token
            );
        });
    }

    // Scenario: NOT_MY_VBUCKET piggybacks a newer config; the dispatcher
    // installs it, retargets and succeeds against the new owner.
    #[test]
    fn test_nmvb_refresh_and_retarget() {
        tokio_test::block_on(async {
            let responder = bootstrap_responder(vec![], |addr, request| {
                match (addr, request.header.opcode) {
                    (NODE1, 0xb5) => vec![response(
                        0xb5,
                        Status::Success,
                        vec![],
                        two_node_config(1, 0),
                    )],
                    (NODE1, 0x01) => vec![response(
                        0x01,
                        Status::NotMyVbucket,
                        vec![],
                        two_node_config(2, 1),
                    )],
                    (NODE2, 0x01) => {
                        let mut reply = response(0x01, Status::Success, vec![], vec![]);
                        reply.header.cas = 43;
                        vec![reply]
                    }
                    _ => vec![],
                }
            });
            let connector = MockConnector::new(responder);
            let bus = CollectingEventBus::new();
            let core = test_core(connector.clone(), PoolConfig::default(), bus.clone());

            let result = core
                .execute(KvRequest::new(upsert_command()))
                .await
                .unwrap();
            assert_eq!(43, result.cas);

            // The piggybacked revision replaced the topology.
            assert_eq!(2, core.current_config().unwrap().rev);
            assert!(!connector.connections_to(NODE2).is_empty());
            assert!(bus
                .kinds()
                .iter()
                .any(|kind| matches!(kind, EventKind::RequestRetried { .. })));
        });
    }

    // Scenario: a three-command mutate where the middle path fails reports
    // success at the frame level with the per-command vector exposed.
    #[test]
    fn test_subdoc_partial_success() {
        tokio_test::block_on(async {
            let responder = bootstrap_responder(vec![], |_, request| {
                match request.header.opcode {
                    0xb5 => vec![response(
                        0xb5,
                        Status::Success,
                        vec![],
                        single_node_config(1, "10.0.0.1", 11210),
                    )],
                    0xd1 => {
                        let mut value = vec![];
                        for status in [0x0000_u16, 0x00c0, 0x0000] {
                            value.extend_from_slice(&status.to_be_bytes());
                            value.extend_from_slice(&0_u32.to_be_bytes());
                        }
                        vec![response(
                            0xd1,
                            Status::SubdocMultiPathFailure,
                            vec![],
                            value,
                        )]
                    }
                    _ => vec![],
                }
            });
            let core = test_core(
                MockConnector::new(responder),
                PoolConfig::default(),
                CollectingEventBus::new(),
            );

            let commands = vec![
                SubdocCommand::new(SubdocOpcode::DictUpsert, "/a").with_fragment(&b"1"[..]),
                SubdocCommand::new(SubdocOpcode::DictUpsert, "/x/y").with_fragment(&b"2"[..]),
                SubdocCommand::new(SubdocOpcode::DictUpsert, "/b").with_fragment(&b"3"[..]),
            ];
            let result = core.mutate_in(&b"doc"[..], commands, 0, 0).await.unwrap();
            assert_eq!(Status::Success, result.status);
            assert_eq!(
                vec![
                    Status::Success,
                    Status::SubdocPathNotFound,
                    Status::Success
                ],
                result
                    .fields
                    .iter()
                    .map(|field| field.status)
                    .collect::<Vec<_>>()
            );
        });
    }

    // A single failing sub-document command surfaces as its own error.
    #[test]
    fn test_subdoc_single_failure_surfaces_error() {
        tokio_test::block_on(async {
            let responder = bootstrap_responder(vec![], |_, request| {
                match request.header.opcode {
                    0xb5 => vec![response(
                        0xb5,
                        Status::Success,
                        vec![],
                        single_node_config(1, "10.0.0.1", 11210),
                    )],
                    0xd1 => {
                        let mut value = 0x00c0_u16.to_be_bytes().to_vec();
                        value.extend_from_slice(&0_u32.to_be_bytes());
                        vec![response(
                            0xd1,
                            Status::SubdocMultiPathFailure,
                            vec![],
                            value,
                        )]
                    }
                    _ => vec![],
                }
            });
            let core = test_core(
                MockConnector::new(responder),
                PoolConfig::default(),
                CollectingEventBus::new(),
            );

            let commands =
                vec![SubdocCommand::new(SubdocOpcode::DictUpsert, "/x/y").with_fragment(&b"2"[..])];
            let err = core
                .mutate_in(&b"doc"[..], commands, 0, 0)
                .await
                .unwrap_err();
            assert!(matches!(err.kind, ErrorKind::SubdocPathNotFound));
            assert_eq!(Some(Status::SubdocPathNotFound), err.context.last_status);
        });
    }

    // Scenario: both endpoints saturated at max; a short-deadline submission
    // times out unambiguously, a patient one completes once capacity frees.
    #[test]
    fn test_pool_saturation_backpressure() {
        tokio_test::block_on(async {
            let hang = Arc::new(AtomicBool::new(true));
            let responder = {
                let hang = hang.clone();
                bootstrap_responder(vec![], move |_, request| match request.header.opcode {
                    0xb5 => vec![response(
                        0xb5,
                        Status::Success,
                        vec![],
                        single_node_config(1, "10.0.0.1", 11210),
                    )],
                    0x00 => {
                        if hang.load(Ordering::SeqCst) {
                            vec![]
                        } else {
                            vec![response(0x00, Status::Success, vec![], b"v".to_vec())]
                        }
                    }
                    _ => vec![],
                })
            };
            let connector = MockConnector::new(responder);
            let core = test_core(
                connector.clone(),
                PoolConfig {
                    min_endpoints: 1,
                    max_endpoints: 2,
                    max_in_flight: 1,
                    idle_time: Duration::from_secs(60),
                    strategy: SelectionStrategy::FirstAvailable,
                },
                CollectingEventBus::new(),
            );

            // Two hanging reads saturate both endpoints.
            let slow_a = tokio::spawn({
                let core = core.clone();
                async move { core.get(&b"a"[..]).await }
            });
            let slow_b = tokio::spawn({
                let core = core.clone();
                async move { core.get(&b"b"[..]).await }
            });
            for _ in 0..200 {
                let pools_busy = connector
                    .connections_to(NODE1)
                    .iter()
                    .flat_map(|conn| conn.requests())
                    .filter(|req| req.header.opcode == 0x00)
                    .count()
                    == 2;
                if pools_busy {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            // A short-deadline request cannot find capacity in time.
            let err = core
                .execute(
                    KvRequest::new(KvCommand::Get { key: b"c".to_vec() })
                        .with_timeout(Duration::from_millis(200)),
                )
                .await
                .unwrap_err();
            assert!(matches!(err.kind, ErrorKind::UnambiguousTimeout));

            // Release the hanging requests; the saturated endpoints free up
            // and a patient request completes.
            hang.store(false, Ordering::SeqCst);
            for conn in connector.connections_to(NODE1) {
                for request in conn.requests() {
                    if request.header.opcode == 0x00 {
                        let mut reply =
                            response(0x00, Status::Success, vec![], b"v".to_vec());
                        reply.header.opaque = request.header.opaque;
                        conn.push_response(reply);
                    }
                }
            }
            assert!(slow_a.await.unwrap().is_ok());
            assert!(slow_b.await.unwrap().is_ok());

            let result = core.get(&b"d"[..]).await.unwrap();
            assert_eq!(b"v".to_vec(), result.value);
        });
    }

    #[test]
    fn test_document_not_found_mapping() {
        tokio_test::block_on(async {
            let responder = bootstrap_responder(vec![], |_, request| {
                match request.header.opcode {
                    0xb5 => vec![response(
                        0xb5,
                        Status::Success,
                        vec![],
                        single_node_config(1, "10.0.0.1", 11210),
                    )],
                    0x00 => vec![response(0x00, Status::NotFound, vec![], vec![])],
                    _ => vec![],
                }
            });
            let core = test_core(
                MockConnector::new(responder),
                PoolConfig::default(),
                CollectingEventBus::new(),
            );

            let err = core.get(&b"missing"[..]).await.unwrap_err();
            assert!(matches!(err.kind, ErrorKind::DocumentNotFound));
            assert_eq!(Some(Status::NotFound), err.context.last_status);
            assert_eq!(Some(ServiceType::Kv), err.context.service);
            assert!(err.context.node.is_some());
        });
    }

    // A temporary failure backs off and retries within the deadline.
    #[test]
    fn test_retriable_status_retries() {
        tokio_test::block_on(async {
            let attempts = Arc::new(AtomicUsize::new(0));
            let responder = {
                let attempts = attempts.clone();
                bootstrap_responder(vec![], move |_, request| match request.header.opcode {
                    0xb5 => vec![response(
                        0xb5,
                        Status::Success,
                        vec![],
                        single_node_config(1, "10.0.0.1", 11210),
                    )],
                    0x01 => {
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            vec![response(
                                0x01,
                                Status::TemporaryFailure,
                                vec![],
                                vec![],
                            )]
                        } else {
                            vec![response(0x01, Status::Success, vec![], vec![])]
                        }
                    }
                    _ => vec![],
                })
            };
            let bus = CollectingEventBus::new();
            let core = test_core(MockConnector::new(responder), PoolConfig::default(), bus.clone());

            let result = core
                .execute(KvRequest::new(upsert_command()))
                .await
                .unwrap();
            assert_eq!(Status::Success, result.status);
            let retries = bus
                .kinds()
                .iter()
                .filter(|kind| matches!(kind, EventKind::RequestRetried { .. }))
                .count();
            assert_eq!(2, retries);
        });
    }

    // AUTH/ACCESS errors surface without retry.
    #[test]
    fn test_access_error_is_not_retried() {
        tokio_test::block_on(async {
            let sets = Arc::new(AtomicUsize::new(0));
            let responder = {
                let sets = sets.clone();
                bootstrap_responder(vec![], move |_, request| match request.header.opcode {
                    0xb5 => vec![response(
                        0xb5,
                        Status::Success,
                        vec![],
                        single_node_config(1, "10.0.0.1", 11210),
                    )],
                    0x01 => {
                        sets.fetch_add(1, Ordering::SeqCst);
                        vec![response(0x01, Status::AccessError, vec![], vec![])]
                    }
                    _ => vec![],
                })
            };
            let core = test_core(
                MockConnector::new(responder),
                PoolConfig::default(),
                CollectingEventBus::new(),
            );

            let err = core
                .execute(KvRequest::new(upsert_command()))
                .await
                .unwrap_err();
            assert!(matches!(err.kind, ErrorKind::AuthenticationFailure));
            assert_eq!(1, sets.load(Ordering::SeqCst));
        });
    }

    // An unknown collection triggers exactly one out-of-band refresh.
    #[test]
    fn test_unknown_collection_refreshes_once() {
        tokio_test::block_on(async {
            let attempts = Arc::new(AtomicUsize::new(0));
            let responder = {
                let attempts = attempts.clone();
                bootstrap_responder(vec![0x12], move |_, request| match request.header.opcode {
                    0xb5 => vec![response(
                        0xb5,
                        Status::Success,
                        vec![],
                        single_node_config(1, "10.0.0.1", 11210),
                    )],
                    0x00 => {
                        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                            vec![response(0x00, Status::UnknownCollection, vec![], vec![])]
                        } else {
                            vec![response(0x00, Status::Success, vec![], b"v".to_vec())]
                        }
                    }
                    _ => vec![],
                })
            };
            let core = test_core(
                MockConnector::new(responder),
                PoolConfig::default(),
                CollectingEventBus::new(),
            );

            let result = core
                .execute(
                    KvRequest::new(KvCommand::Get { key: b"k".to_vec() }).with_collection(0x09),
                )
                .await
                .unwrap();
            assert_eq!(b"v".to_vec(), result.value);
            assert_eq!(2, attempts.load(Ordering::SeqCst));
        });
    }

    #[test]
    fn test_shutdown_refuses_new_requests() {
        tokio_test::block_on(async {
            let responder = bootstrap_responder(vec![], |_, request| {
                match request.header.opcode {
                    0xb5 => vec![response(
                        0xb5,
                        Status::Success,
                        vec![],
                        single_node_config(1, "10.0.0.1", 11210),
                    )],
                    0x00 => vec![response(0x00, Status::Success, vec![], vec![])],
                    _ => vec![],
                }
            });
            let core = test_core(
                MockConnector::new(responder),
                PoolConfig::default(),
                CollectingEventBus::new(),
            );
            core.get(&b"k"[..]).await.unwrap();

            core.shutdown().await;
            let err = core.get(&b"k"[..]).await.unwrap_err();
            assert!(matches!(err.kind, ErrorKind::Shutdown));
            // Idempotent.
            core.shutdown().await;
        });
    }
}
