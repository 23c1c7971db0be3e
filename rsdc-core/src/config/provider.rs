use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use super::BucketConfig;
use crate::error::Result;
use crate::events::{Event, EventBus, EventContext, EventKind};

/// The topology snapshot shared with every reader. A single immutable value
/// replaced atomically per revision; `None` until the first config lands.
pub type ConfigSnapshot = Option<Arc<BucketConfig>>;

/// Ingests raw config documents from any source (data channel or HTTP
/// stream), applies revision ordering, and publishes snapshots.
#[derive(Debug)]
pub struct ConfigProvider {
    tx: watch::Sender<ConfigSnapshot>,
    bus: Arc<dyn EventBus>,
    core_id: Uuid,
}

impl ConfigProvider {
    pub fn new(bus: Arc<dyn EventBus>, core_id: Uuid) -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx, bus, core_id }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConfigSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ConfigSnapshot {
        self.tx.borrow().clone()
    }

    /// Parse and install a raw config document. Returns whether the config
    /// replaced the current snapshot; older revisions are silently dropped.
    pub fn ingest(&self, raw: &[u8], origin_host: &str) -> Result<bool> {
        let config = match BucketConfig::parse(raw, origin_host) {
            Ok(config) => config,
            Err(err) => {
                self.publish(EventKind::ConfigParsingFailure {
                    message: err.to_string(),
                });
                return Err(err);
            }
        };
        Ok(self.install(config))
    }

    /// Install an already-parsed config if it is strictly newer than the
    /// current snapshot.
    pub fn install(&self, config: BucketConfig) -> bool {
        let replaced = self.tx.send_if_modified(|current| match current {
            Some(existing) if !config.is_newer_than(existing) => false,
            _ => {
                *current = Some(Arc::new(config.clone()));
                true
            }
        });
        if replaced {
            self.publish(EventKind::ConfigUpdated {
                rev_epoch: config.rev_epoch,
                rev: config.rev,
            });
        }
        replaced
    }

    fn publish(&self, kind: EventKind) {
        self.bus.publish(Event {
            kind,
            context: EventContext {
                core_id: self.core_id,
                ..EventContext::default()
            },
        });
    }
}
