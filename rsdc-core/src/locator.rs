//! Node placement. Key-addressed services hash the key to a partition and
//! look the owner up in the vbucket map (or walk a ketama ring for
//! memcached-type buckets); everything else round-robins over the nodes
//! where the service is enabled.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use murmur3::murmur3_32;

use crate::config::{BucketConfig, NodeLocator, ServiceType};
use crate::error::{Error, ErrorKind, Result};

/// Where a request should go: a node index into the config's node list, and
/// the partition that decided it for key-addressed placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub node: usize,
    pub vbucket: Option<u16>,
}

/// Hash a key to its partition id.
pub fn vbucket_for_key(key: &[u8], num_partitions: usize) -> u16 {
    let hash = (crc32fast::hash(key) >> 16) & 0x7fff;
    (hash as usize % num_partitions) as u16
}

/// A ring divides the key space among nodes with consistent hashing, so a
/// topology change only reshuffles a fraction of the keys.
#[derive(Debug, Clone)]
pub struct KetamaRing {
    buckets: Vec<(u32, usize)>,
}

const RING_SHARE: usize = 120;

impl KetamaRing {
    /// Build a ring over the given node authorities. Each node owns an equal
    /// share of the ring space.
    pub fn new(authorities: &[String]) -> Self {
        let mut buckets = vec![];
        for (node_index, authority) in authorities.iter().enumerate() {
            for i in 0..RING_SHARE {
                // murmur3_32 reads from an io::Reader but a byte slice
                // cannot fail.
                let k = murmur3_32(&mut authority.as_bytes(), i as u32).unwrap();
                buckets.push((k, node_index));
            }
        }
        buckets.sort_unstable();
        Self { buckets }
    }

    /// Get the node owning the bucket containing the given key.
    pub fn node_for_key(&self, mut key: &[u8]) -> Option<usize> {
        if self.buckets.is_empty() {
            return None;
        }
        let ring_pos = murmur3_32(&mut key, 0).unwrap();
        let bucket_search = self.buckets.binary_search_by_key(&ring_pos, |(i, _)| *i);
        let bucket_index = bucket_search.unwrap_or_else(|next_bucket| next_bucket);
        let (_, node_index) = self.buckets.get(bucket_index).unwrap_or(&self.buckets[0]);
        Some(*node_index)
    }
}

/// Stateful placement over changing configs. Owns the round-robin cursor and
/// a ketama ring cached per config revision.
#[derive(Debug, Default)]
pub struct Locator {
    round_robin: AtomicUsize,
    ring_cache: Mutex<Option<((i64, i64), KetamaRing)>>,
}

impl Locator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the node for a request. Key-addressed placement applies to the
    /// KV service; every other service rotates over its enabled nodes.
    pub fn locate(
        &self,
        config: &BucketConfig,
        service: ServiceType,
        key: Option<&[u8]>,
        tls: bool,
    ) -> Result<Placement> {
        if service == ServiceType::Kv {
            if let Some(key) = key {
                return self.locate_key(config, key, tls);
            }
        }
        let eligible = config.nodes_for_service(service, tls);
        if eligible.is_empty() {
            return Err(Error::new(ErrorKind::ServiceNotAvailable).with_service(service));
        }
        let cursor = self.round_robin.fetch_add(1, Ordering::Relaxed);
        Ok(Placement {
            node: eligible[cursor % eligible.len()],
            vbucket: None,
        })
    }

    fn locate_key(&self, config: &BucketConfig, key: &[u8], tls: bool) -> Result<Placement> {
        match config.node_locator {
            NodeLocator::Vbucket => self.locate_vbucket(config, key, 0),
            NodeLocator::Ketama => self.locate_ketama(config, key, tls),
            NodeLocator::None => {
                Err(Error::new(ErrorKind::ServiceNotAvailable).with_service(ServiceType::Kv))
            }
        }
    }

    /// Key placement through the vbucket map. `replica` 0 addresses the
    /// active copy, 1..=num_replicas the replicas.
    pub fn locate_vbucket(
        &self,
        config: &BucketConfig,
        key: &[u8],
        replica: usize,
    ) -> Result<Placement> {
        let map = config
            .vbucket_server_map
            .as_ref()
            .filter(|map| !map.vbucket_map.is_empty())
            .ok_or_else(|| {
                Error::new(ErrorKind::ServiceNotAvailable).with_service(ServiceType::Kv)
            })?;
        let vbucket = vbucket_for_key(key, map.vbucket_map.len());
        let owners = &map.vbucket_map[vbucket as usize];
        let node = owners
            .get(replica)
            .copied()
            .filter(|owner| *owner >= 0)
            .ok_or_else(|| {
                Error::new(ErrorKind::ServiceNotAvailable).with_service(ServiceType::Kv)
            })?;
        Ok(Placement {
            node: node as usize,
            vbucket: Some(vbucket),
        })
    }

    fn locate_ketama(&self, config: &BucketConfig, key: &[u8], tls: bool) -> Result<Placement> {
        let revision = (config.rev_epoch, config.rev);
        let mut cache = self.ring_cache.lock().unwrap();
        let rebuild = !matches!(&*cache, Some((rev, _)) if *rev == revision);
        if rebuild {
            let authorities: Vec<String> = config
                .nodes
                .iter()
                .filter_map(|node| node.service_address(ServiceType::Kv, tls))
                .collect();
            *cache = Some((revision, KetamaRing::new(&authorities)));
        }
        let (_, ring) = cache.as_ref().unwrap();
        // Ring positions index the kv-enabled subset, so map back to the
        // config's node list.
        let eligible = config.nodes_for_service(ServiceType::Kv, tls);
        ring.node_for_key(key)
            .and_then(|i| eligible.get(i).copied())
            .map(|node| Placement {
                node,
                vbucket: None,
            })
            .ok_or_else(|| {
                Error::new(ErrorKind::ServiceNotAvailable).with_service(ServiceType::Kv)
            })
    }
}
