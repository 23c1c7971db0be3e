//! The cluster configuration model. Configs arrive as JSON documents either
//! on a data channel (piggybacked or via an explicit config request) or from
//! the HTTP streaming endpoint, and are normalized into [`BucketConfig`]
//! snapshots that drive endpoint placement.

mod provider;

pub use provider::{ConfigProvider, ConfigSnapshot};

use std::collections::{HashMap, HashSet};

use serde_derive::Deserialize;

use crate::error::{Error, ErrorKind, Result};

/// A service type reachable on cluster nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Kv,
    Query,
    Views,
    Search,
    Analytics,
    Manager,
}

impl ServiceType {
    /// The well-known default port for the service.
    pub fn default_port(&self, tls: bool) -> u16 {
        match (self, tls) {
            (ServiceType::Kv, false) => 11210,
            (ServiceType::Kv, true) => 11207,
            (ServiceType::Query, false) => 8093,
            (ServiceType::Query, true) => 18093,
            (ServiceType::Views, false) => 8092,
            (ServiceType::Views, true) => 18092,
            (ServiceType::Search, false) => 8094,
            (ServiceType::Search, true) => 18094,
            (ServiceType::Analytics, false) => 8095,
            (ServiceType::Analytics, true) => 18095,
            (ServiceType::Manager, false) => 8091,
            (ServiceType::Manager, true) => 18091,
        }
    }

    fn from_ext_key(key: &str) -> Option<(Self, bool)> {
        let (base, tls) = match key.strip_suffix("SSL") {
            Some(base) => (base, true),
            None => (key, false),
        };
        let service = match base {
            "kv" => ServiceType::Kv,
            "n1ql" => ServiceType::Query,
            "capi" => ServiceType::Views,
            "fts" => ServiceType::Search,
            "cbas" => ServiceType::Analytics,
            "mgmt" => ServiceType::Manager,
            _ => return None,
        };
        Some((service, tls))
    }
}

/// How keys map to nodes for this bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLocator {
    Vbucket,
    Ketama,
    None,
}

/// An address advertised for clients outside the cluster network, keyed by
/// network name (typically "external").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlternateAddress {
    pub hostname: Option<String>,
    pub services: HashMap<ServiceType, u16>,
    pub ssl_services: HashMap<ServiceType, u16>,
}

/// One node of the cluster with its reachable services.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInfo {
    pub hostname: String,
    pub services: HashMap<ServiceType, u16>,
    pub ssl_services: HashMap<ServiceType, u16>,
    pub alternate_addresses: HashMap<String, AlternateAddress>,
}

impl NodeInfo {
    pub fn service_port(&self, service: ServiceType, tls: bool) -> Option<u16> {
        if tls {
            self.ssl_services.get(&service).copied()
        } else {
            self.services.get(&service).copied()
        }
    }

    /// The dialable `host:port` address for a service, if enabled here.
    pub fn service_address(&self, service: ServiceType, tls: bool) -> Option<String> {
        self.service_port(service, tls)
            .map(|port| format!("{}:{}", self.hostname, port))
    }
}

/// The partition map for vbucket-located buckets. Entries of `-1` mark a
/// partition without an active owner during rebalance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VbucketServerMap {
    pub num_replicas: u32,
    pub server_list: Vec<String>,
    pub vbucket_map: Vec<Vec<i32>>,
}

/// One immutable revision of a bucket's topology. Replaced wholesale when a
/// strictly newer revision arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketConfig {
    pub uuid: String,
    pub name: String,
    pub rev: i64,
    pub rev_epoch: i64,
    pub node_locator: NodeLocator,
    pub uri: String,
    pub streaming_uri: String,
    pub nodes: Vec<NodeInfo>,
    pub capabilities: HashSet<String>,
    pub vbucket_server_map: Option<VbucketServerMap>,
    pub origin_host: String,
}

const COUCHAPI_CAPABILITY: &str = "couchapi";

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    rev: i64,
    #[serde(default, rename = "revEpoch")]
    rev_epoch: i64,
    name: String,
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    uri: String,
    #[serde(default, rename = "streamingUri")]
    streaming_uri: String,
    #[serde(default, rename = "nodeLocator")]
    node_locator: Option<String>,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default, rename = "nodesExt")]
    nodes_ext: Vec<RawNodeExt>,
    #[serde(default, rename = "bucketCapabilities")]
    bucket_capabilities: Vec<String>,
    #[serde(default, rename = "vBucketServerMap")]
    vbucket_server_map: Option<RawVbucketServerMap>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    ports: HashMap<String, u16>,
    #[serde(default, rename = "couchApiBase")]
    couch_api_base: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawNodeExt {
    #[serde(default)]
    services: HashMap<String, u16>,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default, rename = "alternateAddresses")]
    alternate_addresses: HashMap<String, RawAlternateAddress>,
}

#[derive(Debug, Deserialize)]
struct RawAlternateAddress {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    ports: HashMap<String, u16>,
}

#[derive(Debug, Deserialize)]
struct RawVbucketServerMap {
    #[serde(default, rename = "numReplicas")]
    num_replicas: u32,
    #[serde(default, rename = "serverList")]
    server_list: Vec<String>,
    #[serde(default, rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
}

/// Strip a `:port` suffix from a legacy `host:port` hostname. IPv6 literals
/// keep their brackets.
fn strip_port(hostname: &str) -> String {
    if let Some(end) = hostname.rfind("]:") {
        return hostname[..=end].to_string();
    }
    match hostname.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() && !host.contains(':') => {
            host.to_string()
        }
        _ => hostname.to_string(),
    }
}

fn split_service_ports(
    ports: &HashMap<String, u16>,
) -> (HashMap<ServiceType, u16>, HashMap<ServiceType, u16>) {
    let mut services = HashMap::new();
    let mut ssl_services = HashMap::new();
    for (key, port) in ports {
        if let Some((service, tls)) = ServiceType::from_ext_key(key) {
            if tls {
                ssl_services.insert(service, *port);
            } else {
                services.insert(service, *port);
            }
        }
    }
    (services, ssl_services)
}

impl BucketConfig {
    /// Parse a raw config document. `origin_host` is the host the document
    /// was read from; it substitutes the `$HOST` placeholder and is the final
    /// hostname fallback during node derivation.
    pub fn parse(raw: &[u8], origin_host: &str) -> Result<Self> {
        let text = String::from_utf8_lossy(raw).replace("$HOST", origin_host);
        let raw: RawConfig = serde_json::from_str(&text)
            .map_err(|err| Error::new(ErrorKind::ConfigParsing(err.to_string())))?;

        let node_locator = match raw.node_locator.as_deref() {
            Some("vbucket") => NodeLocator::Vbucket,
            Some("ketama") => NodeLocator::Ketama,
            _ => NodeLocator::None,
        };
        let capabilities: HashSet<String> = raw.bucket_capabilities.iter().cloned().collect();
        let nodes = derive_nodes(&raw, &capabilities, origin_host);

        Ok(BucketConfig {
            uuid: raw.uuid,
            name: raw.name,
            rev: raw.rev,
            rev_epoch: raw.rev_epoch,
            node_locator,
            uri: raw.uri,
            streaming_uri: raw.streaming_uri,
            nodes,
            capabilities,
            vbucket_server_map: raw.vbucket_server_map.map(|map| VbucketServerMap {
                num_replicas: map.num_replicas,
                server_list: map.server_list,
                vbucket_map: map.vbucket_map,
            }),
            origin_host: origin_host.to_string(),
        })
    }

    /// Revisions order totally by `(rev_epoch, rev)`; only strictly newer
    /// revisions replace the current one.
    pub fn is_newer_than(&self, other: &BucketConfig) -> bool {
        (self.rev_epoch, self.rev) > (other.rev_epoch, other.rev)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Indexes of the nodes where `service` is reachable.
    pub fn nodes_for_service(&self, service: ServiceType, tls: bool) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.service_port(service, tls).is_some())
            .map(|(i, _)| i)
            .collect()
    }
}

fn derive_nodes(
    raw: &RawConfig,
    capabilities: &HashSet<String>,
    origin_host: &str,
) -> Vec<NodeInfo> {
    if raw.nodes_ext.is_empty() {
        return derive_legacy_nodes(raw, capabilities);
    }

    let ephemeral = !capabilities.contains(COUCHAPI_CAPABILITY);
    raw.nodes_ext
        .iter()
        .enumerate()
        .map(|(index, ext)| {
            let legacy = raw.nodes.get(index);
            // Prefer the extended hostname, then the legacy node at the same
            // index, then the host the config came from.
            let hostname = ext
                .hostname
                .clone()
                .or_else(|| legacy.and_then(|node| node.hostname.as_deref().map(strip_port)))
                .unwrap_or_else(|| origin_host.to_string());

            let (mut services, mut ssl_services) = split_service_ports(&ext.services);
            if ephemeral {
                // Buckets without couchapi cannot serve views.
                services.remove(&ServiceType::Views);
                ssl_services.remove(&ServiceType::Views);
            }
            if legacy.is_none() {
                // The node runs cluster-wide services but not this bucket.
                services.remove(&ServiceType::Kv);
                services.remove(&ServiceType::Views);
                ssl_services.remove(&ServiceType::Kv);
                ssl_services.remove(&ServiceType::Views);
            }

            let alternate_addresses = ext
                .alternate_addresses
                .iter()
                .map(|(network, alt)| {
                    let (services, ssl_services) = split_service_ports(&alt.ports);
                    (
                        network.clone(),
                        AlternateAddress {
                            hostname: alt.hostname.clone(),
                            services,
                            ssl_services,
                        },
                    )
                })
                .collect();

            NodeInfo {
                hostname,
                services,
                ssl_services,
                alternate_addresses,
            }
        })
        .collect()
}

fn derive_legacy_nodes(raw: &RawConfig, capabilities: &HashSet<String>) -> Vec<NodeInfo> {
    let ephemeral = !capabilities.contains(COUCHAPI_CAPABILITY);
    raw.nodes
        .iter()
        .map(|node| {
            let full = node.hostname.clone().unwrap_or_default();
            let hostname = strip_port(&full);
            let mut services = HashMap::new();
            if let Some(port) = node.ports.get("direct") {
                services.insert(ServiceType::Kv, *port);
            }
            if let Some((_, port)) = full.rsplit_once(':') {
                if let Ok(port) = port.parse() {
                    services.insert(ServiceType::Manager, port);
                }
            }
            if !ephemeral {
                if let Some(port) = node
                    .couch_api_base
                    .as_deref()
                    .and_then(parse_couch_api_port)
                {
                    services.insert(ServiceType::Views, port);
                }
            }
            NodeInfo {
                hostname,
                services,
                ssl_services: HashMap::new(),
                alternate_addresses: HashMap::new(),
            }
        })
        .collect()
}

/// Pull the port out of a couchApiBase URL like `http://host:8092/bucket`.
fn parse_couch_api_port(base: &str) -> Option<u16> {
    let rest = base.split_once("://").map(|(_, rest)| rest)?;
    let authority = rest.split('/').next()?;
    let (_, port) = authority.rsplit_once(':')?;
    port.parse().ok()
}
