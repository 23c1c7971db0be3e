//! Connection string parsing and the credentials seam.

use std::collections::HashMap;
use std::fmt::Debug;

use crate::config::ServiceType;
use crate::error::{Error, ErrorKind, Result};

/// The connection scheme, deciding transport security and default ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Couchbase,
    Couchbases,
}

impl Scheme {
    pub fn tls(&self) -> bool {
        matches!(self, Scheme::Couchbases)
    }

    pub fn default_kv_port(&self) -> u16 {
        ServiceType::Kv.default_port(self.tls())
    }
}

/// A parsed `[scheme://]host[,host]*[:port][/bucket][?opt=val&…]` string.
/// Each host may carry its own port; hosts without one use the scheme's
/// default KV port.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionString {
    pub scheme: Scheme,
    pub hosts: Vec<(String, u16)>,
    pub bucket: Option<String>,
    pub options: HashMap<String, String>,
}

impl ConnectionString {
    pub fn parse(input: &str) -> Result<Self> {
        let (scheme, rest) = match input.split_once("://") {
            Some(("couchbase", rest)) => (Scheme::Couchbase, rest),
            Some(("couchbases", rest)) => (Scheme::Couchbases, rest),
            Some((scheme, _)) => {
                return Err(Error::new(ErrorKind::InvalidArgument(format!(
                    "unsupported scheme: {}",
                    scheme
                ))))
            }
            None => (Scheme::Couchbase, input),
        };

        let (rest, options) = match rest.split_once('?') {
            Some((rest, query)) => (rest, parse_options(query)),
            None => (rest, HashMap::new()),
        };

        let (hosts_part, bucket) = match rest.split_once('/') {
            Some((hosts, bucket)) if !bucket.is_empty() => (hosts, Some(bucket.to_string())),
            Some((hosts, _)) => (hosts, None),
            None => (rest, None),
        };

        let default_port = scheme.default_kv_port();
        let hosts = hosts_part
            .split(',')
            .filter(|host| !host.is_empty())
            .map(|host| parse_host(host, default_port))
            .collect::<Result<Vec<_>>>()?;
        if hosts.is_empty() {
            return Err(Error::new(ErrorKind::InvalidArgument(
                "connection string names no hosts".into(),
            )));
        }

        Ok(Self {
            scheme,
            hosts,
            bucket,
            options,
        })
    }

    pub fn tls(&self) -> bool {
        self.scheme.tls()
    }

    /// The seed `host:port` addresses to bootstrap from.
    pub fn seed_addresses(&self) -> Vec<String> {
        self.hosts
            .iter()
            .map(|(host, port)| format!("{}:{}", host, port))
            .collect()
    }
}

fn parse_host(host: &str, default_port: u16) -> Result<(String, u16)> {
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => {
            let port = port.parse().map_err(|_| {
                Error::new(ErrorKind::InvalidArgument(format!("bad port in {}", host)))
            })?;
            Ok((name.to_string(), port))
        }
        _ => Ok((host.to_string(), default_port)),
    }
}

fn parse_options(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Returns the `(username, password)` pair to authenticate a service with.
/// Lets callers plug in rotating or per-service credentials.
pub trait CredentialsProvider: Send + Sync + Debug {
    fn credentials(&self, service: ServiceType) -> (String, String);
}

/// A fixed username/password pair for every service.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl CredentialsProvider for StaticCredentials {
    fn credentials(&self, _: ServiceType) -> (String, String) {
        (self.username.clone(), self.password.clone())
    }
}
