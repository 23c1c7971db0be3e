//! This crate provides the core I/O runtime for rsdc implementations into
//! various async runtimes: the binary KV protocol codec, the per-connection
//! bootstrap chain, the cluster configuration model, and the
//! locator/pool/dispatcher request path. Transports plug in through
//! [`client::Connection`] and [`client::Connector`]; the `rsdc-tokio` crate
//! provides the TCP and TLS implementations. If compression is undesired, it
//! is possible to disable the `snappy` feature (on by default.)

pub mod bootstrap;
pub mod client;
pub mod compress;
pub mod config;
pub mod connstr;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod http;
pub mod locator;
pub mod pool;
pub mod protocol;
pub mod request;
pub mod retry;
pub mod sasl;

#[cfg(test)]
pub(crate) mod testutil;
