//! In-memory transport fakes: a scripted connection that decodes request
//! frames and answers from a responder function, so bootstrap, endpoint and
//! dispatcher behavior can be exercised without sockets.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::client::{Connection, Connector};
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{Header, Packet, Status, MAGIC_RESPONSE_VALUE};

/// Scripted server behavior: `(addr, request) -> response frames`. Returning
/// no frames models a server that never answers.
pub(crate) type Responder = Arc<dyn Fn(&str, &Packet) -> Vec<Packet> + Send + Sync>;

pub(crate) struct MockState {
    addr: String,
    responder: Responder,
    write_buf: Mutex<Vec<u8>>,
    read_buf: Mutex<VecDeque<u8>>,
    closed: AtomicBool,
    pub(crate) requests: Mutex<Vec<Packet>>,
}

#[derive(Clone)]
pub(crate) struct MockConnection {
    pub(crate) state: Arc<MockState>,
}

impl MockConnection {
    pub(crate) fn new(addr: &str, responder: Responder) -> Self {
        Self {
            state: Arc::new(MockState {
                addr: addr.to_string(),
                responder,
                write_buf: Mutex::new(vec![]),
                read_buf: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
                requests: Mutex::new(vec![]),
            }),
        }
    }

    pub(crate) fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Inject a response frame out of band, e.g. to release a request the
    /// responder left hanging.
    pub(crate) fn push_response(&self, packet: Packet) {
        let bytes: Vec<u8> = packet.into();
        self.state.read_buf.lock().unwrap().extend(bytes);
    }

    /// The requests decoded so far, oldest first.
    pub(crate) fn requests(&self) -> Vec<Packet> {
        self.state.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        loop {
            {
                let mut read_buf = self.state.read_buf.lock().unwrap();
                if read_buf.len() >= buf.len() {
                    for byte in buf.iter_mut() {
                        *byte = read_buf.pop_front().unwrap();
                    }
                    return Ok(());
                }
            }
            if self.is_closed() {
                return Err(Error::new(ErrorKind::ConnectionClosed));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::new(ErrorKind::ConnectionClosed));
        }
        let responses = {
            let mut write_buf = self.state.write_buf.lock().unwrap();
            write_buf.extend_from_slice(data);
            let mut responses = vec![];
            loop {
                if write_buf.len() < 24 {
                    break;
                }
                let header = Header::read_request(&write_buf[..24])?;
                let total = 24 + header.body_len as usize;
                if write_buf.len() < total {
                    break;
                }
                let frame: Vec<u8> = write_buf.drain(..total).collect();
                let request = header.read_packet(&frame[24..])?;
                self.state.requests.lock().unwrap().push(request.clone());
                for mut response in (self.state.responder)(&self.state.addr, &request) {
                    response.header.magic = MAGIC_RESPONSE_VALUE;
                    if response.header.opaque == 0 {
                        response.header.opaque = request.header.opaque;
                    }
                    responses.push(response);
                }
            }
            responses
        };
        let mut read_buf = self.state.read_buf.lock().unwrap();
        for response in responses {
            let bytes: Vec<u8> = response.into();
            read_buf.extend(bytes);
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.close();
    }

    fn local_addr(&self) -> Option<String> {
        Some("127.0.0.1:49152".into())
    }

    fn peer_addr(&self) -> Option<String> {
        Some(self.state.addr.clone())
    }
}

#[derive(Clone)]
pub(crate) struct MockConnector {
    responder: Responder,
    pub(crate) connections: Arc<Mutex<Vec<(String, MockConnection)>>>,
    refused: Arc<Mutex<Vec<String>>>,
}

impl MockConnector {
    pub(crate) fn new(responder: Responder) -> Self {
        Self {
            responder,
            connections: Arc::new(Mutex::new(vec![])),
            refused: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Make future connects to `addr` fail with an I/O error.
    pub(crate) fn refuse(&self, addr: &str) {
        self.refused.lock().unwrap().push(addr.to_string());
    }

    pub(crate) fn connections_to(&self, addr: &str) -> Vec<MockConnection> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|(conn_addr, _)| conn_addr == addr)
            .map(|(_, conn)| conn.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Conn = MockConnection;

    async fn connect(&self, addr: &str) -> Result<MockConnection> {
        if self.refused.lock().unwrap().iter().any(|a| a == addr) {
            return Err(Error::new(ErrorKind::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                addr.to_string(),
            ))));
        }
        let conn = MockConnection::new(addr, self.responder.clone());
        self.connections
            .lock()
            .unwrap()
            .push((addr.to_string(), conn.clone()));
        Ok(conn)
    }
}

/// Build a response frame for a request opcode.
pub(crate) fn response(
    opcode: u8,
    status: Status,
    extras: Vec<u8>,
    value: Vec<u8>,
) -> Packet {
    let mut packet = Packet::default();
    packet.header.magic = MAGIC_RESPONSE_VALUE;
    packet.header.opcode = opcode;
    packet.header.vbucket_or_status = status.code();
    packet.header.extras_length = extras.len() as u8;
    packet.header.body_len = (extras.len() + value.len()) as u32;
    packet.extras = extras;
    packet.value = value;
    packet
}

/// A responder covering the bootstrap chain: HELLO accepts the proposed
/// features listed in `features`, the error map loads a minimal document,
/// SASL answers PLAIN, and select-bucket succeeds. Everything else goes to
/// `data`.
pub(crate) fn bootstrap_responder<F>(features: Vec<u16>, data: F) -> Responder
where
    F: Fn(&str, &Packet) -> Vec<Packet> + Send + Sync + 'static,
{
    use crate::protocol::Status::Success;
    Arc::new(move |addr, request| match request.header.opcode {
        0x1f => {
            let mut value = vec![];
            for feature in &features {
                value.extend_from_slice(&feature.to_be_bytes());
            }
            vec![response(0x1f, Success, vec![], value)]
        }
        0xfe => vec![response(
            0xfe,
            Success,
            vec![],
            br#"{"version": 1, "revision": 1, "errors": {
                "86": {"name": "ETMPFAIL", "desc": "Temporary failure", "attrs": ["temp", "retry-now"]}
            }}"#
            .to_vec(),
        )],
        0x20 => vec![response(0x20, Success, vec![], b"PLAIN".to_vec())],
        0x21 => vec![response(0x21, Success, vec![], vec![])],
        0x89 => vec![response(0x89, Success, vec![], vec![])],
        _ => data(addr, request),
    })
}

/// A one-node config document whose kv service lives at `host:port`.
pub(crate) fn single_node_config(rev: i64, host: &str, port: u16) -> Vec<u8> {
    format!(
        r#"{{
            "rev": {rev}, "revEpoch": 1, "name": "default",
            "nodeLocator": "vbucket",
            "nodes": [{{"hostname": "{host}:8091", "ports": {{"direct": {port}}}}}],
            "nodesExt": [{{"hostname": "{host}", "services": {{"kv": {port}, "mgmt": 8091}}}}],
            "bucketCapabilities": ["couchapi"],
            "vBucketServerMap": {{
                "hashAlgorithm": "CRC", "numReplicas": 0,
                "serverList": ["{host}:{port}"],
                "vBucketMap": [[0], [0], [0], [0]]
            }}
        }}"#
    )
    .into_bytes()
}

/// A two-node config where every partition is owned by `owner`.
pub(crate) fn two_node_config(rev: i64, owner: usize) -> Vec<u8> {
    format!(
        r#"{{
            "rev": {rev}, "revEpoch": 1, "name": "default",
            "nodeLocator": "vbucket",
            "nodes": [
                {{"hostname": "10.0.0.1:8091", "ports": {{"direct": 11210}}}},
                {{"hostname": "10.0.0.2:8091", "ports": {{"direct": 11210}}}}
            ],
            "nodesExt": [
                {{"hostname": "10.0.0.1", "services": {{"kv": 11210}}}},
                {{"hostname": "10.0.0.2", "services": {{"kv": 11210}}}}
            ],
            "bucketCapabilities": ["couchapi"],
            "vBucketServerMap": {{
                "hashAlgorithm": "CRC", "numReplicas": 0,
                "serverList": ["10.0.0.1:11210", "10.0.0.2:11210"],
                "vBucketMap": [[{owner}], [{owner}], [{owner}], [{owner}]]
            }}
        }}"#
    )
    .into_bytes()
}
