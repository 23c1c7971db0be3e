//! HTTP passthrough for the row services (query, analytics, search, views,
//! manager). The core only frames requests, demultiplexes status and streams
//! chunked bodies; payload schemas belong to the server.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;

use crate::config::{ConfigProvider, NodeInfo, ServiceType};
use crate::connstr::CredentialsProvider;
use crate::error::{Error, ErrorKind, Result};

/// A demultiplexed response: the HTTP status and the owned body bytes.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialsProvider>,
    tls: bool,
}

impl HttpClient {
    pub fn new(credentials: Arc<dyn CredentialsProvider>, tls: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
            tls,
        }
    }

    fn base_url(&self, node: &NodeInfo, service: ServiceType) -> Result<String> {
        let port = node
            .service_port(service, self.tls)
            .ok_or_else(|| Error::new(ErrorKind::ServiceNotAvailable).with_service(service))?;
        let scheme = if self.tls { "https" } else { "http" };
        Ok(format!("{}://{}:{}", scheme, node.hostname, port))
    }

    /// Execute one JSON request against a service on a node.
    pub async fn execute(
        &self,
        node: &NodeInfo,
        service: ServiceType,
        method: reqwest::Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse> {
        let url = format!("{}{}", self.base_url(node, service)?, path);
        let (username, password) = self.credentials.credentials(service);
        let mut request = self
            .client
            .request(method, &url)
            .basic_auth(username, Some(password))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request.send().await.map_err(wire_err)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(wire_err)?;
        Ok(HttpResponse { status, body })
    }

    /// Attach to the streaming config endpoint for a bucket and feed every
    /// complete document into the provider. Documents arrive as
    /// newline-separated JSON objects on a never-ending chunked response;
    /// this returns when the server closes the stream.
    pub async fn stream_configs(
        &self,
        node: &NodeInfo,
        bucket: &str,
        provider: &ConfigProvider,
    ) -> Result<()> {
        let url = format!(
            "{}/pools/default/bs/{}",
            self.base_url(node, ServiceType::Manager)?,
            bucket
        );
        let (username, password) = self.credentials.credentials(ServiceType::Manager);
        let response = self
            .client
            .get(&url)
            .basic_auth(username, Some(password))
            .send()
            .await
            .map_err(wire_err)?;
        if !response.status().is_success() {
            return Err(Error::new(ErrorKind::ConfigParsing(format!(
                "config stream for {} returned HTTP {}",
                bucket,
                response.status().as_u16()
            ))));
        }

        let mut stream = response.bytes_stream();
        let mut buf: Vec<u8> = vec![];
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(wire_err)?;
            buf.extend_from_slice(&chunk);
            for line in drain_lines(&mut buf) {
                // Parse failures are already evented by the provider; a bad
                // document must not kill the stream.
                let _ = provider.ingest(&line, &node.hostname);
            }
        }
        Ok(())
    }
}

/// Pull the complete newline-terminated documents out of the buffer, leaving
/// any partial tail for the next chunk.
fn drain_lines(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = vec![];
    while let Some(pos) = buf.iter().position(|byte| *byte == b'\n') {
        let mut line: Vec<u8> = buf.drain(..=pos).collect();
        line.pop();
        if !line.iter().all(u8::is_ascii_whitespace) {
            lines.push(line);
        }
    }
    lines
}

fn wire_err(err: reqwest::Error) -> Error {
    Error::new(ErrorKind::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        err,
    )))
}
