//! The per-channel bootstrap chain. A freshly connected channel negotiates
//! features, loads the server error map, authenticates and selects its
//! bucket before any user request may flow; every stage races the one
//! bootstrap deadline.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::client::Connection;
use crate::config::ServiceType;
use crate::connstr::CredentialsProvider;
use crate::error::{Error, ErrorKind, Result};
use crate::events::{Event, EventBus, EventContext, EventKind};
use crate::protocol::{ErrorMap, Packet, ServerFeature, Status};
use crate::sasl::{plain_payload, select_mechanism, SaslMechanism, ScramClient};

/// What a channel knows about itself after bootstrap. Set once, read-only
/// afterwards.
#[derive(Debug, Clone, Default)]
pub struct ChannelContext {
    pub negotiated: HashSet<ServerFeature>,
    pub error_map: Option<ErrorMap>,
    pub bucket: Option<String>,
}

impl ChannelContext {
    pub fn collections_enabled(&self) -> bool {
        self.negotiated.contains(&ServerFeature::Collections)
    }

    pub fn mutation_tokens_enabled(&self) -> bool {
        self.negotiated.contains(&ServerFeature::MutationSeqno)
    }

    pub fn snappy_enabled(&self) -> bool {
        self.negotiated.contains(&ServerFeature::Snappy)
    }

    /// Whether the dispatcher may retry `status`, consulting the channel's
    /// error map before the built-in defaults.
    pub fn retriable(&self, status: Status) -> bool {
        match &self.error_map {
            Some(map) => map.retriable(status),
            None => status.default_retriable(),
        }
    }
}

/// Everything the bootstrap chain needs besides the connection itself.
#[derive(Debug, Clone)]
pub struct BootstrapParams {
    pub features: Vec<ServerFeature>,
    pub connection_name: String,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub bucket: Option<String>,
    pub error_map_version: u16,
    pub tls: bool,
    pub timeout: Duration,
    pub bus: Arc<dyn EventBus>,
    pub core_id: Uuid,
}

/// Run the bootstrap chain on a fresh connection. `deadline` is the overall
/// bootstrap deadline, shared with the transport connect that preceded this
/// call. On error the caller closes the transport; a timeout anywhere in the
/// chain fails it the same way.
pub async fn bootstrap<C: Connection>(
    conn: &mut C,
    params: &BootstrapParams,
    deadline: Instant,
) -> Result<ChannelContext> {
    let mut context = ChannelContext {
        bucket: params.bucket.clone(),
        ..ChannelContext::default()
    };

    negotiate_features(conn, params, deadline, &mut context).await?;
    load_error_map(conn, params, deadline, &mut context).await?;
    authenticate(conn, params, deadline).await?;
    select_bucket(conn, params, deadline).await?;

    Ok(context)
}

/// Race one bootstrap stage against the remaining budget.
async fn step<T, F>(peer: Option<String>, deadline: Instant, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::new(ErrorKind::UnambiguousTimeout)
            .with_node(peer.unwrap_or_default())),
    }
}

fn emit<C: Connection>(conn: &C, params: &BootstrapParams, started: Instant, kind: EventKind) {
    params.bus.publish(Event {
        kind,
        context: EventContext {
            local_addr: conn.local_addr(),
            remote_addr: conn.peer_addr(),
            core_id: params.core_id,
            elapsed: started.elapsed(),
        },
    });
}

async fn negotiate_features<C: Connection>(
    conn: &mut C,
    params: &BootstrapParams,
    deadline: Instant,
    context: &mut ChannelContext,
) -> Result<()> {
    let started = Instant::now();
    let codes: Vec<u16> = params.features.iter().map(ServerFeature::code).collect();
    let response = step(conn.peer_addr(), deadline, async {
        conn.write_packet(Packet::hello(&params.connection_name, &codes))
            .await?;
        conn.read_packet().await
    })
    .await?;

    // A refused HELLO is non-fatal: the server's silent defaults apply.
    if response.error_for_status().is_ok() {
        context.negotiated = response
            .value
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .filter_map(ServerFeature::from_code)
            .collect();
    }
    emit(
        conn,
        params,
        started,
        EventKind::FeatureNegotiationCompleted {
            negotiated: context.negotiated.iter().copied().collect(),
        },
    );
    Ok(())
}

async fn load_error_map<C: Connection>(
    conn: &mut C,
    params: &BootstrapParams,
    deadline: Instant,
    context: &mut ChannelContext,
) -> Result<()> {
    let started = Instant::now();
    let response = step(conn.peer_addr(), deadline, async {
        conn.write_packet(Packet::error_map(params.error_map_version))
            .await?;
        conn.read_packet().await
    })
    .await?;

    match response.error_for_status() {
        Ok(()) => match ErrorMap::from_json(&response.value) {
            Ok(map) => {
                emit(
                    conn,
                    params,
                    started,
                    EventKind::ErrorMapLoaded {
                        version: map.version,
                    },
                );
                context.error_map = Some(map);
            }
            Err(_) => {
                // Continue without a map; built-in defaults apply.
                emit(conn, params, started, EventKind::ErrorMapUndecodable);
            }
        },
        Err(status) => {
            emit(
                conn,
                params,
                started,
                EventKind::ErrorMapLoadingFailure { status },
            );
        }
    }
    Ok(())
}

async fn authenticate<C: Connection>(
    conn: &mut C,
    params: &BootstrapParams,
    deadline: Instant,
) -> Result<()> {
    let (username, password) = params.credentials.credentials(ServiceType::Kv);
    if username.is_empty() {
        return Ok(());
    }

    let started = Instant::now();
    let result = step(conn.peer_addr(), deadline, async {
        conn.write_packet(Packet::sasl_list_mechs()).await?;
        let response = conn.read_packet().await?;
        let mechs = String::from_utf8_lossy(&response.value).to_string();
        let mechanism = select_mechanism(&mechs, params.tls)
            .ok_or_else(|| Error::new(ErrorKind::AuthenticationFailure))?;

        match mechanism {
            SaslMechanism::Plain => {
                conn.write_packet(Packet::sasl_auth(
                    mechanism.as_str(),
                    plain_payload(&username, &password),
                ))
                .await?;
                let response = conn.read_packet().await?;
                match response.status() {
                    Status::Success => Ok(mechanism),
                    status => {
                        Err(Error::new(ErrorKind::AuthenticationFailure).with_status(status))
                    }
                }
            }
            _ => {
                let mut scram = ScramClient::new(mechanism, &username, &password);
                conn.write_packet(Packet::sasl_auth(mechanism.as_str(), scram.client_first()))
                    .await?;
                let response = conn.read_packet().await?;
                if response.status() != Status::AuthContinue {
                    return Err(Error::new(ErrorKind::AuthenticationFailure)
                        .with_status(response.status()));
                }
                let server_first = String::from_utf8_lossy(&response.value).to_string();
                let client_final = scram.handle_server_first(&server_first)?;

                conn.write_packet(Packet::sasl_step(mechanism.as_str(), client_final))
                    .await?;
                let response = conn.read_packet().await?;
                if response.status() != Status::Success {
                    return Err(Error::new(ErrorKind::AuthenticationFailure)
                        .with_status(response.status()));
                }
                let server_final = String::from_utf8_lossy(&response.value).to_string();
                scram.verify_server_final(&server_final)?;
                Ok(mechanism)
            }
        }
    })
    .await;

    match result {
        Ok(mechanism) => {
            emit(
                conn,
                params,
                started,
                EventKind::SaslAuthCompleted {
                    mechanism: mechanism.as_str().to_string(),
                },
            );
            Ok(())
        }
        Err(err) => {
            emit(
                conn,
                params,
                started,
                EventKind::SaslAuthFailed {
                    status: err.context.last_status.unwrap_or(Status::AuthError),
                },
            );
            Err(err)
        }
    }
}

async fn select_bucket<C: Connection>(
    conn: &mut C,
    params: &BootstrapParams,
    deadline: Instant,
) -> Result<()> {
    let bucket = match &params.bucket {
        Some(bucket) => bucket.clone(),
        None => return Ok(()),
    };

    let started = Instant::now();
    let response = step(conn.peer_addr(), deadline, async {
        conn.write_packet(Packet::select_bucket(&bucket)).await?;
        conn.read_packet().await
    })
    .await?;

    match response.status() {
        Status::Success => {
            emit(
                conn,
                params,
                started,
                EventKind::BucketSelected {
                    bucket: bucket.clone(),
                },
            );
            Ok(())
        }
        status => {
            emit(
                conn,
                params,
                started,
                EventKind::BucketSelectionFailed {
                    bucket: bucket.clone(),
                    status,
                },
            );
            Err(Error::new(ErrorKind::BucketNotFound).with_status(status))
        }
    }
}
