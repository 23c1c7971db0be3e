//! Typed requests and responses. A [`KvCommand`] describes one operation
//! abstractly; encoding to a wire frame happens against the channel state of
//! the endpoint that will carry it, because collections and mutation tokens
//! are negotiated per connection.

use std::convert::TryInto;
use std::sync::Arc;
use std::time::Duration;

use crate::bootstrap::ChannelContext;
use crate::error::Result;
use crate::protocol::{
    resolve_subdoc_status, write_unsigned_leb128, Packet, Status, SubdocCommand, SubdocField,
};
use crate::retry::RetryStrategy;

/// Proof of a specific mutation, usable for durability checkpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationToken {
    pub bucket: String,
    pub partition: u16,
    pub partition_uuid: u64,
    pub seqno: u64,
}

/// One data operation, named by what it does to the document.
#[derive(Debug, Clone, PartialEq)]
pub enum KvCommand {
    Get { key: Vec<u8> },
    GetAndLock { key: Vec<u8>, lock_time: u32 },
    GetAndTouch { key: Vec<u8>, expiry: u32 },
    Unlock { key: Vec<u8>, cas: u64 },
    Touch { key: Vec<u8>, expiry: u32 },
    Upsert { key: Vec<u8>, value: Vec<u8>, flags: u32, expiry: u32, cas: u64 },
    Insert { key: Vec<u8>, value: Vec<u8>, flags: u32, expiry: u32 },
    Replace { key: Vec<u8>, value: Vec<u8>, flags: u32, expiry: u32, cas: u64 },
    Remove { key: Vec<u8>, cas: u64 },
    Append { key: Vec<u8>, value: Vec<u8>, cas: u64 },
    Prepend { key: Vec<u8>, value: Vec<u8>, cas: u64 },
    Increment { key: Vec<u8>, delta: u64, initial: u64, expiry: u32 },
    Decrement { key: Vec<u8>, delta: u64, initial: u64, expiry: u32 },
    Observe { key: Vec<u8> },
    LookupIn { key: Vec<u8>, commands: Vec<SubdocCommand>, doc_flags: u8 },
    MutateIn { key: Vec<u8>, commands: Vec<SubdocCommand>, doc_flags: u8, expiry: u32, cas: u64 },
    GetCollectionId { path: String },
    GetCollectionsManifest,
    GetConfig,
}

impl KvCommand {
    /// The routing key, when the operation addresses a document.
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            KvCommand::Get { key }
            | KvCommand::GetAndLock { key, .. }
            | KvCommand::GetAndTouch { key, .. }
            | KvCommand::Unlock { key, .. }
            | KvCommand::Touch { key, .. }
            | KvCommand::Upsert { key, .. }
            | KvCommand::Insert { key, .. }
            | KvCommand::Replace { key, .. }
            | KvCommand::Remove { key, .. }
            | KvCommand::Append { key, .. }
            | KvCommand::Prepend { key, .. }
            | KvCommand::Increment { key, .. }
            | KvCommand::Decrement { key, .. }
            | KvCommand::Observe { key }
            | KvCommand::LookupIn { key, .. }
            | KvCommand::MutateIn { key, .. } => Some(key),
            KvCommand::GetCollectionId { .. }
            | KvCommand::GetCollectionsManifest
            | KvCommand::GetConfig => None,
        }
    }

    /// Whether EXISTS from the server means a CAS conflict rather than a
    /// duplicate insert.
    pub fn cas_op(&self) -> bool {
        matches!(
            self,
            KvCommand::Unlock { cas, .. }
            | KvCommand::Upsert { cas, .. }
            | KvCommand::Replace { cas, .. }
            | KvCommand::Remove { cas, .. }
            | KvCommand::Append { cas, .. }
            | KvCommand::Prepend { cas, .. }
            | KvCommand::MutateIn { cas, .. } if *cas != 0
        )
    }

    /// Mutations carry a mutation token in their response when negotiated.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            KvCommand::Upsert { .. }
                | KvCommand::Insert { .. }
                | KvCommand::Replace { .. }
                | KvCommand::Remove { .. }
                | KvCommand::Append { .. }
                | KvCommand::Prepend { .. }
                | KvCommand::Increment { .. }
                | KvCommand::Decrement { .. }
                | KvCommand::MutateIn { .. }
        )
    }

    /// Value-carrying mutations are the only frames worth compressing.
    pub fn compressible(&self) -> bool {
        matches!(
            self,
            KvCommand::Upsert { .. }
                | KvCommand::Insert { .. }
                | KvCommand::Replace { .. }
                | KvCommand::Append { .. }
                | KvCommand::Prepend { .. }
        )
    }

    /// Safe to transparently retry after a connection bounce.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            KvCommand::Get { .. }
                | KvCommand::GetAndTouch { .. }
                | KvCommand::Touch { .. }
                | KvCommand::Observe { .. }
                | KvCommand::LookupIn { .. }
                | KvCommand::GetCollectionId { .. }
                | KvCommand::GetCollectionsManifest
                | KvCommand::GetConfig
        )
    }

    fn is_subdoc_multi(&self) -> bool {
        matches!(
            self,
            KvCommand::LookupIn { .. } | KvCommand::MutateIn { .. }
        )
    }

    /// Encode for a specific channel. The wire key gains a leb128 collection
    /// id prefix iff the channel negotiated collections; `vbucket` lands in
    /// the partition field for key-addressed services.
    pub fn encode(
        &self,
        context: &ChannelContext,
        collection_id: u32,
        vbucket: Option<u16>,
    ) -> Packet {
        let wire_key = |key: &[u8]| -> Vec<u8> {
            if context.collections_enabled() {
                let mut out = vec![];
                write_unsigned_leb128(collection_id, &mut out);
                out.extend_from_slice(key);
                out
            } else {
                key.to_vec()
            }
        };

        let mut packet = match self {
            KvCommand::Get { key } => Packet::get(wire_key(key)),
            KvCommand::GetAndLock { key, lock_time } => {
                Packet::get_locked(wire_key(key), *lock_time)
            }
            KvCommand::GetAndTouch { key, expiry } => Packet::get_and_touch(wire_key(key), *expiry),
            KvCommand::Unlock { key, cas } => Packet::unlock(wire_key(key), *cas),
            KvCommand::Touch { key, expiry } => Packet::touch(wire_key(key), *expiry),
            KvCommand::Upsert {
                key,
                value,
                flags,
                expiry,
                cas,
            } => Packet::set(wire_key(key), value, *flags, *expiry, *cas),
            KvCommand::Insert {
                key,
                value,
                flags,
                expiry,
            } => Packet::add(wire_key(key), value, *flags, *expiry),
            KvCommand::Replace {
                key,
                value,
                flags,
                expiry,
                cas,
            } => Packet::replace(wire_key(key), value, *flags, *expiry, *cas),
            KvCommand::Remove { key, cas } => Packet::delete(wire_key(key), *cas),
            KvCommand::Append { key, value, cas } => Packet::append(wire_key(key), value, *cas),
            KvCommand::Prepend { key, value, cas } => Packet::prepend(wire_key(key), value, *cas),
            KvCommand::Increment {
                key,
                delta,
                initial,
                expiry,
            } => Packet::increment(wire_key(key), *delta, *initial, *expiry),
            KvCommand::Decrement {
                key,
                delta,
                initial,
                expiry,
            } => Packet::decrement(wire_key(key), *delta, *initial, *expiry),
            KvCommand::Observe { key } => {
                Packet::observe(&[(vbucket.unwrap_or(0), wire_key(key))])
            }
            KvCommand::LookupIn {
                key,
                commands,
                doc_flags,
            } => Packet::subdoc_multi_lookup(wire_key(key), commands, *doc_flags),
            KvCommand::MutateIn {
                key,
                commands,
                doc_flags,
                expiry,
                cas,
            } => Packet::subdoc_multi_mutate(wire_key(key), commands, *doc_flags, *expiry, *cas),
            KvCommand::GetCollectionId { path } => Packet::get_collection_id(path),
            KvCommand::GetCollectionsManifest => Packet::get_collections_manifest(),
            KvCommand::GetConfig => Packet::get_config(),
        };
        packet.header.vbucket_or_status = vbucket.unwrap_or(0);
        packet
    }
}

/// A typed request: the command plus its routing and policy attributes.
#[derive(Debug, Clone)]
pub struct KvRequest {
    pub command: KvCommand,
    pub collection_id: u32,
    pub timeout: Option<Duration>,
    pub retry: Option<Arc<dyn RetryStrategy>>,
}

impl KvRequest {
    pub fn new(command: KvCommand) -> Self {
        Self {
            command,
            collection_id: 0,
            timeout: None,
            retry: None,
        }
    }

    pub fn with_collection(mut self, collection_id: u32) -> Self {
        self.collection_id = collection_id;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: Arc<dyn RetryStrategy>) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// The decoded outcome of one request. `status` is the resolved status (for
/// multi sub-document responses the frame status reconciled with the per-op
/// vector); the raw per-op results are in `fields`.
#[derive(Debug, Clone, PartialEq)]
pub struct KvResponse {
    pub status: Status,
    pub cas: u64,
    pub flags: u32,
    pub value: Vec<u8>,
    pub mutation_token: Option<MutationToken>,
    pub fields: Vec<SubdocField>,
}

impl KvResponse {
    /// Decode a response frame for the command that produced it. `vbucket`
    /// is the partition the request targeted, used to label the mutation
    /// token.
    pub fn decode(
        packet: Packet,
        command: &KvCommand,
        context: &ChannelContext,
        vbucket: Option<u16>,
    ) -> Result<Self> {
        let frame_status = packet.status();

        let flags = match command {
            KvCommand::Get { .. }
            | KvCommand::GetAndLock { .. }
            | KvCommand::GetAndTouch { .. }
                if packet.extras.len() >= 4 =>
            {
                u32::from_be_bytes(packet.extras[0..4].try_into().unwrap())
            }
            _ => 0,
        };

        let mutation_token = if command.is_mutation() && context.mutation_tokens_enabled() {
            packet
                .mutation_token()
                .map(|(partition_uuid, seqno)| MutationToken {
                    bucket: context.bucket.clone().unwrap_or_default(),
                    partition: vbucket.unwrap_or(0),
                    partition_uuid,
                    seqno,
                })
        } else {
            None
        };

        let (status, fields) = if command.is_subdoc_multi() {
            let fields = if frame_status == Status::SubdocDocNotJson
                || frame_status == Status::SubdocDocTooDeep
            {
                vec![]
            } else {
                packet.subdoc_fields()?
            };
            resolve_subdoc_status(frame_status, fields)
        } else {
            (frame_status, vec![])
        };

        Ok(Self {
            status,
            cas: packet.header.cas,
            flags,
            value: packet.value,
            mutation_token,
            fields,
        })
    }

    /// The counter value of an increment/decrement response.
    pub fn counter_value(&self) -> Option<u64> {
        self.value
            .get(0..8)
            .map(|bytes| u64::from_be_bytes(bytes.try_into().unwrap()))
    }
}
