//! The closed error taxonomy surfaced to callers. Every error carries a
//! correlation id plus whatever routing context was known when it was
//! raised, which is the contract for troubleshooting a distributed request
//! path.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::time::Duration;

use thiserror::Error as ThisError;
use uuid::Uuid;

use crate::config::ServiceType;
use crate::protocol::{ProtocolError, Status};

pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong, without the routing context.
#[derive(Debug, ThisError)]
pub enum ErrorKind {
    #[error("document not found")]
    DocumentNotFound,
    #[error("document already exists")]
    DocumentExists,
    #[error("CAS mismatch")]
    CasMismatch,
    #[error("value too large")]
    ValueTooLarge,
    #[error("durability requirement is in an ambiguous state")]
    DurabilityAmbiguous,
    #[error("authentication failure")]
    AuthenticationFailure,
    #[error("bucket not found")]
    BucketNotFound,
    #[error("temporary failure")]
    TemporaryFailure,
    #[error("request canceled")]
    RequestCanceled,
    #[error("timeout before the request was written")]
    UnambiguousTimeout,
    #[error("timeout with the request possibly executed")]
    AmbiguousTimeout,
    #[error("sub-document path not found")]
    SubdocPathNotFound,
    #[error("sub-document path mismatch")]
    SubdocPathMismatch,
    #[error("sub-document path invalid")]
    SubdocPathInvalid,
    #[error("sub-document path already exists")]
    SubdocPathExists,
    #[error("document is not JSON")]
    SubdocDocNotJson,
    #[error("document is too deep")]
    SubdocDocTooDeep,
    #[error("sub-document value cannot be inserted")]
    SubdocValueCantInsert,
    #[error("sub-document value is too deep")]
    SubdocValueTooDeep,
    #[error("no enabled node for the requested service")]
    ServiceNotAvailable,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("config could not be parsed: {0}")]
    ConfigParsing(String),
    #[error("value could not be (de)compressed")]
    Compression,
    #[error("core already shut down")]
    Shutdown,
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("ProtocolError: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("StatusError: {0}")]
    Status(Status),
}

/// Routing context attached to an error as it bubbles up the request path.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub correlation_id: Uuid,
    pub service: Option<ServiceType>,
    pub node: Option<String>,
    pub last_status: Option<Status>,
    pub elapsed: Option<Duration>,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            service: None,
            node: None,
            last_status: None,
            elapsed: None,
        }
    }
}

impl Display for ErrorContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "id={}", self.correlation_id)?;
        if let Some(service) = self.service {
            write!(f, ", service={:?}", service)?;
        }
        if let Some(node) = &self.node {
            write!(f, ", node={}", node)?;
        }
        if let Some(status) = self.last_status {
            write!(f, ", status={}", status)?;
        }
        if let Some(elapsed) = self.elapsed {
            write!(f, ", elapsed={:?}", elapsed)?;
        }
        Ok(())
    }
}

/// An error causing during client communication with the cluster.
#[derive(Debug, ThisError)]
#[error("{kind} ({context})")]
pub struct Error {
    #[source]
    pub kind: ErrorKind,
    pub context: ErrorContext,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: ErrorContext::default(),
        }
    }

    pub fn with_service(mut self, service: ServiceType) -> Self {
        self.context.service = Some(service);
        self
    }

    pub fn with_node<N: Into<String>>(mut self, node: N) -> Self {
        self.context.node = Some(node.into());
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.context.last_status = Some(status);
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.context.elapsed = Some(elapsed);
        self
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::AmbiguousTimeout | ErrorKind::UnambiguousTimeout
        )
    }
}

impl<K: Into<ErrorKind>> From<K> for Error {
    fn from(kind: K) -> Self {
        Error::new(kind.into())
    }
}

/// Map a non-success response status on a data operation to the error kind
/// surfaced to callers. `cas_op` distinguishes a CAS conflict from an
/// insert conflict on EXISTS.
pub fn kind_for_status(status: Status, cas_op: bool) -> ErrorKind {
    match status {
        Status::NotFound => ErrorKind::DocumentNotFound,
        Status::Exists if cas_op => ErrorKind::CasMismatch,
        Status::Exists => ErrorKind::DocumentExists,
        Status::TooBig => ErrorKind::ValueTooLarge,
        Status::Locked | Status::TemporaryFailure => ErrorKind::TemporaryFailure,
        Status::AuthError | Status::AccessError => ErrorKind::AuthenticationFailure,
        Status::NoBucket => ErrorKind::BucketNotFound,
        Status::SyncWriteAmbiguous => ErrorKind::DurabilityAmbiguous,
        Status::SubdocPathNotFound => ErrorKind::SubdocPathNotFound,
        Status::SubdocPathMismatch => ErrorKind::SubdocPathMismatch,
        Status::SubdocPathInvalid => ErrorKind::SubdocPathInvalid,
        Status::SubdocPathExists => ErrorKind::SubdocPathExists,
        Status::SubdocDocNotJson => ErrorKind::SubdocDocNotJson,
        Status::SubdocDocTooDeep => ErrorKind::SubdocDocTooDeep,
        Status::SubdocValueCantInsert => ErrorKind::SubdocValueCantInsert,
        Status::SubdocValueTooDeep => ErrorKind::SubdocValueTooDeep,
        status => ErrorKind::Status(status),
    }
}
