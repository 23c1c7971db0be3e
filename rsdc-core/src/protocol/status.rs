use std::fmt::{Display, Formatter, Result as FmtResult};

/// The normalized 16-bit status field of a response frame. Codes the client
/// does not recognize keep their raw value so the server error map can still
/// describe them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    NotFound,
    Exists,
    TooBig,
    Invalid,
    NotStored,
    NotMyVbucket,
    NoBucket,
    Locked,
    AuthError,
    AuthContinue,
    AccessError,
    NotInitialized,
    TemporaryFailure,
    UnknownCollection,
    SyncWriteAmbiguous,
    SubdocPathNotFound,
    SubdocPathMismatch,
    SubdocPathInvalid,
    SubdocPathTooBig,
    SubdocDocTooDeep,
    SubdocValueCantInsert,
    SubdocDocNotJson,
    SubdocPathExists,
    SubdocValueTooDeep,
    SubdocInvalidCombo,
    SubdocMultiPathFailure,
    Unknown(u16),
}

impl From<u16> for Status {
    fn from(val: u16) -> Self {
        match val {
            0x00 => Status::Success,
            0x01 => Status::NotFound,
            0x02 => Status::Exists,
            0x03 => Status::TooBig,
            0x04 => Status::Invalid,
            0x05 => Status::NotStored,
            0x07 => Status::NotMyVbucket,
            0x08 => Status::NoBucket,
            0x09 => Status::Locked,
            0x20 => Status::AuthError,
            0x21 => Status::AuthContinue,
            0x24 => Status::AccessError,
            0x25 => Status::NotInitialized,
            0x86 => Status::TemporaryFailure,
            0x88 => Status::UnknownCollection,
            0xa3 => Status::SyncWriteAmbiguous,
            0xc0 => Status::SubdocPathNotFound,
            0xc1 => Status::SubdocPathMismatch,
            0xc2 => Status::SubdocPathInvalid,
            0xc3 => Status::SubdocPathTooBig,
            0xc4 => Status::SubdocDocTooDeep,
            0xc5 => Status::SubdocValueCantInsert,
            0xc6 => Status::SubdocDocNotJson,
            0xc9 => Status::SubdocPathExists,
            0xca => Status::SubdocValueTooDeep,
            0xcb => Status::SubdocInvalidCombo,
            0xcc => Status::SubdocMultiPathFailure,
            other => Status::Unknown(other),
        }
    }
}

impl Status {
    /// The raw wire code, usable as an error map key.
    pub fn code(&self) -> u16 {
        match self {
            Status::Success => 0x00,
            Status::NotFound => 0x01,
            Status::Exists => 0x02,
            Status::TooBig => 0x03,
            Status::Invalid => 0x04,
            Status::NotStored => 0x05,
            Status::NotMyVbucket => 0x07,
            Status::NoBucket => 0x08,
            Status::Locked => 0x09,
            Status::AuthError => 0x20,
            Status::AuthContinue => 0x21,
            Status::AccessError => 0x24,
            Status::NotInitialized => 0x25,
            Status::TemporaryFailure => 0x86,
            Status::UnknownCollection => 0x88,
            Status::SyncWriteAmbiguous => 0xa3,
            Status::SubdocPathNotFound => 0xc0,
            Status::SubdocPathMismatch => 0xc1,
            Status::SubdocPathInvalid => 0xc2,
            Status::SubdocPathTooBig => 0xc3,
            Status::SubdocDocTooDeep => 0xc4,
            Status::SubdocValueCantInsert => 0xc5,
            Status::SubdocDocNotJson => 0xc6,
            Status::SubdocPathExists => 0xc9,
            Status::SubdocValueTooDeep => 0xca,
            Status::SubdocInvalidCombo => 0xcb,
            Status::SubdocMultiPathFailure => 0xcc,
            Status::Unknown(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    pub fn is_subdoc(&self) -> bool {
        (0xc0..=0xcc).contains(&self.code())
    }

    /// Whether the status is retriable when the server error map has nothing
    /// to say about it.
    pub fn default_retriable(&self) -> bool {
        matches!(
            self,
            Status::TemporaryFailure | Status::Locked | Status::NotInitialized
        )
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Status::Unknown(code) => write!(f, "unknown status 0x{:04x}", code),
            other => write!(f, "{:?} (0x{:04x})", other, other.code()),
        }
    }
}
