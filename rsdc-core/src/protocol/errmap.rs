use std::collections::{HashMap, HashSet};

use serde_derive::Deserialize;

use super::Status;

/// A behavior attribute the server attaches to a status code. Attributes the
/// client does not know fold into [`ErrorAttribute::Unknown`] so newer
/// servers never break decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorAttribute {
    Success,
    ItemOnly,
    InvalidInput,
    FetchConfig,
    ConnStateInvalidated,
    Auth,
    SpecialHandling,
    Support,
    Temp,
    Internal,
    RetryNow,
    RetryLater,
    Subdoc,
    Dcp,
    AutoRetry,
    ItemLocked,
    ItemDeleted,
    #[serde(other)]
    Unknown,
}

impl ErrorAttribute {
    fn retriable(&self) -> bool {
        matches!(
            self,
            ErrorAttribute::RetryNow
                | ErrorAttribute::RetryLater
                | ErrorAttribute::AutoRetry
                | ErrorAttribute::Temp
        )
    }
}

/// The description the server gives for one status code.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorMapEntry {
    pub name: String,
    #[serde(rename = "desc")]
    pub description: String,
    #[serde(default)]
    pub attrs: HashSet<ErrorAttribute>,
}

#[derive(Debug, Deserialize)]
struct RawErrorMap {
    version: u16,
    #[serde(default)]
    revision: u16,
    errors: HashMap<String, ErrorMapEntry>,
}

/// The server error map, loaded once per connection during bootstrap. Status
/// codes are keyed by their raw 16-bit value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorMap {
    pub version: u16,
    pub revision: u16,
    errors: HashMap<u16, ErrorMapEntry>,
}

impl ErrorMap {
    /// Decode the JSON document returned by the error map request. Status
    /// keys are lowercase hex strings without a prefix; entries with
    /// undecodable keys are dropped rather than failing the whole map.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawErrorMap = serde_json::from_slice(bytes)?;
        let errors = raw
            .errors
            .into_iter()
            .filter_map(|(code, entry)| {
                u16::from_str_radix(&code, 16).ok().map(|code| (code, entry))
            })
            .collect();
        Ok(Self {
            version: raw.version,
            revision: raw.revision,
            errors,
        })
    }

    pub fn get(&self, status: Status) -> Option<&ErrorMapEntry> {
        self.errors.get(&status.code())
    }

    /// Whether the dispatcher may retry a request that failed with `status`.
    /// Falls back to the built-in defaults when the map has no entry.
    pub fn retriable(&self, status: Status) -> bool {
        match self.get(status) {
            Some(entry) => entry.attrs.iter().any(ErrorAttribute::retriable),
            None => status.default_retriable(),
        }
    }
}
