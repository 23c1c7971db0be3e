use std::convert::TryInto;

use super::{
    Packet, ProtocolError, Status, SUBDOC_MULTI_LOOKUP_OPCODE, SUBDOC_MULTI_MUTATE_OPCODE,
};

/// Per-path flag: the path addresses an extended attribute.
pub const SUBDOC_FLAG_XATTR_PATH: u8 = 0x04;
/// Per-path flag: create intermediate path components on mutation.
pub const SUBDOC_FLAG_CREATE_PATH: u8 = 0x01;

/// The operation applied to a single path inside a multi lookup or mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubdocOpcode {
    Get,
    Exists,
    GetCount,
    DictAdd,
    DictUpsert,
    Delete,
    Replace,
    ArrayPushLast,
    ArrayPushFirst,
    ArrayInsert,
    ArrayAddUnique,
    Counter,
}

impl SubdocOpcode {
    pub fn code(&self) -> u8 {
        match self {
            SubdocOpcode::Get => 0xc5,
            SubdocOpcode::Exists => 0xc6,
            SubdocOpcode::DictAdd => 0xc7,
            SubdocOpcode::DictUpsert => 0xc8,
            SubdocOpcode::Delete => 0xc9,
            SubdocOpcode::Replace => 0xca,
            SubdocOpcode::ArrayPushLast => 0xcb,
            SubdocOpcode::ArrayPushFirst => 0xcc,
            SubdocOpcode::ArrayInsert => 0xcd,
            SubdocOpcode::ArrayAddUnique => 0xce,
            SubdocOpcode::Counter => 0xcf,
            SubdocOpcode::GetCount => 0xd2,
        }
    }

    pub fn is_lookup(&self) -> bool {
        matches!(
            self,
            SubdocOpcode::Get | SubdocOpcode::Exists | SubdocOpcode::GetCount
        )
    }
}

/// One command of a multi lookup or mutation. Commands are encoded onto the
/// wire in list order and the response vector mirrors that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubdocCommand {
    pub opcode: SubdocOpcode,
    pub path: String,
    pub fragment: Vec<u8>,
    pub create_parent: bool,
    pub xattr: bool,
}

impl SubdocCommand {
    pub fn new<P: Into<String>>(opcode: SubdocOpcode, path: P) -> Self {
        Self {
            opcode,
            path: path.into(),
            fragment: vec![],
            create_parent: false,
            xattr: false,
        }
    }

    pub fn with_fragment<F: Into<Vec<u8>>>(mut self, fragment: F) -> Self {
        self.fragment = fragment.into();
        self
    }

    pub fn create_parent(mut self, create_parent: bool) -> Self {
        self.create_parent = create_parent;
        self
    }

    pub fn xattr(mut self, xattr: bool) -> Self {
        self.xattr = xattr;
        self
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.create_parent {
            flags |= SUBDOC_FLAG_CREATE_PATH;
        }
        if self.xattr {
            flags |= SUBDOC_FLAG_XATTR_PATH;
        }
        flags
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let path = self.path.as_bytes();
        out.push(self.opcode.code());
        out.push(self.flags());
        out.extend_from_slice(&(path.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.fragment.len() as u32).to_be_bytes());
        out.extend_from_slice(path);
        out.extend_from_slice(&self.fragment);
    }
}

/// The decoded result of a single command within a multi response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubdocField {
    pub status: Status,
    pub value: Vec<u8>,
}

impl Packet {
    pub fn subdoc_multi_lookup<K: AsRef<[u8]>>(
        key: K,
        commands: &[SubdocCommand],
        doc_flags: u8,
    ) -> Self {
        let extras = if doc_flags != 0 {
            vec![doc_flags]
        } else {
            vec![]
        };
        let mut value = vec![];
        for command in commands {
            command.encode(&mut value);
        }
        Packet::request(SUBDOC_MULTI_LOOKUP_OPCODE, key, extras, value)
    }

    pub fn subdoc_multi_mutate<K: AsRef<[u8]>>(
        key: K,
        commands: &[SubdocCommand],
        doc_flags: u8,
        expiry: u32,
        cas: u64,
    ) -> Self {
        // Extras carry the doc flags byte and the expiration, each present
        // only when non-zero.
        let mut extras = vec![];
        if doc_flags != 0 {
            extras.push(doc_flags);
        }
        if expiry != 0 {
            extras.extend_from_slice(&expiry.to_be_bytes());
        }
        let mut value = vec![];
        for command in commands {
            command.encode(&mut value);
        }
        let mut packet = Packet::request(SUBDOC_MULTI_MUTATE_OPCODE, key, extras, value);
        packet.header.cas = cas;
        packet
    }

    /// Decode the per-command records of a multi response. Records appear in
    /// the order the commands were sent: `status(u16) | value_len(u32) |
    /// value`.
    pub fn subdoc_fields(&self) -> Result<Vec<SubdocField>, ProtocolError> {
        let mut fields = vec![];
        let mut rest = &self.value[..];
        while !rest.is_empty() {
            if rest.len() < 6 {
                return Err(ProtocolError::TruncatedRecord);
            }
            let status = Status::from(u16::from_be_bytes(rest[0..2].try_into().unwrap()));
            let len = u32::from_be_bytes(rest[2..6].try_into().unwrap()) as usize;
            rest = &rest[6..];
            if rest.len() < len {
                return Err(ProtocolError::TruncatedRecord);
            }
            fields.push(SubdocField {
                status,
                value: rest[..len].to_vec(),
            });
            rest = &rest[len..];
        }
        Ok(fields)
    }
}

/// Reconcile the frame-level status of a multi response with its per-command
/// statuses, returning the status to surface and the per-command vector the
/// caller should expose.
pub fn resolve_subdoc_status(
    frame: Status,
    fields: Vec<SubdocField>,
) -> (Status, Vec<SubdocField>) {
    // A combo failure means the client encoded an impossible command list.
    debug_assert!(
        frame != Status::SubdocInvalidCombo,
        "sub-document command list rejected by the server as invalid"
    );
    match frame {
        Status::SubdocMultiPathFailure => {
            let failed: Vec<&SubdocField> =
                fields.iter().filter(|f| !f.status.is_success()).collect();
            if fields.len() == 1 && failed.len() == 1 {
                let status = failed[0].status;
                (status, fields)
            } else {
                // Partial success: callers inspect the per-command vector.
                (Status::Success, fields)
            }
        }
        Status::SubdocDocNotJson | Status::SubdocDocTooDeep => (frame, vec![]),
        frame => {
            let failed: Vec<&SubdocField> =
                fields.iter().filter(|f| !f.status.is_success()).collect();
            if fields.len() == 1 && failed.len() == 1 {
                let status = failed[0].status;
                (status, fields)
            } else {
                (frame, fields)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(path: &str, fragment: &[u8]) -> SubdocCommand {
        SubdocCommand::new(SubdocOpcode::DictUpsert, path).with_fragment(fragment)
    }

    #[test]
    fn test_command_encoding() {
        let command = upsert("/a", b"1").create_parent(true).xattr(true);
        let mut out = vec![];
        command.encode(&mut out);
        let expect = vec![
            0xc8, // dict upsert
            0x05, // create path | xattr path
            0x00, 0x02, // path length
            0x00, 0x00, 0x00, 0x01, // value length
            0x2f, 0x61, // "/a"
            0x31, // "1"
        ];
        assert_eq!(expect, out);
    }

    #[test]
    fn test_multi_mutate_extras_presence() {
        let commands = vec![upsert("/a", b"1")];
        let packet = Packet::subdoc_multi_mutate(b"doc", &commands, 0, 0, 0);
        assert!(packet.extras.is_empty());

        let packet = Packet::subdoc_multi_mutate(b"doc", &commands, 0x01, 0, 0);
        assert_eq!(vec![0x01], packet.extras);

        let packet = Packet::subdoc_multi_mutate(b"doc", &commands, 0, 30, 0);
        assert_eq!(30_u32.to_be_bytes().to_vec(), packet.extras);

        let packet = Packet::subdoc_multi_mutate(b"doc", &commands, 0x01, 30, 0);
        assert_eq!(5, packet.extras.len());
    }

    #[test]
    fn test_multi_body_preserves_order() {
        let commands = vec![upsert("/a", b"1"), upsert("/x/y", b"2"), upsert("/b", b"3")];
        let packet = Packet::subdoc_multi_mutate(b"doc", &commands, 0, 0, 0);

        let mut offset = 0;
        for command in &commands {
            assert_eq!(command.opcode.code(), packet.value[offset]);
            let path_len = u16::from_be_bytes([packet.value[offset + 2], packet.value[offset + 3]])
                as usize;
            let path =
                std::str::from_utf8(&packet.value[offset + 8..offset + 8 + path_len]).unwrap();
            assert_eq!(command.path, path);
            offset += 8 + path_len + command.fragment.len();
        }
        assert_eq!(packet.value.len(), offset);
    }

    fn response_with_fields(fields: &[(u16, &[u8])]) -> Packet {
        let mut value = vec![];
        for (status, field) in fields {
            value.extend_from_slice(&status.to_be_bytes());
            value.extend_from_slice(&(field.len() as u32).to_be_bytes());
            value.extend_from_slice(field);
        }
        let mut packet = Packet::request(SUBDOC_MULTI_MUTATE_OPCODE, b"", b"", value);
        packet.header.key_length = 0;
        packet
    }

    #[test]
    fn test_field_decoding_preserves_order() {
        let packet = response_with_fields(&[(0x00, b"1"), (0xc0, b""), (0x00, b"3")]);
        let fields = packet.subdoc_fields().unwrap();
        assert_eq!(
            vec![
                SubdocField {
                    status: Status::Success,
                    value: b"1".to_vec()
                },
                SubdocField {
                    status: Status::SubdocPathNotFound,
                    value: vec![]
                },
                SubdocField {
                    status: Status::Success,
                    value: b"3".to_vec()
                },
            ],
            fields
        );
    }

    #[test]
    fn test_truncated_fields() {
        let mut packet = response_with_fields(&[(0x00, b"1")]);
        packet.value.truncate(5);
        assert_eq!(Err(ProtocolError::TruncatedRecord), packet.subdoc_fields());
    }

    #[test]
    fn test_partial_success_resolution() {
        let fields = vec![
            SubdocField {
                status: Status::Success,
                value: vec![],
            },
            SubdocField {
                status: Status::SubdocPathNotFound,
                value: vec![],
            },
            SubdocField {
                status: Status::Success,
                value: vec![],
            },
        ];
        let (status, fields) = resolve_subdoc_status(Status::SubdocMultiPathFailure, fields);
        assert_eq!(Status::Success, status);
        assert_eq!(3, fields.len());
        assert_eq!(Status::SubdocPathNotFound, fields[1].status);
    }

    #[test]
    fn test_single_failure_surfaces_command_error() {
        let fields = vec![SubdocField {
            status: Status::SubdocPathNotFound,
            value: vec![],
        }];
        let (status, fields) = resolve_subdoc_status(Status::SubdocMultiPathFailure, fields);
        assert_eq!(Status::SubdocPathNotFound, status);
        assert_eq!(1, fields.len());
    }

    #[test]
    fn test_doc_level_failure_clears_fields() {
        let fields = vec![SubdocField {
            status: Status::Success,
            value: vec![],
        }];
        let (status, fields) = resolve_subdoc_status(Status::SubdocDocNotJson, fields);
        assert_eq!(Status::SubdocDocNotJson, status);
        assert!(fields.is_empty());
    }
}
