use std::convert::TryInto;

use thiserror::Error;

use super::{
    Status, ADD_OPCODE, APPEND_OPCODE, DECREMENT_OPCODE, DELETE_OPCODE, ERROR_MAP_OPCODE,
    GET_AND_TOUCH_OPCODE, GET_COLLECTIONS_MANIFEST_OPCODE, GET_COLLECTION_ID_OPCODE,
    GET_CONFIG_OPCODE, GET_LOCKED_OPCODE, GET_OPCODE, HELLO_OPCODE, INCREMENT_OPCODE,
    MAGIC_ALT_REQUEST_VALUE, MAGIC_ALT_RESPONSE_VALUE, MAGIC_REQUEST_VALUE, MAGIC_RESPONSE_VALUE,
    OBSERVE_OPCODE, PREPEND_OPCODE, REPLACE_OPCODE, SASL_AUTH_OPCODE, SASL_LIST_MECHS_OPCODE,
    SASL_STEP_OPCODE, SELECT_BUCKET_OPCODE, SET_OPCODE, SUBDOC_EXISTS_OPCODE, SUBDOC_GET_OPCODE,
    TOUCH_OPCODE, UNLOCK_OPCODE,
};

/// An error caused by a frame that does not obey the binary protocol.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid magic byte: {0}")]
    InvalidMagic(u8),
    #[error("Packet header must be 24 bytes")]
    PacketTooSmall,
    #[error("Packet body does not match the advertised length")]
    BodySizeMismatch,
    #[error("Truncated sub-document response record")]
    TruncatedRecord,
}

#[derive(Debug, Default, PartialEq, Clone, Copy)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_length: u16,
    pub framing_extras_length: u8,
    pub extras_length: u8,
    pub data_type: u8,
    pub vbucket_or_status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    pub fn read_packet(self, body: &[u8]) -> Result<Packet, ProtocolError> {
        if body.len() != self.body_len as usize {
            // The body length does not match the header
            return Err(ProtocolError::BodySizeMismatch);
        }
        let framing = self.framing_extras_length as usize;
        let extras = self.extras_length as usize;
        let key = self.key_length as usize;
        if framing + extras + key > body.len() {
            return Err(ProtocolError::BodySizeMismatch);
        }

        let (framing_extras, body) = body.split_at(framing);
        let (extras, body) = body.split_at(extras);
        let (key, value) = body.split_at(key);

        Ok(Packet {
            header: self,
            framing_extras: framing_extras.into(),
            extras: extras.into(),
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn read_response(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let magic = *bytes.first().ok_or(ProtocolError::PacketTooSmall)?;
        if magic != MAGIC_RESPONSE_VALUE && magic != MAGIC_ALT_RESPONSE_VALUE {
            return Err(ProtocolError::InvalidMagic(magic));
        }
        Self::read(bytes)
    }

    pub fn read_request(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let magic = *bytes.first().ok_or(ProtocolError::PacketTooSmall)?;
        if magic != MAGIC_REQUEST_VALUE && magic != MAGIC_ALT_REQUEST_VALUE {
            return Err(ProtocolError::InvalidMagic(magic));
        }
        Self::read(bytes)
    }

    fn read(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < 24 {
            // The header must be 24 bytes
            return Err(ProtocolError::PacketTooSmall);
        }
        let magic = bytes[0];
        let raw_key_length = u16::from_be_bytes(bytes[2..4].try_into().unwrap());
        // Alternate framing narrows the key length to one byte and spends the
        // other on a framing extras segment.
        let (framing_extras_length, key_length) =
            if magic == MAGIC_ALT_RESPONSE_VALUE || magic == MAGIC_ALT_REQUEST_VALUE {
                ((raw_key_length >> 8) as u8, raw_key_length & 0xff)
            } else {
                (0, raw_key_length)
            };
        Ok(Header {
            magic,
            opcode: bytes[1],
            key_length,
            framing_extras_length,
            extras_length: bytes[4],
            data_type: bytes[5],
            vbucket_or_status: u16::from_be_bytes(bytes[6..8].try_into().unwrap()),
            body_len: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            opaque: u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            cas: u64::from_be_bytes(bytes[16..24].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Default, PartialEq, Clone)]
pub struct Packet {
    pub header: Header,
    pub framing_extras: Vec<u8>,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Packet {
    pub(crate) fn request<K: AsRef<[u8]>, E: AsRef<[u8]>, V: AsRef<[u8]>>(
        opcode: u8,
        key: K,
        extras: E,
        value: V,
    ) -> Self {
        let key = key.as_ref();
        let extras = extras.as_ref();
        let value = value.as_ref();

        let mut packet = Packet::default();
        packet.header.magic = MAGIC_REQUEST_VALUE;
        packet.header.opcode = opcode;
        packet.header.key_length = key.len() as u16;
        packet.header.extras_length = extras.len() as u8;
        packet.header.body_len = (extras.len() + key.len() + value.len()) as u32;
        packet.key = key.into();
        packet.extras = extras.into();
        packet.value = value.into();
        packet
    }

    pub fn get<K: AsRef<[u8]>>(key: K) -> Self {
        Packet::request(GET_OPCODE, key, b"", b"")
    }

    pub fn get_locked<K: AsRef<[u8]>>(key: K, lock_time: u32) -> Self {
        Packet::request(GET_LOCKED_OPCODE, key, lock_time.to_be_bytes(), b"")
    }

    pub fn unlock<K: AsRef<[u8]>>(key: K, cas: u64) -> Self {
        let mut packet = Packet::request(UNLOCK_OPCODE, key, b"", b"");
        packet.header.cas = cas;
        packet
    }

    pub fn get_and_touch<K: AsRef<[u8]>>(key: K, expiry: u32) -> Self {
        Packet::request(GET_AND_TOUCH_OPCODE, key, expiry.to_be_bytes(), b"")
    }

    pub fn touch<K: AsRef<[u8]>>(key: K, expiry: u32) -> Self {
        Packet::request(TOUCH_OPCODE, key, expiry.to_be_bytes(), b"")
    }

    fn store<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        opcode: u8,
        key: K,
        value: V,
        flags: u32,
        expiry: u32,
        cas: u64,
    ) -> Self {
        let extras = [flags.to_be_bytes(), expiry.to_be_bytes()].concat();
        let mut packet = Packet::request(opcode, key, extras, value);
        packet.header.cas = cas;
        packet
    }

    pub fn set<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        key: K,
        value: V,
        flags: u32,
        expiry: u32,
        cas: u64,
    ) -> Self {
        Packet::store(SET_OPCODE, key, value, flags, expiry, cas)
    }

    pub fn add<K: AsRef<[u8]>, V: AsRef<[u8]>>(key: K, value: V, flags: u32, expiry: u32) -> Self {
        Packet::store(ADD_OPCODE, key, value, flags, expiry, 0)
    }

    pub fn replace<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        key: K,
        value: V,
        flags: u32,
        expiry: u32,
        cas: u64,
    ) -> Self {
        Packet::store(REPLACE_OPCODE, key, value, flags, expiry, cas)
    }

    pub fn delete<K: AsRef<[u8]>>(key: K, cas: u64) -> Self {
        let mut packet = Packet::request(DELETE_OPCODE, key, b"", b"");
        packet.header.cas = cas;
        packet
    }

    pub fn append<K: AsRef<[u8]>, V: AsRef<[u8]>>(key: K, value: V, cas: u64) -> Self {
        let mut packet = Packet::request(APPEND_OPCODE, key, b"", value);
        packet.header.cas = cas;
        packet
    }

    pub fn prepend<K: AsRef<[u8]>, V: AsRef<[u8]>>(key: K, value: V, cas: u64) -> Self {
        let mut packet = Packet::request(PREPEND_OPCODE, key, b"", value);
        packet.header.cas = cas;
        packet
    }

    fn counter<K: AsRef<[u8]>>(opcode: u8, key: K, delta: u64, initial: u64, expiry: u32) -> Self {
        let extras = [
            &delta.to_be_bytes()[..],
            &initial.to_be_bytes()[..],
            &expiry.to_be_bytes()[..],
        ]
        .concat();
        Packet::request(opcode, key, extras, b"")
    }

    pub fn increment<K: AsRef<[u8]>>(key: K, delta: u64, initial: u64, expiry: u32) -> Self {
        Packet::counter(INCREMENT_OPCODE, key, delta, initial, expiry)
    }

    pub fn decrement<K: AsRef<[u8]>>(key: K, delta: u64, initial: u64, expiry: u32) -> Self {
        Packet::counter(DECREMENT_OPCODE, key, delta, initial, expiry)
    }

    /// Observe the durability state of keys. Each entry is a (vbucket, key)
    /// pair encoded into the request body.
    pub fn observe<K: AsRef<[u8]>>(entries: &[(u16, K)]) -> Self {
        let mut value = vec![];
        for (vbucket, key) in entries {
            let key = key.as_ref();
            value.extend_from_slice(&vbucket.to_be_bytes());
            value.extend_from_slice(&(key.len() as u16).to_be_bytes());
            value.extend_from_slice(key);
        }
        Packet::request(OBSERVE_OPCODE, b"", b"", value)
    }

    pub fn hello<K: AsRef<[u8]>>(connection_name: K, features: &[u16]) -> Self {
        let mut value = Vec::with_capacity(features.len() * 2);
        for feature in features {
            value.extend_from_slice(&feature.to_be_bytes());
        }
        Packet::request(HELLO_OPCODE, connection_name, b"", value)
    }

    pub fn error_map(version: u16) -> Self {
        Packet::request(ERROR_MAP_OPCODE, b"", b"", version.to_be_bytes())
    }

    pub fn sasl_list_mechs() -> Self {
        Packet::request(SASL_LIST_MECHS_OPCODE, b"", b"", b"")
    }

    pub fn sasl_auth<M: AsRef<[u8]>, V: AsRef<[u8]>>(mechanism: M, payload: V) -> Self {
        Packet::request(SASL_AUTH_OPCODE, mechanism, b"", payload)
    }

    pub fn sasl_step<M: AsRef<[u8]>, V: AsRef<[u8]>>(mechanism: M, payload: V) -> Self {
        Packet::request(SASL_STEP_OPCODE, mechanism, b"", payload)
    }

    pub fn select_bucket<K: AsRef<[u8]>>(bucket: K) -> Self {
        Packet::request(SELECT_BUCKET_OPCODE, bucket, b"", b"")
    }

    pub fn get_config() -> Self {
        Packet::request(GET_CONFIG_OPCODE, b"", b"", b"")
    }

    pub fn get_collections_manifest() -> Self {
        Packet::request(GET_COLLECTIONS_MANIFEST_OPCODE, b"", b"", b"")
    }

    /// Resolve a `scope.collection` path to its collection id.
    pub fn get_collection_id<P: AsRef<[u8]>>(path: P) -> Self {
        Packet::request(GET_COLLECTION_ID_OPCODE, b"", b"", path)
    }

    fn subdoc_lookup<K: AsRef<[u8]>, P: AsRef<[u8]>>(opcode: u8, key: K, path: P, flags: u8) -> Self {
        let path = path.as_ref();
        let extras = [
            &(path.len() as u16).to_be_bytes()[..],
            &flags.to_be_bytes()[..],
        ]
        .concat();
        Packet::request(opcode, key, extras, path)
    }

    pub fn subdoc_get<K: AsRef<[u8]>, P: AsRef<[u8]>>(key: K, path: P, flags: u8) -> Self {
        Packet::subdoc_lookup(SUBDOC_GET_OPCODE, key, path, flags)
    }

    pub fn subdoc_exists<K: AsRef<[u8]>, P: AsRef<[u8]>>(key: K, path: P, flags: u8) -> Self {
        Packet::subdoc_lookup(SUBDOC_EXISTS_OPCODE, key, path, flags)
    }

    pub fn status(&self) -> Status {
        Status::from(self.header.vbucket_or_status)
    }

    pub fn error_for_status(&self) -> Result<(), Status> {
        match self.header.vbucket_or_status {
            0 => Ok(()),
            it => Err(Status::from(it)),
        }
    }

    /// The mutation token carried in the extras of a mutation response when
    /// the channel negotiated mutation sequence numbers.
    pub fn mutation_token(&self) -> Option<(u64, u64)> {
        if self.extras.len() < 16 {
            return None;
        }
        let uuid = u64::from_be_bytes(self.extras[0..8].try_into().unwrap());
        let seqno = u64::from_be_bytes(self.extras[8..16].try_into().unwrap());
        Some((uuid, seqno))
    }
}

impl From<Packet> for Vec<u8> {
    fn from(mut p: Packet) -> Self {
        let framing_len = p.framing_extras.len();
        let raw_key_length = if framing_len > 0 {
            p.header.magic = match p.header.magic {
                MAGIC_RESPONSE_VALUE | MAGIC_ALT_RESPONSE_VALUE => MAGIC_ALT_RESPONSE_VALUE,
                _ => MAGIC_ALT_REQUEST_VALUE,
            };
            ((framing_len as u16) << 8) | (p.header.key_length & 0xff)
        } else {
            p.header.key_length
        };
        vec![
            &p.header.magic.to_be_bytes()[..],
            &p.header.opcode.to_be_bytes()[..],
            &raw_key_length.to_be_bytes()[..],
            &p.header.extras_length.to_be_bytes()[..],
            &p.header.data_type.to_be_bytes()[..],
            &p.header.vbucket_or_status.to_be_bytes()[..],
            &p.header.body_len.to_be_bytes()[..],
            &p.header.opaque.to_be_bytes()[..],
            &p.header.cas.to_be_bytes()[..],
            &p.framing_extras[..],
            &p.extras[..],
            &p.key[..],
            &p.value[..],
        ]
        .concat()
    }
}

#[cfg(test)]
mod tests {
    use super::{Header, Packet, ProtocolError};
    use crate::protocol::{MAGIC_RESPONSE_VALUE, SET_OPCODE};

    #[test]
    fn test_packet_identity() {
        let header = Header {
            magic: 0x80,
            opcode: 0x0,
            key_length: 0x5,
            framing_extras_length: 0x0,
            extras_length: 0x0,
            data_type: 0x0,
            vbucket_or_status: 0x0,
            body_len: 0x5,
            opaque: 0x0,
            cas: 0x0,
        };
        let expect_packet = Packet {
            header,
            framing_extras: vec![],
            extras: vec![],
            key: "Hello".into(),
            value: vec![],
        };
        let expect_bytes = vec![
            0x80, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x48, 0x65, 0x6c, 0x6c,
            0x6f,
        ];

        let packet_bytes: Vec<u8> = expect_packet.clone().into();
        assert_eq!(expect_bytes, packet_bytes);

        let actual_packet: Packet = header.read_packet(b"Hello").unwrap();
        assert_eq!(expect_packet, actual_packet);
    }

    #[test]
    fn test_store_extras_layout() {
        let packet = Packet::add(b"Hello", b"World", 0xdeadbeef, 0x1c20);
        let expect_bytes = vec![
            0x80, 0x02, 0x00, 0x05, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x12, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef,
            0x00, 0x00, 0x1c, 0x20, 0x48, 0x65, 0x6c, 0x6c, 0x6f, 0x57, 0x6f, 0x72, 0x6c, 0x64,
        ];

        let packet_bytes: Vec<u8> = packet.clone().into();
        assert_eq!(expect_bytes, packet_bytes);

        let body: Vec<u8> = vec![
            0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0x1c, 0x20, 0x48, 0x65, 0x6c, 0x6c, 0x6f, 0x57,
            0x6f, 0x72, 0x6c, 0x64,
        ];
        let actual_packet: Packet = packet.header.read_packet(&body).unwrap();
        assert_eq!(packet, actual_packet);
    }

    #[test]
    fn test_counter_extras_layout() {
        let packet = Packet::increment(b"counter", 1, 0, 0);
        assert_eq!(20, packet.extras.len());
        assert_eq!(&packet.extras[0..8], &1_u64.to_be_bytes());
        assert_eq!(&packet.extras[8..16], &0_u64.to_be_bytes());
        assert_eq!(&packet.extras[16..20], &0_u32.to_be_bytes());
    }

    #[test]
    fn test_hello_value() {
        let packet = Packet::hello(b"rsdc", &[0x0a, 0x12]);
        assert_eq!(b"rsdc".to_vec(), packet.key);
        assert_eq!(vec![0x00, 0x0a, 0x00, 0x12], packet.value);
    }

    #[test]
    fn test_response_round_trip() {
        let mut packet = Packet::request(SET_OPCODE, b"k", b"", b"");
        packet.header.magic = MAGIC_RESPONSE_VALUE;
        packet.header.vbucket_or_status = 0x0001;
        packet.header.opaque = 0xcafebabe;
        packet.header.cas = 42;

        let bytes: Vec<u8> = packet.clone().into();
        let header = Header::read_response(&bytes[..24]).unwrap();
        let decoded = header.read_packet(&bytes[24..]).unwrap();
        assert_eq!(packet, decoded);
        assert_eq!(0xcafebabe, decoded.header.opaque);
    }

    #[test]
    fn test_alt_framing_round_trip() {
        let mut packet = Packet::request(SET_OPCODE, b"k", b"", b"v");
        packet.header.magic = MAGIC_RESPONSE_VALUE;
        packet.framing_extras = vec![0x02, 0x00, 0x01];
        packet.header.framing_extras_length = 3;
        packet.header.body_len += 3;

        let bytes: Vec<u8> = packet.clone().into();
        assert_eq!(0x18, bytes[0]);
        // framing length in the high key byte, key length in the low byte
        assert_eq!(0x03, bytes[2]);
        assert_eq!(0x01, bytes[3]);

        let header = Header::read_response(&bytes[..24]).unwrap();
        assert_eq!(3, header.framing_extras_length);
        assert_eq!(1, header.key_length);
        let decoded = header.read_packet(&bytes[24..]).unwrap();
        assert_eq!(vec![0x02, 0x00, 0x01], decoded.framing_extras);
        assert_eq!(b"k".to_vec(), decoded.key);
        assert_eq!(b"v".to_vec(), decoded.value);
    }

    #[test]
    fn test_subdoc_lookup_layout() {
        let packet = Packet::subdoc_get(b"doc", "/a/b", 0x04);
        // path length, then per-path flags
        assert_eq!(vec![0x00, 0x04, 0x04], packet.extras);
        assert_eq!(b"doc".to_vec(), packet.key);
        assert_eq!(b"/a/b".to_vec(), packet.value);

        let exists = Packet::subdoc_exists(b"doc", "/a", 0);
        assert_eq!(vec![0x00, 0x02, 0x00], exists.extras);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = vec![0_u8; 24];
        bytes[0] = 0x08;
        assert_eq!(
            Err(ProtocolError::InvalidMagic(0x08)),
            Header::read_response(&bytes)
        );
    }

    #[test]
    fn test_body_size_mismatch() {
        let packet = Packet::get(b"key");
        assert_eq!(
            Err(ProtocolError::BodySizeMismatch),
            packet.header.read_packet(b"a")
        );
    }

    #[test]
    fn test_mutation_token_extraction() {
        let mut packet = Packet::request(SET_OPCODE, b"", b"", b"");
        assert_eq!(None, packet.mutation_token());
        packet.extras = [7_u64.to_be_bytes(), 11_u64.to_be_bytes()].concat();
        assert_eq!(Some((7, 11)), packet.mutation_token());
    }
}
