//! SASL authentication. The server advertises its mechanisms and the client
//! picks the strongest one it supports, preferring SCRAM over PLAIN and
//! allowing PLAIN only on channels already protected by TLS.

use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha512};

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SaslMechanism {
    Plain,
    ScramSha1,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha1 => "SCRAM-SHA1",
            SaslMechanism::ScramSha256 => "SCRAM-SHA256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA512",
        }
    }

    fn from_str(name: &str) -> Option<Self> {
        match name {
            "PLAIN" => Some(SaslMechanism::Plain),
            "SCRAM-SHA1" => Some(SaslMechanism::ScramSha1),
            "SCRAM-SHA256" => Some(SaslMechanism::ScramSha256),
            "SCRAM-SHA512" => Some(SaslMechanism::ScramSha512),
            _ => None,
        }
    }
}

/// Pick the strongest mechanism from a space-separated server list. PLAIN
/// sends the password in the clear, so it needs a TLS channel.
pub fn select_mechanism(server_mechs: &str, tls: bool) -> Option<SaslMechanism> {
    server_mechs
        .split_whitespace()
        .filter_map(SaslMechanism::from_str)
        .filter(|mech| tls || *mech != SaslMechanism::Plain)
        .max()
}

/// The `AUTH` payload for the PLAIN mechanism: `authzid \0 user \0 password`
/// with an empty authzid.
pub fn plain_payload(username: &str, password: &str) -> Vec<u8> {
    let mut payload = vec![0_u8];
    payload.extend_from_slice(username.as_bytes());
    payload.push(0);
    payload.extend_from_slice(password.as_bytes());
    payload
}

const GS2_HEADER: &str = "n,,";
// base64("n,,"), sent as the channel binding in the final message.
const CHANNEL_BINDING: &str = "c=biws";

/// A single-use SCRAM conversation: client-first, server-first, client-final
/// and the server signature check.
#[derive(Debug)]
pub struct ScramClient {
    mechanism: SaslMechanism,
    username: String,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    server_signature: Option<Vec<u8>>,
}

impl ScramClient {
    pub fn new(mechanism: SaslMechanism, username: &str, password: &str) -> Self {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Self::with_nonce(mechanism, username, password, nonce)
    }

    pub fn with_nonce(
        mechanism: SaslMechanism,
        username: &str,
        password: &str,
        client_nonce: String,
    ) -> Self {
        debug_assert!(mechanism != SaslMechanism::Plain);
        let client_first_bare = format!("n={},r={}", escape_username(username), client_nonce);
        Self {
            mechanism,
            username: username.to_string(),
            password: password.to_string(),
            client_nonce,
            client_first_bare,
            server_signature: None,
        }
    }

    pub fn mechanism(&self) -> SaslMechanism {
        self.mechanism
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// The payload of the initial AUTH request.
    pub fn client_first(&self) -> String {
        format!("{}{}", GS2_HEADER, self.client_first_bare)
    }

    /// Consume the server-first message and produce the client-final payload
    /// for the STEP request.
    pub fn handle_server_first(&mut self, server_first: &str) -> Result<String> {
        let server_nonce = field(server_first, 'r')?;
        let salt = field(server_first, 's')?;
        let iterations: u32 = field(server_first, 'i')?
            .parse()
            .map_err(|_| malformed("iteration count"))?;
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(malformed("server nonce does not extend the client nonce"));
        }
        let salt = base64::decode(salt).map_err(|_| malformed("salt"))?;

        let salted_password = hi(
            self.mechanism,
            self.password.as_bytes(),
            &salt,
            iterations,
        );
        let client_key = mac(self.mechanism, &salted_password, b"Client Key");
        let stored_key = hash(self.mechanism, &client_key);

        let without_proof = format!("{},r={}", CHANNEL_BINDING, server_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );
        let client_signature = mac(self.mechanism, &stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        let server_key = mac(self.mechanism, &salted_password, b"Server Key");
        self.server_signature = Some(mac(self.mechanism, &server_key, auth_message.as_bytes()));

        Ok(format!("{},p={}", without_proof, base64::encode(proof)))
    }

    /// Check the server's signature from the final message. A mismatch means
    /// the server never knew the password.
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        let expect = self
            .server_signature
            .as_ref()
            .ok_or_else(|| malformed("server-final before server-first"))?;
        let verifier = field(server_final, 'v')?;
        let verifier = base64::decode(verifier).map_err(|_| malformed("server signature"))?;
        if &verifier != expect {
            return Err(Error::new(ErrorKind::AuthenticationFailure));
        }
        Ok(())
    }
}

fn malformed(what: &str) -> Error {
    Error::new(ErrorKind::InvalidArgument(format!(
        "malformed SCRAM message: {}",
        what
    )))
}

fn field<'a>(message: &'a str, name: char) -> Result<&'a str> {
    message
        .split(',')
        .find_map(|part| {
            part.strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('='))
        })
        .ok_or_else(|| malformed("missing field"))
}

fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

pub(crate) fn mac(mechanism: SaslMechanism, key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    match mechanism {
        SaslMechanism::ScramSha1 | SaslMechanism::Plain => {
            let mut mac = Hmac::<Sha1>::new_from_slice(key).unwrap();
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        SaslMechanism::ScramSha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        SaslMechanism::ScramSha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(key).unwrap();
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

pub(crate) fn hash(mechanism: SaslMechanism, data: &[u8]) -> Vec<u8> {
    match mechanism {
        SaslMechanism::ScramSha1 | SaslMechanism::Plain => Sha1::digest(data).to_vec(),
        SaslMechanism::ScramSha256 => Sha256::digest(data).to_vec(),
        SaslMechanism::ScramSha512 => Sha512::digest(data).to_vec(),
    }
}

/// The `Hi` function of RFC 5802: PBKDF2 with HMAC as the PRF.
pub(crate) fn hi(mechanism: SaslMechanism, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1_u32.to_be_bytes());
    let mut u = mac(mechanism, password, &block);
    let mut result = u.clone();
    for _ in 1..iterations {
        u = mac(mechanism, password, &u);
        for (acc, byte) in result.iter_mut().zip(u.iter()) {
            *acc ^= byte;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mechanism_selection() {
        assert_eq!(
            Some(SaslMechanism::ScramSha512),
            select_mechanism("SCRAM-SHA512 SCRAM-SHA256 SCRAM-SHA1 PLAIN", false)
        );
        assert_eq!(
            Some(SaslMechanism::ScramSha256),
            select_mechanism("PLAIN SCRAM-SHA256", true)
        );
        // PLAIN only over TLS.
        assert_eq!(None, select_mechanism("PLAIN", false));
        assert_eq!(Some(SaslMechanism::Plain), select_mechanism("PLAIN", true));
        assert_eq!(None, select_mechanism("CRAM-MD5", true));
    }

    #[test]
    fn test_plain_payload() {
        assert_eq!(b"\0user\0pass".to_vec(), plain_payload("user", "pass"));
    }

    // The RFC 5802 example conversation, which pins the whole derivation
    // chain (Hi, keys, proof, server signature) for SCRAM-SHA1.
    #[test]
    fn test_rfc5802_vector() {
        let mut client = ScramClient::with_nonce(
            SaslMechanism::ScramSha1,
            "user",
            "pencil",
            "fyko+d2lbbFgONRv9qkxdawL".into(),
        );
        assert_eq!(
            "n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL",
            client.client_first()
        );

        let server_first =
            "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";
        let client_final = client.handle_server_first(server_first).unwrap();
        assert_eq!(
            "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts=",
            client_final
        );

        client
            .verify_server_final("v=rmF9pqV8S7suAoZWja4dJRkFsKQ=")
            .unwrap();
        assert!(client.verify_server_final("v=bm90IHRoZSBzZXJ2ZXI=").is_err());
    }

    #[test]
    fn test_rejects_foreign_nonce() {
        let mut client = ScramClient::with_nonce(
            SaslMechanism::ScramSha256,
            "user",
            "pencil",
            "abcdef".into(),
        );
        let err = client
            .handle_server_first("r=somebodyelse,s=QSXCR+Q6sek8bf92,i=4096")
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidArgument(_)));
    }

    #[test]
    fn test_username_escaping() {
        let client = ScramClient::with_nonce(
            SaslMechanism::ScramSha256,
            "odd=user,name",
            "pw",
            "nonce".into(),
        );
        assert_eq!("n,,n=odd=3Duser=2Cname,r=nonce", client.client_first());
    }
}
