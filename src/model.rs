//! Core protocol data model: identifiers, nonces, tagged hashes, and the
//! public-key union shared by the voucher and the TO2 driver.

use std::fmt;

use ciborium::value::Value;
use openssl::pkey::{PKey, Public};
use openssl::x509::X509;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha384};

use crate::cbor;
use crate::error::{CryptoError, ProtocolError};

/// 16-byte opaque device identifier.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Bytes(self.0.to_vec())
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        Ok(Self(cbor::fixed_bytes(value, "GUID")?))
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", hex::encode(self.0))
    }
}

/// 16-byte random challenge, sent in one direction and expected verbatim back.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Nonce(pub [u8; 16]);

impl Nonce {
    /// Draw a fresh nonce from the thread RNG.
    pub fn generate() -> Self {
        let mut n = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut n);
        Self(n)
    }

    pub fn to_value(&self) -> Value {
        Value::Bytes(self.0.to_vec())
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        Ok(Self(cbor::fixed_bytes(value, "nonce")?))
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", hex::encode(self.0))
    }
}

/// COSE hash and HMAC algorithm identifiers used by FDO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum HashAlg {
    Sha256 = -16,
    Sha384 = -43,
    HmacSha256 = 5,
    HmacSha384 = 6,
}

impl HashAlg {
    pub fn from_i64(v: i64) -> Result<Self, ProtocolError> {
        match v {
            -16 => Ok(Self::Sha256),
            -43 => Ok(Self::Sha384),
            5 => Ok(Self::HmacSha256),
            6 => Ok(Self::HmacSha384),
            other => Err(ProtocolError::Malformed {
                context: "hash algorithm",
                reason: format!("unknown algorithm id {other}"),
            }),
        }
    }

    pub const fn id(self) -> i64 {
        self as i64
    }

    /// Digest (or MAC output) length in bytes.
    pub const fn digest_len(self) -> usize {
        match self {
            Self::Sha256 | Self::HmacSha256 => 32,
            Self::Sha384 | Self::HmacSha384 => 48,
        }
    }

    pub const fn is_hmac(self) -> bool {
        matches!(self, Self::HmacSha256 | Self::HmacSha384)
    }
}

/// Tagged `(algorithm, digest)` pair; used for both plain hashes and HMACs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hash {
    pub alg: HashAlg,
    pub value: Vec<u8>,
}

impl Hash {
    /// Compute a plain digest over `data`. `alg` must not be an HMAC variant.
    pub fn of(alg: HashAlg, data: &[u8]) -> Self {
        let value = match alg {
            HashAlg::Sha256 | HashAlg::HmacSha256 => Sha256::digest(data).to_vec(),
            HashAlg::Sha384 | HashAlg::HmacSha384 => Sha384::digest(data).to_vec(),
        };
        Self { alg, value }
    }

    /// Constant-time comparison of the digest bytes.
    pub fn matches(&self, other: &Hash) -> bool {
        self.alg == other.alg
            && self.value.len() == other.value.len()
            && openssl::memcmp::eq(&self.value, &other.value)
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Integer(self.alg.id().into()),
            Value::Bytes(self.value.clone()),
        ])
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut items = cbor::array_of(value, 2, "hash")?;
        let digest = cbor::bytes(items.remove(1), "hash digest")?;
        let alg = HashAlg::from_i64(cbor::int(&items[0], "hash algorithm")?)?;
        Ok(Self { alg, value: digest })
    }
}

/// FDO public key type discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyType {
    Rsa2048Restr = 1,
    RsaPkcs = 5,
    RsaPss = 6,
    Secp256r1 = 10,
    Secp384r1 = 11,
}

impl KeyType {
    pub fn from_u64(v: u64) -> Result<Self, ProtocolError> {
        match v {
            1 => Ok(Self::Rsa2048Restr),
            5 => Ok(Self::RsaPkcs),
            6 => Ok(Self::RsaPss),
            10 => Ok(Self::Secp256r1),
            11 => Ok(Self::Secp384r1),
            other => Err(ProtocolError::Malformed {
                context: "public key type",
                reason: format!("unknown key type {other}"),
            }),
        }
    }

    /// RSA-PSS keys require PSS padding when verifying signatures.
    pub const fn uses_pss(self) -> bool {
        matches!(self, Self::RsaPss)
    }
}

/// FDO public key encoding discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyEncoding {
    X509 = 1,
    X5Chain = 2,
    Cose = 3,
}

impl KeyEncoding {
    pub fn from_u64(v: u64) -> Result<Self, ProtocolError> {
        match v {
            1 => Ok(Self::X509),
            2 => Ok(Self::X5Chain),
            3 => Ok(Self::Cose),
            other => Err(ProtocolError::Malformed {
                context: "public key encoding",
                reason: format!("unknown key encoding {other}"),
            }),
        }
    }
}

/// Tagged public key union: `[key_type, encoding, body]`.
///
/// The body layout depends on the encoding: a DER SubjectPublicKeyInfo byte
/// string for X509, an array of DER certificates for X5CHAIN (the leaf is
/// taken), or a COSE_Key map (EC2 only).
#[derive(Debug, Clone, PartialEq)]
pub struct PublicKey {
    pub key_type: KeyType,
    pub encoding: KeyEncoding,
    pub body: Value,
}

impl PublicKey {
    /// Wrap an openssl key as an X509-encoded FDO public key.
    pub fn from_pkey(key_type: KeyType, key: &PKey<Public>) -> Result<Self, CryptoError> {
        let der = key.public_key_to_der()?;
        Ok(Self {
            key_type,
            encoding: KeyEncoding::X509,
            body: Value::Bytes(der),
        })
    }

    /// Parse into an openssl key for signature verification.
    pub fn public(&self) -> Result<PKey<Public>, CryptoError> {
        match self.encoding {
            KeyEncoding::X509 => {
                let der = match &self.body {
                    Value::Bytes(b) => b.as_slice(),
                    _ => return Err(CryptoError::UnsupportedKey("X509 body is not a byte string")),
                };
                Ok(PKey::public_key_from_der(der)?)
            }
            KeyEncoding::X5Chain => {
                let certs = match &self.body {
                    Value::Array(items) => items,
                    _ => return Err(CryptoError::UnsupportedKey("X5CHAIN body is not an array")),
                };
                let leaf = match certs.first() {
                    Some(Value::Bytes(der)) => X509::from_der(der)?,
                    _ => return Err(CryptoError::UnsupportedKey("X5CHAIN has no leaf certificate")),
                };
                Ok(leaf.public_key()?)
            }
            KeyEncoding::Cose => cose_key_to_pkey(&self.body),
        }
    }

    /// Canonical equality: compares the parsed keys, not their encodings.
    pub fn equals(&self, other: &PublicKey) -> bool {
        match (self.public(), other.public()) {
            (Ok(a), Ok(b)) => a.public_eq(&b),
            _ => false,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Integer((self.key_type as u8).into()),
            Value::Integer((self.encoding as u8).into()),
            self.body.clone(),
        ])
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut items = cbor::array_of(value, 3, "public key")?;
        let body = items.remove(2);
        let encoding = KeyEncoding::from_u64(cbor::uint(&items[1], "public key encoding")?)?;
        let key_type = KeyType::from_u64(cbor::uint(&items[0], "public key type")?)?;
        Ok(Self {
            key_type,
            encoding,
            body,
        })
    }
}

/// Parse a COSE_Key map holding an EC2 key (P-256 or P-384).
fn cose_key_to_pkey(body: &Value) -> Result<PKey<Public>, CryptoError> {
    use openssl::bn::BigNum;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::nid::Nid;

    let entries = match body {
        Value::Map(m) => m,
        _ => return Err(CryptoError::UnsupportedKey("COSE key body is not a map")),
    };
    let find = |label: i64| {
        entries
            .iter()
            .find(|(k, _)| matches!(k, Value::Integer(i) if i128::from(*i) == i128::from(label)))
            .map(|(_, v)| v)
    };

    // kty(1) must be EC2(2); crv(-1), x(-2), y(-3).
    match find(1) {
        Some(Value::Integer(i)) if i128::from(*i) == 2 => {}
        _ => return Err(CryptoError::UnsupportedKey("COSE key is not EC2")),
    }
    let nid = match find(-1) {
        Some(Value::Integer(i)) if i128::from(*i) == 1 => Nid::X9_62_PRIME256V1,
        Some(Value::Integer(i)) if i128::from(*i) == 2 => Nid::SECP384R1,
        _ => return Err(CryptoError::UnsupportedKey("COSE key has unsupported curve")),
    };
    let (x, y) = match (find(-2), find(-3)) {
        (Some(Value::Bytes(x)), Some(Value::Bytes(y))) => (x, y),
        _ => return Err(CryptoError::UnsupportedKey("COSE key missing coordinates")),
    };

    let group = EcGroup::from_curve_name(nid)?;
    let x = BigNum::from_slice(x)?;
    let y = BigNum::from_slice(y)?;
    let ec = EcKey::from_public_key_affine_coordinates(&group, &x, &y)?;
    Ok(PKey::from_ec_key(ec)?)
}

/// Rendezvous instructions, carried verbatim and never interpreted by TO2.
#[derive(Debug, Clone, PartialEq)]
pub struct RendezvousInfo(pub Value);

impl RendezvousInfo {
    pub fn empty() -> Self {
        Self(Value::Array(Vec::new()))
    }

    pub fn to_value(&self) -> Value {
        self.0.clone()
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            v @ Value::Array(_) => Ok(Self(v)),
            _ => Err(ProtocolError::Malformed {
                context: "rendezvous info",
                reason: "expected array".into(),
            }),
        }
    }
}

/// Payload of the reserved Error(255) message.
#[derive(Debug, Clone)]
pub struct ErrorMessage {
    pub code: u16,
    pub prev_msg_type: u8,
    pub message: String,
    pub timestamp: Option<u64>,
    pub correlation_id: Option<u64>,
}

impl ErrorMessage {
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut items = cbor::array(value, "error message")?;
        if items.len() < 3 {
            return Err(ProtocolError::Malformed {
                context: "error message",
                reason: format!("expected at least 3 elements, got {}", items.len()),
            });
        }
        let correlation_id = match items.get(4) {
            Some(Value::Integer(_)) => Some(cbor::uint(&items[4], "error correlation id")?),
            _ => None,
        };
        let timestamp = match items.get(3) {
            Some(Value::Integer(_)) => Some(cbor::uint(&items[3], "error timestamp")?),
            _ => None,
        };
        let message = cbor::text(items.remove(2), "error string")?;
        let prev_msg_type = cbor::uint(&items[1], "error previous message type")? as u8;
        let code = cbor::uint(&items[0], "error code")? as u16;
        Ok(Self {
            code,
            prev_msg_type,
            message,
            timestamp,
            correlation_id,
        })
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Integer(self.code.into()),
            Value::Integer(self.prev_msg_type.into()),
            Value::Text(self.message.clone()),
            self.timestamp
                .map(|t| Value::Integer(t.into()))
                .unwrap_or(Value::Null),
            self.correlation_id
                .map(|c| Value::Integer(c.into()))
                .unwrap_or(Value::Null),
        ])
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "code {} (in response to message {}): {}",
            self.code, self.prev_msg_type, self.message
        )
    }
}
