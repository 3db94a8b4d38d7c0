//! Signature and MAC algorithm tables, cipher suites, and the narrow
//! capability traits the protocol consumes for device key material.

pub mod cose;

use ciborium::value::Value;
use hmac::{Hmac, Mac};
use openssl::ec::EcKey;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Padding;
use openssl::sign::RsaPssSaltlen;
use sha2::{Sha256, Sha384};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cbor;
use crate::error::{CryptoError, ProtocolError};
use crate::model::{Hash, HashAlg, KeyType, PublicKey};

/// COSE signature algorithm identifiers supported by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum SigAlg {
    ES256 = -7,
    ES384 = -35,
    PS256 = -37,
    PS384 = -38,
    RS256 = -257,
    RS384 = -258,
}

impl SigAlg {
    pub fn from_i64(v: i64) -> Result<Self, CryptoError> {
        match v {
            -7 => Ok(Self::ES256),
            -35 => Ok(Self::ES384),
            -37 => Ok(Self::PS256),
            -38 => Ok(Self::PS384),
            -257 => Ok(Self::RS256),
            -258 => Ok(Self::RS384),
            other => Err(CryptoError::UnsupportedAlgorithm(other)),
        }
    }

    pub const fn id(self) -> i64 {
        self as i64
    }

    pub fn digest(self) -> MessageDigest {
        match self {
            Self::ES256 | Self::PS256 | Self::RS256 => MessageDigest::sha256(),
            Self::ES384 | Self::PS384 | Self::RS384 => MessageDigest::sha384(),
        }
    }

    pub const fn is_pss(self) -> bool {
        matches!(self, Self::PS256 | Self::PS384)
    }

    pub const fn is_ec(self) -> bool {
        matches!(self, Self::ES256 | Self::ES384)
    }
}

/// eASigInfo/eBSigInfo: `[sgType, Info]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigInfo {
    pub alg: SigAlg,
    pub info: Vec<u8>,
}

impl SigInfo {
    pub fn new(alg: SigAlg) -> Self {
        Self {
            alg,
            info: Vec::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Integer(self.alg.id().into()),
            Value::Bytes(self.info.clone()),
        ])
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut items = cbor::array_of(value, 2, "sig info")?;
        let info = cbor::bytes(items.remove(1), "sig info body")?;
        let alg = SigAlg::from_i64(cbor::int(&items[0], "sig info type")?).map_err(|_| {
            ProtocolError::Malformed {
                context: "sig info type",
                reason: "unsupported signature algorithm".into(),
            }
        })?;
        Ok(Self { alg, info })
    }
}

/// FDO cipher suites negotiated in HelloDevice.
///
/// GCM suites carry the MAC inside the AEAD (no SVK); the CBC composites
/// split the derived keying material into an encrypt key and an HMAC key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    A128Gcm,
    A256Gcm,
    Aes128CbcHmacSha256,
    Aes256CbcHmacSha384,
}

impl CipherSuite {
    pub const fn id(self) -> i64 {
        match self {
            Self::A128Gcm => 1,
            Self::A256Gcm => 3,
            Self::Aes128CbcHmacSha256 => -17760703,
            Self::Aes256CbcHmacSha384 => -17760705,
        }
    }

    pub fn from_i64(v: i64) -> Result<Self, CryptoError> {
        match v {
            1 => Ok(Self::A128Gcm),
            3 => Ok(Self::A256Gcm),
            -17760703 => Ok(Self::Aes128CbcHmacSha256),
            -17760705 => Ok(Self::Aes256CbcHmacSha384),
            other => Err(CryptoError::UnsupportedAlgorithm(other)),
        }
    }

    /// Session encrypt key length in bytes.
    pub const fn sek_len(self) -> usize {
        match self {
            Self::A128Gcm | Self::Aes128CbcHmacSha256 => 16,
            Self::A256Gcm | Self::Aes256CbcHmacSha384 => 32,
        }
    }

    /// Session verify (MAC) key length in bytes; zero for AEAD suites.
    pub const fn svk_len(self) -> usize {
        match self {
            Self::A128Gcm | Self::A256Gcm => 0,
            Self::Aes128CbcHmacSha256 => 32,
            Self::Aes256CbcHmacSha384 => 64,
        }
    }

    /// PRF hash feeding the key derivation function.
    pub const fn prf(self) -> HashAlg {
        match self {
            Self::A128Gcm | Self::Aes128CbcHmacSha256 => HashAlg::HmacSha256,
            Self::A256Gcm | Self::Aes256CbcHmacSha384 => HashAlg::HmacSha384,
        }
    }

    /// Relative strength for strongest-mutually-supported selection.
    const fn rank(self) -> u8 {
        match self {
            Self::Aes128CbcHmacSha256 => 0,
            Self::A128Gcm => 1,
            Self::Aes256CbcHmacSha384 => 2,
            Self::A256Gcm => 3,
        }
    }

    /// Pick the strongest suite from a supported set.
    pub fn strongest(supported: &[CipherSuite]) -> Option<CipherSuite> {
        supported.iter().copied().max_by_key(|s| s.rank())
    }
}

/// Capability interface over the device signing key.
///
/// Implementations may back onto software keys, a TPM, or an HSM; they must
/// be safe for sequential use by a single protocol run. `sign` receives the
/// full to-be-signed bytes and hashes internally with the signer's digest.
pub trait Signer: Send + Sync {
    /// The COSE algorithm this signer produces.
    fn alg(&self) -> SigAlg;

    /// Sign `data`, returning a COSE-format signature (raw `r || s` for EC).
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// The public half, as an FDO public key.
    fn public_key(&self) -> Result<PublicKey, CryptoError>;

    fn supports(&self, alg: SigAlg) -> bool {
        alg == self.alg()
    }
}

/// Capability interface over the device HMAC secret.
pub trait HmacProvider: Send + Sync {
    fn hmac(&self, alg: HashAlg, data: &[u8]) -> Result<Hash, CryptoError>;

    fn supports(&self, alg: HashAlg) -> bool;
}

/// Software signer over an openssl private key.
pub struct SoftwareSigner {
    key: PKey<Private>,
    alg: SigAlg,
    key_type: KeyType,
}

impl SoftwareSigner {
    /// Wrap an EC private key; the curve determines ES256 vs ES384.
    pub fn ec(key: EcKey<Private>) -> Result<Self, CryptoError> {
        let (alg, key_type) = match key.group().curve_name() {
            Some(Nid::X9_62_PRIME256V1) => (SigAlg::ES256, KeyType::Secp256r1),
            Some(Nid::SECP384R1) => (SigAlg::ES384, KeyType::Secp384r1),
            _ => return Err(CryptoError::UnsupportedKey("EC key has unsupported curve")),
        };
        Ok(Self {
            key: PKey::from_ec_key(key)?,
            alg,
            key_type,
        })
    }

    /// Wrap an RSA private key, selecting PSS or PKCS#1 v1.5 signatures.
    pub fn rsa(key: openssl::rsa::Rsa<Private>, pss: bool) -> Result<Self, CryptoError> {
        let (alg, key_type) = if pss {
            (SigAlg::PS256, KeyType::RsaPss)
        } else {
            (SigAlg::RS256, KeyType::RsaPkcs)
        };
        Ok(Self {
            key: PKey::from_rsa(key)?,
            alg,
            key_type,
        })
    }
}

impl Signer for SoftwareSigner {
    fn alg(&self) -> SigAlg {
        self.alg
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.alg.is_ec() {
            let ec = self.key.ec_key()?;
            let digest = openssl::hash::hash(self.alg.digest(), data)?;
            let sig = openssl::ecdsa::EcdsaSig::sign(&digest, &ec)?;
            let coord = ((ec.group().degree() + 7) / 8) as i32;
            let mut raw = sig.r().to_vec_padded(coord)?;
            raw.extend_from_slice(&sig.s().to_vec_padded(coord)?);
            Ok(raw)
        } else {
            let mut signer = openssl::sign::Signer::new(self.alg.digest(), &self.key)?;
            if self.alg.is_pss() {
                signer.set_rsa_padding(Padding::PKCS1_PSS)?;
                signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
            }
            Ok(signer.sign_oneshot_to_vec(data)?)
        }
    }

    fn public_key(&self) -> Result<PublicKey, CryptoError> {
        let public: PKey<Public> = PKey::public_key_from_der(&self.key.public_key_to_der()?)?;
        PublicKey::from_pkey(self.key_type, &public)
    }
}

/// Software HMAC provider over an in-memory secret. The secret is wiped on
/// drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SoftwareHmac {
    secret: Vec<u8>,
}

impl SoftwareHmac {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }
}

impl HmacProvider for SoftwareHmac {
    fn hmac(&self, alg: HashAlg, data: &[u8]) -> Result<Hash, CryptoError> {
        let value = match alg {
            HashAlg::HmacSha256 => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.secret)
                    .map_err(|e| CryptoError::KdfFailed(e.to_string()))?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            HashAlg::HmacSha384 => {
                let mut mac = <Hmac<Sha384> as Mac>::new_from_slice(&self.secret)
                    .map_err(|e| CryptoError::KdfFailed(e.to_string()))?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            other => return Err(CryptoError::UnsupportedAlgorithm(other.id())),
        };
        Ok(Hash { alg, value })
    }

    fn supports(&self, alg: HashAlg) -> bool {
        alg.is_hmac()
    }
}
