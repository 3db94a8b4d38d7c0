//! Key exchange: suite registry, the FDO key derivation function, and the
//! Diffie-Hellman session in [`dh`].

pub mod dh;

pub use dh::DhSession;

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::model::HashAlg;

/// Key exchange suites this client implements. Both are finite-field DH
/// with generator 2; they differ in group size and exchange-parameter size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexSuite {
    /// MODP-2048 group, 32-byte random exponent.
    DhKexId14,
    /// MODP-3072 group, 96-byte random exponent.
    DhKexId15,
}

impl KexSuite {
    pub fn from_name(name: &str) -> Result<Self, CryptoError> {
        match name {
            "DHKEXid14" => Ok(Self::DhKexId14),
            "DHKEXid15" => Ok(Self::DhKexId15),
            other => Err(CryptoError::UnknownSuite(other.to_string())),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::DhKexId14 => "DHKEXid14",
            Self::DhKexId15 => "DHKEXid15",
        }
    }

    pub const fn param_size(self) -> usize {
        match self {
            Self::DhKexId14 => 32,
            Self::DhKexId15 => 96,
        }
    }

    const fn rank(self) -> u8 {
        match self {
            Self::DhKexId14 => 0,
            Self::DhKexId15 => 1,
        }
    }

    /// Pick the strongest suite from a supported set.
    pub fn strongest(supported: &[KexSuite]) -> Option<KexSuite> {
        supported.iter().copied().max_by_key(|s| s.rank())
    }
}

/// Derived session keys. Secret material; wiped on drop and never logged.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub sek: Vec<u8>,
    pub svk: Vec<u8>,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes deliberately omitted.
        f.debug_struct("SessionKeys")
            .field("sek_len", &self.sek.len())
            .field("svk_len", &self.svk.len())
            .finish()
    }
}

/// SP 800-108 counter-mode KDF with the FDO label and context.
///
/// `K(i) = HMAC-prf(secret, i || "FIDO-KDF" || 0x00 || "AutomaticOnboardTunnel" || context || L)`
/// with `i` a one-byte counter and `L` the output size in bits, big-endian.
pub(crate) fn kdf(
    prf: HashAlg,
    secret: &[u8],
    context_rand: &[u8],
    size_bits: usize,
) -> Result<Vec<u8>, CryptoError> {
    let out_len = size_bits / 8;
    let block = prf.digest_len();
    let rounds = out_len.div_ceil(block);
    if rounds > u8::MAX as usize {
        return Err(CryptoError::KdfFailed("requested output too large".into()));
    }

    let mut out = Vec::with_capacity(rounds * block);
    for i in 1..=rounds as u8 {
        let mut input = Vec::with_capacity(1 + 8 + 1 + 22 + context_rand.len() + 2);
        input.push(i);
        input.extend_from_slice(b"FIDO-KDF");
        input.push(0u8);
        input.extend_from_slice(b"AutomaticOnboardTunnel");
        input.extend_from_slice(context_rand);
        input.extend_from_slice(&(size_bits as u16).to_be_bytes());

        let round = match prf {
            HashAlg::HmacSha256 => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret)
                    .map_err(|e| CryptoError::KdfFailed(e.to_string()))?;
                mac.update(&input);
                mac.finalize().into_bytes().to_vec()
            }
            HashAlg::HmacSha384 => {
                let mut mac = <Hmac<Sha384> as Mac>::new_from_slice(secret)
                    .map_err(|e| CryptoError::KdfFailed(e.to_string()))?;
                mac.update(&input);
                mac.finalize().into_bytes().to_vec()
            }
            other => return Err(CryptoError::UnsupportedAlgorithm(other.id())),
        };
        out.extend_from_slice(&round);
    }
    out.truncate(out_len);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_names_roundtrip() {
        for suite in [KexSuite::DhKexId14, KexSuite::DhKexId15] {
            assert_eq!(KexSuite::from_name(suite.name()).unwrap(), suite);
        }
        assert!(matches!(
            KexSuite::from_name("ECDH256"),
            Err(CryptoError::UnknownSuite(_))
        ));
    }

    #[test]
    fn strongest_prefers_larger_group() {
        assert_eq!(
            KexSuite::strongest(&[KexSuite::DhKexId14, KexSuite::DhKexId15]),
            Some(KexSuite::DhKexId15)
        );
    }

    #[test]
    fn kdf_output_sizes() {
        let secret = [0x5A; 32];
        // 16-byte SEK, no SVK (A128GCM).
        let k = kdf(HashAlg::HmacSha256, &secret, &[], 128).unwrap();
        assert_eq!(k.len(), 16);
        // 32 + 64 bytes (AES256/CBC/HMAC-SHA384) spans multiple rounds.
        let k = kdf(HashAlg::HmacSha384, &secret, &[], (32 + 64) * 8).unwrap();
        assert_eq!(k.len(), 96);
    }

    #[test]
    fn kdf_deterministic_and_keyed() {
        let a = kdf(HashAlg::HmacSha256, &[1; 32], &[], 256).unwrap();
        let b = kdf(HashAlg::HmacSha256, &[1; 32], &[], 256).unwrap();
        let c = kdf(HashAlg::HmacSha256, &[2; 32], &[], 256).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
