//! Diffie-Hellman key exchange session over the RFC 3526 MODP groups.
//!
//! The owner side constructs the session before sending its exchange
//! parameter; the device side constructs it with the owner's parameter
//! (`xA`) already known. Whichever side learns the peer parameter second
//! derives the session keys at that point.

use ciborium::value::Value;
use openssl::bn::{BigNum, BigNumContext};
use rand::{CryptoRng, RngCore};
use zeroize::Zeroize;

use super::{kdf, KexSuite, SessionKeys};
use crate::cbor;
use crate::crypto::CipherSuite;
use crate::error::CryptoError;

/// RFC 3526 group 14 (2048-bit MODP) prime.
const MODP_2048_PRIME: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF6955817183995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// RFC 3526 group 15 (3072-bit MODP) prime.
const MODP_3072_PRIME: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF6955817183995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E208E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

const GENERATOR: u32 = 2;

fn group_prime(suite: KexSuite) -> Result<BigNum, CryptoError> {
    let hex = match suite {
        KexSuite::DhKexId14 => MODP_2048_PRIME,
        KexSuite::DhKexId15 => MODP_3072_PRIME,
    };
    Ok(BigNum::from_hex_str(hex)?)
}

/// A Diffie-Hellman key exchange session.
///
/// Serializable as CBOR (§ [`DhSession::to_cbor`]) so an interrupted
/// onboarding attempt can be resumed across process restarts.
pub struct DhSession {
    prime: BigNum,
    generator: u32,
    param_size: usize,

    // Exchange state, named for the two protocol roles: `a`/`xa` are the
    // owner-side secret and parameter, `b`/`xb` the device-side pair.
    a: Option<BigNum>,
    xa: Option<BigNum>,
    b: Option<BigNum>,
    xb: Option<BigNum>,

    cipher: CipherSuite,
    keys: Option<SessionKeys>,
}

impl DhSession {
    /// Create a session for `suite`. The device passes the owner's exchange
    /// parameter as `peer_xa`; the owner passes `None` and later injects the
    /// device parameter with [`set_peer_parameter`](Self::set_peer_parameter).
    pub fn new(
        suite: KexSuite,
        cipher: CipherSuite,
        peer_xa: Option<&[u8]>,
    ) -> Result<Self, CryptoError> {
        let prime = group_prime(suite)?;
        let xa = match peer_xa {
            Some(bytes) => Some(check_parameter(bytes, &prime)?),
            None => None,
        };
        Ok(Self {
            prime,
            generator: GENERATOR,
            param_size: suite.param_size(),
            a: None,
            xa,
            b: None,
            xb: None,
            cipher,
            keys: None,
        })
    }

    /// Generate the exchange parameter `g^x mod p` to send to the peer,
    /// drawing a fresh random exponent.
    ///
    /// When the peer's parameter is already known (device side), the session
    /// keys are derived immediately; otherwise only the local secret is
    /// stored until [`set_peer_parameter`](Self::set_peer_parameter).
    pub fn generate_parameter<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut raw = vec![0u8; self.param_size];
        rng.try_fill_bytes(&mut raw)
            .map_err(|e| CryptoError::Rng(e.to_string()))?;
        let x = BigNum::from_slice(&raw)?;
        raw.zeroize();

        let g = BigNum::from_u32(self.generator)?;
        let mut ctx = BigNumContext::new()?;
        let mut public = BigNum::new()?;
        public.mod_exp(&g, &x, &self.prime, &mut ctx)?;
        let out = public.to_vec();

        match self.xa.take() {
            None => {
                self.a = Some(x);
                self.xa = Some(public);
            }
            Some(xa) => {
                self.keys = Some(derive_keys(&xa, &x, &self.prime, self.cipher)?);
                self.b = Some(x);
                self.xa = Some(xa);
                self.xb = Some(public);
            }
        }
        Ok(out)
    }

    /// Inject the peer's exchange parameter and derive the session keys from
    /// the stored local secret.
    pub fn set_peer_parameter(&mut self, xb: &[u8]) -> Result<(), CryptoError> {
        let peer = check_parameter(xb, &self.prime)?;
        let own = self
            .a
            .as_ref()
            .ok_or_else(|| CryptoError::KdfFailed("no local secret: generate_parameter not called".into()))?;
        self.keys = Some(derive_keys(&peer, own, &self.prime, self.cipher)?);
        self.xb = Some(peer);
        Ok(())
    }

    /// The derived session keys, once both exchange parameters are known.
    pub fn keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    pub fn cipher(&self) -> CipherSuite {
        self.cipher
    }

    /// Serialize the full exchange state, eliding absent fields.
    pub fn to_cbor(&self) -> Result<Vec<u8>, CryptoError> {
        let opt = |bn: &Option<BigNum>| {
            Value::Bytes(bn.as_ref().map(|b| b.to_vec()).unwrap_or_default())
        };
        let (sek, svk) = match &self.keys {
            Some(k) => (k.sek.clone(), k.svk.clone()),
            None => (Vec::new(), Vec::new()),
        };
        let value = Value::Array(vec![
            Value::Bytes(self.prime.to_vec()),
            Value::Integer(self.generator.into()),
            Value::Integer((self.param_size as u64).into()),
            opt(&self.a),
            opt(&self.xa),
            opt(&self.b),
            opt(&self.xb),
            Value::Integer(self.cipher.id().into()),
            Value::Bytes(sek),
            Value::Bytes(svk),
        ]);
        cbor::to_vec(&value).map_err(|e| CryptoError::Persist(e.to_string()))
    }

    /// Restore a session from its serialized form.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, CryptoError> {
        let value = cbor::from_slice(bytes).map_err(|e| CryptoError::Persist(e.to_string()))?;
        let mut items = cbor::array_of(value, 10, "key exchange session")
            .map_err(|e| CryptoError::Persist(e.to_string()))?;

        let field = |v: Value, name: &'static str| {
            cbor::bytes(v, name).map_err(|e| CryptoError::Persist(e.to_string()))
        };
        let opt_bn = |b: Vec<u8>| -> Result<Option<BigNum>, CryptoError> {
            if b.is_empty() {
                Ok(None)
            } else {
                Ok(Some(BigNum::from_slice(&b)?))
            }
        };

        let svk = field(items.remove(9), "svk")?;
        let sek = field(items.remove(8), "sek")?;
        let cipher = CipherSuite::from_i64(
            cbor::int(&items[7], "cipher id").map_err(|e| CryptoError::Persist(e.to_string()))?,
        )?;
        let xb = opt_bn(field(items.remove(6), "xB")?)?;
        let b = opt_bn(field(items.remove(5), "b")?)?;
        let xa = opt_bn(field(items.remove(4), "xA")?)?;
        let a = opt_bn(field(items.remove(3), "a")?)?;
        let param_size = cbor::uint(&items[2], "param size")
            .map_err(|e| CryptoError::Persist(e.to_string()))? as usize;
        let generator = cbor::uint(&items[1], "generator")
            .map_err(|e| CryptoError::Persist(e.to_string()))? as u32;
        let prime = BigNum::from_slice(&field(items.remove(0), "prime")?)?;

        let keys = if sek.is_empty() {
            None
        } else {
            Some(SessionKeys { sek, svk })
        };
        Ok(Self {
            prime,
            generator,
            param_size,
            a,
            xa,
            b,
            xb,
            cipher,
            keys,
        })
    }
}

fn check_parameter(bytes: &[u8], prime: &BigNum) -> Result<BigNum, CryptoError> {
    let limit = prime.num_bytes() as usize;
    if bytes.is_empty() || bytes.len() > limit {
        return Err(CryptoError::ParameterLength {
            actual: bytes.len(),
            limit,
        });
    }
    Ok(BigNum::from_slice(bytes)?)
}

/// Shared secret `peer^own mod p` expanded through the suite KDF into
/// `sek || svk`.
fn derive_keys(
    peer: &BigNum,
    own: &BigNum,
    prime: &BigNum,
    cipher: CipherSuite,
) -> Result<SessionKeys, CryptoError> {
    let mut ctx = BigNumContext::new()?;
    let mut shared = BigNum::new()?;
    shared.mod_exp(peer, own, prime, &mut ctx)?;
    let mut secret = shared.to_vec();

    let sek_len = cipher.sek_len();
    let svk_len = cipher.svk_len();
    let derived = kdf(cipher.prf(), &secret, &[], (sek_len + svk_len) * 8);
    secret.zeroize();
    let mut derived = derived?;

    let svk = derived[sek_len..].to_vec();
    derived.truncate(sek_len);
    Ok(SessionKeys { sek: derived, svk })
}
