//! COSE_Sign1 construction and verification.
//!
//! Verification reconstructs the canonical `Sig_structure` via
//! [`CoseSign1::tbs_data`] with empty external AAD, hashes with the digest
//! named in the protected header, and checks the signature against an
//! openssl key. ECDSA signatures are the raw `r || s` concatenation COSE
//! mandates; RSA keys tagged PSS are verified with PSS padding.

use ciborium::value::Value;
use coset::{CborSerializable, CoseSign1, CoseSign1Builder, HeaderBuilder, TaggedCborSerializable};
use openssl::bn::BigNum;
use openssl::ecdsa::EcdsaSig;
use openssl::pkey::{PKey, Public};
use openssl::rsa::Padding;
use openssl::sign::RsaPssSaltlen;

use super::{SigAlg, Signer};
use crate::error::{CryptoError, ProtocolError};

fn to_iana(alg: SigAlg) -> coset::iana::Algorithm {
    match alg {
        SigAlg::ES256 => coset::iana::Algorithm::ES256,
        SigAlg::ES384 => coset::iana::Algorithm::ES384,
        SigAlg::PS256 => coset::iana::Algorithm::PS256,
        SigAlg::PS384 => coset::iana::Algorithm::PS384,
        SigAlg::RS256 => coset::iana::Algorithm::RS256,
        SigAlg::RS384 => coset::iana::Algorithm::RS384,
    }
}

/// Extract the signature algorithm from the protected header.
pub fn protected_alg(cose: &CoseSign1) -> Result<SigAlg, CryptoError> {
    match &cose.protected.header.alg {
        Some(coset::RegisteredLabelWithPrivate::Assigned(alg)) => SigAlg::from_i64(*alg as i64),
        Some(coset::RegisteredLabelWithPrivate::PrivateUse(v)) => Err(CryptoError::UnsupportedAlgorithm(*v)),
        _ => Err(CryptoError::VerifyFailed("COSE_Sign1 has no algorithm header")),
    }
}

/// Build and sign a tagged COSE_Sign1.
///
/// `unprotected` carries integer-labeled claims (e.g. the CUPH/EUPH nonce
/// labels) placed in the unprotected header.
pub fn sign1(
    signer: &dyn Signer,
    unprotected: Vec<(i64, Value)>,
    payload: Vec<u8>,
) -> Result<Vec<u8>, CryptoError> {
    let protected = HeaderBuilder::new().algorithm(to_iana(signer.alg())).build();
    let mut unprotected_builder = HeaderBuilder::new();
    for (label, value) in unprotected {
        unprotected_builder = unprotected_builder.value(label, value);
    }

    let cose = CoseSign1Builder::new()
        .protected(protected)
        .unprotected(unprotected_builder.build())
        .payload(payload)
        .try_create_signature(b"", |tbs| signer.sign(tbs))?
        .build();

    cose.to_tagged_vec()
        .map_err(|e| CryptoError::CoseEncode(e.to_string()))
}

/// Decode a COSE_Sign1 from tagged (tag 18) or untagged bytes.
pub fn decode(bytes: &[u8], context: &'static str) -> Result<CoseSign1, ProtocolError> {
    CoseSign1::from_tagged_slice(bytes)
        .or_else(|_| CoseSign1::from_slice(bytes))
        .map_err(|e| ProtocolError::Malformed {
            context,
            reason: format!("invalid COSE_Sign1: {e}"),
        })
}

/// Verify a COSE_Sign1 signature against a public key.
///
/// `pss` selects RSASSA-PSS padding for RSA keys (plumbed from the key's
/// FDO type tag). Returns `CryptoError::VerifyFailed` on any mismatch.
pub fn verify(cose: &CoseSign1, key: &PKey<Public>, pss: bool) -> Result<(), CryptoError> {
    let alg = protected_alg(cose)?;
    let tbs = cose.tbs_data(b"");

    if alg.is_ec() {
        let ec = key
            .ec_key()
            .map_err(|_| CryptoError::VerifyFailed("signature algorithm is ECDSA but key is not EC"))?;
        let coord = ((ec.group().degree() + 7) / 8) as usize;
        if cose.signature.len() != 2 * coord {
            return Err(CryptoError::VerifyFailed("ECDSA signature has invalid length"));
        }
        let r = BigNum::from_slice(&cose.signature[..coord])?;
        let s = BigNum::from_slice(&cose.signature[coord..])?;
        let sig = EcdsaSig::from_private_components(r, s)?;
        let digest = openssl::hash::hash(alg.digest(), &tbs)?;
        if !sig.verify(&digest, &ec)? {
            return Err(CryptoError::VerifyFailed("ECDSA signature verification failed"));
        }
    } else {
        let mut verifier = openssl::sign::Verifier::new(alg.digest(), key)?;
        if pss || alg.is_pss() {
            verifier.set_rsa_padding(Padding::PKCS1_PSS)?;
            verifier.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
        }
        if !verifier.verify_oneshot(&cose.signature, &tbs)? {
            return Err(CryptoError::VerifyFailed("RSA signature verification failed"));
        }
    }
    Ok(())
}

/// Look up an integer-labeled claim in the unprotected header.
pub fn unprotected_claim<'a>(cose: &'a CoseSign1, label: i64) -> Option<&'a Value> {
    cose.unprotected
        .rest
        .iter()
        .find(|(l, _)| matches!(l, coset::Label::Int(v) if *v == label))
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftwareSigner;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::nid::Nid;

    fn ec_signer(nid: Nid) -> SoftwareSigner {
        let group = EcGroup::from_curve_name(nid).unwrap();
        SoftwareSigner::ec(EcKey::generate(&group).unwrap()).unwrap()
    }

    fn public_of(signer: &SoftwareSigner) -> PKey<Public> {
        signer.public_key().unwrap().public().unwrap()
    }

    #[test]
    fn sign_verify_roundtrip_es256() {
        let signer = ec_signer(Nid::X9_62_PRIME256V1);
        let raw = sign1(&signer, vec![(256, Value::Bytes(vec![9; 16]))], b"payload".to_vec()).unwrap();

        let cose = decode(&raw, "test").unwrap();
        assert_eq!(cose.payload.as_deref(), Some(b"payload".as_ref()));
        assert_eq!(
            unprotected_claim(&cose, 256),
            Some(&Value::Bytes(vec![9; 16]))
        );
        verify(&cose, &public_of(&signer), false).unwrap();
    }

    #[test]
    fn sign_verify_roundtrip_es384() {
        let signer = ec_signer(Nid::SECP384R1);
        let raw = sign1(&signer, Vec::new(), b"p384 payload".to_vec()).unwrap();
        let cose = decode(&raw, "test").unwrap();
        verify(&cose, &public_of(&signer), false).unwrap();
    }

    #[test]
    fn sign_verify_roundtrip_rsa_pss() {
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let signer = SoftwareSigner::rsa(rsa, true).unwrap();
        let raw = sign1(&signer, Vec::new(), b"rsa payload".to_vec()).unwrap();
        let cose = decode(&raw, "test").unwrap();
        verify(&cose, &public_of(&signer), true).unwrap();
    }

    #[test]
    fn tampered_payload_rejected() {
        let signer = ec_signer(Nid::X9_62_PRIME256V1);
        let raw = sign1(&signer, Vec::new(), b"original".to_vec()).unwrap();
        let mut cose = decode(&raw, "test").unwrap();
        cose.payload = Some(b"tampered".to_vec());
        assert!(matches!(
            verify(&cose, &public_of(&signer), false),
            Err(CryptoError::VerifyFailed(_))
        ));
    }

    #[test]
    fn wrong_key_rejected() {
        let signer = ec_signer(Nid::X9_62_PRIME256V1);
        let other = ec_signer(Nid::X9_62_PRIME256V1);
        let raw = sign1(&signer, Vec::new(), b"payload".to_vec()).unwrap();
        let cose = decode(&raw, "test").unwrap();
        assert!(verify(&cose, &public_of(&other), false).is_err());
    }
}
