//! Ownership voucher model and chain verification.
//!
//! A voucher is a chain of custody from the manufacturer to the current
//! owner: a header authenticated by the device's HMAC secret, followed by
//! COSE_Sign1 entries in which each signer hands the voucher to the next
//! owner's public key. Verification walks the chain carrying the current
//! signer key and previous-entry hash; the first entry is checked against
//! the manufacturer key from the header.

use std::sync::Arc;

use ciborium::value::Value;
use coset::CoseSign1;
use openssl::pkey::{PKey, Public};

use crate::cbor;
use crate::crypto::{cose, HmacProvider, Signer};
use crate::error::{ProtocolError, VoucherError};
use crate::model::{Guid, Hash, PublicKey, RendezvousInfo};

/// Ownership voucher header. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct VoucherHeader {
    pub version: u16,
    pub guid: Guid,
    pub rv_info: RendezvousInfo,
    pub device_info: String,
    pub manufacturer_key: PublicKey,
    pub cert_chain_hash: Option<Hash>,
}

impl VoucherHeader {
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Integer(self.version.into()),
            self.guid.to_value(),
            self.rv_info.to_value(),
            Value::Text(self.device_info.clone()),
            self.manufacturer_key.to_value(),
            self.cert_chain_hash
                .as_ref()
                .map(Hash::to_value)
                .unwrap_or(Value::Null),
        ])
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut items = cbor::array_of(value, 6, "voucher header")?;
        let cert_chain_hash = match items.remove(5) {
            Value::Null => None,
            v => Some(Hash::from_value(v)?),
        };
        let manufacturer_key = PublicKey::from_value(items.remove(4))?;
        let device_info = cbor::text(items.remove(3), "device info")?;
        let rv_info = RendezvousInfo::from_value(items.remove(2))?;
        let guid = Guid::from_value(items.remove(1))?;
        let version = cbor::uint(&items[0], "voucher version")? as u16;
        Ok(Self {
            version,
            guid,
            rv_info,
            device_info,
            manufacturer_key,
            cert_chain_hash,
        })
    }

    /// The CBOR encoding, as HMAC'd and hashed by the voucher invariants.
    pub fn to_vec(&self) -> Result<Vec<u8>, ProtocolError> {
        cbor::to_vec(&self.to_value())
    }
}

/// Signed payload of one voucher entry.
#[derive(Debug, Clone, PartialEq)]
pub struct VoucherEntryPayload {
    /// Hash of the previous entry (for the first entry, of header ++ HMAC).
    pub prev_hash: Hash,
    /// Hash of the voucher header concatenated with its HMAC.
    pub header_hash: Hash,
    /// Reserved extra data, carried but not interpreted.
    pub extra: Value,
    /// The public key of the next owner in the chain.
    pub owner_public_key: PublicKey,
}

impl VoucherEntryPayload {
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            self.prev_hash.to_value(),
            self.header_hash.to_value(),
            self.extra.clone(),
            self.owner_public_key.to_value(),
        ])
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut items = cbor::array_of(value, 4, "voucher entry payload")?;
        let owner_public_key = PublicKey::from_value(items.remove(3))?;
        let extra = items.remove(2);
        let header_hash = Hash::from_value(items.remove(1))?;
        let prev_hash = Hash::from_value(items.remove(0))?;
        Ok(Self {
            prev_hash,
            header_hash,
            extra,
            owner_public_key,
        })
    }
}

/// A decoded voucher entry, retaining its serialized form for chain hashing.
pub struct VoucherEntry {
    raw: Vec<u8>,
    cose: CoseSign1,
    payload: VoucherEntryPayload,
}

impl VoucherEntry {
    /// Decode a tagged COSE_Sign1 entry.
    pub fn from_tagged_slice(raw: Vec<u8>, index: usize) -> Result<Self, VoucherError> {
        let cose = cose::decode(&raw, "voucher entry").map_err(|e| VoucherError::MalformedEntry {
            index,
            reason: e.to_string(),
        })?;
        let payload_bytes = cose.payload.as_ref().ok_or(VoucherError::MalformedEntry {
            index,
            reason: "entry has no payload".into(),
        })?;
        let payload = cbor::from_slice(payload_bytes)
            .and_then(VoucherEntryPayload::from_value)
            .map_err(|e| VoucherError::MalformedEntry {
                index,
                reason: e.to_string(),
            })?;
        Ok(Self { raw, cose, payload })
    }

    pub fn payload(&self) -> &VoucherEntryPayload {
        &self.payload
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// A complete ownership voucher: header, header HMAC, and entry chain.
pub struct Voucher {
    pub header: VoucherHeader,
    /// The header's CBOR bytes exactly as received (content of the wire
    /// bstr), the input to the HMAC and header-hash checks.
    pub header_raw: Vec<u8>,
    pub header_hmac: Hash,
    pub entries: Vec<VoucherEntry>,
}

impl Voucher {
    /// Verify the header HMAC under the device's HMAC secret.
    pub fn verify_header(&self, hmac: &dyn HmacProvider) -> Result<(), VoucherError> {
        let computed = hmac.hmac(self.header_hmac.alg, &self.header_raw)?;
        if !computed.matches(&self.header_hmac) {
            return Err(VoucherError::BadHeaderHmac);
        }
        Ok(())
    }

    /// Verify the header's manufacturer key against the hash stored in the
    /// device credential at initialization.
    pub fn verify_manufacturer_key(&self, expected: &Hash) -> Result<(), VoucherError> {
        let key_bytes = cbor::to_vec(&self.header.manufacturer_key.to_value())
            .map_err(|e| VoucherError::MalformedEntry {
                index: 0,
                reason: e.to_string(),
            })?;
        let computed = Hash::of(expected.alg, &key_bytes);
        if !computed.matches(expected) {
            return Err(VoucherError::ManufacturerKeyMismatch);
        }
        Ok(())
    }

    /// Verify the entry chain: per-entry header hash, previous-entry hash,
    /// and signature under the previous owner's key (the manufacturer key
    /// for the first entry).
    pub fn verify_entries(&self) -> Result<(), VoucherError> {
        if self.entries.is_empty() {
            return Err(VoucherError::MalformedEntry {
                index: 0,
                reason: "voucher has no entries".into(),
            });
        }

        let header_hmac_material = self.header_hmac_material()?;
        let mut signer_key: PKey<Public> = self.header.manufacturer_key.public()?;
        let mut signer_pss = self.header.manufacturer_key.key_type.uses_pss();
        let mut prev_material: &[u8] = &header_hmac_material;

        for (index, entry) in self.entries.iter().enumerate() {
            let payload = entry.payload();

            let header_hash = Hash::of(payload.header_hash.alg, &header_hmac_material);
            if !header_hash.matches(&payload.header_hash) {
                return Err(VoucherError::BadHeaderHash { index });
            }

            let prev_hash = Hash::of(payload.prev_hash.alg, prev_material);
            if !prev_hash.matches(&payload.prev_hash) {
                return Err(VoucherError::BadPrevHash { index });
            }

            cose::verify(&entry.cose, &signer_key, signer_pss)
                .map_err(|_| VoucherError::BadSignature { index })?;

            signer_key = payload.owner_public_key.public()?;
            signer_pss = payload.owner_public_key.key_type.uses_pss();
            prev_material = entry.raw();
        }
        Ok(())
    }

    /// The public key of the final entry, i.e. the current owner. The
    /// protocol driver compares it against the key claimed in ProveOVHdr.
    pub fn tail_public_key(&self) -> Option<&PublicKey> {
        self.entries.last().map(|e| &e.payload().owner_public_key)
    }

    /// Header bytes concatenated with the HMAC encoding: the material both
    /// the per-entry header hash and the first entry's previous-hash cover.
    fn header_hmac_material(&self) -> Result<Vec<u8>, VoucherError> {
        let mut material = self.header_raw.clone();
        let hmac_bytes =
            cbor::to_vec(&self.header_hmac.to_value()).map_err(|e| VoucherError::MalformedEntry {
                index: 0,
                reason: e.to_string(),
            })?;
        material.extend_from_slice(&hmac_bytes);
        Ok(material)
    }
}

/// Device credentials stored at initialization: identity, the hash of the
/// manufacturer key, and the capability handles guarding the HMAC secret
/// and signing key.
#[derive(Clone)]
pub struct DeviceCredential {
    pub guid: Guid,
    pub public_key_hash: Hash,
    pub hmac: Arc<dyn HmacProvider>,
    pub key: Arc<dyn Signer>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HashAlg, KeyEncoding, KeyType};

    fn dummy_key() -> PublicKey {
        PublicKey {
            key_type: KeyType::Secp256r1,
            encoding: KeyEncoding::X509,
            body: Value::Bytes(vec![0x30, 0x00]),
        }
    }

    #[test]
    fn header_roundtrip() {
        let header = VoucherHeader {
            version: 101,
            guid: Guid([7; 16]),
            rv_info: RendezvousInfo::empty(),
            device_info: "test-device".into(),
            manufacturer_key: dummy_key(),
            cert_chain_hash: Some(Hash::of(HashAlg::Sha256, b"certs")),
        };
        let back = VoucherHeader::from_value(header.to_value()).unwrap();
        assert_eq!(header, back);
    }

    #[test]
    fn header_without_cert_chain_hash() {
        let header = VoucherHeader {
            version: 101,
            guid: Guid([0; 16]),
            rv_info: RendezvousInfo::empty(),
            device_info: String::new(),
            manufacturer_key: dummy_key(),
            cert_chain_hash: None,
        };
        let back = VoucherHeader::from_value(header.to_value()).unwrap();
        assert!(back.cert_chain_hash.is_none());
    }

    #[test]
    fn entry_payload_roundtrip() {
        let payload = VoucherEntryPayload {
            prev_hash: Hash::of(HashAlg::Sha384, b"prev"),
            header_hash: Hash::of(HashAlg::Sha384, b"hdr"),
            extra: Value::Null,
            owner_public_key: dummy_key(),
        };
        let back = VoucherEntryPayload::from_value(payload.to_value()).unwrap();
        assert_eq!(payload, back);
    }
}
