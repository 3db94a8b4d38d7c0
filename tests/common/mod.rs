//! Shared fixtures: synthetic ownership vouchers built from freshly
//! generated openssl keys.

#![allow(dead_code)]

use std::sync::Arc;

use ciborium::value::Value;
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;

use fdo_to2::cbor;
use fdo_to2::crypto::{cose, HmacProvider, SoftwareHmac, SoftwareSigner};
use fdo_to2::Signer;
use fdo_to2::model::{Guid, Hash, HashAlg, RendezvousInfo};
use fdo_to2::voucher::{DeviceCredential, Voucher, VoucherEntry, VoucherEntryPayload, VoucherHeader};

pub fn p256_signer() -> SoftwareSigner {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    SoftwareSigner::ec(EcKey::generate(&group).unwrap()).unwrap()
}

pub fn p384_signer() -> SoftwareSigner {
    let group = EcGroup::from_curve_name(Nid::SECP384R1).unwrap();
    SoftwareSigner::ec(EcKey::generate(&group).unwrap()).unwrap()
}

/// A complete synthetic voucher: device credentials, header, HMAC, and the
/// signed entry chain ending at `owner_signer`.
pub struct VoucherFixture {
    pub cred: DeviceCredential,
    pub header: VoucherHeader,
    pub header_raw: Vec<u8>,
    pub header_hmac: Hash,
    pub entries_raw: Vec<Vec<u8>>,
    pub owner_signer: Arc<SoftwareSigner>,
}

/// Build a voucher with `num_entries` chain entries. The manufacturer key
/// signs the first entry; each entry hands off to a fresh owner key.
pub fn build_voucher(num_entries: usize) -> VoucherFixture {
    let manufacturer = p256_signer();
    let mfg_pub = manufacturer.public_key().unwrap();

    let hmac: Arc<SoftwareHmac> = Arc::new(SoftwareHmac::new(vec![0x42; 32]));
    let guid = Guid([0xD1; 16]);

    let header = VoucherHeader {
        version: 101,
        guid,
        rv_info: RendezvousInfo::empty(),
        device_info: "rust-test-device".into(),
        manufacturer_key: mfg_pub.clone(),
        cert_chain_hash: None,
    };
    let header_raw = header.to_vec().unwrap();
    let header_hmac = hmac.hmac(HashAlg::HmacSha384, &header_raw).unwrap();

    let mut header_hash_material = header_raw.clone();
    header_hash_material.extend_from_slice(&cbor::to_vec(&header_hmac.to_value()).unwrap());

    let mut entries_raw = Vec::with_capacity(num_entries);
    let mut signer = manufacturer;
    let mut prev_material = header_hash_material.clone();
    for _ in 0..num_entries {
        let next = p256_signer();
        let payload = VoucherEntryPayload {
            prev_hash: Hash::of(HashAlg::Sha256, &prev_material),
            header_hash: Hash::of(HashAlg::Sha256, &header_hash_material),
            extra: Value::Null,
            owner_public_key: next.public_key().unwrap(),
        };
        let raw = cose::sign1(
            &signer,
            Vec::new(),
            cbor::to_vec(&payload.to_value()).unwrap(),
        )
        .unwrap();
        prev_material = raw.clone();
        entries_raw.push(raw);
        signer = next;
    }

    let cred = DeviceCredential {
        guid,
        public_key_hash: Hash::of(
            HashAlg::Sha256,
            &cbor::to_vec(&mfg_pub.to_value()).unwrap(),
        ),
        hmac,
        key: Arc::new(p384_signer()),
    };

    VoucherFixture {
        cred,
        header,
        header_raw,
        header_hmac,
        entries_raw,
        owner_signer: Arc::new(signer),
    }
}

/// Assemble the fixture's parts into a `Voucher` as the driver would after
/// fetching all entries.
pub fn assemble(fixture: &VoucherFixture) -> Voucher {
    let entries = fixture
        .entries_raw
        .iter()
        .enumerate()
        .map(|(i, raw)| VoucherEntry::from_tagged_slice(raw.clone(), i).unwrap())
        .collect();
    Voucher {
        header: fixture.header.clone(),
        header_raw: fixture.header_raw.clone(),
        header_hmac: fixture.header_hmac.clone(),
        entries,
    }
}

/// Flip one byte inside the entry's signed payload (within the owner key
/// body, so the payload still decodes) without re-signing.
pub fn tamper_entry_payload(raw: &[u8]) -> Vec<u8> {
    use coset::{CoseSign1, TaggedCborSerializable};

    let mut signed = CoseSign1::from_tagged_slice(raw).unwrap();
    let mut payload = signed.payload.take().unwrap();
    let last = payload.len() - 1;
    payload[last] ^= 0x01;
    signed.payload = Some(payload);
    signed.to_tagged_vec().unwrap()
}
