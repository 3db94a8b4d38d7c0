//! TO2 message type tags, COSE claim labels, and the per-message codecs.
//!
//! All bodies are positional CBOR arrays; the 8-bit message type travels
//! out of band via the transport.

use ciborium::value::Value;
use coset::CoseSign1;

use crate::cbor;
use crate::crypto::SigInfo;
use crate::error::ProtocolError;
use crate::model::{Guid, Hash, Nonce, PublicKey, RendezvousInfo};
use crate::serviceinfo::ServiceInfoKV;
use crate::voucher::VoucherHeader;

pub const HELLO_DEVICE: u8 = 60;
pub const PROVE_OV_HDR: u8 = 61;
pub const GET_OV_NEXT_ENTRY: u8 = 62;
pub const OV_NEXT_ENTRY: u8 = 63;
pub const PROVE_DEVICE: u8 = 64;
pub const SETUP_DEVICE: u8 = 65;
pub const DEVICE_SERVICE_INFO_READY: u8 = 66;
pub const OWNER_SERVICE_INFO_READY: u8 = 67;
pub const DEVICE_SERVICE_INFO: u8 = 68;
pub const OWNER_SERVICE_INFO: u8 = 69;
pub const DONE: u8 = 70;
pub const DONE2: u8 = 71;

/// ProveOVHdr unprotected header claim carrying the owner's nonce.
pub const CUPH_NONCE_CLAIM: i64 = 256;
/// ProveOVHdr unprotected header claim carrying the owner's public key.
pub const CUPH_OWNER_PUBKEY_CLAIM: i64 = 257;

/// ProveDevice EAT unprotected header claim carrying the device's nonce.
pub const EUPH_NONCE_CLAIM: i64 = 256;

// EAT payload claims.
const EAT_NONCE_CLAIM: i64 = 10;
const EAT_UEID_CLAIM: i64 = 256;
const EAT_FDO_CLAIM: i64 = -257;

/// EAT UEID type byte for a random identifier.
const EAT_RAND: u8 = 0x01;

/// HelloDevice(60) body.
pub fn hello_device(
    max_device_message_size: u16,
    guid: &Guid,
    nonce: &Nonce,
    kex_suite_name: &str,
    cipher_suite_id: i64,
    sig_info_a: &SigInfo,
) -> Value {
    Value::Array(vec![
        Value::Integer(max_device_message_size.into()),
        guid.to_value(),
        nonce.to_value(),
        Value::Text(kex_suite_name.to_string()),
        Value::Integer(cipher_suite_id.into()),
        sig_info_a.to_value(),
    ])
}

/// Decoded ProveOVHdr(61) COSE payload.
pub struct ProveOvHdrPayload {
    pub header: VoucherHeader,
    pub header_raw: Vec<u8>,
    pub num_entries: usize,
    pub header_hmac: Hash,
    pub hello_nonce_echo: Nonce,
    pub sig_info_b: SigInfo,
    pub key_exchange_a: Vec<u8>,
    pub max_owner_message_size: u16,
}

pub fn decode_prove_ov_hdr(cose: &CoseSign1) -> Result<ProveOvHdrPayload, ProtocolError> {
    let payload = cose
        .payload
        .as_ref()
        .ok_or(ProtocolError::MissingField("ProveOVHdr payload"))?;
    let mut items = cbor::array_of(cbor::from_slice(payload)?, 8, "ProveOVHdr payload")?;

    let max_owner_message_size = cbor::uint(&items[7], "max owner message size")? as u16;
    // items[6] is the HelloDevice hash; positional, not used by this client.
    let key_exchange_a = cbor::bytes(items.remove(5), "key exchange A")?;
    let sig_info_b = SigInfo::from_value(items.remove(4))?;
    let hello_nonce_echo = Nonce::from_value(items.remove(3))?;
    let header_hmac = Hash::from_value(items.remove(2))?;
    let num_entries = cbor::uint(&items[1], "voucher entry count")? as usize;
    let header_raw = cbor::bytes(items.remove(0), "voucher header")?;
    let header = VoucherHeader::from_value(cbor::from_slice(&header_raw)?)?;

    Ok(ProveOvHdrPayload {
        header,
        header_raw,
        num_entries,
        header_hmac,
        hello_nonce_echo,
        sig_info_b,
        key_exchange_a,
        max_owner_message_size,
    })
}

/// GetOVNextEntry(62) body.
pub fn get_ov_next_entry(entry_num: usize) -> Value {
    Value::Array(vec![Value::Integer((entry_num as u64).into())])
}

/// OVNextEntry(63) body: the echoed entry number and the entry itself,
/// re-serialized to bytes for chain hashing.
pub fn decode_ov_next_entry(value: Value) -> Result<(usize, Vec<u8>), ProtocolError> {
    let mut items = cbor::array_of(value, 2, "OVNextEntry")?;
    let entry = cbor::to_vec(&items.remove(1))?;
    let entry_num = cbor::uint(&items[0], "entry number")? as usize;
    Ok((entry_num, entry))
}

/// EAT payload for ProveDevice(64): the device identity, the owner's nonce
/// proving freshness, and the device key-exchange parameter.
pub fn eat_payload(guid: &Guid, prove_device_nonce: &Nonce, key_exchange_b: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut ueid = Vec::with_capacity(17);
    ueid.push(EAT_RAND);
    ueid.extend_from_slice(guid.as_bytes());

    let value = Value::Map(vec![
        (
            Value::Integer(EAT_NONCE_CLAIM.into()),
            prove_device_nonce.to_value(),
        ),
        (Value::Integer(EAT_UEID_CLAIM.into()), Value::Bytes(ueid)),
        (
            Value::Integer(EAT_FDO_CLAIM.into()),
            Value::Array(vec![Value::Bytes(key_exchange_b.to_vec())]),
        ),
    ]);
    cbor::to_vec(&value)
}

/// Decoded SetupDevice(65) COSE payload.
pub struct SetupDevicePayload {
    pub rv_info: RendezvousInfo,
    pub guid: Guid,
    pub setup_device_nonce_echo: Nonce,
    pub owner2_key: PublicKey,
}

pub fn decode_setup_device(cose: &CoseSign1) -> Result<SetupDevicePayload, ProtocolError> {
    let payload = cose
        .payload
        .as_ref()
        .ok_or(ProtocolError::MissingField("SetupDevice payload"))?;
    let mut items = cbor::array_of(cbor::from_slice(payload)?, 4, "SetupDevice payload")?;

    let owner2_key = PublicKey::from_value(items.remove(3))?;
    let setup_device_nonce_echo = Nonce::from_value(items.remove(2))?;
    let guid = Guid::from_value(items.remove(1))?;
    let rv_info = RendezvousInfo::from_value(items.remove(0))?;
    Ok(SetupDevicePayload {
        rv_info,
        guid,
        setup_device_nonce_echo,
        owner2_key,
    })
}

/// DeviceServiceInfoReady(66) body.
pub fn device_service_info_ready(new_header_hmac: &Hash, max_owner_service_info_size: u16) -> Value {
    Value::Array(vec![
        new_header_hmac.to_value(),
        Value::Integer(max_owner_service_info_size.into()),
    ])
}

/// OwnerServiceInfoReady(67) body: the owner's receive MTU, absent for the
/// protocol default.
pub fn decode_owner_service_info_ready(value: Value) -> Result<Option<u16>, ProtocolError> {
    let items = cbor::array_of(value, 1, "OwnerServiceInfoReady")?;
    match &items[0] {
        Value::Null => Ok(None),
        v => Ok(Some(cbor::uint(v, "max device service info size")? as u16)),
    }
}

/// DeviceServiceInfo(68) body.
pub fn device_service_info(is_more: bool, service_info: &[ServiceInfoKV]) -> Value {
    Value::Array(vec![
        Value::Bool(is_more),
        Value::Array(service_info.iter().map(ServiceInfoKV::to_value).collect()),
    ])
}

/// Decoded OwnerServiceInfo(69) body.
pub struct OwnerServiceInfo {
    pub is_more: bool,
    pub is_done: bool,
    pub service_info: Vec<ServiceInfoKV>,
}

pub fn decode_owner_service_info(value: Value) -> Result<OwnerServiceInfo, ProtocolError> {
    let mut items = cbor::array_of(value, 3, "OwnerServiceInfo")?;
    let service_info = cbor::array(items.remove(2), "owner service info list")?
        .into_iter()
        .map(ServiceInfoKV::from_value)
        .collect::<Result<Vec<_>, _>>()?;
    let is_done = cbor::boolean(&items[1], "is done")?;
    let is_more = cbor::boolean(&items[0], "is more service info")?;
    Ok(OwnerServiceInfo {
        is_more,
        is_done,
        service_info,
    })
}

/// Done(70) body.
pub fn done(prove_device_nonce: &Nonce) -> Value {
    Value::Array(vec![prove_device_nonce.to_value()])
}

/// Done2(71) body: the echoed setup-device nonce.
pub fn decode_done2(value: Value) -> Result<Nonce, ProtocolError> {
    let mut items = cbor::array_of(value, 1, "Done2")?;
    Nonce::from_value(items.remove(0))
}
