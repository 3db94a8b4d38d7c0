//! The TO2 (Transfer Ownership 2) client protocol.
//!
//! A fixed-order twelve-message state machine: the device proves itself to
//! a presumptive owner, verifies the owner's voucher chain, completes a
//! Diffie-Hellman key exchange, swaps chunked service info, and finishes
//! with a paired nonce exchange.

mod dispatch;
mod driver;
pub mod messages;

pub use driver::To2Client;

use std::time::Duration;

use ciborium::value::Value;

use crate::cbor;
use crate::crypto::{CipherSuite, SigInfo};
use crate::error::ProtocolError;
use crate::kex::KexSuite;
use crate::model::{Hash, Nonce, PublicKey};
use crate::voucher::VoucherHeader;

/// Configuration for one onboarding attempt.
#[derive(Debug, Clone)]
pub struct To2Config {
    /// Key exchange suites this device supports; the strongest is offered.
    pub kex_suites: Vec<KexSuite>,
    /// Cipher suites this device supports; the strongest is offered.
    pub cipher_suites: Vec<CipherSuite>,
    /// Maximum message size this device accepts, 0 for the protocol default.
    pub max_device_message_size: u16,
    /// Maximum service-info bytes per message this device accepts,
    /// 0 for the default MTU.
    pub max_service_info_size_receive: u16,
    /// Idle delay between service-info polls when neither side has data.
    pub service_info_poll_delay: Duration,
}

impl Default for To2Config {
    fn default() -> Self {
        Self {
            kex_suites: vec![KexSuite::DhKexId14, KexSuite::DhKexId15],
            cipher_suites: vec![
                CipherSuite::A128Gcm,
                CipherSuite::A256Gcm,
                CipherSuite::Aes128CbcHmacSha256,
                CipherSuite::Aes256CbcHmacSha384,
            ],
            max_device_message_size: 0,
            max_service_info_size_receive: 0,
            service_info_poll_delay: Duration::from_secs(5),
        }
    }
}

/// Per-session state accumulated across the message sequence. Owned by the
/// driver for the lifetime of one onboarding attempt and discarded at its
/// end.
#[derive(Debug)]
pub struct To2Context {
    /// Nonce the owner chose in ProveOVHdr; echoed back in Done.
    pub prove_device_nonce: Nonce,
    /// Nonce the device chooses in ProveDevice; echoed back in Done2.
    pub setup_device_nonce: Option<Nonce>,
    /// Owner key claimed in ProveOVHdr's unprotected header; trusted only
    /// after the voucher tail check.
    pub owner_public_key: PublicKey,

    pub header: VoucherHeader,
    /// Header CBOR bytes exactly as received.
    pub header_raw: Vec<u8>,
    pub header_hmac: Hash,
    pub num_voucher_entries: usize,

    /// Owner's signature capabilities (eBSigInfo).
    pub sig_info_b: SigInfo,
    pub kex_suite: KexSuite,
    pub cipher_suite: CipherSuite,
    /// Owner's key exchange parameter (xA).
    pub key_exchange_a: Vec<u8>,

    pub max_device_message_size: u16,
    pub max_owner_message_size: u16,
}

impl To2Context {
    /// Serialize for resumption across process restarts.
    pub fn to_cbor(&self) -> Result<Vec<u8>, ProtocolError> {
        let value = Value::Array(vec![
            self.prove_device_nonce.to_value(),
            self.setup_device_nonce
                .as_ref()
                .map(Nonce::to_value)
                .unwrap_or(Value::Null),
            self.owner_public_key.to_value(),
            Value::Bytes(self.header_raw.clone()),
            self.header_hmac.to_value(),
            Value::Integer((self.num_voucher_entries as u64).into()),
            self.sig_info_b.to_value(),
            Value::Text(self.kex_suite.name().to_string()),
            Value::Integer(self.cipher_suite.id().into()),
            Value::Bytes(self.key_exchange_a.clone()),
            Value::Integer(self.max_device_message_size.into()),
            Value::Integer(self.max_owner_message_size.into()),
        ]);
        cbor::to_vec(&value)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut items = cbor::array_of(cbor::from_slice(bytes)?, 12, "TO2 context")?;

        let max_owner_message_size = cbor::uint(&items[11], "max owner message size")? as u16;
        let max_device_message_size = cbor::uint(&items[10], "max device message size")? as u16;
        let key_exchange_a = cbor::bytes(items.remove(9), "key exchange A")?;
        let cipher_suite = CipherSuite::from_i64(cbor::int(&items[8], "cipher suite")?)
            .map_err(|_| ProtocolError::Malformed {
                context: "TO2 context",
                reason: "unknown cipher suite".into(),
            })?;
        let kex_suite = KexSuite::from_name(&cbor::text(items.remove(7), "kex suite")?)
            .map_err(|_| ProtocolError::Malformed {
                context: "TO2 context",
                reason: "unknown key exchange suite".into(),
            })?;
        let sig_info_b = SigInfo::from_value(items.remove(6))?;
        let num_voucher_entries = cbor::uint(&items[5], "voucher entry count")? as usize;
        let header_hmac = Hash::from_value(items.remove(4))?;
        let header_raw = cbor::bytes(items.remove(3), "voucher header")?;
        let header = VoucherHeader::from_value(cbor::from_slice(&header_raw)?)?;
        let owner_public_key = PublicKey::from_value(items.remove(2))?;
        let setup_device_nonce = match items.remove(1) {
            Value::Null => None,
            v => Some(Nonce::from_value(v)?),
        };
        let prove_device_nonce = Nonce::from_value(items.remove(0))?;

        Ok(Self {
            prove_device_nonce,
            setup_device_nonce,
            owner_public_key,
            header,
            header_raw,
            header_hmac,
            num_voucher_entries,
            sig_info_b,
            kex_suite,
            cipher_suite,
            key_exchange_a,
            max_device_message_size,
            max_owner_message_size,
        })
    }
}
