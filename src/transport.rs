//! Abstract message transport consumed by the protocol driver.

use async_trait::async_trait;
use bytes::Bytes;
use ciborium::value::Value;

use crate::crypto::CipherSuite;
use crate::error::TransportError;
use crate::kex::SessionKeys;

/// Reserved message type for the protocol-level Error message; any request
/// may be answered with it.
pub const ERROR_MSG_TYPE: u8 = 255;

/// One request/response exchange with the owner service.
///
/// Implementations own wire framing, authentication cookies, and (once
/// [`begin_encryption`](Transport::begin_encryption) has been called)
/// session-key encryption of message bodies. The driver passes structured
/// CBOR values; the transport serializes them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `body` as message `msg_type` and return the response's type tag
    /// and raw body bytes.
    async fn send(
        &self,
        base_url: &str,
        msg_type: u8,
        body: Value,
    ) -> Result<(u8, Bytes), TransportError>;

    /// Install the session keys derived by the key exchange. Called once,
    /// after the device's exchange parameter is computed and before
    /// ProveDevice is sent; messages from the ProveDevice response onward
    /// travel encrypted.
    async fn begin_encryption(
        &self,
        _cipher: CipherSuite,
        _keys: &SessionKeys,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}
