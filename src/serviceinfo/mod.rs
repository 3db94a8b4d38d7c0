//! Service-info data model and module contract.
//!
//! Service info is a stream of `(module, message, value)` tuples carried as
//! size-limited CBOR chunks across the TO2 message loop. The pipes in
//! [`pipe`] convert between the two representations.

pub mod pipe;

pub use pipe::{in_pipe, out_pipe, ChunkRead, ChunkReader, ChunkWriter, UnchunkReader, UnchunkWriter};

use async_trait::async_trait;
use ciborium::value::Value;

use crate::cbor;
use crate::error::{ModuleError, ProtocolError};

/// Default maximum serialized service-info bytes per protocol message,
/// used when the peer does not negotiate a size.
pub const DEFAULT_MTU: u16 = 1300;

/// One service-info chunk: a `"<module>:<message>"` key and a fragment of
/// the CBOR-encoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfoKV {
    pub key: String,
    pub value: Vec<u8>,
}

impl ServiceInfoKV {
    pub fn new(module: &str, message: &str, value: Vec<u8>) -> Self {
        Self {
            key: format!("{module}:{message}"),
            value,
        }
    }

    /// Module name: the key up to the first `:`.
    pub fn module(&self) -> &str {
        self.key.split_once(':').map(|(m, _)| m).unwrap_or(&self.key)
    }

    /// Message name: the key after the first `:`.
    pub fn message(&self) -> &str {
        self.key.split_once(':').map(|(_, m)| m).unwrap_or("")
    }

    /// Size of the CBOR encoding `[key, value]` on the wire, used for MTU
    /// budgeting.
    pub fn serialized_size(&self) -> usize {
        // Encoding a KV is cheap at service-info sizes.
        cbor::to_vec(&self.to_value()).map(|b| b.len()).unwrap_or(usize::MAX)
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Text(self.key.clone()),
            Value::Bytes(self.value.clone()),
        ])
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut items = cbor::array_of(value, 2, "service info KV")?;
        let value = cbor::bytes(items.remove(1), "service info value")?;
        let key = cbor::text(items.remove(0), "service info key")?;
        Ok(Self { key, value })
    }
}

/// A named service-info module (FSIM).
///
/// The dispatcher invokes `handle` once per logical message addressed to the
/// module, with the fully reassembled CBOR value. Responses are written via
/// `respond`: [`UnchunkWriter::begin`] starts a new outbound message and
/// [`UnchunkWriter::write`] streams its value bytes.
#[async_trait]
pub trait ServiceInfoModule: Send + Sync {
    async fn handle(
        &self,
        message: &str,
        value: &[u8],
        respond: &mut UnchunkWriter,
    ) -> Result<(), ModuleError>;
}
