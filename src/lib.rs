//! FIDO Device Onboard (FDO) Transfer Ownership 2 client.
//!
//! This crate implements the device side of the TO2 protocol: the
//! twelve-message CBOR/COSE state machine by which a provisioned device
//! proves its identity to a presumptive owner service, verifies that owner
//! through a signed ownership-voucher chain, derives session keys by
//! Diffie-Hellman key exchange, and then exchanges chunked, module-addressed
//! service info until the owner completes onboarding.
//!
//! Wire framing, persistence, and the earlier protocol stages (DI, TO0/TO1)
//! are out of scope; the driver consumes a [`Transport`] and the device key
//! material through the narrow [`Signer`](crypto::Signer) and
//! [`HmacProvider`](crypto::HmacProvider) capability traits.

/// CBOR value helpers shared by the message codecs.
pub mod cbor;
/// Signature/cipher suite tables and device key capability traits.
pub mod crypto;
/// Error types for every layer of the stack.
pub mod error;
/// Diffie-Hellman key exchange and session key derivation.
pub mod kex;
/// Identifiers, nonces, tagged hashes, and the public-key union.
pub mod model;
/// Service-info data model, pipes, and the module contract.
pub mod serviceinfo;
/// The TO2 protocol driver and module dispatcher.
pub mod to2;
/// Abstract message transport consumed by the driver.
pub mod transport;
/// Ownership voucher model and chain verification.
pub mod voucher;

// Re-export key types at crate root for convenience.
pub use error::{Error, Result};
pub use kex::{DhSession, KexSuite, SessionKeys};
pub use model::{Guid, Hash, HashAlg, Nonce, PublicKey};
pub use serviceinfo::{ServiceInfoKV, ServiceInfoModule, DEFAULT_MTU};
pub use to2::{To2Client, To2Config, To2Context};
pub use transport::Transport;
pub use voucher::{DeviceCredential, Voucher, VoucherHeader};

pub use crypto::{CipherSuite, HmacProvider, Signer, SoftwareHmac, SoftwareSigner};
