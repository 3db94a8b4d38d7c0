use crate::model::ErrorMessage;

/// Errors from protocol message sequencing and decoding.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected message type for response to {request}: {received}")]
    UnexpectedMessageType { request: &'static str, received: u8 },

    #[error("malformed {context}: {reason}")]
    Malformed {
        context: &'static str,
        reason: String,
    },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("nonce in {response} did not match nonce sent in {request}")]
    NonceMismatch {
        request: &'static str,
        response: &'static str,
    },

    #[error("voucher entry number mismatch: requested {requested}, received {received}")]
    EntryNumMismatch { requested: usize, received: usize },

    #[error("ownership voucher cannot have zero entries")]
    EmptyVoucher,

    #[error("request body of {size} bytes exceeds negotiated owner maximum of {max}")]
    MessageTooLarge { size: usize, max: usize },
}

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("signature verification failed: {0}")]
    VerifyFailed(&'static str),

    #[error("HMAC verification failed")]
    HmacMismatch,

    #[error("key derivation failed: {0}")]
    KdfFailed(String),

    #[error("unknown key exchange suite: {0}")]
    UnknownSuite(String),

    #[error("key exchange parameter length invalid: got {actual} bytes, limit {limit}")]
    ParameterLength { actual: usize, limit: usize },

    #[error("random generation failed: {0}")]
    Rng(String),

    #[error("unsupported COSE algorithm: {0}")]
    UnsupportedAlgorithm(i64),

    #[error("COSE encoding failed: {0}")]
    CoseEncode(String),

    #[error("key exchange persistence failed: {0}")]
    Persist(String),

    #[error("unsupported public key format: {0}")]
    UnsupportedKey(&'static str),

    #[error("OpenSSL error: {0}")]
    Openssl(#[from] openssl::error::ErrorStack),
}

/// Errors from ownership voucher chain validation.
#[derive(Debug, thiserror::Error)]
pub enum VoucherError {
    #[error("ownership voucher header HMAC is invalid")]
    BadHeaderHmac,

    #[error("manufacturer key hash does not match device credential")]
    ManufacturerKeyMismatch,

    #[error("voucher entry {index}: previous-entry hash mismatch")]
    BadPrevHash { index: usize },

    #[error("voucher entry {index}: header hash mismatch")]
    BadHeaderHash { index: usize },

    #[error("voucher entry {index}: signature verification failed")]
    BadSignature { index: usize },

    #[error("voucher entry {index}: {reason}")]
    MalformedEntry { index: usize, reason: String },

    #[error("owner public key did not match last entry in ownership voucher")]
    OwnerKeyMismatch,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Errors from the service-info pipes.
///
/// `Clone` so a single close-with-error can poison both ends of a pipe.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    #[error("service info pipe closed")]
    Closed,

    #[error("service info pipe failed: {0}")]
    Poisoned(String),

    #[error("service info pipe cancelled")]
    Cancelled,
}

/// A service-info module reported a fatal error.
#[derive(Debug, thiserror::Error)]
#[error("service info module {module}: {reason}")]
pub struct ModuleError {
    pub module: String,
    pub reason: String,
}

impl ModuleError {
    pub fn new(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            reason: reason.into(),
        }
    }
}

// Lets module handlers use `?` on their respond-writer calls.
impl From<PipeError> for ModuleError {
    fn from(err: PipeError) -> Self {
        Self {
            module: String::new(),
            reason: err.to_string(),
        }
    }
}

/// Errors from the underlying transport. Retry is a caller policy, not ours.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Other(String),
}

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Voucher(#[from] VoucherError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Pipe(#[from] PipeError),

    #[error("error message received from owner service: {0}")]
    Remote(ErrorMessage),

    #[error("onboarding cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
