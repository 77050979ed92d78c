//! error types for svr

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// websocket close code for a normally completed exchange
pub const CLOSE_NORMAL: u16 = 1000;

/// close code the client sends after a protocol failure
pub const CLOSE_PROTOCOL_FAILURE: u16 = 4003;

/// status reported when the requested enclave is unknown to the service
pub const STATUS_ENCLAVE_NOT_FOUND: u16 = 404;

/// status reported when the service refuses the request outright
pub const STATUS_SERVER_REJECTED: u16 = 508;

#[derive(Debug, Error)]
pub enum Error {
    // === transport errors ===
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// remote closed (or refused the upgrade) with a non-normal code
    #[error("remote rejected the exchange with code {0}")]
    Status(u16),

    #[error("connection closed before a response arrived")]
    ConnectionClosedEarly,

    // === channel errors ===
    #[error("attestation failed: {0}")]
    Attestation(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    // === application errors ===
    #[error("service reported the request as invalid")]
    InvalidRequest,

    #[error("unexpected status {status} for {operation}")]
    UnexpectedStatus {
        operation: &'static str,
        status: String,
    },

    /// an earlier backup attempt on this pin change failed terminally
    #[error("pin change abandoned: {0}")]
    PinChangeAbandoned(String),

    #[error("kdf failed: {0}")]
    KdfFailed(String),

    #[error("credentials unavailable: {0}")]
    Credentials(String),

    #[error("invalid config: {0}")]
    Config(String),
}

impl Error {
    /// whether retrying the same operation later might succeed
    pub fn is_network(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) | Error::ConnectionClosedEarly => true,
            Error::Status(code) => {
                *code != STATUS_ENCLAVE_NOT_FOUND && *code != STATUS_SERVER_REJECTED
            }
            _ => false,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_classification() {
        assert!(Error::Network("reset".into()).is_network());
        assert!(Error::Timeout("read").is_network());
        assert!(Error::ConnectionClosedEarly.is_network());
        assert!(Error::Status(4001).is_network());

        assert!(!Error::Status(STATUS_ENCLAVE_NOT_FOUND).is_network());
        assert!(!Error::Status(STATUS_SERVER_REJECTED).is_network());
        assert!(!Error::InvalidRequest.is_network());
        assert!(!Error::DecryptionFailed("tag".into()).is_network());
    }
}
