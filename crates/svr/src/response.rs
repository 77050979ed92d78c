//! caller-facing outcomes
//!
//! every public svr call returns exactly one of these. expected business
//! results (pin mismatch, missing data, exposure failure) are variants, not
//! errors. transport and channel errors are folded in by [`Classified`].

use crate::error::{STATUS_ENCLAVE_NOT_FOUND, STATUS_SERVER_REJECTED};
use crate::master_key::MasterKey;
use crate::Error;

/// outcome of [`PinChangeSession::execute`](crate::client::PinChangeSession::execute)
#[derive(Debug)]
pub enum BackupResponse {
    /// backup stored and exposed
    Success(MasterKey),
    /// backup stored, but the service could not make it restorable
    ExposeFailure,
    EnclaveNotFound,
    ServerRejected,
    /// retryable
    NetworkError(Error),
    ApplicationError(Error),
}

#[derive(Debug)]
pub enum RestoreResponse {
    Success(MasterKey),
    /// nothing restorable stored for this user
    Missing,
    PinMismatch { tries_remaining: u32 },
    EnclaveNotFound,
    /// retryable
    NetworkError(Error),
    ApplicationError(Error),
}

#[derive(Debug)]
pub enum DeleteResponse {
    Success,
    EnclaveNotFound,
    ServerRejected,
    /// retryable
    NetworkError(Error),
    ApplicationError(Error),
}

/// where an error lands in the outcome taxonomy
#[derive(Debug)]
pub(crate) enum Classified {
    EnclaveNotFound,
    ServerRejected,
    Network(Error),
    Application(Error),
}

impl From<Error> for Classified {
    fn from(error: Error) -> Self {
        match error {
            Error::Status(STATUS_ENCLAVE_NOT_FOUND) => Classified::EnclaveNotFound,
            Error::Status(STATUS_SERVER_REJECTED) => Classified::ServerRejected,
            e if e.is_network() => Classified::Network(e),
            e => Classified::Application(e),
        }
    }
}

impl From<Classified> for BackupResponse {
    fn from(c: Classified) -> Self {
        match c {
            Classified::EnclaveNotFound => BackupResponse::EnclaveNotFound,
            Classified::ServerRejected => BackupResponse::ServerRejected,
            Classified::Network(e) => BackupResponse::NetworkError(e),
            Classified::Application(e) => BackupResponse::ApplicationError(e),
        }
    }
}

impl From<Classified> for RestoreResponse {
    fn from(c: Classified) -> Self {
        match c {
            Classified::EnclaveNotFound => RestoreResponse::EnclaveNotFound,
            // restore has no rejection case; a refused restore is an application error
            Classified::ServerRejected => {
                RestoreResponse::ApplicationError(Error::Status(STATUS_SERVER_REJECTED))
            }
            Classified::Network(e) => RestoreResponse::NetworkError(e),
            Classified::Application(e) => RestoreResponse::ApplicationError(e),
        }
    }
}

impl From<Classified> for DeleteResponse {
    fn from(c: Classified) -> Self {
        match c {
            Classified::EnclaveNotFound => DeleteResponse::EnclaveNotFound,
            Classified::ServerRejected => DeleteResponse::ServerRejected,
            Classified::Network(e) => DeleteResponse::NetworkError(e),
            Classified::Application(e) => DeleteResponse::ApplicationError(e),
        }
    }
}

impl BackupResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, BackupResponse::Success(_))
    }

    /// true for outcomes after which `execute` may be called again
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackupResponse::NetworkError(_))
    }
}

impl RestoreResponse {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RestoreResponse::NetworkError(_))
    }
}

impl DeleteResponse {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeleteResponse::NetworkError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_classification() {
        assert!(matches!(
            BackupResponse::from(Classified::from(Error::ConnectionClosedEarly)),
            BackupResponse::NetworkError(Error::ConnectionClosedEarly)
        ));
        assert!(matches!(
            BackupResponse::from(Classified::from(Error::Status(404))),
            BackupResponse::EnclaveNotFound
        ));
        assert!(matches!(
            BackupResponse::from(Classified::from(Error::Status(508))),
            BackupResponse::ServerRejected
        ));
        assert!(matches!(
            BackupResponse::from(Classified::from(Error::Status(4001))),
            BackupResponse::NetworkError(Error::Status(4001))
        ));
    }

    #[test]
    fn test_channel_errors_are_application_errors() {
        let outcome = DeleteResponse::from(Classified::from(Error::Attestation("bad".into())));
        assert!(matches!(outcome, DeleteResponse::ApplicationError(_)));
        assert!(!outcome.is_retryable());
    }

    #[test]
    fn test_restore_has_no_rejected_variant() {
        let outcome = RestoreResponse::from(Classified::from(Error::Status(508)));
        assert!(matches!(
            outcome,
            RestoreResponse::ApplicationError(Error::Status(508))
        ));
    }
}
