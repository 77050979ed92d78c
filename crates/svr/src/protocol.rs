//! svr request/response messages
//!
//! these are the plaintexts carried inside the attested channel. encoding is
//! bincode over serde enums; both ends ship in this crate.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::Result;

/// status returned by the enclave for every operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Missing,
    PinMismatch,
    RequestInvalid,
    Error,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::Missing => write!(f, "MISSING"),
            Status::PinMismatch => write!(f, "PIN_MISMATCH"),
            Status::RequestInvalid => write!(f, "REQUEST_INVALID"),
            Status::Error => write!(f, "ERROR"),
        }
    }
}

/// client requests. access keys and sealed blobs are wiped on drop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub enum Request {
    /// store a new blob and reset the guess counter, not yet restorable
    Backup {
        access_key: [u8; 32],
        data: Vec<u8>,
        max_tries: u32,
    },
    /// make a previously backed up blob restorable
    Expose { data: Vec<u8> },
    Restore { access_key: [u8; 32] },
    Delete,
}

impl Request {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Backup { .. } => "backup",
            Request::Expose { .. } => "expose",
            Request::Restore { .. } => "restore",
            Request::Delete => "delete",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Backup {
        status: Status,
    },
    Expose {
        status: Status,
    },
    Restore {
        status: Status,
        data: Option<Vec<u8>>,
        tries_remaining: Option<u32>,
    },
    Delete {
        status: Status,
    },
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn status(&self) -> Status {
        match self {
            Response::Backup { status }
            | Response::Expose { status }
            | Response::Restore { status, .. }
            | Response::Delete { status } => *status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_secrets_wiped() {
        let mut request = Request::Backup {
            access_key: [7u8; 32],
            data: vec![1, 2, 3],
            max_tries: 10,
        };
        request.zeroize();
        assert_eq!(
            request,
            Request::Backup {
                access_key: [0u8; 32],
                data: Vec::new(),
                max_tries: 0,
            }
        );

        let mut request = Request::Restore {
            access_key: [7u8; 32],
        };
        request.zeroize();
        assert_eq!(request, Request::Restore { access_key: [0u8; 32] });
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Response::decode(&[0xff, 0xff, 0xff, 0xff]).is_err());
        assert!(Request::decode(&[]).is_err());
    }

    #[test]
    fn test_restore_response_fields() {
        let resp = Response::Restore {
            status: Status::PinMismatch,
            data: None,
            tries_remaining: Some(3),
        };
        let decoded = Response::decode(&resp.encode().unwrap()).unwrap();
        assert_eq!(decoded.status(), Status::PinMismatch);
        assert_eq!(decoded, resp);
    }
}
