//! enclave identities and client tunables

use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// default allowed pin guesses stored with every backup
pub const DEFAULT_MAX_TRIES: u32 = 10;

/// one endpoint serving an enclave generation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUrl {
    /// base url, e.g. `wss://svr2.example.org`
    pub url: String,
    /// alternate `Host` header for ip-pinned connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_header: Option<String>,
}

impl ServiceUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            host_header: None,
        }
    }

    pub fn with_host_header(mut self, host: impl Into<String>) -> Self {
        self.host_header = Some(host.into());
        self
    }
}

/// which attested binary, reachable where
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EnclaveIdentityFile", into = "EnclaveIdentityFile")]
pub struct EnclaveIdentity {
    mr_enclave: [u8; 32],
    urls: Vec<ServiceUrl>,
}

/// on-disk form of an enclave identity (measurement as hex)
#[derive(Clone, Debug, Serialize, Deserialize)]
struct EnclaveIdentityFile {
    mr_enclave: String,
    urls: Vec<ServiceUrl>,
}

impl EnclaveIdentity {
    pub fn new(mr_enclave: [u8; 32], urls: Vec<ServiceUrl>) -> Result<Self> {
        if urls.is_empty() {
            return Err(Error::Config("enclave identity needs at least one url".into()));
        }
        Ok(Self { mr_enclave, urls })
    }

    pub fn from_hex(mr_enclave_hex: &str, urls: Vec<ServiceUrl>) -> Result<Self> {
        let bytes = hex::decode(mr_enclave_hex.trim())
            .map_err(|e| Error::Config(format!("mr_enclave: {e}")))?;
        let mr_enclave: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Config("mr_enclave must be 32 bytes".into()))?;
        Self::new(mr_enclave, urls)
    }

    pub fn mr_enclave(&self) -> &[u8; 32] {
        &self.mr_enclave
    }

    pub fn mr_enclave_hex(&self) -> String {
        hex::encode(self.mr_enclave)
    }

    pub fn urls(&self) -> &[ServiceUrl] {
        &self.urls
    }

    /// pick an endpoint for one attempt
    pub fn choose_url(&self) -> &ServiceUrl {
        self.urls
            .choose(&mut rand::thread_rng())
            .expect("constructor guarantees a url")
    }

    /// websocket path of this enclave on a service url
    pub fn endpoint(&self, service: &ServiceUrl) -> String {
        format!(
            "{}/v1/{}",
            service.url.trim_end_matches('/'),
            self.mr_enclave_hex()
        )
    }
}

impl TryFrom<EnclaveIdentityFile> for EnclaveIdentity {
    type Error = Error;

    fn try_from(file: EnclaveIdentityFile) -> Result<Self> {
        Self::from_hex(&file.mr_enclave, file.urls)
    }
}

impl From<EnclaveIdentity> for EnclaveIdentityFile {
    fn from(identity: EnclaveIdentity) -> Self {
        Self {
            mr_enclave: identity.mr_enclave_hex(),
            urls: identity.urls,
        }
    }
}

/// client tunables
#[derive(Clone, Debug)]
pub struct SvrConfig {
    /// guesses allowed before the enclave destroys a backup
    pub max_tries: u32,
    /// upper bound on establishing the websocket
    pub connect_timeout: Duration,
    /// upper bound on waiting for any single inbound frame
    pub read_timeout: Duration,
}

impl Default for SvrConfig {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_MAX_TRIES,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_json_roundtrip() {
        let json = r#"{
            "mr_enclave": "a8a261420a6bb9b61aa25bf8a79e8bd20d7652531feb3381cbffd446d270be95",
            "urls": [
                { "url": "wss://svr2.example.org/" },
                { "url": "wss://203.0.113.7", "host_header": "svr2.example.org" }
            ]
        }"#;

        let identity: EnclaveIdentity = serde_json::from_str(json).unwrap();
        assert_eq!(identity.urls().len(), 2);
        assert_eq!(identity.urls()[1].host_header.as_deref(), Some("svr2.example.org"));
        assert_eq!(
            identity.endpoint(&identity.urls()[0]),
            "wss://svr2.example.org/v1/a8a261420a6bb9b61aa25bf8a79e8bd20d7652531feb3381cbffd446d270be95"
        );

        let back = serde_json::to_string(&identity).unwrap();
        let again: EnclaveIdentity = serde_json::from_str(&back).unwrap();
        assert_eq!(identity, again);
    }

    #[test]
    fn test_identity_rejects_bad_input() {
        assert!(EnclaveIdentity::from_hex("abcd", vec![ServiceUrl::new("wss://x")]).is_err());
        assert!(EnclaveIdentity::new([0u8; 32], vec![]).is_err());
        assert!(serde_json::from_str::<EnclaveIdentity>(r#"{"mr_enclave":"zz","urls":[]}"#).is_err());
    }
}
