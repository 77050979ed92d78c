//! credentials used to open the transport before attestation

use std::fmt;

use async_trait::async_trait;
use base64::Engine;
use zeroize::Zeroizing;

use crate::Result;

/// short-lived basic-auth style credential issued by the chat service
#[derive(Clone)]
pub struct AuthCredentials {
    username: String,
    password: Zeroizing<String>,
}

impl AuthCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    /// also the backup id inside the enclave
    pub fn username(&self) -> &str {
        &self.username
    }

    /// value for the `Authorization` header
    pub fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password.as_str());
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }

    /// parse an `Authorization: Basic ...` header value
    pub fn from_basic_auth(header: &str) -> Option<Self> {
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(Self::new(username, password))
    }
}

impl fmt::Debug for AuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// source of current credentials for an already registered account
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn credentials(&self) -> Result<AuthCredentials>;
}

/// provider that always hands out the same credentials
#[derive(Clone, Debug)]
pub struct StaticCredentials(pub AuthCredentials);

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials(&self) -> Result<AuthCredentials> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_auth_roundtrip() {
        let creds = AuthCredentials::new("alice", "s3cr:et");
        let header = creds.basic_auth();
        assert!(header.starts_with("Basic "));

        let parsed = AuthCredentials::from_basic_auth(&header).unwrap();
        assert_eq!(parsed.username(), "alice");
        assert_eq!(parsed.basic_auth(), header);

        assert!(AuthCredentials::from_basic_auth("Bearer abc").is_none());
    }

    #[test]
    fn test_debug_hides_password() {
        let creds = AuthCredentials::new("alice", "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
