//! Vault `sys/*` payloads.

use std::fmt;

use serde::{Deserialize, Serialize};

/// `PUT /v1/sys/init` body. Autounseal clusters take recovery shares instead
/// of secret shares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InitRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_shares: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_threshold: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_shares: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_threshold: Option<u8>,
}

impl InitRequest {
    #[must_use]
    pub fn shamir(shares: u8, threshold: u8) -> Self {
        Self {
            secret_shares: Some(shares),
            secret_threshold: Some(threshold),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn recovery(shares: u8, threshold: u8) -> Self {
        Self {
            recovery_shares: Some(shares),
            recovery_threshold: Some(threshold),
            ..Self::default()
        }
    }
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct VaultInitResponse {
    pub keys: Vec<String>,
    pub keys_base64: Vec<String>,
    pub recovery_keys: Vec<String>,
    pub root_token: String,
}

impl fmt::Debug for VaultInitResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultInitResponse")
            .field("keys", &self.keys.len())
            .field("recovery_keys", &self.recovery_keys.len())
            .field("root_token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
pub struct UnsealRequest<'a> {
    pub key: &'a str,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UnsealResponse {
    pub sealed: bool,
    #[serde(rename = "t")]
    pub threshold: u32,
    pub progress: u32,
}
