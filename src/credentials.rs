//! Device identity and transport-credential validation
//!
//! The validator is advisory defense-in-depth: it does not parse X.509, it
//! only rejects obviously truncated or misconfigured PEM input before a
//! network attempt is wasted on it. The real verification happens inside the
//! TLS stack during the handshake.

use crate::error::AgentError;

/// Stable identity issued at provisioning time, owned for the process
/// lifetime.
#[derive(Clone, Debug)]
pub struct Identity {
    pub device_id: String,
    pub device_key: String,
}

impl Identity {
    pub fn new(device_id: impl Into<String>, device_key: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_key: device_key.into(),
        }
    }
}

/// Server verification mode selected from the supplied material.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyMode {
    /// Validate the server chain against a supplied trust anchor
    TrustAnchor,
    /// Pin the server by certificate fingerprint
    Fingerprint,
}

/// PEM credential material supplied at construction and validated once
/// during connection setup. Never mutated afterwards.
///
/// At least one of {trust anchor, fingerprint} must be present. If mutual
/// authentication is used, client certificate and private key must both be
/// present and well-formed.
#[derive(Clone, Debug, Default)]
pub struct CredentialSet {
    pub trust_anchor: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
    pub server_fingerprint: Option<String>,
}

const PEM_MIN_LEN: usize = 64;

/// Structural check: long enough to be a real PEM block and carrying both
/// armor markers.
fn pem_well_formed(material: &str) -> bool {
    material.len() >= PEM_MIN_LEN
        && material.contains("-----BEGIN")
        && material.contains("-----END")
}

impl CredentialSet {
    pub fn with_trust_anchor(anchor: impl Into<String>) -> Self {
        Self {
            trust_anchor: Some(anchor.into()),
            ..Self::default()
        }
    }

    pub fn with_fingerprint(fingerprint: impl Into<String>) -> Self {
        Self {
            server_fingerprint: Some(fingerprint.into()),
            ..Self::default()
        }
    }

    pub fn client_auth(
        mut self,
        cert: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        self.client_cert = Some(cert.into());
        self.client_key = Some(key.into());
        self
    }

    /// True when any client-side material was supplied at all.
    pub fn uses_mutual_auth(&self) -> bool {
        self.client_cert.is_some() || self.client_key.is_some()
    }

    /// Validates the set and picks the server verification mode.
    ///
    /// Pure: the caller owns logging of a rejected reason.
    pub fn validate(&self) -> Result<VerifyMode, AgentError> {
        let mode = match &self.trust_anchor {
            Some(anchor) if pem_well_formed(anchor) => VerifyMode::TrustAnchor,
            Some(_) => {
                return Err(AgentError::CredentialInvalid(
                    "trust anchor is malformed".into(),
                ))
            }
            None => match &self.server_fingerprint {
                Some(fp) if !fp.is_empty() => VerifyMode::Fingerprint,
                _ => {
                    return Err(AgentError::CredentialInvalid(
                        "neither trust anchor nor server fingerprint supplied".into(),
                    ))
                }
            },
        };

        if self.uses_mutual_auth() {
            match (&self.client_cert, &self.client_key) {
                (Some(cert), Some(key)) if pem_well_formed(cert) && pem_well_formed(key) => {}
                _ => {
                    return Err(AgentError::CredentialInvalid(
                        "mutual auth requires well-formed client certificate and key".into(),
                    ))
                }
            }
        }

        Ok(mode)
    }
}
